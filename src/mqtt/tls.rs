//! Transport selection for the broker session.

use std::sync::Arc;

use rumqttc::tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use rumqttc::{TlsConfiguration, Transport};
use tracing::{info, warn};

use super::config::TlsConfig;
use super::mqtt_handler::TransportError;

/// Picks the transport matching the `[mqtt.tls]` settings.
pub fn build_transport(tls: &TlsConfig) -> Result<Transport, TransportError> {
    if !tls.enabled {
        if tls.ca_path.is_some() || tls.insecure_skip_verify {
            return Err(TransportError::Tls(
                "TLS options are set but TLS is disabled".to_string(),
            ));
        }
        warn!("TLS is disabled, credentials will be sent in plain text");
        return Ok(Transport::tcp());
    }

    if tls.insecure_skip_verify {
        warn!("!!! TLS certificate and hostname verification is DISABLED !!!");
        warn!("The broker identity is not checked; anyone on the path can impersonate it");
        return Ok(insecure_transport());
    }

    match &tls.ca_path {
        Some(path) => {
            let ca = std::fs::read(path).map_err(|source| TransportError::CaFile {
                path: path.clone(),
                source,
            })?;
            info!("Verifying broker certificate against {}", path.display());
            Ok(Transport::tls(ca, None, None))
        }
        None => Ok(Transport::tls_with_default_config()),
    }
}

fn insecure_transport() -> Transport {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Accepts every server certificate. Only reachable through
/// `insecure_skip_verify`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
