use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const TOPIC_COMMAND: &str = "home/switch/command";
pub const TOPIC_STATE: &str = "home/switch/state";
pub const TOPIC_STATUS: &str = "home/switch/status";
pub const TOPIC_AVAILABILITY: &str = "home/switch/availability";

/// Payload published to [`TOPIC_COMMAND`] right after every successful connect.
pub const STATUS_PROBE: &str = "status";

/// The fixed set of topics the bridge subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundTopic {
    State,
    Status,
    Availability,
}

impl InboundTopic {
    pub const ALL: [InboundTopic; 3] = [
        InboundTopic::State,
        InboundTopic::Status,
        InboundTopic::Availability,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            InboundTopic::State => TOPIC_STATE,
            InboundTopic::Status => TOPIC_STATUS,
            InboundTopic::Availability => TOPIC_AVAILABILITY,
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.topic() == topic)
    }
}

/// Broker connection settings, the `[mqtt]` section of the bridge config.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Capacity of the client's outgoing request queue
    pub request_capacity: usize,
    /// Pause between reconnect attempts after a transport error
    pub reconnect_backoff_ms: u64,
    pub tls: TlsConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            client_id: "switch-bridge".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            request_capacity: 64,
            reconnect_backoff_ms: 1000,
            tls: TlsConfig::default(),
        }
    }
}

impl MqttConfig {
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS settings for the broker session.
///
/// Server certificates are verified against the native root store unless a
/// `ca_path` is given. `insecure_skip_verify` turns verification off entirely
/// and leaves the session open to man-in-the-middle attacks; it exists only
/// for brokers with self-signed certificates during development.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_path: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_path: None,
            insecure_skip_verify: false,
        }
    }
}
