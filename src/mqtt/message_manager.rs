use chrono::{DateTime, Local};
use std::fmt;

const PREVIEW_CHARS: usize = 32;

/// A message received from the broker, stamped with its local receipt time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(PREVIEW_CHARS).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received(topic, payload, Local::now())
    }

    pub fn received(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: DateTime<Local>,
    ) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// Connection lifecycle changes reported by the session manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    /// The broker answered the connect with a non-success return code.
    ConnectionRefused(String),
    /// The session could not be established at all (DNS, TCP, TLS, ...).
    ConnectFailed(String),
    /// An established session was lost.
    Disconnected(String),
}

/// Everything the MQTT background context hands over to the bridge core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Session(SessionEvent),
    Message(MQTTMessage),
}
