use serde::Serialize;
use serde_json::{Map, Value};

use super::activity_log::ActivityLogEntry;
use super::device_state::ConnectionStatus;

/// Outcome of a command request, returned to the caller and, on the real-time
/// path, pushed to the issuing subscriber.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn sent() -> Self {
        Self {
            success: true,
            message: "sent".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Events delivered to subscribers, serialized as
/// `{"event": "<name>", "data": {...}}`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    MqttStatus { status: ConnectionStatus },
    StateUpdate { state: String, timestamp: String },
    StatusUpdate(Map<String, Value>),
    AvailabilityUpdate { availability: String },
    LogUpdate(ActivityLogEntry),
    CommandResult(CommandResult),
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::MqttStatus { .. } => "mqtt_status",
            BridgeEvent::StateUpdate { .. } => "state_update",
            BridgeEvent::StatusUpdate(_) => "status_update",
            BridgeEvent::AvailabilityUpdate { .. } => "availability_update",
            BridgeEvent::LogUpdate(_) => "log_update",
            BridgeEvent::CommandResult(_) => "command_result",
        }
    }
}
