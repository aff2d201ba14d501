use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use super::activity_log::format_timestamp;

pub const UNKNOWN_SWITCH_STATE: &str = "UNKNOWN";
pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";
pub const NEVER_UPDATED: &str = "Never";

/// Transport session state as seen by clients.
#[derive(Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Last known state of the switch.
///
/// `availability` holds whatever the device published on the availability
/// topic; `online` and `offline` are the expected values but nothing else is
/// rejected.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeviceState {
    pub switch_state: String,
    pub availability: String,
    #[serde(serialize_with = "serialize_last_update")]
    pub last_update: Option<DateTime<Local>>,
    pub device_info: Map<String, Value>,
    pub connection_status: ConnectionStatus,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            switch_state: UNKNOWN_SWITCH_STATE.to_string(),
            availability: AVAILABILITY_OFFLINE.to_string(),
            last_update: None,
            device_info: Map::new(),
            connection_status: ConnectionStatus::Disconnected,
        }
    }
}

impl DeviceState {
    pub fn record_switch_state(&mut self, state: impl Into<String>, at: DateTime<Local>) {
        self.switch_state = state.into();
        self.touch(at);
    }

    /// Replaces the device info wholesale.
    pub fn record_device_info(&mut self, info: Map<String, Value>, at: DateTime<Local>) {
        self.device_info = info;
        self.touch(at);
    }

    pub fn record_availability(&mut self, availability: impl Into<String>) {
        self.availability = availability.into();
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.connection_status = status;
    }

    pub fn is_online(&self) -> bool {
        self.availability == AVAILABILITY_ONLINE
    }

    /// `last_update` rendered for clients, `"Never"` before the first update.
    pub fn last_update_label(&self) -> String {
        self.last_update
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_else(|| NEVER_UPDATED.to_string())
    }

    // last_update never moves backwards, even if the wall clock does
    fn touch(&mut self, at: DateTime<Local>) {
        self.last_update = Some(match self.last_update {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }
}

fn serialize_last_update<S: Serializer>(
    last_update: &Option<DateTime<Local>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match last_update {
        Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
        None => serializer.serialize_none(),
    }
}
