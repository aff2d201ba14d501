//! Protocol state machine of the bridge.
//!
//! [`MessageRouter`] owns the device state, the activity log and the
//! subscriber hub. It is driven by exactly one task, so every mutation, its
//! log entry and its broadcast happen as one step from the point of view of
//! queries and newly registered subscribers.

use serde_json::{Map, Value};
use tracing::{error, info, trace, warn};

use super::activity_log::{ActivityLog, ActivityLogEntry, LogType};
use super::device_state::{ConnectionStatus, DeviceState, AVAILABILITY_ONLINE};
use super::events::BridgeEvent;
use super::hub::{SubscriberHandle, SubscriberHub, Subscription};
use crate::mqtt::config::InboundTopic;
use crate::mqtt::message_manager::{MQTTMessage, SessionEvent, TransportEvent};

pub struct MessageRouter {
    state: DeviceState,
    log: ActivityLog,
    hub: SubscriberHub,
}

impl MessageRouter {
    pub fn new(log_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            state: DeviceState::default(),
            log: ActivityLog::with_capacity(log_capacity),
            hub: SubscriberHub::new(subscriber_buffer),
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Session(event) => self.handle_session_event(event),
            TransportEvent::Message(message) => self.route(message),
        }
    }

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        let (status, message, kind) = match event {
            SessionEvent::Connected => (
                ConnectionStatus::Connected,
                "Connected to MQTT broker".to_string(),
                LogType::Success,
            ),
            SessionEvent::ConnectionRefused(code) => (
                ConnectionStatus::Disconnected,
                format!("Failed to connect to MQTT broker (RC: {})", code),
                LogType::Error,
            ),
            SessionEvent::ConnectFailed(reason) => (
                ConnectionStatus::Disconnected,
                format!("MQTT connection failed: {}", reason),
                LogType::Error,
            ),
            SessionEvent::Disconnected(_) => (
                ConnectionStatus::Disconnected,
                "Disconnected from MQTT broker".to_string(),
                LogType::Warning,
            ),
        };

        self.state.set_connection_status(status);
        self.append_log(message, kind);
        self.hub.broadcast(&BridgeEvent::MqttStatus { status });
    }

    /// Applies one inbound message. Messages on topics outside the
    /// subscription set are ignored.
    pub fn route(&mut self, message: MQTTMessage) {
        let Some(topic) = InboundTopic::from_topic(&message.topic) else {
            trace!("Ignoring message on unexpected topic {}", message.topic);
            return;
        };

        let payload = match String::from_utf8(message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Error processing message on {}: {}", message.topic, e);
                self.append_log(format!("Error processing message: {}", e), LogType::Error);
                return;
            }
        };
        info!("Received message - Topic: {}, Payload: {}", message.topic, payload);

        match topic {
            InboundTopic::State => {
                self.state
                    .record_switch_state(payload.clone(), message.received_at);
                self.append_log(format!("Switch state updated: {}", payload), LogType::Info);
                let timestamp = self.state.last_update_label();
                self.hub.broadcast(&BridgeEvent::StateUpdate {
                    state: payload,
                    timestamp,
                });
            }
            InboundTopic::Status => match decode_status(&payload) {
                Some(info) => {
                    self.state
                        .record_device_info(info.clone(), message.received_at);
                    self.append_log("Device status updated", LogType::Info);
                    self.hub.broadcast(&BridgeEvent::StatusUpdate(info));
                }
                None => {
                    error!("Invalid JSON in status message: {}", payload);
                    // recorded without a log_update broadcast
                    self.log.push(ActivityLogEntry::new(
                        "Invalid JSON in status message",
                        LogType::Error,
                    ));
                }
            },
            InboundTopic::Availability => {
                let kind = if payload == AVAILABILITY_ONLINE {
                    LogType::Success
                } else {
                    LogType::Warning
                };
                self.state.record_availability(payload.clone());
                self.append_log(format!("Device availability: {}", payload), kind);
                self.hub.broadcast(&BridgeEvent::AvailabilityUpdate {
                    availability: payload,
                });
            }
        }
    }

    /// Appends an entry and broadcasts it as `log_update`.
    pub fn append_log(&mut self, message: impl Into<String>, kind: LogType) {
        let entry = ActivityLogEntry::new(message, kind);
        self.log.push(entry.clone());
        self.hub.broadcast(&BridgeEvent::LogUpdate(entry));
    }

    /// Registers a listener and queues the current connection status and
    /// switch state to it.
    pub fn register(&mut self) -> (SubscriberHandle, Subscription) {
        let snapshot = vec![
            BridgeEvent::MqttStatus {
                status: self.state.connection_status,
            },
            BridgeEvent::StateUpdate {
                state: self.state.switch_state.clone(),
                timestamp: self.state.last_update_label(),
            },
        ];
        self.hub.register(snapshot)
    }

    pub fn unregister(&mut self, handle: SubscriberHandle) {
        self.hub.unregister(handle);
    }

    pub fn deliver(&mut self, handle: SubscriberHandle, event: BridgeEvent) {
        if !self.hub.send_to(handle, event) {
            warn!("Could not deliver event to {}", handle);
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<ActivityLogEntry> {
        self.log.recent(limit)
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.len()
    }
}

fn decode_status(payload: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(info)) => Some(info),
        Ok(other) => {
            warn!("Status payload is not an object: {}", other);
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{TOPIC_AVAILABILITY, TOPIC_COMMAND, TOPIC_STATE, TOPIC_STATUS};
    use chrono::{Duration, Local};
    use serde_json::json;

    fn router() -> MessageRouter {
        MessageRouter::new(100, 64)
    }

    fn drain(rx: &mut Subscription) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn state_messages_track_latest_payload() {
        let mut router = router();
        let start = Local::now();
        let mut previous = None;

        for (k, payload) in ["ON", "OFF", "ON", "weird"].iter().enumerate() {
            let at = start + Duration::seconds(k as i64);
            router.route(MQTTMessage::received(TOPIC_STATE, *payload, at));

            assert_eq!(router.state().switch_state, *payload);
            let last = router.state().last_update.unwrap();
            if let Some(prev) = previous {
                assert!(last >= prev);
            }
            previous = Some(last);
        }
        assert_eq!(router.log_len(), 4);
    }

    #[test]
    fn state_message_broadcasts_update_and_log() {
        let mut router = router();
        let (_, mut rx) = router.register();
        drain(&mut rx);

        router.route(MQTTMessage::from_topic(TOPIC_STATE, "ON"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], BridgeEvent::LogUpdate(e)
            if e.message == "Switch state updated: ON" && e.kind == LogType::Info));
        match &events[1] {
            BridgeEvent::StateUpdate { state, timestamp } => {
                assert_eq!(state, "ON");
                assert_ne!(timestamp, "Never");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn status_message_replaces_device_info() {
        let mut router = router();
        let (_, mut rx) = router.register();
        drain(&mut rx);
        let payload = json!({"rssi": -48, "version": "2.1"});

        router.route(MQTTMessage::from_topic(TOPIC_STATUS, payload.to_string()));

        assert_eq!(Value::Object(router.state().device_info.clone()), payload);
        assert!(router.state().last_update.is_some());
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&BridgeEvent::StatusUpdate(payload.as_object().unwrap().clone()))
        );
    }

    #[test]
    fn malformed_status_is_logged_but_not_applied() {
        let mut router = router();
        router.route(MQTTMessage::from_topic(TOPIC_STATUS, r#"{"uptime": 5}"#));
        let info_before = router.state().device_info.clone();
        let update_before = router.state().last_update;
        let logs_before = router.log_len();
        let (_, mut rx) = router.register();
        drain(&mut rx);

        router.route(MQTTMessage::from_topic(TOPIC_STATUS, "{not json"));
        router.route(MQTTMessage::from_topic(TOPIC_STATUS, "[1, 2, 3]"));

        assert_eq!(router.state().device_info, info_before);
        assert_eq!(router.state().last_update, update_before);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(router.log_len(), logs_before + 2);
        let latest = &router.recent_logs(1)[0];
        assert_eq!(latest.kind, LogType::Error);
    }

    #[test]
    fn availability_log_type_follows_payload() {
        let mut router = router();
        let (_, mut rx) = router.register();
        drain(&mut rx);

        router.route(MQTTMessage::from_topic(TOPIC_AVAILABILITY, "online"));
        assert_eq!(router.recent_logs(1)[0].kind, LogType::Success);
        assert_eq!(router.state().availability, "online");
        assert_eq!(
            drain(&mut rx).last(),
            Some(&BridgeEvent::AvailabilityUpdate {
                availability: "online".to_string()
            })
        );

        router.route(MQTTMessage::from_topic(TOPIC_AVAILABILITY, "offline"));
        assert_eq!(router.recent_logs(1)[0].kind, LogType::Warning);
        assert_eq!(
            drain(&mut rx).last(),
            Some(&BridgeEvent::AvailabilityUpdate {
                availability: "offline".to_string()
            })
        );
    }

    #[test]
    fn availability_does_not_touch_last_update() {
        let mut router = router();
        router.route(MQTTMessage::from_topic(TOPIC_AVAILABILITY, "online"));
        assert!(router.state().last_update.is_none());
    }

    #[test]
    fn unknown_topics_are_ignored() {
        let mut router = router();
        let (_, mut rx) = router.register();
        drain(&mut rx);

        router.route(MQTTMessage::from_topic(TOPIC_COMMAND, "on"));
        router.route(MQTTMessage::from_topic("other/device/state", "ON"));

        assert_eq!(router.log_len(), 0);
        assert_eq!(router.state(), &DeviceState::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn invalid_utf8_is_logged_as_error() {
        let mut router = router();
        router.route(MQTTMessage::from_topic(TOPIC_STATE, vec![0xc3, 0x28]));

        assert_eq!(router.state().switch_state, "UNKNOWN");
        let entry = &router.recent_logs(1)[0];
        assert_eq!(entry.kind, LogType::Error);
        assert!(entry.message.starts_with("Error processing message"));
    }

    #[test]
    fn registration_snapshot_on_fresh_router() {
        let mut router = router();
        let (_, mut rx) = router.register();

        assert_eq!(
            drain(&mut rx),
            vec![
                BridgeEvent::MqttStatus {
                    status: ConnectionStatus::Disconnected
                },
                BridgeEvent::StateUpdate {
                    state: "UNKNOWN".to_string(),
                    timestamp: "Never".to_string()
                },
            ]
        );
    }

    #[test]
    fn session_events_update_connection_status() {
        let mut router = router();
        let (_, mut rx) = router.register();
        drain(&mut rx);

        router.handle_session_event(SessionEvent::Connected);
        assert_eq!(router.state().connection_status, ConnectionStatus::Connected);
        assert_eq!(router.recent_logs(1)[0].kind, LogType::Success);
        assert_eq!(
            drain(&mut rx).last(),
            Some(&BridgeEvent::MqttStatus {
                status: ConnectionStatus::Connected
            })
        );

        router.handle_session_event(SessionEvent::ConnectionRefused("NotAuthorized".into()));
        assert_eq!(
            router.state().connection_status,
            ConnectionStatus::Disconnected
        );
        let entry = &router.recent_logs(1)[0];
        assert_eq!(entry.kind, LogType::Error);
        assert_eq!(
            entry.message,
            "Failed to connect to MQTT broker (RC: NotAuthorized)"
        );

        router.handle_session_event(SessionEvent::Disconnected("eof".into()));
        assert_eq!(router.recent_logs(1)[0].kind, LogType::Warning);
    }
}
