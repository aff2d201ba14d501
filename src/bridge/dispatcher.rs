use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::activity_log::LogType;
use super::events::CommandResult;
use super::BridgeAction;
use crate::mqtt::config::TOPIC_COMMAND;
use crate::mqtt::mqtt_handler::{SessionManager, TransportError};

/// Commands accepted by the closed vocabulary.
pub const VALID_ACTIONS: [&str; 4] = ["on", "off", "toggle", "status"];
pub const NOT_CONNECTED: &str = "not connected";
pub const INVALID_ACTION: &str = "Invalid action";

/// Which command strings an entry point forwards to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandPolicy {
    /// Only [`VALID_ACTIONS`].
    Closed,
    /// Any non-empty string, passed through unvalidated.
    AnyNonEmpty,
}

impl CommandPolicy {
    pub fn allows(self, command: &str) -> bool {
        match self {
            CommandPolicy::Closed => VALID_ACTIONS.contains(&command),
            CommandPolicy::AnyNonEmpty => !command.is_empty(),
        }
    }
}

/// Request/result boundary for user-issued commands. Every outcome, including
/// transport errors, comes back as a [`CommandResult`].
#[derive(Clone)]
pub struct CommandDispatcher {
    session: Arc<SessionManager>,
    actions: mpsc::Sender<BridgeAction>,
    publish_timeout: Duration,
}

impl CommandDispatcher {
    pub(crate) fn new(
        session: Arc<SessionManager>,
        actions: mpsc::Sender<BridgeAction>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            session,
            actions,
            publish_timeout,
        }
    }

    pub async fn send(&self, command: &str, policy: CommandPolicy) -> CommandResult {
        if !policy.allows(command) {
            debug!("Rejected command {:?} under {:?} policy", command, policy);
            return CommandResult::failure(INVALID_ACTION);
        }

        if !self.session.is_connected() {
            return CommandResult::failure(NOT_CONNECTED);
        }

        let publish = self
            .session
            .publish(TOPIC_COMMAND, command.as_bytes(), QoS::AtMostOnce);
        let outcome = match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.publish_timeout)),
        };

        match outcome {
            Ok(()) => {
                info!("Command sent: {}", command);
                self.log(format!("Command sent: {}", command), LogType::Success)
                    .await;
                CommandResult::sent()
            }
            Err(e) => {
                error!("Failed to send command {}: {}", command, e);
                self.log(
                    format!("Failed to send command: {} ({})", command, e),
                    LogType::Error,
                )
                .await;
                CommandResult::failure(e.to_string())
            }
        }
    }

    async fn log(&self, message: String, kind: LogType) {
        if self
            .actions
            .send(BridgeAction::Log { message, kind })
            .await
            .is_err()
        {
            warn!("Bridge core is gone, activity entry lost");
        }
    }
}
