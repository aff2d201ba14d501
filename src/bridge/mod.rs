//! # Bridge Core
//!
//! Keeps the authoritative device state, the activity history and the set of
//! live subscribers, and exposes them through the cheaply clonable [`Bridge`]
//! handle.
//!
//! ## Ownership
//!
//! A single core task owns the [`router::MessageRouter`]. Everything that
//! reads or changes state reaches it as a message:
//!
//! ```text
//! MQTT event loop ──[TransportEvent]──┐
//!                                     ├──► core task ──► MessageRouter
//! Bridge handles  ──[BridgeAction]────┘        (state, log, hub)
//! ```
//!
//! Transport events are drained before pending actions, so a query issued
//! after an inbound message has been handed over always observes it. Queries
//! are answered through oneshot channels and never hold on to the state.
//!
//! ## Commands
//!
//! [`dispatcher::CommandDispatcher`] publishes directly through the session
//! manager and only reports its activity entries to the core, so a slow
//! publish never stalls message routing.

pub mod activity_log;
pub mod device_state;
pub mod dispatcher;
pub mod events;
pub mod hub;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::mqtt::message_manager::TransportEvent;
use crate::mqtt::mqtt_handler::{
    self, ConnectionState, MqttTransport, SessionManager, TransportError,
};
use activity_log::{ActivityLogEntry, LogType};
use device_state::DeviceState;
use dispatcher::{CommandDispatcher, CommandPolicy};
use events::{BridgeEvent, CommandResult};
use hub::{SubscriberHandle, Subscription};
use router::MessageRouter;

const ACTION_CHANNEL_CAPACITY: usize = 256;
const TRANSPORT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_STATUS_LOG_LIMIT: usize = 10;

macro_rules! respond {
    ($value:expr, $response_tx:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Requester went away before the response was ready");
        }
    };
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge core has stopped")]
    CoreStopped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Requests handled by the core task.
#[derive(Debug)]
pub(crate) enum BridgeAction {
    Register {
        response_tx: oneshot::Sender<(SubscriberHandle, Subscription)>,
    },
    Unregister {
        handle: SubscriberHandle,
    },
    Log {
        message: String,
        kind: LogType,
    },
    Deliver {
        handle: SubscriberHandle,
        event: BridgeEvent,
    },
    DeviceState {
        response_tx: oneshot::Sender<DeviceState>,
    },
    RecentLogs {
        limit: usize,
        response_tx: oneshot::Sender<Vec<ActivityLogEntry>>,
    },
}

/// The `{device_state, activity_log}` view served to status queries.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub device_state: DeviceState,
    pub activity_log: Vec<ActivityLogEntry>,
}

/// Handle to a running bridge.
#[derive(Clone)]
pub struct Bridge {
    actions: mpsc::Sender<BridgeAction>,
    session: Arc<SessionManager>,
    dispatcher: CommandDispatcher,
    shutdown: CancellationToken,
    log_capacity: usize,
}

impl Bridge {
    /// Starts the core task around an existing transport client. No
    /// connection is attempted; the caller drives the session manager.
    pub fn spawn(config: &BridgeConfig, transport: Arc<dyn MqttTransport>) -> Self {
        let settings = &config.bridge;
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_CHANNEL_CAPACITY);

        let session = Arc::new(SessionManager::new(transport, transport_tx));
        let dispatcher = CommandDispatcher::new(
            session.clone(),
            actions_tx.clone(),
            Duration::from_millis(settings.command_timeout_ms),
        );
        let router = MessageRouter::new(settings.log_capacity, settings.subscriber_buffer);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_core(
            router,
            transport_rx,
            actions_rx,
            shutdown.clone(),
        ));

        Self {
            actions: actions_tx,
            session,
            dispatcher,
            shutdown,
            log_capacity: settings.log_capacity,
        }
    }

    /// Builds the MQTT client from `config`, starts the bridge and waits a
    /// bounded time for the broker to accept the session. A session that is
    /// not up yet is not an error; the event loop keeps reconnecting.
    pub async fn connect(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let (client, eventloop) = mqtt_handler::connect_client(&config.mqtt)?;
        let bridge = Self::spawn(config, Arc::new(client));

        bridge.session.mark_connecting();
        mqtt_handler::spawn_event_loop(
            eventloop,
            bridge.session.clone(),
            Duration::from_millis(config.mqtt.reconnect_backoff_ms),
            bridge.shutdown.child_token(),
        );

        let settings = &config.bridge;
        if bridge
            .session
            .wait_until_connected(
                settings.connect_attempts,
                Duration::from_millis(settings.connect_interval_ms),
            )
            .await
        {
            info!("MQTT ready");
        } else {
            warn!("MQTT not connected after timeout, continuing in the background");
        }
        Ok(bridge)
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn session_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Registers a listener. The returned subscription already holds the
    /// current connection status and switch state.
    pub async fn register_subscriber(
        &self,
    ) -> Result<(SubscriberHandle, Subscription), BridgeError> {
        self.request(|response_tx| BridgeAction::Register { response_tx })
            .await
    }

    pub async fn unregister_subscriber(&self, handle: SubscriberHandle) {
        if self
            .actions
            .send(BridgeAction::Unregister { handle })
            .await
            .is_err()
        {
            debug!("Bridge core already stopped, {} dropped with it", handle);
        }
    }

    pub async fn device_state(&self) -> Result<DeviceState, BridgeError> {
        self.request(|response_tx| BridgeAction::DeviceState { response_tx })
            .await
    }

    /// Most recent activity entries, newest first.
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<ActivityLogEntry>, BridgeError> {
        self.request(|response_tx| BridgeAction::RecentLogs { limit, response_tx })
            .await
    }

    pub async fn all_logs(&self) -> Result<Vec<ActivityLogEntry>, BridgeError> {
        self.recent_logs(self.log_capacity).await
    }

    pub async fn status_report(&self, log_limit: usize) -> Result<StatusReport, BridgeError> {
        Ok(StatusReport {
            device_state: self.device_state().await?,
            activity_log: self.recent_logs(log_limit).await?,
        })
    }

    /// Entry point for request/response clients; only the closed command
    /// vocabulary is accepted.
    pub async fn issue_command(&self, command: &str) -> CommandResult {
        self.dispatcher.send(command, CommandPolicy::Closed).await
    }

    /// Entry point for real-time clients; any non-empty command is forwarded
    /// and the result is also pushed to `handle` as `command_result`.
    pub async fn issue_realtime_command(
        &self,
        handle: SubscriberHandle,
        command: &str,
    ) -> CommandResult {
        let result = self.dispatcher.send(command, CommandPolicy::AnyNonEmpty).await;
        let event = BridgeEvent::CommandResult(result.clone());
        if self
            .actions
            .send(BridgeAction::Deliver { handle, event })
            .await
            .is_err()
        {
            debug!("Bridge core already stopped, command result not delivered");
        }
        result
    }

    /// Stops the core task and the MQTT event loop.
    pub fn shutdown(&self) {
        info!("Shutting down bridge");
        self.shutdown.cancel();
    }

    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> BridgeAction,
    ) -> Result<T, BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.actions
            .send(action(response_tx))
            .await
            .map_err(|_| BridgeError::CoreStopped)?;
        response_rx.await.map_err(|_| BridgeError::CoreStopped)
    }
}

async fn run_core(
    mut router: MessageRouter,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut actions_rx: mpsc::Receiver<BridgeAction>,
    shutdown: CancellationToken,
) {
    debug!("Bridge core started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(event) = transport_rx.recv() => router.handle_transport_event(event),
            Some(action) = actions_rx.recv() => handle_action(&mut router, action),
            else => break,
        }
    }
    info!(
        "Bridge core stopped ({} subscribers, {} log entries)",
        router.subscriber_count(),
        router.log_len()
    );
}

fn handle_action(router: &mut MessageRouter, action: BridgeAction) {
    match action {
        BridgeAction::Register { response_tx } => {
            respond!(router.register(), response_tx);
        }
        BridgeAction::Unregister { handle } => router.unregister(handle),
        BridgeAction::Log { message, kind } => router.append_log(message, kind),
        BridgeAction::Deliver { handle, event } => router.deliver(handle, event),
        BridgeAction::DeviceState { response_tx } => {
            respond!(router.state().clone(), response_tx);
        }
        BridgeAction::RecentLogs { limit, response_tx } => {
            respond!(router.recent_logs(limit), response_tx);
        }
    }
}
