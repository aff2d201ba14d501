//! # MQTT Session Module
//!
//! Owns the single broker session of the bridge: connecting over TLS with
//! username/password authentication, subscribing to the switch topics,
//! publishing commands and reporting every connection change.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings, TLS settings and the fixed topic set
//! ├── message_manager.rs  - Inbound message representation and transport events
//! ├── mqtt_handler.rs     - Session state, transport trait and the event loop pump
//! └── tls.rs              - Transport selection (verified TLS, custom CA, plain TCP)
//! ```
//!
//! ## Event Flow
//!
//! The rumqttc event loop runs in its own task. Nothing in this module touches
//! device state: connection changes and inbound publishes are turned into
//! [`message_manager::TransportEvent`]s and pushed onto a channel that the
//! bridge core consumes in order.
//!
//! ```text
//! EventLoop::poll ──► SessionManager ──► mpsc<TransportEvent> ──► bridge core
//!                         │
//!                         └──► watch<ConnectionState> ──► command dispatcher
//! ```
//!
//! ## Reconnects
//!
//! rumqttc re-establishes the session on the next poll after an error. The
//! pump only spaces attempts out and makes sure a lost session is reported
//! once, not once per failed retry, refusals included.
//!
//! Requests are queued with rumqttc's non-blocking `try_*` calls. The pump is
//! the only task draining the request queue, so a full queue is an error
//! rather than a wait.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod tls;
