use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::events::BridgeEvent;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Identity of one registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberHandle(u64);

impl fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Receiving end of a subscriber's delivery queue.
pub type Subscription = mpsc::Receiver<BridgeEvent>;

/// Registry of live listeners.
///
/// Every subscriber gets its own bounded queue. Delivery uses `try_send`, so a
/// stalled listener loses events instead of holding up the router; a listener
/// whose receiver is gone is dropped from the registry on the next delivery.
pub struct SubscriberHub {
    subscribers: HashMap<SubscriberHandle, mpsc::Sender<BridgeEvent>>,
    next_id: u64,
    buffer: usize,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl SubscriberHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 0,
            buffer: buffer.max(1),
        }
    }

    /// Adds a listener and queues `initial` to it before anything else.
    pub fn register(
        &mut self,
        initial: Vec<BridgeEvent>,
    ) -> (SubscriberHandle, Subscription) {
        let handle = SubscriberHandle(self.next_id);
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.buffer.max(initial.len()).max(1));
        for event in initial {
            // capacity covers the snapshot, this cannot fail
            let _ = tx.try_send(event);
        }
        self.subscribers.insert(handle, tx);
        debug!("Registered {} ({} active)", handle, self.subscribers.len());
        (handle, rx)
    }

    /// Removes a listener. Unknown handles are ignored.
    pub fn unregister(&mut self, handle: SubscriberHandle) -> bool {
        let removed = self.subscribers.remove(&handle).is_some();
        if removed {
            debug!("Unregistered {} ({} active)", handle, self.subscribers.len());
        }
        removed
    }

    /// Delivers `event` to every listener, returns how many accepted it.
    pub fn broadcast(&mut self, event: &BridgeEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (handle, tx) in &self.subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("{} is not keeping up, dropped {}", handle, event.name());
                }
                Err(TrySendError::Closed(_)) => closed.push(*handle),
            }
        }

        for handle in closed {
            self.unregister(handle);
        }
        delivered
    }

    /// Delivers `event` to a single listener.
    pub fn send_to(&mut self, handle: SubscriberHandle, event: BridgeEvent) -> bool {
        let Some(tx) = self.subscribers.get(&handle) else {
            debug!("{} is not registered, dropping {}", handle, event.name());
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("{} is not keeping up, dropped {}", handle, event.name());
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(handle);
                false
            }
        }
    }

    pub fn is_registered(&self, handle: SubscriberHandle) -> bool {
        self.subscribers.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::device_state::ConnectionStatus;

    fn availability(value: &str) -> BridgeEvent {
        BridgeEvent::AvailabilityUpdate {
            availability: value.to_string(),
        }
    }

    #[test]
    fn snapshot_is_delivered_only_to_new_subscriber() {
        let mut hub = SubscriberHub::new(4);
        let (_, mut first) = hub.register(Vec::new());
        let snapshot = BridgeEvent::MqttStatus {
            status: ConnectionStatus::Connected,
        };
        let (_, mut second) = hub.register(vec![snapshot.clone()]);

        assert_eq!(second.try_recv().unwrap(), snapshot);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let mut hub = SubscriberHub::new(4);
        let (_, mut a) = hub.register(Vec::new());
        let (_, mut b) = hub.register(Vec::new());

        assert_eq!(hub.broadcast(&availability("online")), 2);

        assert_eq!(a.try_recv().unwrap(), availability("online"));
        assert_eq!(b.try_recv().unwrap(), availability("online"));
    }

    #[test]
    fn double_unregister_is_harmless() {
        let mut hub = SubscriberHub::new(4);
        let (gone, _gone_rx) = hub.register(Vec::new());
        let (_, mut kept) = hub.register(Vec::new());

        assert!(hub.unregister(gone));
        assert!(!hub.unregister(gone));
        assert!(!hub.unregister(SubscriberHandle(999)));

        assert_eq!(hub.broadcast(&availability("offline")), 1);
        assert_eq!(kept.try_recv().unwrap(), availability("offline"));
    }

    #[test]
    fn stalled_subscriber_does_not_block_others() {
        let mut hub = SubscriberHub::new(1);
        let (_, _stalled) = hub.register(Vec::new());
        let (_, mut live) = hub.register(Vec::new());

        hub.broadcast(&availability("online"));
        live.try_recv().unwrap();
        let delivered = hub.broadcast(&availability("offline"));

        assert_eq!(delivered, 1);
        assert_eq!(live.try_recv().unwrap(), availability("offline"));
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut hub = SubscriberHub::new(4);
        let (handle, rx) = hub.register(Vec::new());
        drop(rx);

        assert_eq!(hub.broadcast(&availability("online")), 0);
        assert!(!hub.is_registered(handle));
        assert!(hub.is_empty());
    }

    #[test]
    fn targeted_delivery() {
        let mut hub = SubscriberHub::new(4);
        let (a, mut a_rx) = hub.register(Vec::new());
        let (_, mut b_rx) = hub.register(Vec::new());

        assert!(hub.send_to(a, availability("online")));
        assert!(!hub.send_to(SubscriberHandle(42), availability("online")));

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }
}
