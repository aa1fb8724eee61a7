//! Named-topic publish/subscribe, generalized to a typed event enum per
//! the "global dispatcher -> typed event channels" redesign note:
//! heterogeneous string-keyed callbacks become one `Event` type with a
//! fixed set of variants known at compile time.

use crate::ids::{BusId, ClientId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DeviceAdded(BusId),
    DeviceRemoved(BusId),
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    ForceFree { bus_id: BusId, previous_owner: ClientId },
    Updated(BusId),
}

/// Fan-out publisher. Subscribers registered via `subscribe` are
/// invoked in registration order; `publish` awaits completion of every
/// subscriber before returning, so a single event is fully dispatched
/// before the next begins (the Engine only ever calls `publish` from
/// its own single-threaded reactor loop, so this is never contended).
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Box<dyn Fn(&Event) + Send + Sync>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn publish(&self, event: Event) {
        for subscriber in &self.subscribers {
            subscriber(&event);
        }
    }
}
