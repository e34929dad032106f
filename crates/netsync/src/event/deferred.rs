use std::any::type_name;

use super::envelope::Route;
use super::types::Event;

pub(crate) struct Deferred {
    pub event: Box<dyn Event>,
    pub route: Route,
    pub published_as: &'static str,
}

/// Thread-safe handle for queueing events onto a bus. Queued events are
/// dispatched, in FIFO order, the next time the owning thread calls
/// [`EventBus::drain_deferred`](super::EventBus::drain_deferred).
///
/// Never dispatches inline, even on the owning thread; use
/// [`EventBus::publish_deferred`](super::EventBus::publish_deferred) there
/// for an immediate publish.
#[derive(Clone)]
pub struct DeferredPublisher {
    tx: flume::Sender<Deferred>,
}

impl std::fmt::Debug for DeferredPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredPublisher")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl DeferredPublisher {
    pub(crate) fn new(tx: flume::Sender<Deferred>) -> Self {
        Self { tx }
    }

    pub fn publish<E: Event>(&self, event: E) {
        self.publish_with(event, Route::default());
    }

    pub fn publish_with<E: Event>(&self, event: E, route: Route) {
        self.enqueue(Box::new(event), route, type_name::<E>());
    }

    pub fn publish_boxed<E: Event>(&self, event: Box<E>, route: Route) {
        self.enqueue(event, route, type_name::<E>());
    }

    fn enqueue(&self, event: Box<dyn Event>, route: Route, published_as: &'static str) {
        let deferred = Deferred {
            event,
            route,
            published_as,
        };
        if let Err(e) = self.tx.send(deferred) {
            log::error!(
                "Failed to queue {}: event bus is gone",
                e.into_inner().event.event_type()
            );
        }
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}
