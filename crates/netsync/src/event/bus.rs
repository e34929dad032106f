use std::any::type_name;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::net::AuthorityId;

use super::deferred::{Deferred, DeferredPublisher};
use super::envelope::{Envelope, Route};
use super::types::{Event, EventType, EventTypeId, TypedEvent};
use super::value::ValueKind;

/// Deepest allowed chain of publishes from inside handlers.
pub const MAX_DISPATCH_DEPTH: usize = 256;

pub const DEFAULT_PRIORITY: i32 = 0;

pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

type Handler = Box<dyn Fn(&Envelope<'_>) -> HandlerResult>;
type Filter = Box<dyn Fn(&Envelope<'_>) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("{0} belongs to the value-changed family; use subscribe_value_changed")]
    ValueChangedFamily(&'static str),
    #[error("unknown subscription {0:?}")]
    Unknown(SubscriptionId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch depth {depth} exceeded while publishing {event}")]
    DepthExceeded { depth: usize, event: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Type(EventTypeId),
    AnyValue,
    Value(ValueKind),
}

struct Subscription {
    id: SubscriptionId,
    target: Target,
    priority: Cell<i32>,
    active: Cell<bool>,
    handler: Handler,
    filter: Option<Filter>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("priority", &self.priority.get())
            .finish_non_exhaustive()
    }
}

type DispatchList = Rc<[Rc<Subscription>]>;

/// `by_kind` lists already hold the any-value subscribers in front.
#[derive(Debug, Default)]
struct ValueLists {
    any: DispatchList,
    by_kind: HashMap<ValueKind, DispatchList>,
}

/// Outcome of [`EventBus::drain_deferred`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub dispatched: usize,
    pub failures: usize,
}

/// Typed publish/subscribe engine. Owned by the simulation thread (it is
/// neither `Send` nor `Sync`); other threads reach it through a
/// [`DeferredPublisher`].
pub struct EventBus {
    local_authority: Cell<AuthorityId>,
    next_id: Cell<u64>,
    subscriptions: RefCell<Vec<Rc<Subscription>>>,
    cache: RefCell<HashMap<EventTypeId, DispatchList>>,
    known_types: RefCell<HashMap<EventTypeId, &'static EventType>>,
    values: RefCell<ValueLists>,
    depth: Cell<usize>,
    deferred_tx: flume::Sender<Deferred>,
    deferred_rx: flume::Receiver<Deferred>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("local_authority", &self.local_authority.get())
            .field("subscriptions", &self.subscriptions.borrow().len())
            .field("cached_types", &self.cache.borrow().len())
            .field("depth", &self.depth.get())
            .field("deferred", &self.deferred_rx.len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

struct DepthGuard<'a>(&'a Cell<usize>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (deferred_tx, deferred_rx) = flume::unbounded();
        Self {
            local_authority: Cell::new(crate::net::AUTHORITY_UNSET),
            next_id: Cell::new(0),
            subscriptions: RefCell::new(Vec::new()),
            cache: RefCell::new(HashMap::new()),
            known_types: RefCell::new(HashMap::new()),
            values: RefCell::new(ValueLists::default()),
            depth: Cell::new(0),
            deferred_tx,
            deferred_rx,
        }
    }

    /// Authority id of this machine; envelopes whose source matches are
    /// marked `is_from_me`.
    pub fn set_local_authority(&self, authority: AuthorityId) {
        self.local_authority.set(authority);
    }

    pub fn local_authority(&self) -> AuthorityId {
        self.local_authority.get()
    }

    pub fn deferred_publisher(&self) -> DeferredPublisher {
        DeferredPublisher::new(self.deferred_tx.clone())
    }

    pub fn subscribe<T: TypedEvent>(
        &self,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_to(T::static_type(), handler)
    }

    /// Receives `ty` and every type deriving from or implementing it.
    pub fn subscribe_to(
        &self,
        ty: &'static EventType,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_general(ty, Box::new(handler), None)
    }

    pub fn subscribe_filtered_to(
        &self,
        ty: &'static EventType,
        filter: impl Fn(&Envelope<'_>) -> bool + 'static,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_general(ty, Box::new(handler), Some(Box::new(filter)))
    }

    fn subscribe_general(
        &self,
        ty: &'static EventType,
        handler: Handler,
        filter: Option<Filter>,
    ) -> Result<SubscriptionId, SubscribeError> {
        if ty.is_value_changed_family() {
            return Err(SubscribeError::ValueChangedFamily(ty.name));
        }
        if ty.is_concrete() {
            self.known_types.borrow_mut().entry(ty.id()).or_insert(ty);
        }
        Ok(self.register(Target::Type(ty.id()), handler, filter))
    }

    pub fn subscribe_value_changed(
        &self,
        kind: ValueKind,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> SubscriptionId {
        self.register(Target::Value(kind), Box::new(handler), None)
    }

    pub fn subscribe_filtered_value_changed(
        &self,
        kind: ValueKind,
        filter: impl Fn(&Envelope<'_>) -> bool + 'static,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> SubscriptionId {
        self.register(Target::Value(kind), Box::new(handler), Some(Box::new(filter)))
    }

    /// Runs before any kind-specific value-changed handler.
    pub fn subscribe_any_value_changed(
        &self,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> SubscriptionId {
        self.register(Target::AnyValue, Box::new(handler), None)
    }

    pub fn subscribe_filtered_any_value_changed(
        &self,
        filter: impl Fn(&Envelope<'_>) -> bool + 'static,
        handler: impl Fn(&Envelope<'_>) -> HandlerResult + 'static,
    ) -> SubscriptionId {
        self.register(Target::AnyValue, Box::new(handler), Some(Box::new(filter)))
    }

    fn register(&self, target: Target, handler: Handler, filter: Option<Filter>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        self.subscriptions.borrow_mut().push(Rc::new(Subscription {
            id,
            target,
            priority: Cell::new(DEFAULT_PRIORITY),
            active: Cell::new(true),
            handler,
            filter,
        }));
        self.rebuild_all();
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subs = self.subscriptions.borrow_mut();
            match subs.iter().position(|s| s.id == id) {
                Some(index) => {
                    subs.remove(index).active.set(false);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.rebuild_all();
        }
        removed
    }

    /// Lower values run first; equal priorities keep registration order.
    pub fn set_priority(&self, id: SubscriptionId, priority: i32) -> Result<(), SubscribeError> {
        {
            let subs = self.subscriptions.borrow();
            let sub = subs
                .iter()
                .find(|s| s.id == id)
                .ok_or(SubscribeError::Unknown(id))?;
            sub.priority.set(priority);
        }
        self.rebuild_all();
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    /// Publishes `event` from this machine, reliably, to everyone.
    pub fn publish<E: Event>(&self, event: E) -> Result<usize, DispatchError> {
        self.publish_with(event, Route::default())
    }

    /// Runs every matching handler in priority order and returns how many
    /// of them failed.
    pub fn publish_with<E: Event>(&self, event: E, route: Route) -> Result<usize, DispatchError> {
        self.dispatch(Box::new(event), route, type_name::<E>())
    }

    pub fn publish_boxed<E: Event>(&self, event: Box<E>, route: Route) -> Result<usize, DispatchError> {
        self.dispatch(event, route, type_name::<E>())
    }

    /// The bus lives on the dispatch thread, so this is an immediate publish.
    pub fn publish_deferred<E: Event>(&self, event: E) -> Result<usize, DispatchError> {
        self.publish(event)
    }

    /// Dispatches the deferred events queued before this call. Events queued
    /// by handlers during the drain wait for the next one.
    pub fn drain_deferred(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let pending = self.deferred_rx.len();

        for _ in 0..pending {
            let Ok(deferred) = self.deferred_rx.try_recv() else {
                break;
            };
            report.dispatched += 1;
            match self.dispatch(deferred.event, deferred.route, deferred.published_as) {
                Ok(failures) => report.failures += failures,
                Err(e) => {
                    log::error!("Deferred publish aborted: {}", e);
                    report.failures += 1;
                }
            }
        }
        report
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred_rx.len()
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    fn dispatch(
        &self,
        event: Box<dyn Event>,
        route: Route,
        published_as: &'static str,
    ) -> Result<usize, DispatchError> {
        let ty = event.event_type();
        let depth = self.depth.get();
        if depth >= MAX_DISPATCH_DEPTH {
            log::error!(
                "Dispatch depth {} exceeded publishing {} as {}",
                depth,
                ty,
                published_as
            );
            event.recycle();
            return Err(DispatchError::DepthExceeded {
                depth,
                event: ty.name,
            });
        }

        self.depth.set(depth + 1);
        let _guard = DepthGuard(&self.depth);

        let list = if ty.is_value_changed_family() {
            self.value_list(event.value_changed().map(|v| v.kind()))
        } else {
            self.dispatch_list(ty)
        };

        let local = self.local_authority.get();
        let envelope = Envelope {
            event: &*event,
            source: route.source,
            target: route.target,
            reliable: route.reliable,
            is_from_me: route.source == crate::net::AUTHORITY_UNSET || route.source == local,
            published_as,
        };

        let mut failures = 0;
        for sub in list.iter() {
            if !sub.active.get() {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter(&envelope) {
                    continue;
                }
            }
            if let Err(reason) = invoke(sub, &envelope) {
                failures += 1;
                log::error!(
                    "Handler {:?} failed for {} ({}) published as {} at depth {}: {}\n{}",
                    sub.id,
                    ty,
                    event.type_name(),
                    published_as,
                    depth + 1,
                    reason,
                    Backtrace::capture()
                );
            }
        }

        event.recycle();
        Ok(failures)
    }

    fn dispatch_list(&self, ty: &'static EventType) -> DispatchList {
        if let Some(list) = self.cache.borrow().get(&ty.id()) {
            return Rc::clone(list);
        }

        self.known_types.borrow_mut().insert(ty.id(), ty);
        let list = self.build_list(ty);
        self.cache.borrow_mut().insert(ty.id(), Rc::clone(&list));
        list
    }

    fn value_list(&self, kind: Option<ValueKind>) -> DispatchList {
        let values = self.values.borrow();
        match kind.and_then(|k| values.by_kind.get(&k)) {
            Some(list) => Rc::clone(list),
            None => Rc::clone(&values.any),
        }
    }

    fn build_list(&self, ty: &'static EventType) -> DispatchList {
        let reachable: Vec<EventTypeId> = ty.ancestry().iter().map(|t| t.id()).collect();
        let subs = self.subscriptions.borrow();

        let mut list: Vec<Rc<Subscription>> = Vec::new();
        for sub in subs.iter() {
            let Target::Type(target) = sub.target else {
                continue;
            };
            if reachable.contains(&target) && !list.iter().any(|s| s.id == sub.id) {
                list.push(Rc::clone(sub));
            }
        }
        sort_by_priority(&mut list);
        list.into()
    }

    fn rebuild_all(&self) {
        let known: Vec<&'static EventType> = self.known_types.borrow().values().copied().collect();
        let rebuilt: HashMap<EventTypeId, DispatchList> = known
            .into_iter()
            .map(|ty| (ty.id(), self.build_list(ty)))
            .collect();
        *self.cache.borrow_mut() = rebuilt;

        let subs = self.subscriptions.borrow();
        let mut any = Vec::new();
        let mut by_kind: HashMap<ValueKind, Vec<Rc<Subscription>>> = HashMap::new();
        for sub in subs.iter() {
            match sub.target {
                Target::AnyValue => any.push(Rc::clone(sub)),
                Target::Value(kind) => by_kind.entry(kind).or_default().push(Rc::clone(sub)),
                Target::Type(_) => {}
            }
        }
        sort_by_priority(&mut any);

        let by_kind: HashMap<ValueKind, DispatchList> = by_kind
            .into_iter()
            .map(|(kind, mut list)| {
                sort_by_priority(&mut list);
                let merged: DispatchList = any.iter().chain(list.iter()).cloned().collect();
                (kind, merged)
            })
            .collect();

        let mut values = self.values.borrow_mut();
        values.any = any.into();
        values.by_kind = by_kind;
    }
}

/// Stable, so equal priorities stay in registration order.
fn sort_by_priority(list: &mut [Rc<Subscription>]) {
    list.sort_by_key(|s| s.priority.get());
}

fn invoke(sub: &Subscription, envelope: &Envelope<'_>) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(envelope))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::{EventKind, NET_EVENT, PERSISTENT_EVENT, TRANSIENT_EVENT};
    use crate::event::value::{SyncValue, ValueChanged, ValueChangedPool};
    use std::time::Duration;

    static ENTITY_EVENT: EventType = EventType {
        name: "test::EntityEvent",
        kind: EventKind::Abstract,
        base: None,
        interfaces: &[&PERSISTENT_EVENT],
    };

    static SPAWNED: EventType = EventType {
        name: "test::Spawned",
        kind: EventKind::Class,
        base: Some(&ENTITY_EVENT),
        interfaces: &[&PERSISTENT_EVENT, &TRANSIENT_EVENT],
    };

    static PING: EventType = EventType {
        name: "test::Ping",
        kind: EventKind::Class,
        base: None,
        interfaces: &[&TRANSIENT_EVENT],
    };

    #[derive(Debug)]
    struct Spawned(u32);

    impl TypedEvent for Spawned {
        fn static_type() -> &'static EventType {
            &SPAWNED
        }
    }

    #[derive(Debug)]
    struct Ping;

    impl TypedEvent for Ping {
        fn static_type() -> &'static EventType {
            &PING
        }
    }

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn record(log: &Log, tag: &'static str) -> impl Fn(&Envelope<'_>) -> HandlerResult + 'static {
        let log = Rc::clone(log);
        move |_: &Envelope<'_>| {
            log.borrow_mut().push(tag);
            Ok(())
        }
    }

    #[test]
    fn priorities_run_lowest_first() {
        let bus = EventBus::new();
        let log: Log = Rc::default();

        for (tag, priority) in [("five", 5), ("one", 1), ("three", 3)] {
            let id = bus.subscribe::<Ping>(record(&log, tag)).unwrap();
            bus.set_priority(id, priority).unwrap();
        }

        assert_eq!(bus.publish(Ping), Ok(0));
        assert_eq!(*log.borrow(), vec!["one", "three", "five"]);
    }

    #[test]
    fn equal_priorities_keep_registration_order() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe::<Ping>(record(&log, "a")).unwrap();
        bus.subscribe::<Ping>(record(&log, "b")).unwrap();
        let c = bus.subscribe::<Ping>(record(&log, "c")).unwrap();
        bus.set_priority(c, -1).unwrap();

        bus.publish(Ping).unwrap();
        assert_eq!(*log.borrow(), vec!["c", "a", "b"]);
    }

    #[test]
    fn base_subscription_reached_once_through_many_paths() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe_to(&ENTITY_EVENT, record(&log, "entity")).unwrap();
        bus.subscribe_to(&PERSISTENT_EVENT, record(&log, "persistent")).unwrap();
        bus.subscribe_to(&NET_EVENT, record(&log, "net")).unwrap();

        bus.publish(Spawned(1)).unwrap();
        assert_eq!(*log.borrow(), vec!["entity", "persistent", "net"]);

        log.borrow_mut().clear();
        bus.publish(Ping).unwrap();
        assert_eq!(*log.borrow(), vec!["net"]);
    }

    #[test]
    fn new_subscription_reaches_already_cached_type() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.publish(Spawned(1)).unwrap();

        bus.subscribe_to(&ENTITY_EVENT, record(&log, "late")).unwrap();
        bus.publish(Spawned(2)).unwrap();
        assert_eq!(*log.borrow(), vec!["late"]);
    }

    #[test]
    fn failing_handler_is_isolated() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe::<Ping>(record(&log, "first")).unwrap();
        bus.subscribe::<Ping>(|_| Err("boom".into())).unwrap();
        bus.subscribe::<Ping>(record(&log, "third")).unwrap();

        assert_eq!(bus.publish(Ping), Ok(1));
        assert_eq!(*log.borrow(), vec!["first", "third"]);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe::<Ping>(|_| panic!("handler bug")).unwrap();
        bus.subscribe::<Ping>(record(&log, "after")).unwrap();

        assert_eq!(bus.publish(Ping), Ok(1));
        assert_eq!(*log.borrow(), vec!["after"]);
        assert_eq!(bus.depth(), 0);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        let id = bus.subscribe::<Ping>(record(&log, "gone")).unwrap();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.set_priority(id, 1), Err(SubscribeError::Unknown(id)));

        bus.publish(Ping).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn filter_skips_handler() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe_filtered_to(&PING, |env| env.reliable, record(&log, "reliable"))
            .unwrap();

        bus.publish_with(Ping, Route::default().unreliable()).unwrap();
        assert!(log.borrow().is_empty());
        bus.publish(Ping).unwrap();
        assert_eq!(*log.borrow(), vec!["reliable"]);
    }

    #[test]
    fn envelope_reports_origin() {
        let bus = EventBus::new();
        bus.set_local_authority(3);
        let seen: Rc<RefCell<Vec<(bool, Option<u32>)>>> = Rc::default();
        let sink = Rc::clone(&seen);
        bus.subscribe::<Spawned>(move |env| {
            sink.borrow_mut()
                .push((env.is_from_me, env.event_as::<Spawned>().map(|s| s.0)));
            Ok(())
        })
        .unwrap();

        bus.publish(Spawned(9)).unwrap();
        bus.publish_with(Spawned(10), Route::from_source(3)).unwrap();
        bus.publish_with(Spawned(11), Route::from_source(4).to(3)).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![(true, Some(9)), (true, Some(10)), (false, Some(11))]
        );
    }

    #[test]
    fn value_changed_family_rejected_by_general_subscribe() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.subscribe_to(&crate::event::types::VALUE_CHANGED, |_| Ok(())),
            Err(SubscribeError::ValueChangedFamily(_))
        ));
    }

    #[test]
    fn value_changed_runs_any_then_kind() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe_value_changed(ValueKind::Int, record(&log, "int"));
        bus.subscribe_value_changed(ValueKind::Bool, record(&log, "bool"));
        bus.subscribe_any_value_changed(record(&log, "any"));
        bus.subscribe_to(&NET_EVENT, record(&log, "general")).unwrap();

        let event = ValueChanged::new(1, 0, SyncValue::Int(1), SyncValue::Int(2));
        assert_eq!(bus.publish(event), Ok(0));
        assert_eq!(*log.borrow(), vec!["any", "int"]);
    }

    #[test]
    fn filtered_value_subscriptions_skip_rejected_changes() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe_filtered_value_changed(
            ValueKind::Int,
            |env| env.value_changed().is_some_and(|v| v.participant_id == 7),
            record(&log, "int7"),
        );
        bus.subscribe_filtered_any_value_changed(|env| env.reliable, record(&log, "reliable"));

        let event = ValueChanged::new(3, 0, SyncValue::Int(1), SyncValue::Int(2));
        bus.publish_with(event, Route::default().unreliable()).unwrap();
        assert!(log.borrow().is_empty());

        let event = ValueChanged::new(7, 0, SyncValue::Int(1), SyncValue::Int(2));
        bus.publish(event).unwrap();
        assert_eq!(*log.borrow(), vec!["reliable", "int7"]);
    }

    #[test]
    fn value_lists_follow_subscription_changes() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe_value_changed(ValueKind::Bool, record(&log, "bool"));
        let any = bus.subscribe_any_value_changed(record(&log, "any"));
        let late = bus.subscribe_any_value_changed(record(&log, "first"));
        bus.set_priority(late, -1).unwrap();

        let change = || ValueChanged::new(1, 0, SyncValue::Bool(false), SyncValue::Bool(true));
        bus.publish(change()).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "any", "bool"]);

        log.borrow_mut().clear();
        bus.unsubscribe(any);
        bus.publish(change()).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "bool"]);
    }

    #[test]
    fn pooled_value_changed_returns_after_dispatch() {
        let bus = EventBus::new();
        let pool = ValueChangedPool::new(2);
        let seen = Rc::new(Cell::new(0));
        let counter = Rc::clone(&seen);
        bus.subscribe_any_value_changed(move |env| {
            let change = env.value_changed().ok_or("missing payload")?;
            counter.set(counter.get() + change.participant_id);
            Ok(())
        });

        let event = pool.acquire(
            5,
            0,
            SyncValue::Float(0.0),
            SyncValue::Float(1.0),
            Duration::ZERO,
        );
        bus.publish_boxed(event, Route::default()).unwrap();
        assert_eq!(seen.get(), 5);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn recursion_stops_at_depth_limit() {
        let bus = Rc::new(EventBus::new());
        let weak = Rc::downgrade(&bus);
        let errors = Rc::new(Cell::new(0));
        let tripped = Rc::clone(&errors);

        bus.subscribe::<Ping>(move |_| {
            let Some(bus) = weak.upgrade() else {
                return Ok(());
            };
            match bus.publish(Ping) {
                Err(DispatchError::DepthExceeded { .. }) => {
                    tripped.set(tripped.get() + 1);
                    Ok(())
                }
                Ok(_) => Ok(()),
            }
        })
        .unwrap();

        assert_eq!(bus.publish(Ping), Ok(0));
        assert_eq!(errors.get(), 1);
        assert_eq!(bus.depth(), 0);
    }

    #[test]
    fn deferred_publisher_waits_for_drain_on_owning_thread() {
        let bus = EventBus::new();
        let log: Log = Rc::default();
        bus.subscribe::<Ping>(record(&log, "ping")).unwrap();

        bus.deferred_publisher().publish(Ping);
        assert!(log.borrow().is_empty());
        assert_eq!(bus.deferred_len(), 1);

        bus.publish_deferred(Ping).unwrap();
        assert_eq!(*log.borrow(), vec!["ping"]);

        bus.drain_deferred();
        assert_eq!(*log.borrow(), vec!["ping", "ping"]);
    }

    #[test]
    fn drain_processes_only_events_present_at_start() {
        let bus = Rc::new(EventBus::new());
        let publisher = bus.deferred_publisher();
        let log: Log = Rc::default();

        let requeue = bus.deferred_publisher();
        let sink = Rc::clone(&log);
        bus.subscribe::<Spawned>(move |env| {
            sink.borrow_mut().push("spawned");
            if env.event_as::<Spawned>().is_some_and(|s| s.0 == 1) {
                requeue.publish(Ping);
            }
            Ok(())
        })
        .unwrap();
        bus.subscribe::<Ping>(record(&log, "ping")).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                publisher.publish(Spawned(1));
                publisher.publish(Spawned(2));
            });
        });

        assert_eq!(
            bus.drain_deferred(),
            DrainReport {
                dispatched: 2,
                failures: 0
            }
        );
        assert_eq!(*log.borrow(), vec!["spawned", "spawned"]);
        assert_eq!(bus.deferred_len(), 1);

        bus.drain_deferred();
        assert_eq!(*log.borrow(), vec!["spawned", "spawned", "ping"]);
    }
}
