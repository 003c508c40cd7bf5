use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::error;

use crate::{Error, Result};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Filter evaluated before an event reaches a handler.
pub type Predicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait EventHandler<K: Send + Sync + 'static>: Send + Sync {
    async fn on_create(&self, obj: Arc<K>) -> Result<(), HandlerError>;

    async fn on_update(&self, old: Arc<K>, new: Arc<K>) -> Result<(), HandlerError>;

    async fn on_delete(&self, obj: Arc<K>) -> Result<(), HandlerError>;

    async fn on_generic(&self, _obj: Arc<K>) -> Result<(), HandlerError> {
        Ok(())
    }
}

pub trait EventFeed<K: Send + Sync + 'static>: Send + Sync {
    fn add_event_handler(
        &self,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Predicate<K>>,
    ) -> Result<HandlerId>;

    fn remove_event_handler(&self, id: HandlerId) -> Result<()>;
}

#[derive(Debug)]
pub enum Event<K> {
    Create(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
    Generic(Arc<K>),
}

impl<K> Clone for Event<K> {
    fn clone(&self) -> Self {
        match self {
            Event::Create(obj) => Event::Create(obj.clone()),
            Event::Update { old, new } => Event::Update {
                old: old.clone(),
                new: new.clone(),
            },
            Event::Delete(obj) => Event::Delete(obj.clone()),
            Event::Generic(obj) => Event::Generic(obj.clone()),
        }
    }
}

impl<K> Event<K> {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Create(_) => "create",
            Event::Update { .. } => "update",
            Event::Delete(_) => "delete",
            Event::Generic(_) => "generic",
        }
    }

    /// Updates pass when either side matches so that an object moving out of
    /// a handler's interest is still observed.
    pub fn passes(&self, predicates: &[Predicate<K>]) -> bool {
        predicates.iter().all(|predicate| match self {
            Event::Update { old, new } => predicate(old) || predicate(new),
            Event::Create(obj) | Event::Delete(obj) | Event::Generic(obj) => predicate(obj),
        })
    }
}

pub(crate) struct Registration<K: Send + Sync + 'static> {
    handler: Arc<dyn EventHandler<K>>,
    predicates: Vec<Predicate<K>>,
    /// Set once the handler has been delivered the initial listing
    primed: AtomicBool,
}

/// Fan-out of events to registered handlers. Handlers are invoked one at a
/// time in registration order; a failing handler is logged and does not
/// prevent delivery to the rest.
pub struct Dispatcher<K: Send + Sync + 'static> {
    kind: String,
    next_id: AtomicU64,
    registrations: DashMap<HandlerId, Arc<Registration<K>>>,
    stopped: AtomicBool,
}

impl<K: Send + Sync + 'static> Dispatcher<K> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            next_id: AtomicU64::new(1),
            registrations: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn register(
        &self,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Predicate<K>>,
    ) -> Result<HandlerId> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::FeedStopped(self.kind.clone()));
        }
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.insert(
            id,
            Arc::new(Registration {
                handler,
                predicates,
                primed: AtomicBool::new(false),
            }),
        );
        Ok(id)
    }

    pub fn deregister(&self, id: HandlerId) -> Result<()> {
        self.registrations
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::HandlerNotFound(id))
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn snapshot(&self) -> Vec<(HandlerId, Arc<Registration<K>>)> {
        let mut registrations: Vec<_> = self
            .registrations
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        registrations.sort_by_key(|(id, _)| *id);
        registrations
    }

    /// Snapshot of every current registration, marking each as primed.
    pub(crate) fn prime_all(&self) -> Vec<(HandlerId, Arc<Registration<K>>)> {
        let registrations = self.snapshot();
        for (_, registration) in &registrations {
            registration.primed.store(true, Ordering::Release);
        }
        registrations
    }

    /// Returns the registration if it has not yet seen the initial listing.
    pub(crate) fn take_unprimed(&self, id: HandlerId) -> Option<Arc<Registration<K>>> {
        let registration = self.registrations.get(&id)?.value().clone();
        if registration.primed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(registration)
    }

    pub async fn dispatch(&self, event: &Event<K>) {
        let registrations = self.snapshot();
        self.dispatch_to(&registrations, event).await;
    }

    /// Delivers a live event to handlers that have seen the initial state.
    /// Unprimed handlers skip it; their replay reads the store, which already
    /// reflects the event.
    pub(crate) async fn dispatch_primed(&self, event: &Event<K>) {
        let registrations: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|(_, registration)| registration.primed.load(Ordering::Acquire))
            .collect();
        self.dispatch_to(&registrations, event).await;
    }

    pub(crate) async fn dispatch_to(
        &self,
        registrations: &[(HandlerId, Arc<Registration<K>>)],
        event: &Event<K>,
    ) {
        for (id, registration) in registrations {
            self.deliver(*id, registration, event).await;
        }
    }

    pub(crate) async fn deliver(
        &self,
        id: HandlerId,
        registration: &Registration<K>,
        event: &Event<K>,
    ) {
        if !event.passes(&registration.predicates) {
            return;
        }
        let handler = &registration.handler;
        let result = match event {
            Event::Create(obj) => handler.on_create(obj.clone()).await,
            Event::Update { old, new } => handler.on_update(old.clone(), new.clone()).await,
            Event::Delete(obj) => handler.on_delete(obj.clone()).await,
            Event::Generic(obj) => handler.on_generic(obj.clone()).await,
        };
        if let Err(error) = result {
            error!(
                kind = %self.kind,
                handler = %id,
                event = event.name(),
                %error,
                "event handler failed"
            );
        }
    }
}
