use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{Dispatcher, Event, EventFeed, EventHandler, HandlerId, Predicate};
use crate::{Error, Result};

/// A watch over one resource kind on one cluster. Keeps a reflector store of
/// the live objects and turns watcher events into create/update/delete
/// callbacks for registered handlers.
///
/// Handlers registered after the initial listing are replayed the current
/// store contents as creates before they see further events. Live events
/// that arrive between registration and replay are not delivered to them
/// separately, so each object reaches a new handler once.
pub struct Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    kind: String,
    api: Api<K>,
    config: watcher::Config,
    reader: Store<K>,
    runtime: Mutex<Option<(Writer<K>, mpsc::UnboundedReceiver<HandlerId>)>>,
    replays: mpsc::UnboundedSender<HandlerId>,
    dispatcher: Dispatcher<K>,
    synced: CancellationToken,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    pub fn new(api: Api<K>) -> Self {
        Self::with_config(api, watcher::Config::default())
    }

    pub fn with_config(api: Api<K>, config: watcher::Config) -> Self {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let (reader, writer) = reflector::store();
        let (replays, replay_rx) = mpsc::unbounded_channel();
        Self {
            dispatcher: Dispatcher::new(kind.clone()),
            kind,
            api,
            config,
            reader,
            runtime: Mutex::new(Some((writer, replay_rx))),
            replays,
            synced: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Live objects as of the last processed watch event
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Cancelled once the first complete listing has been delivered.
    pub fn synced(&self) -> CancellationToken {
        self.synced.clone()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.is_cancelled()
    }

    pub fn handler_count(&self) -> usize {
        self.dispatcher.len()
    }

    /// Runs the watch until `cancel` fires. Returns an error if the watch
    /// stream ends on its own.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let Some((mut writer, mut replays)) = self.runtime.lock().await.take() else {
            return Err(Error::AlreadyRunning(self.kind.clone()));
        };

        let stream = watcher(self.api.clone(), self.config.clone()).default_backoff();
        let mut stream = pin!(stream);
        let mut known: HashMap<ObjectRef<K>, Arc<K>> = HashMap::new();
        let mut initial: Vec<K> = Vec::new();

        info!(kind = %self.kind, "starting watch");
        let result = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(id) = replays.recv() => {
                    self.replay(id).await;
                    continue;
                }
                event = stream.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(error)) => {
                    warn!(kind = %self.kind, %error, "watch error");
                    continue;
                }
                None => break Err(Error::WatchStreamEnded(self.kind.clone())),
            };

            // the store is updated first so handlers observe the new state
            writer.apply_watcher_event(&event);
            self.handle(event, &mut known, &mut initial).await;
        };

        self.dispatcher.stop();
        info!(kind = %self.kind, "watch stopped");
        result
    }

    async fn handle(
        &self,
        event: watcher::Event<K>,
        known: &mut HashMap<ObjectRef<K>, Arc<K>>,
        initial: &mut Vec<K>,
    ) {
        match event {
            watcher::Event::Init => initial.clear(),
            watcher::Event::InitApply(obj) => initial.push(obj),
            watcher::Event::InitDone => {
                let registrations = self.dispatcher.prime_all();
                let events = relist(known, std::mem::take(initial));
                debug!(kind = %self.kind, events = events.len(), "listing complete");
                for event in &events {
                    self.dispatcher.dispatch_to(&registrations, event).await;
                }
                if !self.synced.is_cancelled() {
                    info!(kind = %self.kind, "watch synced");
                    self.synced.cancel();
                }
            }
            watcher::Event::Apply(obj) => {
                let event = observe(known, obj);
                self.dispatcher.dispatch_primed(&event).await;
            }
            watcher::Event::Delete(obj) => {
                known.remove(&ObjectRef::from_obj(&obj));
                self.dispatcher
                    .dispatch_primed(&Event::Delete(Arc::new(obj)))
                    .await;
            }
        }
    }

    async fn replay(&self, id: HandlerId) {
        // handlers added before the first listing receive it with everyone else
        if !self.synced.is_cancelled() {
            return;
        }
        let Some(registration) = self.dispatcher.take_unprimed(id) else {
            return;
        };
        for obj in self.reader.state() {
            self.dispatcher
                .deliver(id, &registration, &Event::Create(obj))
                .await;
        }
    }
}

impl<K> EventFeed<K> for Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn add_event_handler(
        &self,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Predicate<K>>,
    ) -> Result<HandlerId> {
        let id = self.dispatcher.register(handler, predicates)?;
        if self.replays.send(id).is_err() {
            self.dispatcher.deregister(id)?;
            return Err(Error::FeedStopped(self.kind.clone()));
        }
        Ok(id)
    }

    fn remove_event_handler(&self, id: HandlerId) -> Result<()> {
        self.dispatcher.deregister(id)
    }
}

fn observe<K>(known: &mut HashMap<ObjectRef<K>, Arc<K>>, obj: K) -> Event<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let key = ObjectRef::from_obj(&obj);
    let new = Arc::new(obj);
    match known.insert(key, new.clone()) {
        Some(old) => Event::Update { old, new },
        None => Event::Create(new),
    }
}

/// Events implied by a complete listing: creates and updates for listed
/// objects, deletes for previously known objects missing from the listing.
fn relist<K>(known: &mut HashMap<ObjectRef<K>, Arc<K>>, listed: Vec<K>) -> Vec<Event<K>>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let mut seen = HashSet::with_capacity(listed.len());
    let mut events = Vec::with_capacity(listed.len());
    for obj in listed {
        seen.insert(ObjectRef::from_obj(&obj));
        events.push(observe(known, obj));
    }
    let removed: Vec<ObjectRef<K>> = known
        .keys()
        .filter(|key| !seen.contains(*key))
        .cloned()
        .collect();
    for key in removed {
        if let Some(obj) = known.remove(&key) {
            events.push(Event::Delete(obj));
        }
    }
    events
}
