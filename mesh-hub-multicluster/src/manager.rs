use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use mesh_hub_k8s_utils::Informer;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{BoxError, Error, Result};

pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Long running watch supervised by a cluster cache
pub type WatchTask = BoxFuture<'static, Result<()>>;

/// Holds the first error reported by a manager's background work. Later
/// errors are dropped. Once set the notification stays open, so any number
/// of readers can observe it.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    error: OnceLock<Arc<Error>>,
    notify: CancellationToken,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether this call stored the error.
    pub fn set(&self, error: Error) -> bool {
        if self.error.set(Arc::new(error)).is_err() {
            return false;
        }
        self.notify.cancel();
        true
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.error.get().cloned()
    }

    pub fn is_set(&self) -> bool {
        self.notify.is_cancelled()
    }

    /// Resolves once an error has been stored.
    pub async fn wait(&self) -> Option<Arc<Error>> {
        self.notify.cancelled().await;
        self.error()
    }
}

/// The set of watches belonging to one cluster. Watches registered before
/// `run` are queued and started with it, later ones start immediately.
pub struct ClusterCache {
    cluster: String,
    tasks: mpsc::UnboundedSender<WatchTask>,
    pending: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<WatchTask>>>,
    synced: Mutex<Vec<CancellationToken>>,
    feeds: DashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>,
}

impl ClusterCache {
    fn new(cluster: &str) -> Self {
        let (tasks, pending) = mpsc::unbounded_channel();
        Self {
            cluster: cluster.to_string(),
            tasks,
            pending: tokio::sync::Mutex::new(Some(pending)),
            synced: Mutex::new(Vec::new()),
            feeds: DashMap::new(),
        }
    }

    /// Adds a watch to supervise. `synced` is cancelled by the watch once its
    /// initial population is complete.
    pub fn register(&self, synced: CancellationToken, task: WatchTask) {
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(synced);
        if self.tasks.send(task).is_err() {
            debug!(cluster = %self.cluster, "cache stopped, dropping watch");
        }
    }

    /// Supervises registered watches until `cancel` fires. The first watch
    /// to fail ends the cache with its error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let Some(mut pending) = self.pending.lock().await.take() else {
            return Err(Error::CacheAlreadyStarted(self.cluster.clone()));
        };
        let mut running = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(task) = pending.recv() => {
                    running.spawn(task);
                }
                Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => break Err(error),
                    Err(error) => break Err(Error::WatchTaskPanicked(error.to_string())),
                },
            }
        };

        pending.close();
        if result.is_err() {
            running.abort_all();
        }
        // watches observe the same cancellation and wind down on their own
        while running.join_next().await.is_some() {}
        result
    }

    /// Waits for every watch registered so far to finish its initial listing.
    pub async fn wait_for_sync(&self) {
        let tokens = self
            .synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for token in tokens {
            token.cancelled().await;
        }
    }
}

#[async_trait]
pub trait StartupHook: Send + Sync {
    async fn run(&self, manager: &AsyncManager) -> Result<(), BoxError>;
}

/// One cluster's client and watch cache with its own cancellable lifetime.
/// Failures of the cache after start are reported through the error latch.
pub struct AsyncManager {
    cluster: String,
    client: Client,
    cache: Arc<ClusterCache>,
    cancel: CancellationToken,
    latch: Arc<ErrorLatch>,
    sync_timeout: Duration,
}

impl AsyncManager {
    pub fn new(cluster: impl Into<String>, client: Client) -> Self {
        let cluster = cluster.into();
        Self {
            cache: Arc::new(ClusterCache::new(&cluster)),
            cluster,
            client,
            cancel: CancellationToken::new(),
            latch: Arc::new(ErrorLatch::new()),
            sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
        }
    }

    pub fn with_sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.sync_timeout = sync_timeout;
        self
    }

    /// Ties the manager's lifetime to a parent token.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn cache(&self) -> &ClusterCache {
        &self.cache
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn latch(&self) -> &ErrorLatch {
        &self.latch
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.latch.error()
    }

    /// Starts the cache in the background and blocks until it has synced,
    /// then runs each hook in order. A sync timeout or a failing hook stops
    /// the manager.
    pub async fn start(&self, hooks: &[Arc<dyn StartupHook>]) -> Result<()> {
        let cache = self.cache.clone();
        let latch = self.latch.clone();
        let cancel = self.cancel.clone();
        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            if let Err(error) = cache.run(cancel).await {
                error!(cluster = %cluster, %error, "cluster cache failed");
                latch.set(error);
            }
        });

        if let Err(error) = self.wait_for_cache_sync().await {
            self.stop();
            return Err(error);
        }

        for hook in hooks {
            if let Err(source) = hook.run(self).await {
                self.stop();
                return Err(Error::StartupHook {
                    cluster: self.cluster.clone(),
                    source,
                });
            }
        }
        info!(cluster = %self.cluster, "manager started");
        Ok(())
    }

    /// Waits, bounded by the sync timeout, for every watch requested so far.
    pub async fn wait_for_cache_sync(&self) -> Result<()> {
        tokio::select! {
            synced = tokio::time::timeout(self.sync_timeout, self.cache.wait_for_sync()) => {
                synced.map_err(|_| Error::CacheSyncTimeout {
                    cluster: self.cluster.clone(),
                })
            }
            error = self.latch.wait() => match error {
                Some(source) => Err(Error::CacheFailed {
                    cluster: self.cluster.clone(),
                    source,
                }),
                None => Ok(()),
            },
        }
    }

    /// Cooperative: background watches observe the cancellation and exit.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(cluster = %self.cluster, "stopping manager");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cluster-wide watch of `K`, shared by every caller on this manager.
    pub fn watch<K>(&self) -> Arc<Informer<K>>
    where
        K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        self.feed(String::new(), || Api::all(self.client.clone()))
    }

    /// Watch of `K` restricted to one namespace.
    pub fn watch_namespaced<K>(&self, namespace: &str) -> Arc<Informer<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        self.feed(namespace.to_string(), || {
            Api::namespaced(self.client.clone(), namespace)
        })
    }

    fn feed<K>(&self, scope: String, api: impl FnOnce() -> Api<K>) -> Arc<Informer<K>>
    where
        K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        let entry = self.cache.feeds.entry((TypeId::of::<K>(), scope));
        if let Entry::Occupied(existing) = &entry
            && let Ok(informer) = existing.get().clone().downcast::<Informer<K>>()
        {
            return informer;
        }

        let informer = Arc::new(Informer::new(api()));
        entry.insert(informer.clone());

        let task = {
            let informer = informer.clone();
            let cancel = self.cancel.clone();
            Box::pin(async move { informer.run(cancel).await.map_err(Error::from) })
        };
        self.cache.register(informer.synced(), task);
        debug!(cluster = %self.cluster, kind = informer.kind(), "watch requested");
        informer
    }
}
