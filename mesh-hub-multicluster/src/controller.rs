use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::client::cluster_client;
use crate::manager::{AsyncManager, DEFAULT_CACHE_SYNC_TIMEOUT};
use crate::registry::{HandlerMap, ManagerMap};
use crate::{Error, Result};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber to cluster lifecycle events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    async fn cluster_added(&self, manager: Arc<AsyncManager>, cluster: &str)
    -> Result<(), BoxError>;

    async fn cluster_removed(&self, cluster: &str) -> Result<(), BoxError>;
}

/// Builds the manager for a newly registered cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagerFactory: Send + Sync {
    async fn build(&self, config: kube::Config, cluster: &str) -> Result<AsyncManager>;
}

pub struct KubeManagerFactory {
    sync_timeout: Duration,
    parent: CancellationToken,
}

impl KubeManagerFactory {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            parent,
        }
    }

    pub fn with_sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.sync_timeout = sync_timeout;
        self
    }
}

#[async_trait]
impl ManagerFactory for KubeManagerFactory {
    async fn build(&self, config: kube::Config, cluster: &str) -> Result<AsyncManager> {
        let client = cluster_client(config, cluster)?;
        Ok(AsyncManager::new(cluster, client)
            .with_sync_timeout(self.sync_timeout)
            .with_parent(&self.parent))
    }
}

/// Starts and stops a manager per registered cluster and tells every
/// subscribed handler about it.
///
/// Handler notification order within one fan-out is unspecified.
pub struct ManagerController {
    factory: Arc<dyn ManagerFactory>,
    managers: ManagerMap,
    handlers: HandlerMap,
    pending: DashSet<String>,
}

/// Claim on a cluster name while its manager is being added. Released on
/// drop, whether or not the manager was registered.
struct Reservation<'a> {
    pending: &'a DashSet<String>,
    cluster: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.cluster);
    }
}

impl ManagerController {
    pub fn new(factory: Arc<dyn ManagerFactory>) -> Self {
        Self {
            factory,
            managers: ManagerMap::new("cluster"),
            handlers: HandlerMap::new("handler"),
            pending: DashSet::new(),
        }
    }

    /// Claims `cluster` for one in-flight add. Fails when the name is
    /// registered or another add of it is still running.
    fn reserve(&self, cluster: &str) -> Result<Reservation<'_>> {
        let already = || Error::AlreadyRegistered {
            kind: "cluster",
            name: cluster.to_string(),
        };
        if !self.pending.insert(cluster.to_string()) {
            return Err(already());
        }
        let reservation = Reservation {
            pending: &self.pending,
            cluster: cluster.to_string(),
        };
        if self.managers.contains(cluster) {
            return Err(already());
        }
        Ok(reservation)
    }

    /// Builds and starts a manager for `cluster`, then notifies every handler.
    /// The first handler failure stops the new manager and is returned; the
    /// manager is only registered once every handler has accepted it.
    #[instrument(skip(self, config))]
    pub async fn cluster_added(&self, config: kube::Config, cluster: &str) -> Result<()> {
        let _reservation = self.reserve(cluster)?;

        let manager = Arc::new(self.factory.build(config, cluster).await?);
        manager.start(&[]).await?;

        for (name, handler) in self.handlers.snapshot() {
            if let Err(source) = handler.cluster_added(manager.clone(), cluster).await {
                error!(cluster, handler = %name, %source, "handler rejected cluster");
                manager.stop();
                return Err(Error::Handler {
                    handler: name,
                    cluster: cluster.to_string(),
                    source,
                });
            }
        }

        if let Err(error) = self.managers.insert(cluster, manager.clone()) {
            manager.stop();
            return Err(error);
        }
        info!(cluster, "cluster added");
        Ok(())
    }

    /// Stops the cluster's manager and notifies every handler. The first
    /// handler failure is returned and the remaining handlers are skipped.
    #[instrument(skip(self))]
    pub async fn cluster_removed(&self, cluster: &str) -> Result<()> {
        let Some(manager) = self.managers.get(cluster) else {
            return Err(Error::NoManagerForCluster(cluster.to_string()));
        };
        manager.stop();

        for (name, handler) in self.handlers.snapshot() {
            if let Err(source) = handler.cluster_removed(cluster).await {
                error!(cluster, handler = %name, %source, "handler failed to remove cluster");
                return Err(Error::Handler {
                    handler: name,
                    cluster: cluster.to_string(),
                    source,
                });
            }
        }

        self.managers.remove(cluster)?;
        info!(cluster, "cluster removed");
        Ok(())
    }

    pub fn add_handler(&self, handler: Arc<dyn ClusterHandler>, name: &str) -> Result<()> {
        self.handlers.insert(name, handler)
    }

    pub fn remove_handler(&self, name: &str) -> Result<()> {
        self.handlers.remove(name).map(|_| ())
    }

    pub fn manager(&self, cluster: &str) -> Option<Arc<AsyncManager>> {
        self.managers.get(cluster)
    }

    /// Names of the registered clusters, sorted
    pub fn clusters(&self) -> Vec<String> {
        self.managers.names()
    }

    /// Stops every registered manager without notifying handlers.
    pub fn shutdown(&self) {
        for (cluster, manager) in self.managers.snapshot() {
            info!(cluster = %cluster, "stopping cluster");
            manager.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::Uri;

    use super::*;
    use crate::testing::test_client;

    fn config() -> kube::Config {
        kube::Config::new(Uri::from_static("http://localhost"))
    }

    fn factory() -> Arc<MockManagerFactory> {
        let mut factory = MockManagerFactory::new();
        factory
            .expect_build()
            .returning(|_, cluster| Ok(AsyncManager::new(cluster, test_client())));
        Arc::new(factory)
    }

    fn accepting_handler() -> MockClusterHandler {
        let mut handler = MockClusterHandler::new();
        handler.expect_cluster_added().returning(|_, _| Ok(()));
        handler.expect_cluster_removed().returning(|_| Ok(()));
        handler
    }

    #[tokio::test]
    async fn test_failing_handler_blocks_registration() {
        let controller = ManagerController::new(factory());

        let mut a = MockClusterHandler::new();
        a.expect_cluster_added()
            .times(..=1)
            .returning(|_, _| Ok(()));
        let mut b = MockClusterHandler::new();
        b.expect_cluster_added()
            .times(1)
            .returning(|_, _| Err("E".into()));
        controller.add_handler(Arc::new(a), "A").expect("add A");
        controller.add_handler(Arc::new(b), "B").expect("add B");

        let err = controller
            .cluster_added(config(), "east")
            .await
            .expect_err("handler B fails");

        match err {
            Error::Handler {
                handler,
                cluster,
                source,
            } => {
                assert_eq!(handler, "B");
                assert_eq!(cluster, "east");
                assert_eq!(source.to_string(), "E");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(controller.manager("east").is_none());
        assert!(controller.clusters().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_manager_is_stopped() {
        let stopped = Arc::new(Mutex::new(None));
        let seen = stopped.clone();
        let mut handler = MockClusterHandler::new();
        handler.expect_cluster_added().returning(move |manager, _| {
            *seen.lock().expect("lock") = Some(manager);
            Err("nope".into())
        });
        let controller = ManagerController::new(factory());
        controller
            .add_handler(Arc::new(handler), "only")
            .expect("add handler");

        controller
            .cluster_added(config(), "east")
            .await
            .expect_err("rejected");

        let manager = stopped.lock().expect("lock").take().expect("manager seen");
        assert!(manager.is_stopped());
    }

    #[tokio::test]
    async fn test_cluster_added_and_removed() {
        let controller = ManagerController::new(factory());
        controller
            .add_handler(Arc::new(accepting_handler()), "discovery")
            .expect("add handler");

        controller
            .cluster_added(config(), "east")
            .await
            .expect("added");
        let manager = controller.manager("east").expect("registered");
        assert!(!manager.is_stopped());

        controller.cluster_removed("east").await.expect("removed");
        assert!(manager.is_stopped());
        assert!(controller.manager("east").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_cluster_keeps_first_manager() {
        let mut factory = MockManagerFactory::new();
        factory
            .expect_build()
            .times(1)
            .returning(|_, cluster| Ok(AsyncManager::new(cluster, test_client())));
        let controller = ManagerController::new(Arc::new(factory));

        controller
            .cluster_added(config(), "east")
            .await
            .expect("first");
        let first = controller.manager("east").expect("registered");

        let err = controller
            .cluster_added(config(), "east")
            .await
            .expect_err("duplicate");

        assert!(matches!(err, Error::AlreadyRegistered { kind: "cluster", .. }));
        let current = controller.manager("east").expect("still registered");
        assert!(Arc::ptr_eq(&first, &current));
        assert!(!current.is_stopped());
    }

    /// Accepts every cluster after a delay, counting notifications.
    #[derive(Default)]
    struct SlowHandler {
        added: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ClusterHandler for SlowHandler {
        async fn cluster_added(
            &self,
            _manager: Arc<AsyncManager>,
            _cluster: &str,
        ) -> Result<(), BoxError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.added.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn cluster_removed(&self, _cluster: &str) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_adds_build_one_manager() {
        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = built.clone();
        let mut factory = MockManagerFactory::new();
        factory.expect_build().returning(move |_, cluster| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(AsyncManager::new(cluster, test_client()))
        });
        let handler = Arc::new(SlowHandler::default());
        let controller = ManagerController::new(Arc::new(factory));
        controller
            .add_handler(handler.clone(), "slow")
            .expect("add handler");

        let (a, b) = tokio::join!(
            controller.cluster_added(config(), "east"),
            controller.cluster_added(config(), "east"),
        );

        assert!(a.is_ok() != b.is_ok());
        let err = a.err().or(b.err()).expect("one add rejected");
        assert!(matches!(err, Error::AlreadyRegistered { kind: "cluster", .. }));
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(handler.added.load(std::sync::atomic::Ordering::SeqCst), 1);

        // a finished add releases the name for a later re-add
        controller.cluster_removed("east").await.expect("removed");
        controller
            .cluster_added(config(), "east")
            .await
            .expect("re-added");
    }

    #[tokio::test]
    async fn test_remove_unknown_cluster_notifies_nobody() {
        let mut handler = MockClusterHandler::new();
        handler.expect_cluster_removed().never();
        let controller = ManagerController::new(factory());
        controller
            .add_handler(Arc::new(handler), "discovery")
            .expect("add handler");

        let err = controller
            .cluster_removed("west")
            .await
            .expect_err("unknown cluster");

        assert!(matches!(err, Error::NoManagerForCluster(ref c) if c == "west"));
    }

    #[tokio::test]
    async fn test_factory_failure_propagates() {
        let mut factory = MockManagerFactory::new();
        factory.expect_build().returning(|_, cluster| {
            Err(Error::CacheSyncTimeout {
                cluster: cluster.to_string(),
            })
        });
        let mut handler = MockClusterHandler::new();
        handler.expect_cluster_added().never();
        let controller = ManagerController::new(Arc::new(factory));
        controller
            .add_handler(Arc::new(handler), "discovery")
            .expect("add handler");

        let err = controller
            .cluster_added(config(), "east")
            .await
            .expect_err("factory fails");

        assert!(matches!(err, Error::CacheSyncTimeout { .. }));
        assert!(controller.manager("east").is_none());
    }

    #[test]
    fn test_handler_names_are_exclusive() {
        let controller = ManagerController::new(factory());
        controller
            .add_handler(Arc::new(accepting_handler()), "discovery")
            .expect("first");

        assert!(matches!(
            controller.add_handler(Arc::new(accepting_handler()), "discovery"),
            Err(Error::AlreadyRegistered { kind: "handler", .. })
        ));
        assert!(matches!(
            controller.remove_handler("missing"),
            Err(Error::NotRegistered { kind: "handler", .. })
        ));
        controller.remove_handler("discovery").expect("remove");
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_manager() {
        let controller = ManagerController::new(factory());
        controller.cluster_added(config(), "east").await.expect("east");
        controller.cluster_added(config(), "west").await.expect("west");

        controller.shutdown();

        assert_eq!(controller.clusters(), vec!["east", "west"]);
        for cluster in ["east", "west"] {
            assert!(controller.manager(cluster).expect("registered").is_stopped());
        }
    }

    #[tokio::test]
    async fn test_kube_factory_ties_manager_to_parent() {
        let parent = CancellationToken::new();
        let factory = KubeManagerFactory::new(parent.clone());
        let manager = factory.build(config(), "east").await.expect("build");
        assert_eq!(manager.cluster(), "east");

        parent.cancel();
        assert!(manager.is_stopped());
    }
}
