mod client;
mod controller;
mod error;
mod manager;
mod registry;

pub use client::{cluster_client, install_crypto_provider};
pub use controller::{
    BoxError, ClusterHandler, KubeManagerFactory, ManagerController, ManagerFactory,
};
pub use error::Error;
pub use manager::{
    AsyncManager, ClusterCache, DEFAULT_CACHE_SYNC_TIMEOUT, ErrorLatch, StartupHook, WatchTask,
};
pub use registry::{HandlerMap, ManagerMap, Registry};

pub type Result<T, E = Error> = std::result::Result<T, E>;
