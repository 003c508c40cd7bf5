pub mod event;
pub mod informer;
pub mod record;
pub mod selector;

use thiserror::Error;

pub use event::{Event, EventFeed, EventHandler, HandlerError, HandlerId, Predicate};
pub use informer::Informer;
pub use record::{KubeRecordStore, RecordStore};
pub use selector::{labels_match_selector, sanitize_pod_labels};

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("watch for {0} is already running")]
    AlreadyRunning(String),

    #[error("watch stream for {0} ended unexpectedly")]
    WatchStreamEnded(String),

    #[error("watch for {0} has stopped, handlers can no longer be added")]
    FeedStopped(String),

    #[error("no handler registered with id {0}")]
    HandlerNotFound(HandlerId),

    #[error("object has no name")]
    UnnamedObject,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
