use kube::runtime::finalizer;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("multicluster error: {0}")]
    Multicluster(#[from] mesh_hub_multicluster::Error),

    #[error("secret {secret} has no key {key}")]
    MissingSecretKey { secret: String, key: String },

    #[error("kubeconfig in secret {secret} is not valid utf-8")]
    KubeconfigEncoding { secret: String },

    #[error("other error: {0}")]
    Other(String),
}

impl From<finalizer::Error<Error>> for Error {
    fn from(err: finalizer::Error<Error>) -> Self {
        match err {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            finalizer::Error::UnnamedObject => Error::Other("object has no name".into()),
            finalizer::Error::InvalidFinalizer => Error::Other("invalid finalizer".into()),
        }
    }
}
