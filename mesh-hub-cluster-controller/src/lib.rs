mod context;
mod controller;
mod error;
mod runtime;

pub use context::Context;
pub use error::Error;
pub use mesh_hub_crds::v1alpha1;
pub use runtime::start_cluster_controller;

pub type Result<T, E = Error> = std::result::Result<T, E>;
