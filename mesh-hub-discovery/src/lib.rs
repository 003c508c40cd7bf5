mod context;
mod error;
mod handler;
pub mod mesh;
mod owner;
pub mod scanner;
pub mod service;
pub mod tenancy;
pub mod workload;

#[cfg(test)]
mod testing;

use std::collections::BTreeMap;

pub use context::{DiscoveryContext, Records};
pub use error::Error;
pub use handler::{DISCOVERY_HANDLER, DiscoveryHandler};
pub use mesh::MeshFinder;
pub use owner::OwnerResolver;
pub use scanner::Scanners;
pub use service::MeshServiceFinder;
pub use tenancy::ClusterTenancyFinder;
pub use workload::MeshWorkloadFinder;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field manager for records written by discovery
pub const FIELD_MANAGER: &str = "mesh-hub-discovery";

/// Whether a stored record already carries every desired label.
pub(crate) fn labels_cover(
    existing: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> bool {
    desired.iter().all(|(k, v)| existing.get(k) == Some(v))
}
