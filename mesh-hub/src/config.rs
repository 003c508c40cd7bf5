use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Controller(ControllerArgs),
    /// Print the CRDs as YAML
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Cluster configs path
    #[arg(
        long,
        env = "MESH_HUB_CLUSTERS_CONFIG",
        default_value = "/etc/mesh-hub/clusters.yaml"
    )]
    pub clusters_config: PathBuf,

    /// Namespace discovered records are written to
    #[arg(long, env = "MESH_HUB_WRITE_NAMESPACE", default_value = "mesh-hub")]
    pub write_namespace: String,

    /// Seconds to wait for a cluster's caches to sync
    #[arg(long, env = "MESH_HUB_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 2)]
    pub cache_sync_timeout_secs: u64,

    /// Delete meshes that are no longer found on their cluster
    #[arg(long, env = "MESH_HUB_PRUNE_MESHES", default_value_t = false)]
    pub prune_meshes: bool,

    /// Register clusters from KubernetesCluster resources
    #[arg(
        long,
        env = "MESH_HUB_WATCH_CLUSTER_RESOURCES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub watch_cluster_resources: bool,
}
