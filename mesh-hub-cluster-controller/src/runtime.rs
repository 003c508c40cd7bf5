use std::sync::Arc;

use futures::StreamExt;
use kube::Client;
use kube::runtime::{Controller, watcher::Config};
use mesh_hub_multicluster::ManagerController;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::context::Context;
use crate::controller::{error_policy, reconcile};

/// Registers every KubernetesCluster in `namespace` with `controller` until
/// `cancel` fires.
pub async fn start_cluster_controller(
    client: Client,
    namespace: &str,
    controller: Arc<ManagerController>,
    cancel: CancellationToken,
) -> Result<()> {
    let context = Arc::new(Context::new(client, namespace, controller));

    info!(%namespace, "starting cluster registration controller");
    Controller::new(context.clusters.clone(), Config::default().any_semantic())
        .graceful_shutdown_on(shutdown(cancel))
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}
