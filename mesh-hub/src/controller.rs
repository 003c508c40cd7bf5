use std::sync::Arc;
use std::time::Duration;

use mesh_hub_cluster_controller::start_cluster_controller;
use mesh_hub_discovery::{DISCOVERY_HANDLER, DiscoveryHandler};
use mesh_hub_multicluster::{
    AsyncManager, KubeManagerFactory, ManagerController, cluster_client,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::ClusterConfigs;
use crate::config::ControllerArgs;
use crate::{Error, Result};

pub async fn start(args: ControllerArgs, cancel: CancellationToken) -> Result<()> {
    let configs = ClusterConfigs::try_new_configs(&args.clusters_config).await?;
    let sync_timeout = Duration::from_secs(args.cache_sync_timeout_secs);

    let local_config = configs.local.client_config().await?;
    let local_client = cluster_client(local_config.clone(), &configs.local.name)?;
    let local = Arc::new(
        AsyncManager::new(configs.local.name.clone(), local_client.clone())
            .with_sync_timeout(sync_timeout)
            .with_parent(&cancel),
    );
    local.start(&[]).await?;

    let factory = KubeManagerFactory::new(cancel.clone()).with_sync_timeout(sync_timeout);
    let controller = Arc::new(ManagerController::new(Arc::new(factory)));
    let discovery = DiscoveryHandler::new(local.clone(), args.write_namespace.clone())
        .with_prune_meshes(args.prune_meshes);
    controller.add_handler(Arc::new(discovery), DISCOVERY_HANDLER)?;

    controller
        .cluster_added(local_config, &configs.local.name)
        .await?;
    for remote in &configs.remote {
        let config = match remote.client_config().await {
            Ok(config) => config,
            Err(error) => {
                warn!(cluster = %remote.name, %error, "failed to create cluster from config");
                continue;
            }
        };
        if let Err(error) = controller.cluster_added(config, &remote.name).await {
            warn!(cluster = %remote.name, %error, "failed to add cluster");
        }
    }

    let registration = args.watch_cluster_resources.then(|| {
        let namespace = args.write_namespace.clone();
        let controller = controller.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            start_cluster_controller(local_client, &namespace, controller, cancel).await
        })
    });
    info!(clusters = ?controller.clusters(), "mesh-hub controller started");

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        failure = local.latch().wait() => match failure {
            Some(error) => Err(Error::LocalCluster(error)),
            None => Ok(()),
        },
    };

    cancel.cancel();
    controller.shutdown();
    local.stop();
    if let Some(handle) = registration {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => error!(%error, "cluster registration controller failed"),
            Err(error) => error!(%error, "cluster registration controller task failed"),
        }
    }
    result
}
