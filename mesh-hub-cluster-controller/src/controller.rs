use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{controller::Action, finalizer};
use mesh_hub_crds::v1alpha1::cluster::KubernetesCluster;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::{Error, Result, context::Context};

const CLUSTER_FINALIZER: &str = "kubernetesclusters.multicluster.mesh-hub.dev/cleanup";
const DEFAULT_REQUEUE: Duration = Duration::from_secs(300);

pub(crate) async fn reconcile(cluster: Arc<KubernetesCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    info!("Reconciling KubernetesCluster {}", name);
    finalizer(&ctx.clusters, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            finalizer::Event::Apply(cluster) => apply(cluster, ctx.clone()).await,
            finalizer::Event::Cleanup(cluster) => cleanup(cluster, ctx.clone()).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn apply(cluster: Arc<KubernetesCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let secret_name = &cluster.spec.secret_name;
    let secret = ctx.secrets.get(secret_name).await?;
    let kubeconfig = kubeconfig_bytes(&secret, secret_name, cluster.spec.secret_key())?;
    register(&ctx, &name, kubeconfig, cluster.spec.context.as_deref()).await?;
    Ok(Action::requeue(DEFAULT_REQUEUE))
}

async fn cleanup(cluster: Arc<KubernetesCluster>, ctx: Arc<Context>) -> Result<Action> {
    deregister(&ctx, &cluster.name_any()).await?;
    Ok(Action::await_change())
}

fn kubeconfig_bytes<'a>(secret: &'a Secret, secret_name: &str, key: &str) -> Result<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
        .ok_or_else(|| Error::MissingSecretKey {
            secret: secret_name.to_string(),
            key: key.to_string(),
        })
}

fn digest(kubeconfig: &[u8], context: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kubeconfig);
    if let Some(context) = context {
        hasher.update(context.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Client configuration for `context` of a serialized kubeconfig, or its
/// current context when `context` is `None`.
pub(crate) async fn client_config(
    kubeconfig: &[u8],
    secret_name: &str,
    context: Option<&str>,
) -> Result<kube::Config> {
    let yaml = std::str::from_utf8(kubeconfig).map_err(|_| Error::KubeconfigEncoding {
        secret: secret_name.to_string(),
    })?;
    let kubeconfig = Kubeconfig::from_yaml(yaml)?;
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    Ok(kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?)
}

/// Adds the cluster, or replaces it when its kubeconfig changed since it was
/// added. Returns whether the cluster was (re)added.
///
/// The recorded digest is only dropped once the cluster has been removed, so
/// a failed removal is retried on the next reconcile.
pub(crate) async fn register(
    ctx: &Context,
    name: &str,
    kubeconfig: &[u8],
    context: Option<&str>,
) -> Result<bool> {
    let digest = digest(kubeconfig, context);
    if ctx.controller.manager(name).is_some() {
        match ctx.applied.get(name).map(|d| d.value().clone()) {
            None => {
                info!(cluster = %name, "cluster is registered from configuration, skipping");
                return Ok(false);
            }
            Some(applied) if applied == digest => return Ok(false),
            Some(_) => {
                info!(cluster = %name, "kubeconfig changed, re-adding cluster");
                remove_cluster(ctx, name).await?;
            }
        }
    }

    let config = client_config(kubeconfig, name, context).await?;
    ctx.controller.cluster_added(config, name).await?;
    ctx.applied.insert(name.to_string(), digest);
    Ok(true)
}

/// Removes a cluster this controller added. Clusters it never added are left
/// registered.
pub(crate) async fn deregister(ctx: &Context, name: &str) -> Result<()> {
    if !ctx.applied.contains_key(name) {
        return Ok(());
    }
    remove_cluster(ctx, name).await
}

async fn remove_cluster(ctx: &Context, name: &str) -> Result<()> {
    if ctx.controller.manager(name).is_some() {
        match ctx.controller.cluster_removed(name).await {
            Ok(()) | Err(mesh_hub_multicluster::Error::NoManagerForCluster(_)) => {}
            Err(error) => return Err(error.into()),
        }
    }
    ctx.applied.remove(name);
    Ok(())
}

pub(crate) fn error_policy(cluster: Arc<KubernetesCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    error!(?error, "reconcile error for KubernetesCluster {}", name);
    Action::requeue(Duration::from_secs(5))
}
