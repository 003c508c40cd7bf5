use clap::Parser;
use mesh_hub::config::{Cli, Commands};
use mesh_hub::{Result, controller};
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    if !mesh_hub_multicluster::install_crypto_provider() {
        warn!("a rustls crypto provider was already installed");
    }
    let cancel = tokio_util::sync::CancellationToken::new();
    match cli.command {
        Commands::Controller(controller_args) => {
            let mut controller_handle =
                tokio::spawn(controller::start(controller_args, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut controller_handle => exit("controller", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    if let Err(e) = controller_handle.await {
                        error!("controller exited with error: {}", e.to_string());
                    }
                },
            };
            info!("Exiting...");
        }
        Commands::Crdgen => mesh_hub_crds::crd_gen_all()?,
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mesh_hub=info,mesh_hub_discovery=info,mesh_hub_multicluster=info,\
                 mesh_hub_cluster_controller=info,mesh_hub_k8s_utils=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
