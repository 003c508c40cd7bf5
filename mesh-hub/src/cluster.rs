use std::path::Path;

use http::Uri;
use kube::config::KubeConfigOptions;
use serde::Deserialize;

use crate::{Error, Result};

/// Clusters known at startup. `local` is the management cluster records are
/// written to; it is also discovered like any remote cluster.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterConfigs {
    pub local: Config,

    #[serde(default)]
    pub remote: Vec<Config>,
}

impl ClusterConfigs {
    pub async fn try_new_configs(path: impl AsRef<Path>) -> Result<Self> {
        let config = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&config)
    }

    pub fn from_yaml(config: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(config)?)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub name: String,

    /// Kubeconfig context; in-cluster configuration is used when unset
    pub context: Option<String>,

    /// Overrides the API server address of the in-cluster configuration
    pub endpoint: Option<String>,
}

impl Config {
    pub async fn client_config(&self) -> Result<kube::Config> {
        if self.context.is_some() {
            return Ok(kube::Config::from_kubeconfig(&KubeConfigOptions {
                context: self.context.clone(),
                ..Default::default()
            })
            .await?);
        }
        let mut client_config = kube::Config::incluster()?;
        if let Some(endpoint) = &self.endpoint {
            client_config.cluster_url = self.endpoint_uri(endpoint)?;
        }
        Ok(client_config)
    }

    fn endpoint_uri(&self, endpoint: &str) -> Result<Uri> {
        Uri::try_from(endpoint).map_err(|_| Error::InvalidEndpoint {
            cluster: self.name.clone(),
            endpoint: endpoint.to_string(),
        })
    }
}
