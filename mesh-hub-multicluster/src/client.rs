use kube::Client;

use crate::{Error, Result};

/// Installs aws-lc-rs as the process-wide rustls provider. Returns false when
/// a provider was already installed.
pub fn install_crypto_provider() -> bool {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok()
}

/// Client for `cluster`. The crypto provider is installed first so TLS
/// connectors can be built from any config.
pub fn cluster_client(config: kube::Config, cluster: &str) -> Result<Client> {
    install_crypto_provider();
    Client::try_from(config).map_err(|source| Error::ManagerCreation {
        cluster: cluster.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use http::Uri;

    use super::*;

    #[tokio::test]
    async fn test_https_client_builds() {
        let mut config = kube::Config::new(Uri::from_static("https://east.example:6443"));
        config.accept_invalid_certs = true;
        let client = cluster_client(config, "east").expect("https client");
        assert_eq!(client.default_namespace(), "default");

        // second install is a no-op
        assert!(!install_crypto_provider());
    }
}
