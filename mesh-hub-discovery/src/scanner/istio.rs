use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use mesh_hub_crds::v1alpha1::ResourceRef;
use mesh_hub_crds::v1alpha1::mesh::{
    CitadelInfo, IstioMesh, Mesh, MeshInstallation, MeshSpec, MeshType,
};

use super::{
    ImageName, MeshScanner, Scanner, SidecarScanner, arg_value, containers, deployment_pod_spec,
    env_value, object_key,
};
use crate::{Error, Result};

const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";
const DEFAULT_SERVICE_ACCOUNT: &str = "istiod";
const PROXY_CONTAINER: &str = "istio-proxy";
const DISCOVERY_ADDRESS_FLAG: &str = "discoveryAddress";
const CA_ADDRESS_ENV: &str = "CA_ADDR";
const PILOT_ADDRESS_ENV: &str = "PILOT_ADDRESS";

pub struct IstioScanner;

fn is_istio_image(image: &ImageName, component: &str) -> bool {
    image.path.rsplit('/').next() == Some(component) && image.path.contains("istio")
}

fn is_sidecar(container: &Container) -> bool {
    container.name == PROXY_CONTAINER
        || container
            .image
            .as_deref()
            .is_some_and(|i| is_istio_image(&ImageName::parse(i), "proxyv2"))
}

/// Namespace of the control plane a sidecar connects to, taken from a
/// `service.namespace[.svc...][:port]` address.
fn control_plane_namespace(sidecar: &Container) -> Option<&str> {
    let address = arg_value(sidecar, DISCOVERY_ADDRESS_FLAG)
        .or_else(|| env_value(sidecar, CA_ADDRESS_ENV))
        .or_else(|| env_value(sidecar, PILOT_ADDRESS_ENV))?;
    let host = address.split(':').next()?;
    host.split('.').nth(1).filter(|ns| !ns.is_empty())
}

impl Scanner for IstioScanner {
    fn mesh_type(&self) -> MeshType {
        MeshType::Istio
    }

    fn priority(&self) -> u8 {
        0
    }
}

impl MeshScanner for IstioScanner {
    fn scan_deployment(&self, deployment: &Deployment, cluster: &str) -> Result<Option<MeshSpec>> {
        let pod_spec = deployment_pod_spec(deployment);
        let pilot = containers(pod_spec).iter().find_map(|c| {
            let image = ImageName::parse(c.image.as_deref()?);
            is_istio_image(&image, "pilot").then_some((c, image))
        });
        let Some((container, image)) = pilot else {
            return Ok(None);
        };
        let Some(namespace) = deployment.namespace() else {
            return Err(Error::scan(
                MeshType::Istio,
                object_key(deployment),
                "control plane deployment has no namespace",
            ));
        };

        let service_account = pod_spec
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());
        let trust_domain = arg_value(container, "trust-domain").unwrap_or(DEFAULT_TRUST_DOMAIN);

        Ok(Some(MeshSpec {
            istio: Some(IstioMesh {
                installation: MeshInstallation {
                    installation_namespace: namespace.clone(),
                    version: image.tag_or_latest().to_string(),
                },
                citadel: CitadelInfo {
                    trust_domain: trust_domain.to_string(),
                    citadel_namespace: namespace,
                    citadel_service_account: service_account,
                },
            }),
            cluster: Some(ResourceRef::new(cluster)),
            ..Default::default()
        }))
    }
}

impl SidecarScanner for IstioScanner {
    fn scan_pod(&self, pod: &Pod, meshes: &[Arc<Mesh>]) -> Result<Option<Arc<Mesh>>> {
        let Some(sidecar) = containers(pod.spec.as_ref()).iter().find(|c| is_sidecar(c)) else {
            return Ok(None);
        };
        let mut candidates = meshes.iter().filter(|m| m.spec.istio.is_some());
        let found = match control_plane_namespace(sidecar) {
            Some(namespace) => candidates.find(|m| {
                m.spec
                    .istio
                    .as_ref()
                    .is_some_and(|i| i.installation.installation_namespace == namespace)
            }),
            // without an address only a single control plane is unambiguous
            None => match (candidates.next(), candidates.next()) {
                (Some(only), None) => Some(only),
                _ => None,
            },
        };
        Ok(found.cloned())
    }
}
