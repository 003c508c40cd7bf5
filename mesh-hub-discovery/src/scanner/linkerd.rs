use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use mesh_hub_crds::v1alpha1::ResourceRef;
use mesh_hub_crds::v1alpha1::mesh::{LinkerdMesh, Mesh, MeshInstallation, MeshSpec, MeshType};

use super::{
    ImageName, MeshScanner, Scanner, SidecarScanner, arg_value, containers, deployment_pod_spec,
    object_key,
};
use crate::{Error, Result};

const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const PROXY_CONTAINER: &str = "linkerd-proxy";

pub struct LinkerdScanner;

// linkerd-io/controller, linkerd/controller and cr.l5d.io/linkerd/controller
fn is_linkerd_image(image: &ImageName, component: &str) -> bool {
    image.path.rsplit('/').next() == Some(component) && image.path.contains("linkerd")
}

fn is_sidecar(container: &Container) -> bool {
    container.name == PROXY_CONTAINER
        || container
            .image
            .as_deref()
            .is_some_and(|i| is_linkerd_image(&ImageName::parse(i), "proxy"))
}

impl Scanner for LinkerdScanner {
    fn mesh_type(&self) -> MeshType {
        MeshType::Linkerd
    }

    fn priority(&self) -> u8 {
        1
    }
}

impl MeshScanner for LinkerdScanner {
    fn scan_deployment(&self, deployment: &Deployment, cluster: &str) -> Result<Option<MeshSpec>> {
        let controller = containers(deployment_pod_spec(deployment))
            .iter()
            .find_map(|c| {
                let image = ImageName::parse(c.image.as_deref()?);
                is_linkerd_image(&image, "controller").then_some((c, image))
            });
        let Some((container, image)) = controller else {
            return Ok(None);
        };
        let Some(namespace) = deployment.namespace() else {
            return Err(Error::scan(
                MeshType::Linkerd,
                object_key(deployment),
                "control plane deployment has no namespace",
            ));
        };

        let cluster_domain =
            arg_value(container, "cluster-domain").unwrap_or(DEFAULT_CLUSTER_DOMAIN);

        Ok(Some(MeshSpec {
            linkerd: Some(LinkerdMesh {
                installation: MeshInstallation {
                    installation_namespace: namespace,
                    version: image.tag_or_latest().to_string(),
                },
                cluster_domain: cluster_domain.to_string(),
            }),
            cluster: Some(ResourceRef::new(cluster)),
            ..Default::default()
        }))
    }
}

impl SidecarScanner for LinkerdScanner {
    fn scan_pod(&self, pod: &Pod, meshes: &[Arc<Mesh>]) -> Result<Option<Arc<Mesh>>> {
        if !containers(pod.spec.as_ref()).iter().any(is_sidecar) {
            return Ok(None);
        }
        Ok(meshes.iter().find(|m| m.spec.linkerd.is_some()).cloned())
    }
}
