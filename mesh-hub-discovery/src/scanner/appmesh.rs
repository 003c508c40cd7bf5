use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Pod};
use mesh_hub_crds::v1alpha1::mesh::{AwsAppMesh, Mesh, MeshSpec, MeshType};

use super::{
    ImageName, MeshScanner, Scanner, SidecarScanner, arg_value, containers, deployment_pod_spec,
    env_value, object_key,
};
use crate::{Error, Result};

const CONTROLLER_IMAGE: &str = "appmesh-controller";
const ENVOY_IMAGE: &str = "aws-appmesh-envoy";
const VIRTUAL_NODE_ENV: &str = "APPMESH_VIRTUAL_NODE_NAME";
const RESOURCE_ARN_ENV: &str = "APPMESH_RESOURCE_ARN";

pub struct AppMeshScanner;

fn setting<'a>(container: &'a Container, env: &str, flag: &str) -> Option<&'a str> {
    env_value(container, env).or_else(|| arg_value(container, flag))
}

/// Mesh an App Mesh envoy belongs to. Region and account are only known
/// when the envoy is configured with a full resource ARN.
#[derive(Debug, PartialEq, Eq)]
struct EnvoyTarget<'a> {
    mesh: &'a str,
    region: Option<&'a str>,
    account: Option<&'a str>,
}

impl<'a> EnvoyTarget<'a> {
    /// `mesh/<mesh>/virtualNode/<node>`
    fn from_virtual_node(value: &'a str) -> Option<Self> {
        let mut parts = value.split('/');
        if parts.next()? != "mesh" {
            return None;
        }
        let mesh = parts.next().filter(|m| !m.is_empty())?;
        Some(Self {
            mesh,
            region: None,
            account: None,
        })
    }

    /// `arn:aws:appmesh:<region>:<account>:mesh/<mesh>/virtualNode/<node>`
    fn from_arn(value: &'a str) -> Option<Self> {
        let parts: Vec<&str> = value.splitn(6, ':').collect();
        let [_, _, service, region, account, resource] = parts.as_slice() else {
            return None;
        };
        if *service != "appmesh" {
            return None;
        }
        let target = Self::from_virtual_node(resource)?;
        Some(Self {
            region: Some(*region),
            account: Some(*account),
            ..target
        })
    }

    fn matches(&self, mesh: &AwsAppMesh) -> bool {
        mesh.name == self.mesh
            && self.region.is_none_or(|r| r == mesh.region)
            && self.account.is_none_or(|a| a == mesh.aws_account_id)
    }
}

impl Scanner for AppMeshScanner {
    fn mesh_type(&self) -> MeshType {
        MeshType::AppMesh
    }

    fn priority(&self) -> u8 {
        2
    }
}

impl MeshScanner for AppMeshScanner {
    fn scan_deployment(&self, deployment: &Deployment, _cluster: &str) -> Result<Option<MeshSpec>> {
        let Some(container) = containers(deployment_pod_spec(deployment))
            .iter()
            .find(|c| {
                c.image
                    .as_deref()
                    .is_some_and(|i| ImageName::parse(i).path_ends_with(CONTROLLER_IMAGE))
            })
        else {
            return Ok(None);
        };

        let missing = |what: &str| {
            Error::scan(
                MeshType::AppMesh,
                object_key(deployment),
                format!("controller does not configure {what}"),
            )
        };
        let name = setting(container, "APPMESH_NAME", "mesh-name").ok_or_else(|| missing("a mesh name"))?;
        let region = setting(container, "AWS_REGION", "aws-region").ok_or_else(|| missing("a region"))?;
        let account = setting(container, "AWS_ACCOUNT_ID", "aws-account-id")
            .ok_or_else(|| missing("an account id"))?;

        // account-scoped: hosting clusters are tracked from sidecars
        Ok(Some(MeshSpec {
            aws_app_mesh: Some(AwsAppMesh {
                name: name.to_string(),
                region: region.to_string(),
                aws_account_id: account.to_string(),
                clusters: Vec::new(),
            }),
            ..Default::default()
        }))
    }
}

impl SidecarScanner for AppMeshScanner {
    fn scan_pod(&self, pod: &Pod, meshes: &[Arc<Mesh>]) -> Result<Option<Arc<Mesh>>> {
        let Some(envoy) = containers(pod.spec.as_ref()).iter().find(|c| {
            c.image
                .as_deref()
                .is_some_and(|i| ImageName::parse(i).path_ends_with(ENVOY_IMAGE))
        }) else {
            return Ok(None);
        };

        let target = env_value(envoy, RESOURCE_ARN_ENV)
            .and_then(EnvoyTarget::from_arn)
            .or_else(|| env_value(envoy, VIRTUAL_NODE_ENV).and_then(EnvoyTarget::from_virtual_node))
            .ok_or_else(|| {
                Error::scan(
                    MeshType::AppMesh,
                    object_key(pod),
                    format!("envoy sets neither {RESOURCE_ARN_ENV} nor {VIRTUAL_NODE_ENV}"),
                )
            })?;

        Ok(meshes
            .iter()
            .find(|m| m.spec.aws_app_mesh.as_ref().is_some_and(|a| target.matches(a)))
            .cloned())
    }
}
