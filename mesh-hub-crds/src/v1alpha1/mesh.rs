use std::fmt;

use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

use crate::v1alpha1::ResourceRef;

pub const NAME_GROUP_MESH: &str = "meshes.discovery.mesh-hub.dev";

/// A service mesh control plane found on one or more registered clusters.
///
/// Exactly one of `istio`, `linkerd` or `awsAppMesh` is set. Cluster-local
/// meshes carry `cluster`; account-scoped meshes list their hosting clusters
/// instead.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "discovery.mesh-hub.dev",
    version = "v1alpha1",
    kind = "Mesh",
    plural = "meshes",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub istio: Option<IstioMesh>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkerd: Option<LinkerdMesh>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_app_mesh: Option<AwsAppMesh>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ResourceRef>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MeshInstallation {
    pub installation_namespace: String,
    pub version: String,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IstioMesh {
    pub installation: MeshInstallation,
    pub citadel: CitadelInfo,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CitadelInfo {
    pub trust_domain: String,
    pub citadel_namespace: String,
    pub citadel_service_account: String,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LinkerdMesh {
    pub installation: MeshInstallation,
    pub cluster_domain: String,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AwsAppMesh {
    pub name: String,
    pub region: String,
    pub aws_account_id: String,
    /// Registered clusters that currently run workloads of this mesh
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeshType {
    Istio,
    Linkerd,
    AppMesh,
}

impl MeshType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshType::Istio => "istio",
            MeshType::Linkerd => "linkerd",
            MeshType::AppMesh => "appmesh",
        }
    }

    /// Account-scoped meshes span clusters and track tenancy separately.
    pub fn is_account_scoped(&self) -> bool {
        matches!(self, MeshType::AppMesh)
    }
}

impl fmt::Display for MeshType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MeshSpec {
    pub fn mesh_type(&self) -> Option<MeshType> {
        if self.istio.is_some() {
            Some(MeshType::Istio)
        } else if self.linkerd.is_some() {
            Some(MeshType::Linkerd)
        } else if self.aws_app_mesh.is_some() {
            Some(MeshType::AppMesh)
        } else {
            None
        }
    }

    pub fn hosted_on(&self, cluster: &str) -> bool {
        if let Some(app_mesh) = &self.aws_app_mesh {
            return app_mesh.clusters.iter().any(|c| c == cluster);
        }
        self.cluster.as_ref().is_some_and(|c| c.name == cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosted_on_cluster_local() {
        let spec = MeshSpec {
            istio: Some(IstioMesh::default()),
            cluster: Some(ResourceRef::new("east")),
            ..Default::default()
        };
        assert_eq!(spec.mesh_type(), Some(MeshType::Istio));
        assert!(spec.hosted_on("east"));
        assert!(!spec.hosted_on("west"));
    }

    #[test]
    fn test_hosted_on_account_scoped() {
        let spec = MeshSpec {
            aws_app_mesh: Some(AwsAppMesh {
                name: "shop".into(),
                region: "us-east-1".into(),
                aws_account_id: "123456789012".into(),
                clusters: vec!["east".into(), "west".into()],
            }),
            // ignored for account-scoped meshes
            cluster: Some(ResourceRef::new("north")),
            ..Default::default()
        };
        assert!(spec.hosted_on("west"));
        assert!(!spec.hosted_on("north"));
        assert!(spec.mesh_type().is_some_and(|t| t.is_account_scoped()));
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = MeshSpec {
            aws_app_mesh: Some(AwsAppMesh {
                name: "shop".into(),
                region: "us-east-1".into(),
                aws_account_id: "123456789012".into(),
                clusters: vec![],
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["awsAppMesh"]["awsAccountId"], "123456789012");
        assert!(value.get("istio").is_none());
        assert!(value["awsAppMesh"].get("clusters").is_none());
    }
}
