//! Mesh detection. Control plane scanners recognise a mesh installation from
//! a Deployment, sidecar scanners recognise an injected pod and resolve it to
//! an already recorded Mesh.
//!
//! Scanners run in ascending priority and the first match wins.

mod appmesh;
pub mod image;
mod istio;
mod linkerd;

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::ResourceExt;
use mesh_hub_crds::v1alpha1::mesh::{Mesh, MeshSpec, MeshType};
use tracing::warn;

pub use appmesh::AppMeshScanner;
pub use image::ImageName;
pub use istio::IstioScanner;
pub use linkerd::LinkerdScanner;

use crate::Result;

pub trait Scanner: Send + Sync {
    fn mesh_type(&self) -> MeshType;

    /// Lower values are tried first.
    fn priority(&self) -> u8;
}

pub trait MeshScanner: Scanner {
    /// Returns the installation described by `deployment`, if it is a mesh
    /// control plane.
    fn scan_deployment(&self, deployment: &Deployment, cluster: &str) -> Result<Option<MeshSpec>>;
}

pub trait SidecarScanner: Scanner {
    /// Returns the mesh among `meshes` whose sidecar runs in `pod`.
    fn scan_pod(&self, pod: &Pod, meshes: &[Arc<Mesh>]) -> Result<Option<Arc<Mesh>>>;
}

pub struct Scanners {
    meshes: Vec<Arc<dyn MeshScanner>>,
    sidecars: Vec<Arc<dyn SidecarScanner>>,
}

impl Default for Scanners {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Scanners {
    pub fn new(
        mut meshes: Vec<Arc<dyn MeshScanner>>,
        mut sidecars: Vec<Arc<dyn SidecarScanner>>,
    ) -> Self {
        meshes.sort_by_key(|s| s.priority());
        sidecars.sort_by_key(|s| s.priority());
        Self { meshes, sidecars }
    }

    /// Istio, Linkerd and AWS App Mesh, in that order.
    pub fn builtin() -> Self {
        let meshes: Vec<Arc<dyn MeshScanner>> = vec![
            Arc::new(IstioScanner),
            Arc::new(LinkerdScanner),
            Arc::new(AppMeshScanner),
        ];
        let sidecars: Vec<Arc<dyn SidecarScanner>> = vec![
            Arc::new(IstioScanner),
            Arc::new(LinkerdScanner),
            Arc::new(AppMeshScanner),
        ];
        Self::new(meshes, sidecars)
    }

    pub fn scan_deployment(&self, deployment: &Deployment, cluster: &str) -> Result<Option<MeshSpec>> {
        let object = object_key(deployment);
        first_match(&self.meshes, &object, |scanner| {
            scanner.scan_deployment(deployment, cluster)
        })
    }

    /// Only scanners for mesh types present in `meshes` are consulted.
    pub fn scan_pod(&self, pod: &Pod, meshes: &[Arc<Mesh>]) -> Result<Option<Arc<Mesh>>> {
        let known: BTreeSet<MeshType> = meshes.iter().filter_map(|m| m.spec.mesh_type()).collect();
        if known.is_empty() {
            return Ok(None);
        }
        let candidates: Vec<Arc<dyn SidecarScanner>> = self
            .sidecars
            .iter()
            .filter(|s| known.contains(&s.mesh_type()))
            .cloned()
            .collect();
        let object = object_key(pod);
        first_match(&candidates, &object, |scanner| scanner.scan_pod(pod, meshes))
    }
}

/// Tries each scanner until one matches. Errors from scanners that ran
/// before the match are logged; without a match the first error is returned.
fn first_match<S, T>(
    scanners: &[Arc<S>],
    object: &str,
    scan: impl Fn(&S) -> Result<Option<T>>,
) -> Result<Option<T>>
where
    S: Scanner + ?Sized,
{
    let mut errors = Vec::new();
    for scanner in scanners {
        match scan(scanner.as_ref()) {
            Ok(Some(found)) => {
                for error in errors {
                    warn!(object, matched = %scanner.mesh_type(), %error, "ignoring scanner error");
                }
                return Ok(Some(found));
            }
            Ok(None) => {}
            Err(error) => errors.push(error),
        }
    }
    match errors.into_iter().next() {
        Some(error) => Err(error),
        None => Ok(None),
    }
}

pub(crate) fn object_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

pub(crate) fn deployment_pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref()?.template.spec.as_ref()
}

pub(crate) fn containers(spec: Option<&PodSpec>) -> &[Container] {
    spec.map(|s| s.containers.as_slice()).unwrap_or_default()
}

pub(crate) fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

/// Value of a command line flag given as `--flag=value`, `-flag=value` or
/// `--flag value` in the container's command or args.
pub(crate) fn arg_value<'a>(container: &'a Container, flag: &str) -> Option<&'a str> {
    let args: Vec<&'a str> = container
        .command
        .iter()
        .chain(container.args.iter())
        .flatten()
        .map(String::as_str)
        .collect();
    for (i, arg) in args.iter().enumerate() {
        let Some(stripped) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            continue;
        };
        if stripped == flag {
            return args.get(i + 1).copied();
        }
        if let Some(value) = stripped
            .strip_prefix(flag)
            .and_then(|rest| rest.strip_prefix('='))
        {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mesh_hub_crds::v1alpha1::mesh::IstioMesh;

    use super::*;
    use crate::Error;
    use crate::testing::{container, make_pod};

    struct Fixed {
        mesh_type: MeshType,
        priority: u8,
        result: fn() -> Result<Option<MeshSpec>>,
        calls: AtomicUsize,
    }

    impl Scanner for Fixed {
        fn mesh_type(&self) -> MeshType {
            self.mesh_type
        }

        fn priority(&self) -> u8 {
            self.priority
        }
    }

    impl MeshScanner for Fixed {
        fn scan_deployment(&self, _: &Deployment, _: &str) -> Result<Option<MeshSpec>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn fixed(
        mesh_type: MeshType,
        priority: u8,
        result: fn() -> Result<Option<MeshSpec>>,
    ) -> Arc<Fixed> {
        Arc::new(Fixed {
            mesh_type,
            priority,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    fn istio_spec() -> Result<Option<MeshSpec>> {
        Ok(Some(MeshSpec {
            istio: Some(IstioMesh::default()),
            ..Default::default()
        }))
    }

    fn failing() -> Result<Option<MeshSpec>> {
        Err(Error::scan(MeshType::Linkerd, "ns/d", "broken"))
    }

    fn nothing() -> Result<Option<MeshSpec>> {
        Ok(None)
    }

    #[test]
    fn test_lowest_priority_wins() {
        let low = fixed(MeshType::Istio, 0, istio_spec);
        let high = fixed(MeshType::Linkerd, 5, istio_spec);
        let meshes: Vec<Arc<dyn MeshScanner>> = vec![high.clone(), low.clone()];
        let scanners = Scanners::new(meshes, vec![]);

        let found = scanners
            .scan_deployment(&Deployment::default(), "east")
            .expect("scan");

        assert!(found.is_some());
        assert_eq!(low.calls.load(Ordering::SeqCst), 1);
        assert_eq!(high.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_before_match_is_not_fatal() {
        let meshes: Vec<Arc<dyn MeshScanner>> = vec![
            fixed(MeshType::Linkerd, 0, failing),
            fixed(MeshType::Istio, 1, istio_spec),
        ];
        let scanners = Scanners::new(meshes, vec![]);
        let found = scanners
            .scan_deployment(&Deployment::default(), "east")
            .expect("match wins over error");
        assert!(found.is_some_and(|s| s.istio.is_some()));
    }

    #[test]
    fn test_error_without_match_is_returned() {
        let meshes: Vec<Arc<dyn MeshScanner>> = vec![
            fixed(MeshType::Linkerd, 0, failing),
            fixed(MeshType::Istio, 1, nothing),
        ];
        let scanners = Scanners::new(meshes, vec![]);
        let err = scanners
            .scan_deployment(&Deployment::default(), "east")
            .expect_err("no match");
        assert!(matches!(err, Error::Scan { mesh_type: MeshType::Linkerd, .. }));
    }

    #[test]
    fn test_pod_scan_skips_unknown_mesh_types() {
        let pod = make_pod(
            "reviews-1",
            "bookinfo",
            &[("app", "reviews")],
            vec![container("istio-proxy", "docker.io/istio/proxyv2:1.6.0")],
        );
        let found = Scanners::builtin().scan_pod(&pod, &[]).expect("scan");
        assert!(found.is_none());
    }

    #[test]
    fn test_arg_value_forms() {
        let mut c = container("discovery", "istio/pilot:1.5.1");
        c.args = Some(vec![
            "discovery".into(),
            "--trust-domain=example.org".into(),
            "-cluster-domain".into(),
            "corp.local".into(),
        ]);
        assert_eq!(arg_value(&c, "trust-domain"), Some("example.org"));
        assert_eq!(arg_value(&c, "cluster-domain"), Some("corp.local"));
        assert_eq!(arg_value(&c, "trust"), None);
        assert_eq!(arg_value(&c, "missing"), None);
    }
}
