//! Deterministic record names. Rediscovering the same object always yields
//! the same name, which is what keeps discovery at one record per identity.

use sha2::{Digest, Sha256};

use crate::v1alpha1::mesh::MeshType;

const MAX_NAME_LEN: usize = 63;
const HASH_LEN: usize = 8;

/// Joins `parts` into a DNS-1123 name suffixed with a hash of the parts as
/// given. Sanitizing and joining can map distinct tuples onto the same
/// readable prefix; the hash keeps their names apart. The prefix is cut so
/// the whole name fits in 63 characters.
pub fn build_name(parts: &[&str]) -> String {
    let readable: String = parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let hash = format!("{:x}", hasher.finalize());
    let hash = &hash[..HASH_LEN];

    let keep = MAX_NAME_LEN - HASH_LEN - 1;
    let prefix = readable.get(..keep).unwrap_or(&readable).trim_matches('-');
    if prefix.is_empty() {
        return hash.to_string();
    }
    format!("{prefix}-{hash}")
}

pub fn cluster_local_mesh_name(mesh_type: MeshType, namespace: &str, cluster: &str) -> String {
    build_name(&[mesh_type.as_str(), namespace, cluster])
}

pub fn account_scoped_mesh_name(
    mesh_type: MeshType,
    mesh_name: &str,
    region: &str,
    account: &str,
) -> String {
    build_name(&[mesh_type.as_str(), mesh_name, region, account])
}

pub fn workload_name(
    mesh_type: MeshType,
    controller_name: &str,
    controller_namespace: &str,
    cluster: &str,
) -> String {
    build_name(&[
        mesh_type.as_str(),
        controller_name,
        controller_namespace,
        cluster,
    ])
}

pub fn service_name(service_name: &str, service_namespace: &str, cluster: &str) -> String {
    build_name(&[service_name, service_namespace, cluster])
}
