use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};

/// Labels Kubernetes stamps onto pods of a controller. They differ between
/// revisions of the same workload and carry no meaning for routing.
pub const GENERATED_LABELS: [&str; 3] = [
    "controller-revision-hash",
    "pod-template-hash",
    "pod-template-generation",
];

pub fn is_generated_label(key: &str) -> bool {
    GENERATED_LABELS.contains(&key)
}

pub fn sanitize_pod_labels(labels: &mut BTreeMap<String, String>) {
    GENERATED_LABELS.iter().for_each(|i| {
        labels.remove(*i);
    });
}

/// Equality selector match. An empty selector or an empty label set never
/// matches, so a selector-less Service does not claim every workload.
pub fn labels_match_selector(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    if selector.is_empty() || labels.is_empty() {
        return false;
    }
    let selector = LabelSelector {
        match_labels: Some(selector.clone()),
        match_expressions: None,
    };
    let Ok(selector) = Selector::try_from(selector) else {
        return false;
    };
    selector.matches(labels)
}
