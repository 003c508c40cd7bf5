/// A parsed container image reference such as
/// `docker.io/istio/pilot:1.5.1` or `istio/proxyv2@sha256:...`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageName {
    pub registry: Option<String>,
    /// Repository path without registry, e.g. `istio/pilot`
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageName {
    pub fn parse(image: &str) -> Self {
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (image, None),
        };

        let (rest, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => {
                (&rest[..idx], Some(rest[idx + 1..].to_string()))
            }
            _ => (rest, None),
        };

        let (registry, path) = match rest.split_once('/') {
            Some((first, path))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), path.to_string())
            }
            _ => (None, rest.to_string()),
        };

        Self {
            registry,
            path,
            tag,
            digest,
        }
    }

    /// Whether the repository path ends with `suffix` on a path boundary.
    pub fn path_ends_with(&self, suffix: &str) -> bool {
        self.path == suffix
            || self
                .path
                .strip_suffix(suffix)
                .is_some_and(|prefix| prefix.ends_with('/'))
    }

    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}
