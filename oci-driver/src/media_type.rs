//! OCI and Docker media types, and classification of payloads that were
//! stored without one.

use serde::Deserialize;

/// OCI image index.
pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image manifest.
pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image config.
pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI layer, gzip compressed tar.
pub const IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker manifest list (equivalent to the OCI image index).
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker schema 2 manifest (equivalent to the OCI image manifest).
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker container config (equivalent to the OCI image config).
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Docker layer, gzip compressed tar.
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Error classifying a payload.
#[derive(Debug, thiserror::Error)]
pub enum MediaTypeError {
    /// The payload is not a JSON document.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload parsed, but matched none of the known shapes.
    #[error("not able to determine media type")]
    Unknown,
}

/// The role a media type plays in the manifest graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// A manifest of manifests.
    Index,
    /// A single platform's manifest.
    Manifest,
    /// An image config.
    Config,
    /// Anything else: layers and unknown blobs.
    Layer,
}

impl MediaKind {
    /// Classify a media type string. OCI and Docker spellings are equivalent.
    pub fn classify(media_type: &str) -> Self {
        match media_type {
            IMAGE_INDEX | DOCKER_MANIFEST_LIST => MediaKind::Index,
            IMAGE_MANIFEST | DOCKER_MANIFEST => MediaKind::Manifest,
            IMAGE_CONFIG | DOCKER_CONFIG => MediaKind::Config,
            _ => MediaKind::Layer,
        }
    }
}

// Only the presence of these fields matters, so they stay raw.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnknownDocument {
    #[serde(default)]
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
    config: Option<serde_json::Value>,
    layers: Option<serde_json::Value>,
    architecture: Option<serde_json::Value>,
    os: Option<serde_json::Value>,
    rootfs: Option<serde_json::Value>,
}

/// Determine the media type of a payload stored without one.
///
/// An explicit `mediaType` field wins. Otherwise the set of top-level fields
/// decides: `manifests` makes an index, `config` with `layers` a manifest,
/// and `architecture`, `os` or `rootfs` a config.
///
/// ```
/// use oci_driver::{determine_media_type, media_type};
///
/// let index = br#"{"schemaVersion": 2, "manifests": []}"#;
/// assert_eq!(determine_media_type(index).unwrap(), media_type::IMAGE_INDEX);
/// assert!(determine_media_type(b"{}").is_err());
/// ```
pub fn determine_media_type(blob: &[u8]) -> Result<String, MediaTypeError> {
    let document: UnknownDocument = serde_json::from_slice(blob)?;

    if let Some(media_type) = document.media_type.filter(|mt| !mt.is_empty()) {
        return Ok(media_type);
    }

    if document.manifests.is_some() {
        return Ok(IMAGE_INDEX.to_owned());
    }

    if document.config.is_some() && document.layers.is_some() {
        return Ok(IMAGE_MANIFEST.to_owned());
    }

    if document.layers.is_none()
        && (document.architecture.is_some() || document.os.is_some() || document.rootfs.is_some())
    {
        return Ok(IMAGE_CONFIG.to_owned());
    }

    Err(MediaTypeError::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_index_without_media_type() {
        let blob = br#"{
            "schemaVersion": 2,
            "manifests": [
                {"digest": "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae", "size": 3}
            ]
        }"#;
        assert_eq!(determine_media_type(blob).unwrap(), IMAGE_INDEX);
    }

    #[test]
    fn sniff_manifest_without_media_type() {
        let blob = br#"{"schemaVersion": 2, "config": {}, "layers": []}"#;
        assert_eq!(determine_media_type(blob).unwrap(), IMAGE_MANIFEST);
    }

    #[test]
    fn sniff_config() {
        let blob = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/usr/bin"]},
            "rootfs": {"type": "layers", "diff_ids": []}
        }"#;
        assert_eq!(determine_media_type(blob).unwrap(), IMAGE_CONFIG);
    }

    #[test]
    fn explicit_media_type_wins() {
        let blob = format!(r#"{{"mediaType": "{DOCKER_MANIFEST_LIST}", "manifests": []}}"#);
        assert_eq!(
            determine_media_type(blob.as_bytes()).unwrap(),
            DOCKER_MANIFEST_LIST
        );
    }

    #[test]
    fn empty_object_is_unknown() {
        let err = determine_media_type(b"{}").unwrap_err();
        assert!(matches!(err, MediaTypeError::Unknown));
        assert_eq!(err.to_string(), "not able to determine media type");
    }

    #[test]
    fn config_alone_is_not_a_manifest() {
        assert!(matches!(
            determine_media_type(br#"{"config": {}}"#),
            Err(MediaTypeError::Unknown)
        ));
    }

    #[test]
    fn binary_is_not_json() {
        assert!(matches!(
            determine_media_type(b"\x1f\x8b\x08\x00"),
            Err(MediaTypeError::Json(_))
        ));
        assert!(matches!(
            determine_media_type(b"[1, 2]"),
            Err(MediaTypeError::Json(_))
        ));
    }

    #[test]
    fn classify_docker_and_oci() {
        assert_eq!(MediaKind::classify(IMAGE_INDEX), MediaKind::Index);
        assert_eq!(MediaKind::classify(DOCKER_MANIFEST_LIST), MediaKind::Index);
        assert_eq!(MediaKind::classify(DOCKER_MANIFEST), MediaKind::Manifest);
        assert_eq!(MediaKind::classify(DOCKER_CONFIG), MediaKind::Config);
        assert_eq!(MediaKind::classify(IMAGE_LAYER_GZIP), MediaKind::Layer);
        assert_eq!(MediaKind::classify(""), MediaKind::Layer);
    }
}
