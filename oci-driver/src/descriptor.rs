use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Digest;

/// An OCI content descriptor: the digest, media type and size of one
/// content-addressed object.
///
/// Legacy content may be published without a media type; in that case
/// `media_type` is empty and the kind must be sniffed from the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content, possibly empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    /// Digest of the referenced content.
    pub digest: Digest,

    /// Size of the referenced content in bytes.
    pub size: u64,

    /// Platform qualifier, only meaningful for entries of an image index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Describe `data` with the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::from_bytes(data),
            size: data.len() as u64,
            platform: None,
            annotations: None,
        }
    }

    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }
}

/// A platform an image variant was built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, in OCI naming (`amd64`, `arm64`, ...).
    pub architecture: String,

    /// Operating system (`linux`, `windows`, ...).
    pub os: String,

    /// CPU variant (`v7`, `v8`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Construct a platform from its OS and architecture.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            variant: None,
        }
    }

    /// Set the CPU variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// The platform of the current process.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, host_arch())
    }

    /// Whether content built for `self` can run on `target`.
    ///
    /// OS and architecture must be equal. A variant only constrains the match
    /// when both sides specify one.
    pub fn matches(&self, target: &Platform) -> bool {
        self.os == target.os
            && self.architecture == target.architecture
            && match (&self.variant, &target.variant) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI platform names.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// A digest held by a store, independent of whether any image references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Content {
    /// The content digest.
    pub digest: Digest,
}

impl From<Digest> for Content {
    fn from(digest: Digest) -> Self {
        Self { digest }
    }
}

/// An image manifest: one platform's config plus its ordered layers.
///
/// Covers both the OCI manifest and the Docker schema 2 manifest, which
/// share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2 for the formats understood here.
    #[serde(default)]
    pub schema_version: u32,

    /// Media type, absent on legacy manifests.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    /// The image config.
    pub config: Descriptor,

    /// Layers, base first.
    pub layers: Vec<Descriptor>,
}

/// An image index: a manifest of platform-specific manifests.
///
/// Covers both the OCI index and the Docker manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2 for the formats understood here.
    #[serde(default)]
    pub schema_version: u32,

    /// Media type, absent on legacy indexes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    /// The platform-specific entries, in published order.
    pub manifests: Vec<Descriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_variant_only_constrains_when_both_present() {
        let armv7 = Platform::new("linux", "arm").with_variant("v7");
        let arm = Platform::new("linux", "arm");
        let armv6 = Platform::new("linux", "arm").with_variant("v6");

        assert!(armv7.matches(&arm));
        assert!(arm.matches(&armv7));
        assert!(!armv7.matches(&armv6));
        assert!(!arm.matches(&Platform::new("linux", "arm64")));
        assert!(!arm.matches(&Platform::new("windows", "arm")));
    }

    #[test]
    fn host_platform_uses_oci_names() {
        let host = Platform::host();
        assert_ne!(host.architecture, "x86_64");
        assert_ne!(host.architecture, "aarch64");
    }

    #[test]
    fn descriptor_without_media_type() {
        let json = r#"{"digest":"sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae","size":3}"#;
        let descriptor: Descriptor = serde_json::from_str(json).unwrap();
        assert!(descriptor.media_type.is_empty());
        assert_eq!(descriptor, Descriptor::for_bytes("", b"foo"));
        assert_eq!(serde_json::to_string(&descriptor).unwrap(), json);
    }

    #[test]
    fn index_entries_keep_platforms() {
        let json = r#"{
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
                    "size": 3,
                    "platform": {"architecture": "arm", "os": "linux", "variant": "v7"}
                }
            ]
        }"#;
        let index: ImageIndex = serde_json::from_str(json).unwrap();
        assert!(index.media_type.is_empty());
        assert_eq!(
            index.manifests[0].platform.as_ref().unwrap().to_string(),
            "linux/arm/v7"
        );
    }
}
