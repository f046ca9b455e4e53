use std::{fmt, str::FromStr};

use crate::{Digest, DigestError, Platform};

const DEFAULT_REGISTRY: &str = "docker.io";
const OFFICIAL_NAMESPACE: &str = "library";
const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// Error parsing an image reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// The reference was empty.
    #[error("image reference is empty")]
    Empty,

    /// The registry component is malformed.
    #[error("invalid registry in reference {0:?}")]
    InvalidRegistry(String),

    /// The repository path is malformed.
    #[error("invalid repository in reference {0:?}")]
    InvalidRepository(String),

    /// The tag is malformed.
    #[error("invalid tag in reference {0:?}")]
    InvalidTag(String),

    /// The digest embedded in the reference is malformed.
    #[error("invalid digest in reference: {0}")]
    InvalidDigest(#[from] DigestError),

    /// The reference embeds a digest that disagrees with the one supplied.
    #[error("digest {expected} does not match digest {actual} in reference {reference:?}")]
    DigestMismatch {
        /// The reference as given.
        reference: String,
        /// The digest supplied by the caller.
        expected: Digest,
        /// The digest found in the reference.
        actual: Digest,
    },
}

/// A parsed image reference, optionally pinned to a digest.
///
/// Parsing follows Docker's conventions: the first path component names the
/// registry only when it looks like a host (contains `.` or `:`, or is
/// `localhost`); otherwise the registry is `docker.io`, and single-component
/// repositories there live under `library/`.
///
/// ```
/// use oci_driver::Image;
///
/// let image = Image::parse("ghcr.io/example-org/mirror:v1.4.2").unwrap();
/// assert_eq!(image.registry, "ghcr.io");
/// assert_eq!(image.repository, "example-org/mirror");
/// assert_eq!(image.tag_name().as_deref(), Some("ghcr.io/example-org/mirror:v1.4.2"));
///
/// let image = Image::parse("busybox").unwrap();
/// assert_eq!(image.to_string(), "docker.io/library/busybox");
/// assert_eq!(image.tag_name(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    /// Registry host, with optional port.
    pub registry: String,

    /// Repository path within the registry.
    pub repository: String,

    /// Tag, if the reference named one.
    pub tag: Option<String>,

    /// Content digest of the image's root manifest or index.
    pub digest: Option<Digest>,

    /// Platform qualifier, for references pinned to one variant.
    pub platform: Option<Platform>,
}

impl Image {
    /// Parse a `registry/repository[:tag][@digest]` reference.
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (reference, None),
        };

        // A ':' after the last '/' starts the tag; earlier ones belong to a port.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], Some(&name[last_slash + i + 1..])),
            None => (name, None),
        };

        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(ReferenceError::InvalidTag(reference.to_owned()));
            }
        }

        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(ReferenceError::InvalidRepository(reference.to_owned()));
        }

        let (registry, repository) = split_registry(name);
        if !valid_registry(registry) {
            return Err(ReferenceError::InvalidRegistry(reference.to_owned()));
        }
        if !repository.split('/').all(valid_path_component) {
            return Err(ReferenceError::InvalidRepository(reference.to_owned()));
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{repository}")
        } else {
            repository.to_owned()
        };

        Ok(Image {
            registry: registry.to_owned(),
            repository,
            tag: tag.map(str::to_owned),
            digest,
            platform: None,
        })
    }

    /// Parse a reference and pin it to `digest`.
    ///
    /// The supplied digest is authoritative: it is attached even when the
    /// reference carries none, and a reference carrying a different digest
    /// is rejected rather than silently overridden.
    pub fn parse_require_digest(reference: &str, digest: Digest) -> Result<Self, ReferenceError> {
        let mut image = Image::parse(reference)?;
        if let Some(actual) = image.digest.take() {
            if actual != digest {
                return Err(ReferenceError::DigestMismatch {
                    reference: reference.to_owned(),
                    expected: digest,
                    actual,
                });
            }
        }
        image.digest = Some(digest);
        Ok(image)
    }

    /// Qualify this image with a platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// The canonical `registry/repository:tag` name, used as the key for tag
    /// resolution. `None` for digest-only references.
    pub fn tag_name(&self) -> Option<String> {
        match self.tag.as_deref() {
            Some(tag) if !tag.is_empty() && !self.registry.is_empty() && !self.repository.is_empty() => {
                Some(format!("{}/{}:{}", self.registry, self.repository, tag))
            }
            _ => None,
        }
    }
}

impl FromStr for Image {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Image::parse(s)
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn split_registry(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first, rest)
        }
        _ => (DEFAULT_REGISTRY, name),
    }
}

fn valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };
    let host_ok = !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    let port_ok = port.map_or(true, |p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    host_ok && port_ok
}

// component := alnum+ (separator alnum+)*, separator := "." | "_" | "__" | "-"+
fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if bytes.is_empty() {
        return false;
    }

    let mut i = 0;
    loop {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_lowercase() || bytes[i].is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return false;
        }
        if i == bytes.len() {
            return true;
        }

        let start = i;
        while i < bytes.len() && matches!(bytes[i], b'.' | b'_' | b'-') {
            i += 1;
        }
        let separator = &component[start..i];
        let ok = matches!(separator, "." | "_" | "__")
            || (!separator.is_empty() && separator.bytes().all(|b| b == b'-'));
        if !ok {
            return false;
        }
    }
}

fn valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();
    let first_ok = bytes
        .next()
        .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_');
    first_ok
        && tag.len() <= MAX_TAG_LENGTH
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}
