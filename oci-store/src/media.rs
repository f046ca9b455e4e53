use std::collections::{HashMap, HashSet};
use std::future::Future;

use bytes::Bytes;
use parking_lot::RwLock;

use oci_driver::{
    determine_media_type, Descriptor, Digest, ImageIndex, ImageManifest, MediaKind, StoreError,
};

/// Media types learned from the descriptors that point at content.
///
/// A content-addressed directory keeps bytes only. The media type a blob was
/// published with lives in whichever image record, index or manifest
/// references it, so that is where it is looked up.
#[derive(Debug, Default)]
pub(crate) struct MediaTypes {
    known: RwLock<HashMap<Digest, String>>,
}

impl MediaTypes {
    /// Remember the media type `descriptor` gives its digest. Descriptors
    /// without one teach nothing.
    pub(crate) fn record(&self, descriptor: &Descriptor) {
        if !descriptor.media_type.is_empty() {
            self.known
                .write()
                .insert(descriptor.digest.clone(), descriptor.media_type.clone());
        }
    }

    pub(crate) fn get(&self, digest: &Digest) -> Option<String> {
        self.known.read().get(digest).cloned()
    }

    /// Follow `roots` through every index and manifest that `read` can
    /// produce, recording the media type of each child descriptor.
    ///
    /// Each digest is read at most once per call. Missing or unparsable
    /// documents end their branch without failing the scan.
    pub(crate) async fn learn<F, Fut>(&self, roots: Vec<Descriptor>, read: F) -> Result<(), StoreError>
    where
        F: Fn(Digest) -> Fut,
        Fut: Future<Output = Result<Bytes, StoreError>>,
    {
        let mut pending = roots;
        let mut seen = HashSet::new();

        while let Some(descriptor) = pending.pop() {
            if !seen.insert(descriptor.digest.clone()) {
                continue;
            }
            self.record(&descriptor);

            let data = match read(descriptor.digest.clone()).await {
                Ok(data) => data,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };

            let media_type = if descriptor.media_type.is_empty() {
                match determine_media_type(&data) {
                    Ok(media_type) => media_type,
                    Err(_) => continue,
                }
            } else {
                descriptor.media_type
            };

            match MediaKind::classify(&media_type) {
                MediaKind::Index => {
                    if let Ok(index) = serde_json::from_slice::<ImageIndex>(&data) {
                        pending.extend(index.manifests);
                    }
                }
                MediaKind::Manifest => {
                    if let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&data) {
                        self.record(&manifest.config);
                        for layer in &manifest.layers {
                            self.record(layer);
                        }
                    }
                }
                MediaKind::Config | MediaKind::Layer => {}
            }
        }

        tracing::trace!(known = self.known.read().len(), "Learned media types");
        Ok(())
    }
}

/// The media type `get_manifest` reports for `data`: the recorded one, or
/// empty for content published without one, as the in-memory store does.
///
/// Bytes that are not an index, manifest or config document are not a
/// manifest at all.
pub(crate) fn manifest_media_type(
    engine: &'static str,
    digest: &Digest,
    data: &[u8],
    recorded: Option<String>,
) -> Result<String, StoreError> {
    determine_media_type(data).map_err(|error| {
        tracing::trace!(%digest, %error, "Blob is not a manifest");
        StoreError::not_found(engine, digest, "manifest")
    })?;

    Ok(recorded.unwrap_or_default())
}
