use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
use parking_lot::RwLock;

use oci_driver::{
    determine_media_type, Blob, Content, Descriptor, Digest, Driver, Image, RawManifest,
    StoreError, StoreErrorKind,
};

#[derive(Debug, Default)]
struct Record {
    descriptors: HashMap<Digest, Descriptor>,
    blobs: HashMap<Digest, Bytes>,
    tags: HashMap<String, Digest>,
    images: Vec<Image>,
}

/// Content store that keeps everything in memory.
///
/// Used to seed fixtures in tests. Reads take a shared lock over the whole
/// record and writes an exclusive one, so a reader never observes a
/// descriptor without its blob. There are no live updates.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: RwLock<Record>,
}

impl MemoryStore {
    /// Create an empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an image, and its tag name when it has one.
    ///
    /// An image with the same tag name replaces the previous one.
    pub fn add_image(&self, image: Image) {
        let mut record = self.record.write();

        let tag_name = image.tag_name();
        record
            .images
            .retain(|known| *known != image && (tag_name.is_none() || known.tag_name() != tag_name));

        if let (Some(tag_name), Some(digest)) = (tag_name, image.digest.clone()) {
            record.tags.insert(tag_name, digest);
        }
        record.images.push(image);
    }

    /// Store bytes under an explicit descriptor.
    ///
    /// The descriptor may lack a media type, as legacy content does. Bytes
    /// that do not hash to the descriptor's digest are rejected.
    pub fn write(&self, descriptor: Descriptor, data: impl Into<Bytes>) -> Result<(), StoreError> {
        let data = data.into();
        if !descriptor.digest.verify(&data) || descriptor.size != data.len() as u64 {
            return Err(StoreError::builder(
                self.name(),
                StoreErrorKind::InvalidRequest,
                format!(
                    "content of {} bytes does not match descriptor of {} bytes",
                    data.len(),
                    descriptor.size
                ),
            )
            .digest(&descriptor.digest)
            .context("write")
            .build());
        }

        let mut record = self.record.write();
        record.blobs.insert(descriptor.digest.clone(), data);
        record.descriptors.insert(descriptor.digest.clone(), descriptor);
        Ok(())
    }

    /// Store bytes under their sha256 digest.
    ///
    /// Documents recognizable as an index, manifest or config get a
    /// descriptor with the detected media type; anything else is stored as a
    /// bare blob.
    pub fn add_blob(&self, data: impl Into<Bytes>) -> Digest {
        let data = data.into();
        let digest = Digest::from_bytes(&data);
        let descriptor = determine_media_type(&data)
            .ok()
            .map(|media_type| Descriptor::for_bytes(media_type, &data));

        let mut record = self.record.write();
        if let Some(descriptor) = descriptor {
            record.descriptors.insert(digest.clone(), descriptor);
        }
        record.blobs.insert(digest.clone(), data);
        digest
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn verify(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        Ok(self.record.read().images.clone())
    }

    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        self.record
            .read()
            .tags
            .get(tag_name)
            .cloned()
            .ok_or_else(|| {
                StoreError::builder(
                    self.name(),
                    StoreErrorKind::NotFound,
                    format!("could not resolve tag {tag_name} to a digest"),
                )
                .reference(tag_name)
                .build()
            })
    }

    async fn list_contents(&self) -> Result<Vec<Content>, StoreError> {
        let mut contents: Vec<Content> = self
            .record
            .read()
            .blobs
            .keys()
            .cloned()
            .map(Content::from)
            .collect();
        contents.sort();
        Ok(contents)
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        self.record
            .read()
            .blobs
            .get(digest)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StoreError::not_found(self.name(), digest, "size information"))
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        let record = self.record.read();
        match (record.descriptors.get(digest), record.blobs.get(digest)) {
            (Some(descriptor), Some(data)) => Ok(RawManifest {
                data: data.clone(),
                media_type: descriptor.media_type.clone(),
            }),
            _ => Err(StoreError::not_found(self.name(), digest, "manifest")),
        }
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        let data = self
            .record
            .read()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::not_found(self.name(), digest, "blob"))?;

        Ok(Box::new(Cursor::new(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_driver::media_type;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn image(reference: &str, digest: &Digest) -> Image {
        Image::parse_require_digest(reference, digest.clone()).unwrap()
    }

    #[tokio::test]
    async fn add_blob_sniffs_documents() {
        let store = MemoryStore::new();
        let index = store.add_blob(r#"{"schemaVersion":2,"manifests":[]}"#);
        let layer = store.add_blob(&b"\x1f\x8b layer bytes"[..]);

        let manifest = store.get_manifest(&index).await.unwrap();
        assert_eq!(manifest.media_type, media_type::IMAGE_INDEX);

        let err = store.get_manifest(&layer).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.size(&layer).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn write_keeps_empty_media_type() {
        let store = MemoryStore::new();
        let data = br#"{"manifests":[]}"#;
        store.write(Descriptor::for_bytes("", data), &data[..]).unwrap();

        let manifest = store.get_manifest(&Digest::from_bytes(data)).await.unwrap();
        assert_eq!(manifest.media_type, "");
        assert_eq!(&manifest.data[..], data);
    }

    #[tokio::test]
    async fn write_rejects_mismatched_digest() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::for_bytes(media_type::IMAGE_CONFIG, b"one");
        let err = store.write(descriptor, &b"two"[..]).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::InvalidRequest);
        assert!(store.list_contents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_tags() {
        let store = MemoryStore::new();
        let first = Digest::from_string("first");
        let second = Digest::from_string("second");

        store.add_image(image("example.com/org/app:v1", &first));
        assert_eq!(store.resolve("example.com/org/app:v1").await.unwrap(), first);

        store.add_image(image("example.com/org/app:v1", &second));
        assert_eq!(store.resolve("example.com/org/app:v1").await.unwrap(), second);
        assert_eq!(store.list_images().await.unwrap().len(), 1);

        let err = store.resolve("example.com/org/app:v2").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.reference(), Some("example.com/org/app:v2"));
    }

    #[tokio::test]
    async fn blob_supports_seeking() {
        let store = MemoryStore::new();
        let digest = store.add_blob(&b"0123456789"[..]);

        let mut blob = store.get_blob(&digest).await.unwrap();
        blob.seek(std::io::SeekFrom::Start(6)).await.unwrap();
        let mut tail = String::new();
        blob.read_to_string(&mut tail).await.unwrap();
        assert_eq!(tail, "6789");
    }

    #[tokio::test]
    async fn concurrent_reads_and_writes() {
        let store = std::sync::Arc::new(MemoryStore::new());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let digest = store.add_blob(format!("blob {i}"));
                store.size(&digest).await.unwrap()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap() >= 6);
        }
        assert_eq!(store.list_contents().await.unwrap().len(), 16);
    }
}
