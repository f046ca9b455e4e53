use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::{Content, Digest, EventStream, Image, StoreError};

/// A readable, seekable blob stream. Dropping it closes it.
pub trait BlobRead: AsyncRead + AsyncSeek + Unpin + Send + Sync {}

impl<T> BlobRead for T where T: AsyncRead + AsyncSeek + Unpin + Send + Sync {}

/// A blob opened for reading, supporting random access.
pub type Blob = Box<dyn BlobRead>;

/// The bytes of a manifest, index or config, with its media type.
///
/// The media type may be empty for content published without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    /// The raw document.
    pub data: Bytes,

    /// The media type recorded for the document.
    pub media_type: String,
}

/// A content store backend.
///
/// Every backend exposes the same read semantics. All methods may be called
/// concurrently. A digest that is absent, or that has no descriptor where one
/// is required, is reported as [`StoreErrorKind::NotFound`](crate::StoreErrorKind::NotFound).
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the backend, for logs.
    fn name(&self) -> &'static str;

    /// Check that the backend can currently serve requests.
    async fn verify(&self) -> Result<(), StoreError>;

    /// Whether [`Driver::subscribe`] produces live updates.
    fn supports_events(&self) -> bool {
        false
    }

    /// Subscribe to content change events.
    ///
    /// `Ok(None)` means the backend has no live updates to offer.
    async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        Ok(None)
    }

    /// List every image the backend knows about.
    async fn list_images(&self) -> Result<Vec<Image>, StoreError>;

    /// Resolve a `registry/repository:tag` name to a digest.
    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError>;

    /// List every digest the backend holds.
    async fn list_contents(&self) -> Result<Vec<Content>, StoreError>;

    /// The size in bytes of a blob.
    async fn size(&self, digest: &Digest) -> Result<u64, StoreError>;

    /// Fetch a manifest, index or config document with its media type.
    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError>;

    /// Open any blob for reading.
    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn verify(&self) -> Result<(), StoreError> {
        self.deref().verify().await
    }

    fn supports_events(&self) -> bool {
        self.deref().supports_events()
    }

    async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        self.deref().subscribe().await
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        self.deref().list_images().await
    }

    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        self.deref().resolve(tag_name).await
    }

    async fn list_contents(&self) -> Result<Vec<Content>, StoreError> {
        self.deref().list_contents().await
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        self.deref().size(digest).await
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        self.deref().get_manifest(digest).await
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        self.deref().get_blob(digest).await
    }
}

#[async_trait::async_trait]
impl<D> Driver for &D
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn verify(&self) -> Result<(), StoreError> {
        (**self).verify().await
    }

    fn supports_events(&self) -> bool {
        (**self).supports_events()
    }

    async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        (**self).subscribe().await
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        (**self).list_images().await
    }

    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        (**self).resolve(tag_name).await
    }

    async fn list_contents(&self) -> Result<Vec<Content>, StoreError> {
        (**self).list_contents().await
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        (**self).size(digest).await
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        (**self).get_manifest(digest).await
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        (**self).get_blob(digest).await
    }
}
