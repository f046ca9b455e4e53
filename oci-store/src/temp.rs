use std::ops::Deref;

use camino::Utf8Path;
use tempfile::TempDir;

use crate::local::LocalStore;
use oci_driver::{
    Blob, Content, Digest, Driver, EventStream, Image, RawManifest, StoreError, StoreErrorKind,
};

/// A [`LocalStore`] in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempStore {
    #[allow(unused)]
    dir: TempDir,
    store: LocalStore,
}

impl TempStore {
    /// Create an empty image layout in a fresh temporary directory.
    pub async fn new() -> Result<Self, StoreError> {
        let dir = TempDir::new().map_err(StoreError::with("temp", StoreErrorKind::BackendUnavailable))?;
        let root = Utf8Path::from_path(dir.path())
            .ok_or_else(|| {
                StoreError::new(
                    "temp",
                    StoreErrorKind::BackendUnavailable,
                    format!("temporary directory {} is not utf-8", dir.path().display()),
                )
            })?
            .to_owned();

        let store = LocalStore::init(root).await?;
        Ok(Self { dir, store })
    }
}

impl Deref for TempStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

#[async_trait::async_trait]
impl Driver for TempStore {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn verify(&self) -> Result<(), StoreError> {
        self.store.verify().await
    }

    fn supports_events(&self) -> bool {
        self.store.supports_events()
    }

    async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        self.store.subscribe().await
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        self.store.list_images().await
    }

    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        self.store.resolve(tag_name).await
    }

    async fn list_contents(&self) -> Result<Vec<Content>, StoreError> {
        self.store.list_contents().await
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        self.store.size(digest).await
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        self.store.get_manifest(digest).await
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        self.store.get_blob(digest).await
    }
}
