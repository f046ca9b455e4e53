//! # OCI content stores
//!
//! The backends a node mirrors image content from, the [`Store`] handle that
//! unifies them, and the [`Walker`] that enumerates an image's digests.

use std::future::Future;
use std::sync::Arc;
#[cfg(feature = "containerd")]
use std::time::Duration;

use bytes::Bytes;
#[cfg(any(feature = "local", feature = "containerd"))]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "containerd")]
pub(crate) mod containerd;
#[cfg(any(feature = "local", feature = "runtime"))]
mod fs;
#[cfg(feature = "local")]
pub(crate) mod local;
#[cfg(any(feature = "local", feature = "runtime"))]
mod media;
pub(crate) mod memory;
#[cfg(feature = "runtime")]
pub(crate) mod runtime;
#[cfg(feature = "tmp")]
pub(crate) mod temp;
mod walk;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::{LocalStore, CONTAINERD_NAME_ANNOTATION, REF_NAME_ANNOTATION};

#[doc(inline)]
pub use memory::MemoryStore;

#[cfg(feature = "runtime")]
#[doc(inline)]
pub use runtime::{
    ImageRecord, RuntimeClient, RuntimeStore, DEFAULT_NAMESPACE, DEFAULT_POLL_INTERVAL,
};

#[cfg(feature = "containerd")]
#[doc(inline)]
pub use containerd::{Containerd, DEFAULT_ADDRESS};

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempStore;

pub use walk::{walk_image, PlatformMatcher, Walker, DEFAULT_MAX_MANIFESTS};

#[doc(inline)]
pub use oci_driver::{
    Blob, Content, Digest, Driver, EventStream, Image, RawManifest, StoreError, StoreErrorKind,
};

/// Selects and configures a store backend.
///
/// ```toml
/// [store.runtime]
/// address = "/run/containerd/containerd.sock"
/// namespace = "k8s.io"
/// content-path = "/var/lib/containerd/io.containerd.content.v1.content"
/// poll-interval-secs = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreConfig {
    /// An empty in-memory store.
    Memory,

    /// The node-local image layout mirror.
    #[cfg(feature = "local")]
    Local {
        /// Layout directory, created if missing.
        path: Utf8PathBuf,
    },

    /// An image layout in a temporary directory.
    #[cfg(feature = "tmp")]
    Temp,

    /// The images and content of a containerd daemon.
    #[cfg(feature = "containerd")]
    #[serde(rename_all = "kebab-case")]
    Runtime {
        /// The daemon's unix socket.
        #[serde(default = "default_address")]
        address: Utf8PathBuf,

        /// Read content from this directory instead of the content service.
        #[serde(default)]
        content_path: Option<Utf8PathBuf>,

        /// Runtime namespace to observe.
        #[serde(default = "default_namespace")]
        namespace: String,

        /// Seconds between image list polls for live updates.
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
    },
}

#[cfg(feature = "containerd")]
fn default_address() -> Utf8PathBuf {
    DEFAULT_ADDRESS.into()
}

#[cfg(feature = "containerd")]
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

#[cfg(feature = "containerd")]
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

impl StoreConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Store, StoreError> {
        let store: Store = match self {
            StoreConfig::Memory => MemoryStore::new().into(),
            #[cfg(feature = "local")]
            StoreConfig::Local { path } => LocalStore::init(path).await?.into(),
            #[cfg(feature = "tmp")]
            StoreConfig::Temp => TempStore::new().await?.into(),
            #[cfg(feature = "containerd")]
            StoreConfig::Runtime {
                address,
                content_path,
                namespace,
                poll_interval_secs,
            } => {
                let client = Containerd::connect(&address).await?;
                let mut store = RuntimeStore::new(Arc::new(client))
                    .with_namespace(namespace)
                    .with_poll_interval(Duration::from_secs(poll_interval_secs));
                if let Some(path) = content_path {
                    store = store.with_content_path(path);
                }
                store.into()
            }
        };
        Ok(store)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// Cloneable handle to a store backend.
///
/// Every operation races the handle's cancellation token and fails with
/// [`StoreErrorKind::Cancelled`] once it fires.
///
/// ```
/// # #[tokio::main]
/// # async fn main() -> Result<(), oci_store::StoreError> {
/// use oci_store::{MemoryStore, Store};
///
/// let config = &br#"{"architecture": "amd64", "os": "linux"}"#[..];
/// let memory = MemoryStore::new();
/// let digest = memory.add_blob(config);
///
/// let store = Store::new(memory);
/// store.verify().await?;
/// assert_eq!(store.size(&digest).await?, config.len() as u64);
///
/// let manifest = store.get_manifest(&digest).await?;
/// assert_eq!(manifest.media_type, "application/vnd.oci.image.config.v1+json");
/// assert_eq!(&store.read_blob(&digest).await?[..], config);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    driver: ArcDriver,
    cancel: CancellationToken,
    walker: Walker,
}

impl<D> From<D> for Store
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Store::new(value)
    }
}

impl Store {
    /// Wrap a backend.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            cancel: CancellationToken::new(),
            walker: Walker::default(),
        }
    }

    /// Use `cancel` to abort this handle's operations.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use `walker` for [`Store::walk`].
    pub fn with_walker(mut self, walker: Walker) -> Self {
        self.walker = walker;
        self
    }

    /// The token that cancels this handle's operations.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The backend's name.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    async fn cancellable<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!("Store operation cancelled");
                Err(StoreError::cancelled(self.name()))
            }
            result = operation => result,
        }
    }

    /// Check that the backend is reachable and able to serve.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn verify(&self) -> Result<(), StoreError> {
        self.cancellable(self.driver.verify()).await
    }

    /// Whether [`Store::subscribe`] can produce live updates.
    pub fn supports_events(&self) -> bool {
        self.driver.supports_events()
    }

    /// Subscribe to content changes, if the backend has any to offer.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        self.cancellable(self.driver.subscribe()).await
    }

    /// Every image the backend knows by name.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        self.cancellable(self.driver.list_images()).await
    }

    /// The digest `tag_name` currently points at.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        self.cancellable(self.driver.resolve(tag_name)).await
    }

    /// Every digest the backend holds.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list_contents(&self) -> Result<Vec<Content>, StoreError> {
        self.cancellable(self.driver.list_contents()).await
    }

    /// Size in bytes of the content stored under `digest`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %digest))]
    pub async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        self.cancellable(self.driver.size(digest)).await
    }

    /// The bytes and media type of an index, manifest or config.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %digest))]
    pub async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        self.cancellable(self.driver.get_manifest(digest)).await
    }

    /// Open the content stored under `digest` for reading.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %digest))]
    pub async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        self.cancellable(self.driver.get_blob(digest)).await
    }

    /// Read a whole blob into memory.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %digest))]
    pub async fn read_blob(&self, digest: &Digest) -> Result<Bytes, StoreError> {
        self.cancellable(async {
            let mut blob = self.driver.get_blob(digest).await?;
            let mut data = Vec::new();
            blob.read_to_end(&mut data).await.map_err(|err| {
                StoreError::builder(self.name(), StoreErrorKind::BackendUnavailable, err)
                    .digest(digest)
                    .context("reading blob")
                    .build()
            })?;
            tracing::trace!(size = data.len(), "Read blob");
            Ok(data.into())
        })
        .await
    }

    /// Enumerate the digests of `image` with this handle's walker.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %image))]
    pub async fn walk(&self, image: &Image) -> Result<Vec<Digest>, StoreError> {
        self.cancellable(self.walker.walk(&*self.driver, image)).await
    }
}
