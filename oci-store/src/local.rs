use std::collections::BTreeMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::sync::{broadcast, Mutex};

use oci_driver::{
    determine_media_type, Blob, Content, Descriptor, Digest, Driver, Event, EventStream, Image,
    ImageIndex, RawManifest, StoreError, StoreErrorKind,
};

use crate::fs::BlobDir;
use crate::media::{manifest_media_type, MediaTypes};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Annotation holding the reference an index entry was tagged with.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Annotation containerd uses for the full image name.
pub const CONTAINERD_NAME_ANNOTATION: &str = "io.containerd.image.name";

const EVENT_CAPACITY: usize = 64;

/// The node-local mirror, kept as an OCI image-layout directory.
///
/// ```text
/// <root>/oci-layout
/// <root>/index.json
/// <root>/blobs/<algorithm>/<encoded>
/// ```
///
/// Images are the entries of `index.json` that carry a name annotation.
/// Media types are those of the descriptors that reference the content,
/// starting from `index.json`.
#[derive(Debug)]
pub struct LocalStore {
    root: Utf8PathBuf,
    blobs: BlobDir,
    index: Mutex<()>,
    events: broadcast::Sender<Event>,
    media_types: MediaTypes,
}

impl LocalStore {
    /// Open the layout at `root`. Nothing is read until first use.
    pub fn new(root: Utf8PathBuf) -> Self {
        let blobs = BlobDir::new("local", root.join("blobs"));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            root,
            blobs,
            index: Mutex::new(()),
            events,
            media_types: MediaTypes::default(),
        }
    }

    /// Create an empty layout at `root` if there is none yet, and open it.
    pub async fn init(root: Utf8PathBuf) -> Result<Self, StoreError> {
        let store = Self::new(root);

        async {
            tokio::fs::create_dir_all(store.root.join("blobs"))
                .await
                .wrap_err("create layout directory")?;
            if !tokio::fs::try_exists(store.root.join(LAYOUT_FILE)).await? {
                tokio::fs::write(store.root.join(LAYOUT_FILE), LAYOUT_VERSION)
                    .await
                    .wrap_err("write layout marker")?;
            }
            Ok::<_, eyre::Report>(())
        }
        .await
        .map_err(StoreError::with("local", StoreErrorKind::BackendUnavailable))?;

        if !tokio::fs::try_exists(store.root.join(INDEX_FILE))
            .await
            .map_err(StoreError::with("local", StoreErrorKind::BackendUnavailable))?
        {
            store.write_index(&empty_index()).await?;
        }

        Ok(store)
    }

    /// The layout directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    async fn read_index(&self) -> Result<ImageIndex, StoreError> {
        let data = tokio::fs::read(self.root.join(INDEX_FILE))
            .await
            .map_err(|err| {
                StoreError::builder(self.name(), StoreErrorKind::BackendUnavailable, err)
                    .context("reading index.json")
                    .build()
            })?;

        serde_json::from_slice(&data).map_err(|err| {
            StoreError::builder(self.name(), StoreErrorKind::MalformedContent, err)
                .context("parsing index.json")
                .build()
        })
    }

    async fn write_index(&self, index: &ImageIndex) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(index).map_err(|err| {
            StoreError::builder(self.name(), StoreErrorKind::MalformedContent, err)
                .context("serializing index.json")
                .build()
        })?;

        let staging = self.root.join(".index.json.tmp");
        async {
            tokio::fs::write(&staging, &data)
                .await
                .wrap_err("write staging index")?;
            tokio::fs::rename(&staging, self.root.join(INDEX_FILE))
                .await
                .wrap_err("rename staging index")?;
            Ok::<_, eyre::Report>(())
        }
        .await
        .map_err(|err| {
            StoreError::builder(self.name(), StoreErrorKind::BackendUnavailable, err)
                .context("writing index.json")
                .build()
        })
    }

    /// Add a blob to the layout, returning its descriptor.
    ///
    /// The media type is detected from the bytes and left empty for layers.
    /// Subscribers see a `Create` event once the blob is readable.
    pub async fn ingest(&self, data: impl Into<Bytes>) -> Result<Descriptor, StoreError> {
        let data = data.into();
        let media_type = determine_media_type(&data).unwrap_or_default();
        let descriptor = Descriptor::for_bytes(media_type, &data);

        self.blobs.write(&descriptor.digest, &data).await?;
        tracing::trace!(digest = %descriptor.digest, size = descriptor.size, "Ingested blob");

        // No subscribers is fine.
        let _ = self.events.send(Event::create(descriptor.digest.clone()));
        Ok(descriptor)
    }

    /// Store bytes under an explicit descriptor, keeping its media type.
    ///
    /// Bytes that do not match the descriptor's digest and size are
    /// rejected. Once a manifest or index referencing the content is in the
    /// layout, the media type survives reopening the store.
    pub async fn write(&self, descriptor: &Descriptor, data: impl Into<Bytes>) -> Result<(), StoreError> {
        let data = data.into();
        if descriptor.size != data.len() as u64 {
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

        self.blobs.write(&descriptor.digest, &data).await?;
        self.media_types.record(descriptor);
        tracing::trace!(digest = %descriptor.digest, media_type = %descriptor.media_type, "Wrote blob");

        let _ = self.events.send(Event::create(descriptor.digest.clone()));
        Ok(())
    }

    async fn media_type(&self, digest: &Digest) -> Result<Option<String>, StoreError> {
        let index = self.read_index().await?;
        if let Some(entry) = index
            .manifests
            .iter()
            .find(|entry| &entry.digest == digest && !entry.media_type.is_empty())
        {
            return Ok(Some(entry.media_type.clone()));
        }

        if let Some(media_type) = self.media_types.get(digest) {
            return Ok(Some(media_type));
        }

        self.media_types
            .learn(index.manifests, |digest| async move { self.blobs.read(&digest).await })
            .await?;
        Ok(self.media_types.get(digest))
    }

    /// Record `image` in `index.json` under its tag name, replacing any
    /// entry with the same name.
    ///
    /// The image's root must already be in the layout.
    pub async fn tag(&self, image: &Image) -> Result<(), StoreError> {
        let (Some(digest), Some(tag_name)) = (image.digest.as_ref(), image.tag_name()) else {
            return Err(StoreError::builder(
                self.name(),
                StoreErrorKind::InvalidRequest,
                "only images with a tag and a digest can be tagged",
            )
            .reference(image.to_string())
            .build());
        };

        let manifest = self.get_manifest(digest).await?;
        let mut descriptor = Descriptor::for_bytes(manifest.media_type, &manifest.data);
        descriptor.annotations = Some(BTreeMap::from([(
            REF_NAME_ANNOTATION.to_owned(),
            tag_name.clone(),
        )]));

        let _guard = self.index.lock().await;
        let mut index = self.read_index().await?;
        index
            .manifests
            .retain(|entry| entry_name(entry).as_deref() != Some(tag_name.as_str()));
        index.manifests.push(descriptor);
        self.write_index(&index).await?;

        tracing::debug!(%digest, %tag_name, "Tagged image");
        let _ = self.events.send(Event::create(digest.clone()));
        Ok(())
    }

    fn images(&self, index: &ImageIndex) -> Vec<Image> {
        index
            .manifests
            .iter()
            .filter_map(|entry| {
                let name = entry_name(entry)?;
                match Image::parse_require_digest(&name, entry.digest.clone()) {
                    Ok(image) => Some(image),
                    Err(error) => {
                        tracing::debug!(%name, %error, "Skipping index entry with unusable name");
                        None
                    }
                }
            })
            .collect()
    }
}

fn empty_index() -> ImageIndex {
    ImageIndex {
        schema_version: 2,
        media_type: oci_driver::media_type::IMAGE_INDEX.to_owned(),
        manifests: Vec::new(),
    }
}

fn entry_name(entry: &Descriptor) -> Option<String> {
    entry
        .annotation(CONTAINERD_NAME_ANNOTATION)
        .or_else(|| entry.annotation(REF_NAME_ANNOTATION))
        .map(str::to_owned)
}

#[async_trait::async_trait]
impl Driver for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn verify(&self) -> Result<(), StoreError> {
        let marker = self.root.join(LAYOUT_FILE);
        tokio::fs::metadata(&marker)
            .await
            .wrap_err_with(|| format!("no image layout at {}", self.root))
            .map_err(StoreError::with(self.name(), StoreErrorKind::BackendUnavailable))?;
        Ok(())
    }

    fn supports_events(&self) -> bool {
        true
    }

    async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        let receiver = self.events.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event subscriber fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Some(Box::pin(stream)))
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        let index = self.read_index().await?;
        Ok(self.images(&index))
    }

    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        let index = self.read_index().await?;
        self.images(&index)
            .into_iter()
            .find(|image| image.tag_name().as_deref() == Some(tag_name))
            .and_then(|image| image.digest)
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
        self.blobs.list().await
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        self.blobs.size(digest).await
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        let data = self.blobs.read(digest).await?;
        let recorded = self.media_type(digest).await?;
        let media_type = manifest_media_type(self.name(), digest, &data, recorded)?;
        Ok(RawManifest { data, media_type })
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        self.blobs.open(digest).await
    }
}
