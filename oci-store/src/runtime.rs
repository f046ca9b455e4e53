use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8PathBuf;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use oci_driver::{
    Blob, Content, Descriptor, Digest, Driver, Event, EventStream, Image, RawManifest, StoreError,
    StoreErrorKind,
};

use crate::fs::BlobDir;
use crate::media::{manifest_media_type, MediaTypes};

/// Namespace the kubelet pulls images into.
pub const DEFAULT_NAMESPACE: &str = "k8s.io";

/// How often the runtime's image list is polled for changes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;

/// One image known to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Full image name, `registry/repository:tag`.
    pub name: String,

    /// The image's root manifest or index.
    pub target: Descriptor,
}

/// The container runtime's image and content services.
///
/// Every call is scoped to a runtime namespace. Missing content and unknown
/// digests fail with [`StoreErrorKind::NotFound`].
#[async_trait::async_trait]
pub trait RuntimeClient: Debug + Send + Sync {
    /// Every named image in `namespace`.
    async fn images(&self, namespace: &str) -> Result<Vec<ImageRecord>, StoreError>;

    /// Every digest in the content store.
    async fn contents(&self, namespace: &str) -> Result<Vec<Content>, StoreError>;

    /// Size of the content stored under `digest`.
    async fn size(&self, namespace: &str, digest: &Digest) -> Result<u64, StoreError>;

    /// The whole content stored under `digest`.
    async fn read(&self, namespace: &str, digest: &Digest) -> Result<Bytes, StoreError>;
}

/// Read-only view of a container runtime's images and content.
///
/// The runtime pulls and garbage collects; this store only observes. Image
/// names always come from the runtime's image service. Content comes from
/// its content service, or straight from the content directory on disk
/// (`<content-path>/blobs/<algorithm>/<encoded>`) when one is configured.
#[derive(Debug)]
pub struct RuntimeStore {
    client: Arc<dyn RuntimeClient>,
    namespace: String,
    poll_interval: Duration,
    content: Option<BlobDir>,
    media_types: MediaTypes,
}

impl RuntimeStore {
    /// Observe the runtime behind `client`, in the default namespace.
    pub fn new(client: Arc<dyn RuntimeClient>) -> Self {
        Self {
            client,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            content: None,
            media_types: MediaTypes::default(),
        }
    }

    /// Observe a different runtime namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Change how often [`Driver::subscribe`] polls the image list.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Read content from the runtime's content directory instead of its
    /// content service.
    pub fn with_content_path(mut self, path: Utf8PathBuf) -> Self {
        self.content = Some(BlobDir::new("runtime", path.join("blobs")));
        self
    }

    /// The namespace being observed.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn images(&self, records: &[ImageRecord]) -> Vec<Image> {
        records
            .iter()
            .filter_map(
                |record| match Image::parse_require_digest(&record.name, record.target.digest.clone()) {
                    Ok(image) => Some(image),
                    Err(error) => {
                        tracing::debug!(name = %record.name, %error, "Skipping unparsable image name");
                        None
                    }
                },
            )
            .collect()
    }

    async fn read(&self, digest: &Digest) -> Result<Bytes, StoreError> {
        match &self.content {
            Some(blobs) => blobs.read(digest).await,
            None => self.client.read(&self.namespace, digest).await,
        }
    }

    async fn media_type(&self, digest: &Digest) -> Result<Option<String>, StoreError> {
        let records = self.client.images(&self.namespace).await?;
        if let Some(target) = records
            .iter()
            .map(|record| &record.target)
            .find(|target| &target.digest == digest && !target.media_type.is_empty())
        {
            return Ok(Some(target.media_type.clone()));
        }

        if let Some(media_type) = self.media_types.get(digest) {
            return Ok(Some(media_type));
        }

        let roots = records.into_iter().map(|record| record.target).collect();
        self.media_types
            .learn(roots, |digest| async move { self.read(&digest).await })
            .await?;
        Ok(self.media_types.get(digest))
    }
}

fn targets(records: Vec<ImageRecord>) -> BTreeMap<String, Digest> {
    records
        .into_iter()
        .map(|record| (record.name, record.target.digest))
        .collect()
}

/// Events turning `known` into `current`. A digest is only reported deleted
/// once no image targets it anymore, and each digest is reported once.
fn diff(known: &BTreeMap<String, Digest>, current: &BTreeMap<String, Digest>) -> Vec<Event> {
    let mut events = Vec::new();

    for (name, digest) in known {
        if current.get(name) != Some(digest) && !current.values().any(|target| target == digest) {
            let event = Event::delete(digest.clone());
            if !events.contains(&event) {
                events.push(event);
            }
        }
    }

    for (name, digest) in current {
        if known.get(name) != Some(digest) {
            let event = Event::create(digest.clone());
            if !events.contains(&event) {
                events.push(event);
            }
        }
    }

    events
}

async fn poll_images(
    client: Arc<dyn RuntimeClient>,
    namespace: String,
    poll_interval: Duration,
    mut known: BTreeMap<String, Digest>,
    sender: mpsc::Sender<Event>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    'poll: loop {
        tokio::select! {
            _ = sender.closed() => break,
            _ = interval.tick() => {}
        }

        let current = match client.images(&namespace).await {
            Ok(records) => targets(records),
            Err(error) => {
                tracing::warn!(%error, "Failed to poll runtime images");
                continue;
            }
        };

        for event in diff(&known, &current) {
            tracing::trace!(%event, "Runtime images changed");
            if sender.send(event).await.is_err() {
                break 'poll;
            }
        }
        known = current;
    }

    tracing::debug!("Stopped polling runtime images");
}

#[async_trait::async_trait]
impl Driver for RuntimeStore {
    fn name(&self) -> &'static str {
        "runtime"
    }

    async fn verify(&self) -> Result<(), StoreError> {
        if let Some(blobs) = &self.content {
            let root = blobs.root();
            let metadata = tokio::fs::metadata(root)
                .await
                .wrap_err_with(|| format!("runtime content path {root} is not accessible"))
                .map_err(StoreError::with(self.name(), StoreErrorKind::BackendUnavailable))?;

            if !metadata.is_dir() {
                return Err(StoreError::new(
                    self.name(),
                    StoreErrorKind::BackendUnavailable,
                    eyre::eyre!("runtime content path {root} is not a directory"),
                ));
            }
        }

        self.client
            .images(&self.namespace)
            .await
            .map_err(|err| err.with_context("runtime image service is not serving"))?;
        Ok(())
    }

    fn supports_events(&self) -> bool {
        true
    }

    async fn subscribe(&self) -> Result<Option<EventStream>, StoreError> {
        let known = targets(self.client.images(&self.namespace).await?);
        let (sender, receiver) = mpsc::channel(EVENT_CAPACITY);

        let span = tracing::debug_span!("runtime_images", namespace = %self.namespace);
        tokio::spawn(
            poll_images(
                self.client.clone(),
                self.namespace.clone(),
                self.poll_interval,
                known,
                sender,
            )
            .instrument(span),
        );

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        });
        Ok(Some(Box::pin(stream)))
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        let records = self.client.images(&self.namespace).await?;
        Ok(self.images(&records))
    }

    async fn resolve(&self, tag_name: &str) -> Result<Digest, StoreError> {
        let records = self.client.images(&self.namespace).await?;
        self.images(&records)
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
        match &self.content {
            Some(blobs) => blobs.list().await,
            None => self.client.contents(&self.namespace).await,
        }
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        match &self.content {
            Some(blobs) => blobs.size(digest).await,
            None => self.client.size(&self.namespace, digest).await,
        }
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<RawManifest, StoreError> {
        let data = self.read(digest).await?;
        let recorded = self.media_type(digest).await?;
        let media_type = manifest_media_type(self.name(), digest, &data, recorded)?;
        Ok(RawManifest { data, media_type })
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Blob, StoreError> {
        match &self.content {
            Some(blobs) => blobs.open(digest).await,
            None => {
                let data = self.client.read(&self.namespace, digest).await?;
                Ok(Box::new(Cursor::new(data)))
            }
        }
    }
}
