use oci_driver::{
    determine_media_type, Digest, Driver, Image, ImageIndex, ImageManifest, MediaKind, Platform,
    StoreError, StoreErrorKind,
};

const WALK_CONTEXT: &str = "failed to walk image manifests";

/// How many manifests and indexes one walk fetches before giving up.
pub const DEFAULT_MAX_MANIFESTS: usize = 1024;

/// Which entries of an image index a walk descends into.
///
/// Index entries without a platform always match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PlatformMatcher {
    /// Every platform. Only entries whose manifest is held locally are
    /// walked, which mirrors what the runtime chose to pull.
    #[default]
    Any,

    /// The OS and architecture of this process.
    Host,

    /// Any of an explicit set of platforms.
    Only(Vec<Platform>),
}

impl PlatformMatcher {
    /// Whether an index entry for `platform` should be walked.
    pub fn matches(&self, platform: Option<&Platform>) -> bool {
        let Some(platform) = platform else {
            return true;
        };

        match self {
            PlatformMatcher::Any => true,
            PlatformMatcher::Host => platform.matches(&Platform::host()),
            PlatformMatcher::Only(targets) => targets.iter().any(|target| platform.matches(target)),
        }
    }
}

/// Enumerates the digests that make up an image.
#[derive(Debug, Clone)]
pub struct Walker {
    platforms: PlatformMatcher,
    max_manifests: usize,
}

impl Default for Walker {
    fn default() -> Self {
        Self::new(PlatformMatcher::default())
    }
}

impl Walker {
    /// A walker that descends into index entries matching `platforms`.
    pub fn new(platforms: PlatformMatcher) -> Self {
        Self {
            platforms,
            max_manifests: DEFAULT_MAX_MANIFESTS,
        }
    }

    /// Fail walks that would fetch more than `max_manifests` manifests and
    /// indexes. Indexes that repeat nested indexes grow exponentially.
    pub fn with_max_manifests(mut self, max_manifests: usize) -> Self {
        self.max_manifests = max_manifests;
        self
    }

    /// The platform policy in use.
    pub fn platforms(&self) -> &PlatformMatcher {
        &self.platforms
    }

    /// Walk the manifest graph rooted at `image`'s digest.
    ///
    /// The result starts with the root digest, and lists every manifest
    /// followed by its config and its layers, depth first in published
    /// order. Layers shared between platforms appear once per platform.
    /// Config and layer digests are not checked for presence.
    #[tracing::instrument(skip(self, store, image), fields(store = store.name(), image = %image))]
    pub async fn walk<D>(&self, store: &D, image: &Image) -> Result<Vec<Digest>, StoreError>
    where
        D: Driver + Sync + ?Sized,
    {
        let Some(root) = image.digest.clone() else {
            return Err(StoreError::builder(
                store.name(),
                StoreErrorKind::InvalidRequest,
                "cannot walk an image without a digest",
            )
            .reference(image.to_string())
            .build());
        };

        let mut digests = Vec::new();
        let mut pending = vec![root.clone()];
        let mut fetched = 0;

        while let Some(digest) = pending.pop() {
            fetched += 1;
            if fetched > self.max_manifests {
                return Err(malformed(
                    store.name(),
                    &root,
                    format!("image {root} references more than {} manifests", self.max_manifests),
                ));
            }

            let manifest = store
                .get_manifest(&digest)
                .await
                .map_err(|err| err.with_context(WALK_CONTEXT))?;

            let media_type = if manifest.media_type.is_empty() {
                determine_media_type(&manifest.data)
                    .map_err(|err| malformed(store.name(), &digest, err))?
            } else {
                manifest.media_type
            };
            digests.push(digest.clone());

            match MediaKind::classify(&media_type) {
                MediaKind::Index => {
                    let index: ImageIndex = serde_json::from_slice(&manifest.data)
                        .map_err(|err| malformed(store.name(), &digest, err))?;
                    let children = self.local_entries(store, &digest, index).await?;

                    // Reversed so entries pop in published order.
                    pending.extend(children.into_iter().rev());
                }
                MediaKind::Manifest => {
                    let manifest: ImageManifest = serde_json::from_slice(&manifest.data)
                        .map_err(|err| malformed(store.name(), &digest, err))?;
                    digests.push(manifest.config.digest);
                    digests.extend(manifest.layers.into_iter().map(|layer| layer.digest));
                }
                MediaKind::Config if digest == root => {}
                _ => {
                    return Err(malformed(
                        store.name(),
                        &digest,
                        format!("unexpected media type {media_type} for digest {digest}"),
                    ))
                }
            }
        }

        tracing::trace!(count = digests.len(), "Walked image");
        Ok(digests)
    }

    async fn local_entries<D>(
        &self,
        store: &D,
        digest: &Digest,
        index: ImageIndex,
    ) -> Result<Vec<Digest>, StoreError>
    where
        D: Driver + Sync + ?Sized,
    {
        let mut entries = Vec::new();

        for entry in index.manifests {
            if !self.platforms.matches(entry.platform.as_ref()) {
                continue;
            }

            match store.size(&entry.digest).await {
                Ok(_) => entries.push(entry.digest),
                Err(err) if err.is_not_found() => {
                    tracing::trace!(index = %digest, entry = %entry.digest, "Skipping entry without local content");
                }
                Err(err) => return Err(err.with_context(WALK_CONTEXT)),
            }
        }

        if entries.is_empty() {
            return Err(StoreError::builder(
                store.name(),
                StoreErrorKind::UnresolvablePlatform,
                format!("could not find any platforms with local content in manifest {digest}"),
            )
            .digest(digest)
            .context(WALK_CONTEXT)
            .build());
        }

        Ok(entries)
    }
}

fn malformed<E>(engine: &'static str, digest: &Digest, err: E) -> StoreError
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    StoreError::builder(engine, StoreErrorKind::MalformedContent, err)
        .digest(digest)
        .context(WALK_CONTEXT)
        .build()
}

/// Walk `image` with the default platform policy.
pub async fn walk_image<D>(store: &D, image: &Image) -> Result<Vec<Digest>, StoreError>
where
    D: Driver + Sync + ?Sized,
{
    Walker::default().walk(store, image).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::MemoryStore;
    use oci_driver::{media_type, Descriptor};

    fn add_json(store: &MemoryStore, value: serde_json::Value) -> Descriptor {
        let data = serde_json::to_vec(&value).unwrap();
        let media_type = value["mediaType"].as_str().unwrap_or_default().to_owned();
        let descriptor = Descriptor::for_bytes(media_type, &data);
        store.write(descriptor.clone(), data).unwrap();
        descriptor
    }

    fn platform_manifest(store: &MemoryStore, os: &str, arch: &str, layer: &Descriptor) -> Descriptor {
        let config = add_json(
            store,
            json!({"mediaType": media_type::IMAGE_CONFIG, "architecture": arch, "os": os, "rootfs": {}}),
        );
        let mut manifest = add_json(
            store,
            json!({
                "schemaVersion": 2,
                "mediaType": media_type::IMAGE_MANIFEST,
                "config": {"mediaType": media_type::IMAGE_CONFIG, "digest": config.digest, "size": config.size},
                "layers": [layer],
            }),
        );
        manifest.platform = Some(Platform::new(os, arch));
        manifest
    }

    fn image(digest: &Digest) -> Image {
        Image::parse_require_digest("example.com/org/app:v1", digest.clone()).unwrap()
    }

    #[test]
    fn matcher_policies() {
        let arm = Platform::new("linux", "arm64");
        let only = PlatformMatcher::Only(vec![Platform::new("linux", "amd64")]);

        assert!(PlatformMatcher::Any.matches(Some(&arm)));
        assert!(only.matches(None));
        assert!(!only.matches(Some(&arm)));
        assert!(PlatformMatcher::Host.matches(Some(&Platform::host())));
    }

    #[tokio::test]
    async fn nested_index_order() {
        let store = MemoryStore::new();
        let layer = Descriptor::for_bytes(media_type::IMAGE_LAYER_GZIP, b"layer");
        let amd64 = platform_manifest(&store, "linux", "amd64", &layer);
        let arm64 = platform_manifest(&store, "linux", "arm64", &layer);

        let inner = add_json(&store, json!({"mediaType": media_type::IMAGE_INDEX, "manifests": [arm64]}));
        let outer = add_json(&store, json!({"mediaType": media_type::IMAGE_INDEX, "manifests": [amd64, inner]}));

        let digests = walk_image(&store, &image(&outer.digest)).await.unwrap();
        assert_eq!(digests.len(), 8);
        assert_eq!(digests[0], outer.digest);
        assert_eq!(digests[1], amd64.digest);
        assert_eq!(digests[3], layer.digest);
        assert_eq!(digests[4], inner.digest);
        assert_eq!(digests[5], arm64.digest);
        assert_eq!(digests[7], layer.digest);
    }

    #[tokio::test]
    async fn explicit_platforms_filter_entries() {
        let store = MemoryStore::new();
        let layer = Descriptor::for_bytes(media_type::IMAGE_LAYER_GZIP, b"layer");
        let amd64 = platform_manifest(&store, "linux", "amd64", &layer);
        let arm64 = platform_manifest(&store, "linux", "arm64", &layer);
        let index = add_json(&store, json!({"mediaType": media_type::IMAGE_INDEX, "manifests": [amd64, arm64]}));

        let walker = Walker::new(PlatformMatcher::Only(vec![Platform::new("linux", "arm64")]));
        let digests = walker.walk(&store, &image(&index.digest)).await.unwrap();
        assert_eq!(digests[..2], [index.digest.clone(), arm64.digest.clone()]);
        assert_eq!(digests.len(), 4);

        let walker = Walker::new(PlatformMatcher::Only(vec![Platform::new("windows", "amd64")]));
        let err = walker.walk(&store, &image(&index.digest)).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::UnresolvablePlatform);
        assert_eq!(err.digest(), Some(index.digest.as_str()));
    }

    #[tokio::test]
    async fn bare_config_root() {
        let store = MemoryStore::new();
        let config = add_json(&store, json!({"architecture": "amd64", "os": "linux", "rootfs": {}}));

        let digests = walk_image(&store, &image(&config.digest)).await.unwrap();
        assert_eq!(digests, vec![config.digest]);
    }

    #[tokio::test]
    async fn unexpected_media_type() {
        let store = MemoryStore::new();
        let data = b"opaque";
        store
            .write(Descriptor::for_bytes("application/octet-stream", data), &data[..])
            .unwrap();

        let err = walk_image(&store, &image(&Digest::from_bytes(data))).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::MalformedContent);
        assert!(err.to_string().contains("unexpected media type"));
    }

    #[tokio::test]
    async fn repeated_nested_indexes_are_bounded() {
        let store = MemoryStore::new();
        let layer = Descriptor::for_bytes(media_type::IMAGE_LAYER_GZIP, b"layer");
        let mut entry = platform_manifest(&store, "linux", "amd64", &layer);
        entry.platform = None;

        // 1 + 4 + 16 indexes over 64 manifest fetches.
        for _ in 0..3 {
            let manifests = vec![entry.clone(); 4];
            entry = add_json(&store, json!({"mediaType": media_type::IMAGE_INDEX, "manifests": manifests}));
        }

        let digests = walk_image(&store, &image(&entry.digest)).await.unwrap();
        assert_eq!(digests.len(), 1 + 4 + 16 + 64 * 3);

        let walker = Walker::default().with_max_manifests(50);
        let err = walker.walk(&store, &image(&entry.digest)).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::MalformedContent);
        assert_eq!(err.digest(), Some(entry.digest.as_str()));
        assert!(err.to_string().contains("references more than 50 manifests"));
    }

    #[tokio::test]
    async fn missing_root_and_missing_digest() {
        let store = MemoryStore::new();
        let err = walk_image(&store, &image(&Digest::from_string("absent"))).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.context(), Some(WALK_CONTEXT));

        let err = walk_image(&store, &Image::parse("example.com/org/app:v1").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::InvalidRequest);
    }
}
