//! Image fixtures shared by the store integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8Path;
use oci_driver::{
    media_type, Content, Descriptor, Digest, Image, ImageIndex, ImageManifest, MediaKind, Platform,
    StoreError,
};
use oci_store::{ImageRecord, LocalStore, MemoryStore, RuntimeClient, RuntimeStore, Store};
use serde_json::{json, Value};

/// One stored object and the descriptor a store records for it.
#[derive(Debug, Clone)]
pub struct Object {
    pub descriptor: Descriptor,
    pub data: Bytes,
}

impl Object {
    fn is_layer(&self) -> bool {
        MediaKind::classify(&self.descriptor.media_type) == MediaKind::Layer
            && !self.descriptor.media_type.is_empty()
    }
}

#[derive(Debug, Default)]
struct Builder {
    objects: Vec<Object>,
}

impl Builder {
    fn add(&mut self, media_type: &str, data: Vec<u8>) -> Descriptor {
        let descriptor = Descriptor::for_bytes(media_type, &data);
        if !self.objects.iter().any(|object| object.descriptor.digest == descriptor.digest) {
            self.objects.push(Object {
                descriptor: descriptor.clone(),
                data: data.into(),
            });
        }
        descriptor
    }

    fn json(&mut self, media_type: &str, value: Value) -> Descriptor {
        self.add(media_type, serde_json::to_vec(&value).unwrap())
    }

    fn layer(&mut self, media_type: &str, name: &str) -> Descriptor {
        self.add(media_type, format!("layer tarball for {name}").into_bytes())
    }

    fn config(&mut self, media_type: &str, name: &str, platform: &Platform) -> Descriptor {
        self.json(
            media_type,
            json!({
                "architecture": platform.architecture,
                "os": platform.os,
                "config": {"Labels": {"fixture": name}},
                "rootfs": {"type": "layers", "diff_ids": []},
            }),
        )
    }

    fn manifest(&mut self, media_type: &str, config: &Descriptor, layers: &[Descriptor]) -> Descriptor {
        let mut document = json!({
            "schemaVersion": 2,
            "config": config,
            "layers": layers,
        });
        if !media_type.is_empty() {
            document["mediaType"] = json!(media_type);
        }
        self.json(media_type, document)
    }

    fn index(&mut self, media_type: &str, manifests: &[Descriptor]) -> Descriptor {
        let mut document = json!({
            "schemaVersion": 2,
            "manifests": manifests,
        });
        if !media_type.is_empty() {
            document["mediaType"] = json!(media_type);
        }
        self.json(media_type, document)
    }
}

fn with_platform(mut descriptor: Descriptor, platform: &Platform) -> Descriptor {
    descriptor.platform = Some(platform.clone());
    descriptor
}

fn absent(platform: &Platform) -> Descriptor {
    let mut descriptor =
        Descriptor::for_bytes(media_type::IMAGE_MANIFEST, format!("never pulled {platform}").as_bytes());
    descriptor.platform = Some(platform.clone());
    descriptor
}

/// Five images covering the shapes a node meets in practice.
#[derive(Debug)]
pub struct Fixtures {
    pub objects: Vec<Object>,
    pub images: Vec<Image>,

    /// A single-platform OCI manifest.
    pub single: Digest,

    /// An OCI index over four local platforms and one that was never pulled.
    pub multi: Digest,

    /// The layer every platform of `multi` shares.
    pub shared_layer: Digest,

    /// An index, manifest and config published without media types.
    pub legacy: Digest,

    /// An index none of whose platforms are held locally.
    pub no_platform: Digest,

    /// A Docker manifest list.
    pub busybox: Digest,
}

impl Fixtures {
    pub fn new() -> Self {
        let mut builder = Builder::default();
        let amd64 = Platform::new("linux", "amd64");

        // single
        let config = builder.config(media_type::IMAGE_CONFIG, "single", &amd64);
        let layers = vec![
            builder.layer(media_type::IMAGE_LAYER_GZIP, "single base"),
            builder.layer(media_type::IMAGE_LAYER_GZIP, "single app"),
        ];
        let single = builder.manifest(media_type::IMAGE_MANIFEST, &config, &layers);

        // multi: 1 index + 4 manifests with configs + 31 layers = 40 digests walked
        let shared_layer = builder.layer(media_type::IMAGE_LAYER_GZIP, "multi shared base");
        let platforms = [
            (Platform::new("linux", "amd64"), 8),
            (Platform::new("linux", "arm64"), 8),
            (Platform::new("linux", "arm").with_variant("v7"), 8),
            (Platform::new("linux", "ppc64le"), 7),
        ];
        let mut entries = Vec::new();
        for (i, (platform, count)) in platforms.iter().enumerate() {
            let config = builder.config(media_type::IMAGE_CONFIG, "multi", platform);
            let mut layers = vec![shared_layer.clone()];
            for n in 1..*count {
                layers.push(builder.layer(media_type::IMAGE_LAYER_GZIP, &format!("multi {platform} {n}")));
            }
            let manifest = builder.manifest(media_type::IMAGE_MANIFEST, &config, &layers);
            entries.push(with_platform(manifest, platform));
            if i == 1 {
                entries.push(absent(&Platform::new("windows", "amd64")));
            }
        }
        let multi = builder.index(media_type::IMAGE_INDEX, &entries);

        // legacy
        let config = builder.config("", "legacy", &amd64);
        let layer = builder.layer(media_type::IMAGE_LAYER_GZIP, "legacy");
        let manifest = builder.manifest("", &config, &[layer]);
        let legacy = builder.index("", &[with_platform(manifest, &amd64)]);

        // no-platform
        let no_platform = builder.index(
            media_type::IMAGE_INDEX,
            &[
                absent(&Platform::new("linux", "s390x")),
                absent(&Platform::new("linux", "riscv64")),
            ],
        );

        // busybox
        let config = builder.config(media_type::DOCKER_CONFIG, "busybox", &amd64);
        let layer = builder.layer(media_type::DOCKER_LAYER_GZIP, "busybox");
        let manifest = builder.manifest(media_type::DOCKER_MANIFEST, &config, &[layer]);
        let busybox = builder.index(media_type::DOCKER_MANIFEST_LIST, &[with_platform(manifest, &amd64)]);

        let images = [
            ("example.com/org/single:v1", &single),
            ("example.com/org/multi:v1", &multi),
            ("example.com/org/legacy:v1", &legacy),
            ("example.com/org/no-platform:test", &no_platform),
            ("docker.io/library/busybox:latest", &busybox),
        ]
        .into_iter()
        .map(|(reference, root)| Image::parse_require_digest(reference, root.digest.clone()).unwrap())
        .collect();

        Self {
            objects: builder.objects,
            images,
            single: single.digest,
            multi: multi.digest,
            shared_layer: shared_layer.digest,
            legacy: legacy.digest,
            no_platform: no_platform.digest,
            busybox: busybox.digest,
        }
    }

    fn root_descriptor(&self, digest: &Digest) -> Descriptor {
        self.objects
            .iter()
            .find(|object| &object.descriptor.digest == digest)
            .map(|object| object.descriptor.clone())
            .unwrap()
    }

    pub fn memory(&self) -> MemoryStore {
        let store = MemoryStore::new();
        for object in &self.objects {
            if object.is_layer() {
                store.add_blob(object.data.clone());
            } else {
                store.write(object.descriptor.clone(), object.data.clone()).unwrap();
            }
        }
        for image in &self.images {
            store.add_image(image.clone());
        }
        store
    }

    pub async fn local(&self, root: &Utf8Path) -> LocalStore {
        let store = LocalStore::init(root.to_owned()).await.unwrap();
        for object in &self.objects {
            store.write(&object.descriptor, object.data.clone()).await.unwrap();
        }
        for image in &self.images {
            store.tag(image).await.unwrap();
        }
        store
    }

    fn runtime_client(&self) -> FakeRuntime {
        let images = self
            .images
            .iter()
            .map(|image| ImageRecord {
                name: image.tag_name().unwrap(),
                target: self.root_descriptor(image.digest.as_ref().unwrap()),
            })
            .collect();
        let blobs = self
            .objects
            .iter()
            .map(|object| (object.descriptor.digest.clone(), object.data.clone()))
            .collect();

        FakeRuntime {
            namespace: oci_store::DEFAULT_NAMESPACE.to_owned(),
            images,
            blobs,
        }
    }

    /// A runtime serving content through its content service.
    pub fn runtime(&self) -> RuntimeStore {
        RuntimeStore::new(Arc::new(self.runtime_client()))
    }

    /// A runtime whose content is read from its directory under `root`.
    pub fn runtime_content_path(&self, root: &Utf8Path) -> RuntimeStore {
        for object in &self.objects {
            let digest = &object.descriptor.digest;
            let dir = root.join("blobs").join(digest.algorithm());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(digest.encoded()), &object.data).unwrap();
        }

        RuntimeStore::new(Arc::new(self.runtime_client())).with_content_path(root.to_owned())
    }

    /// The same fixtures in every backend. `tmp` must outlive the stores.
    pub async fn stores(&self, tmp: &Utf8Path) -> Vec<Store> {
        vec![
            self.memory().into(),
            self.local(&tmp.join("local")).await.into(),
            self.runtime().into(),
            self.runtime_content_path(&tmp.join("content")).into(),
        ]
    }

    /// The object stored under `digest`, if it is a fixture.
    pub fn object(&self, digest: &Digest) -> Option<&Object> {
        self.objects.iter().find(|object| &object.descriptor.digest == digest)
    }

    /// The digests a walk of `root` yields: the root, then for each index
    /// entry held here its manifest, config and layers, in published order.
    pub fn expected_walk(&self, root: &Digest) -> Vec<Digest> {
        let root_object = self.object(root).unwrap();
        let media_type = oci_driver::determine_media_type(&root_object.data).unwrap();

        let mut digests = Vec::new();
        let manifests: Vec<&Object> = if MediaKind::classify(&media_type) == MediaKind::Index {
            digests.push(root.clone());
            let index: ImageIndex = serde_json::from_slice(&root_object.data).unwrap();
            index
                .manifests
                .iter()
                .filter_map(|entry| self.object(&entry.digest))
                .collect()
        } else {
            vec![root_object]
        };

        for object in manifests {
            let manifest: ImageManifest = serde_json::from_slice(&object.data).unwrap();
            digests.push(object.descriptor.digest.clone());
            digests.push(manifest.config.digest);
            digests.extend(manifest.layers.into_iter().map(|layer| layer.digest));
        }
        digests
    }
}

/// The runtime's image and content services, answering for one namespace.
#[derive(Debug)]
pub struct FakeRuntime {
    namespace: String,
    images: Vec<ImageRecord>,
    blobs: HashMap<Digest, Bytes>,
}

impl FakeRuntime {
    fn blob(&self, digest: &Digest) -> Result<&Bytes, StoreError> {
        self.blobs
            .get(digest)
            .ok_or_else(|| StoreError::not_found("runtime", digest, "content"))
    }
}

#[async_trait::async_trait]
impl RuntimeClient for FakeRuntime {
    async fn images(&self, namespace: &str) -> Result<Vec<ImageRecord>, StoreError> {
        if namespace == self.namespace {
            Ok(self.images.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn contents(&self, _namespace: &str) -> Result<Vec<Content>, StoreError> {
        let mut contents: Vec<Content> = self.blobs.keys().cloned().map(Content::from).collect();
        contents.sort();
        Ok(contents)
    }

    async fn size(&self, _namespace: &str, digest: &Digest) -> Result<u64, StoreError> {
        self.blob(digest).map(|data| data.len() as u64)
    }

    async fn read(&self, _namespace: &str, digest: &Digest) -> Result<Bytes, StoreError> {
        self.blob(digest).cloned()
    }
}

pub fn tempdir() -> (tempfile::TempDir, camino::Utf8PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
    (tmp, path)
}
