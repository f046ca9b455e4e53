use std::io;
#[cfg(feature = "local")]
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tracing::Instrument;

use oci_driver::{Blob, Content, Digest, StoreError, StoreErrorKind};

#[cfg(feature = "local")]
static STAGING: AtomicU64 = AtomicU64::new(0);

/// Map an I/O failure on a blob to the store's taxonomy. A missing file is
/// a missing digest; everything else means the backend cannot serve.
pub(crate) fn io_error_to_store(
    engine: &'static str,
    digest: &Digest,
    what: &str,
    err: io::Error,
) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::not_found(engine, digest, what),
        _ => StoreError::builder(engine, StoreErrorKind::BackendUnavailable, err)
            .digest(digest)
            .context(format!("reading {what}"))
            .build(),
    }
}

/// Content-addressed blob directory laid out as `<root>/<algorithm>/<encoded>`.
#[derive(Debug, Clone)]
pub(crate) struct BlobDir {
    engine: &'static str,
    root: Utf8PathBuf,
}

impl BlobDir {
    pub(crate) fn new(engine: &'static str, root: Utf8PathBuf) -> Self {
        Self { engine, root }
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) fn path(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.root.join(digest.algorithm());
        path.push(digest.encoded());
        path
    }

    pub(crate) async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        let metadata = tokio::fs::metadata(self.path(digest))
            .await
            .map_err(|err| io_error_to_store(self.engine, digest, "size information", err))?;
        Ok(metadata.len())
    }

    pub(crate) async fn read(&self, digest: &Digest) -> Result<Bytes, StoreError> {
        let data = tokio::fs::read(self.path(digest))
            .await
            .map_err(|err| io_error_to_store(self.engine, digest, "manifest", err))?;
        Ok(data.into())
    }

    pub(crate) async fn open(&self, digest: &Digest) -> Result<Blob, StoreError> {
        let file = tokio::fs::File::open(self.path(digest))
            .await
            .map_err(|err| io_error_to_store(self.engine, digest, "blob", err))?;
        Ok(Box::new(file))
    }

    /// Write `data` under `digest`, checking the content first. The blob
    /// becomes visible in one rename, so readers never see a partial file.
    #[cfg(feature = "local")]
    pub(crate) async fn write(&self, digest: &Digest, data: &[u8]) -> Result<(), StoreError> {
        if !digest.verify(data) {
            return Err(StoreError::builder(
                self.engine,
                StoreErrorKind::InvalidRequest,
                format!("content does not hash to {digest}"),
            )
            .digest(digest)
            .build());
        }

        let target = self.path(digest);
        let staging = self.root.join(format!(
            ".ingest-{}-{}",
            digest.encoded(),
            STAGING.fetch_add(1, Ordering::Relaxed)
        ));

        async {
            tokio::fs::create_dir_all(target.parent().unwrap_or(&self.root))
                .await
                .wrap_err("create_dir_all")?;
            tokio::fs::write(&staging, data)
                .await
                .wrap_err("write staging file")?;
            tokio::fs::rename(&staging, &target)
                .await
                .wrap_err("rename staging file")?;
            Ok::<_, eyre::Report>(())
        }
        .await
        .map_err(|err| {
            StoreError::builder(self.engine, StoreErrorKind::BackendUnavailable, err)
                .digest(digest)
                .context("ingest")
                .build()
        })
    }

    /// Every digest with a file in the directory. Names that are not valid
    /// digests are ignored.
    pub(crate) async fn list(&self) -> Result<Vec<Content>, StoreError> {
        let root = self.root.clone();
        let items = tokio::task::spawn_blocking(move || collect_list(&root))
            .in_current_span()
            .await
            .wrap_err("blob listing task")
            .map_err(StoreError::with(self.engine, StoreErrorKind::BackendUnavailable))?
            .map_err(StoreError::with(self.engine, StoreErrorKind::BackendUnavailable))?;

        tracing::debug!("Found {} blobs", items.len());
        Ok(items)
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path) -> eyre::Result<Vec<Content>> {
    let mut contents = Vec::new();
    if !root.is_dir() {
        return Ok(contents);
    }

    for algorithm in root.read_dir_utf8()? {
        let algorithm = algorithm?;
        if !algorithm.file_type()?.is_dir() {
            continue;
        }
        visit(algorithm.path(), algorithm.file_name(), &mut contents)?;
    }

    contents.sort();
    Ok(contents)
}

fn visit(path: &Utf8Path, algorithm: &str, contents: &mut Vec<Content>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match Digest::parse(&format!("{algorithm}:{}", entry.file_name())) {
            Ok(digest) => contents.push(digest.into()),
            Err(error) => tracing::trace!(path = %entry.path(), %error, "Skipping non-blob file"),
        }
    }

    Ok(())
}
