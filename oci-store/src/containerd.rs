//! The containerd image and content services over gRPC.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use camino::Utf8Path;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::{
    InfoRequest, ListContentRequest, ListImagesRequest, ReadContentRequest,
};
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use oci_driver::{Content, Descriptor, Digest, StoreError, StoreErrorKind};

use crate::runtime::{ImageRecord, RuntimeClient};

/// Where containerd listens by default.
pub const DEFAULT_ADDRESS: &str = "/run/containerd/containerd.sock";

const ENGINE: &str = "runtime";
const NAMESPACE_HEADER: &str = "containerd-namespace";

/// Client for a containerd daemon's images and content services.
#[derive(Debug, Clone)]
pub struct Containerd {
    images: ImagesClient<Channel>,
    content: ContentClient<Channel>,
}

impl Containerd {
    /// Connect to the daemon listening on the unix socket at `address`.
    #[tracing::instrument]
    pub async fn connect(address: &Utf8Path) -> Result<Self, StoreError> {
        let channel = containerd_client::connect(address).await.map_err(|err| {
            StoreError::builder(ENGINE, StoreErrorKind::BackendUnavailable, err)
                .context(format!("connecting to containerd at {address}"))
                .build()
        })?;

        tracing::debug!("Connected to containerd");
        Ok(Self::from_channel(channel))
    }

    /// Use an already established channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            images: ImagesClient::new(channel.clone()),
            content: ContentClient::new(channel),
        }
    }
}

fn request<T>(namespace: &str, message: T) -> Result<Request<T>, StoreError> {
    let value = MetadataValue::try_from(namespace).map_err(|err| {
        StoreError::builder(ENGINE, StoreErrorKind::InvalidRequest, err)
            .context(format!("namespace {namespace:?} cannot be sent to containerd"))
            .build()
    })?;

    let mut request = Request::new(message);
    request.metadata_mut().insert(NAMESPACE_HEADER, value);
    Ok(request)
}

fn status_to_store(status: Status, digest: Option<&Digest>, what: &str) -> StoreError {
    let kind = match status.code() {
        Code::NotFound => StoreErrorKind::NotFound,
        Code::Cancelled | Code::DeadlineExceeded => StoreErrorKind::Cancelled,
        Code::InvalidArgument => StoreErrorKind::InvalidRequest,
        _ => StoreErrorKind::BackendUnavailable,
    };

    let mut builder = StoreError::builder(ENGINE, kind, status).context(what);
    if let Some(digest) = digest {
        builder = builder.digest(digest);
    }
    builder.build()
}

fn digest(value: &str, what: &str) -> Result<Digest, StoreError> {
    Digest::parse(value).map_err(|err| {
        StoreError::builder(ENGINE, StoreErrorKind::MalformedContent, err)
            .context(format!("containerd returned an invalid {what} digest {value:?}"))
            .build()
    })
}

fn descriptor(target: containerd_client::types::Descriptor) -> Result<Descriptor, StoreError> {
    let annotations: BTreeMap<String, String> = target.annotations.into_iter().collect();
    Ok(Descriptor {
        media_type: target.media_type,
        digest: digest(&target.digest, "image target")?,
        size: u64::try_from(target.size).unwrap_or_default(),
        platform: None,
        annotations: (!annotations.is_empty()).then_some(annotations),
    })
}

#[async_trait::async_trait]
impl RuntimeClient for Containerd {
    async fn images(&self, namespace: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let response = self
            .images
            .clone()
            .list(request(namespace, ListImagesRequest { filters: Vec::new() })?)
            .await
            .map_err(|status| status_to_store(status, None, "listing images"))?;

        let mut records = Vec::new();
        for image in response.into_inner().images {
            let Some(target) = image.target else {
                tracing::debug!(name = %image.name, "Skipping image without a target");
                continue;
            };
            records.push(ImageRecord {
                name: image.name,
                target: descriptor(target)?,
            });
        }
        Ok(records)
    }

    async fn contents(&self, namespace: &str) -> Result<Vec<Content>, StoreError> {
        let mut stream = self
            .content
            .clone()
            .list(request(namespace, ListContentRequest { filters: Vec::new() })?)
            .await
            .map_err(|status| status_to_store(status, None, "listing content"))?
            .into_inner();

        let mut contents = Vec::new();
        while let Some(response) = stream
            .message()
            .await
            .map_err(|status| status_to_store(status, None, "listing content"))?
        {
            for info in response.info {
                match Digest::parse(&info.digest) {
                    Ok(digest) => contents.push(Content::from(digest)),
                    Err(error) => tracing::debug!(digest = %info.digest, %error, "Skipping invalid digest"),
                }
            }
        }

        contents.sort();
        Ok(contents)
    }

    async fn size(&self, namespace: &str, digest: &Digest) -> Result<u64, StoreError> {
        let response = self
            .content
            .clone()
            .info(request(
                namespace,
                InfoRequest {
                    digest: digest.to_string(),
                },
            )?)
            .await
            .map_err(|status| status_to_store(status, Some(digest), "size information"))?;

        let info = response
            .into_inner()
            .info
            .ok_or_else(|| StoreError::not_found(ENGINE, digest, "size information"))?;
        Ok(u64::try_from(info.size).unwrap_or_default())
    }

    async fn read(&self, namespace: &str, digest: &Digest) -> Result<Bytes, StoreError> {
        let mut stream = self
            .content
            .clone()
            .read(request(
                namespace,
                ReadContentRequest {
                    digest: digest.to_string(),
                    offset: 0,
                    size: 0,
                },
            )?)
            .await
            .map_err(|status| status_to_store(status, Some(digest), "reading content"))?
            .into_inner();

        let mut data = BytesMut::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|status| status_to_store(status, Some(digest), "reading content"))?
        {
            data.extend_from_slice(&chunk.data);
        }

        tracing::trace!(%digest, size = data.len(), "Read content from containerd");
        Ok(data.freeze())
    }
}
