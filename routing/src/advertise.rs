use std::collections::HashSet;

use oci_driver::{Digest, Image, StoreErrorKind};
use oci_store::Store;

use crate::{Router, RoutingError};

/// The routing keys for an image: its tag name, then each distinct digest
/// of its walk in order.
pub fn image_keys(image: &Image, digests: &[Digest]) -> Vec<String> {
    let mut seen = HashSet::new();
    image
        .tag_name()
        .into_iter()
        .chain(digests.iter().map(Digest::to_string))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Walk `image` in `store` and advertise its keys. Returns the number of
/// keys advertised.
#[tracing::instrument(skip(router, store), fields(store = store.name(), %image))]
pub async fn advertise_image<R>(router: &R, store: &Store, image: &Image) -> Result<usize, RoutingError>
where
    R: Router + ?Sized,
{
    let digests = store.walk(image).await?;
    let keys = image_keys(image, &digests);
    router.advertise(&keys).await?;

    tracing::trace!(keys = keys.len(), "Advertised image");
    Ok(keys.len())
}

/// Advertise every image in `store`.
///
/// Images with no platform held locally are skipped: in a fleet of mixed
/// architectures that is expected. Any other failure stops the pass.
#[tracing::instrument(skip(router, store), fields(store = store.name()))]
pub async fn advertise_all<R>(router: &R, store: &Store) -> Result<usize, RoutingError>
where
    R: Router + ?Sized,
{
    let mut advertised = 0;

    for image in store.list_images().await? {
        match advertise_image(router, store, &image).await {
            Ok(keys) => advertised += keys,
            Err(RoutingError::Store(error)) if error.kind() == StoreErrorKind::UnresolvablePlatform => {
                tracing::debug!(%image, %error, "Skipping image without a local platform");
            }
            Err(error) => return Err(error),
        }
    }

    tracing::debug!(keys = advertised, "Advertised all images");
    Ok(advertised)
}
