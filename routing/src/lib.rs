//! # Peer routing
//!
//! The interface to the distribution layer that tells peers which node holds
//! which content, plus the glue that advertises a store's images through it.

use std::{fmt, net::SocketAddr, ops::Deref, sync::Arc};

use futures::stream::BoxStream;

mod advertise;
mod error;
mod memory;
mod tracker;

pub use advertise::{advertise_all, advertise_image, image_keys};
pub use error::RoutingError;
pub use memory::MemoryRouter;
pub use tracker::{Tracker, DEFAULT_REFRESH_INTERVAL};

/// A lazy, finite stream of peers holding some key.
pub type PeerStream = BoxStream<'static, SocketAddr>;

/// Content routing between peers.
///
/// Keys are digests and tag names, as strings.
#[async_trait::async_trait]
pub trait Router: fmt::Debug + Send + Sync {
    /// Whether the router can currently serve lookups.
    async fn ready(&self) -> Result<bool, RoutingError>;

    /// Find up to `count` peers holding `key`. This node is only included
    /// when `allow_self` is set. The stream may be empty.
    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<PeerStream, RoutingError>;

    /// Announce that this node holds `keys`. Advertising a key again has no
    /// further effect.
    async fn advertise(&self, keys: &[String]) -> Result<(), RoutingError>;
}

#[async_trait::async_trait]
impl<R> Router for Arc<R>
where
    R: Router + ?Sized,
{
    async fn ready(&self) -> Result<bool, RoutingError> {
        self.deref().ready().await
    }

    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<PeerStream, RoutingError> {
        self.deref().resolve(key, allow_self, count).await
    }

    async fn advertise(&self, keys: &[String]) -> Result<(), RoutingError> {
        self.deref().advertise(keys).await
    }
}
