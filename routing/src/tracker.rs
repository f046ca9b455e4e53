use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use oci_driver::{Event, EventKind, EventStream};
use oci_store::Store;
use tokio_util::sync::CancellationToken;

use crate::{advertise_all, advertise_image, Router, RoutingError};

/// How often every image is advertised again.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Keeps a store's images advertised.
///
/// Advertises everything on start, then again on every refresh tick, and
/// advertises new content as soon as the store reports it.
#[derive(Debug, Clone)]
pub struct Tracker {
    router: Arc<dyn Router>,
    store: Store,
    refresh: Duration,
}

impl Tracker {
    /// Track `store` through `router`.
    pub fn new(router: Arc<dyn Router>, store: Store) -> Self {
        Self {
            router,
            store,
            refresh: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Change how often everything is advertised again.
    pub fn with_refresh_interval(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Run until `cancel` fires.
    ///
    /// Fails only if the first full advertisement fails; later failures are
    /// logged and retried on the next tick.
    #[tracing::instrument(skip_all, fields(store = self.store.name()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RoutingError> {
        advertise_all(&*self.router, &self.store).await?;

        let mut events = if self.store.supports_events() {
            self.store.subscribe().await?
        } else {
            None
        };

        let mut refresh = tokio::time::interval(self.refresh);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {
                    if let Err(error) = advertise_all(&*self.router, &self.store).await {
                        tracing::warn!(%error, "Failed to refresh advertisements");
                    }
                }
                event = next_event(&mut events) => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        tracing::debug!("Store events ended, relying on refresh");
                        events = None;
                    }
                },
            }
        }

        tracing::debug!("Tracker stopped");
        Ok(())
    }

    async fn handle(&self, event: Event) {
        if event.kind == EventKind::Delete {
            tracing::trace!(%event, "Ignoring deletion");
            return;
        }

        let result = async {
            let images = self.store.list_images().await?;
            let matching: Vec<_> = images
                .into_iter()
                .filter(|image| image.digest.as_ref() == Some(&event.digest))
                .collect();

            if matching.is_empty() {
                return self.router.advertise(&[event.digest.to_string()]).await;
            }
            for image in &matching {
                advertise_image(&*self.router, &self.store, image).await?;
            }
            Ok(())
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(%event, %error, "Failed to advertise new content");
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<Event> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}
