use oci_driver::StoreError;

/// Errors from a [`Router`](crate::Router) or from advertising through one.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The router has not finished bootstrapping.
    #[error("router is not ready")]
    NotReady,

    /// Keys must be non-empty.
    #[error("invalid routing key {0:?}")]
    InvalidKey(String),

    /// Reading the content to advertise failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The routing backend failed.
    #[error("routing backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl RoutingError {
    /// The store error underneath, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            RoutingError::Store(error) => Some(error),
            _ => None,
        }
    }
}
