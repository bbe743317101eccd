use std::time::Duration;

/// Failures inside the relay. None of these are ever sent back to a client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("write to receiver timed out after {0:?}")]
    DeliveryTimeout(Duration),

    #[error("receiver connection is gone")]
    ReceiverGone,

    #[error("relay coordinator is not running")]
    CoordinatorGone,
}
