use crate::config::RelayConfig;
use crate::relay::Relay;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Mailbox of the relay coordinator
    pub relay: Relay,
    /// Per-connection buffer and write timeout
    pub relay_config: RelayConfig,
}
