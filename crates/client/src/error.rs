// Library errors surfaced by the client API.

use thiserror::Error;

use courier_common::validation::ValidationError;

use crate::config::ConfigError;
use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a session is already {0}; log out first")]
    AlreadyConnected(SessionState),

    #[error("invalid action: {0}")]
    InvalidAction(#[from] ValidationError),

    #[error("action {0} was already settled")]
    DuplicateAction(String),

    #[error("no websocket endpoint configured (set server.ws_url)")]
    MissingEndpoint,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("client event loop has shut down")]
    Shutdown,
}
