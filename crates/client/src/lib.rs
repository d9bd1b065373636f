// courier-client: realtime chat session layer.

pub mod backoff;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod notify;
pub mod outbox;
pub mod router;
pub mod session;
pub mod timers;
pub mod transport;

pub use client::{ChatClient, ChatClientBuilder, PendingAction, Subscription};
pub use config::ClientConfig;
pub use error::ClientError;
pub use notify::Notice;
pub use outbox::{ActionKind, ActionOutcome, Intent, OutboundAction};
pub use session::SessionState;
pub use transport::Credentials;
