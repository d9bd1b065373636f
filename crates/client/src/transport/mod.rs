// Transport: one physical duplex connection per `ConnectionId`.
//
// `open` only validates and starts the handshake; completion, frames,
// errors, and closes are reported asynchronously as `TransportEvent`s on a
// single listener channel, in arrival order. There is no retry logic here.

pub mod ws;

use std::fmt;

use thiserror::Error;

use courier_common::protocol::ws::ClientFrame;

pub use ws::WsTransport;

/// Identifier of one physical connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who the connection authenticates as.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), token: token.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Frame(String),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub connection: ConnectionId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(connection: ConnectionId, kind: TransportEventKind) -> Self {
        Self { connection, kind }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connect timed out")]
    TimedOut,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendFailure {
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),
    #[error("no active connection")]
    NoConnection,
}

/// Mechanical I/O over a persistent connection.
pub trait Transport {
    /// Begin opening `connection`. Synchronous errors are validation failures;
    /// handshake outcomes arrive later as `Opened`, `Error`, or `Closed`.
    fn open(
        &mut self,
        connection: ConnectionId,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<(), ConnectFailure>;

    /// Write one frame. Fails when the connection is not open.
    fn send(&mut self, connection: ConnectionId, frame: &ClientFrame) -> Result<(), SendFailure>;

    /// Release the connection, aborting an in-flight open. Idempotent.
    fn close(&mut self, connection: ConnectionId);
}

/// Anything that accepts frames on behalf of the current connection.
pub trait FrameSink {
    fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), SendFailure>;
}
