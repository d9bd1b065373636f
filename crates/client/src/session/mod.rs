// Session manager: connection lifecycle for one logged-in user.
//
// States flow through:
//   Disconnected → Connecting → Authenticating → Active
//   Active → Reconnecting → Connecting  (transport loss, heartbeat miss)
//   Authenticating → Failed             (credentials rejected, no retry)
//   Reconnecting → Failed               (backoff attempts exhausted)
//   any → Disconnected                  (logout)
//
// The manager never blocks. Timeouts are keys in the shared `Timers`, and
// everything the rest of the engine needs to react to is queued as a
// `SessionSignal` and drained with `take_signals()`.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_common::protocol::ws::{decode_frame, ClientFrame, FrameError, ServerFrame};

use crate::backoff::BackoffPolicy;
use crate::error::ClientError;
use crate::timers::{TimerKey, Timers};
use crate::transport::{
    ConnectionId, Credentials, FrameSink, SendFailure, Transport, TransportEvent,
    TransportEventKind,
};

// ── State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Reconnecting,
    Failed,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// A session exists and is working towards (or holding) a connection.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating | Self::Active | Self::Reconnecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Opening,
    Open,
}

/// One physical connection. Replaced on every reconnect.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub phase: ConnectionPhase,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// The reconnect-spanning identity of "online as user U".
#[derive(Debug, Clone)]
pub struct Session {
    pub credentials: Credentials,
    /// Every connection this session has used, oldest first.
    pub connections: Vec<ConnectionId>,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.credentials.user_id
    }
}

/// Everything the engine reacts to after feeding the manager an input.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    StateChanged { from: SessionState, to: SessionState },
    /// A non-control frame received while active.
    Inbound(ServerFrame),
    Malformed { connection: ConnectionId, error: FrameError },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ConnectionLost { connection: ConnectionId, reason: String },
    AuthRejected { reason: String },
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: String,
    pub reconnect: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
}

// ── Manager ────────────────────────────────────────────────────────

pub struct SessionManager<T: Transport> {
    settings: SessionSettings,
    transport: T,
    state: SessionState,
    session: Option<Session>,
    connection: Option<Connection>,
    next_connection: u64,
    /// Consecutive failed connection attempts since the last `Active`.
    failures: u32,
    /// Number of times the current session reached `Active`.
    activations: u64,
    rng: StdRng,
    signals: Vec<SessionSignal>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(settings: SessionSettings, transport: T) -> Self {
        Self {
            settings,
            transport,
            state: SessionState::Disconnected,
            session: None,
            connection: None,
            next_connection: 1,
            failures: 0,
            activations: 0,
            rng: StdRng::from_entropy(),
            signals: Vec::new(),
        }
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn take_signals(&mut self) -> Vec<SessionSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Start a session. Allowed from `Disconnected` and `Failed`.
    pub fn connect(
        &mut self,
        credentials: Credentials,
        now: Instant,
        timers: &mut Timers,
    ) -> Result<(), ClientError> {
        if self.state.is_live() {
            return Err(ClientError::AlreadyConnected(self.state));
        }

        info!(user_id = %credentials.user_id, "starting chat session");
        self.session = Some(Session { credentials, connections: Vec::new() });
        self.failures = 0;
        self.activations = 0;
        self.open_connection(now, timers);
        Ok(())
    }

    /// End the session: close the transport and cancel every session timer.
    pub fn logout(&mut self, timers: &mut Timers) {
        if let Some(conn) = self.connection.take() {
            self.transport.close(conn.id);
        }
        cancel_session_timers(timers);
        if let Some(session) = self.session.take() {
            info!(user_id = %session.user_id(), "chat session logged out");
        }
        self.failures = 0;
        self.transition(SessionState::Disconnected);
    }

    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        timers: &mut Timers,
    ) {
        let current = self.connection.as_ref().map(|conn| conn.id);
        if current != Some(event.connection) {
            debug!(connection = %event.connection, "ignoring event from stale connection");
            return;
        }

        match event.kind {
            TransportEventKind::Opened => self.on_opened(now, timers),
            TransportEventKind::Frame(text) => self.on_frame(event.connection, &text, now, timers),
            TransportEventKind::Error(reason) => self.connection_failed(reason, now, timers),
            TransportEventKind::Closed => {
                self.connection_failed("connection closed by server".to_string(), now, timers)
            }
        }
    }

    /// Handle an expired session timer. Returns false for keys it doesn't own.
    pub fn handle_timer(&mut self, key: &TimerKey, now: Instant, timers: &mut Timers) -> bool {
        match key {
            TimerKey::Handshake => {
                if matches!(self.state, SessionState::Connecting | SessionState::Authenticating) {
                    self.connection_failed("handshake timed out".to_string(), now, timers);
                }
            }
            TimerKey::Reconnect => {
                if self.state == SessionState::Reconnecting {
                    self.open_connection(now, timers);
                }
            }
            TimerKey::Heartbeat => {
                if self.state == SessionState::Active {
                    match self.send_frame(&ClientFrame::Ping) {
                        Ok(()) => timers.schedule(
                            TimerKey::Heartbeat,
                            now + self.settings.heartbeat_interval,
                        ),
                        Err(error) => {
                            self.connection_failed(format!("heartbeat send failed: {error}"), now, timers)
                        }
                    }
                }
            }
            TimerKey::Liveness => {
                if self.state == SessionState::Active {
                    self.connection_failed("heartbeat timeout".to_string(), now, timers);
                }
            }
            _ => return false,
        }
        true
    }

    // ── Internals ──────────────────────────────────────────────────

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(%from, %to, "session state changed");
        self.signals.push(SessionSignal::StateChanged { from, to });
    }

    fn open_connection(&mut self, now: Instant, timers: &mut Timers) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        session.connections.push(id);
        let credentials = session.credentials.clone();

        self.transition(SessionState::Connecting);
        match self.transport.open(id, &self.settings.endpoint, &credentials) {
            Ok(()) => {
                debug!(connection = %id, attempt = self.failures, "opening connection");
                self.connection =
                    Some(Connection { id, phase: ConnectionPhase::Opening, created_at: now, last_activity: now });
                timers.schedule(TimerKey::Handshake, now + self.settings.handshake_timeout);
            }
            Err(error) => {
                warn!(connection = %id, %error, "failed to open connection");
                self.schedule_reconnect(now, timers);
            }
        }
    }

    fn on_opened(&mut self, now: Instant, timers: &mut Timers) {
        if self.state != SessionState::Connecting {
            return;
        }
        let (Some(conn), Some(session)) = (self.connection.as_mut(), self.session.as_ref()) else {
            return;
        };
        conn.phase = ConnectionPhase::Open;
        conn.last_activity = now;
        let id = conn.id;

        let auth = ClientFrame::auth(&session.credentials.token, &session.credentials.user_id);
        if let Err(error) = self.transport.send(id, &auth) {
            self.connection_failed(format!("failed to send auth frame: {error}"), now, timers);
            return;
        }
        self.transition(SessionState::Authenticating);
    }

    fn on_frame(&mut self, connection: ConnectionId, text: &str, now: Instant, timers: &mut Timers) {
        if let Some(conn) = self.connection.as_mut() {
            conn.last_activity = now;
        }
        if self.state == SessionState::Active {
            timers.schedule(TimerKey::Liveness, now + self.settings.heartbeat_timeout);
        }

        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%connection, %error, "dropping malformed frame");
                self.signals.push(SessionSignal::Malformed { connection, error });
                return;
            }
        };

        match frame {
            ServerFrame::AuthOk { .. } => {
                if self.state == SessionState::Authenticating {
                    self.activate(now, timers);
                }
            }
            ServerFrame::AuthRejected { reason } => self.auth_rejected(reason, timers),
            ServerFrame::Pong => {}
            other if self.state == SessionState::Active => {
                self.signals.push(SessionSignal::Inbound(other));
            }
            other => debug!(%connection, state = %self.state, ?other, "dropping frame before auth"),
        }
    }

    fn activate(&mut self, now: Instant, timers: &mut Timers) {
        timers.cancel(&TimerKey::Handshake);
        timers.schedule(TimerKey::Heartbeat, now + self.settings.heartbeat_interval);
        timers.schedule(TimerKey::Liveness, now + self.settings.heartbeat_timeout);
        self.failures = 0;
        self.activations += 1;
        self.transition(SessionState::Active);
    }

    fn auth_rejected(&mut self, reason: String, timers: &mut Timers) {
        warn!(%reason, "authentication rejected");
        if let Some(conn) = self.connection.take() {
            self.transport.close(conn.id);
        }
        cancel_session_timers(timers);
        self.signals.push(SessionSignal::AuthRejected { reason });
        self.transition(SessionState::Failed);
    }

    /// Tear down the current connection after a transient failure.
    fn connection_failed(&mut self, reason: String, now: Instant, timers: &mut Timers) {
        if let Some(conn) = self.connection.take() {
            self.transport.close(conn.id);
            if self.state == SessionState::Active {
                warn!(connection = %conn.id, %reason, "connection lost");
                self.signals.push(SessionSignal::ConnectionLost { connection: conn.id, reason });
            } else {
                warn!(connection = %conn.id, %reason, state = %self.state, "connection attempt failed");
            }
        }
        timers.cancel(&TimerKey::Handshake);
        timers.cancel(&TimerKey::Heartbeat);
        timers.cancel(&TimerKey::Liveness);
        self.schedule_reconnect(now, timers);
    }

    fn schedule_reconnect(&mut self, now: Instant, timers: &mut Timers) {
        if self.settings.reconnect.exhausted(self.failures) {
            warn!(attempts = self.failures, "reconnect attempts exhausted");
            self.signals.push(SessionSignal::ReconnectExhausted { attempts: self.failures });
            self.transition(SessionState::Failed);
            return;
        }

        let delay = self.settings.reconnect.jittered_delay(self.failures, &mut self.rng);
        self.failures += 1;
        timers.schedule(TimerKey::Reconnect, now + delay);
        self.transition(SessionState::Reconnecting);
        info!(attempt = self.failures, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.signals.push(SessionSignal::ReconnectScheduled { attempt: self.failures, delay });
    }
}

impl<T: Transport> FrameSink for SessionManager<T> {
    /// Application frames are only written on an active session.
    fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), SendFailure> {
        if self.state != SessionState::Active {
            return Err(SendFailure::NoConnection);
        }
        let Some(conn) = self.connection.as_ref() else {
            return Err(SendFailure::NoConnection);
        };
        self.transport.send(conn.id, frame)
    }
}

fn cancel_session_timers(timers: &mut Timers) {
    for key in [TimerKey::Handshake, TimerKey::Reconnect, TimerKey::Heartbeat, TimerKey::Liveness] {
        timers.cancel(&key);
    }
}
