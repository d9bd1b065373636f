// Async client handle and its event loop.
//
// `ChatClient` is a cheap, cloneable handle. All session state lives in one
// `Engine` owned by a single tokio task, which multiplexes:
//   commands from handles, transport events, the next timer deadline,
//   and finished history fetches.
// Nothing else touches the engine, so there are no locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_common::types::{ChatMessage, EventKind, InboundEvent};

use crate::config::ClientConfig;
use crate::engine::Engine;
use crate::error::ClientError;
use crate::history::{ChatSnapshot, ChatStore, HistorySource, RestHistorySource};
use crate::notify::Notice;
use crate::outbox::{ActionOutcome, EnqueueOutcome, Intent, OutboundAction};
use crate::router::{EventHandler, SubscriptionId};
use crate::session::SessionState;
use crate::transport::{Credentials, Transport, TransportEvent, WsTransport};

/// How long the loop sleeps when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(3_600);

/// Chat id and login generation of the request, with its result.
type HistoryResult = (String, u64, anyhow::Result<Vec<ChatMessage>>);

enum Command {
    Connect { credentials: Credentials, reply: oneshot::Sender<Result<(), ClientError>> },
    Logout { reply: oneshot::Sender<()> },
    Submit {
        action: OutboundAction,
        reply: oneshot::Sender<Result<EnqueueOutcome, ClientError>>,
        outcome: oneshot::Sender<ActionOutcome>,
    },
    Keystroke { chat_id: String, reply: oneshot::Sender<Result<(), ClientError>> },
    Subscribe { kind: EventKind, handler: EventHandler, reply: oneshot::Sender<SubscriptionId> },
    Unsubscribe { id: SubscriptionId },
    Notices { reply: oneshot::Sender<mpsc::UnboundedReceiver<Notice>> },
    TypingUsers { chat_id: String, reply: oneshot::Sender<Vec<String>> },
    Snapshot { chat_id: String, reply: oneshot::Sender<Option<ChatSnapshot>> },
    Shutdown { reply: oneshot::Sender<()> },
}

// ── Builder ────────────────────────────────────────────────────────

pub struct ChatClientBuilder {
    config: ClientConfig,
    store: Option<Box<dyn ChatStore>>,
    history: Option<Arc<dyn HistorySource>>,
}

impl ChatClientBuilder {
    pub fn with_store(mut self, store: Box<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_history_source(mut self, source: Arc<dyn HistorySource>) -> Self {
        self.history = Some(source);
        self
    }

    /// Resync history over REST from `server.api_url`, if configured.
    pub fn with_rest_history(self) -> anyhow::Result<Self> {
        match self.config.server.api_url.clone() {
            Some(api_url) => {
                let source = RestHistorySource::new(&api_url)?;
                Ok(self.with_history_source(Arc::new(source)))
            }
            None => Ok(self),
        }
    }

    /// Spawn the event loop on the current runtime with a WebSocket transport.
    pub fn spawn(self) -> Result<ChatClient, ClientError> {
        let connect_timeout = self.config.server.connect_timeout();
        self.spawn_with_transport(move |events| WsTransport::new(events, connect_timeout))
    }

    /// Spawn with a custom transport; `make` receives the event channel.
    pub fn spawn_with_transport<T, F>(self, make: F) -> Result<ChatClient, ClientError>
    where
        T: Transport + Send + 'static,
        F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> T,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(&self.config, make(events_tx))?.with_history(self.history.is_some());
        if let Some(store) = self.store {
            engine = engine.with_store(store);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(engine.state());
        let driver = Driver {
            engine,
            history: self.history,
            fetch_timeout: self.config.server.connect_timeout(),
            state_tx,
            waiters: HashMap::new(),
            fetches: FuturesUnordered::new(),
        };
        let task = tokio::spawn(driver.run(commands_rx, events_rx));
        info!("chat client started");

        Ok(ChatClient { commands: commands_tx, state: state_rx, task: Arc::new(task) })
    }
}

// ── Handle ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    task: Arc<JoinHandle<()>>,
}

impl ChatClient {
    pub fn builder(config: ClientConfig) -> ChatClientBuilder {
        ChatClientBuilder { config, store: None, history: None }
    }

    /// Spawn with defaults: WebSocket transport and no chat store.
    pub fn spawn(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder(config).spawn()
    }

    pub async fn connect(&self, credentials: Credentials) -> Result<(), ClientError> {
        self.request(|reply| Command::Connect { credentials, reply }).await?
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Logout { reply }).await
    }

    /// Queue an intent under a fresh action id.
    pub async fn send(&self, intent: Intent) -> Result<PendingAction, ClientError> {
        self.send_action(OutboundAction::new(intent, Instant::now())).await
    }

    /// Queue an action with a caller-chosen id (the idempotency key).
    pub async fn send_action(&self, action: OutboundAction) -> Result<PendingAction, ClientError> {
        let action_id = action.id.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let enqueued = self
            .request(|reply| Command::Submit { action, reply, outcome: outcome_tx })
            .await??;
        debug!(%action_id, ?enqueued, "action submitted");
        Ok(PendingAction { action_id, outcome: outcome_rx })
    }

    pub async fn keystroke(&self, chat_id: impl Into<String>) -> Result<(), ClientError> {
        let chat_id = chat_id.into();
        self.request(|reply| Command::Keystroke { chat_id, reply }).await?
    }

    /// Register `handler` for every delivered event of `kind`. Handlers run
    /// on the event-loop task and must not block.
    pub async fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<Subscription, ClientError>
    where
        F: FnMut(&InboundEvent) + Send + 'static,
    {
        let handler: EventHandler = Box::new(handler);
        let id = self.request(|reply| Command::Subscribe { kind, handler, reply }).await?;
        Ok(Subscription { id, commands: self.commands.clone() })
    }

    /// Lifecycle and failure notices from now on.
    pub async fn notices(&self) -> Result<mpsc::UnboundedReceiver<Notice>, ClientError> {
        self.request(|reply| Command::Notices { reply }).await
    }

    pub async fn typing_users(&self, chat_id: impl Into<String>) -> Result<Vec<String>, ClientError> {
        let chat_id = chat_id.into();
        self.request(|reply| Command::TypingUsers { chat_id, reply }).await
    }

    pub async fn chat_snapshot(&self, chat_id: impl Into<String>) -> Result<Option<ChatSnapshot>, ClientError> {
        let chat_id = chat_id.into();
        self.request(|reply| Command::Snapshot { chat_id, reply }).await
    }

    pub fn connection_state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`, or `timeout` elapses.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|current| *current == target))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    /// Log out, cancel queued actions, and stop the event loop.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }
}

/// Awaitable final outcome of a submitted action.
#[derive(Debug)]
pub struct PendingAction {
    action_id: String,
    outcome: oneshot::Receiver<ActionOutcome>,
}

impl PendingAction {
    pub fn id(&self) -> &str {
        &self.action_id
    }

    pub async fn outcome(self) -> Result<ActionOutcome, ClientError> {
        self.outcome.await.map_err(|_| ClientError::Shutdown)
    }
}

#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(self) {
        let _ = self.commands.send(Command::Unsubscribe { id: self.id });
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect { .. } => "connect",
            Self::Logout { .. } => "logout",
            Self::Submit { .. } => "submit",
            Self::Keystroke { .. } => "keystroke",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Notices { .. } => "notices",
            Self::TypingUsers { .. } => "typing_users",
            Self::Snapshot { .. } => "snapshot",
            Self::Shutdown { .. } => "shutdown",
        };
        f.write_str(name)
    }
}

// ── Event loop ─────────────────────────────────────────────────────

struct Driver<T: Transport> {
    engine: Engine<T>,
    history: Option<Arc<dyn HistorySource>>,
    fetch_timeout: Duration,
    state_tx: watch::Sender<SessionState>,
    waiters: HashMap<String, Vec<oneshot::Sender<ActionOutcome>>>,
    fetches: FuturesUnordered<BoxFuture<'static, HistoryResult>>,
}

impl<T: Transport> Driver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let wake_at = self.engine.next_deadline().unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.engine.logout(Instant::now());
                        self.after_turn();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.engine.logout(Instant::now());
                        self.after_turn();
                        break;
                    }
                },
                Some(event) = transport_events.recv() => {
                    self.engine.handle_transport_event(event, Instant::now());
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    self.engine.handle_timers(Instant::now());
                }
                Some((chat_id, generation, result)) = self.fetches.next(), if !self.fetches.is_empty() => {
                    self.engine.apply_history(&chat_id, generation, result, Instant::now());
                }
            }

            self.after_turn();
        }
        info!("chat client stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Connect { credentials, reply } => {
                let _ = reply.send(self.engine.connect(credentials, now));
            }
            Command::Logout { reply } => {
                self.engine.logout(now);
                // Dropping the futures aborts their requests.
                self.fetches = FuturesUnordered::new();
                let _ = reply.send(());
            }
            Command::Submit { action, reply, outcome } => {
                let action_id = action.id.clone();
                let already_queued = self.engine.outbox().contains(&action_id);
                match self.engine.submit(action, now) {
                    Ok(EnqueueOutcome::DuplicateId) if !already_queued => {
                        let _ = reply.send(Err(ClientError::DuplicateAction(action_id)));
                    }
                    Ok(enqueued) => {
                        self.waiters.entry(action_id).or_default().push(outcome);
                        let _ = reply.send(Ok(enqueued));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            Command::Keystroke { chat_id, reply } => {
                let _ = reply.send(self.engine.keystroke(&chat_id, now));
            }
            Command::Subscribe { kind, handler, reply } => {
                let _ = reply.send(self.engine.subscribe(kind, handler));
            }
            Command::Unsubscribe { id } => {
                self.engine.unsubscribe(id);
            }
            Command::Notices { reply } => {
                let _ = reply.send(self.engine.notices());
            }
            Command::TypingUsers { chat_id, reply } => {
                let _ = reply.send(self.engine.typing_users(&chat_id, now));
            }
            Command::Snapshot { chat_id, reply } => {
                let _ = reply.send(self.engine.chat_snapshot(&chat_id));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Publish state, resolve settled actions, and start requested fetches.
    fn after_turn(&mut self) {
        self.state_tx.send_if_modified(|state| {
            let current = self.engine.state();
            let changed = *state != current;
            *state = current;
            changed
        });

        for settled in self.engine.take_settled() {
            if let Some(waiters) = self.waiters.remove(&settled.action_id) {
                for waiter in waiters {
                    let _ = waiter.send(settled.outcome.clone());
                }
            }
        }

        for request in self.engine.take_history_requests() {
            let Some(source) = self.history.as_ref().map(Arc::clone) else {
                continue;
            };
            let chat_id = request.chat_id.clone();
            let generation = request.generation;
            let timeout = self.fetch_timeout;
            self.fetches.push(Box::pin(async move {
                let result = match tokio::time::timeout(timeout, source.fetch(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("history fetch timed out after {timeout:?}")),
                };
                if let Err(error) = &result {
                    warn!(%chat_id, error = %format!("{error:#}"), "history fetch failed");
                }
                (chat_id, generation, result)
            }));
        }
    }
}
