// Engine: the single-threaded core of the client.
//
// Owns the session manager, router, outbound queue, timers, and notice hub,
// and processes exactly one input at a time (an intent, a transport event,
// expired timers, or a history result). Every entry point takes `now`, so
// the whole session layer runs in virtual time under test. The async driver
// in `client.rs` is the only thing that touches real clocks and sockets.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_common::protocol::ws::ServerFrame;
use courier_common::types::{ChatMessage, EventKind, EventPayload, InboundEvent};
use courier_common::validation::validate_chat_id;

use crate::backoff::BackoffPolicy;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::history::{replay_events, ChatSnapshot, ChatStore, HistoryRequest};
use crate::notify::{Notice, NoticeHub};
use crate::outbox::{ActionKind, ActionOutcome, EnqueueOutcome, Intent, OutboundAction, OutboundQueue, Settled};
use crate::router::{DispatchOutcome, EventHandler, EventRouter, SubscriptionId};
use crate::session::{SessionManager, SessionSettings, SessionSignal, SessionState};
use crate::timers::{TimerKey, Timers};
use crate::transport::{Credentials, Transport, TransportEvent};

pub struct Engine<T: Transport> {
    session: SessionManager<T>,
    router: EventRouter,
    outbox: OutboundQueue,
    timers: Timers,
    notices: NoticeHub,
    store: Option<Box<dyn ChatStore>>,
    history_enabled: bool,
    /// Known chats and the newest message timestamp seen in each.
    cursors: BTreeMap<String, Option<DateTime<Utc>>>,
    /// Chats where the local user is marked as typing.
    local_typing: BTreeSet<String>,
    typing_idle: Duration,
    history_requests: Vec<HistoryRequest>,
    /// Bumped on logout so fetches issued for an earlier login are ignored.
    generation: u64,
    settled: Vec<Settled>,
}

impl<T: Transport> Engine<T> {
    pub fn new(config: &ClientConfig, transport: T) -> Result<Self, ClientError> {
        config.validate()?;
        let endpoint = config.server.ws_url.clone().ok_or(ClientError::MissingEndpoint)?;
        let reconnect = config.reconnect.policy();
        let settings = SessionSettings {
            endpoint,
            reconnect: reconnect.clone(),
            heartbeat_interval: config.heartbeat.interval(),
            heartbeat_timeout: config.heartbeat.timeout(),
            handshake_timeout: config.server.connect_timeout(),
        };

        Ok(Self {
            session: SessionManager::new(settings, transport),
            router: EventRouter::new(&config.router),
            outbox: OutboundQueue::new(&config.outbox, BackoffPolicy { jitter: 0.0, ..reconnect }),
            timers: Timers::new(),
            notices: NoticeHub::new(),
            store: None,
            history_enabled: false,
            cursors: BTreeMap::new(),
            local_typing: BTreeSet::new(),
            typing_idle: config.typing.idle(),
            history_requests: Vec::new(),
            generation: 0,
            settled: Vec::new(),
        })
    }

    pub fn with_store(mut self, store: Box<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Emit history resync requests when a session re-enters `Active`.
    pub fn with_history(mut self, enabled: bool) -> Self {
        self.history_enabled = enabled;
        self
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &SessionManager<T> {
        &self.session
    }

    pub fn outbox(&self) -> &OutboundQueue {
        &self.outbox
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn transport(&self) -> &T {
        self.session.transport()
    }

    pub fn typing_users(&self, chat_id: &str, now: Instant) -> Vec<String> {
        self.router.typing_users(chat_id, now)
    }

    pub fn chat_snapshot(&self, chat_id: &str) -> Option<ChatSnapshot> {
        self.store.as_ref().and_then(|store| store.chat_snapshot(chat_id))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn known_chats(&self) -> impl Iterator<Item = &str> {
        self.cursors.keys().map(String::as_str)
    }

    pub fn subscribe(&mut self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.router.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.router.unsubscribe(id)
    }

    pub fn notices(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<Notice> {
        self.notices.subscribe()
    }

    /// Actions settled since the last call.
    pub fn take_settled(&mut self) -> Vec<Settled> {
        std::mem::take(&mut self.settled)
    }

    /// History fetches the driver should run.
    pub fn take_history_requests(&mut self) -> Vec<HistoryRequest> {
        std::mem::take(&mut self.history_requests)
    }

    // ── Intents ────────────────────────────────────────────────────

    pub fn connect(&mut self, credentials: Credentials, now: Instant) -> Result<(), ClientError> {
        self.session.connect(credentials, now, &mut self.timers)?;
        self.process_signals(now);
        Ok(())
    }

    pub fn logout(&mut self, now: Instant) {
        self.outbox.cancel_all(&mut self.timers);
        self.router.clear_typing(&mut self.timers);
        self.local_typing.clear();
        self.timers.cancel_where(|key| matches!(key, TimerKey::LocalTyping(_)));
        self.session.logout(&mut self.timers);
        self.cursors.clear();
        self.history_requests.clear();
        self.generation += 1;
        self.process_signals(now);
    }

    /// Validate and queue an action; flushes right away when active.
    pub fn submit(&mut self, action: OutboundAction, now: Instant) -> Result<EnqueueOutcome, ClientError> {
        action.intent.validate()?;
        let chat_id = action.chat_id().to_string();

        if matches!(action.intent, Intent::SendMessage { .. }) && self.local_typing.remove(&chat_id) {
            self.timers.cancel(&TimerKey::LocalTyping(chat_id.clone()));
            let stop = OutboundAction::new(Intent::TypingStop { chat_id: chat_id.clone() }, now);
            self.outbox.enqueue(stop, &mut self.timers);
        }

        let echo = self.optimistic_echo(&action);
        self.cursors.entry(chat_id).or_insert(None);
        let outcome = self.outbox.enqueue(action, &mut self.timers);
        if let (EnqueueOutcome::Queued, Some(echo), Some(store)) = (outcome, echo, self.store.as_mut()) {
            store.apply_inbound_event(&echo);
        }
        self.flush(now);
        self.publish_settled();
        Ok(outcome)
    }

    /// Local keystroke: typing_start on the first one, typing_stop after idle.
    pub fn keystroke(&mut self, chat_id: &str, now: Instant) -> Result<(), ClientError> {
        validate_chat_id(chat_id)?;
        if self.local_typing.insert(chat_id.to_string()) {
            let start = OutboundAction::new(Intent::TypingStart { chat_id: chat_id.to_string() }, now);
            self.outbox.enqueue(start, &mut self.timers);
        }
        self.timers.schedule(TimerKey::LocalTyping(chat_id.to_string()), now + self.typing_idle);
        self.flush(now);
        self.publish_settled();
        Ok(())
    }

    // ── Inputs ─────────────────────────────────────────────────────

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        self.session.handle_transport_event(event, now, &mut self.timers);
        self.process_signals(now);
    }

    /// Fire every timer due at `now`.
    pub fn handle_timers(&mut self, now: Instant) {
        for key in self.timers.drain_expired(now) {
            if self.session.handle_timer(&key, now, &mut self.timers) {
                self.process_signals(now);
                continue;
            }
            match key {
                TimerKey::Action(action_id) => {
                    self.outbox.on_timer(&action_id, now, &mut self.timers);
                    self.flush(now);
                }
                TimerKey::TypingSweep => {
                    for stop in self.router.expire_typing(now, &mut self.timers) {
                        if let Some(store) = self.store.as_mut() {
                            store.apply_inbound_event(&stop);
                        }
                    }
                }
                TimerKey::LocalTyping(chat_id) => {
                    if self.local_typing.remove(&chat_id) {
                        let stop = OutboundAction::new(Intent::TypingStop { chat_id }, now);
                        self.outbox.enqueue(stop, &mut self.timers);
                        self.flush(now);
                    }
                }
                TimerKey::Handshake | TimerKey::Reconnect | TimerKey::Heartbeat | TimerKey::Liveness => {}
            }
            self.publish_settled();
        }
    }

    /// Replay a finished history fetch through the router.
    ///
    /// `generation` is the one carried by the originating `HistoryRequest`;
    /// results that outlived a logout are discarded.
    pub fn apply_history(
        &mut self,
        chat_id: &str,
        generation: u64,
        result: anyhow::Result<Vec<ChatMessage>>,
        now: Instant,
    ) {
        if generation != self.generation {
            debug!(%chat_id, generation, current = self.generation, "dropping stale history result");
            return;
        }
        match result {
            Ok(messages) => {
                let fetched = messages.len();
                let mut delivered = 0;
                for event in replay_events(chat_id, messages) {
                    if self.deliver_event(event, now) {
                        delivered += 1;
                    }
                }
                info!(%chat_id, fetched, delivered, "history resync applied");
            }
            Err(error) => {
                warn!(%chat_id, error = %format!("{error:#}"), "history resync failed");
                self.notices.publish(Notice::HistoryFailed {
                    chat_id: chat_id.to_string(),
                    reason: format!("{error:#}"),
                });
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn process_signals(&mut self, now: Instant) {
        for signal in self.session.take_signals() {
            match signal {
                SessionSignal::StateChanged { from, to } => {
                    self.notices.publish(Notice::StateChanged { from, to });
                    if from == SessionState::Active {
                        self.outbox.on_disconnect(&mut self.timers);
                    }
                    if to == SessionState::Active {
                        if self.session.activations() > 1 {
                            self.request_resync();
                        }
                        self.flush(now);
                    }
                }
                SessionSignal::Inbound(frame) => self.handle_inbound(frame, now),
                SessionSignal::Malformed { error, .. } => {
                    self.notices.publish(Notice::MalformedFrame { reason: error.to_string() });
                }
                SessionSignal::ReconnectScheduled { attempt, delay } => {
                    self.notices.publish(Notice::ReconnectScheduled {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                }
                SessionSignal::ConnectionLost { connection, reason } => {
                    debug!(%connection, %reason, "connection lost; queued actions return to pending");
                }
                SessionSignal::AuthRejected { reason } => {
                    self.notices.publish(Notice::AuthFailed { reason });
                }
                SessionSignal::ReconnectExhausted { attempts } => {
                    self.notices.publish(Notice::ReconnectExhausted { attempts });
                }
            }
        }
        self.publish_settled();
    }

    fn handle_inbound(&mut self, frame: ServerFrame, now: Instant) {
        match frame {
            ServerFrame::Ack(ack) => {
                if self.outbox.on_ack(&ack, &mut self.timers) {
                    self.flush(now);
                }
            }
            ServerFrame::Event(event) => {
                self.deliver_event(event, now);
            }
            ServerFrame::Error { code, message } => {
                warn!(%code, %message, "server reported an error");
                self.notices.publish(Notice::ServerError { code, message });
            }
            ServerFrame::Unknown { kind } => debug!(%kind, "ignoring unknown frame kind"),
            ServerFrame::AuthOk { .. } | ServerFrame::AuthRejected { .. } | ServerFrame::Pong => {}
        }
    }

    /// Route one event; returns whether it reached subscribers.
    fn deliver_event(&mut self, event: InboundEvent, now: Instant) -> bool {
        let outcome = self.router.dispatch(&event, now, &mut self.timers);
        if !matches!(outcome, DispatchOutcome::Delivered { .. }) {
            return false;
        }

        if let (Some(chat_id), EventPayload::Message { message }) = (&event.chat_id, &event.payload) {
            let cursor = self.cursors.entry(chat_id.clone()).or_insert(None);
            if let Some(ts) = event.server_timestamp.or(message.timestamp) {
                *cursor = (*cursor).max(Some(ts));
            }
        }
        if let Some(store) = self.store.as_mut() {
            store.apply_inbound_event(&event);
        }
        true
    }

    fn request_resync(&mut self) {
        if !self.history_enabled {
            return;
        }
        let Some(session) = self.session.session() else {
            return;
        };
        let token = session.credentials.token.clone();
        for (chat_id, since) in &self.cursors {
            debug!(%chat_id, ?since, "requesting history resync");
            self.history_requests.push(HistoryRequest {
                chat_id: chat_id.clone(),
                since: *since,
                token: token.clone(),
                generation: self.generation,
            });
        }
    }

    fn flush(&mut self, now: Instant) {
        if self.session.state() == SessionState::Active {
            self.outbox.flush(&mut self.session, now, &mut self.timers);
        }
    }

    fn publish_settled(&mut self) {
        for settled in self.outbox.take_settled() {
            self.reconcile_echo(&settled);
            self.notices.publish(Notice::ActionSettled {
                action_id: settled.action_id.clone(),
                chat_id: settled.chat_id.clone(),
                kind: settled.kind,
                outcome: settled.outcome.clone(),
            });
            self.settled.push(settled);
        }
    }

    /// Settle the optimistic echo of a finished send.
    fn reconcile_echo(&mut self, settled: &Settled) {
        if settled.kind != ActionKind::SendMessage {
            return;
        }
        let Some(store) = self.store.as_mut() else {
            return;
        };
        match &settled.outcome {
            ActionOutcome::Delivered { message_id: Some(message_id), .. } => {
                store.confirm_sent(&settled.chat_id, &settled.action_id, message_id);
            }
            ActionOutcome::Delivered { message_id: None, .. } => {}
            _ => store.mark_failed(&settled.chat_id, &settled.action_id),
        }
    }

    /// Local copy of a sent message, shown before the server confirms it.
    fn optimistic_echo(&self, action: &OutboundAction) -> Option<InboundEvent> {
        let Intent::SendMessage { chat_id, content, kind, media_url, reply_to } = &action.intent else {
            return None;
        };
        self.store.as_ref()?;
        let sender_id = self.session.session().map(|session| session.user_id().to_string());
        Some(InboundEvent {
            event_id: None,
            chat_id: Some(chat_id.clone()),
            payload: EventPayload::Message {
                message: ChatMessage {
                    content: content.clone(),
                    sender_id,
                    kind: *kind,
                    media_url: media_url.clone(),
                    reply_to: reply_to.clone(),
                    client_id: Some(action.id.clone()),
                    ..Default::default()
                },
            },
            server_timestamp: None,
            synthetic: true,
        })
    }
}
