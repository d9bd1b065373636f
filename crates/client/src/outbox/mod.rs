// Outbound queue: per-chat FIFO of client intents, idempotent by action id.
//
// Ack-requiring actions move through:
//   pending → in_flight → settled            (happy path)
//   pending → in_flight → waiting → pending  (ack timeout, backoff)
//   in_flight → pending                      (connection lost, no attempt)
//   in_flight → failed                       (after max_attempts timeouts)
//
// Typing actions are ephemeral: writing them to an active connection
// settles them. Each chat is stop-and-wait; nothing behind an in-flight
// head is written until the head settles.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_common::protocol::ws::{AckResult, ActionAck, ClientFrame};
use courier_common::types::{MessageKind, ReplyRef};
use courier_common::validation::{validate_chat_id, validate_content, validate_id_len, ValidationError};

use crate::backoff::BackoffPolicy;
use crate::config::OutboxConfig;
use crate::timers::{TimerKey, Timers};
use crate::transport::FrameSink;

// ── Constants ───────────────────────────────────────────────────────

/// How many settled action ids are remembered for duplicate detection.
const SETTLED_MEMORY: usize = 1_024;

// ── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    TypingStart,
    TypingStop,
    ReadReceipt,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::TypingStart => "typing_start",
            Self::TypingStop => "typing_stop",
            Self::ReadReceipt => "read_receipt",
        }
    }

    pub fn requires_ack(self) -> bool {
        matches!(self, Self::SendMessage | Self::ReadReceipt)
    }
}

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SendMessage {
        chat_id: String,
        content: String,
        kind: MessageKind,
        media_url: Option<String>,
        reply_to: Option<ReplyRef>,
    },
    TypingStart { chat_id: String },
    TypingStop { chat_id: String },
    ReadReceipt { chat_id: String, message_id: String },
}

impl Intent {
    /// Plain text message.
    pub fn message(chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::SendMessage {
            chat_id: chat_id.into(),
            content: content.into(),
            kind: MessageKind::Text,
            media_url: None,
            reply_to: None,
        }
    }

    pub fn chat_id(&self) -> &str {
        match self {
            Self::SendMessage { chat_id, .. }
            | Self::TypingStart { chat_id }
            | Self::TypingStop { chat_id }
            | Self::ReadReceipt { chat_id, .. } => chat_id,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SendMessage { .. } => ActionKind::SendMessage,
            Self::TypingStart { .. } => ActionKind::TypingStart,
            Self::TypingStop { .. } => ActionKind::TypingStop,
            Self::ReadReceipt { .. } => ActionKind::ReadReceipt,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_chat_id(self.chat_id())?;
        match self {
            Self::SendMessage { content, .. } => validate_content(content),
            Self::ReadReceipt { message_id, .. } => validate_id_len("message id", message_id),
            Self::TypingStart { .. } | Self::TypingStop { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    InFlight,
    /// Ack timed out; waiting out the retry backoff.
    Waiting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAction {
    /// Client-generated idempotency key, reused on every resend.
    pub id: String,
    pub intent: Intent,
    pub created_at: Instant,
    pub retries: u32,
    pub state: ActionState,
}

impl OutboundAction {
    pub fn new(intent: Intent, now: Instant) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), intent, now)
    }

    pub fn with_id(id: impl Into<String>, intent: Intent, now: Instant) -> Self {
        Self { id: id.into(), intent, created_at: now, retries: 0, state: ActionState::Pending }
    }

    pub fn chat_id(&self) -> &str {
        self.intent.chat_id()
    }

    pub fn kind(&self) -> ActionKind {
        self.intent.kind()
    }

    pub fn to_frame(&self) -> ClientFrame {
        let action_id = self.id.clone();
        match &self.intent {
            Intent::SendMessage { chat_id, content, kind, media_url, reply_to } => {
                ClientFrame::Message {
                    action_id,
                    chat_id: chat_id.clone(),
                    content: content.clone(),
                    message_type: *kind,
                    media_url: media_url.clone(),
                    reply_to: reply_to.clone(),
                }
            }
            Intent::TypingStart { chat_id } => {
                ClientFrame::Typing { action_id, chat_id: chat_id.clone(), is_typing: true }
            }
            Intent::TypingStop { chat_id } => {
                ClientFrame::Typing { action_id, chat_id: chat_id.clone(), is_typing: false }
            }
            Intent::ReadReceipt { chat_id, message_id } => ClientFrame::Read {
                action_id,
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
            },
        }
    }
}

/// Final result of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Acked by the server, or written to the socket for ephemeral kinds.
    Delivered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        duplicate: bool,
    },
    Rejected { reason: String },
    Failed { attempts: u32 },
    /// Evicted because the chat queue hit capacity.
    Dropped,
    /// Cancelled out by a matching typing action before being written.
    Collapsed,
    /// Discarded on logout.
    Cancelled,
}

impl ActionOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub action_id: String,
    pub chat_id: String,
    pub kind: ActionKind,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Id already queued or recently settled; the action was ignored.
    DuplicateId,
    /// A `typing_stop` cancelled an unflushed `typing_start`.
    Collapsed,
    /// A `typing_start` is already waiting to be written.
    Coalesced,
    /// Chat at capacity with nothing evictable; the new action was dropped.
    Overflow,
}

// ── Queue ───────────────────────────────────────────────────────────

pub struct OutboundQueue {
    max_per_chat: usize,
    ack_timeout: Duration,
    retry: BackoffPolicy,
    chats: BTreeMap<String, VecDeque<OutboundAction>>,
    /// action id → chat id for every queued action.
    index: HashMap<String, String>,
    settled_ids: HashSet<String>,
    settled_order: VecDeque<String>,
    settled: Vec<Settled>,
}

impl OutboundQueue {
    pub fn new(config: &OutboxConfig, retry: BackoffPolicy) -> Self {
        Self {
            max_per_chat: config.max_per_chat.max(1),
            ack_timeout: config.ack_timeout(),
            retry: BackoffPolicy { max_attempts: config.max_attempts, ..retry },
            chats: BTreeMap::new(),
            index: HashMap::new(),
            settled_ids: HashSet::new(),
            settled_order: VecDeque::new(),
            settled: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.index.contains_key(action_id)
    }

    /// Queued action ids for `chat_id`, oldest first.
    pub fn queued_ids(&self, chat_id: &str) -> Vec<&str> {
        self.chats
            .get(chat_id)
            .map(|queue| queue.iter().map(|action| action.id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, action_id: &str) -> Option<&OutboundAction> {
        let chat = self.index.get(action_id)?;
        self.chats.get(chat)?.iter().find(|action| action.id == action_id)
    }

    /// Actions settled since the last call, in settlement order.
    pub fn take_settled(&mut self) -> Vec<Settled> {
        std::mem::take(&mut self.settled)
    }

    pub fn enqueue(&mut self, action: OutboundAction, timers: &mut Timers) -> EnqueueOutcome {
        if self.index.contains_key(&action.id) || self.settled_ids.contains(&action.id) {
            debug!(action_id = %action.id, "ignoring duplicate action id");
            return EnqueueOutcome::DuplicateId;
        }

        let chat_id = action.chat_id().to_string();
        let queue = self.chats.entry(chat_id.clone()).or_default();

        match action.kind() {
            ActionKind::TypingStop => {
                if let Some(pos) = queue.iter().position(|queued| queued.kind() == ActionKind::TypingStart) {
                    if let Some(start) = queue.remove(pos) {
                        debug!(%chat_id, "typing stop collapsed an unflushed start");
                        self.index.remove(&start.id);
                        self.settle(start, ActionOutcome::Collapsed);
                        self.settle(action, ActionOutcome::Collapsed);
                        self.prune_chat(&chat_id);
                        return EnqueueOutcome::Collapsed;
                    }
                }
            }
            ActionKind::TypingStart => {
                if queue.iter().any(|queued| queued.kind() == ActionKind::TypingStart) {
                    self.settle(action, ActionOutcome::Collapsed);
                    return EnqueueOutcome::Coalesced;
                }
            }
            ActionKind::SendMessage | ActionKind::ReadReceipt => {}
        }

        if queue.len() >= self.max_per_chat {
            let evictable = queue.iter().position(|queued| queued.state != ActionState::InFlight);
            match evictable.and_then(|pos| queue.remove(pos)) {
                Some(evicted) => {
                    warn!(%chat_id, action_id = %evicted.id, "outbound queue full; dropping oldest action");
                    timers.cancel(&TimerKey::Action(evicted.id.clone()));
                    self.index.remove(&evicted.id);
                    self.settle(evicted, ActionOutcome::Dropped);
                }
                None => {
                    warn!(%chat_id, action_id = %action.id, "outbound queue full; dropping new action");
                    self.settle(action, ActionOutcome::Dropped);
                    return EnqueueOutcome::Overflow;
                }
            }
        }

        debug!(%chat_id, action_id = %action.id, kind = action.kind().as_str(), "action queued");
        self.index.insert(action.id.clone(), chat_id.clone());
        self.chats.entry(chat_id).or_default().push_back(action);
        EnqueueOutcome::Queued
    }

    /// Write every chat's sendable head(s). Stops at the first send failure.
    pub fn flush<S: FrameSink + ?Sized>(&mut self, sink: &mut S, now: Instant, timers: &mut Timers) -> usize {
        let mut written = 0;
        let mut ephemeral_done = Vec::new();

        'chats: for queue in self.chats.values_mut() {
            while let Some(head) = queue.front_mut() {
                if head.state != ActionState::Pending {
                    continue 'chats;
                }
                if let Err(error) = sink.send_frame(&head.to_frame()) {
                    debug!(action_id = %head.id, %error, "flush interrupted");
                    break 'chats;
                }
                written += 1;

                if head.kind().requires_ack() {
                    head.state = ActionState::InFlight;
                    timers.schedule(TimerKey::Action(head.id.clone()), now + self.ack_timeout);
                    debug!(action_id = %head.id, chat_id = %head.chat_id(), attempt = head.retries + 1, "action in flight");
                    continue 'chats;
                }
                if let Some(done) = queue.pop_front() {
                    ephemeral_done.push(done);
                }
            }
        }

        for action in ephemeral_done {
            self.index.remove(&action.id);
            self.settle(action, ActionOutcome::Delivered { message_id: None, duplicate: false });
        }
        self.chats.retain(|_, queue| !queue.is_empty());
        written
    }

    /// Apply a server ack. Returns false for unknown or already-settled ids.
    pub fn on_ack(&mut self, ack: &ActionAck, timers: &mut Timers) -> bool {
        let Some(action) = self.remove(&ack.action_id) else {
            debug!(action_id = %ack.action_id, "ignoring ack for unknown action");
            return false;
        };
        timers.cancel(&TimerKey::Action(action.id.clone()));

        let outcome = match ack.result {
            AckResult::Applied => {
                ActionOutcome::Delivered { message_id: ack.message_id.clone(), duplicate: false }
            }
            AckResult::Duplicate => {
                ActionOutcome::Delivered { message_id: ack.message_id.clone(), duplicate: true }
            }
            AckResult::Rejected => {
                let reason = ack.reason.clone().unwrap_or_else(|| "rejected by server".to_string());
                warn!(action_id = %action.id, %reason, "action rejected");
                ActionOutcome::Rejected { reason }
            }
        };
        self.settle(action, outcome);
        true
    }

    /// Handle `TimerKey::Action(action_id)`.
    pub fn on_timer(&mut self, action_id: &str, now: Instant, timers: &mut Timers) {
        let Some(chat) = self.index.get(action_id).cloned() else {
            return;
        };
        let Some(action) = self
            .chats
            .get_mut(&chat)
            .and_then(|queue| queue.iter_mut().find(|action| action.id == action_id))
        else {
            return;
        };

        match action.state {
            ActionState::InFlight => {
                action.retries += 1;
                if self.retry.exhausted(action.retries) {
                    let attempts = action.retries;
                    warn!(%action_id, attempts, "action failed after repeated ack timeouts");
                    if let Some(failed) = self.remove(action_id) {
                        self.settle(failed, ActionOutcome::Failed { attempts });
                    }
                    return;
                }
                let delay = self.retry.delay(action.retries - 1);
                action.state = ActionState::Waiting;
                timers.schedule(TimerKey::Action(action.id.clone()), now + delay);
                info!(%action_id, retries = action.retries, delay_ms = delay.as_millis() as u64, "ack timed out; retry scheduled");
            }
            ActionState::Waiting => action.state = ActionState::Pending,
            ActionState::Pending => {}
        }
    }

    /// Connection lost: in-flight actions go back to pending without
    /// spending an attempt.
    pub fn on_disconnect(&mut self, timers: &mut Timers) {
        for action in self.chats.values_mut().flat_map(|queue| queue.iter_mut()) {
            if action.state == ActionState::InFlight {
                action.state = ActionState::Pending;
                timers.cancel(&TimerKey::Action(action.id.clone()));
            }
        }
    }

    /// Logout: every queued action is settled as cancelled.
    pub fn cancel_all(&mut self, timers: &mut Timers) {
        timers.cancel_where(|key| matches!(key, TimerKey::Action(_)));
        let chats = std::mem::take(&mut self.chats);
        self.index.clear();
        for action in chats.into_values().flatten() {
            self.settle(action, ActionOutcome::Cancelled);
        }
    }

    fn remove(&mut self, action_id: &str) -> Option<OutboundAction> {
        let chat = self.index.remove(action_id)?;
        let queue = self.chats.get_mut(&chat)?;
        let pos = queue.iter().position(|action| action.id == action_id)?;
        let action = queue.remove(pos);
        self.prune_chat(&chat);
        action
    }

    fn prune_chat(&mut self, chat_id: &str) {
        if self.chats.get(chat_id).is_some_and(VecDeque::is_empty) {
            self.chats.remove(chat_id);
        }
    }

    fn settle(&mut self, action: OutboundAction, outcome: ActionOutcome) {
        if self.settled_ids.insert(action.id.clone()) {
            self.settled_order.push_back(action.id.clone());
            while self.settled_order.len() > SETTLED_MEMORY {
                if let Some(old) = self.settled_order.pop_front() {
                    self.settled_ids.remove(&old);
                }
            }
        }
        let chat_id = action.chat_id().to_string();
        let kind = action.kind();
        self.settled.push(Settled { action_id: action.id, chat_id, kind, outcome });
    }
}
