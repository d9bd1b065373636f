// Notice stream: lifecycle transitions and non-recoverable failures.
//
// Each subscriber gets its own unbounded channel, so every notice reaches
// every live subscriber exactly once and in publication order. Dropped
// receivers are pruned on the next publish.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::outbox::{ActionKind, ActionOutcome};
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    StateChanged { from: SessionState, to: SessionState },
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    ReconnectExhausted { attempts: u32 },
    AuthFailed { reason: String },
    MalformedFrame { reason: String },
    ServerError { code: String, message: String },
    ActionSettled { action_id: String, chat_id: String, kind: ActionKind, outcome: ActionOutcome },
    HistoryFailed { chat_id: String, reason: String },
}

#[derive(Debug, Default)]
pub struct NoticeHub {
    subscribers: Vec<mpsc::UnboundedSender<Notice>>,
}

impl NoticeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Notice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, notice: Notice) {
        self.subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
