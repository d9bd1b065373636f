// History resync and the local chat store.
//
// After a reconnect the engine asks a `HistorySource` for every known chat's
// messages since the last server timestamp it saw. Results are replayed
// through the router as synthetic events so the dedup window drops what was
// already delivered live.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

use courier_common::types::{ChatMessage, DeliveryStatus, EventPayload, InboundEvent};

use crate::config::validate_api_url;

// ── Source ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HistoryRequest {
    pub chat_id: String,
    /// Only messages strictly newer than this are wanted.
    pub since: Option<DateTime<Utc>>,
    pub token: String,
    /// Login generation that issued the request; results from an older one are dropped.
    pub generation: u64,
}

impl fmt::Debug for HistoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryRequest")
            .field("chat_id", &self.chat_id)
            .field("since", &self.since)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

pub type HistoryFuture = BoxFuture<'static, Result<Vec<ChatMessage>>>;

/// Fetches a chat's messages since a cursor.
pub trait HistorySource: Send + Sync {
    fn fetch(&self, request: HistoryRequest) -> HistoryFuture;
}

impl<F> HistorySource for F
where
    F: Fn(HistoryRequest) -> HistoryFuture + Send + Sync,
{
    fn fetch(&self, request: HistoryRequest) -> HistoryFuture {
        self(request)
    }
}

/// `GET {api_url}/chats/{chatId}/messages?since=<rfc3339>` with a bearer token.
#[derive(Debug, Clone)]
pub struct RestHistorySource {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryPage {
    List(Vec<ChatMessage>),
    Wrapped { messages: Vec<ChatMessage> },
}

impl RestHistorySource {
    pub fn new(api_url: &str) -> Result<Self> {
        let base_url = validate_api_url(api_url)?;
        Ok(Self { http: reqwest::Client::new(), base_url })
    }

    pub fn messages_url(&self, chat_id: &str, since: Option<DateTime<Utc>>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("api_url `{}` cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(["chats", chat_id, "messages"]);
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", &since.to_rfc3339());
        }
        Ok(url)
    }
}

impl HistorySource for RestHistorySource {
    fn fetch(&self, request: HistoryRequest) -> HistoryFuture {
        let http = self.http.clone();
        let url = self.messages_url(&request.chat_id, request.since);
        Box::pin(async move {
            let url = url?;
            let res = http
                .get(url.clone())
                .bearer_auth(&request.token)
                .send()
                .await
                .with_context(|| format!("history request to {url} failed"))?;

            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                bail!("history fetch for chat {} returned {status}: {body}", request.chat_id);
            }
            let page: HistoryPage = res.json().await.context("invalid history response body")?;
            Ok(match page {
                HistoryPage::List(messages) | HistoryPage::Wrapped { messages } => messages,
            })
        })
    }
}

/// Wrap fetched messages as synthetic message events for `chat_id`.
pub fn replay_events(chat_id: &str, messages: Vec<ChatMessage>) -> Vec<InboundEvent> {
    messages
        .into_iter()
        .map(|message| InboundEvent {
            event_id: None,
            chat_id: Some(chat_id.to_string()),
            server_timestamp: message.timestamp,
            payload: EventPayload::Message { message },
            synthetic: true,
        })
        .collect()
}

// ── Chat store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatSnapshot {
    pub chat_id: String,
    /// Messages in server timestamp order; untimestamped ones last.
    pub messages: Vec<ChatMessage>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Read/write view of local chat state, fed every delivered event.
pub trait ChatStore: Send {
    fn apply_inbound_event(&mut self, event: &InboundEvent);
    fn chat_snapshot(&self, chat_id: &str) -> Option<ChatSnapshot>;

    /// The server acked the echo tagged `client_id` and named it `message_id`.
    fn confirm_sent(&mut self, chat_id: &str, client_id: &str, message_id: &str);

    /// The send behind the echo tagged `client_id` will never be delivered.
    fn mark_failed(&mut self, chat_id: &str, client_id: &str);
}

#[derive(Debug, Default)]
pub struct MemoryChatStore {
    chats: HashMap<String, ChatSnapshot>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatStore for MemoryChatStore {
    fn apply_inbound_event(&mut self, event: &InboundEvent) {
        let Some(chat_id) = event.chat_id.as_deref() else {
            return;
        };
        match &event.payload {
            EventPayload::Message { message } => {
                let chat = self
                    .chats
                    .entry(chat_id.to_string())
                    .or_insert_with(|| ChatSnapshot { chat_id: chat_id.to_string(), ..Default::default() });
                upsert_message(chat, message.clone());
            }
            EventPayload::StatusChange { message_id, status } => {
                if let Some(message) = self
                    .chats
                    .get_mut(chat_id)
                    .and_then(|chat| chat.messages.iter_mut().find(|m| m.id.as_deref() == Some(message_id.as_str())))
                {
                    message.status = Some(*status);
                }
            }
            EventPayload::Typing { .. } | EventPayload::Presence { .. } => {}
        }
    }

    fn chat_snapshot(&self, chat_id: &str) -> Option<ChatSnapshot> {
        self.chats.get(chat_id).cloned()
    }

    fn confirm_sent(&mut self, chat_id: &str, client_id: &str, message_id: &str) {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            return;
        };
        let Some(pos) = find_echo(chat, client_id) else {
            return;
        };
        // The broadcast may have beaten the ack; keep the server copy.
        if chat.messages.iter().any(|m| m.id.as_deref() == Some(message_id)) {
            chat.messages.remove(pos);
            return;
        }
        let echo = &mut chat.messages[pos];
        echo.id = Some(message_id.to_string());
        if echo.status.is_none() {
            echo.status = Some(DeliveryStatus::Sent);
        }
    }

    fn mark_failed(&mut self, chat_id: &str, client_id: &str) {
        if let Some(chat) = self.chats.get_mut(chat_id) {
            if let Some(pos) = find_echo(chat, client_id) {
                chat.messages[pos].status = Some(DeliveryStatus::Failed);
            }
        }
    }
}

/// Position of the unconfirmed local echo for `client_id`.
fn find_echo(chat: &ChatSnapshot, client_id: &str) -> Option<usize> {
    chat.messages
        .iter()
        .position(|m| m.id.is_none() && m.client_id.as_deref() == Some(client_id))
}

fn upsert_message(chat: &mut ChatSnapshot, message: ChatMessage) {
    if let Some(ts) = message.timestamp {
        chat.last_timestamp = chat.last_timestamp.max(Some(ts));
    }

    // Server copy replaces an earlier copy or the optimistic local echo.
    let existing = chat.messages.iter().position(|m| {
        (message.id.is_some() && m.id == message.id)
            || (message.client_id.is_some() && m.client_id == message.client_id)
    });
    if let Some(pos) = existing {
        chat.messages.remove(pos);
    }

    let pos = match message.timestamp {
        Some(ts) => chat
            .messages
            .iter()
            .position(|m| m.timestamp.map_or(true, |other| other > ts))
            .unwrap_or(chat.messages.len()),
        None => chat.messages.len(),
    };
    chat.messages.insert(pos, message);
}
