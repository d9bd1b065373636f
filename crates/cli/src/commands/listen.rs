// `courier listen`: print incoming chat events and session notices.

use std::path::Path;
use std::time::Duration;

use clap::Args;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use courier_client::{ChatClient, Notice};
use courier_common::types::{EventKind, EventPayload, InboundEvent};

use super::SessionArgs;
use crate::exit_code::SessionFailure;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ListenArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Only print events for this chat.
    #[arg(long)]
    chat: Option<String>,

    /// Exit after printing this many events.
    #[arg(long)]
    count: Option<usize>,

    /// Seconds to wait for the first successful handshake.
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ListenLine {
    Event(InboundEvent),
    Notice(Notice),
}

pub async fn run(args: ListenArgs, config_path: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = args.session.client_config(config_path)?;
    let client = ChatClient::builder(config).with_rest_history()?.spawn()?;

    let (tx, mut events) = mpsc::unbounded_channel();
    for kind in EventKind::ALL {
        let tx = tx.clone();
        client
            .subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            })
            .await?;
    }
    drop(tx);
    let mut notices = client.notices().await?;

    let opened = super::open_session(
        &client,
        &args.session,
        &mut notices,
        Duration::from_secs(args.connect_timeout),
    )
    .await;
    if let Err(error) = opened {
        client.shutdown().await.ok();
        return Err(error);
    }
    info!(user_id = %args.session.user, chat = ?args.chat, "listening");

    let result = listen(&args, format, &mut events, &mut notices).await;
    client.shutdown().await.ok();
    result
}

async fn listen(
    args: &ListenArgs,
    format: OutputFormat,
    events: &mut mpsc::UnboundedReceiver<InboundEvent>,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
) -> anyhow::Result<()> {
    let mut printed = 0usize;
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if !matches_chat(&event, args.chat.as_deref()) {
                    continue;
                }
                output::print_output(format, &ListenLine::Event(event), render_human)?;
                printed += 1;
                if args.count.is_some_and(|max| printed >= max) {
                    return Ok(());
                }
            }
            Some(notice) = notices.recv() => {
                let failure = SessionFailure::from_notice(&notice);
                output::print_output(format, &ListenLine::Notice(notice), render_human)?;
                if let Some(failure) = failure {
                    return Err(failure.into());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn matches_chat(event: &InboundEvent, chat: Option<&str>) -> bool {
    chat.map_or(true, |chat| event.chat_id.as_deref() == Some(chat))
}

fn render_human(line: &ListenLine) -> String {
    match line {
        ListenLine::Event(event) => render_event(event),
        ListenLine::Notice(notice) => format!("* {}", render_notice(notice)),
    }
}

fn render_event(event: &InboundEvent) -> String {
    let chat = event.chat_id.as_deref().unwrap_or("-");
    match &event.payload {
        EventPayload::Message { message } => {
            let sender = message.sender_id.as_deref().unwrap_or("?");
            format!("[{chat}] {sender}: {}", message.content)
        }
        EventPayload::Typing { user_id, is_typing: true } => format!("[{chat}] {user_id} is typing"),
        EventPayload::Typing { user_id, is_typing: false } => {
            format!("[{chat}] {user_id} stopped typing")
        }
        EventPayload::StatusChange { message_id, status } => {
            format!("[{chat}] message {message_id} is {}", json_name(status))
        }
        EventPayload::Presence { user_id, status } => format!("{user_id} is {}", json_name(status)),
    }
}

fn render_notice(notice: &Notice) -> String {
    match notice {
        Notice::StateChanged { from, to } => format!("session {from} -> {to}"),
        Notice::ReconnectScheduled { attempt, delay_ms } => {
            format!("reconnect attempt {attempt} in {delay_ms}ms")
        }
        Notice::ReconnectExhausted { attempts } => {
            format!("gave up reconnecting after {attempts} attempts")
        }
        Notice::AuthFailed { reason } => format!("authentication rejected: {reason}"),
        Notice::MalformedFrame { reason } => format!("ignored malformed frame: {reason}"),
        Notice::ServerError { code, message } => format!("server error {code}: {message}"),
        Notice::ActionSettled { action_id, chat_id, outcome, .. } => {
            format!("action {action_id} in chat {chat_id}: {}", json_name(outcome))
        }
        Notice::HistoryFailed { chat_id, reason } => {
            format!("history resync for chat {chat_id} failed: {reason}")
        }
    }
}

/// Serialized name of a unit-like enum value, falling back to Debug.
fn json_name<T: Serialize + std::fmt::Debug>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => name,
        Ok(serde_json::Value::Object(map)) => map
            .get("outcome")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{value:?}")),
        _ => format!("{value:?}"),
    }
}
