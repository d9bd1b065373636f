// `courier send`: send one message and wait for its ack.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tracing::info;

use courier_client::{ActionOutcome, ChatClient, Intent};

use super::SessionArgs;
use crate::exit_code::SessionFailure;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SendArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Chat to post into.
    chat: String,

    /// Message text.
    content: String,

    /// Seconds to wait for the session and for the server's ack.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub action_id: String,
    pub chat_id: String,
    pub outcome: ActionOutcome,
}

pub async fn run(args: SendArgs, config_path: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = args.session.client_config(config_path)?;
    let client = ChatClient::spawn(config).context("failed to start client")?;
    let result = deliver(&client, &args).await;
    client.shutdown().await.ok();

    let result = result?;
    output::print_output(format, &result, format_human)?;
    if result.outcome.is_delivered() {
        Ok(())
    } else {
        Err(SessionFailure::ActionNotDelivered(format_human(&result)).into())
    }
}

async fn deliver(client: &ChatClient, args: &SendArgs) -> anyhow::Result<SendResult> {
    let wait = Duration::from_secs(args.timeout);
    let mut notices = client.notices().await?;
    super::open_session(client, &args.session, &mut notices, wait).await?;

    let pending = client.send(Intent::message(&args.chat, &args.content)).await?;
    let action_id = pending.id().to_string();
    info!(action_id = %action_id, chat_id = %args.chat, "message queued");

    let outcome = tokio::time::timeout(wait, pending.outcome())
        .await
        .with_context(|| format!("timed out after {}s waiting for ack of {action_id}", wait.as_secs()))??;
    Ok(SendResult { action_id, chat_id: args.chat.clone(), outcome })
}

fn format_human(result: &SendResult) -> String {
    match &result.outcome {
        ActionOutcome::Delivered { message_id: Some(message_id), duplicate } => format!(
            "Sent to chat {} as {message_id}{}",
            result.chat_id,
            if *duplicate { " (already applied)" } else { "" }
        ),
        ActionOutcome::Delivered { message_id: None, .. } => {
            format!("Sent to chat {} (action {})", result.chat_id, result.action_id)
        }
        ActionOutcome::Rejected { reason } => format!("Rejected by server: {reason}"),
        ActionOutcome::Failed { attempts } => format!("No ack after {attempts} attempts"),
        ActionOutcome::Dropped => "Dropped: the chat queue is full".to_string(),
        ActionOutcome::Collapsed | ActionOutcome::Cancelled => {
            format!("Cancelled before it was sent (action {})", result.action_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: ActionOutcome) -> SendResult {
        SendResult { action_id: "a1".into(), chat_id: "42".into(), outcome }
    }

    #[test]
    fn human_format_delivered() {
        let out = format_human(&result(ActionOutcome::Delivered {
            message_id: Some("m9".into()),
            duplicate: false,
        }));
        assert_eq!(out, "Sent to chat 42 as m9");

        let dup = format_human(&result(ActionOutcome::Delivered {
            message_id: Some("m9".into()),
            duplicate: true,
        }));
        assert!(dup.ends_with("(already applied)"));
    }

    #[test]
    fn human_format_failures() {
        assert_eq!(
            format_human(&result(ActionOutcome::Rejected { reason: "muted".into() })),
            "Rejected by server: muted"
        );
        assert_eq!(
            format_human(&result(ActionOutcome::Failed { attempts: 5 })),
            "No ack after 5 attempts"
        );
    }

    #[test]
    fn json_format_carries_outcome_tag() {
        let res = result(ActionOutcome::Delivered { message_id: Some("m9".into()), duplicate: false });
        let mut buf = Vec::new();
        output::write_output(&mut buf, OutputFormat::Json, &res, format_human).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed["action_id"], "a1");
        assert_eq!(parsed["outcome"]["outcome"], "delivered");
        assert_eq!(parsed["outcome"]["message_id"], "m9");
    }
}
