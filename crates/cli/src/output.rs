// Result and error rendering for `courier` commands.
//
// A terminal gets one human line per result; a pipe gets one JSON object per
// line, which is what `courier listen | jq` expects. `--json` forces JSON.

use courier_client::ClientError;

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

use crate::exit_code::SessionFailure;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    /// JSON when `--json` is set or stdout is not a terminal.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty { Self::Human } else { Self::Json }
    }
}

/// Write one result line to stdout: `human_fn` text or a JSON object.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    let is_tty = io::stderr().is_terminal();
    let _ = write_error(&mut io::stderr().lock(), format, is_tty, code, &message);
}

fn write_error<W: Write>(
    writer: &mut W,
    format: OutputFormat,
    is_tty: bool,
    code: &str,
    message: &str,
) -> io::Result<()> {
    match format {
        OutputFormat::Human if is_tty => writeln!(writer, "{ANSI_RED}error:{ANSI_RESET} {message}"),
        OutputFormat::Human => writeln!(writer, "error: {message}"),
        OutputFormat::Json => {
            let obj = serde_json::json!({ "error": { "code": code, "message": message } });
            serde_json::to_writer(&mut *writer, &obj).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    for cause in error.chain() {
        if let Some(failure) = cause.downcast_ref::<SessionFailure>() {
            return match failure {
                SessionFailure::AuthRejected(reason) => (
                    "AUTH_FAILURE",
                    format!(
                        "Authentication rejected ({reason}). Check --user/--token or COURIER_USER/COURIER_TOKEN"
                    ),
                ),
                SessionFailure::ReconnectExhausted(attempts) => (
                    "RECONNECT_EXHAUSTED",
                    format!(
                        "Server unreachable after {attempts} reconnect attempts. Check server.ws_url with: courier config show"
                    ),
                ),
                SessionFailure::ActionNotDelivered(_) => ("ACTION_FAILED", message),
            };
        }
        if let Some(ClientError::MissingEndpoint) = cause.downcast_ref::<ClientError>() {
            return (
                "MISSING_ENDPOINT",
                "No WebSocket endpoint configured. Run: courier config init --ws-url wss://<host>/ws (or pass --ws-url)"
                    .to_string(),
            );
        }
        if let Some(ClientError::InvalidAction(reason)) = cause.downcast_ref::<ClientError>() {
            return ("INVALID_ACTION", format!("Invalid action: {reason}"));
        }
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") {
        return (
            "NETWORK_TIMEOUT",
            format!("{message}. Check that the chat server is reachable"),
        );
    }
    if lower.contains("config") {
        return ("CONFIG_ERROR", message);
    }

    ("CLIENT_ERROR", message)
}
