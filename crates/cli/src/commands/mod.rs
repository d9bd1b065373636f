// CLI subcommand dispatch and shared session plumbing.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};
use tokio::sync::mpsc;

use courier_client::{ChatClient, ClientConfig, Credentials, Notice, SessionState};

use crate::exit_code::SessionFailure;
use crate::output::OutputFormat;

pub mod config;
pub mod listen;
pub mod send;

#[derive(Subcommand)]
pub enum Command {
    /// Connect and print incoming events and session notices
    Listen(listen::ListenArgs),
    /// Send one message and wait for the server to acknowledge it
    Send(send::SendArgs),
    /// Show or initialize the config file
    Config(config::ConfigArgs),
}

pub async fn run(cmd: Command, config_path: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        Command::Listen(args) => listen::run(args, config_path, format).await,
        Command::Send(args) => send::run(args, config_path, format).await,
        Command::Config(args) => config::run(args, config_path, format),
    }
}

/// Identity and endpoint flags shared by commands that open a session.
#[derive(Debug, Args)]
pub struct SessionArgs {
    /// User id to authenticate as.
    #[arg(long, env = "COURIER_USER")]
    pub user: String,

    /// Bearer token for the chat backend.
    #[arg(long, env = "COURIER_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Override `server.ws_url` from the config file.
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Override `server.api_url` from the config file.
    #[arg(long)]
    pub api_url: Option<String>,
}

impl SessionArgs {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.user, &self.token)
    }

    /// Load the config file and apply endpoint overrides.
    pub fn client_config(&self, config_path: Option<&Path>) -> anyhow::Result<ClientConfig> {
        let mut config = load_config(config_path)?;
        if let Some(ws_url) = &self.ws_url {
            config.server.ws_url = Some(ws_url.clone());
        }
        if let Some(api_url) = &self.api_url {
            config.server.api_url = Some(api_url.clone());
        }
        config.validate().context("invalid client configuration")?;
        Ok(config)
    }
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(ClientConfig::load()),
    }
}

/// Start the session and wait until it is `Active` or has failed for good.
pub async fn open_session(
    client: &ChatClient,
    session: &SessionArgs,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    wait: Duration,
) -> anyhow::Result<()> {
    let mut states = client.state_watch();
    client.connect(session.credentials()).await.context("failed to start session")?;

    let settled = tokio::time::timeout(
        wait,
        states.wait_for(|state| matches!(state, SessionState::Active | SessionState::Failed)),
    )
    .await;
    let state = match settled {
        Ok(Ok(state)) => *state,
        Ok(Err(_)) => anyhow::bail!("client event loop has shut down"),
        Err(_) => anyhow::bail!(
            "timed out after {}s waiting for the session (state: {})",
            wait.as_secs(),
            client.connection_state()
        ),
    };
    if state == SessionState::Active {
        return Ok(());
    }

    while let Ok(notice) = notices.try_recv() {
        if let Some(failure) = SessionFailure::from_notice(&notice) {
            return Err(failure.into());
        }
    }
    anyhow::bail!("session failed")
}
