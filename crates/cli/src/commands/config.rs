// `courier config`: inspect or create the client config file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;

use courier_client::config::global_config_path;
use courier_client::ClientConfig;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default settings
    Init {
        /// WebSocket endpoint, e.g. wss://chat.example.com/ws
        #[arg(long)]
        ws_url: Option<String>,
        /// REST base URL used for history resync
        #[arg(long)]
        api_url: Option<String>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Serialize)]
struct PathResult {
    path: PathBuf,
    exists: bool,
}

pub fn run(args: ConfigArgs, config_path: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let path = resolve_path(config_path)?;
    match args.action {
        ConfigAction::Show => {
            let config = if path.exists() {
                super::load_config(Some(&path))?
            } else {
                ClientConfig::default()
            };
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            output::print_output(format, &config, |_| rendered.trim_end().to_string())?;
        }
        ConfigAction::Path => {
            let result = PathResult { exists: path.exists(), path };
            output::print_output(format, &result, |r| r.path.display().to_string())?;
        }
        ConfigAction::Init { ws_url, api_url, force } => {
            let config = init(&path, ws_url, api_url, force)?;
            output::print_output(format, &config, |_| format!("Wrote {}", path.display()))?;
        }
    }
    Ok(())
}

fn resolve_path(config_path: Option<&Path>) -> anyhow::Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.to_path_buf()),
        None => global_config_path().context("could not determine the home directory for the config file"),
    }
}

fn init(
    path: &Path,
    ws_url: Option<String>,
    api_url: Option<String>,
    force: bool,
) -> anyhow::Result<ClientConfig> {
    if path.exists() && !force {
        anyhow::bail!("config file {} already exists (use --force to overwrite)", path.display());
    }
    let mut config = ClientConfig::default();
    config.server.ws_url = ws_url;
    config.server.api_url = api_url;
    config.validate().context("invalid client configuration")?;
    config
        .save_to(path)
        .with_context(|| format!("failed to write config to {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_writes_loadable_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let written = init(&path, Some("wss://chat.example.com/ws".into()), None, false).unwrap();
        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.server.ws_url.as_deref(), Some("wss://chat.example.com/ws"));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        init(&path, None, None, false).unwrap();

        let err = init(&path, None, None, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        init(&path, Some("ws://127.0.0.1:9000/ws".into()), None, true).unwrap();
    }

    #[test]
    fn init_rejects_bad_scheme() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert!(init(&path, Some("ftp://chat.example.com".into()), None, false).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn explicit_path_wins() {
        let path = resolve_path(Some(Path::new("/tmp/courier.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/courier.toml"));
    }
}
