// courier CLI entry point.

use std::path::PathBuf;
use std::process;

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "courier", about = "Realtime chat session client")]
struct Cli {
    /// Config file to use instead of ~/.courier/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);
    match commands::run(cli.command, cli.config.as_deref(), format).await {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_reads_positional_chat_and_content() {
        let cli = Cli::try_parse_from([
            "courier", "send", "--user", "u1", "--token", "t", "42", "hello there",
        ])
        .expect("send should parse");
        assert!(matches!(cli.command, commands::Command::Send(_)));
        assert!(!cli.json);
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["courier", "config", "path", "--json", "--config", "/tmp/c.toml"])
            .expect("config path should parse");
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn listen_requires_credentials() {
        std::env::remove_var("COURIER_USER");
        std::env::remove_var("COURIER_TOKEN");
        assert!(Cli::try_parse_from(["courier", "listen"]).is_err());
    }
}
