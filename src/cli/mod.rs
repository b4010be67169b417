//! CLI entry point for Dashlink.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Dashlink session and realtime CLI
#[derive(Parser, Debug)]
#[command(name = "dashlink", version, about = "Sign in to the dashboard API and follow realtime feeds")]
pub struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an interactive login and print the authorization URL
    Login(LoginArgs),
    /// Finish a login from the URL the provider redirected to
    Callback(CallbackArgs),
    /// Show the persisted token and signed-in user
    Status,
    /// Clear the stored token and end the provider session
    Logout,
    /// GET an API path with the stored credentials and print the JSON
    Get(GetArgs),
    /// Print messages from a realtime endpoint until interrupted
    Watch(WatchArgs),
}

#[derive(Parser, Debug)]
pub struct LoginArgs {
    /// Where to land after the login completes
    #[arg(long)]
    pub return_to: Option<String>,
}

#[derive(Parser, Debug)]
pub struct CallbackArgs {
    /// Full callback URL including `code` and `state`
    pub url: String,
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Path relative to the API base URL
    pub path: String,
}

#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// ws(s):// URL, or a path below the push base URL
    pub target: String,

    /// Reconnect with exponential backoff when the connection drops
    #[arg(long)]
    pub reconnect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_login_with_return_to() {
        let cli = Cli::try_parse_from(["dashlink", "login", "--return-to", "/projects"]).unwrap();
        match cli.command {
            Commands::Login(args) => assert_eq!(args.return_to.as_deref(), Some("/projects")),
            other => panic!("expected Login, got {other:?}"),
        }
    }

    #[test]
    fn parse_callback_url() {
        let cli = Cli::try_parse_from([
            "dashlink",
            "callback",
            "https://app.example/auth/callback?code=c&state=s",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Callback(ref args) if args.url.contains("state=s")));
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["dashlink", "status", "--config", "dash.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.config, Some(PathBuf::from("dash.toml")));
    }

    #[test]
    fn parse_watch_reconnect_flag() {
        let cli = Cli::try_parse_from(["dashlink", "watch", "/runs", "--reconnect"]).unwrap();
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.target, "/runs");
                assert!(args.reconnect);
            }
            other => panic!("expected Watch, got {other:?}"),
        }
    }

    #[test]
    fn get_requires_path() {
        assert!(Cli::try_parse_from(["dashlink", "get"]).is_err());
    }
}
