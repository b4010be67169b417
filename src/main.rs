//! Dashlink CLI binary entry point.

use clap::Parser;
use dashlink::cli::{commands, Cli, Commands};
use dashlink::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dashlink=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Login(args) => commands::handle_login(config, args.return_to.as_deref()).await,
        Commands::Callback(args) => commands::handle_callback(config, &args.url).await,
        Commands::Status => commands::handle_status(config).await,
        Commands::Logout => commands::handle_logout(config).await,
        Commands::Get(args) => commands::handle_get(config, &args.path).await,
        Commands::Watch(args) => commands::handle_watch(config, &args.target, args.reconnect).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
