//! CLI command handlers.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::app::Dashlink;
use crate::auth::{AuthError, IdentityProvider, Navigator};
use crate::config::AppConfig;
use crate::realtime::ReconnectPolicy;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Terminal stand-in for a browser redirect: prints where to go.
pub struct PrintNavigator;

impl Navigator for PrintNavigator {
    fn navigate(&self, target: &Url) -> Result<(), AuthError> {
        println!("🔗 Open: {target}");
        Ok(())
    }
}

fn build(config: AppConfig) -> Result<Dashlink, Box<dyn std::error::Error>> {
    Ok(Dashlink::from_config(config, Arc::new(PrintNavigator))?)
}

/// Handle `dashlink login`.
pub async fn handle_login(config: AppConfig, return_to: Option<&str>) -> CliResult {
    let app = build(config)?;
    app.identity().initiate_login(return_to).await?;
    println!("⏳ After signing in, run: dashlink callback '<redirected URL>'");
    Ok(())
}

/// Handle `dashlink callback <URL>`.
pub async fn handle_callback(config: AppConfig, url: &str) -> CliResult {
    let callback = Url::parse(url)?;
    let app = build(config)?;
    match app.session().complete_login(&callback).await {
        Ok(destination) => {
            if let Some(principal) = app.session().principal() {
                println!("✅ Signed in as {}", display_name(&principal));
            }
            println!("➡️  Continue at {destination}");
            app.shutdown().await;
            Ok(())
        }
        Err(error) => {
            app.shutdown().await;
            Err(error.into())
        }
    }
}

/// Handle `dashlink status`.
pub async fn handle_status(config: AppConfig) -> CliResult {
    let app = build(config)?;
    match app.token_store().read_entry() {
        Some(entry) => match entry.expires_at() {
            Some(at) => println!("Token:   valid until {}", at.to_rfc3339()),
            None => println!("Token:   present"),
        },
        None => println!("Token:   none"),
    }
    match app.identity().get_current_user().await? {
        Some(user) => {
            let name = user
                .profile
                .name
                .as_deref()
                .or(user.profile.preferred_username.as_deref())
                .unwrap_or(&user.profile.sub);
            println!("User:    {name}");
            if let Some(email) = &user.profile.email {
                println!("Email:   {email}");
            }
            println!(
                "Refresh: {}",
                if user.can_refresh() { "available" } else { "unavailable" }
            );
        }
        None => println!("User:    not signed in"),
    }
    app.shutdown().await;
    Ok(())
}

/// Handle `dashlink logout`.
pub async fn handle_logout(config: AppConfig) -> CliResult {
    let app = build(config)?;
    app.session().logout().await?;
    println!("✅ Logged out");
    Ok(())
}

/// Handle `dashlink get <PATH>`.
pub async fn handle_get(config: AppConfig, path: &str) -> CliResult {
    let app = build(config)?;
    let value: serde_json::Value = app.api().get_json(path).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Handle `dashlink watch <TARGET>`.
pub async fn handle_watch(config: AppConfig, target: &str, reconnect: bool) -> CliResult {
    let url = resolve_watch_target(&config, target)?;
    let mut app = build(config)?;
    if reconnect {
        app = app.with_reconnect_policy(ReconnectPolicy::exponential(
            10,
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));
    }

    let connection = app.realtime().get_connection(url.as_str())?;
    connection.add_listener(|message| println!("{message}"));
    connection.set_error_handler(|error| eprintln!("⚠️  {error}"));
    println!("👂 Watching {url} (Ctrl-C to stop)");

    let mut status = connection.subscribe_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                tracing::info!(%current, "connection status");
                if current == crate::realtime::ConnectionStatus::Closed {
                    break;
                }
            }
        }
    }
    app.shutdown().await;
    Ok(())
}

fn resolve_watch_target(config: &AppConfig, target: &str) -> Result<Url, Box<dyn std::error::Error>> {
    if target.starts_with("ws://") || target.starts_with("wss://") {
        return Ok(Url::parse(target)?);
    }
    Ok(config.push_url(target)?)
}

fn display_name(principal: &crate::session::Principal) -> &str {
    principal.name.as_deref().unwrap_or(&principal.subject)
}

