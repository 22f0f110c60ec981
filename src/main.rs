use std::time::Duration;

use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod chat_log;
mod config;
mod error;
mod twitch;

use crate::chat_log::RotatingChatLog;
use crate::config::load_settings;
use crate::error::{AppError, ConfigError, Result as AppResult};
use crate::twitch::{BotEngine, Credentials, KrakenTopStreams, TWITCH_IRC_ADDR};

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(AppError::Config(ConfigError::Missing(path))) => {
            // First run: a commented template was just written. Filling it
            // in and running again is the expected next step, not a failure.
            eprintln!(
                "Wrote a configuration template to {path}. \
                 Fill in your Twitch credentials and run again."
            );
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    tracing::info!(
        limit = settings.twitch.channel_limit,
        game = %settings.twitch.game,
        refresh_secs = settings.twitch.refresh_interval_secs,
        "Configuration loaded"
    );

    let sink = RotatingChatLog::new(
        &settings.logs.directory,
        Duration::from_secs(settings.logs.rotate_minutes * 60),
    )?;
    let credentials = Credentials {
        username: settings.twitch.username,
        token: settings.twitch.token,
        client_id: settings.twitch.client_id,
    };
    let source = KrakenTopStreams::new(
        credentials.client_id.clone(),
        settings.twitch.game.clone(),
        settings.twitch.channel_limit,
    );
    let engine = BotEngine::new(
        TWITCH_IRC_ADDR,
        source,
        Box::new(sink),
        credentials,
        Duration::from_secs(settings.twitch.refresh_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for interrupt signal");
            return;
        }
        tracing::info!("Interrupt received, shutting down");
        let _ = shutdown_tx.send(());
    });

    engine.run(shutdown_rx).await?;
    tracing::info!("Exiting");
    Ok(())
}
