use std::fs;
use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{ConfigError, Result as AppResult};

pub const CONFIG_FILE: &str = "config.toml";

const CONFIG_TEMPLATE: &str = r#"# strimlog configuration
#
# Fill in your Twitch credentials before the first real run.

[twitch]
# Name the bot presents to the IRC server. Do not reuse a popular
# streamer's name; the self-echo filter drops every line containing it.
username = "your_bot_name"
# OAuth token used for the IRC PASS command.
token = "oauth:your_token_here"
# Client id of your Twitch developer application.
client_id = "your_client_id_here"
# How many top channels to join (1-100).
channel_limit = 25
# Optional: only join channels streaming this game. Empty means any game.
#game = "Overwatch"
# Optional: seconds between ranking refreshes.
#refresh_interval_secs = 60

#[logs]
#directory = "logs"
#rotate_minutes = 10
"#;

#[derive(Debug, Deserialize)]
pub struct TwitchSettings {
    pub username: String,
    pub token: String,
    pub client_id: String,
    pub channel_limit: u32,
    #[serde(default)]
    pub game: String,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_directory")]
    pub directory: String,
    #[serde(default = "default_rotate_minutes")]
    pub rotate_minutes: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            rotate_minutes: default_rotate_minutes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    pub twitch: TwitchSettings,
    #[serde(default)]
    pub logs: LogSettings,
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_log_directory() -> String {
    "logs".to_string()
}

fn default_rotate_minutes() -> u64 {
    10
}

/// Loads `config.toml` layered under `STRIMLOG__`-prefixed environment
/// variables. On a first run with no config file present, writes a
/// commented template and reports `ConfigError::Missing` so the caller can
/// exit cleanly.
pub fn load_settings() -> AppResult<AppSettings> {
    let path = Path::new(CONFIG_FILE);
    ensure_config_at(path)?;
    load_settings_from(path)
}

/// Scaffolds the commented template when no config exists at `path`. The
/// `Missing` error tells the caller this was a first run, not a failure.
fn ensure_config_at(path: &Path) -> AppResult<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, CONFIG_TEMPLATE)?;
    Err(ConfigError::Missing(path.display().to_string()).into())
}

fn load_settings_from(path: &Path) -> AppResult<AppSettings> {
    let settings = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix("STRIMLOG")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &AppSettings) -> Result<(), ConfigError> {
    if !(1..=100).contains(&settings.twitch.channel_limit) {
        return Err(ConfigError::InvalidValue(format!(
            "channel_limit must be between 1 and 100, got {}",
            settings.twitch.channel_limit
        )));
    }
    if settings.twitch.refresh_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "refresh_interval_secs must be at least 1".to_string(),
        ));
    }
    if settings.logs.rotate_minutes == 0 {
        return Err(ConfigError::InvalidValue(
            "rotate_minutes must be at least 1".to_string(),
        ));
    }
    Ok(())
}
