use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::error::{Result as TwitchResult, TwitchError};

pub const KRAKEN_STREAMS_URL: &str = "https://api.twitch.tv/kraken/streams/";
const API_VERSION: &str = "5";

/// Source of the current top-N channel names. The engine only ever sees
/// this trait, so tests substitute a scripted source.
#[async_trait]
pub trait ChannelSource: Send {
    async fn fetch(&self) -> TwitchResult<HashSet<String>>;
}

/// Ranking source backed by the Twitch streams API, ordered by current
/// viewer count. The service clamps `limit` to 100 on its side.
pub struct KrakenTopStreams {
    client: reqwest::Client,
    client_id: String,
    game: String,
    limit: u32,
}

impl KrakenTopStreams {
    pub fn new(client_id: String, game: String, limit: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id,
            game,
            limit,
        }
    }
}

#[async_trait]
impl ChannelSource for KrakenTopStreams {
    async fn fetch(&self) -> TwitchResult<HashSet<String>> {
        let response = self
            .client
            .get(KRAKEN_STREAMS_URL)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("api_version", API_VERSION),
                ("game", self.game.as_str()),
                ("limit", &self.limit.to_string()),
            ])
            .send()
            .await
            .map_err(TwitchError::Reqwest)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error body".to_string());
            tracing::error!(
                http.status = %status,
                body = %error_body,
                "Streams API request rejected"
            );
            return Err(TwitchError::RankFetch(format!(
                "streams request failed (HTTP {}): {}",
                status, error_body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TwitchError::RankFetch(format!("streams response parse: {}", e)))?;

        let names = extract_channel_names(body);
        tracing::debug!(
            channel_count = names.len(),
            limit = self.limit,
            "Fetched ranked channel list"
        );
        Ok(names)
    }
}

#[derive(Deserialize, Debug, Default)]
struct StreamsResponse {
    // Entries stay untyped here so one malformed entry cannot reject the
    // whole list.
    #[serde(default)]
    streams: Vec<Value>,
}

#[derive(Deserialize, Debug)]
struct StreamEntry {
    channel: ChannelEntry,
}

#[derive(Deserialize, Debug)]
struct ChannelEntry {
    name: String,
}

/// Pulls `streams[*].channel.name` out of the API response. An absent or
/// malformed stream list yields an empty set; individual malformed entries
/// are skipped.
fn extract_channel_names(body: Value) -> HashSet<String> {
    let response: StreamsResponse = serde_json::from_value(body).unwrap_or_default();
    response
        .streams
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<StreamEntry>(entry).ok())
        .map(|entry| entry.channel.name)
        .collect()
}
