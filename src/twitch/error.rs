use thiserror::Error;

#[derive(Error, Debug)]
pub enum TwitchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not connected to the IRC server")]
    NotConnected,
    #[error("Chunk decode error: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error("Chat sink error: {0}")]
    Sink(std::io::Error),
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Ranking fetch failed: {0}")]
    RankFetch(String),
}

pub type Result<T, E = TwitchError> = std::result::Result<T, E>;
