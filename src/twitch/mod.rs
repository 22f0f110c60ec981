pub mod bot;
pub mod error;
pub mod framing;
pub mod ranking;
pub mod reconcile;
pub mod transport;
pub mod types;

pub use bot::BotEngine;
pub use error::TwitchError;
pub use ranking::{ChannelSource, KrakenTopStreams};
pub use transport::TWITCH_IRC_ADDR;
pub use types::{BotStatus, Credentials};
