use std::time::Duration;

/// Immutable identity the bot presents to the IRC server and the streams API.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub token: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotStatus {
    Disconnected,
    Connecting {
        attempt: u32,
    },
    Joining {
        channel_count: usize,
    },
    Running,
    Reconnecting {
        reason: String,
        failed_attempt: u32,
        retry_in: Duration,
    },
    ShuttingDown,
    Terminated,
}

impl BotStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BotStatus::Disconnected => "disconnected",
            BotStatus::Connecting { .. } => "connecting",
            BotStatus::Joining { .. } => "joining",
            BotStatus::Running => "running",
            BotStatus::Reconnecting { .. } => "reconnecting",
            BotStatus::ShuttingDown => "shutting_down",
            BotStatus::Terminated => "terminated",
        }
    }
}
