use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::{Result as TwitchResult, TwitchError};

pub const TWITCH_IRC_ADDR: &str = "irc.chat.twitch.tv:6667";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Owns the single TCP connection to the IRC server. All sends and reads go
/// through this struct; it is not safe for concurrent writers and is only
/// ever driven by the engine task.
pub struct IrcTransport {
    server_addr: String,
    stream: Option<TcpStream>,
}

impl IrcTransport {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            stream: None,
        }
    }

    pub async fn connect(&mut self) -> TwitchResult<()> {
        let stream_result = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(self.server_addr.as_str()),
        )
        .await;

        let stream = match stream_result {
            Ok(Ok(stream)) => stream,
            Ok(Err(tcp_error)) => {
                tracing::error!(
                    server.addr = %self.server_addr,
                    error = %tcp_error,
                    "TCP connection failed"
                );
                return Err(TwitchError::Io(tcp_error));
            }
            Err(_) => {
                tracing::error!(
                    server.addr = %self.server_addr,
                    timeout = ?CONNECT_TIMEOUT,
                    "TCP connection timed out"
                );
                return Err(TwitchError::Connection(format!(
                    "TCP connection timed out after {:?}",
                    CONNECT_TIMEOUT
                )));
            }
        };

        self.stream = Some(stream);
        Ok(())
    }

    /// Sends one protocol line. The outbound terminator is appended here so
    /// callers pass bare commands like `PONG` or `JOIN #somechannel`.
    pub async fn send_line(&mut self, line: &str) -> TwitchResult<()> {
        let stream = self.stream.as_mut().ok_or(TwitchError::NotConnected)?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads whatever bytes the server has available into `buf`, waiting for
    /// at least one. EOF means the server closed the connection and is
    /// surfaced as a connection error so the caller can reconnect.
    pub async fn recv_chunk(&mut self, buf: &mut [u8]) -> TwitchResult<usize> {
        let stream = self.stream.as_mut().ok_or(TwitchError::NotConnected)?;
        let n = stream.read(buf).await?;
        if n == 0 {
            self.close();
            return Err(TwitchError::Connection(
                "connection closed by server (EOF)".to_string(),
            ));
        }
        Ok(n)
    }

    /// Idempotent; dropping the stream closes the socket.
    pub fn close(&mut self) {
        self.stream = None;
    }
}
