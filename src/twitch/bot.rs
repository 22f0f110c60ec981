use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::chat_log::ChatSink;

use super::error::{Result as TwitchResult, TwitchError};
use super::framing::FrameDecoder;
use super::ranking::ChannelSource;
use super::reconcile;
use super::transport::IrcTransport;
use super::types::{BotStatus, Credentials};

pub const CMD_PASS: &str = "PASS";
pub const CMD_NICK: &str = "NICK";
pub const CMD_JOIN: &str = "JOIN";
pub const CMD_PART: &str = "PART";
pub const CMD_PING: &str = "PING";
pub const CMD_PONG: &str = "PONG";

const RECV_BUFFER_BYTES: usize = 2048;

// Reconnect backoff configuration
const BASE_BACKOFF_SECONDS: u64 = 2;
const MAX_BACKOFF_SECONDS: u64 = 300; // 5 minutes max
const MAX_CONSECUTIVE_FAILURES: u32 = 8;

/// What the dispatch step decided to do with one decoded line.
#[derive(Debug, PartialEq, Eq)]
enum LineAction {
    /// Liveness probe; answer PONG, never log.
    Pong,
    /// Ordinary chat traffic; append to the sink.
    Record,
    /// Empty or self-referential; dropped silently.
    Drop,
}

/// A line mentioning our own username is server join/echo noise, not chat
/// worth recording.
fn classify_line(line: &str, own_username: &str) -> LineAction {
    if line.starts_with(CMD_PING) {
        LineAction::Pong
    } else if line.is_empty() || line.contains(own_username) {
        LineAction::Drop
    } else {
        LineAction::Record
    }
}

fn backoff_delay(failed_attempts: u32) -> Duration {
    let exp = BASE_BACKOFF_SECONDS.saturating_mul(2u64.saturating_pow(failed_attempts.saturating_sub(1)));
    let capped = exp.min(MAX_BACKOFF_SECONDS);
    // +/- 50% jitter so a fleet of bots does not reconnect in lockstep.
    let jitter = rand::thread_rng().gen_range(0.5..=1.5);
    Duration::from_secs_f64(capped as f64 * jitter)
}

/// Joins the ranked channel set, records chat to the sink, and keeps
/// membership synchronized with the ranking source on a timer.
///
/// Single owner of the transport: every send and receive goes through this
/// engine's task, so no locking is needed anywhere.
pub struct BotEngine<S: ChannelSource> {
    transport: IrcTransport,
    decoder: FrameDecoder,
    source: S,
    sink: Box<dyn ChatSink + Send>,
    credentials: Credentials,
    channels: HashSet<String>,
    refresh_interval: Duration,
    last_refresh: Instant,
    status: BotStatus,
    reached_running: bool,
}

impl<S: ChannelSource> BotEngine<S> {
    pub fn new(
        server_addr: &str,
        source: S,
        sink: Box<dyn ChatSink + Send>,
        credentials: Credentials,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            transport: IrcTransport::new(server_addr),
            decoder: FrameDecoder::new(),
            source,
            sink,
            credentials,
            channels: HashSet::new(),
            refresh_interval,
            last_refresh: Instant::now(),
            status: BotStatus::Disconnected,
            reached_running: false,
        }
    }

    fn set_status(&mut self, status: BotStatus) {
        match &status {
            BotStatus::Connecting { attempt } => {
                tracing::info!(attempt = *attempt, "Connecting to IRC server");
            }
            BotStatus::Joining { channel_count } => {
                tracing::info!(channel_count = *channel_count, "Joining ranked channels");
            }
            BotStatus::Reconnecting {
                reason,
                failed_attempt,
                retry_in,
            } => {
                tracing::warn!(
                    reason = %reason,
                    failed_attempt = *failed_attempt,
                    retry_in = ?retry_in,
                    "Connection lost; backing off before reconnect"
                );
            }
            _ => {}
        }
        tracing::debug!(
            from = self.status.label(),
            to = status.label(),
            "Engine status changed"
        );
        self.status = status;
    }

    /// Runs until the shutdown signal fires (Ok), the initial ranking fetch
    /// fails, or the connection is lost beyond the reconnect budget (Err).
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> TwitchResult<()> {
        // Initial channel set. A failure here prevents startup entirely.
        self.channels = self.source.fetch().await?;
        tracing::info!(
            channel_count = self.channels.len(),
            "Initial ranked channel set fetched"
        );

        let mut consecutive_failures = 0u32;
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;
            self.set_status(BotStatus::Connecting { attempt });

            match self.run_session(&mut shutdown).await {
                Ok(()) => break Ok(()),
                Err(err) => {
                    self.transport.close();
                    self.decoder.reset();

                    // A dead sink is not a connection problem; reconnecting
                    // cannot fix it, so fail immediately.
                    if matches!(err, TwitchError::Sink(_)) {
                        tracing::error!(error = %err, "Chat sink failed");
                        break Err(err);
                    }

                    // A session that made it to Running earns a fresh budget.
                    if self.reached_running {
                        consecutive_failures = 1;
                    } else {
                        consecutive_failures += 1;
                    }

                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::error!(
                            error = %err,
                            failures = consecutive_failures,
                            "Reconnect budget exhausted; giving up"
                        );
                        break Err(err);
                    }

                    let delay = backoff_delay(consecutive_failures);
                    self.set_status(BotStatus::Reconnecting {
                        reason: err.to_string(),
                        failed_attempt: consecutive_failures,
                        retry_in: delay,
                    });
                    tokio::select! {
                        _ = &mut shutdown => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.set_status(BotStatus::ShuttingDown);
        self.transport.close();
        if let Err(err) = self.sink.flush().await {
            tracing::warn!(error = %err, "Failed to flush chat sink on shutdown");
        }
        self.set_status(BotStatus::Terminated);
        outcome
    }

    /// One connection lifetime: connect, authenticate, join, then read until
    /// the transport fails (Err) or shutdown is requested (Ok).
    async fn run_session(&mut self, shutdown: &mut oneshot::Receiver<()>) -> TwitchResult<()> {
        self.reached_running = false;
        tokio::select! {
            _ = &mut *shutdown => {
                tracing::info!("Shutdown signal received during connect");
                return Ok(());
            }
            connected = self.transport.connect() => connected?,
        }

        self.transport
            .send_line(&format!("{} {}", CMD_PASS, self.credentials.token))
            .await?;
        self.transport
            .send_line(&format!("{} {}", CMD_NICK, self.credentials.username))
            .await?;

        self.set_status(BotStatus::Joining {
            channel_count: self.channels.len(),
        });
        let members: Vec<String> = self.channels.iter().cloned().collect();
        for channel in &members {
            self.join_channel(channel).await?;
        }

        self.set_status(BotStatus::Running);
        self.reached_running = true;
        self.last_refresh = Instant::now();

        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            let n = tokio::select! {
                _ = &mut *shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                read = self.transport.recv_chunk(&mut buf) => read?,
            };

            let lines = self.decoder.feed(&buf[..n]);
            for decoded in lines {
                match decoded {
                    Ok(line) => self.dispatch_line(&line).await?,
                    Err(err) => {
                        tracing::warn!(error = %err, "Skipping undecodable frame");
                    }
                }
            }

            // Opportunistic refresh: checked after each chunk, so actual
            // firing lags the interval by up to one blocking read.
            if self.last_refresh.elapsed() >= self.refresh_interval {
                self.refresh_membership().await?;
                self.last_refresh = Instant::now();
            }
        }
    }

    async fn dispatch_line(&mut self, line: &str) -> TwitchResult<()> {
        match classify_line(line, &self.credentials.username) {
            LineAction::Pong => {
                tracing::trace!("Received server PING, responding with PONG");
                self.transport.send_line(CMD_PONG).await?;
            }
            LineAction::Record => {
                self.sink.append(line).await.map_err(TwitchError::Sink)?;
            }
            LineAction::Drop => {}
        }
        Ok(())
    }

    /// Re-fetches the ranking and issues the minimal PART/JOIN delta. A
    /// fetch failure keeps the current membership and waits for the next
    /// interval; send failures propagate like any other transport error.
    async fn refresh_membership(&mut self) -> TwitchResult<()> {
        let new_channels = match self.source.fetch().await {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "Periodic ranking fetch failed; keeping current membership"
                );
                return Ok(());
            }
        };

        let delta = reconcile::diff(&self.channels, &new_channels);
        if !delta.is_empty() {
            tracing::info!(
                leaving = delta.to_leave.len(),
                joining = delta.to_join.len(),
                "Reconciling channel membership"
            );
            for channel in &delta.to_leave {
                self.part_channel(channel).await?;
            }
            for channel in &delta.to_join {
                self.join_channel(channel).await?;
            }
        }
        self.channels = new_channels;
        Ok(())
    }

    async fn join_channel(&mut self, channel: &str) -> TwitchResult<()> {
        self.transport
            .send_line(&format!("{} #{}", CMD_JOIN, channel))
            .await
    }

    async fn part_channel(&mut self, channel: &str) -> TwitchResult<()> {
        self.transport
            .send_line(&format!("{} {}", CMD_PART, channel))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::net::tcp::OwnedReadHalf;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn creds() -> Credentials {
        Credentials {
            username: "loggerbot".to_string(),
            token: "oauth:sekrit".to_string(),
            client_id: "some-client-id".to_string(),
        }
    }

    /// Ranking source that serves a scripted sequence of sets, then fails.
    struct ScriptedSource {
        sets: Mutex<VecDeque<HashSet<String>>>,
    }

    impl ScriptedSource {
        fn new(sets: Vec<HashSet<String>>) -> Self {
            Self {
                sets: Mutex::new(sets.into()),
            }
        }
    }

    #[async_trait]
    impl ChannelSource for ScriptedSource {
        async fn fetch(&self) -> TwitchResult<HashSet<String>> {
            self.sets
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TwitchError::RankFetch("script exhausted".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct VecSink {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl VecSink {
        fn recorded(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatSink for VecSink {
        async fn append(&mut self, line: &str) -> io::Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Sink whose appends always fail, like a full or read-only disk.
    struct FailingSink;

    #[async_trait]
    impl ChatSink for FailingSink {
        async fn append(&mut self, _line: &str) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn read_lines(reader: &mut BufReader<OwnedReadHalf>, count: usize) -> Vec<String> {
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            lines.push(line.trim_end().to_string());
        }
        lines
    }

    #[test]
    fn ping_lines_trigger_pong() {
        assert_eq!(
            classify_line("PING :tmi.twitch.tv", "loggerbot"),
            LineAction::Pong
        );
    }

    #[test]
    fn empty_lines_are_dropped() {
        assert_eq!(classify_line("", "loggerbot"), LineAction::Drop);
    }

    #[test]
    fn self_referential_lines_are_dropped() {
        let join_echo = ":loggerbot!loggerbot@loggerbot.tmi.twitch.tv JOIN #alice";
        assert_eq!(classify_line(join_echo, "loggerbot"), LineAction::Drop);
    }

    #[test]
    fn chat_lines_are_recorded() {
        let msg = ":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #alice :nice play";
        assert_eq!(classify_line(msg, "loggerbot"), LineAction::Record);
    }

    #[test]
    fn backoff_grows_exponentially_within_bounds() {
        for attempt in 1..=20 {
            let delay = backoff_delay(attempt);
            let nominal = (BASE_BACKOFF_SECONDS * 2u64.saturating_pow(attempt - 1))
                .min(MAX_BACKOFF_SECONDS) as f64;
            assert!(delay.as_secs_f64() >= nominal * 0.5, "attempt {attempt}");
            assert!(delay.as_secs_f64() <= nominal * 1.5, "attempt {attempt}");
        }
    }

    #[tokio::test]
    async fn initial_fetch_failure_prevents_startup() {
        let source = ScriptedSource::new(vec![]);
        let engine = BotEngine::new(
            "127.0.0.1:1",
            source,
            Box::new(VecSink::default()),
            creds(),
            Duration::from_secs(60),
        );
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let err = engine.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, TwitchError::RankFetch(_)));
    }

    #[tokio::test]
    async fn handshake_joins_reconciliation_and_pong_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let source = ScriptedSource::new(vec![set(&["alice", "bob"]), set(&["bob", "carol"])]);
        let sink = VecSink::default();
        let recorded = sink.clone();

        let engine = BotEngine::new(
            &addr,
            source,
            Box::new(sink),
            creds(),
            Duration::from_millis(50),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine_task = tokio::spawn(engine.run(shutdown_rx));

        let (server, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);

        // PASS and NICK precede every JOIN; the two JOINs may come in
        // either set-iteration order.
        let handshake = read_lines(&mut reader, 4).await;
        assert_eq!(handshake[0], "PASS oauth:sekrit");
        assert_eq!(handshake[1], "NICK loggerbot");
        let mut joins = handshake[2..].to_vec();
        joins.sort();
        assert_eq!(joins, vec!["JOIN #alice", "JOIN #bob"]);

        // Let the refresh interval lapse, then poke the read loop with a
        // chat line so the opportunistic refresh check fires.
        tokio::time::sleep(Duration::from_millis(80)).await;
        write_half
            .write_all(b":viewer!v@v.tmi.twitch.tv PRIVMSG #alice :hello\r\n")
            .await
            .unwrap();

        // {alice,bob} -> {bob,carol}: exactly PART alice and JOIN carol.
        let mut delta = read_lines(&mut reader, 2).await;
        delta.sort();
        assert_eq!(delta, vec!["JOIN #carol", "PART alice"]);

        // Liveness probe gets exactly one PONG and is never recorded.
        write_half.write_all(b"PING :tmi.twitch.tv\r\n").await.unwrap();
        let pong = read_lines(&mut reader, 1).await;
        assert_eq!(pong, vec!["PONG"]);

        shutdown_tx.send(()).unwrap();
        engine_task.await.unwrap().unwrap();

        let logged = recorded.recorded();
        assert_eq!(
            logged,
            vec![":viewer!v@v.tmi.twitch.tv PRIVMSG #alice :hello".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_refresh_leaves_membership_untouched() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // One initial set only: every refresh fetch fails.
        let source = ScriptedSource::new(vec![set(&["alice"])]);
        let engine = BotEngine::new(
            &addr,
            source,
            Box::new(VecSink::default()),
            creds(),
            Duration::from_millis(20),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine_task = tokio::spawn(engine.run(shutdown_rx));

        let (server, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);
        read_lines(&mut reader, 3).await; // PASS, NICK, JOIN #alice

        // Trigger two refresh rounds; both fetches fail.
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            write_half
                .write_all(b":v!v@v.tmi.twitch.tv PRIVMSG #alice :hi\r\n")
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        shutdown_tx.send(()).unwrap();
        engine_task.await.unwrap().unwrap();

        // No PART/JOIN traffic beyond the handshake: the server-side read
        // buffer holds nothing but what we already consumed.
        let mut leftover = String::new();
        use tokio::io::AsyncReadExt;
        reader.read_to_string(&mut leftover).await.unwrap();
        assert!(!leftover.contains("PART"));
        assert!(!leftover.contains("JOIN"));
    }

    #[tokio::test]
    async fn reconnects_and_rejoins_after_connection_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let source = ScriptedSource::new(vec![set(&["alice"])]);
        let engine = BotEngine::new(
            &addr,
            source,
            Box::new(VecSink::default()),
            creds(),
            Duration::from_secs(60),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine_task = tokio::spawn(engine.run(shutdown_rx));

        // First session: handshake, then the server hangs up.
        let (server, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);
        let first = read_lines(&mut reader, 3).await;
        assert_eq!(first, vec!["PASS oauth:sekrit", "NICK loggerbot", "JOIN #alice"]);
        drop(reader);
        drop(_write_half);

        // Second session after backoff: same handshake, membership rejoined
        // without another ranking fetch.
        let (server, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);
        let second = read_lines(&mut reader, 3).await;
        assert_eq!(second, vec!["PASS oauth:sekrit", "NICK loggerbot", "JOIN #alice"]);

        shutdown_tx.send(()).unwrap();
        engine_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sink_failure_is_fatal_without_reconnect_cycles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let source = ScriptedSource::new(vec![set(&["alice"])]);
        let engine = BotEngine::new(
            &addr,
            source,
            Box::new(FailingSink),
            creds(),
            Duration::from_secs(60),
        );
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine_task = tokio::spawn(engine.run(shutdown_rx));

        let (server, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);
        read_lines(&mut reader, 3).await; // PASS, NICK, JOIN #alice

        write_half
            .write_all(b":v!v@v.tmi.twitch.tv PRIVMSG #alice :hi\r\n")
            .await
            .unwrap();

        // Were this treated as a transport error the engine would reconnect
        // and block on the next read instead of finishing.
        let err = tokio::time::timeout(Duration::from_secs(5), engine_task)
            .await
            .expect("sink failure must terminate the engine promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TwitchError::Sink(_)));
    }

    #[tokio::test]
    async fn shutdown_during_backoff_terminates_cleanly() {
        // Nothing listens on this port, so every connect attempt fails and
        // the engine sits in backoff.
        let source = ScriptedSource::new(vec![set(&["alice"])]);
        let engine = BotEngine::new(
            "127.0.0.1:1",
            source,
            Box::new(VecSink::default()),
            creds(),
            Duration::from_secs(60),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine_task = tokio::spawn(engine.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), engine_task)
            .await
            .expect("engine must honor shutdown during backoff")
            .unwrap();
        assert!(result.is_ok());
    }
}
