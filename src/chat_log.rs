use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

pub const ACTIVE_LOG_NAME: &str = "chat.log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";
const ROTATION_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Append-only destination for accepted chat lines. Injected into the
/// engine so tests can capture output in memory.
#[async_trait]
pub trait ChatSink: Send {
    async fn append(&mut self, line: &str) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
}

/// File-backed sink that timestamps every line in UTC and rolls the active
/// file over on a fixed interval. On rollover the active `chat.log` is
/// renamed to `chat.log.<open-stamp>` and a fresh file is opened; prior
/// rotations are never deleted.
pub struct RotatingChatLog {
    directory: PathBuf,
    writer: BufWriter<File>,
    opened_at: DateTime<Utc>,
    rotate_every: TimeDelta,
}

impl RotatingChatLog {
    pub fn new(directory: impl AsRef<Path>, rotate_every: Duration) -> io::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        // A leftover active log keeps its original age, so content that
        // predates a restart still rotates out on schedule.
        let opened_at = fs::metadata(directory.join(ACTIVE_LOG_NAME))
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let writer = BufWriter::new(open_active_file(&directory)?);
        Ok(Self {
            directory,
            writer,
            opened_at,
            rotate_every: TimeDelta::from_std(rotate_every).unwrap_or(TimeDelta::MAX),
        })
    }

    fn append_at(&mut self, now: DateTime<Utc>, line: &str) -> io::Result<()> {
        if now.signed_duration_since(self.opened_at) >= self.rotate_every {
            self.rotate(now)?;
        }
        writeln!(self.writer, "{} {}", now.format(TIMESTAMP_FORMAT), line)
    }

    fn rotate(&mut self, now: DateTime<Utc>) -> io::Result<()> {
        self.writer.flush()?;
        let active = self.directory.join(ACTIVE_LOG_NAME);
        let rotated = self.directory.join(format!(
            "{}.{}",
            ACTIVE_LOG_NAME,
            self.opened_at.format(ROTATION_STAMP_FORMAT)
        ));
        fs::rename(&active, &rotated)?;
        self.writer = BufWriter::new(open_active_file(&self.directory)?);
        self.opened_at = now;
        tracing::debug!(rotated_to = %rotated.display(), "Rotated chat log");
        Ok(())
    }
}

#[async_trait]
impl ChatSink for RotatingChatLog {
    async fn append(&mut self, line: &str) -> io::Result<()> {
        self.append_at(Utc::now(), line)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn open_active_file(directory: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(directory.join(ACTIVE_LOG_NAME))
}
