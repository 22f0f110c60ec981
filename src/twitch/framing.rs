use super::error::{Result as TwitchResult, TwitchError};

const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// Upper bound on buffered unterminated bytes. A line that never terminates
/// is discarded once it exceeds this instead of growing without bound.
const MAX_CARRY_BYTES: usize = 64 * 1024;

/// Splits the raw byte stream into `\r\n`-terminated protocol lines.
///
/// A received chunk may hold zero, one, or many terminators, and a line may
/// be split across chunks. Unterminated tails are carried over to the next
/// `feed` call. A frame whose bytes are not valid UTF-8 yields an `Err`
/// entry for that frame alone; the carry buffer and every other frame in
/// the chunk survive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one raw chunk and returns every complete line it finishes,
    /// in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<TwitchResult<String>> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(idx) = self
            .carry
            .windows(FRAME_TERMINATOR.len())
            .position(|window| window == FRAME_TERMINATOR)
        {
            let frame = self.carry[..idx].to_vec();
            self.carry.drain(..idx + FRAME_TERMINATOR.len());
            lines.push(String::from_utf8(frame).map_err(TwitchError::Decode));
        }

        if self.carry.len() > MAX_CARRY_BYTES {
            tracing::warn!(
                carried_bytes = self.carry.len(),
                "Unterminated line exceeded carry limit; discarding buffered bytes"
            );
            self.carry.clear();
        }

        lines
    }

    /// Drops any buffered partial line. Used when the connection is torn
    /// down, since the next session starts a fresh stream.
    pub fn reset(&mut self) {
        self.carry.clear();
    }

    #[cfg(test)]
    fn carried(&self) -> &[u8] {
        &self.carry
    }
}
