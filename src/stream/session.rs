//! Line framing over one open data feed body.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use metrics::counter;

use crate::comms::api::FeedBody;

/// Longest line kept in memory; longer lines are discarded.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One long-lived feed connection, read as newline-delimited payloads.
///
/// Blank lines are keep-alives and never surface. A transport error in the
/// middle of the body ends the session like a clean close; the partial line
/// buffered at that point is discarded. So is any line over the length cap.
pub struct StreamingSession {
    body: FeedBody,
    buf: BytesMut,
    /// Prefix of `buf` already searched for a newline.
    scanned: usize,
    max_line: usize,
    /// Inside an oversized line; drop bytes up to the next newline.
    discarding: bool,
    finished: bool,
}

impl StreamingSession {
    pub fn new(body: FeedBody) -> Self {
        Self::with_max_line(body, MAX_LINE_BYTES)
    }

    pub fn with_max_line(body: FeedBody, max_line: usize) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            scanned: 0,
            max_line,
            discarding: false,
            finished: false,
        }
    }

    /// Next non-blank line without its terminator, or `None` once the
    /// connection is gone.
    pub async fn next_line(&mut self) -> Option<Bytes> {
        loop {
            if let Some(pos) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                let line = self.buf.split_to(self.scanned + pos + 1).freeze();
                self.scanned = 0;
                if std::mem::take(&mut self.discarding) || line.len() > self.max_line + 1 {
                    counter!("gateway_events_malformed_total").increment(1);
                    continue;
                }
                match trim(line) {
                    Some(line) => return Some(line),
                    None => continue,
                }
            }
            self.scanned = self.buf.len();

            if self.buf.len() > self.max_line {
                if !self.discarding {
                    self.discarding = true;
                    log::warn!("Discarding feed line longer than {} bytes", self.max_line);
                }
                self.buf.clear();
                self.scanned = 0;
            }
            if self.finished {
                self.scanned = 0;
                let rest = std::mem::take(&mut self.buf).freeze();
                if std::mem::take(&mut self.discarding) {
                    return None;
                }
                return trim(rest);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    log::info!("feed body ended with a transport error: {e}");
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = false;
                    self.finished = true;
                }
                None => self.finished = true,
            }
        }
    }
}

/// Strip surrounding whitespace; `None` for a blank line.
fn trim(line: Bytes) -> Option<Bytes> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace())? + 1;
    Some(line.slice(start..end))
}
