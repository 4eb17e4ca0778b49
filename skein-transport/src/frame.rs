//! Sentinel-delimited JSON framing.
//!
//! # Wire Format
//!
//! ```text
//! <envelope JSON>!<^>!<envelope JSON>!<^>!...
//! ```
//!
//! Each envelope is written as compact JSON followed by the sentinel
//! `!<^>!`. The encoder writes every `<` as the JSON escape `\u003c`. A `<`
//! can only occur inside a JSON string, so the escape is read back as the
//! same text and the sentinel never appears inside an encoded envelope.
//!
//! # Streaming Decode
//!
//! TCP delivers arbitrary chunks. [`FrameDecoder`] keeps the trailing
//! incomplete segment of each chunk and prepends it to the next one, so the
//! envelopes produced do not depend on where the chunk boundaries fall.
//! Malformed input never surfaces as an error: a segment that is followed by
//! a sentinel and still fails to parse is dropped and counted.

use std::time::Duration;

use crate::config::FrameConfig;
use crate::envelope::{Envelope, PacketKind};

/// Frame delimiter.
pub const SENTINEL: &str = "!<^>!";

const SENTINEL_BYTES: &[u8] = SENTINEL.as_bytes();

/// Errors that can occur while encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The envelope could not be serialized.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Serializer message.
        message: String,
    },
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError::Serialization {
            message: err.to_string(),
        }
    }
}

/// An encoded frame, ready to be queued.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Frame bytes including the trailing sentinel.
    pub bytes: Vec<u8>,
    /// Whether the frame exceeded `max_frame_size`.
    pub oversized: bool,
}

/// Encode an envelope as one frame.
///
/// Request and response frames above `config.max_frame_size` are reported
/// through `tracing::warn!` and flagged as oversized. They are never
/// rejected.
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] if the envelope cannot be written
/// as JSON.
pub fn encode_frame(envelope: &Envelope, config: &FrameConfig) -> Result<EncodedFrame, FrameError> {
    let json = serde_json::to_string(envelope)?;
    let mut text = json.replace('<', "\\u003c");
    text.push_str(SENTINEL);

    let oversized = envelope.kind.is_rpc() && text.len() > config.max_frame_size;
    if oversized {
        tracing::warn!(
            kind = %envelope.kind,
            entity = %envelope.entity,
            endpoint = envelope.endpoint_or_dash(),
            request_id = envelope.request_id().unwrap_or("-"),
            size = text.len(),
            limit = config.max_frame_size,
            "oversized frame"
        );
    }

    Ok(EncodedFrame {
        bytes: text.into_bytes(),
        oversized,
    })
}

/// Counters kept by a [`FrameDecoder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderMetrics {
    /// Envelopes decoded.
    pub frames_decoded: u64,
    /// Terminated segments that failed to parse and were dropped.
    pub malformed_frames: u64,
    /// Slow-parse diagnostics emitted.
    pub slow_parse_warnings: u64,
    /// Times the buffered input exceeded its bound and was discarded.
    pub resets: u64,
}

#[derive(Debug, Clone, Default)]
struct PendingFragment {
    parse_time: Duration,
    warned: bool,
}

/// Streaming frame decoder, one per connection.
#[derive(Debug)]
pub struct FrameDecoder {
    config: FrameConfig,
    leftover: Vec<u8>,
    fragment: Option<PendingFragment>,
    metrics: DecoderMetrics,
}

impl FrameDecoder {
    /// Create a decoder with empty state.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            leftover: Vec::new(),
            fragment: None,
            metrics: DecoderMetrics::default(),
        }
    }

    /// Feed one chunk read from the connection.
    ///
    /// `clock` returns the current monotonic time. It is read around each
    /// attempt to parse the trailing incomplete segment, and the time spent
    /// in failed attempts is accumulated per fragment.
    pub fn feed(&mut self, chunk: &[u8], clock: impl Fn() -> Duration) -> Vec<Envelope> {
        // The previous leftover holds no sentinel; one can only end in the new bytes.
        let mut search_from = self
            .leftover
            .len()
            .saturating_sub(SENTINEL_BYTES.len() - 1);
        let mut data = std::mem::take(&mut self.leftover);
        data.extend_from_slice(chunk);

        let mut envelopes = Vec::new();
        let mut start = 0;
        while let Some(at) = find_sentinel(&data, search_from) {
            let segment = &data[start..at];
            start = at + SENTINEL_BYTES.len();
            search_from = start;
            // Anything after a sentinel is a new fragment.
            self.fragment = None;
            if segment.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Envelope>(segment) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    self.metrics.malformed_frames += 1;
                    tracing::warn!(
                        size = segment.len(),
                        error = %e,
                        "dropping malformed frame"
                    );
                }
            }
        }

        let rest = &data[start..];
        let mut parse_time = None;
        if !rest.is_empty() {
            let before = clock();
            let parsed = serde_json::from_slice::<Envelope>(rest);
            let spent = clock().saturating_sub(before);
            match parsed {
                Ok(envelope) => envelopes.push(envelope),
                Err(_) => {
                    tracing::trace!(size = rest.len(), "buffering partial frame");
                    self.leftover = rest.to_vec();
                    parse_time = Some(spent);
                }
            }
        }

        self.metrics.frames_decoded += envelopes.len() as u64;

        if self.leftover.len() > self.config.max_buffered_bytes {
            tracing::error!(
                buffered = self.leftover.len(),
                limit = self.config.max_buffered_bytes,
                "buffered input exceeds limit, resetting stream state"
            );
            self.metrics.resets += 1;
            self.reset();
            return envelopes;
        }

        match parse_time {
            Some(spent) => self.record_parse_time(spent),
            None => self.fragment = None,
        }
        envelopes
    }

    /// Discard all buffered input, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.leftover.clear();
        self.fragment = None;
    }

    /// Bytes currently held as an incomplete fragment.
    pub fn buffered_len(&self) -> usize {
        self.leftover.len()
    }

    /// Decoder counters.
    pub fn metrics(&self) -> &DecoderMetrics {
        &self.metrics
    }

    fn record_parse_time(&mut self, spent: Duration) {
        let fragment = self.fragment.get_or_insert_with(PendingFragment::default);
        fragment.parse_time += spent;
        if fragment.warned || fragment.parse_time < self.config.slow_parse_threshold {
            return;
        }
        let Some(kind) = sniff_kind(&self.leftover).filter(|kind| kind.is_rpc()) else {
            return;
        };

        fragment.warned = true;
        self.metrics.slow_parse_warnings += 1;
        let endpoint = sniff_string_field(&self.leftover, "endpoint");
        tracing::warn!(
            kind = %kind,
            endpoint = endpoint.as_deref().unwrap_or("-"),
            buffered = self.leftover.len(),
            parse_ms = fragment.parse_time.as_millis() as u64,
            "slow frame parse"
        );
    }
}

/// Position of the first sentinel starting at or after `from`.
fn find_sentinel(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(SENTINEL_BYTES.len())
        .position(|window| window == SENTINEL_BYTES)
        .map(|at| at + from)
}

/// Best-effort extraction of a top-level string field from incomplete JSON.
fn sniff_string_field(fragment: &[u8], key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let start = fragment
        .windows(needle.len())
        .position(|window| window == needle.as_bytes())?;
    let mut rest = &fragment[start + needle.len()..];
    rest = trim_ascii_start(rest);
    rest = rest.strip_prefix(b":")?;
    rest = trim_ascii_start(rest);
    rest = rest.strip_prefix(b"\"")?;
    let end = rest.iter().position(|&b| b == b'"')?;
    std::str::from_utf8(&rest[..end]).ok().map(str::to_string)
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let skip = bytes
        .iter()
        .take_while(|b| b.is_ascii_whitespace())
        .count();
    &bytes[skip..]
}

fn sniff_kind(fragment: &[u8]) -> Option<PacketKind> {
    match sniff_string_field(fragment, "type")?.as_str() {
        "request" => Some(PacketKind::Request),
        "response" => Some(PacketKind::Response),
        "publish" => Some(PacketKind::Publish),
        "ping" => Some(PacketKind::Ping),
        _ => None,
    }
}
