//! ICY (Shoutcast) protocol metadata handling.
//!
//! This module encapsulates metadata block parsing and the reframing of an
//! interleaved audio+metadata byte stream, keeping protocol concerns separate
//! from socket handling in [`crate::proxy`].

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::events::TrackMetadata;
use crate::protocol_constants::{
    ICY_MAX_META_BLOCK, ICY_META_BLOCK_UNIT, STREAM_TITLE_KEY, STREAM_URL_KEY,
};

/// Negotiated metadata interval of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MetaInterval {
    /// Response headers not parsed yet.
    Unknown,
    /// Headers parsed, server sent no usable `icy-metaint`.
    Absent,
    /// A metadata block follows every `n` audio bytes.
    Every(usize),
}

impl MetaInterval {
    /// Returns the interval in bytes, if metadata is interleaved.
    #[must_use]
    pub fn bytes(&self) -> Option<usize> {
        match self {
            Self::Every(n) => Some(*n),
            _ => None,
        }
    }

    /// Legacy representation: `-1` when no interval is in effect.
    #[must_use]
    pub fn as_signed(&self) -> i64 {
        self.bytes().map_or(-1, |n| n as i64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata Block Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes metadata text: UTF-8 when valid, otherwise Latin-1.
///
/// Trailing NUL padding and surrounding whitespace are removed.
pub fn decode_metadata_text(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    let raw = &raw[..end];

    let text = match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::trace!("[ICY] Metadata is not valid UTF-8, decoding as Latin-1");
            raw.iter().map(|&b| b as char).collect()
        }
    };
    text.trim().to_string()
}

/// Extracts a single-quoted value following `key`.
///
/// Finds the key, then the first `'` after it, then the next `'`. Returns an
/// empty string if the key or either quote is missing.
pub fn extract_value(text: &str, key: &str) -> String {
    let Some(key_pos) = text.find(key) else {
        return String::new();
    };
    let after_key = &text[key_pos + key.len()..];
    let Some(open) = after_key.find('\'') else {
        return String::new();
    };
    let value = &after_key[open + 1..];
    match value.find('\'') {
        Some(close) => value[..close].to_string(),
        None => String::new(),
    }
}

/// Parses a metadata block payload (without its length byte).
///
/// The payload looks like `StreamTitle='...';StreamUrl='...';` with any
/// number of further `key='value';` pairs, which are ignored.
pub fn parse_metadata_block(raw: &[u8]) -> TrackMetadata {
    let text = decode_metadata_text(raw);
    log::trace!("[ICY] Metadata block: {}", text);
    TrackMetadata {
        title: extract_value(&text, STREAM_TITLE_KEY),
        stream_url: extract_value(&text, STREAM_URL_KEY),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reframing
// ─────────────────────────────────────────────────────────────────────────────

/// Where the demuxer is within the current metadata interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Counting audio bytes towards the next boundary.
    Audio,
    /// The next byte is a metadata length byte.
    Length,
    /// Collecting a metadata block; `remaining` bytes still missing.
    Metadata { remaining: usize },
}

/// Result of feeding one network buffer to the demuxer.
#[derive(Debug, Default)]
pub struct Demuxed {
    /// Audio payload with all metadata removed, in stream order.
    pub audio: Bytes,
    /// Metadata blocks completed in this buffer, in stream order.
    pub metadata: Vec<TrackMetadata>,
}

/// Stateful splitter separating ICY metadata blocks from audio payload.
///
/// The inverse of metadata injection: tracks the byte position within the
/// current interval and diverts length bytes and metadata blocks away from
/// the audio output. All state persists across [`feed`](Self::feed) calls, so
/// the output does not depend on how the input was chunked.
///
/// Each instance should be used for a single stream session.
pub struct IcyDemuxer {
    /// Metadata interval; `None` relays everything untouched.
    meta_int: Option<usize>,
    /// Audio bytes since the last boundary, in `0..=meta_int`.
    bytes_since_meta: usize,
    phase: Phase,
    /// Partially collected metadata block.
    meta_buffer: Vec<u8>,
    /// Scratch buffer reused across feed() calls.
    output_buffer: BytesMut,
    audio_bytes: u64,
    metadata_blocks: u64,
}

impl IcyDemuxer {
    /// Creates a demuxer for the negotiated interval.
    #[must_use]
    pub fn new(meta_interval: MetaInterval) -> Self {
        Self {
            meta_int: meta_interval.bytes().filter(|&n| n > 0),
            bytes_since_meta: 0,
            phase: Phase::Audio,
            meta_buffer: Vec::with_capacity(ICY_MAX_META_BLOCK),
            output_buffer: BytesMut::new(),
            audio_bytes: 0,
            metadata_blocks: 0,
        }
    }

    /// Splits one buffer of stream data into audio and parsed metadata.
    pub fn feed(&mut self, chunk: &[u8]) -> Demuxed {
        let mut metadata = Vec::new();

        let Some(meta_int) = self.meta_int else {
            self.audio_bytes += chunk.len() as u64;
            return Demuxed {
                audio: Bytes::copy_from_slice(chunk),
                metadata,
            };
        };

        self.output_buffer.reserve(chunk.len());
        let mut remaining = chunk;

        while !remaining.is_empty() {
            match self.phase {
                Phase::Audio => {
                    let take = (meta_int - self.bytes_since_meta).min(remaining.len());
                    self.output_buffer.extend_from_slice(&remaining[..take]);
                    self.bytes_since_meta += take;
                    remaining = &remaining[take..];
                    if self.bytes_since_meta == meta_int {
                        self.phase = Phase::Length;
                    }
                }
                Phase::Length => {
                    let block_len = remaining[0] as usize * ICY_META_BLOCK_UNIT;
                    remaining = &remaining[1..];
                    if block_len == 0 {
                        self.bytes_since_meta = 0;
                        self.phase = Phase::Audio;
                    } else {
                        self.meta_buffer.clear();
                        self.phase = Phase::Metadata {
                            remaining: block_len,
                        };
                    }
                }
                Phase::Metadata { remaining: missing } => {
                    let take = missing.min(remaining.len());
                    self.meta_buffer.extend_from_slice(&remaining[..take]);
                    remaining = &remaining[take..];
                    if take == missing {
                        metadata.push(parse_metadata_block(&self.meta_buffer));
                        self.meta_buffer.clear();
                        self.metadata_blocks += 1;
                        self.bytes_since_meta = 0;
                        self.phase = Phase::Audio;
                    } else {
                        self.phase = Phase::Metadata {
                            remaining: missing - take,
                        };
                    }
                }
            }
        }

        let audio = self.output_buffer.split().freeze();
        self.audio_bytes += audio.len() as u64;
        Demuxed { audio, metadata }
    }

    /// Returns the current byte count since the last metadata boundary.
    #[must_use]
    pub fn bytes_since_meta(&self) -> usize {
        self.bytes_since_meta
    }

    /// Total audio bytes produced so far.
    #[must_use]
    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes
    }

    /// Number of non-empty metadata blocks consumed so far.
    #[must_use]
    pub fn metadata_blocks(&self) -> u64 {
        self.metadata_blocks
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Formats track metadata into ICY wire blocks.
///
/// The proxy itself only strips metadata; the formatter produces the wire
/// form for synthetic streams (tests, loopback servers).
pub struct IcyFormatter;

impl IcyFormatter {
    /// Formats metadata into an ICY metadata block, length byte included.
    ///
    /// A single zero byte indicates no metadata. Otherwise the
    /// first byte is the number of 16-byte units, followed by the text padded
    /// with NUL bytes. Over-long titles are truncated to fit 255 units.
    #[must_use]
    pub fn format_metadata(metadata: &TrackMetadata) -> Vec<u8> {
        if metadata.is_empty() {
            return vec![0];
        }

        // Single quotes delimit values; substitute a look-alike instead of escaping.
        let mut title = metadata.title.replace('\'', "\u{2019}");
        let stream_url = metadata.stream_url.replace('\'', "%27");

        let meta_str = loop {
            let mut s = format!("{}='{}';", STREAM_TITLE_KEY, title);
            if !stream_url.is_empty() {
                s.push_str(&format!("{}='{}';", STREAM_URL_KEY, stream_url));
            }
            if s.len() <= ICY_MAX_META_BLOCK || title.pop().is_none() {
                break s;
            }
        };
        let meta_bytes = &meta_str.as_bytes()[..meta_str.len().min(ICY_MAX_META_BLOCK)];

        let num_blocks = meta_bytes.len().div_ceil(ICY_META_BLOCK_UNIT);
        let padded_len = num_blocks * ICY_META_BLOCK_UNIT;

        let mut result = Vec::with_capacity(padded_len + 1);
        result.push(num_blocks as u8);
        result.extend_from_slice(meta_bytes);
        result.resize(padded_len + 1, 0);

        result
    }
}
