use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::sma::retry::Phase;

/// Errors from the framing codec itself.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("escape byte 0x7D at end of frame body (offset {offset})")]
    TruncatedEscape { offset: usize },

    #[error("frame too short to carry a length field ({len} bytes)")]
    TooShort { len: usize },

    #[error("frame of {len} bytes does not fit the length field")]
    TooLong { len: usize },

    #[error("no companion byte known for outgoing length 0x{len:02X}")]
    UnknownSendLength { len: u8 },
}

/// Failures reading frames off the link. All of these are retried by the
/// exchange after rewinding to its checkpoint.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no data within {0:?}")]
    Timeout(Duration),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("frame header declares impossible length {0}")]
    BadLength(u8),

    #[error("received our own frame back")]
    Echo,

    #[error("stream payload offset {offset} past safety bound")]
    PayloadOverrun { offset: usize },

    #[error("stream still unterminated after {limit} frames")]
    TooManyFrames { limit: usize },

    #[error("no matching reply in {0} frames")]
    Unmatched(usize),

    #[error("first stream frame too short for record counter ({len} bytes)")]
    StreamTooShort { len: usize },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("link closed")]
    Closed,

    #[error("link i/o: {0}")]
    Io(#[from] io::Error),
}

/// Field extraction failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{field} needs bytes {offset}..{end} but only {len} received")]
    OutOfRange {
        field: &'static str,
        offset: usize,
        end: usize,
        len: usize,
    },

    #[error("unknown record layout tag 0x{0:02X}")]
    UnknownLayout(u8),

    #[error("archive record at {current} does not follow {previous} by 300s")]
    ArchiveGap { previous: i64, current: i64 },

    #[error("time string marker {0:02X} {1:02X}, expected 6D 23")]
    TimeStringMarker(u8, u8),
}

/// Problems found while loading a command script.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: {token} is not valid in {directive} directive")]
    InvalidToken {
        line: usize,
        token: String,
        directive: char,
    },

    #[error("line {line}: {token:?} is neither a placeholder nor a hex byte")]
    BadLiteral { line: usize, token: String },

    #[error("line {line}: directive has no $END")]
    MissingEnd { line: usize },
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{phase} phase: {source}")]
    Link {
        phase: Phase,
        #[source]
        source: LinkError,
    },

    #[error("{phase} phase: {source}")]
    Decode {
        phase: Phase,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("giving up after {failures} failures ({phase} phase allows {limit})")]
    RetriesExhausted {
        phase: Phase,
        failures: u32,
        limit: u32,
    },
}

impl ExchangeError {
    pub fn link(phase: Phase, source: impl Into<LinkError>) -> Self {
        Self::Link {
            phase,
            source: source.into(),
        }
    }

    pub fn decode(phase: Phase, source: DecodeError) -> Self {
        Self::Decode { phase, source }
    }

    /// Phase whose retry budget covers this failure, or None when the
    /// failure is fatal straight away.
    pub fn retry_phase(&self) -> Option<Phase> {
        match self {
            Self::Link { phase, .. } | Self::Decode { phase, .. } => Some(*phase),
            Self::Frame(_) | Self::Script(_) | Self::RetriesExhausted { .. } => None,
        }
    }
}
