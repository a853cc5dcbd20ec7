//! Error types for the synchronization engine.
//!
//! None of these are fatal to the host: protocol errors skip a frame,
//! collection and status errors skip a poll, join errors are returned to
//! the caller.

use crate::types::RegionCoord;
use thiserror::Error;

/// Errors raised while decoding or validating binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame had no opcode byte.
    #[error("empty frame")]
    EmptyFrame,

    /// Fewer bytes remained than the field required.
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// Opcode byte has no registered inbound schema.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// An update blob record started with an unknown type byte.
    #[error("unknown update record type {0}")]
    UnknownRecord(u8),

    /// An embedded JSON document failed to parse.
    #[error("invalid json in {field}: {reason}")]
    InvalidJson { field: &'static str, reason: String },

    /// A method decoded successfully but left bytes behind.
    #[error("{len} trailing bytes after {method}")]
    TrailingBytes { method: &'static str, len: usize },

    /// A declared method has no binary schema.
    #[error("no binary schema registered for {0}")]
    MissingSchema(&'static str),

    /// Two schema entries claim the same opcode.
    #[error("duplicate schema entry for opcode {0:#04x}")]
    DuplicateSchema(u8),

    /// A region snapshot carried the wrong number of tiles.
    #[error("tile blob for region {coord} has {actual} tiles, expected {expected}")]
    TileCount {
        coord: RegionCoord,
        expected: usize,
        actual: usize,
    },
}

/// Application-level join failures, surfaced to the caller of `join()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("a join is already in progress")]
    AlreadyJoining,

    #[error("already connected to a session")]
    AlreadyPlaying,

    #[error("transport not supported in this environment")]
    UnsupportedTransport,

    /// The account API refused admission. `alert` is a blocking
    /// account message to show the user, if any.
    #[error("join denied{}", alert.as_ref().map(|a| format!(": {a}")).unwrap_or_default())]
    Denied { alert: Option<String> },

    /// Account-creation limit still in force after every retry.
    #[error("account creation limit reached after {attempts} attempts")]
    AccountCreationLimit { attempts: u32 },

    /// The join was cancelled by `leave()` before the handshake completed.
    #[error("join cancelled before handshake completed")]
    Cancelled,

    /// The account API itself failed (network, HTTP status, ...).
    #[error("account api error: {0}")]
    Api(String),
}

/// Errors raised while polling a watermarked collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectionError {
    #[error("collection source failed: {0}")]
    Source(String),

    #[error("failed to decode record: {0}")]
    Decode(String),
}

/// Transport-level send failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Failure fetching server status while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("status endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("malformed status response: {0}")]
    Decode(String),
}
