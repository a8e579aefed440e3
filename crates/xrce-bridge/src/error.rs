// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Entity failures (already exists, unknown reference, ...) are not errors of
//! the call that produced them: they travel back to the requester as a
//! [`StatusCode`](crate::protocol::StatusCode) inside a STATUS submessage.
//! `XrceError` covers everything that is surfaced synchronously instead.

use thiserror::Error;

/// Errors produced by the XRCE subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XrceError {
    // -- malformed input --------------------------------------------------
    #[error("buffer too short")]
    BufferTooShort,

    #[error("unknown submessage id: 0x{0:02x}")]
    UnknownSubmessageId(u8),

    #[error("unknown object kind: 0x{0:02x}")]
    UnknownObjectKind(u8),

    #[error("unknown status code: 0x{0:02x}")]
    UnknownStatusCode(u8),

    #[error("unknown representation format: 0x{0:02x}")]
    UnknownRepresentation(u8),

    #[error("payload length mismatch")]
    PayloadLengthMismatch,

    #[error("string is not valid UTF-8")]
    InvalidString,

    // -- capacity ---------------------------------------------------------
    /// Output window or buffer is full; drain it with `run` and retry.
    #[error("stream buffer exhausted")]
    BufferExhausted,

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    ExceedsMaxMessageSize { size: usize, max: usize },

    // -- fragmentation ----------------------------------------------------
    #[error("fragment {fragment_nr} does not belong to any reassembly in progress")]
    FragmentOutOfSession { fragment_nr: u16 },

    #[error("fragment error: {0}")]
    FragmentError(String),

    // -- caller misuse ----------------------------------------------------
    /// The stream was never created on this session.
    #[error("stream 0x{0:02x} does not exist")]
    UnknownStream(u8),

    /// Output stream given where an input one is expected, or the reverse.
    #[error("invalid stream id 0x{0:02x}")]
    InvalidStreamId(u8),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // -- lifecycle --------------------------------------------------------
    #[error("session closed")]
    SessionClosed,

    #[error("timed out")]
    TimedOut,

    /// A reliable output stream ran out of heartbeat retries.
    #[error("reliable stream 0x{0:02x} gave up on its peer")]
    StreamFailed(u8),

    // -- collaborators ----------------------------------------------------
    /// A transport-level I/O error (message only, not the original error).
    #[error("I/O error: {0}")]
    Io(String),

    /// The transport will never deliver again.
    #[error("transport closed")]
    TransportClosed,

    /// Error forwarded from the middleware side.
    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for XrceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, XrceError>;
