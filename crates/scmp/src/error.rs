// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame decoding errors.
//!
//! Every variant is fatal to the read in progress: the reader discards its
//! buffered bytes and the owner of the connection is expected to reset it.

use thiserror::Error;

/// Errors produced while parsing or building SCMP frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameDecoderError {
    /// Fewer bytes than required to inspect the headline or the full frame.
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// Headline starts with a token that is not a known frame key.
    #[error("unknown headline token {0:?}")]
    UnknownKey(String),

    /// A size field contains something other than ASCII digits.
    #[error("non-digit byte in {field} field")]
    InvalidSizeField { field: &'static str },

    /// Separator or terminator byte missing at a fixed offset.
    #[error("malformed headline at offset {0}")]
    MalformedHeadline(usize),

    /// Protocol version is not supported.
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),

    /// Declared header size exceeds declared message size.
    #[error("header size {header} exceeds message size {message}")]
    HeaderTooLarge { header: usize, message: usize },

    /// Declared (or reassembled) message size exceeds the configured maximum.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// Header line is not `key=value` or is not valid UTF-8.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    /// Header key outside the enumerated attribute set.
    #[error("unknown header attribute {0:?}")]
    UnknownAttribute(String),

    /// Same attribute present twice in one header block.
    #[error("duplicate header attribute {0}")]
    DuplicateAttribute(&'static str),

    /// Value cannot be encoded (contains a line break) or a size does not fit.
    #[error("field overflow: {0}")]
    FieldOverflow(String),

    /// Part frames of different messages were interleaved.
    #[error("part sequence broken: expected message id {expected:?}, got {actual:?}")]
    PartSequence {
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Underlying stream failed or closed in the middle of a frame.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameDecoderError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
