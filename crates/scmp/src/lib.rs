// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SCMP - Service Connector Message Protocol.
//!
//! Wire protocol spoken between clients, the service connector and backend
//! servers.
//!
//! # Frame layout
//!
//! ```text
//! REQ 000043 000000048 1.0\n      <- headline (25 bytes, fixed offsets)
//! msgType=CLN_DATA\n              <- header block (header size bytes)
//! sessionId=abc\n
//! messageId=3\n
//! hello                           <- opaque body (message size - header size)
//! ```
//!
//! # Modules
//!
//! - [`frame`] - headline parsing, single-frame encode/decode
//! - [`header`] - enumerated attribute keys and the ordered header block
//! - [`message`] - message types, frame kinds and the [`Message`] model
//! - [`large`] - splitting large bodies into part frames and reassembly
//! - [`sequencer`] - per-session message id tracking
//! - [`io`] - async frame reader/writer

pub mod error;
pub mod frame;
pub mod header;
pub mod io;
pub mod large;
pub mod message;
pub mod sequencer;

pub use error::FrameDecoderError;
pub use frame::{
    decode, encode, parse_frame_size, parse_headline, Headline, DEFAULT_MAX_MESSAGE_SIZE,
    HEADLINE_SIZE, PROTOCOL_VERSION,
};
pub use header::{Header, HeaderKey};
pub use io::{FrameReader, FrameWriter};
pub use large::{split_message, LargeMessageAssembler, DEFAULT_LARGE_MESSAGE_LIMIT};
pub use message::{FrameKind, Message, MessageType, UnknownMessageType};
pub use sequencer::{verify_echo, MessageSequencer, SequenceError};
