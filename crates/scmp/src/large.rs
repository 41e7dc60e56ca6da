// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Large message handling.
//!
//! A body above the large-message limit travels as a run of part frames
//! (`PRQ`/`PRS`) terminated by one ordinary frame. Every frame of the run
//! repeats the full header, so all of them carry the same `messageId`.

use crate::error::FrameDecoderError;
use crate::header::HeaderKey;
use crate::message::Message;

/// Default large-message limit (60 KiB of body per frame).
pub const DEFAULT_LARGE_MESSAGE_LIMIT: usize = 60 * 1024;

/// Split `msg` into the frames that carry it. Messages whose body fits in
/// `limit` are returned unchanged as a single frame.
///
/// Keep-alive and fault messages are never split.
pub fn split_message(msg: &Message, limit: usize) -> Vec<Message> {
    if limit == 0 || msg.body.len() <= limit || msg.keep_alive || msg.fault {
        return vec![msg.clone()];
    }

    let chunks: Vec<&[u8]> = msg.body.chunks(limit).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Message {
            header: msg.header.clone(),
            body: chunk.to_vec(),
            reply: msg.reply,
            part: i != last,
            fault: false,
            keep_alive: false,
        })
        .collect()
}

/// Collects part frames until the terminating frame arrives.
#[derive(Debug)]
pub struct LargeMessageAssembler {
    max_size: usize,
    pending: Option<Message>,
    parts: usize,
}

impl LargeMessageAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            pending: None,
            parts: 0,
        }
    }

    /// True while a run of parts is open.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of part frames absorbed so far in the open run.
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Drop any half-assembled message.
    pub fn reset(&mut self) {
        self.pending = None;
        self.parts = 0;
    }

    /// Feed one decoded frame. Returns the complete message once the
    /// terminating frame has been seen.
    ///
    /// Keep-alive frames pass straight through without disturbing an open
    /// run.
    pub fn push(&mut self, frame: Message) -> Result<Option<Message>, FrameDecoderError> {
        if frame.keep_alive {
            return Ok(Some(frame));
        }

        let Some(mut pending) = self.pending.take() else {
            if frame.part {
                self.check_size(frame.body.len())?;
                self.parts = 1;
                self.pending = Some(frame);
                return Ok(None);
            }
            return Ok(Some(frame));
        };

        let expected = pending.header.get(HeaderKey::MessageId);
        let actual = frame.header.get(HeaderKey::MessageId);
        if expected != actual || pending.reply != frame.reply || frame.fault {
            let err = FrameDecoderError::PartSequence {
                expected: expected.map(str::to_string),
                actual: actual.map(str::to_string),
            };
            self.reset();
            return Err(err);
        }

        let size = pending.body.len() + frame.body.len();
        if let Err(e) = self.check_size(size) {
            self.reset();
            return Err(e);
        }
        pending.body.extend_from_slice(&frame.body);

        if frame.part {
            self.parts += 1;
            self.pending = Some(pending);
            Ok(None)
        } else {
            self.parts = 0;
            pending.part = false;
            pending.header = frame.header;
            Ok(Some(pending))
        }
    }

    fn check_size(&self, size: usize) -> Result<(), FrameDecoderError> {
        if size > self.max_size {
            return Err(FrameDecoderError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}
