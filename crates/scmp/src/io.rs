// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Async frame reader and writer over any tokio byte stream.
//!
//! The reader keeps partial frames in its own buffer, so `read_frame` and
//! `read_message` are cancel-safe and can sit inside `tokio::select!`.

use crate::error::FrameDecoderError;
use crate::frame::{self, HEADLINE_SIZE};
use crate::large::{self, LargeMessageAssembler};
use crate::message::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

/// Reads frames from a byte stream and reassembles part runs.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_message_size: usize,
    assembler: LargeMessageAssembler,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            max_message_size,
            assembler: LargeMessageAssembler::new(max_message_size),
        }
    }

    /// Discard everything buffered, including a half-assembled message.
    pub fn reset(&mut self) {
        if !self.buf.is_empty() || self.assembler.in_progress() {
            tracing::debug!(
                buffered = self.buf.len(),
                parts = self.assembler.parts(),
                "discarding read buffer"
            );
        }
        self.buf.clear();
        self.assembler.reset();
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read one raw frame. `Ok(None)` on a clean end of stream at a frame
    /// boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Message>, FrameDecoderError> {
        loop {
            if self.buf.len() >= HEADLINE_SIZE {
                let headline = match frame::parse_headline(&self.buf, self.max_message_size) {
                    Ok(h) => h,
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                };
                let total = headline.frame_size();
                if self.buf.len() >= total {
                    let bytes: Vec<u8> = self.buf.drain(..total).collect();
                    return match frame::decode(&bytes, self.max_message_size) {
                        Ok(msg) => Ok(Some(msg)),
                        Err(e) => {
                            self.reset();
                            Err(e)
                        }
                    };
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() && !self.assembler.in_progress() {
                    return Ok(None);
                }
                let buffered = self.buf.len();
                self.reset();
                return Err(FrameDecoderError::Io(format!(
                    "stream closed inside a frame ({} bytes buffered)",
                    buffered
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read one complete message, transparently joining part frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>, FrameDecoderError> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Ok(None);
            };
            match self.assembler.push(frame) {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => continue,
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes messages, splitting large bodies into part frames.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    large_message_limit: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, large_message_limit: usize) -> Self {
        Self {
            inner,
            large_message_limit,
        }
    }

    /// Encode and write `msg` (as one or more frames) and flush.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), FrameDecoderError> {
        for part in large::split_message(msg, self.large_message_limit) {
            let bytes = frame::encode(&part)?;
            self.inner.write_all(&bytes).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameDecoderError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
