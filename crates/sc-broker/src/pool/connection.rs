// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One framed SCMP connection to a backend.

use super::PoolError;
use crate::transport::{BoxedStream, Endpoint};
use scmp::{FrameReader, FrameWriter, Message};
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};

/// A framed transport connection plus the timestamps the pool schedules on.
pub struct ScmpConnection {
    id: u64,
    endpoint: Endpoint,
    reader: FrameReader<ReadHalf<BoxedStream>>,
    writer: FrameWriter<WriteHalf<BoxedStream>>,
    created: Instant,
    pub(super) last_used: Instant,
    pub(super) idle_deadline: Instant,
    pub(super) next_keep_alive: Option<Instant>,
}

impl std::fmt::Debug for ScmpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScmpConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("age", &self.created.elapsed())
            .finish()
    }
}

impl ScmpConnection {
    pub fn new(
        id: u64,
        endpoint: Endpoint,
        stream: BoxedStream,
        max_message_size: usize,
        large_message_limit: usize,
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        let now = Instant::now();
        Self {
            id,
            endpoint,
            reader: FrameReader::new(read, max_message_size),
            writer: FrameWriter::new(write, large_message_limit),
            created: now,
            last_used: now,
            idle_deadline: now,
            next_keep_alive: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub async fn send(&mut self, msg: &Message, timeout: Duration) -> Result<(), PoolError> {
        match tokio::time::timeout(timeout, self.writer.write_message(msg)).await {
            Ok(result) => result.map_err(PoolError::from),
            Err(_) => Err(PoolError::Timeout {
                op: "send",
                after: timeout,
            }),
        }
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<Message, PoolError> {
        match tokio::time::timeout(timeout, self.reader.read_message()).await {
            Ok(Ok(Some(msg))) => Ok(msg),
            Ok(Ok(None)) => Err(PoolError::Closed),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PoolError::Timeout {
                op: "receive",
                after: timeout,
            }),
        }
    }

    /// Send `msg` and wait for its reply, both within `timeout`.
    pub async fn request(&mut self, msg: &Message, timeout: Duration) -> Result<Message, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.send(msg, timeout).await?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let reply = self.receive(remaining).await?;
        if reply.keep_alive || !reply.reply {
            return Err(PoolError::Io(format!(
                "expected a reply from {}, got {:?} frame",
                self.endpoint,
                reply.kind()
            )));
        }
        Ok(reply)
    }

    /// Send `KRQ` and expect `KRS` within `timeout`.
    pub async fn keep_alive(&mut self, timeout: Duration) -> Result<(), PoolError> {
        let answer = self
            .request_keep_alive(timeout)
            .await
            .map_err(|e| PoolError::KeepAlive(format!("{} on {}", e, self.endpoint)))?;
        if !(answer.keep_alive && answer.reply) {
            return Err(PoolError::KeepAlive(format!(
                "unexpected {:?} frame from {}",
                answer.kind(),
                self.endpoint
            )));
        }
        Ok(())
    }

    async fn request_keep_alive(&mut self, timeout: Duration) -> Result<Message, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.send(&Message::keep_alive_request(), timeout).await?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.receive(remaining).await
    }

    /// Shut the write side down and drop the stream.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!(id = self.id, endpoint = %self.endpoint, error = %e, "close");
        }
    }
}
