// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport capability.
//!
//! The broker only needs an async byte stream per backend connection. A
//! [`Connector`] opens one for an [`Endpoint`]; everything above it (framing,
//! pooling, keep-alive) is protocol-independent.
//!
//! - [`TcpConnector`] - plain TCP
//! - [`MemoryConnector`] - in-process pipes, for tests and embedding

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

/// Any bidirectional async byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Backend address: host (name or IP literal) and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Opens byte streams to backend endpoints.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>> {
        async move {
            let stream =
                tokio::net::TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

/// In-process connector. Endpoints are claimed with [`MemoryConnector::listen`];
/// connecting to an unclaimed endpoint fails with `ConnectionRefused`.
#[derive(Debug)]
pub struct MemoryConnector {
    listeners: DashMap<Endpoint, mpsc::UnboundedSender<DuplexStream>>,
    buffer: usize,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_PIPE_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            listeners: DashMap::new(),
            buffer,
        }
    }

    /// Claim `endpoint`. A previous listener on it is replaced.
    pub fn listen(&self, endpoint: Endpoint) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(endpoint.clone(), tx);
        MemoryListener { endpoint, rx }
    }

    /// Release `endpoint`; later connects are refused.
    pub fn unlisten(&self, endpoint: &Endpoint) {
        self.listeners.remove(endpoint);
    }

    fn open(&self, endpoint: &Endpoint) -> io::Result<DuplexStream> {
        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {}", endpoint),
            )
        };
        let tx = self.listeners.get(endpoint).ok_or_else(refused)?;
        let (local, remote) = tokio::io::duplex(self.buffer);
        tx.send(remote).map_err(|_| refused())?;
        Ok(local)
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>> {
        let result = self
            .open(endpoint)
            .map(|stream| Box::new(stream) as BoxedStream);
        futures::future::ready(result).boxed()
    }
}

/// Accept side of a [`MemoryConnector`] endpoint.
#[derive(Debug)]
pub struct MemoryListener {
    endpoint: Endpoint,
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryListener {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next inbound pipe, `None` once the connector is gone or the endpoint
    /// was released.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}
