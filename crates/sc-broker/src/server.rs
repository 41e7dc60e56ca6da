// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP listener and per-connection handling.

use crate::broker::Broker;
use crate::dispatch::{ConnectionContext, Dispatcher};
use crate::error::BrokerError;
use crate::events::BrokerEvent;
use scmp::{FrameDecoderError, FrameReader, FrameWriter, Message};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long a closing connection waits for its queued replies to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Accepts client and backend connections and serves them until the broker
/// shuts down.
#[derive(Debug)]
pub struct BrokerServer {
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    running: AtomicBool,
}

impl BrokerServer {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self::with_dispatcher(broker, Dispatcher::new())
    }

    pub fn with_dispatcher(broker: Arc<Broker>, dispatcher: Dispatcher) -> Self {
        Self {
            broker,
            dispatcher: Arc::new(dispatcher),
            running: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Bind the configured address and serve.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let addr = self.broker.config().listen_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve an already bound listener. Returns after shutdown, once every
    /// server has been removed.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyRunning);
        }

        let background = self.broker.start();
        info!(
            name = %self.broker.config().name,
            addr = %listener.local_addr()?,
            "broker listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "cannot set TCP_NODELAY");
                        }
                        let broker = self.broker.clone();
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(broker, dispatcher, stream, Some(peer)).await {
                                warn!(%peer, error = %e, "connection reset");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                _ = self.broker.wait_shutdown() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.broker.close().await;
        for task in background {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Serve one connection: requests go through the dispatcher one at a time,
/// keep-alive probes are answered directly, and replies and pushes share one
/// writer task. A frame that cannot be decoded ends the connection without a
/// reply.
pub async fn serve_connection<S>(
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    stream: S,
    peer: Option<SocketAddr>,
) -> Result<(), FrameDecoderError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = broker.config();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half, config.max_message_size);
    let (tx, mut rx) = mpsc::channel::<Message>(config.push_channel_capacity);

    let limit = config.large_message_limit;
    let mut writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half, limit);
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.write_message(&msg).await {
                debug!(error = %e, "write failed, dropping connection output");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let ctx = ConnectionContext::new(broker.clone(), peer, tx.clone());
    let connection = ctx.id();
    broker.events().emit(BrokerEvent::ConnectionOpened {
        connection,
        peer: peer.map(|p| p.to_string()),
    });

    let result = loop {
        tokio::select! {
            read = reader.read_message() => match read {
                Ok(Some(msg)) if msg.keep_alive => {
                    if !msg.reply && tx.send(Message::keep_alive_response()).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(Some(msg)) if msg.reply => {
                    debug!(connection, "ignoring reply frame from peer");
                }
                Ok(Some(msg)) => {
                    let reply = dispatcher.dispatch(&ctx, &msg).await;
                    if tx.send(reply).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    debug!(connection, "connection closed by peer");
                    break Ok(());
                }
                Err(e) => break Err(e),
            },
            _ = broker.wait_shutdown() => {
                debug!(connection, "connection handler shutting down");
                break Ok(());
            }
        }
    };

    broker.connection_closed(connection).await;
    drop(ctx);
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    result
}
