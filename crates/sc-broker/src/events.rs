// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker event stream.
//!
//! Connection, fault and lifecycle notifications are published on a
//! broadcast channel. Nobody has to listen: with no receivers the event is
//! dropped.

use crate::error::ErrorCode;
use crate::transport::Endpoint;
use tokio::sync::broadcast;

/// Why a session or subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// Client asked for it.
    Deleted,
    /// Backend refused the session/subscription.
    Rejected,
    /// Creation failed after allocation.
    Failed,
    /// No client activity within the echo deadline.
    Expired,
    /// Owning server deregistered or failed its keep-alive.
    ServerLost,
    /// Backend aborted it.
    AbortedByServer,
    /// Client connection closed.
    Disconnected,
}

impl EndReason {
    /// Reasons after which the id answers CONNECTION_LOST for a while.
    pub fn is_abort(self) -> bool {
        matches!(self, EndReason::Expired | EndReason::ServerLost)
    }
}

/// Why a server left its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    Deregistered,
    KeepAliveFailed,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ConnectionOpened {
        connection: u64,
        peer: Option<String>,
    },
    ConnectionClosed {
        connection: u64,
    },
    ServerRegistered {
        service: String,
        endpoint: Endpoint,
    },
    ServerRemoved {
        service: String,
        endpoint: Endpoint,
        reason: RemovalReason,
    },
    ServiceStateChanged {
        service: String,
        enabled: bool,
    },
    SessionCreated {
        session_id: String,
        service: String,
        endpoint: Endpoint,
    },
    SessionDestroyed {
        session_id: String,
        service: String,
        reason: EndReason,
    },
    SubscriptionCreated {
        subscription_id: String,
        service: String,
        mask: String,
    },
    SubscriptionRemoved {
        subscription_id: String,
        service: String,
        reason: EndReason,
    },
    Fault {
        connection: u64,
        msg_type: Option<String>,
        code: ErrorCode,
        text: String,
    },
    ShutdownRequested,
}

/// Sender side of the event stream, cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        tracing::trace!(target: "sc_broker::events", ?event, "event");
        // Err only means there is no receiver right now.
        let _ = self.tx.send(event);
    }
}
