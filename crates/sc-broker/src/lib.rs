// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service Connector broker
//!
//! Mediates between front-end clients and pools of back-end servers over
//! SCMP. Clients attach and open sessions on services; the broker allocates
//! each session onto a registered server (round robin, bounded by the
//! server's session limit) and forwards the session's traffic over a pooled,
//! health-checked connection to that server. Publish services fan out
//! backend publications to every client subscription whose mask matches.
//!
//! # Features
//!
//! - **Sessions**: atomic allocation, echo-based expiry, cleanup on server loss
//! - **Connection Pools**: bounded per server, idle eviction, keep-alive probes
//! - **Pub/Sub**: fixed-length positional masks with a wildcard character
//! - **Management**: enable/disable services, JSON inspection, remote stop
//!
//! # Quick Start
//!
//! ```bash
//! sc-broker --port 9000
//! sc-broker --config broker.toml
//! sc-broker gen-config --output broker.toml
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! name = "sc-broker"
//! port = 9000
//! echo_interval_secs = 60
//!
//! [pool]
//! max_connections = 10
//! idle_timeout_ms = 60000
//! keep_alive_interval_ms = 30000
//!
//! [[services]]
//! name = "billing"
//! kind = "session"
//!
//! [[services]]
//! name = "quotes"
//! kind = "publish"
//! mask_length = 10
//! wildcard = "-"
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod pool;
pub mod pubsub;
pub mod registry;
pub mod server;
pub mod transport;

pub use broker::{Broker, BrokerReport, ServerRegistration, SessionsReport};
pub use config::{BrokerConfig, ConfigError, PoolConfig, ServiceConfig, ServiceKind};
pub use dispatch::{fault_reply, Command, ConnectionContext, Dispatcher, Sequencing};
pub use error::{BrokerError, ErrorCode, Fault, FaultFamily};
pub use events::{BrokerEvent, EndReason, EventBus, RemovalReason};
pub use pool::{ConnectionPool, PoolError, PoolEvent, PoolSettings, PoolStats, PooledConnection};
pub use pubsub::{mask_matches, Subscription, SubscriptionRegistry};
pub use server::{serve_connection, BrokerServer};
pub use transport::{Connector, Endpoint, MemoryConnector, MemoryListener, TcpConnector};
