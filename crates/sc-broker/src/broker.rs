// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker context.
//!
//! [`Broker`] owns every registry, the transport connector and the event
//! bus, and is handed to each connection task as an `Arc`. It also carries
//! the multi-registry operations: server registration and removal (with the
//! session/subscription cascade), backend exchanges, session expiry and the
//! reaction to pool keep-alive failures.

use crate::config::{BrokerConfig, ConfigError, ServiceKind};
use crate::error::{ErrorCode, Fault};
use crate::events::{BrokerEvent, EndReason, EventBus, RemovalReason};
use crate::pool::{ConnectionPool, PoolEvent, PoolSettings};
use crate::pubsub::{Subscription, SubscriptionRegistry, SubscriptionSnapshot};
use crate::registry::{
    Server, ServerKey, ServerRegistry, Service, ServiceRegistry, ServiceSnapshot, Session,
    SessionRegistry, SessionSnapshot,
};
use crate::transport::{Connector, Endpoint, TcpConnector};
use parking_lot::Mutex;
use scmp::{verify_echo, HeaderKey, Message, MessageType};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a backend declares in REGISTER_SERVICE.
#[derive(Debug, Clone)]
pub struct ServerRegistration {
    pub service: String,
    pub endpoint: Endpoint,
    pub max_sessions: usize,
    pub max_connections: Option<usize>,
    pub keep_alive_interval: Option<Duration>,
    pub kind: Option<ServiceKind>,
    pub mask_length: Option<usize>,
}

impl ServerRegistration {
    pub fn new(service: impl Into<String>, endpoint: Endpoint, max_sessions: usize) -> Self {
        Self {
            service: service.into(),
            endpoint,
            max_sessions,
            max_connections: None,
            keep_alive_interval: None,
            kind: None,
            mask_length: None,
        }
    }
}

/// Full INSPECT report.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerReport {
    pub name: String,
    pub uptime_secs: u64,
    pub services: Vec<ServiceSnapshot>,
    pub sessions: usize,
    pub subscriptions: usize,
    pub tombstones: usize,
}

/// INSPECT `SESSIONS` report.
#[derive(Debug, Clone, Serialize)]
pub struct SessionsReport {
    pub sessions: Vec<SessionSnapshot>,
    pub subscriptions: Vec<SubscriptionSnapshot>,
    pub tombstones: usize,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    services: ServiceRegistry,
    servers: ServerRegistry,
    sessions: SessionRegistry,
    subscriptions: SubscriptionRegistry,
    connector: Arc<dyn Connector>,
    events: EventBus,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    pool_events_rx: Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
    shutdown: Notify,
    stopping: AtomicBool,
    next_connection: AtomicU64,
    started: Instant,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.config.name)
            .field("services", &self.services.len())
            .field("servers", &self.servers.len())
            .field("sessions", &self.sessions.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl Broker {
    /// Build a broker from a validated configuration. Statically declared
    /// services are created right away.
    pub fn new(config: BrokerConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let services = ServiceRegistry::new();
        for service in &config.services {
            services.insert(Service::from_config(service));
        }
        let (pool_events, rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            sessions: SessionRegistry::new(config.tombstone_retention(), config.echo_grace_factor),
            events: EventBus::new(config.event_channel_capacity),
            config: Arc::new(config),
            services,
            servers: ServerRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            connector,
            pool_events,
            pool_events_rx: Mutex::new(Some(rx)),
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
            started: Instant::now(),
        }))
    }

    /// Broker reaching backends over TCP.
    pub fn tcp(config: BrokerConfig) -> Result<Arc<Self>, ConfigError> {
        Self::new(config, Arc::new(TcpConnector))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    fn pool_settings(&self, reg: &ServerRegistration) -> PoolSettings {
        let mut settings = PoolSettings::from_config(
            &self.config.pool,
            self.config.max_message_size,
            self.config.large_message_limit,
        );
        if let Some(max) = reg.max_connections {
            settings.max_connections = max;
        }
        if let Some(interval) = reg.keep_alive_interval {
            settings.keep_alive_interval = (!interval.is_zero()).then_some(interval);
        }
        settings
    }

    /// Echo interval for a new session: request, then service, then broker
    /// default.
    pub fn echo_interval_for(&self, service: &Service, requested: Option<Duration>) -> Duration {
        requested
            .or_else(|| service.echo_interval())
            .unwrap_or_else(|| self.config.echo_interval())
    }

    /// Add a backend server to its service, creating the service when
    /// dynamic services are enabled.
    pub fn register_server(&self, reg: ServerRegistration) -> Result<Arc<Server>, Fault> {
        let service = match self.services.get(&reg.service) {
            Some(service) => service,
            None if self.config.dynamic_services => {
                self.services.get_or_insert_with(&reg.service, || {
                    info!(service = %reg.service, "creating service on registration");
                    Service::new(reg.service.clone(), reg.kind.unwrap_or_default())
                })
            }
            None => return Err(Fault::not_found(format!("unknown service {:?}", reg.service))),
        };

        if let Some(kind) = reg.kind {
            if kind != service.kind() {
                return Err(Fault::new(
                    ErrorCode::ServiceTypeMismatch,
                    format!(
                        "service {:?} is a {} service, not {}",
                        service.name(),
                        service.kind().as_str(),
                        kind.as_str()
                    ),
                ));
            }
        }
        if let Some(length) = reg.mask_length {
            let effective = service.adopt_mask_length(length);
            if effective != length {
                return Err(Fault::new(
                    ErrorCode::InvalidAttribute,
                    format!(
                        "mask length {} differs from service mask length {}",
                        length, effective
                    ),
                ));
            }
        }

        let key = ServerKey::new(reg.service.clone(), reg.endpoint.clone());
        let pool = ConnectionPool::new(
            reg.endpoint.clone(),
            self.pool_settings(&reg),
            self.connector.clone(),
            Some(self.pool_events.clone()),
        );
        let server = Arc::new(Server::new(key, reg.max_sessions, pool));

        self.servers
            .insert_with(server.clone(), |s| service.add_server(s.clone()))
            .map_err(|existing| {
                Fault::new(
                    ErrorCode::AlreadyRegistered,
                    format!("server {} already registered", existing.key()),
                )
            })?;
        server.pool().start_maintenance();

        info!(server = %server.key(), max_sessions = reg.max_sessions, "server registered");
        self.events.emit(BrokerEvent::ServerRegistered {
            service: reg.service,
            endpoint: reg.endpoint,
        });
        Ok(server)
    }

    /// Remove a server: unlink it, close its pool, abort its sessions and
    /// drop its subscriptions (notifying the clients).
    pub async fn remove_server(&self, key: &ServerKey, reason: RemovalReason) -> Option<Arc<Server>> {
        let server = self.servers.remove(key)?;
        server.mark_removed();
        if let Some(service) = self.services.get(&key.service) {
            service.remove_server(&key.endpoint);
        }
        server.pool().close().await;

        let sessions = self.sessions.for_server(&server);
        for session in &sessions {
            self.end_session(session.id(), EndReason::ServerLost);
        }

        let subscriptions = self.subscriptions.for_server(&server);
        for subscription in &subscriptions {
            self.end_subscription(subscription, EndReason::ServerLost);
            subscription.push(subscription.abort_notice(EndReason::ServerLost, None));
        }

        match reason {
            RemovalReason::KeepAliveFailed => warn!(
                server = %key, sessions = sessions.len(), subscriptions = subscriptions.len(),
                "server removed after keep-alive failure"
            ),
            _ => info!(
                server = %key, ?reason, sessions = sessions.len(), subscriptions = subscriptions.len(),
                "server removed"
            ),
        }
        self.events.emit(BrokerEvent::ServerRemoved {
            service: key.service.clone(),
            endpoint: key.endpoint.clone(),
            reason,
        });
        Some(server)
    }

    /// One request/reply with a backend over its pool. A backend `EXC`
    /// reply becomes a fault; a reply that does not echo the message id is
    /// a sequencing fault and costs the connection.
    pub async fn exchange(&self, server: &Server, request: &Message) -> Result<Message, Fault> {
        if server.is_removed() {
            return Err(Fault::connection_lost(format!(
                "server {} is gone",
                server.key()
            )));
        }
        let mut conn = server.pool().borrow().await?;
        let timeout = server.pool().settings().operation_timeout;
        let reply = conn.request(request, timeout).await?;

        if let Some(sent) = request.message_id().and_then(|id| id.parse::<u64>().ok()) {
            if let Err(e) = verify_echo(sent, reply.message_id()) {
                warn!(server = %server.key(), error = %e, "backend reply out of sequence");
                conn.close().await;
                return Err(Fault::new(ErrorCode::StaleMessageId, e.to_string()));
            }
        }
        conn.release();

        if reply.fault {
            return Err(fault_from_reply(&reply));
        }
        Ok(reply)
    }

    /// Remove and destroy a session, emitting the lifecycle event.
    pub fn end_session(&self, id: &str, reason: EndReason) -> Option<Arc<Session>> {
        let session = self.sessions.remove(id, reason)?;
        debug!(session = %id, service = %session.service(), ?reason, "session destroyed");
        self.events.emit(BrokerEvent::SessionDestroyed {
            session_id: id.to_string(),
            service: session.service().to_string(),
            reason,
        });
        Some(session)
    }

    /// Abort a session: destroy it and tell its backend, best effort.
    pub async fn abort_session(&self, session: &Arc<Session>, reason: EndReason) {
        if self.end_session(session.id(), reason).is_none() {
            return;
        }

        let mut notice = Message::request(MessageType::SrvAbortSession)
            .with_header(HeaderKey::ServiceName, session.service())
            .with_header(HeaderKey::SessionId, session.id())
            .with_header(HeaderKey::ScErrorText, format!("{:?}", reason));
        notice.set_message_id(session.next_outbound_id());
        if let Err(fault) = self.exchange(session.server(), &notice).await {
            debug!(session = %session.id(), %fault, "abort notification not delivered");
        }
    }

    /// Unregister a subscription and emit the event. The caller decides
    /// who to notify.
    pub fn end_subscription(&self, subscription: &Subscription, reason: EndReason) -> bool {
        if self.subscriptions.remove(subscription.id()).is_none() {
            return false;
        }
        self.events.emit(BrokerEvent::SubscriptionRemoved {
            subscription_id: subscription.id().to_string(),
            service: subscription.service().to_string(),
            reason,
        });
        true
    }

    /// Tell the backend a subscription is gone, best effort.
    pub async fn notify_unsubscribe(&self, subscription: &Subscription) {
        let mut msg = Message::request(MessageType::SrvUnsubscribe)
            .with_header(HeaderKey::ServiceName, subscription.service())
            .with_header(HeaderKey::SessionId, subscription.id());
        msg.set_message_id(subscription.next_outbound_id());
        if let Err(fault) = self.exchange(subscription.server(), &msg).await {
            debug!(subscription = %subscription.id(), %fault, "unsubscribe notification not delivered");
        }
    }

    /// Client connection closed: its subscriptions go with it.
    pub async fn connection_closed(&self, connection: u64) {
        for subscription in self.subscriptions.for_connection(connection) {
            if self.end_subscription(&subscription, EndReason::Disconnected) {
                self.notify_unsubscribe(&subscription).await;
            }
        }
        self.events
            .emit(BrokerEvent::ConnectionClosed { connection });
    }

    /// Deliver a publication to the matching subscribers of `service`.
    pub fn publish(&self, service: &Service, topic: &str, body: &[u8]) -> usize {
        self.subscriptions
            .publish(service.name(), topic, service.wildcard(), body)
    }

    /// One reaper pass: abort expired sessions, forget old tombstones.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired = self.sessions.expired(now);
        for session in &expired {
            info!(session = %session.id(), service = %session.service(), "session expired");
            self.abort_session(session, EndReason::Expired).await;
        }
        let purged = self.sessions.purge_tombstones(now);
        if purged > 0 {
            debug!(purged, "tombstones purged");
        }
        expired.len()
    }

    pub async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::KeepAliveFailed {
                pool_id,
                endpoint,
                reason,
            } => {
                let Some(server) = self.servers.find_by_pool(pool_id) else {
                    debug!(%endpoint, "keep-alive failure for a server already removed");
                    return;
                };
                warn!(server = %server.key(), %reason, "keep-alive failed, removing server");
                self.remove_server(server.key(), RemovalReason::KeepAliveFailed)
                    .await;
            }
            PoolEvent::IdleEvicted { pool_id, connection } => {
                debug!(pool_id, connection, "idle connection evicted");
            }
        }
    }

    /// Spawn the session reaper and the pool event supervisor.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(2);

        let broker = self.clone();
        let interval = self.config.reaper_interval();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        broker.reap_expired().await;
                    }
                    _ = broker.wait_shutdown() => {
                        debug!("session reaper shutting down");
                        break;
                    }
                }
            }
        }));

        if let Some(mut rx) = self.pool_events_rx.lock().take() {
            let broker = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => broker.handle_pool_event(event).await,
                            None => break,
                        },
                        _ = broker.wait_shutdown() => {
                            debug!("pool supervisor shutting down");
                            break;
                        }
                    }
                }
            }));
        }
        tasks
    }

    /// Ask every task to stop.
    pub fn shutdown(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            info!("broker shutdown requested");
            self.events.emit(BrokerEvent::ShutdownRequested);
        }
        self.shutdown.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Resolves once [`Broker::shutdown`] has been called.
    pub async fn wait_shutdown(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Remove every server (closing all pools).
    pub async fn close(&self) {
        for server in self.servers.all() {
            self.remove_server(server.key(), RemovalReason::Shutdown)
                .await;
        }
    }

    pub fn report(&self) -> BrokerReport {
        BrokerReport {
            name: self.config.name.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            services: self.services.all().iter().map(|s| s.snapshot()).collect(),
            sessions: self.sessions.len(),
            subscriptions: self.subscriptions.len(),
            tombstones: self.sessions.tombstone_count(),
        }
    }

    pub fn service_report(&self, name: &str) -> Result<ServiceSnapshot, Fault> {
        Ok(self.services.lookup(name)?.snapshot())
    }

    pub fn sessions_report(&self) -> SessionsReport {
        SessionsReport {
            sessions: self.sessions.snapshot(),
            subscriptions: self.subscriptions.snapshot(),
            tombstones: self.sessions.tombstone_count(),
        }
    }
}

/// Fault carried by a backend `EXC` reply.
pub fn fault_from_reply(reply: &Message) -> Fault {
    let code = reply
        .header
        .get(HeaderKey::ScErrorCode)
        .and_then(|c| c.parse::<u16>().ok())
        .and_then(ErrorCode::from_code)
        .unwrap_or(ErrorCode::ServerError);
    let text = reply
        .header
        .get(HeaderKey::ScErrorText)
        .unwrap_or("backend fault");
    Fault::new(code, text)
}
