// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe registry.
//!
//! A subscription binds a client connection (through its outbound queue) to
//! a fixed-length mask on a publish service. Publications are matched
//! position by position; the service's wildcard character matches anything
//! at its position, on either side.

use crate::error::{ErrorCode, Fault};
use crate::events::EndReason;
use crate::registry::{Server, ServerLease};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use scmp::{HeaderKey, Message, MessageSequencer, MessageType};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Positional mask match. Lengths (in characters) must be equal.
pub fn mask_matches(mask: &str, topic: &str, wildcard: char) -> bool {
    mask.chars().count() == topic.chars().count()
        && mask
            .chars()
            .zip(topic.chars())
            .all(|(m, t)| m == t || m == wildcard || t == wildcard)
}

/// Check a subscription mask against the service's fixed length.
pub fn validate_mask(mask: &str, expected_len: Option<usize>) -> Result<(), Fault> {
    let len = mask.chars().count();
    if len == 0 {
        return Err(Fault::invalid(HeaderKey::Mask, mask));
    }
    match expected_len {
        Some(expected) if expected != len => Err(Fault::new(
            ErrorCode::InvalidAttribute,
            format!("mask length {} differs from service mask length {}", len, expected),
        )),
        _ => Ok(()),
    }
}

/// A client's interest in one publish service.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    service: String,
    server: Arc<Server>,
    connection: u64,
    session_info: Option<String>,
    mask: RwLock<String>,
    push: mpsc::Sender<Message>,
    lease: Mutex<Option<ServerLease>>,
    inbound: Mutex<MessageSequencer>,
    outbound: Mutex<MessageSequencer>,
    delivered: AtomicU64,
}

impl Subscription {
    /// New subscription holding `lease` on its server. The id doubles as the
    /// `sessionId` the client uses afterwards.
    pub fn new(
        lease: ServerLease,
        mask: String,
        session_info: Option<String>,
        connection: u64,
        push: mpsc::Sender<Message>,
    ) -> Self {
        let server = lease.server().clone();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: server.service().to_string(),
            server,
            connection,
            session_info,
            mask: RwLock::new(mask),
            push,
            lease: Mutex::new(Some(lease)),
            inbound: Mutex::new(MessageSequencer::new()),
            outbound: Mutex::new(MessageSequencer::new()),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn session_info(&self) -> Option<&str> {
        self.session_info.as_deref()
    }

    pub fn mask(&self) -> String {
        self.mask.read().clone()
    }

    /// Replace the mask in place.
    pub fn set_mask(&self, mask: String) {
        *self.mask.write() = mask;
    }

    pub fn matches(&self, topic: &str, wildcard: char) -> bool {
        mask_matches(&self.mask.read(), topic, wildcard)
    }

    pub fn accept_message_id(&self, raw: Option<&str>) -> Result<u64, Fault> {
        Ok(self.inbound.lock().accept(raw)?)
    }

    pub fn next_outbound_id(&self) -> u64 {
        self.outbound.lock().next_id()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Release the server slot.
    fn release(&self) {
        self.lease.lock().take();
    }

    /// Queue a message for the client without waiting. Returns false when
    /// the client is gone or its queue is full.
    pub fn push(&self, msg: Message) -> bool {
        match self.push.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscription = %self.id, "client queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscription = %self.id, "client connection gone");
                false
            }
        }
    }

    /// `PUBLISH` push for this subscriber.
    fn publication(&self, topic: &str, body: &[u8]) -> Message {
        let mut msg = Message::request(MessageType::Publish)
            .with_header(HeaderKey::ServiceName, self.service.as_str())
            .with_header(HeaderKey::SessionId, self.id.as_str())
            .with_header(HeaderKey::Mask, topic)
            .with_body(body.to_vec());
        msg.set_message_id(self.next_outbound_id());
        msg
    }

    /// `SRV_UNSUBSCRIBE` push telling the client the subscription is gone.
    pub fn abort_notice(&self, reason: EndReason, app_error: Option<(&str, &str)>) -> Message {
        let mut msg = Message::request(MessageType::SrvUnsubscribe)
            .with_header(HeaderKey::ServiceName, self.service.as_str())
            .with_header(HeaderKey::SessionId, self.id.as_str())
            .with_header(HeaderKey::ScErrorText, format!("{:?}", reason));
        if let Some((code, text)) = app_error {
            msg.header.set(HeaderKey::AppErrorCode, code);
            msg.header.set(HeaderKey::AppErrorText, text);
        }
        msg.set_message_id(self.next_outbound_id());
        msg
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.id.clone(),
            service: self.service.clone(),
            server: self.server.endpoint().to_string(),
            mask: self.mask(),
            delivered: self.delivered(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub service: String,
    pub server: String,
    pub mask: String,
    pub delivered: u64,
}

/// subscription id -> subscription.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        self.subscriptions
            .insert(subscription.id().to_string(), subscription.clone());
        subscription
    }

    pub fn get(&self, id: &str) -> Result<Arc<Subscription>, Fault> {
        self.subscriptions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Fault::not_found(format!("unknown subscription {:?}", id)))
    }

    /// Remove and free the server slot.
    pub fn remove(&self, id: &str) -> Option<Arc<Subscription>> {
        let (_, subscription) = self.subscriptions.remove(id)?;
        subscription.release();
        Some(subscription)
    }

    fn collect(&self, keep: impl Fn(&Subscription) -> bool) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .filter(|s| keep(s.value()))
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn for_connection(&self, connection: u64) -> Vec<Arc<Subscription>> {
        self.collect(|s| s.connection() == connection)
    }

    pub fn for_server(&self, server: &Server) -> Vec<Arc<Subscription>> {
        self.collect(|s| s.server().key() == server.key())
    }

    pub fn matching(&self, service: &str, topic: &str, wildcard: char) -> Vec<Arc<Subscription>> {
        self.collect(|s| s.service() == service && s.matches(topic, wildcard))
    }

    /// Deliver `body` to every subscription of `service` whose mask matches
    /// `topic`. Returns how many were queued.
    pub fn publish(&self, service: &str, topic: &str, wildcard: char, body: &[u8]) -> usize {
        let mut delivered = 0;
        for subscription in self.matching(service, topic, wildcard) {
            if subscription.push(subscription.publication(topic, body)) {
                subscription.delivered.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
            }
        }
        debug!(service, topic, delivered, "published");
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionSnapshot> {
        let mut all: Vec<SubscriptionSnapshot> =
            self.subscriptions.iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
