// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client sessions.
//!
//! ```text
//! CREATED --activate--> ACTIVE --begin_delete--> DELETING --destroy--> DESTROYED
//!    |                    |                                               ^
//!    +--------------------+------------------- abort ---------------------+
//! ```
//!
//! A session owns a [`ServerLease`]; destroying the session drops the lease,
//! which frees the server slot. Ids of aborted sessions are kept as
//! tombstones for a while so late commands get CONNECTION_LOST rather than
//! NOT_FOUND.

use super::server::{Server, ServerLease};
use super::service::Service;
use crate::error::{ErrorCode, Fault};
use crate::events::EndReason;
use dashmap::DashMap;
use parking_lot::Mutex;
use scmp::MessageSequencer;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Created,
    Active,
    Deleting,
    Destroyed,
}

/// A client session bound to one server.
#[derive(Debug)]
pub struct Session {
    id: String,
    service: String,
    server: Arc<Server>,
    echo_interval: Duration,
    expiry: Duration,
    session_info: Option<String>,
    state: Mutex<SessionState>,
    lease: Mutex<Option<ServerLease>>,
    inbound: Mutex<MessageSequencer>,
    outbound: Mutex<MessageSequencer>,
    last_activity: Mutex<Instant>,
}

impl Session {
    fn new(
        id: String,
        lease: ServerLease,
        echo_interval: Duration,
        grace_factor: u32,
        session_info: Option<String>,
    ) -> Self {
        let server = lease.server().clone();
        Self {
            id,
            service: server.service().to_string(),
            server,
            echo_interval,
            expiry: echo_interval.saturating_mul(grace_factor.max(1)),
            session_info,
            state: Mutex::new(SessionState::Created),
            lease: Mutex::new(Some(lease)),
            inbound: Mutex::new(MessageSequencer::new()),
            outbound: Mutex::new(MessageSequencer::new()),
            last_activity: Mutex::new(Instant::now()),
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

    pub fn echo_interval(&self) -> Duration {
        self.echo_interval
    }

    pub fn session_info(&self) -> Option<&str> {
        self.session_info.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// CREATED -> ACTIVE, once the backend accepted the session.
    pub fn activate(&self) -> Result<(), Fault> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Created => {
                *state = SessionState::Active;
                Ok(())
            }
            other => Err(self.wrong_state(other)),
        }
    }

    /// ACTIVE -> DELETING.
    pub fn begin_delete(&self) -> Result<(), Fault> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Active => {
                *state = SessionState::Deleting;
                Ok(())
            }
            other => Err(self.wrong_state(other)),
        }
    }

    /// Commands other than create/delete need an ACTIVE session.
    pub fn ensure_active(&self) -> Result<(), Fault> {
        match self.state() {
            SessionState::Active => Ok(()),
            other => Err(self.wrong_state(other)),
        }
    }

    fn wrong_state(&self, state: SessionState) -> Fault {
        match state {
            SessionState::Destroyed => {
                Fault::connection_lost(format!("session {} is destroyed", self.id))
            }
            _ => Fault::new(
                ErrorCode::NotConnected,
                format!("session {} is {:?}", self.id, state),
            ),
        }
    }

    /// Any state -> DESTROYED. Frees the server slot. Returns false if the
    /// session was already destroyed.
    pub fn destroy(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Destroyed {
                return false;
            }
            *state = SessionState::Destroyed;
        }
        self.lease.lock().take();
        true
    }

    /// Check an inbound `messageId` against this session's sequence.
    pub fn accept_message_id(&self, raw: Option<&str>) -> Result<u64, Fault> {
        Ok(self.inbound.lock().accept(raw)?)
    }

    /// Id for the next message sent to the backend.
    pub fn next_outbound_id(&self) -> u64 {
        self.outbound.lock().next_id()
    }

    /// Record client activity (resets the echo deadline).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_activity.lock()) > self.expiry
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            service: self.service.clone(),
            server: self.server.endpoint().to_string(),
            state: self.state(),
            echo_interval_ms: self.echo_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub service: String,
    pub server: String,
    pub state: SessionState,
    pub echo_interval_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    reason: EndReason,
    at: Instant,
}

/// session id -> session, plus tombstones of aborted sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    tombstones: DashMap<String, Tombstone>,
    retention: Duration,
    grace_factor: u32,
}

impl SessionRegistry {
    pub fn new(retention: Duration, grace_factor: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            tombstones: DashMap::new(),
            retention,
            grace_factor,
        }
    }

    /// Allocate a server of `service` and build the session on it. The slot
    /// is taken atomically by the allocation; the session starts CREATED.
    pub fn create(
        &self,
        service: &Service,
        echo_interval: Duration,
        session_info: Option<String>,
    ) -> Result<Arc<Session>, Fault> {
        let lease = service.allocate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(
            id.clone(),
            lease,
            echo_interval,
            self.grace_factor,
            session_info,
        ));
        self.sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Live session, CONNECTION_LOST for a tombstoned id, NOT_FOUND otherwise.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, Fault> {
        if let Some(session) = self.sessions.get(id) {
            return Ok(session.value().clone());
        }
        match self.tombstones.get(id) {
            Some(t) => Err(Fault::connection_lost(format!(
                "session {} was aborted ({:?})",
                id,
                t.reason
            ))),
            None => Err(Fault::not_found(format!("unknown session {:?}", id))),
        }
    }

    /// Remove and destroy. Aborts leave a tombstone.
    pub fn remove(&self, id: &str, reason: EndReason) -> Option<Arc<Session>> {
        // Tombstone first, so a concurrent `get` sees the session or its tombstone.
        if reason.is_abort() && self.sessions.contains_key(id) {
            self.tombstones.insert(
                id.to_string(),
                Tombstone {
                    reason,
                    at: Instant::now(),
                },
            );
        }
        let (_, session) = self.sessions.remove(id)?;
        session.destroy();
        Some(session)
    }

    /// Forget a tombstone. Returns whether there was one.
    pub fn clear_tombstone(&self, id: &str) -> bool {
        self.tombstones.remove(id).is_some()
    }

    pub fn for_server(&self, server: &Server) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| s.server().key() == server.key())
            .map(|s| s.value().clone())
            .collect()
    }

    /// Sessions past their echo deadline. A session still CREATED that long
    /// was never accepted and counts too.
    pub fn expired(&self, now: Instant) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| {
                matches!(s.state(), SessionState::Created | SessionState::Active)
                    && s.is_expired(now)
            })
            .map(|s| s.value().clone())
            .collect()
    }

    /// Drop tombstones older than the retention period.
    pub fn purge_tombstones(&self, now: Instant) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| now.saturating_duration_since(t.at) < self.retention);
        before - self.tombstones.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self.sessions.iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceKind;
    use crate::registry::test_support::server;

    fn setup(max: usize) -> (Service, SessionRegistry) {
        let service = Service::new("svc", ServiceKind::Session);
        service.add_server(server("svc", 1, max));
        (service, SessionRegistry::new(Duration::from_secs(60), 2))
    }

    #[test]
    fn test_create_and_delete_track_server_count() {
        let (service, reg) = setup(1);
        let session = reg.create(&service, Duration::from_secs(10), None).unwrap();
        let server = session.server().clone();
        assert_eq!(server.current_sessions(), 1);
        assert_eq!(session.state(), SessionState::Created);

        assert_eq!(
            reg.create(&service, Duration::from_secs(10), None)
                .unwrap_err()
                .code,
            ErrorCode::NotFound
        );

        reg.remove(session.id(), EndReason::Deleted).unwrap();
        assert_eq!(server.current_sessions(), 0);
        assert_eq!(session.state(), SessionState::Destroyed);
        assert_eq!(reg.get(session.id()).unwrap_err().code, ErrorCode::NotFound);
        assert!(reg.create(&service, Duration::from_secs(10), None).is_ok());
    }

    #[test]
    fn test_state_machine() {
        let (service, reg) = setup(1);
        let s = reg.create(&service, Duration::from_secs(10), None).unwrap();
        assert!(s.ensure_active().is_err());
        assert!(s.begin_delete().is_err());
        s.activate().unwrap();
        assert!(s.activate().is_err());
        s.ensure_active().unwrap();
        s.begin_delete().unwrap();
        assert_eq!(s.state(), SessionState::Deleting);
        assert!(s.destroy());
        assert!(!s.destroy());
        assert_eq!(s.ensure_active().unwrap_err().code, ErrorCode::ConnectionLost);
    }

    #[test]
    fn test_abort_leaves_tombstone() {
        let (service, reg) = setup(2);
        let s = reg.create(&service, Duration::from_secs(10), None).unwrap();
        reg.remove(s.id(), EndReason::ServerLost);
        assert_eq!(
            reg.get(s.id()).unwrap_err().code,
            ErrorCode::ConnectionLost
        );
        assert_eq!(reg.purge_tombstones(Instant::now()), 0);
        assert_eq!(
            reg.purge_tombstones(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert_eq!(reg.get(s.id()).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_expiry_uses_grace_factor() {
        let (service, reg) = setup(1);
        let s = reg.create(&service, Duration::from_secs(1), None).unwrap();
        s.activate().unwrap();
        let now = Instant::now();
        assert!(reg.expired(now + Duration::from_millis(1500)).is_empty());
        assert_eq!(reg.expired(now + Duration::from_millis(2500)).len(), 1);
        s.touch();
        assert!(reg.expired(Instant::now()).is_empty());
    }

    #[test]
    fn test_unaccepted_session_expires() {
        let (service, reg) = setup(1);
        let s = reg.create(&service, Duration::from_secs(1), None).unwrap();
        assert_eq!(s.state(), SessionState::Created);
        let now = Instant::now();
        assert!(reg.expired(now).is_empty());
        assert_eq!(reg.expired(now + Duration::from_millis(2500)).len(), 1);
    }

    #[test]
    fn test_abort_of_unknown_id_leaves_no_tombstone() {
        let (_service, reg) = setup(1);
        assert!(reg.remove("ghost", EndReason::ServerLost).is_none());
        assert_eq!(reg.tombstone_count(), 0);
    }

    #[test]
    fn test_message_ids() {
        let (service, reg) = setup(1);
        let s = reg.create(&service, Duration::from_secs(1), None).unwrap();
        assert_eq!(s.accept_message_id(Some("1")), Ok(1));
        assert_eq!(s.accept_message_id(None), Ok(2));
        assert_eq!(
            s.accept_message_id(Some("2")).unwrap_err().code,
            ErrorCode::StaleMessageId
        );
        assert_eq!(s.next_outbound_id(), 1);
        assert_eq!(s.next_outbound_id(), 2);
    }
}
