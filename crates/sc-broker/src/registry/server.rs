// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend servers and their session slots.

use crate::pool::{ConnectionPool, PoolStats};
use crate::transport::Endpoint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Server identity: owning service plus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub service: String,
    pub endpoint: Endpoint,
}

impl ServerKey {
    pub fn new(service: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            service: service.into(),
            endpoint,
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.endpoint)
    }
}

/// A registered backend server.
#[derive(Debug)]
pub struct Server {
    key: ServerKey,
    max_sessions: usize,
    sessions: AtomicUsize,
    pool: ConnectionPool,
    removed: AtomicBool,
}

impl Server {
    pub fn new(key: ServerKey, max_sessions: usize, pool: ConnectionPool) -> Self {
        Self {
            key,
            max_sessions,
            sessions: AtomicUsize::new(0),
            pool,
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    pub fn service(&self) -> &str {
        &self.key.service
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.key.endpoint
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Live leases (sessions and subscriptions) on this server.
    pub fn current_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_sessions() < self.max_sessions
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Set once the server left its service.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    /// Take one session slot if below `max_sessions`.
    pub fn try_reserve(self: &Arc<Self>) -> Option<ServerLease> {
        if self.is_removed() {
            return None;
        }
        self.sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .ok()
            .map(|_| ServerLease {
                server: Arc::clone(self),
            })
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            endpoint: self.key.endpoint.to_string(),
            current_sessions: self.current_sessions(),
            max_sessions: self.max_sessions,
            pool: self.pool.stats(),
        }
    }
}

/// One occupied session slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ServerLease {
    server: Arc<Server>,
}

impl ServerLease {
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        self.server.sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub endpoint: String,
    pub current_sessions: usize,
    pub max_sessions: usize,
    pub pool: PoolStats,
}

/// All registered servers keyed by (service, endpoint).
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: DashMap<ServerKey, Arc<Server>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the key is taken; `on_insert` runs while the slot is
    /// held so the caller can link the server elsewhere atomically.
    pub fn insert_with(
        &self,
        server: Arc<Server>,
        on_insert: impl FnOnce(&Arc<Server>),
    ) -> Result<(), Arc<Server>> {
        match self.servers.entry(server.key().clone()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                on_insert(&server);
                slot.insert(server);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &ServerKey) -> Option<Arc<Server>> {
        self.servers.get(key).map(|s| s.value().clone())
    }

    pub fn remove(&self, key: &ServerKey) -> Option<Arc<Server>> {
        self.servers.remove(key).map(|(_, s)| s)
    }

    pub fn find_by_pool(&self, pool_id: u64) -> Option<Arc<Server>> {
        self.servers
            .iter()
            .find(|s| s.pool().id() == pool_id)
            .map(|s| s.value().clone())
    }

    pub fn for_service(&self, service: &str) -> Vec<Arc<Server>> {
        let mut servers: Vec<Arc<Server>> = self
            .servers
            .iter()
            .filter(|s| s.service() == service)
            .map(|s| s.value().clone())
            .collect();
        servers.sort_by(|a, b| a.key().cmp(b.key()));
        servers
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        self.servers.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::server;

    #[test]
    fn test_reserve_respects_max_and_lease_drop_frees() {
        let s = server("svc", 1, 2);
        let a = s.try_reserve().unwrap();
        let _b = s.try_reserve().unwrap();
        assert!(s.try_reserve().is_none());
        assert_eq!(s.current_sessions(), 2);

        drop(a);
        assert_eq!(s.current_sessions(), 1);
        assert!(s.try_reserve().is_some());
    }

    #[test]
    fn test_removed_server_refuses_leases() {
        let s = server("svc", 1, 2);
        assert!(s.mark_removed());
        assert!(!s.mark_removed());
        assert!(s.try_reserve().is_none());
    }

    #[test]
    fn test_concurrent_reserve_never_exceeds_max() {
        let s = server("svc", 1, 8);
        let leases = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..4 {
                        if let Some(lease) = s.try_reserve() {
                            assert!(s.current_sessions() <= 8);
                            leases.lock().unwrap().push(lease);
                        }
                    }
                });
            }
        });
        assert_eq!(leases.lock().unwrap().len(), 8);
        assert_eq!(s.current_sessions(), 8);
    }

    #[test]
    fn test_registry_rejects_duplicate_key() {
        let reg = ServerRegistry::new();
        let s = server("svc", 1, 1);
        let mut linked = 0;
        assert!(reg.insert_with(s.clone(), |_| linked += 1).is_ok());
        assert!(reg.insert_with(server("svc", 1, 1), |_| linked += 1).is_err());
        assert_eq!(linked, 1);
        assert_eq!(reg.find_by_pool(s.pool().id()).unwrap().key(), s.key());
        assert_eq!(reg.for_service("svc").len(), 1);
        assert!(reg.remove(s.key()).is_some());
        assert!(reg.is_empty());
    }
}
