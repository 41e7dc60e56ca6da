// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Services and round-robin server allocation.

use super::server::{Server, ServerLease, ServerSnapshot};
use crate::config::{ServiceConfig, ServiceKind};
use crate::error::{ErrorCode, Fault};
use crate::transport::Endpoint;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct ServiceState {
    servers: Vec<Arc<Server>>,
    cursor: usize,
    enabled: bool,
    mask_length: Option<usize>,
}

/// A named service and the servers registered behind it.
#[derive(Debug)]
pub struct Service {
    name: String,
    kind: ServiceKind,
    wildcard: char,
    echo_interval: Option<Duration>,
    state: Mutex<ServiceState>,
}

impl Service {
    pub fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
        Self::from_config(&ServiceConfig {
            name: name.into(),
            kind,
            ..ServiceConfig::session("")
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            wildcard: config.wildcard,
            echo_interval: config.echo_interval(),
            state: Mutex::new(ServiceState {
                servers: Vec::new(),
                cursor: 0,
                enabled: config.enabled,
                mask_length: config.mask_length,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn wildcard(&self) -> char {
        self.wildcard
    }

    pub fn echo_interval(&self) -> Option<Duration> {
        self.echo_interval
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Returns the previous state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        std::mem::replace(&mut self.state.lock().enabled, enabled)
    }

    pub fn mask_length(&self) -> Option<usize> {
        self.state.lock().mask_length
    }

    /// Fix the mask length if none is set yet. Returns the effective length.
    pub fn adopt_mask_length(&self, length: usize) -> usize {
        *self.state.lock().mask_length.get_or_insert(length)
    }

    /// Pick the next server with a free slot, starting at the round-robin
    /// cursor, and take the slot. Both happen under the service lock.
    pub fn allocate(&self) -> Result<ServerLease, Fault> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(Fault::new(
                ErrorCode::ServiceDisabled,
                format!("service {:?} is disabled", self.name),
            ));
        }
        let n = state.servers.len();
        if n == 0 {
            return Err(Fault::not_found(format!(
                "no server registered for service {:?}",
                self.name
            )));
        }
        for step in 0..n {
            let idx = (state.cursor + step) % n;
            if let Some(lease) = state.servers[idx].try_reserve() {
                state.cursor = (idx + 1) % n;
                return Ok(lease);
            }
        }
        Err(Fault::not_found(format!(
            "no free server for service {:?}",
            self.name
        )))
    }

    pub fn add_server(&self, server: Arc<Server>) {
        self.state.lock().servers.push(server);
    }

    pub fn remove_server(&self, endpoint: &Endpoint) -> Option<Arc<Server>> {
        let mut state = self.state.lock();
        let idx = state.servers.iter().position(|s| s.endpoint() == endpoint)?;
        let server = state.servers.remove(idx);
        if state.cursor > idx {
            state.cursor -= 1;
        }
        if state.cursor >= state.servers.len() {
            state.cursor = 0;
        }
        Some(server)
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.state.lock().servers.clone()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let (enabled, mask_length, servers) = {
            let state = self.state.lock();
            (state.enabled, state.mask_length, state.servers.clone())
        };
        ServiceSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            enabled,
            mask_length,
            servers: servers.iter().map(|s| s.snapshot()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub kind: ServiceKind,
    pub enabled: bool,
    pub mask_length: Option<usize>,
    pub servers: Vec<ServerSnapshot>,
}

/// name -> service.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service, replacing any previous one with the same name.
    pub fn insert(&self, service: Service) -> Arc<Service> {
        let service = Arc::new(service);
        self.services
            .insert(service.name().to_string(), service.clone());
        service
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|s| s.value().clone())
    }

    /// Like [`ServiceRegistry::get`] but an unknown name is a NOT_FOUND fault.
    pub fn lookup(&self, name: &str) -> Result<Arc<Service>, Fault> {
        self.get(name)
            .ok_or_else(|| Fault::not_found(format!("unknown service {:?}", name)))
    }

    /// Existing service, or a new one built by `create` (atomic per name).
    pub fn get_or_insert_with(&self, name: &str, create: impl FnOnce() -> Service) -> Arc<Service> {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(create()))
            .value()
            .clone()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Service>> {
        self.services.remove(name).map(|(_, s)| s)
    }

    /// Enable or disable `name`. Unknown services are NOT_FOUND.
    pub fn set_state(&self, name: &str, enabled: bool) -> Result<bool, Fault> {
        Ok(self.lookup(name)?.set_enabled(enabled))
    }

    /// All services sorted by name.
    pub fn all(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<Arc<Service>> =
            self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
