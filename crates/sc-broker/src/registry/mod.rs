// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service, server and session registries.
//!
//! All three are shared by every connection task and by the background
//! tasks. Maps are `DashMap`s; per-service membership and per-session state
//! sit behind short `parking_lot` locks that are never held across an
//! `.await`.

pub mod server;
pub mod service;
pub mod session;

pub use server::{Server, ServerKey, ServerLease, ServerRegistry, ServerSnapshot};
pub use service::{Service, ServiceRegistry, ServiceSnapshot};
pub use session::{Session, SessionRegistry, SessionSnapshot, SessionState};
