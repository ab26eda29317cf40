//! # RustKit Service Workers
//!
//! Offline precache service worker for the RustKit browser engine.
//!
//! ## Features
//!
//! - **Install**: precache a fixed asset list, all-or-nothing
//! - **Activate**: drop cache buckets from older versions, claim open pages
//! - **Fetch**: network-first for same-origin requests, with cache and
//!   offline-page fallback when the network rejects
//! - **Cache API**: `caches.open()`, `cache.put()`, `caches.match()`
//! - **Clients API**: controlled pages and `clients.claim()`
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     │
//!     └── WorkerContext ──► OfflineWorker (ServiceWorkerHandler)
//!             ├── CacheStorage (caches)
//!             │       └── Cache: Request → Response
//!             ├── Fetch (network)
//!             └── Clients
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use rustkit_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod worker;

pub use cache::{CacheEntry, CacheStorage, MemoryCacheStorage};
pub use clients::{Client, ClientType, Clients};
pub use config::{FetchStrategy, Route, WorkerConfig};
pub use container::{
    PageResponse, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerRegistration,
};
pub use worker::{
    ActivateOutcome, FetchDisposition, InstallOutcome, OfflineWorker, ResponseSource,
    ServiceWorkerHandler, WorkerContext,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("No response for {0}")]
    NoResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Registered, install not started yet.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}
