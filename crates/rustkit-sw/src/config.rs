//! Worker configuration.
//!
//! The configuration is fixed for the lifetime of a worker. Bumping
//! `precache_name` is how a deploy invalidates the previous precache: the
//! next activation deletes every bucket that is not named here.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Shipped precache bucket name.
pub const DEFAULT_PRECACHE: &str = "precache-v1";

/// Shipped runtime bucket name.
pub const DEFAULT_RUNTIME: &str = "runtime";

/// Shipped offline fallback page.
pub const DEFAULT_OFFLINE_PATH: &str = "/offline";

/// Resources that must always be available offline.
pub const DEFAULT_PRECACHE_PATHS: [&str; 4] = ["/", "/about", "/offline", "/manifest.json"];

/// How a same-origin request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    /// Network, then cache, then offline page. Only precache URLs are written.
    #[default]
    NetworkFirst,
    /// Cache, then network (written to the runtime bucket), then offline page.
    CacheFirst,
    /// Cache immediately, refresh the runtime bucket in the background.
    StaleWhileRevalidate,
}

/// Strategy override for every path starting with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub strategy: FetchStrategy,
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Precache bucket name; doubles as the cache version.
    pub precache_name: String,

    /// Runtime bucket name.
    pub runtime_name: String,

    /// Same-origin paths fetched and stored at install, in order.
    pub precache_paths: Vec<String>,

    /// Page served when neither network nor cache can answer.
    pub offline_path: String,

    /// Registration scope path.
    pub scope: String,

    /// Strategy overrides, first match wins.
    pub routes: Vec<Route>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            precache_name: DEFAULT_PRECACHE.to_string(),
            runtime_name: DEFAULT_RUNTIME.to_string(),
            precache_paths: DEFAULT_PRECACHE_PATHS.iter().map(|p| p.to_string()).collect(),
            offline_path: DEFAULT_OFFLINE_PATH.to_string(),
            scope: "/".to_string(),
            routes: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Use a different precache bucket name.
    pub fn with_precache_name(mut self, name: impl Into<String>) -> Self {
        self.precache_name = name.into();
        self
    }

    /// Use a different runtime bucket name.
    pub fn with_runtime_name(mut self, name: impl Into<String>) -> Self {
        self.runtime_name = name.into();
        self
    }

    /// Replace the precache list.
    pub fn with_precache_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Add a strategy route.
    pub fn with_route(mut self, prefix: impl Into<String>, strategy: FetchStrategy) -> Self {
        self.routes.push(Route {
            prefix: prefix.into(),
            strategy,
        });
        self
    }

    /// Bucket names that survive activation.
    pub fn current_caches(&self) -> [&str; 2] {
        [self.precache_name.as_str(), self.runtime_name.as_str()]
    }

    /// Strategy for a request path.
    pub fn strategy_for(&self, path: &str) -> FetchStrategy {
        self.routes
            .iter()
            .find(|r| path.starts_with(&r.prefix))
            .map(|r| r.strategy)
            .unwrap_or_default()
    }

    /// Check names and paths without an origin.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.precache_name.is_empty() || self.runtime_name.is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "cache names must not be empty".to_string(),
            ));
        }
        if self.precache_name == self.runtime_name {
            return Err(ServiceWorkerError::ConfigError(format!(
                "precache and runtime share the name '{}'",
                self.precache_name
            )));
        }

        let mut seen = HashSet::new();
        for path in &self.precache_paths {
            check_path(path)?;
            if !seen.insert(path.as_str()) {
                return Err(ServiceWorkerError::ConfigError(format!(
                    "duplicate precache path '{path}'"
                )));
            }
        }
        check_path(&self.offline_path)?;
        check_path(&self.scope)?;
        for route in &self.routes {
            check_path(&route.prefix)?;
        }
        Ok(())
    }

    /// Resolve a configured path against `origin`.
    pub(crate) fn resolve(&self, origin: &Url, path: &str) -> Result<Url, ServiceWorkerError> {
        check_path(path)?;
        let url = origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("'{path}': {e}")))?;
        if url.origin() != origin.origin() {
            return Err(ServiceWorkerError::ConfigError(format!(
                "'{path}' resolves outside {}",
                origin.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }
}

/// Paths are origin-relative and absolute; `//host` would be scheme-relative.
fn check_path(path: &str) -> Result<(), ServiceWorkerError> {
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(ServiceWorkerError::ConfigError(format!(
            "'{path}' is not an absolute same-origin path"
        )));
    }
    Ok(())
}
