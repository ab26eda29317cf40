//! The offline worker: install, activate and fetch handlers.
//!
//! Same-origin requests are served network-first by default. A successful
//! response for a precache URL refreshes the precache entry; a rejected
//! fetch falls back to any cached copy of the request, then to the offline
//! page. Cross-origin requests are never touched.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use http::Method;
use rustkit_net::{Fetch, Request, Response, Url};
use tokio::sync::RwLock;
use tracing::{debug, field, info, instrument, trace, warn, Instrument, Span};

use crate::cache::{cache_key, CacheStorage};
use crate::clients::Clients;
use crate::config::{FetchStrategy, WorkerConfig};
use crate::{ServiceWorkerError, ServiceWorkerId};

// ==================== Context ====================

/// Platform services a worker runs against.
#[derive(Clone)]
pub struct WorkerContext {
    /// Cache storage (`caches`).
    pub caches: Arc<dyn CacheStorage>,

    /// Network used for `fetch()` from inside the worker.
    pub network: Arc<dyn Fetch>,

    /// Pages the worker may control.
    pub clients: Arc<RwLock<Clients>>,
}

// ==================== Outcomes ====================

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Entries written to the precache.
    pub precached: usize,

    /// Ask the host to activate without waiting for the old worker.
    pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Buckets removed because they are not current.
    pub deleted: Vec<String>,

    /// Clients whose controller became this worker.
    pub claimed: Vec<String>,
}

/// Where a response handed to the page came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fresh from the network.
    Network,
    /// Cached copy of the request itself.
    Cache { bucket: String },
    /// The offline page, served in place of the request.
    OfflinePage { bucket: String },
}

/// What the fetch handler decided for one request.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Not handled; the request goes to the network unmodified.
    Passthrough,
    /// Handled with a response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// Handled, but neither network nor cache produced a response.
    Empty,
}

impl FetchDisposition {
    fn respond(response: Response, source: ResponseSource) -> Self {
        Self::Respond { response, source }
    }

    /// The response, if one was produced.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Respond { response, .. } => Some(response),
            _ => None,
        }
    }

    /// The response source, if one was produced.
    pub fn source(&self) -> Option<&ResponseSource> {
        match self {
            Self::Respond { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ==================== Handler Trait ====================

/// Lifecycle handlers the host dispatches to.
#[async_trait]
pub trait ServiceWorkerHandler: Send + Sync {
    /// Worker identity.
    fn id(&self) -> ServiceWorkerId;

    /// Registration scope.
    fn scope(&self) -> &Url;

    /// Handle the install event. `Err` makes the worker redundant.
    async fn on_install(&self) -> Result<InstallOutcome, ServiceWorkerError>;

    /// Handle the activate event.
    async fn on_activate(&self) -> Result<ActivateOutcome, ServiceWorkerError>;

    /// Handle a fetch event from a controlled page.
    async fn on_fetch(&self, request: &Request) -> FetchDisposition;
}

// ==================== Offline Worker ====================

/// Precaching, network-first offline worker.
pub struct OfflineWorker {
    id: ServiceWorkerId,
    config: WorkerConfig,
    origin: Url,
    scope: Url,
    precache_urls: Vec<Url>,
    offline_url: Url,
    ctx: WorkerContext,
}

impl OfflineWorker {
    /// Create a worker for `origin`.
    ///
    /// Fails if the configuration is invalid or any configured path does not
    /// resolve to `origin`.
    pub fn new(
        origin: Url,
        config: WorkerConfig,
        ctx: WorkerContext,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;

        let precache_urls = config
            .precache_paths
            .iter()
            .map(|path| config.resolve(&origin, path))
            .collect::<Result<Vec<_>, _>>()?;
        let offline_url = config.resolve(&origin, &config.offline_path)?;
        let scope = config.resolve(&origin, &config.scope)?;

        Ok(Self {
            id: ServiceWorkerId::new(),
            config,
            origin,
            scope,
            precache_urls,
            offline_url,
            ctx,
        })
    }

    /// The configuration this worker runs with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Absolute URLs of the precache list.
    pub fn precache_urls(&self) -> &[Url] {
        &self.precache_urls
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    fn is_precache_url(&self, url: &Url) -> bool {
        let key = cache_key(url);
        self.precache_urls.iter().any(|u| u.as_str() == key)
    }

    /// Bucket that owns opportunistic writes for `url`.
    fn bucket_for(&self, url: &Url) -> &str {
        if self.is_precache_url(url) {
            &self.config.precache_name
        } else {
            &self.config.runtime_name
        }
    }

    async fn write_through(&self, bucket: &str, request: &Request, response: &Response) {
        if request.method != Method::GET {
            debug!(method = %request.method, "not caching non-GET response");
            return;
        }
        match self.ctx.caches.put(bucket, request, response.clone()).await {
            Ok(()) => debug!(cache = bucket, url = %request.url, "cached network response"),
            Err(e) => warn!(cache = bucket, url = %request.url, error = %e, "cache write failed"),
        }
    }

    async fn network_first(&self, request: &Request) -> FetchDisposition {
        // Looked up for diagnostics only; the network is always consulted.
        let cached = self.ctx.caches.match_any(request).await.is_some();
        Span::current().record("cached", cached);

        match self.ctx.network.fetch(request).await {
            Ok(response) => {
                if self.is_precache_url(&request.url) {
                    self.write_through(&self.config.precache_name, request, &response)
                        .await;
                }
                FetchDisposition::respond(response, ResponseSource::Network)
            }
            Err(e) => {
                debug!(error = %e, "network failed, falling back to cache");
                self.fallback(request).await
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> FetchDisposition {
        if let Some((bucket, response)) = self.ctx.caches.match_any(request).await {
            return FetchDisposition::respond(response, ResponseSource::Cache { bucket });
        }
        self.fetch_and_store(request).await
    }

    async fn stale_while_revalidate(&self, request: &Request) -> FetchDisposition {
        if let Some((bucket, response)) = self.ctx.caches.match_any(request).await {
            self.revalidate(request.clone());
            return FetchDisposition::respond(response, ResponseSource::Cache { bucket });
        }
        self.fetch_and_store(request).await
    }

    /// Cache miss path shared by the cache-first strategies.
    async fn fetch_and_store(&self, request: &Request) -> FetchDisposition {
        match self.ctx.network.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.write_through(self.bucket_for(&request.url), request, &response)
                        .await;
                }
                FetchDisposition::respond(response, ResponseSource::Network)
            }
            Err(e) => {
                debug!(error = %e, "network failed on cache miss");
                self.fallback(request).await
            }
        }
    }

    /// Refresh a cached entry in the background.
    fn revalidate(&self, request: Request) {
        if request.method != Method::GET {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(url = %request.url, "no runtime, skipping revalidation");
            return;
        };

        let caches = Arc::clone(&self.ctx.caches);
        let network = Arc::clone(&self.ctx.network);
        let bucket = self.bucket_for(&request.url).to_string();

        handle.spawn(
            async move {
                match network.fetch(&request).await {
                    Ok(response) if response.ok() => {
                        if let Err(e) = caches.put(&bucket, &request, response).await {
                            warn!(cache = %bucket, error = %e, "revalidation write failed");
                        }
                    }
                    Ok(response) => debug!(status = %response.status, "revalidation not cacheable"),
                    Err(e) => debug!(error = %e, "revalidation fetch failed"),
                }
            }
            .instrument(Span::current()),
        );
    }

    /// Fallback chain after a rejected fetch: the request's own cache entry,
    /// then the offline page, then nothing.
    pub async fn fallback(&self, request: &Request) -> FetchDisposition {
        if let Some((bucket, response)) = self.ctx.caches.match_any(request).await {
            trace!(cache = %bucket, "serving cached copy");
            return FetchDisposition::respond(response, ResponseSource::Cache { bucket });
        }

        let offline = Request::get(self.offline_url.clone());
        if let Some((bucket, response)) = self.ctx.caches.match_any(&offline).await {
            trace!(cache = %bucket, "serving offline page");
            return FetchDisposition::respond(response, ResponseSource::OfflinePage { bucket });
        }

        warn!(url = %request.url, "no cached response and no offline page");
        FetchDisposition::Empty
    }
}

#[async_trait]
impl ServiceWorkerHandler for OfflineWorker {
    fn id(&self) -> ServiceWorkerId {
        self.id
    }

    fn scope(&self) -> &Url {
        &self.scope
    }

    #[instrument(skip(self), fields(worker = self.id.raw(), cache = %self.config.precache_name))]
    async fn on_install(&self) -> Result<InstallOutcome, ServiceWorkerError> {
        let name = &self.config.precache_name;
        self.ctx.caches.open(name).await;

        let fetches = self.precache_urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let response = self.ctx.network.fetch(&request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok::<_, ServiceWorkerError>((request, response))
        });

        let entries = match try_join_all(fetches).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "precache failed, install rejected");
                return Err(e);
            }
        };

        let precached = entries.len();
        self.ctx.caches.put_all(name, entries).await?;
        info!(precached, "precache populated");

        Ok(InstallOutcome {
            precached,
            skip_waiting: true,
        })
    }

    #[instrument(skip(self), fields(worker = self.id.raw()))]
    async fn on_activate(&self) -> Result<ActivateOutcome, ServiceWorkerError> {
        let current = self.config.current_caches();
        let stale: Vec<String> = self
            .ctx
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| !current.contains(&name.as_str()))
            .collect();

        let results = join_all(stale.iter().map(|name| self.ctx.caches.delete(name))).await;
        let deleted: Vec<String> = stale
            .into_iter()
            .zip(results)
            .filter_map(|(name, existed)| existed.then_some(name))
            .collect();
        for name in &deleted {
            info!(cache = %name, "deleted stale cache");
        }

        let claimed = self.ctx.clients.write().await.claim(&self.scope, self.id);
        info!(claimed = claimed.len(), "clients claimed");

        Ok(ActivateOutcome { deleted, claimed })
    }

    #[instrument(
        skip(self, request),
        fields(url = %request.url, method = %request.method, cached = field::Empty)
    )]
    async fn on_fetch(&self, request: &Request) -> FetchDisposition {
        if !self.is_same_origin(&request.url) {
            trace!("cross-origin, not intercepting");
            return FetchDisposition::Passthrough;
        }

        let strategy = self.config.strategy_for(request.url.path());
        let disposition = match strategy {
            FetchStrategy::NetworkFirst => self.network_first(request).await,
            FetchStrategy::CacheFirst => self.cache_first(request).await,
            FetchStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        };
        debug!(?strategy, source = ?disposition.source(), "fetch handled");
        disposition
    }
}
