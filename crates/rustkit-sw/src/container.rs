//! Registration host: drives the worker lifecycle and routes page fetches.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use rustkit_net::{Fetch, Request, Response, Url};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::worker::{
    ActivateOutcome, FetchDisposition, ResponseSource, ServiceWorkerHandler, WorkerContext,
};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

// ==================== Service Worker ====================

/// A worker instance tracked by a registration.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handler: Arc<dyn ServiceWorkerHandler>,
}

impl ServiceWorker {
    fn new(handler: Arc<dyn ServiceWorkerHandler>) -> Self {
        Self {
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    /// Worker ID.
    pub fn id(&self) -> ServiceWorkerId {
        self.handler.id()
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// No worker in any slot.
    pub fn is_empty(&self) -> bool {
        self.installing.is_none() && self.waiting.is_none() && self.active.is_none()
    }

    /// Transition installing to waiting. A previously waiting worker is
    /// superseded.
    fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Installing worker failed; it becomes redundant.
    fn install_failed(&mut self, error: String) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error);
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Promote the waiting worker. Returns the replaced active worker.
    fn promote_waiting(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }
}

// ==================== Events ====================

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Response delivered to a page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub response: Response,
    pub source: ResponseSource,
    /// Worker that produced the response; `None` when it came straight from
    /// the network.
    pub handled_by: Option<ServiceWorkerId>,
}

// ==================== Service Worker Container ====================

/// Service worker container (navigator.serviceWorker plus the platform side).
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    caches: Arc<dyn CacheStorage>,

    network: Arc<dyn Fetch>,

    clients: Arc<RwLock<Clients>>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        caches: Arc<dyn CacheStorage>,
        network: Arc<dyn Fetch>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches,
                network,
                clients: Arc::new(RwLock::new(Clients::new())),
                event_tx,
            },
            event_rx,
        )
    }

    /// Services for workers hosted by this container.
    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            caches: Arc::clone(&self.caches),
            network: Arc::clone(&self.network),
            clients: Arc::clone(&self.clients),
        }
    }

    /// Clients registry.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    /// Register a worker and run it through install and, when allowed,
    /// activation.
    ///
    /// Returns the state the worker ended in: `Activated`, or `Installed`
    /// while an older worker keeps control.
    pub async fn register(
        &self,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerState, ServiceWorkerError> {
        let scope = handler.scope().clone();
        let scope_str = scope.to_string();
        let worker_id = handler.id();

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));
            if registration.installing.is_some() {
                return Err(ServiceWorkerError::StateError(format!(
                    "an install is already running for {scope_str}"
                )));
            }
            let mut worker = ServiceWorker::new(Arc::clone(&handler));
            worker.set_state(ServiceWorkerState::Installing);
            registration.installing = Some(worker);
        }
        let _ = self.event_tx.send(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });
        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installing);

        // Lock released: pages keep being served by the current worker.
        let installed = handler.on_install().await;

        let skip_waiting = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;

            match installed {
                Err(e) => {
                    registration.install_failed(e.to_string());
                    if registration.is_empty() {
                        registrations.remove(&scope_str);
                    }
                    drop(registrations);
                    warn!(scope = %scope_str, error = %e, "install failed, worker is redundant");
                    self.emit_state(&scope_str, worker_id, ServiceWorkerState::Redundant);
                    return Err(e);
                }
                Ok(outcome) => {
                    if let Some(old) = registration.install_complete() {
                        self.emit_state(&scope_str, old.id(), ServiceWorkerState::Redundant);
                    }
                    outcome.skip_waiting || registration.active.is_none()
                }
            }
        };
        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installed);
        info!(scope = %scope_str, skip_waiting, "worker installed");

        if !skip_waiting {
            return Ok(ServiceWorkerState::Installed);
        }
        self.activate(&scope_str).await?;
        Ok(ServiceWorkerState::Activated)
    }

    /// Activate the waiting worker of a registration.
    pub async fn activate(&self, scope: &str) -> Result<ActivateOutcome, ServiceWorkerError> {
        let handler = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            if registration.waiting.is_none() {
                return Err(ServiceWorkerError::StateError(format!(
                    "no waiting worker for {scope}"
                )));
            }

            if let Some(old) = registration.promote_waiting() {
                self.clients.write().await.release(old.id());
                self.emit_state(scope, old.id(), ServiceWorkerState::Redundant);
            }
            match registration.active {
                Some(ref worker) => Arc::clone(&worker.handler),
                None => {
                    return Err(ServiceWorkerError::StateError(format!(
                        "activation lost its worker for {scope}"
                    )))
                }
            }
        };
        let worker_id = handler.id();
        self.emit_state(scope, worker_id, ServiceWorkerState::Activating);

        // A failing activate handler does not stop activation.
        let outcome = match handler.on_activate().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(scope, error = %e, "activate handler failed");
                ActivateOutcome::default()
            }
        };

        {
            let mut registrations = self.registrations.write().await;
            if let Some(worker) = registrations
                .get_mut(scope)
                .and_then(|r| r.active.as_mut())
                .filter(|w| w.id() == worker_id)
            {
                worker.set_state(ServiceWorkerState::Activated);
            }
        }
        self.emit_state(scope, worker_id, ServiceWorkerState::Activated);
        for client_id in &outcome.claimed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id,
            });
        }
        info!(scope, deleted = outcome.deleted.len(), "worker activated");

        Ok(outcome)
    }

    /// Force the waiting worker of `scope` to activate.
    pub async fn skip_waiting(&self, scope: &str) -> Result<ActivateOutcome, ServiceWorkerError> {
        self.activate(scope).await
    }

    /// Open a page. It is controlled from the start if an activated worker's
    /// scope covers it.
    pub async fn open_page(&self, url: Url) -> Client {
        let controller = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| url.as_str().starts_with(r.scope.as_str()))
            .filter_map(|r| r.get_active().filter(|w| w.is_active()).map(|w| (r, w)))
            .max_by_key(|(r, _)| r.scope.as_str().len())
            .map(|(_, w)| w.id());

        let mut clients = self.clients.write().await;
        match controller {
            Some(id) => clients.open_controlled(url, id),
            None => clients.open_window(url),
        }
    }

    /// Active worker handler with the given id.
    async fn controller(&self, id: ServiceWorkerId) -> Option<Arc<dyn ServiceWorkerHandler>> {
        self.registrations
            .read()
            .await
            .values()
            .filter_map(|r| r.get_active())
            .find(|w| w.id() == id)
            .map(|w| Arc::clone(&w.handler))
    }

    /// Fetch on behalf of a page.
    ///
    /// Requests from uncontrolled pages, and requests the worker passes
    /// through, go to the network directly.
    pub async fn fetch(
        &self,
        client_id: &str,
        request: Request,
    ) -> Result<PageResponse, ServiceWorkerError> {
        let controller_id = self
            .clients
            .read()
            .await
            .get(client_id)
            .ok_or_else(|| ServiceWorkerError::NotFound(client_id.to_string()))?
            .controller;

        let handler = match controller_id {
            Some(id) => self.controller(id).await,
            None => None,
        };
        let Some(handler) = handler else {
            debug!(url = %request.url, "uncontrolled page, going to network");
            return self.network_fetch(&request).await;
        };

        match handler.on_fetch(&request).await {
            FetchDisposition::Passthrough => self.network_fetch(&request).await,
            FetchDisposition::Respond { response, source } => Ok(PageResponse {
                response,
                source,
                handled_by: Some(handler.id()),
            }),
            FetchDisposition::Empty => Err(ServiceWorkerError::NoResponse(request.url.to_string())),
        }
    }

    async fn network_fetch(&self, request: &Request) -> Result<PageResponse, ServiceWorkerError> {
        let response = self.network.fetch(request).await?;
        Ok(PageResponse {
            response,
            source: ResponseSource::Network,
            handled_by: None,
        })
    }

    /// State of the active worker for a scope.
    pub async fn active_state(&self, scope: &str) -> Option<(ServiceWorkerId, ServiceWorkerState)> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.get_active())
            .map(|w| (w.id(), w.state))
    }

    /// State of the waiting worker for a scope.
    pub async fn waiting_state(&self, scope: &str) -> Option<(ServiceWorkerId, ServiceWorkerState)> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.waiting.as_ref())
            .map(|w| (w.id(), w.state))
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Unregister a scope; its workers become redundant and release their
    /// pages.
    pub async fn unregister(&self, scope: &str) -> bool {
        let Some(registration) = self.registrations.write().await.remove(scope) else {
            return false;
        };
        let workers = [
            registration.installing,
            registration.waiting,
            registration.active,
        ];
        let mut clients = self.clients.write().await;
        for mut worker in workers.into_iter().flatten() {
            worker.set_state(ServiceWorkerState::Redundant);
            clients.release(worker.id());
            self.emit_state(scope, worker.id(), ServiceWorkerState::Redundant);
        }
        true
    }
}
