//! Clients API: the pages a worker can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::ServiceWorkerId;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A client (open page or worker).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// Check if the client URL falls under `scope`.
    pub fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Open a window client. New pages start uncontrolled.
    pub fn open_window(&mut self, url: Url) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Open a window client that an already active worker controls from
    /// its first request.
    pub fn open_controlled(&mut self, url: Url, controller: ServiceWorkerId) -> Client {
        let mut client = self.open_window(url);
        client.controller = Some(controller);
        if let Some(stored) = self.clients.get_mut(&client.id) {
            stored.controller = Some(controller);
        }
        client
    }

    /// Clients under `scope`.
    pub fn match_all(&self, scope: &Url) -> Vec<&Client> {
        self.clients.values().filter(|c| c.in_scope(scope)).collect()
    }

    /// Make `worker` the controller of every client in `scope`.
    ///
    /// Returns the ids of clients whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<String> {
        let mut claimed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.in_scope(scope) && c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Drop control by `worker` (it became redundant).
    pub fn release(&mut self, worker: ServiceWorkerId) {
        for client in self.clients.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
            }
        }
    }

    /// Remove a client (page closed).
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08x}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_open_window_is_uncontrolled() {
        let mut clients = Clients::new();
        let client = clients.open_window(url("https://app.example/"));

        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.controller.is_none());
        assert!(clients.get(&client.id).is_some());
    }

    #[test]
    fn test_claim_only_in_scope() {
        let mut clients = Clients::new();
        let inside = clients.open_window(url("https://app.example/docs/intro"));
        let outside = clients.open_window(url("https://app.example/blog/"));
        let worker = ServiceWorkerId::new();

        let claimed = clients.claim(&url("https://app.example/docs/"), worker);

        assert_eq!(claimed, vec![inside.id.clone()]);
        assert_eq!(clients.get(&inside.id).unwrap().controller, Some(worker));
        assert!(clients.get(&outside.id).unwrap().controller.is_none());
    }

    #[test]
    fn test_claim_twice_reports_nothing_new() {
        let mut clients = Clients::new();
        clients.open_window(url("https://app.example/"));
        let worker = ServiceWorkerId::new();
        let scope = url("https://app.example/");

        assert_eq!(clients.claim(&scope, worker).len(), 1);
        assert!(clients.claim(&scope, worker).is_empty());
    }

    #[test]
    fn test_release() {
        let mut clients = Clients::new();
        let worker = ServiceWorkerId::new();
        let client = clients.open_controlled(url("https://app.example/"), worker);

        clients.release(worker);
        assert!(clients.get(&client.id).unwrap().controller.is_none());
        assert!(clients.remove(&client.id).is_some());
        assert_eq!(clients.match_all(&url("https://app.example/")).len(), 0);
    }
}
