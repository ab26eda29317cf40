//! Install, activate and serve offline against a real HTTP origin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustkit_net::{Fetch, LoaderConfig, NetError, Request, ResourceLoader, Response, Url};
use rustkit_sw::{
    CacheStorage, MemoryCacheStorage, OfflineWorker, ResponseSource, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerHandler, ServiceWorkerState, WorkerConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn origin_serving(paths: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    for p in paths {
        Mock::given(method("GET"))
            .and(path(*p))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("served {p}")))
            .mount(&server)
            .await;
    }
    server
}

/// Real HTTP loader with an airplane-mode switch.
struct Uplink {
    loader: ResourceLoader,
    offline: AtomicBool,
}

impl Uplink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            loader: ResourceLoader::new(LoaderConfig::default()).unwrap(),
            offline: AtomicBool::new(false),
        })
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetch for Uplink {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".into()));
        }
        self.loader.fetch(request).await
    }
}

#[tokio::test]
async fn test_precache_serves_pages_after_going_offline() {
    let server = origin_serving(&["/", "/about", "/offline", "/manifest.json"]).await;
    let origin = Url::parse(&server.uri()).unwrap();
    let caches = Arc::new(MemoryCacheStorage::new());
    caches.open("precache-v0").await;

    let uplink = Uplink::new();
    let (container, _events) = ServiceWorkerContainer::new(caches.clone(), uplink.clone());
    let worker = Arc::new(
        OfflineWorker::new(origin.clone(), WorkerConfig::default(), container.context()).unwrap(),
    );

    let state = container.register(worker.clone()).await.unwrap();
    assert_eq!(state, ServiceWorkerState::Activated);
    assert_eq!(caches.keys().await, vec!["precache-v1"]);

    let page = container.open_page(origin.join("/").unwrap()).await;
    assert_eq!(page.controller, Some(worker.id()));

    let online = container
        .fetch(&page.id, Request::get(origin.join("/about").unwrap()))
        .await
        .unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    uplink.go_offline();

    let about = container
        .fetch(&page.id, Request::get(origin.join("/about").unwrap()))
        .await
        .unwrap();
    assert_eq!(
        about.source,
        ResponseSource::Cache {
            bucket: "precache-v1".into()
        }
    );
    assert_eq!(about.response.text().unwrap(), "served /about");

    let unknown = container
        .fetch(&page.id, Request::get(origin.join("/blog/1").unwrap()))
        .await
        .unwrap();
    assert!(matches!(unknown.source, ResponseSource::OfflinePage { .. }));
    assert_eq!(unknown.response.text().unwrap(), "served /offline");
}

#[tokio::test]
async fn test_install_rejects_when_an_asset_is_missing() {
    let server = origin_serving(&["/", "/about", "/offline"]).await;
    let origin = Url::parse(&server.uri()).unwrap();
    let caches = Arc::new(MemoryCacheStorage::new());

    let (container, _events) = ServiceWorkerContainer::new(caches.clone(), Uplink::new());
    let worker = Arc::new(
        OfflineWorker::new(origin, WorkerConfig::default(), container.context()).unwrap(),
    );

    let err = container.register(worker.clone()).await.unwrap_err();

    assert!(matches!(
        err,
        ServiceWorkerError::InstallFailed { ref url, .. } if url.ends_with("/manifest.json")
    ));
    assert_eq!(caches.entries("precache-v1").await.map(|e| e.len()), Some(0));
    assert!(container
        .active_state(&worker.scope().to_string())
        .await
        .is_none());
}
