//! Shared helpers: a scripted transport, recording observers and caches

#![allow(dead_code)]

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};
use reposo::pipeline::{EntityCache, Response, ResponseTransformer};
use reposo::transport::{
    TransferMetrics, Transport, TransportCompletion, TransportError, TransportRequest,
    TransportResponse, TransportTask,
};
use reposo::{Entity, Resource, ResourceEvent, ResourceObserver, Service};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::LocalSet;
use tokio::time::Instant;

pub const BASE_URL: &str = "https://api.example.com/v1";

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `future` inside a local task set
pub async fn local<F: Future>(future: F) -> F::Output {
    init_tracing();
    LocalSet::new().run_until(future).await
}

/// Let spawned local and blocking work run to quiescence.
///
/// Tests run with the clock paused, so this returns as soon as nothing else
/// is runnable; pending blocking work holds the clock back.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Wait until `condition` holds, failing the test after one second of
/// wall-clock time
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not met within one second"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// A service over a fresh stub transport
pub fn service() -> (Service, StubTransport) {
    let transport = StubTransport::default();
    let service = Service::builder()
        .base_url(BASE_URL)
        .transport(transport.clone())
        .build()
        .unwrap();
    (service, transport)
}

struct StubCall {
    request: TransportRequest,
    completion: Option<TransportCompletion>,
    cancelled: Arc<AtomicBool>,
    metrics: Arc<Mutex<TransferMetrics>>,
}

/// Transport that records requests and answers only when told to
#[derive(Clone, Default)]
pub struct StubTransport {
    calls: Rc<RefCell<Vec<StubCall>>>,
}

impl StubTransport {
    pub fn request_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn request(&self, index: usize) -> TransportRequest {
        self.calls.borrow()[index].request.clone()
    }

    pub fn last_request(&self) -> TransportRequest {
        let calls = self.calls.borrow();
        calls[calls.len() - 1].request.clone()
    }

    pub fn was_cancelled(&self, index: usize) -> bool {
        self.calls.borrow()[index].cancelled.load(Ordering::SeqCst)
    }

    pub fn set_metrics(&self, index: usize, metrics: TransferMetrics) {
        *self.calls.borrow()[index].metrics.lock().unwrap() = metrics;
    }

    pub fn respond(&self, index: usize, status: u16, content_type: &str, body: &str) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        self.respond_with_headers(index, status, headers, body);
    }

    pub fn respond_with_headers(&self, index: usize, status: u16, headers: HeaderMap, body: &str) {
        self.complete(
            index,
            Ok(TransportResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers,
                body: Bytes::from(body.to_string()),
            }),
        );
    }

    pub fn fail(&self, index: usize, error: TransportError) {
        self.complete(index, Err(error));
    }

    fn complete(&self, index: usize, result: Result<TransportResponse, TransportError>) {
        let completion = self.calls.borrow_mut()[index]
            .completion
            .take()
            .expect("request already answered");
        completion(result);
    }
}

struct StubTask {
    cancelled: Arc<AtomicBool>,
    metrics: Arc<Mutex<TransferMetrics>>,
}

impl TransportTask for StubTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn transfer_metrics(&self) -> TransferMetrics {
        *self.metrics.lock().unwrap()
    }
}

impl Transport for StubTransport {
    fn start_request(
        &self,
        request: TransportRequest,
        completion: TransportCompletion,
    ) -> Box<dyn TransportTask> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Mutex::new(TransferMetrics::default()));
        self.calls.borrow_mut().push(StubCall {
            request,
            completion: Some(completion),
            cancelled: cancelled.clone(),
            metrics: metrics.clone(),
        });
        Box::new(StubTask { cancelled, metrics })
    }
}

/// Observer that records everything it is told
#[derive(Default)]
pub struct RecordingObserver {
    pub events: RefCell<Vec<ResourceEvent>>,
    pub progress: RefCell<Vec<f64>>,
    pub stopped: Cell<usize>,
}

impl RecordingObserver {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, event: ResourceEvent) -> usize {
        self.events.borrow().iter().filter(|e| **e == event).count()
    }
}

impl ResourceObserver for RecordingObserver {
    fn resource_changed(&self, _resource: &Resource, event: &ResourceEvent) {
        self.events.borrow_mut().push(*event);
    }

    fn resource_request_progress(&self, _resource: &Resource, progress: f64) {
        self.progress.borrow_mut().push(progress);
    }

    fn stopped_observing(&self, _resource: &Resource) {
        self.stopped.set(self.stopped.get() + 1);
    }
}

/// Pass-through transformer counting its invocations
#[derive(Clone, Default)]
pub struct CountingTransformer {
    pub count: Arc<AtomicUsize>,
}

impl CountingTransformer {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ResponseTransformer for CountingTransformer {
    fn process(&self, response: Response) -> Response {
        self.count.fetch_add(1, Ordering::SeqCst);
        response
    }

    fn description(&self) -> String {
        "counting".to_string()
    }
}

/// In-memory entity cache keyed by URL
#[derive(Clone, Default)]
pub struct MemoryCache {
    pub entries: Arc<Mutex<HashMap<String, Entity>>>,
    pub writes: Arc<AtomicUsize>,
}

impl MemoryCache {
    pub fn get(&self, url: &str) -> Option<Entity> {
        self.entries.lock().unwrap().get(url).cloned()
    }

    pub fn put(&self, url: &str, entity: Entity) {
        self.entries.lock().unwrap().insert(url.to_string(), entity);
    }
}

impl EntityCache for MemoryCache {
    type Key = String;

    fn key(&self, resource: &Resource) -> Option<String> {
        Some(resource.url().to_string())
    }

    fn read_entity(&self, key: &String) -> Option<Entity> {
        self.get(key)
    }

    fn write_entity(&self, entity: &Entity, key: &String) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.put(key, entity.clone());
    }

    fn remove_entity(&self, key: &String) {
        self.entries.lock().unwrap().remove(key);
    }

    fn update_entity_timestamp(&self, timestamp: Instant, key: &String) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entity) = entries.remove(key) {
            entries.insert(key.clone(), entity.with_timestamp(timestamp));
        }
    }
}

pub fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(name),
        HeaderValue::from_str(value).unwrap(),
    )
}
