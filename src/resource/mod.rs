//! The resource state machine
//!
//! A [`Resource`] is the canonical local state of one URL: its latest data,
//! its latest error and the requests in flight for it. Every change is
//! announced to the resource's observers. Resources are handed out by a
//! [`Service`](crate::Service), which keeps exactly one per URL while anyone
//! holds it.

mod observer;

pub use observer::{NewDataSource, Owner, ResourceEvent, ResourceObserver};
pub(crate) use observer::{ObserverSet, Ownership};

use crate::body::Body;
use crate::config::{Configuration, RequestMutation};
use crate::entity::{Content, ContentType, Entity, Json, Model, Text};
use crate::error::{Cause, RequestError};
use crate::request::network::{NetworkRequestDelegate, RequestBuilder};
use crate::request::{Request, RequestState, ResponseInfo};
use crate::service::ServiceInner;
use crate::transport::{Transport, TransportRequest};
use http::header::{CONTENT_TYPE, IF_NONE_MATCH};
use http::{HeaderValue, Method};
use once_cell::sync::Lazy;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

static INVALID_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("about:invalid").expect("static URL is valid"));

#[derive(Default)]
struct ResourceState {
    latest_data: Option<Entity>,
    latest_error: Option<RequestError>,
    load_requests: Vec<Request>,
    all_requests: Vec<Request>,
    invalidated: bool,
    cache_checked: bool,
}

#[derive(Clone, Copy)]
enum RequestList {
    All,
    Load,
}

impl RequestList {
    fn of(self, state: &mut ResourceState) -> &mut Vec<Request> {
        match self {
            Self::All => &mut state.all_requests,
            Self::Load => &mut state.load_requests,
        }
    }
}

pub(crate) struct ResourceInner {
    url: Url,
    invalid_url: Option<String>,
    service: Rc<ServiceInner>,
    state: RefCell<ResourceState>,
    observers: RefCell<ObserverSet>,
    config_cache: RefCell<HashMap<Method, (u64, Rc<Configuration>)>>,
}

/// The local state of one URL.
///
/// Cloning yields another handle to the same resource; two handles are equal
/// exactly when they refer to the same resource.
#[derive(Clone)]
pub struct Resource(Rc<ResourceInner>);

impl Resource {
    pub(crate) fn new(service: Rc<ServiceInner>, url: Url) -> Self {
        Self::build(service, url, None)
    }

    /// A resource for a URL that could not be parsed. Every request it makes
    /// fails immediately.
    pub(crate) fn invalid(service: Rc<ServiceInner>, url: String) -> Self {
        Self::build(service, INVALID_URL.clone(), Some(url))
    }

    fn build(service: Rc<ServiceInner>, url: Url, invalid_url: Option<String>) -> Self {
        Self(Rc::new(ResourceInner {
            url,
            invalid_url,
            service,
            state: RefCell::new(ResourceState::default()),
            observers: RefCell::new(ObserverSet::default()),
            config_cache: RefCell::new(HashMap::new()),
        }))
    }

    pub(crate) fn from_inner(inner: Rc<ResourceInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn inner(&self) -> &Rc<ResourceInner> {
        &self.0
    }

    /// The resource's URL. `about:invalid` if it was created from a string
    /// that is not a valid URL.
    pub fn url(&self) -> &Url {
        &self.0.url
    }

    /// Whether this resource was created from an unparseable URL
    pub fn is_invalid(&self) -> bool {
        self.0.invalid_url.is_some()
    }

    /// Whether two handles refer to the same resource
    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // -- Configuration --

    /// Configuration for GET requests
    pub fn configuration(&self) -> Rc<Configuration> {
        self.configuration_for(&Method::GET)
    }

    /// Configuration for requests with `method`, recomputed if the service's
    /// rules changed since it was last computed
    pub fn configuration_for(&self, method: &Method) -> Rc<Configuration> {
        let version = self.0.service.config.version();
        if let Some((cached_version, config)) = self.0.config_cache.borrow().get(method) {
            if *cached_version == version {
                return config.clone();
            }
        }

        // rules may touch this resource, so no borrow is held while they run
        let config = Rc::new(self.0.service.config.compute(&self.0.url, method));
        self.0
            .config_cache
            .borrow_mut()
            .insert(method.clone(), (version, config.clone()));
        config
    }

    pub(crate) fn transport(&self) -> Rc<dyn Transport> {
        self.0.service.transport.clone()
    }

    // -- State --

    /// The most recent data, from the network, a cache or a local override
    pub fn latest_data(&self) -> Option<Entity> {
        self.0.state.borrow().latest_data.clone()
    }

    /// The error from the most recent load, cleared by new data
    pub fn latest_error(&self) -> Option<RequestError> {
        self.0.state.borrow().latest_error.clone()
    }

    /// Latest content as `C`, if it is of that type
    pub fn typed_content<C: ContentType>(&self) -> Option<C::Value> {
        self.0
            .state
            .borrow()
            .latest_data
            .as_ref()
            .and_then(Entity::typed_content::<C>)
    }

    /// Latest content as text
    pub fn text(&self) -> Option<Arc<str>> {
        self.typed_content::<Text>()
    }

    /// Latest content as JSON
    pub fn json(&self) -> Option<Arc<serde_json::Value>> {
        self.typed_content::<Json>()
    }

    /// Latest content as a model of type `T`
    pub fn model<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.typed_content::<Model<T>>()
    }

    /// When the data or error was last updated, whichever is later
    pub fn timestamp(&self) -> Option<Instant> {
        let state = self.0.state.borrow();
        let data = state.latest_data.as_ref().map(Entity::timestamp);
        let error = state.latest_error.as_ref().map(|error| error.timestamp);
        data.max(error)
    }

    /// Whether a load request is in flight
    pub fn is_loading(&self) -> bool {
        !self.active_requests(RequestList::Load).is_empty()
    }

    /// Whether any request is in flight
    pub fn is_requesting(&self) -> bool {
        !self.active_requests(RequestList::All).is_empty()
    }

    /// Load requests in flight
    pub fn load_requests(&self) -> Vec<Request> {
        self.active_requests(RequestList::Load)
    }

    /// Every request in flight
    pub fn all_requests(&self) -> Vec<Request> {
        self.active_requests(RequestList::All)
    }

    /// Requests still running. Completion hooks may run after the request
    /// completes, so finished requests are pruned here as well.
    fn active_requests(&self, list: RequestList) -> Vec<Request> {
        let mut state = self.0.state.borrow_mut();
        let requests = list.of(&mut state);
        requests.retain(|request| !request.is_completed());
        requests.clone()
    }

    // -- Requests --

    /// Send a request with no body.
    ///
    /// The response does not change the resource's state; use
    /// [`load`](Self::load) or [`load_using`](Self::load_using) for that.
    pub fn request(&self, method: Method) -> Request {
        self.make_request(method, Body::Empty, None)
    }

    /// Send a request with a body
    pub fn request_with(&self, method: Method, body: impl Into<Body>) -> Request {
        self.make_request(method, body.into(), None)
    }

    /// Send a request with `value` serialized as a JSON body
    pub fn request_json(&self, method: Method, value: impl serde::Serialize) -> Request {
        match Body::json(value) {
            Ok(body) => self.make_request(method, body, None),
            Err(error) => Request::failed(error),
        }
    }

    /// Send a request, adjusting it before the configured mutations run
    pub fn request_mutating(
        &self,
        method: Method,
        mutation: impl Fn(&mut TransportRequest) + 'static,
    ) -> Request {
        self.make_request(method, Body::Empty, Some(Rc::new(mutation)))
    }

    fn make_request(
        &self,
        method: Method,
        body: Body,
        mutation: Option<RequestMutation>,
    ) -> Request {
        self.assert_main_thread();

        if let Some(url) = &self.0.invalid_url {
            return Request::failed(RequestError::from_cause(Cause::InvalidUrl {
                url: url.clone(),
            }));
        }
        let encoded = match body.encode() {
            Ok(encoded) => encoded,
            Err(error) => return Request::failed(error),
        };

        let resource = self.clone();
        let builder: RequestBuilder = Rc::new(move || {
            // headers and mutations come from the method the caller asked for
            let config = resource.configuration_for(&method);
            let mut request = TransportRequest::new(method.clone(), resource.url().clone());
            request.headers = config.headers.clone();
            if let Some((bytes, content_type)) = &encoded {
                request.headers.insert(CONTENT_TYPE, content_type.clone());
                request.body = Some(bytes.clone());
            }
            if let Some(mutation) = &mutation {
                mutation(&mut request);
            }
            for mutation in config.request_mutations() {
                mutation(&mut request);
            }
            request
        });

        let delegate = NetworkRequestDelegate::new(self.clone(), builder);
        let sent_method = delegate.underlying().method.clone();
        let mut request = Request::from_delegate(Rc::new(delegate));

        let config = self.configuration_for(&sent_method);
        for decorate in config.request_decorators() {
            request = decorate(self, request);
        }

        self.track(&request, RequestList::All);
        if request.state() == RequestState::NotStarted {
            request.start();
        }
        request
    }

    fn track(&self, request: &Request, list: RequestList) {
        list.of(&mut self.0.state.borrow_mut()).push(request.clone());

        let resource = Rc::downgrade(&self.0);
        request.on_completion(move |_| {
            if let Some(inner) = resource.upgrade() {
                list.of(&mut inner.state.borrow_mut())
                    .retain(|request| !request.is_completed());
            }
        });
    }

    // -- Loading --

    /// Fetch the resource with GET and apply the outcome to its state.
    ///
    /// Sends `If-None-Match` when the current data carries an ETag.
    pub fn load(&self) -> Request {
        let resource = Rc::downgrade(&self.0);
        let etag: RequestMutation = Rc::new(move |request: &mut TransportRequest| {
            let Some(inner) = resource.upgrade() else {
                return;
            };
            let etag = inner
                .state
                .borrow()
                .latest_data
                .as_ref()
                .and_then(|entity| entity.etag())
                .and_then(|etag| HeaderValue::from_str(etag).ok());
            if let Some(etag) = etag {
                request.headers.insert(IF_NONE_MATCH, etag);
            }
        });

        let request = self.make_request(Method::GET, Body::Empty, Some(etag));
        self.load_using(request)
    }

    /// Apply the outcome of `request`, whatever it is, to this resource's
    /// state as if it were a load
    pub fn load_using(&self, request: Request) -> Request {
        self.assert_main_thread();
        self.track(&request, RequestList::Load);

        let resource = Rc::downgrade(&self.0);
        request.on_progress(move |progress| {
            if let Some(inner) = resource.upgrade() {
                Resource(inner).notify_progress(progress);
            }
        });
        let resource = Rc::downgrade(&self.0);
        request.on_completion(move |info| {
            if let Some(inner) = resource.upgrade() {
                Resource(inner).response_received(info);
            }
        });

        self.notify(ResourceEvent::Requested);
        request
    }

    /// Load unless data is fresh or a load is already in flight.
    ///
    /// Returns the in-flight load if there is one, a new load if the data is
    /// stale, or `None` if the data is up to date.
    pub fn load_if_needed(&self) -> Option<Request> {
        self.assert_main_thread();
        self.check_cache_once();

        let in_flight = self.active_requests(RequestList::Load).into_iter().next();
        if let Some(request) = in_flight {
            tracing::debug!("{} is already loading", self);
            return Some(request);
        }

        if self.is_up_to_date() {
            tracing::debug!("{} is up to date; no need to load", self);
            return None;
        }

        Some(self.load())
    }

    /// Whether the latest data or error is recent enough that
    /// [`load_if_needed`](Self::load_if_needed) would not load
    pub fn is_up_to_date(&self) -> bool {
        let config = self.configuration();
        let state = self.0.state.borrow();
        if state.invalidated {
            return false;
        }

        let max_age = if state.latest_error.is_some() {
            config.retry_time
        } else {
            config.expiration_time
        };
        let data = state.latest_data.as_ref().map(Entity::timestamp);
        let error = state.latest_error.as_ref().map(|error| error.timestamp);
        data.max(error)
            .is_some_and(|timestamp| timestamp.elapsed() <= max_age)
    }

    /// Mark the data stale so the next [`load_if_needed`](Self::load_if_needed)
    /// loads. The data itself stays available.
    pub fn invalidate(&self) {
        self.0.state.borrow_mut().invalidated = true;
    }

    /// Cancel every load in flight, if nothing observes this resource
    pub fn cancel_load_if_unobserved(&self) {
        if self.observer_count() > 0 {
            tracing::debug!("{} still has observers; not cancelling loads", self);
            return;
        }
        let requests = self.load_requests();
        tracing::debug!(
            "{} has no observers; cancelling {} load(s)",
            self,
            requests.len()
        );
        for request in requests {
            request.cancel();
        }
    }

    /// Wait `delay`, then [`cancel_load_if_unobserved`](Self::cancel_load_if_unobserved)
    pub fn cancel_load_if_unobserved_after(&self, delay: Duration) {
        let resource = Rc::downgrade(&self.0);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = resource.upgrade() {
                Resource(inner).cancel_load_if_unobserved();
            }
        });
    }

    /// Cancel every request, drop data and error, clear cache entries and
    /// tell observers
    pub fn wipe(&self) {
        self.assert_main_thread();
        tracing::debug!("Wiping {}", self);

        let requests: Vec<Request> = {
            let state = self.0.state.borrow();
            state
                .all_requests
                .iter()
                .chain(&state.load_requests)
                .cloned()
                .collect()
        };
        for request in requests {
            request.cancel();
        }

        {
            let mut state = self.0.state.borrow_mut();
            state.latest_data = None;
            state.latest_error = None;
            state.invalidated = false;
        }
        self.configuration().pipeline.remove_cache_entries(self);
        self.notify(ResourceEvent::NewData(NewDataSource::Wipe));
    }

    /// Replace the data with `entity`, as if it came from the server
    pub fn override_local_data(&self, entity: Entity) {
        self.assert_main_thread();
        self.receive_new_data(entity, NewDataSource::LocalOverride);
    }

    /// Replace only the content, keeping the current headers if there are
    /// any
    pub fn override_local_content(&self, content: impl Into<Content>) {
        let entity = match self.latest_data() {
            Some(entity) => entity.with_content(content).touched(),
            None => Entity::new(content, "application/octet-stream"),
        };
        self.override_local_data(entity);
    }

    fn response_received(&self, info: &ResponseInfo) {
        match &info.response {
            Ok(entity) if info.is_new => {
                self.receive_new_data(entity.clone(), NewDataSource::Network)
            }
            Ok(_) => self.receive_data_not_modified(),
            Err(error) => self.receive_error(error.clone()),
        }
    }

    fn receive_new_data(&self, entity: Entity, source: NewDataSource) {
        tracing::debug!("{} received new data from {}", self, source);
        {
            let mut state = self.0.state.borrow_mut();
            state.latest_error = None;
            state.latest_data = Some(entity);
            state.invalidated = false;
        }
        self.notify(ResourceEvent::NewData(source));
    }

    fn receive_data_not_modified(&self) {
        tracing::debug!("{} existing data is still valid", self);
        let now = Instant::now();
        {
            let mut state = self.0.state.borrow_mut();
            state.latest_error = None;
            state.latest_data = state
                .latest_data
                .take()
                .map(|entity| entity.with_timestamp(now));
            state.invalidated = false;
        }
        self.configuration()
            .pipeline
            .update_cache_timestamps(self, now);
        self.notify(ResourceEvent::NotModified);
    }

    fn receive_error(&self, error: RequestError) {
        if error.is_cancellation() {
            // cancellation leaves data and error as they were
            self.notify(ResourceEvent::RequestCancelled);
            return;
        }

        tracing::debug!("{} load failed: {}", self, error);
        {
            let mut state = self.0.state.borrow_mut();
            state.latest_error = Some(error);
            state.invalidated = false;
        }
        self.notify(ResourceEvent::Error);
    }

    fn check_cache_once(&self) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.cache_checked {
                return;
            }
            state.cache_checked = true;
        }

        let Some(loader) = self.configuration().pipeline.cached_entity_loader(self) else {
            return;
        };

        tracing::debug!("Checking caches for {}", self);
        let resource = self.clone();
        tokio::task::spawn_local(async move {
            match tokio::task::spawn_blocking(loader).await {
                Ok(Some(entity)) => {
                    if resource.latest_data().is_none() {
                        resource.receive_new_data(entity, NewDataSource::Cache);
                    } else {
                        tracing::debug!(
                            "Ignoring cached data for {}: it already has newer data",
                            resource
                        );
                    }
                }
                Ok(None) => {}
                Err(error) => tracing::warn!("Cache check for {} failed: {}", resource, error),
            }
        });
    }

    // -- Observers --

    /// Add an observer that stays registered while `observer` is alive.
    ///
    /// Adding the same observer again has no effect.
    pub fn add_observer<O: ResourceObserver + 'static>(&self, observer: &Rc<O>) -> &Self {
        let observer: Rc<dyn ResourceObserver> = observer.clone();
        self.add_observer_entry(observer, Ownership::SelfOwned)
    }

    /// Add an observer held alive by `owner`; it stays registered until
    /// every owner it was added with is dropped or removed
    pub fn add_observer_owned_by<O: ResourceObserver + 'static>(
        &self,
        observer: Rc<O>,
        owner: &Owner,
    ) -> &Self {
        self.add_observer_entry(observer, Ownership::External(owner))
    }

    /// Add a closure observer held alive by `owner`
    pub fn add_observer_fn(
        &self,
        owner: &Owner,
        observer: impl Fn(&Resource, &ResourceEvent) + 'static,
    ) -> &Self {
        self.add_observer_owned_by(Rc::new(observer), owner)
    }

    fn add_observer_entry(
        &self,
        observer: Rc<dyn ResourceObserver>,
        ownership: Ownership<'_>,
    ) -> &Self {
        self.assert_main_thread();
        let is_new = self
            .0
            .observers
            .borrow_mut()
            .add(observer.clone(), ownership);
        if is_new {
            tracing::debug!("{} added observer", self);
            observer.resource_changed(self, &ResourceEvent::ObserverAdded);
            self.check_cache_once();
        }
        self
    }

    /// Remove `owner` from every registration; observers left with no
    /// owner stop receiving events immediately
    pub fn remove_observers(&self, owned_by: &Owner) {
        self.assert_main_thread();
        self.0.observers.borrow_mut().remove_owner(owned_by);
        self.sweep_observers();
    }

    /// Remove `observer` regardless of who owns it
    pub fn remove_observer<O: ResourceObserver + 'static>(&self, observer: &Rc<O>) {
        self.assert_main_thread();
        let observer: Rc<dyn ResourceObserver> = observer.clone();
        let removed = self.0.observers.borrow_mut().remove(&observer);
        if removed {
            observer.stopped_observing(self);
        }
    }

    /// Number of live observers
    pub fn observer_count(&self) -> usize {
        self.sweep_observers();
        self.0.observers.borrow().len()
    }

    /// Whether the service may drop this resource from its registry
    pub(crate) fn allow_removal_from_cache(&self) -> bool {
        self.sweep_observers();
        self.0.observers.borrow().is_empty()
    }

    fn sweep_observers(&self) {
        let removed = self.0.observers.borrow_mut().sweep();
        for observer in removed {
            observer.stopped_observing(self);
        }
    }

    fn notify(&self, event: ResourceEvent) {
        self.sweep_observers();
        let observers = self.0.observers.borrow().snapshot();
        tracing::debug!(
            "{} sending {} to {} observer(s)",
            self,
            event,
            observers.len()
        );
        for observer in observers {
            observer.resource_changed(self, &event);
        }
    }

    fn notify_progress(&self, progress: f64) {
        let observers = self.0.observers.borrow().snapshot();
        for observer in observers {
            observer.resource_request_progress(self, progress);
        }
    }

    // -- Navigation --

    /// The resource at `subpath` below this one.
    ///
    /// `subpath` is appended as path text, so `child("a/b")` adds two
    /// segments; a leading slash does not reset to the root.
    pub fn child(&self, subpath: &str) -> Resource {
        if let Some(url) = &self.0.invalid_url {
            return self.service().invalid_resource(format!("{}/{}", url, subpath));
        }
        let mut url = self.0.url.clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            subpath.trim_start_matches('/')
        );
        url.set_path(&path);
        self.service().resource_for_url(url)
    }

    /// The resource at `href`, resolved against this resource's URL the way
    /// a browser resolves a link
    pub fn relative(&self, href: &str) -> Resource {
        if self.is_invalid() {
            return self.service().invalid_resource(href.to_string());
        }
        match self.0.url.join(href) {
            Ok(url) => self.service().resource_for_url(url),
            Err(error) => {
                tracing::warn!("Cannot resolve {} against {}: {}", href, self, error);
                self.service().invalid_resource(href.to_string())
            }
        }
    }

    /// This resource with query parameter `name` set to `value`, or removed
    /// when `value` is `None`. Parameters are kept sorted by name.
    pub fn with_param(&self, name: &str, value: Option<&str>) -> Resource {
        if self.is_invalid() {
            return self.clone();
        }

        let mut params: Vec<(String, String)> = self
            .0
            .url
            .query_pairs()
            .filter(|(key, _)| key != name)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        if let Some(value) = value {
            params.push((name.to_string(), value.to_string()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));

        // spaces encode as %20, the same as in hand-written URLs
        let query = params
            .iter()
            .map(|(key, value)| {
                format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");
        let mut url = self.0.url.clone();
        url.set_query(if query.is_empty() { None } else { Some(&query) });
        self.service().resource_for_url(url)
    }

    fn service(&self) -> &Rc<ServiceInner> {
        &self.0.service
    }

    fn assert_main_thread(&self) {
        self.0.service.assert_main_thread();
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Resource {}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.invalid_url {
            Some(url) => write!(f, "Resource(invalid: {})", url),
            None => write!(f, "Resource({})", self.0.url),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("Resource")
            .field("url", &self.0.url.as_str())
            .field("invalid_url", &self.0.invalid_url)
            .field("has_data", &state.latest_data.is_some())
            .field("has_error", &state.latest_error.is_some())
            .field("load_requests", &state.load_requests.len())
            .field("all_requests", &state.all_requests.len())
            .finish()
    }
}
