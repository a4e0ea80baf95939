//! The service: resource registry, configuration rules and transport

use crate::config::{Configuration, ConfigurationPattern, ConfigurationRule, ConfigStore};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, ResponseTransformer, StageKey};
use crate::registry::WeakCache;
use crate::resource::{Resource, ResourceInner};
use crate::transport::{ProxyConfig, Transport, TransportConfig};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use url::Url;

const DEFAULT_CACHED_RESOURCE_COUNT_LIMIT: usize = 100;

pub(crate) struct ServiceInner {
    main_thread: ThreadId,
    base_url: Option<Url>,
    pub(crate) transport: Rc<dyn Transport>,
    pub(crate) config: ConfigStore,
    resources: RefCell<WeakCache<String, ResourceInner>>,
    closed: Cell<bool>,
}

impl ServiceInner {
    pub(crate) fn assert_main_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.main_thread,
            "resources must only be used on the thread that created their service"
        );
    }

    /// The one resource for `url`, created if needed
    pub(crate) fn resource_for_url(self: &Rc<Self>, url: Url) -> Resource {
        self.assert_main_thread();
        if self.closed.get() {
            // the registry is gone; registering would tie service and
            // resource together for good
            tracing::debug!("Service dropped; {} will not be registered", url);
            return Resource::new(self.clone(), url);
        }
        let key = url.as_str().to_string();

        let existing = self.resources.borrow_mut().get(&key);
        if let Some(inner) = existing {
            return Resource::from_inner(inner);
        }

        tracing::debug!("Creating resource for {}", url);
        let resource = Resource::new(self.clone(), url);
        let over_limit = self
            .resources
            .borrow_mut()
            .insert(key, resource.inner().clone());
        if over_limit {
            self.flush_unused_resources();
        }
        resource
    }

    /// A resource for an unparseable URL. Never registered, so every call
    /// yields a distinct resource.
    pub(crate) fn invalid_resource(self: &Rc<Self>, url: String) -> Resource {
        tracing::warn!("Invalid URL {}; requests for it will fail", url);
        Resource::invalid(self.clone(), url)
    }

    fn flush_unused_resources(&self) {
        let candidates = self.resources.borrow().strong_entries();
        let mut released = Vec::new();
        for (key, inner) in candidates {
            // only resources nobody observes may become weak
            if Resource::from_inner(inner).allow_removal_from_cache() {
                released.push(key);
            }
        }

        self.resources.borrow_mut().weaken(&released);
    }

    fn live_resources(&self) -> Vec<Resource> {
        let values = self.resources.borrow().live_values();
        values.into_iter().map(Resource::from_inner).collect()
    }
}

/// Entry point: hands out resources and holds the rules that configure
/// them.
///
/// A service and everything it hands out belong to the thread that built
/// it; drive them from inside a [`tokio::task::LocalSet`].
pub struct Service {
    inner: Rc<ServiceInner>,
}

impl Service {
    /// A service with no base URL and the default transport
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a service builder
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// The base URL relative paths are resolved against
    pub fn base_url(&self) -> Option<&Url> {
        self.inner.base_url.as_ref()
    }

    /// The resource at `path` below the base URL.
    ///
    /// `path` is appended as text: a leading slash does not reset to the
    /// host root. Without a base URL, `path` must be absolute.
    pub fn resource(&self, path: &str) -> Resource {
        match &self.inner.base_url {
            Some(base) => self.resource_absolute(&format!(
                "{}/{}",
                base.as_str().trim_end_matches('/'),
                path.trim_start_matches('/')
            )),
            None => self.resource_absolute(path),
        }
    }

    /// The resource at an absolute URL string.
    ///
    /// An unparseable string yields a resource whose requests all fail.
    pub fn resource_absolute(&self, url: &str) -> Resource {
        match Url::parse(url) {
            Ok(url) => self.inner.resource_for_url(url),
            Err(_) => self.inner.invalid_resource(url.to_string()),
        }
    }

    /// The resource at `url`
    pub fn resource_for_url(&self, url: Url) -> Resource {
        self.inner.resource_for_url(url)
    }

    // -- Configuration --

    /// Add a rule adjusting the configuration of every resource matching
    /// `pattern`, for all methods.
    ///
    /// Rules apply in the order they were added; later rules see and may
    /// override earlier ones. A pattern that fails to compile is logged and
    /// the rule is skipped.
    pub fn configure(
        &self,
        pattern: impl Into<ConfigurationPattern>,
        description: impl Into<String>,
        configurer: impl Fn(&mut Configuration) + 'static,
    ) {
        self.add_rule(pattern.into(), None, description.into(), Rc::new(configurer));
    }

    /// Like [`configure`](Self::configure), limited to `methods`
    pub fn configure_methods(
        &self,
        pattern: impl Into<ConfigurationPattern>,
        methods: &[Method],
        description: impl Into<String>,
        configurer: impl Fn(&mut Configuration) + 'static,
    ) {
        self.add_rule(
            pattern.into(),
            Some(methods.to_vec()),
            description.into(),
            Rc::new(configurer),
        );
    }

    /// Replace the model stage's transformers with `transformer` for
    /// matching resources
    pub fn configure_transformer(
        &self,
        pattern: impl Into<ConfigurationPattern>,
        transformer: impl ResponseTransformer + 'static,
    ) {
        self.configure_transformer_at(pattern, StageKey::MODEL, true, transformer);
    }

    /// Add `transformer` to `stage` for matching resources, optionally
    /// replacing the transformers already there
    pub fn configure_transformer_at(
        &self,
        pattern: impl Into<ConfigurationPattern>,
        stage: StageKey,
        replace_existing: bool,
        transformer: impl ResponseTransformer + 'static,
    ) {
        let pattern = pattern.into();
        let description = format!(
            "{} transformer at {} for {:?}",
            transformer.description(),
            stage,
            pattern
        );
        let transformer: Arc<dyn ResponseTransformer> = Arc::new(transformer);
        self.configure(pattern, description, move |config| {
            let stage = config.pipeline.stage_mut(&stage);
            if replace_existing {
                stage.remove_transformers();
            }
            stage.add_shared(transformer.clone());
        });
    }

    fn add_rule(
        &self,
        pattern: ConfigurationPattern,
        methods: Option<Vec<Method>>,
        description: String,
        mutator: Rc<dyn Fn(&mut Configuration)>,
    ) {
        self.inner.assert_main_thread();
        let matcher = match pattern.compile(self.inner.base_url.as_ref()) {
            Ok(matcher) => matcher,
            Err(error) => {
                tracing::error!("Skipping configuration {}: {}", description, error);
                return;
            }
        };
        self.inner.config.add_rule(ConfigurationRule {
            description,
            matcher,
            methods,
            mutator,
        });
    }

    /// Force every resource to recompute its configuration on next use.
    ///
    /// Call this when state read by a configuration closure changes.
    pub fn invalidate_configuration(&self) {
        self.inner.config.invalidate();
    }

    // -- Resource management --

    /// Wipe every live resource matching `pattern`
    pub fn wipe_resources(&self, pattern: impl Into<ConfigurationPattern>) {
        let pattern = pattern.into();
        match pattern.compile(self.inner.base_url.as_ref()) {
            Ok(matcher) => self.wipe_resources_matching(|resource| matcher.matches(resource.url())),
            Err(error) => tracing::error!("Not wiping resources: {}", error),
        }
    }

    /// Wipe every live resource for which `predicate` returns true
    pub fn wipe_resources_matching(&self, predicate: impl Fn(&Resource) -> bool) {
        self.inner.assert_main_thread();
        for resource in self.inner.live_resources() {
            if predicate(&resource) {
                resource.wipe();
            }
        }
    }

    /// Wipe every live resource
    pub fn wipe_all_resources(&self) {
        self.wipe_resources_matching(|_| true);
    }

    /// Let the registry drop resources that are neither observed nor held
    /// elsewhere
    pub fn flush_unused_resources(&self) {
        self.inner.assert_main_thread();
        self.inner.flush_unused_resources();
    }

    /// Number of resources in the registry, including weakly held ones not
    /// yet pruned
    pub fn cached_resource_count(&self) -> usize {
        self.inner.resources.borrow().len()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // resources still held elsewhere keep working; they are only
        // no longer canonical
        self.inner.closed.set(true);
        let released = self.inner.resources.borrow_mut().drain();
        drop(released);
    }
}

/// Builder for creating a [`Service`]
pub struct ServiceBuilder {
    base_url: Option<String>,
    transport: Option<Rc<dyn Transport>>,
    transport_config: TransportConfig,
    use_default_transformers: bool,
    cached_resource_count_limit: usize,
}

impl ServiceBuilder {
    /// Create a new service builder
    pub fn new() -> Self {
        Self {
            base_url: None,
            transport: None,
            transport_config: TransportConfig::default(),
            use_default_transformers: true,
            cached_resource_count_limit: DEFAULT_CACHED_RESOURCE_COUNT_LIMIT,
        }
    }

    /// Set the base URL for relative resource paths
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Use a custom transport instead of the default one
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Rc::new(transport));
        self
    }

    /// Replace the default transport's configuration
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Set request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.transport_config.timeout = Some(timeout);
        self
    }

    /// Set user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.transport_config.user_agent = Some(user_agent.into());
        self
    }

    /// Add a default header sent by the transport on every request
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.transport_config
            .default_headers
            .get_or_insert_with(HeaderMap::new)
            .insert(name, value);
        self
    }

    /// Enable or disable cookies
    pub fn use_cookies(mut self, use_cookies: bool) -> Self {
        self.transport_config.use_cookies = Some(use_cookies);
        self
    }

    /// Set HTTP proxy
    pub fn http_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.transport_config.http_proxy = Some(proxy(host, port));
        self
    }

    /// Set HTTPS proxy
    pub fn https_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.transport_config.https_proxy = Some(proxy(host, port));
        self
    }

    /// Set SOCKS proxy
    pub fn socks_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.transport_config.socks_proxy = Some(proxy(host, port));
        self
    }

    /// Set authentication for every proxy configured so far
    pub fn proxy_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        let config = &mut self.transport_config;
        for proxy in [
            &mut config.http_proxy,
            &mut config.https_proxy,
            &mut config.socks_proxy,
        ]
        .into_iter()
        .flatten()
        {
            proxy.username = Some(username.clone());
            proxy.password = Some(password.clone());
        }
        self
    }

    /// Install the standard text and JSON transformers (default: true)
    pub fn use_default_transformers(mut self, enabled: bool) -> Self {
        self.use_default_transformers = enabled;
        self
    }

    /// Resource count above which unused resources are flushed (default:
    /// 100)
    pub fn cached_resource_count_limit(mut self, limit: usize) -> Self {
        self.cached_resource_count_limit = limit;
        self
    }

    /// Build the service
    pub fn build(self) -> Result<Service> {
        let base_url = match self.base_url {
            Some(raw) => {
                let normalized = if raw.ends_with('/') {
                    raw
                } else {
                    format!("{}/", raw)
                };
                let url = Url::parse(&normalized).map_err(|e| Error::InvalidUrl {
                    url: normalized.clone(),
                    message: e.to_string(),
                })?;
                Some(url)
            }
            None => None,
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(self.transport_config)?,
        };

        let mut base = Configuration::default();
        if self.use_default_transformers {
            base.pipeline = Pipeline::with_default_transformers();
        }

        tracing::debug!(
            "Creating service with base URL {:?}",
            base_url.as_ref().map(Url::as_str)
        );
        Ok(Service {
            inner: Rc::new(ServiceInner {
                main_thread: thread::current().id(),
                base_url,
                transport,
                config: ConfigStore::new(base),
                resources: RefCell::new(WeakCache::new(self.cached_resource_count_limit)),
                closed: Cell::new(false),
            }),
        })
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn proxy(host: impl Into<String>, port: u16) -> ProxyConfig {
    ProxyConfig {
        host: host.into(),
        port,
        username: None,
        password: None,
    }
}

#[cfg(feature = "backend-reqwest")]
fn default_transport(config: TransportConfig) -> Result<Rc<dyn Transport>> {
    Ok(Rc::new(crate::transport::ReqwestTransport::with_config(
        config,
    )?))
}

#[cfg(not(feature = "backend-reqwest"))]
fn default_transport(_config: TransportConfig) -> Result<Rc<dyn Transport>> {
    Err(Error::NoTransport)
}
