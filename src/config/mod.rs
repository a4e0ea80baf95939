//! Per-resource, per-method configuration
//!
//! A [`Configuration`] is computed for each (resource, method) pair by
//! starting from the service default and applying every matching rule in
//! the order the rules were registered. Results are cached on the resource
//! and recomputed lazily after [`Service::invalidate_configuration`].
//!
//! [`Service::invalidate_configuration`]: crate::Service::invalidate_configuration

mod pattern;

pub use pattern::ConfigurationPattern;
pub(crate) use pattern::UrlMatcher;

use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::resource::Resource;
use crate::transport::TransportRequest;
use http::header::IntoHeaderName;
use http::{HeaderMap, HeaderValue, Method};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use url::Url;

/// Closure that adjusts an outgoing request
pub type RequestMutation = Rc<dyn Fn(&mut TransportRequest)>;

/// Closure that wraps a newly created request
pub type RequestDecorator = Rc<dyn Fn(&Resource, Request) -> Request>;

/// Settings governing one resource for one HTTP method
#[derive(Clone)]
pub struct Configuration {
    /// How long data stays fresh for `load_if_needed`
    pub expiration_time: Duration,
    /// How long after an error `load_if_needed` waits before retrying
    pub retry_time: Duration,
    /// How often request progress is reported
    pub progress_reporting_interval: Duration,
    /// Headers added to every request
    pub headers: HeaderMap,
    /// Response processing pipeline
    pub pipeline: Pipeline,
    request_mutations: Vec<RequestMutation>,
    request_decorators: Vec<RequestDecorator>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            expiration_time: Duration::from_secs(30),
            retry_time: Duration::from_secs(1),
            progress_reporting_interval: Duration::from_millis(50),
            headers: HeaderMap::new(),
            pipeline: Pipeline::default(),
            request_mutations: Vec::new(),
            request_decorators: Vec::new(),
        }
    }
}

impl Configuration {
    /// Set a header, replacing any previous value
    pub fn set_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Adjust every request built under this configuration.
    ///
    /// Mutations run each time the underlying request is built, including
    /// when a request is repeated.
    pub fn mutate_requests(&mut self, mutation: impl Fn(&mut TransportRequest) + 'static) {
        self.request_mutations.push(Rc::new(mutation));
    }

    /// Wrap every request created under this configuration.
    ///
    /// Decorators run once per request, never on repeats.
    pub fn decorate_requests(
        &mut self,
        decorator: impl Fn(&Resource, Request) -> Request + 'static,
    ) {
        self.request_decorators.push(Rc::new(decorator));
    }

    /// Drop every request mutation
    pub fn remove_request_mutations(&mut self) {
        self.request_mutations.clear();
    }

    /// Drop every request decorator
    pub fn remove_request_decorators(&mut self) {
        self.request_decorators.clear();
    }

    pub(crate) fn request_mutations(&self) -> &[RequestMutation] {
        &self.request_mutations
    }

    pub(crate) fn request_decorators(&self) -> &[RequestDecorator] {
        &self.request_decorators
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("expiration_time", &self.expiration_time)
            .field("retry_time", &self.retry_time)
            .field(
                "progress_reporting_interval",
                &self.progress_reporting_interval,
            )
            .field("headers", &self.headers)
            .field("pipeline", &self.pipeline)
            .field("request_mutations", &self.request_mutations.len())
            .field("request_decorators", &self.request_decorators.len())
            .finish()
    }
}

/// One registered configuration rule
pub(crate) struct ConfigurationRule {
    pub(crate) description: String,
    pub(crate) matcher: UrlMatcher,
    pub(crate) methods: Option<Vec<Method>>,
    pub(crate) mutator: Rc<dyn Fn(&mut Configuration)>,
}

impl ConfigurationRule {
    fn applies(&self, url: &Url, method: &Method) -> bool {
        self.methods
            .as_ref()
            .is_none_or(|methods| methods.contains(method))
            && self.matcher.matches(url)
    }
}

/// Ordered rule list plus the version counter that invalidates cached
/// configurations
pub(crate) struct ConfigStore {
    base: Configuration,
    rules: RefCell<Vec<Rc<ConfigurationRule>>>,
    version: Cell<u64>,
}

impl ConfigStore {
    pub(crate) fn new(base: Configuration) -> Self {
        Self {
            base,
            rules: RefCell::new(Vec::new()),
            version: Cell::new(0),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.get()
    }

    pub(crate) fn add_rule(&self, rule: ConfigurationRule) {
        tracing::debug!("Adding configuration: {}", rule.description);
        self.rules.borrow_mut().push(Rc::new(rule));
        self.invalidate();
    }

    pub(crate) fn invalidate(&self) {
        self.version.set(self.version.get() + 1);
        tracing::debug!("Configurations invalidated (version {})", self.version.get());
    }

    /// Fold every matching rule, in registration order, into the default
    pub(crate) fn compute(&self, url: &Url, method: &Method) -> Configuration {
        // rules may register more rules while running
        let rules = self.rules.borrow().clone();

        let mut config = self.base.clone();
        for rule in rules.iter().filter(|rule| rule.applies(url, method)) {
            tracing::trace!("Applying config {} to {} {}", rule.description, method, url);
            (rule.mutator)(&mut config);
        }
        tracing::debug!("Computed configuration for {} {}", method, url);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(glob: &str, methods: Option<Vec<Method>>, value: &'static str) -> ConfigurationRule {
        let base = Url::parse("https://example.com/").unwrap();
        ConfigurationRule {
            description: value.to_string(),
            matcher: ConfigurationPattern::from(glob).compile(Some(&base)).unwrap(),
            methods,
            mutator: Rc::new(move |config: &mut Configuration| {
                config.set_header("x-rule", HeaderValue::from_static(value));
            }),
        }
    }

    fn header(config: &Configuration) -> Option<&str> {
        config.headers.get("x-rule").and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_rules_apply_in_registration_order() {
        let url = Url::parse("https://example.com/users/1").unwrap();

        let store = ConfigStore::new(Configuration::default());
        store.add_rule(rule("**", None, "A"));
        store.add_rule(rule("/users/*", None, "B"));
        assert_eq!(header(&store.compute(&url, &Method::GET)), Some("B"));

        let store = ConfigStore::new(Configuration::default());
        store.add_rule(rule("/users/*", None, "B"));
        store.add_rule(rule("**", None, "A"));
        assert_eq!(header(&store.compute(&url, &Method::GET)), Some("A"));
    }

    #[test]
    fn test_method_filter() {
        let url = Url::parse("https://example.com/users/1").unwrap();
        let store = ConfigStore::new(Configuration::default());
        store.add_rule(rule("**", Some(vec![Method::POST]), "post-only"));

        assert_eq!(header(&store.compute(&url, &Method::GET)), None);
        assert_eq!(
            header(&store.compute(&url, &Method::POST)),
            Some("post-only")
        );
    }

    #[test]
    fn test_add_rule_bumps_version() {
        let store = ConfigStore::new(Configuration::default());
        let before = store.version();
        store.add_rule(rule("**", None, "A"));
        assert!(store.version() > before);
        store.invalidate();
        assert_eq!(store.version(), before + 2);
    }
}
