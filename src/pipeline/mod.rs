//! Response transformer pipeline
//!
//! A [`Pipeline`] is an ordered list of named [`PipelineStage`]s. Each stage
//! holds transformers, run in registration order, and optionally one
//! [`EntityCache`] that stores the content as it stood after that stage.
//! Every response runs through the pipeline exactly once, on a background
//! thread.

mod cache;
mod standard;
mod transformer;

pub use cache::EntityCache;
pub use standard::{json_transformer, model_transformer, text_transformer};
pub use transformer::{
    ContentTransformer, ContentTypeFilter, InputTypeMismatchAction, ResponseTransformer,
    TransformResult,
};

use crate::entity::Entity;
use crate::error::RequestError;
use crate::resource::Resource;
use cache::{CacheBox, CacheEntry, ErasedCache};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Outcome of a response as it moves through the pipeline
pub type Response = Result<Entity, RequestError>;

/// Name of a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey(Cow<'static, str>);

impl StageKey {
    /// Raw bytes, before any transformation
    pub const RAW_DATA: StageKey = StageKey(Cow::Borrowed("rawData"));
    /// Bytes to text or other decoded form
    pub const DECODING: StageKey = StageKey(Cow::Borrowed("decoding"));
    /// Decoded form to structured data such as JSON
    pub const PARSING: StageKey = StageKey(Cow::Borrowed("parsing"));
    /// Structured data to application models
    pub const MODEL: StageKey = StageKey(Cow::Borrowed("model"));
    /// Final adjustments, including error recovery
    pub const CLEANUP: StageKey = StageKey(Cow::Borrowed("cleanup"));

    /// A custom stage name
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// The stage name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One named stage: transformers plus an optional cache
#[derive(Clone, Default)]
pub struct PipelineStage {
    transformers: Vec<Arc<dyn ResponseTransformer>>,
    cache: Option<Arc<dyn ErasedCache>>,
}

impl PipelineStage {
    /// Append a transformer
    pub fn add(&mut self, transformer: impl ResponseTransformer + 'static) -> &mut Self {
        self.add_shared(Arc::new(transformer))
    }

    /// Append a transformer that only runs for matching content types
    pub fn add_for_content_types(
        &mut self,
        content_types: &[&str],
        transformer: impl ResponseTransformer + 'static,
    ) -> &mut Self {
        self.add(ContentTypeFilter::new(transformer, content_types))
    }

    /// Append an already shared transformer
    pub fn add_shared(&mut self, transformer: Arc<dyn ResponseTransformer>) -> &mut Self {
        self.transformers.push(transformer);
        self
    }

    /// Remove every transformer from this stage
    pub fn remove_transformers(&mut self) -> &mut Self {
        self.transformers.clear();
        self
    }

    /// Store this stage's output in `cache`, replacing any previous cache
    pub fn cache_using<C: EntityCache>(&mut self, cache: C) -> &mut Self {
        self.cache = Some(Arc::new(CacheBox(Arc::new(cache))));
        self
    }

    /// Remove this stage's cache
    pub fn do_not_cache(&mut self) -> &mut Self {
        self.cache = None;
        self
    }

    /// Number of transformers in this stage
    pub fn transformer_count(&self) -> usize {
        self.transformers.len()
    }

    /// Whether this stage has a cache
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    fn process(&self, response: Response) -> Response {
        self.transformers
            .iter()
            .fold(response, |response, transformer| {
                tracing::trace!("Applying transformer {}", transformer.description());
                transformer.process(response)
            })
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field(
                "transformers",
                &self
                    .transformers
                    .iter()
                    .map(|t| t.description())
                    .collect::<Vec<_>>(),
            )
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

/// Ordered set of stages every response passes through
#[derive(Clone, Debug)]
pub struct Pipeline {
    order: Vec<StageKey>,
    stages: HashMap<StageKey, PipelineStage>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            order: vec![
                StageKey::RAW_DATA,
                StageKey::DECODING,
                StageKey::PARSING,
                StageKey::MODEL,
                StageKey::CLEANUP,
            ],
            stages: HashMap::new(),
        }
    }
}

/// Work to run on a background thread, yielding the processed response
pub(crate) type Processor = Box<dyn FnOnce() -> Response + Send>;

/// Work to run on a background thread, yielding a cached entity if any
pub(crate) type CacheLoader = Box<dyn FnOnce() -> Option<Entity> + Send>;

type StageRun = (PipelineStage, Option<Box<dyn CacheEntry>>);

impl Pipeline {
    /// An empty pipeline with the standard stage order
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline: text and JSON decoding at the parsing stage
    pub fn with_default_transformers() -> Self {
        let mut pipeline = Self::default();
        pipeline
            .stage_mut(&StageKey::PARSING)
            .add(text_transformer())
            .add(json_transformer());
        pipeline
    }

    /// The stage order
    pub fn order(&self) -> &[StageKey] {
        &self.order
    }

    /// Replace the stage order. Stages left out keep their contents but
    /// stop running.
    pub fn set_order(&mut self, order: Vec<StageKey>) {
        self.order = order;
    }

    /// A stage, if it has been touched
    pub fn stage(&self, key: &StageKey) -> Option<&PipelineStage> {
        self.stages.get(key)
    }

    /// A stage for modification, created empty if needed
    pub fn stage_mut(&mut self, key: &StageKey) -> &mut PipelineStage {
        if !self.order.contains(key) {
            tracing::warn!(
                "Pipeline stage {} is not in the stage order and will not run",
                key
            );
        }
        self.stages.entry(key.clone()).or_default()
    }

    /// Remove every transformer from every stage
    pub fn remove_all_transformers(&mut self) {
        for stage in self.stages.values_mut() {
            stage.remove_transformers();
        }
    }

    /// Remove every cache from every stage
    pub fn remove_all_caches(&mut self) {
        for stage in self.stages.values_mut() {
            stage.do_not_cache();
        }
    }

    fn ordered_stages(&self) -> impl Iterator<Item = &PipelineStage> {
        self.order.iter().filter_map(|key| self.stages.get(key))
    }

    /// Stage contents paired with their cache entries for `resource`.
    ///
    /// Cache keys are computed here, on the main thread.
    fn stage_runs(&self, resource: &Resource) -> Vec<StageRun> {
        self.ordered_stages()
            .map(|stage| {
                let entry = stage.cache.as_ref().and_then(|cache| cache.entry(resource));
                (stage.clone(), entry)
            })
            .collect()
    }

    fn cache_entries(&self, resource: &Resource) -> Vec<Box<dyn CacheEntry>> {
        self.ordered_stages()
            .filter_map(|stage| stage.cache.as_ref()?.entry(resource))
            .collect()
    }

    /// Build the work that turns `raw` into the final response for
    /// `resource`, writing each stage's output to that stage's cache.
    pub(crate) fn make_processor(&self, raw: Response, resource: &Resource) -> Processor {
        let runs = self.stage_runs(resource);
        Box::new(move || process_and_cache(raw, &runs))
    }

    /// Build the work that looks for a cached entity for `resource`.
    ///
    /// Caches are searched from the last stage backwards; a hit is run
    /// through the stages after the one it came from. Returns `None` when no
    /// stage has a cache that accepts the resource.
    pub(crate) fn cached_entity_loader(&self, resource: &Resource) -> Option<CacheLoader> {
        let runs = self.stage_runs(resource);
        if runs.iter().all(|(_, entry)| entry.is_none()) {
            return None;
        }

        Some(Box::new(move || {
            for (index, (_, entry)) in runs.iter().enumerate().rev() {
                let Some(entry) = entry else { continue };
                let Some(entity) = entry.read() else { continue };

                tracing::debug!("Cache hit at stage {}", index);
                return match process_and_cache(Ok(entity), &runs[index + 1..]) {
                    Ok(entity) => Some(entity),
                    Err(error) => {
                        tracing::warn!("Cached entity could not be processed: {}", error);
                        None
                    }
                };
            }
            tracing::debug!("No cached entity found");
            None
        }))
    }

    /// Refresh cached timestamps after the server confirmed the data
    pub(crate) fn update_cache_timestamps(&self, resource: &Resource, timestamp: Instant) {
        let entries = self.cache_entries(resource);
        if entries.is_empty() {
            return;
        }
        tokio::task::spawn_blocking(move || {
            for entry in entries {
                entry.update_timestamp(timestamp);
            }
        });
    }

    /// Remove `resource` from every cache
    pub(crate) fn remove_cache_entries(&self, resource: &Resource) {
        let entries = self.cache_entries(resource);
        if entries.is_empty() {
            return;
        }
        tokio::task::spawn_blocking(move || {
            for entry in entries {
                entry.remove();
            }
        });
    }
}

fn process_and_cache(mut response: Response, runs: &[StageRun]) -> Response {
    for (stage, entry) in runs {
        response = stage.process(response);
        if let (Ok(entity), Some(entry)) = (&response, entry) {
            tracing::trace!("Caching entity");
            entry.write(entity);
        }
    }
    response
}
