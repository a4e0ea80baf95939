//! Response transformers

use super::Response;
use crate::entity::{ContentType, Entity};
use crate::error::{Cause, RequestError};
use regex::{Regex, RegexBuilder};
use std::marker::PhantomData;
use std::sync::Arc;

/// One step of a pipeline stage.
///
/// A transformer sees every response that reaches its stage, successful or
/// not, and may turn a success into a failure or the other way round.
/// Transformers run on a background thread.
pub trait ResponseTransformer: Send + Sync {
    /// Transform a response
    fn process(&self, response: Response) -> Response;

    /// Name used in logs and error causes
    fn description(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// What a [`ContentTransformer`] does with content it cannot accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputTypeMismatchAction {
    /// Fail the response with [`Cause::WrongInputType`]
    #[default]
    Error,
    /// Pass the response through unchanged
    Skip,
    /// Pass through if the content already has the output type, else fail
    SkipIfOutputTypeMatches,
}

/// Result of a content transformation closure.
///
/// `Ok(None)` means the closure produced nothing, which fails the response.
/// An error that is itself a [`RequestError`] is passed through as is; any
/// other error is wrapped in [`Cause::Transformer`].
pub type TransformResult<T> = Result<Option<T>, Box<dyn std::error::Error + Send + Sync>>;

type Processor<In, Out> = dyn Fn(
        <In as ContentType>::Value,
        &Entity,
    ) -> TransformResult<<Out as ContentType>::Output>
    + Send
    + Sync;

/// Transformer that converts content of one type into another
pub struct ContentTransformer<In: ContentType, Out: ContentType> {
    name: String,
    processor: Box<Processor<In, Out>>,
    mismatch_action: InputTypeMismatchAction,
    transform_errors: bool,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In: ContentType, Out: ContentType> ContentTransformer<In, Out> {
    /// Create a transformer from a closure over the typed content
    pub fn new<F>(name: impl Into<String>, processor: F) -> Self
    where
        F: Fn(In::Value, &Entity) -> TransformResult<Out::Output> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            processor: Box::new(processor),
            mismatch_action: InputTypeMismatchAction::default(),
            transform_errors: false,
            _types: PhantomData,
        }
    }

    /// Set what happens when the content is not of the input type
    pub fn on_input_type_mismatch(mut self, action: InputTypeMismatchAction) -> Self {
        self.mismatch_action = action;
        self
    }

    /// Also transform the entity attached to failures, such as error bodies
    pub fn transform_errors(mut self, transform_errors: bool) -> Self {
        self.transform_errors = transform_errors;
        self
    }

    fn process_entity(&self, entity: Entity) -> Response {
        let Some(input) = In::extract(entity.content()) else {
            return self.input_type_mismatch(entity);
        };

        match (self.processor)(input, &entity) {
            Ok(Some(output)) => Ok(entity.with_content(Out::wrap(output))),
            Ok(None) => Err(RequestError::with_message(
                "Cannot parse server response",
                Some(Cause::TransformerReturnedNothing {
                    transformer: self.name.clone(),
                }),
            )),
            Err(error) => match error.downcast::<RequestError>() {
                Ok(error) => Err(*error),
                Err(error) => Err(RequestError::with_message(
                    "Cannot parse server response",
                    Some(Cause::Transformer {
                        transformer: self.name.clone(),
                        source: Arc::from(error),
                    }),
                )),
            },
        }
    }

    fn input_type_mismatch(&self, entity: Entity) -> Response {
        let skip = match self.mismatch_action {
            InputTypeMismatchAction::Error => false,
            InputTypeMismatchAction::Skip => true,
            InputTypeMismatchAction::SkipIfOutputTypeMatches => {
                Out::extract(entity.content()).is_some()
            }
        };

        if skip {
            tracing::trace!(
                "{} skipping {} content",
                self.name,
                entity.content().kind()
            );
            return Ok(entity);
        }

        Err(RequestError::with_message(
            "Cannot parse server response",
            Some(Cause::WrongInputType {
                transformer: self.name.clone(),
                expected: In::kind().to_string(),
                actual: entity.content().kind().to_string(),
            }),
        ))
    }
}

impl<In: ContentType, Out: ContentType> ResponseTransformer for ContentTransformer<In, Out> {
    fn process(&self, response: Response) -> Response {
        match response {
            Ok(entity) => self.process_entity(entity),
            Err(mut error) => {
                if !self.transform_errors {
                    return Err(error);
                }
                if let Some(entity) = error.entity.take() {
                    match self.process_entity(entity.clone()) {
                        Ok(transformed) => error.entity = Some(transformed),
                        Err(nested) => {
                            tracing::debug!(
                                "{} could not transform error body: {}",
                                self.name,
                                nested
                            );
                            error.entity = Some(entity);
                        }
                    }
                }
                Err(error)
            }
        }
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

/// Runs a transformer only for responses whose `Content-Type` matches.
///
/// Patterns are MIME types where `*` stands for one type or subtype token,
/// such as `text/*` or `application/*+json`. Matching is case-insensitive
/// and ignores parameters. Failures are checked against the content type of
/// their error body.
pub struct ContentTypeFilter<T> {
    inner: T,
    pattern: Regex,
    content_types: Vec<String>,
}

impl<T: ResponseTransformer> ContentTypeFilter<T> {
    /// Wrap `inner` so it only sees the given content types
    pub fn new(inner: T, content_types: &[&str]) -> Self {
        let alternatives = content_types
            .iter()
            .map(|content_type| regex::escape(content_type).replace(r"\*", "[^/+]+"))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&format!("^(?:{})($|;)", alternatives))
            .case_insensitive(true)
            .build()
            .expect("escaped content type patterns are valid regexes");

        Self {
            inner,
            pattern,
            content_types: content_types.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn matches(&self, content_type: Option<&str>) -> bool {
        content_type.is_some_and(|content_type| self.pattern.is_match(content_type))
    }
}

impl<T: ResponseTransformer> ResponseTransformer for ContentTypeFilter<T> {
    fn process(&self, response: Response) -> Response {
        let content_type = match &response {
            Ok(entity) => Some(entity.content_type()),
            Err(error) => error.entity.as_ref().map(Entity::content_type),
        };

        if self.matches(content_type) {
            self.inner.process(response)
        } else {
            response
        }
    }

    fn description(&self) -> String {
        format!(
            "{} ⟨{}⟩",
            self.inner.description(),
            self.content_types.join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Json, RawBytes, Text};
    use bytes::Bytes;

    fn upper() -> ContentTransformer<Text, Text> {
        ContentTransformer::new("upper", |text: Arc<str>, _: &Entity| {
            Ok(Some(text.to_uppercase()))
        })
    }

    #[test]
    fn test_transforms_matching_input() {
        let response = upper().process(Ok(Entity::new("hi", "text/plain")));
        assert_eq!(response.unwrap().content().as_text(), Some("HI"));
    }

    #[test]
    fn test_mismatch_actions() {
        let bytes = || Ok(Entity::new(Bytes::from_static(b"hi"), "text/plain"));

        let error = upper().process(bytes()).unwrap_err();
        assert!(matches!(error.cause, Some(Cause::WrongInputType { .. })));
        assert_eq!(error.user_message, "Cannot parse server response");

        let skipped = upper()
            .on_input_type_mismatch(InputTypeMismatchAction::Skip)
            .process(bytes())
            .unwrap();
        assert!(skipped.content().as_bytes().is_some());

        let to_text = ContentTransformer::<RawBytes, Text>::new("decode", |_, _| {
            Ok(Some("x".to_string()))
        })
        .on_input_type_mismatch(InputTypeMismatchAction::SkipIfOutputTypeMatches);
        let already_text = to_text.process(Ok(Entity::new("hi", "text/plain"))).unwrap();
        assert_eq!(already_text.content().as_text(), Some("hi"));
        let json = Entity::new(serde_json::json!(1), "application/json");
        assert!(to_text.process(Ok(json)).is_err());
    }

    #[test]
    fn test_returned_nothing_is_failure() {
        let nothing =
            ContentTransformer::<Text, Json>::new("nothing", |_, _| Ok(None));
        let error = nothing.process(Ok(Entity::new("hi", "text/plain"))).unwrap_err();
        assert!(matches!(
            error.cause,
            Some(Cause::TransformerReturnedNothing { ref transformer }) if transformer == "nothing"
        ));
    }

    #[test]
    fn test_request_error_passes_through() {
        let strict = ContentTransformer::<Text, Text>::new("strict", |_, _| {
            Err(Box::new(RequestError::with_message("Nope", None)))
        });
        let error = strict.process(Ok(Entity::new("hi", "text/plain"))).unwrap_err();
        assert_eq!(error.user_message, "Nope");
    }

    #[test]
    fn test_errors_only_transformed_when_enabled() {
        let failure = || {
            Err(RequestError::from_status(
                http::StatusCode::BAD_REQUEST,
                Some(Entity::new("bad", "text/plain")),
            ))
        };

        let untouched = upper().process(failure()).unwrap_err();
        assert_eq!(untouched.entity.unwrap().content().as_text(), Some("bad"));

        let transformed = upper().transform_errors(true).process(failure()).unwrap_err();
        assert_eq!(transformed.entity.unwrap().content().as_text(), Some("BAD"));
    }

    #[test]
    fn test_content_type_filter() {
        let filter = ContentTypeFilter::new(upper(), &["text/*", "*/*+json"]);
        assert!(filter.matches(Some("text/plain")));
        assert!(filter.matches(Some("TEXT/HTML; charset=utf-8")));
        assert!(filter.matches(Some("application/vnd.api+json")));
        assert!(!filter.matches(Some("application/json")));
        assert!(!filter.matches(Some("text/plain/extra")));
        assert!(!filter.matches(None));

        let json = Entity::new("hi", "application/octet-stream");
        let response = filter.process(Ok(json)).unwrap();
        assert_eq!(response.content().as_text(), Some("hi"));
    }
}
