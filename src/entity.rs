//! Entities: immutable snapshots of resource content

use crate::charset;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, ETAG};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content carried by an [`Entity`].
///
/// Raw responses start out as [`Content::Bytes`]; pipeline transformers turn
/// them into text, JSON or an application model. Every variant is cheap to
/// clone.
#[derive(Clone)]
pub enum Content {
    /// Raw bytes as received
    Bytes(Bytes),
    /// Decoded text
    Text(Arc<str>),
    /// Parsed JSON
    Json(Arc<serde_json::Value>),
    /// Application model produced by a transformer
    Model {
        /// The model value
        value: Arc<dyn Any + Send + Sync>,
        /// Type name of the model, for diagnostics
        type_name: &'static str,
    },
}

/// Kind of [`Content`], used in type mismatch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Raw bytes
    Bytes,
    /// Text
    Text,
    /// JSON value
    Json,
    /// Application model of the named type
    Model(&'static str),
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes => f.write_str("bytes"),
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("JSON"),
            Self::Model(name) => f.write_str(name),
        }
    }
}

impl Content {
    /// Wrap an application model
    pub fn model<T: Any + Send + Sync>(value: T) -> Self {
        Self::Model {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// The kind of this content
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Bytes(_) => ContentKind::Bytes,
            Self::Text(_) => ContentKind::Text,
            Self::Json(_) => ContentKind::Json,
            Self::Model { type_name, .. } => ContentKind::Model(*type_name),
        }
    }

    /// Raw bytes, if this is byte content
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Text, if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// JSON value, if this is JSON content
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Model of type `T`, if this content holds one
    pub fn as_model<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Model { value, .. } => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Shared handle to a model of type `T`, if this content holds one
    pub fn model_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Model { value, .. } => value.clone().downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Model { type_name, .. } => f.debug_tuple("Model").field(type_name).finish(),
        }
    }
}

impl From<Bytes> for Content {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text.into())
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.into())
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(Arc::new(value))
    }
}

/// Static description of one kind of [`Content`].
///
/// Transformers are declared in terms of these markers: the input marker
/// says what they accept, the output marker what they produce.
pub trait ContentType: 'static {
    /// Cheap handle to content of this type
    type Value: Clone + Send + Sync + 'static;
    /// Owned value a transformer produces
    type Output: Send + Sync + 'static;

    /// The kind reported in mismatch errors
    fn kind() -> ContentKind;
    /// Borrow content of this type, if `content` is one
    fn extract(content: &Content) -> Option<Self::Value>;
    /// Wrap a produced value as content
    fn wrap(output: Self::Output) -> Content;
}

/// Raw byte content
#[derive(Debug, Clone, Copy)]
pub struct RawBytes;

/// Text content
#[derive(Debug, Clone, Copy)]
pub struct Text;

/// JSON content
#[derive(Debug, Clone, Copy)]
pub struct Json;

/// Application model content of type `T`
pub struct Model<T>(PhantomData<fn() -> T>);

impl ContentType for RawBytes {
    type Value = Bytes;
    type Output = Bytes;

    fn kind() -> ContentKind {
        ContentKind::Bytes
    }

    fn extract(content: &Content) -> Option<Bytes> {
        content.as_bytes().cloned()
    }

    fn wrap(output: Bytes) -> Content {
        Content::Bytes(output)
    }
}

impl ContentType for Text {
    type Value = Arc<str>;
    type Output = String;

    fn kind() -> ContentKind {
        ContentKind::Text
    }

    fn extract(content: &Content) -> Option<Arc<str>> {
        match content {
            Content::Text(text) => Some(text.clone()),
            _ => None,
        }
    }

    fn wrap(output: String) -> Content {
        Content::Text(output.into())
    }
}

impl ContentType for Json {
    type Value = Arc<serde_json::Value>;
    type Output = serde_json::Value;

    fn kind() -> ContentKind {
        ContentKind::Json
    }

    fn extract(content: &Content) -> Option<Arc<serde_json::Value>> {
        match content {
            Content::Json(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn wrap(output: serde_json::Value) -> Content {
        Content::Json(Arc::new(output))
    }
}

impl<T: Any + Send + Sync> ContentType for Model<T> {
    type Value = Arc<T>;
    type Output = T;

    fn kind() -> ContentKind {
        ContentKind::Model(type_name::<T>())
    }

    fn extract(content: &Content) -> Option<Arc<T>> {
        content.model_arc::<T>()
    }

    fn wrap(output: T) -> Content {
        Content::model(output)
    }
}

/// Immutable snapshot of a resource's content plus response metadata
#[derive(Debug, Clone)]
pub struct Entity {
    content: Content,
    headers: HeaderMap,
    charset: Option<String>,
    timestamp: Instant,
}

impl Entity {
    /// Create an entity with the given content and `Content-Type`
    pub fn new(content: impl Into<Content>, content_type: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        Self {
            content: content.into(),
            charset: charset::parse_charset(content_type),
            headers,
            timestamp: Instant::now(),
        }
    }

    /// Create a raw entity from a server response
    pub fn from_response(headers: HeaderMap, body: Bytes) -> Self {
        let charset = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(charset::parse_charset);
        Self {
            content: Content::Bytes(body),
            headers,
            charset,
            timestamp: Instant::now(),
        }
    }

    /// The content
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Content of the given type, if the entity holds one
    pub fn typed_content<C: ContentType>(&self) -> Option<C::Value> {
        C::extract(&self.content)
    }

    /// All response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header as a string; names are case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The `Content-Type`, defaulting to `application/octet-stream`
    pub fn content_type(&self) -> &str {
        self.header(CONTENT_TYPE.as_str())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// The declared charset, if any
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// The `ETag` header, if present
    pub fn etag(&self) -> Option<&str> {
        self.header(ETAG.as_str())
    }

    /// When this entity was received or last confirmed fresh
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// The same metadata with different content
    pub fn with_content(&self, content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            headers: self.headers.clone(),
            charset: self.charset.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Add or replace a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name == CONTENT_TYPE {
            self.charset = value.to_str().ok().and_then(charset::parse_charset);
        }
        self.headers.insert(name, value);
        self
    }

    /// Replace the timestamp
    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A copy whose timestamp is now
    pub fn touched(&self) -> Self {
        self.clone().with_timestamp(Instant::now())
    }
}
