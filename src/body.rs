//! Request body types

use crate::charset;
use crate::error::{Cause, RequestError};
use bytes::Bytes;
use http::HeaderValue;
use std::borrow::Cow;
use std::sync::Arc;

/// Request body types
#[derive(Debug, Clone, Default)]
pub enum Body {
    /// Empty body
    #[default]
    Empty,

    /// Raw bytes with content type
    Bytes {
        /// The content
        content: Bytes,
        /// Content type
        content_type: String,
    },

    /// Text, encoded on send
    Text {
        /// The text
        text: String,
        /// Content type, without the charset parameter
        content_type: String,
        /// Charset to encode with
        charset: String,
    },

    /// Form-encoded data
    Form {
        /// Form fields
        fields: Vec<(Cow<'static, str>, Cow<'static, str>)>,
    },

    /// JSON data
    Json {
        /// JSON value
        value: serde_json::Value,
    },
}

impl Body {
    /// Create an empty body
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Create a body from bytes
    pub fn bytes(content: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self::Bytes {
            content: content.into(),
            content_type: content_type.into(),
        }
    }

    /// Create a UTF-8 `text/plain` body
    pub fn text(content: impl Into<String>) -> Self {
        Self::text_with(content, "text/plain", "utf-8")
    }

    /// Create a text body with an explicit content type and charset
    pub fn text_with(
        content: impl Into<String>,
        content_type: impl Into<String>,
        charset: impl Into<String>,
    ) -> Self {
        Self::Text {
            text: content.into(),
            content_type: content_type.into(),
            charset: charset.into(),
        }
    }

    /// Create a form body
    pub fn form(fields: Vec<(impl Into<Cow<'static, str>>, impl Into<Cow<'static, str>>)>) -> Self {
        Self::Form {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Create a JSON body.
    ///
    /// Fails with [`Cause::JsonEncoding`] if `value` cannot be serialized.
    pub fn json(value: impl serde::Serialize) -> Result<Self, RequestError> {
        let value = serde_json::to_value(value)
            .map_err(|e| RequestError::from_cause(Cause::JsonEncoding(Arc::new(e))))?;
        Ok(Self::Json { value })
    }

    /// Encode the body into bytes and the `Content-Type` to send with them.
    ///
    /// Returns `None` for an empty body.
    pub(crate) fn encode(&self) -> Result<Option<(Bytes, HeaderValue)>, RequestError> {
        let (bytes, content_type) = match self {
            Self::Empty => return Ok(None),
            Self::Bytes {
                content,
                content_type,
            } => (content.clone(), content_type.clone()),
            Self::Text {
                text,
                content_type,
                charset,
            } => {
                let bytes = charset::encode(text, charset).ok_or_else(|| {
                    RequestError::from_cause(Cause::UnencodableText {
                        encoding: charset.clone(),
                        text: text.clone(),
                    })
                })?;
                (bytes, format!("{}; charset={}", content_type, charset))
            }
            Self::Form { fields } => {
                let form_data = fields
                    .iter()
                    .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                    .collect::<Vec<_>>()
                    .join("&");
                (
                    Bytes::from(form_data),
                    "application/x-www-form-urlencoded".to_string(),
                )
            }
            Self::Json { value } => {
                let json_bytes = serde_json::to_vec(value)
                    .map_err(|e| RequestError::from_cause(Cause::JsonEncoding(Arc::new(e))))?;
                (Bytes::from(json_bytes), "application/json".to_string())
            }
        };

        let content_type = HeaderValue::try_from(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        Ok(Some((bytes, content_type)))
    }
}

// Convenience From implementations
impl From<String> for Body {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for Body {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

impl From<Vec<u8>> for Body {
    fn from(content: Vec<u8>) -> Self {
        Self::bytes(content, "application/octet-stream")
    }
}

impl From<Bytes> for Body {
    fn from(content: Bytes) -> Self {
        Self::bytes(content, "application/octet-stream")
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::Json { value }
    }
}
