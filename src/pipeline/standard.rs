//! Standard transformers for text, JSON and typed models

use super::transformer::{
    ContentTransformer, ContentTypeFilter, InputTypeMismatchAction, ResponseTransformer,
};
use crate::charset::{self, DEFAULT_RESPONSE_CHARSET};
use crate::entity::{Json, Model, RawBytes, Text};
use crate::error::{Cause, RequestError};
use serde::{Deserialize, de::DeserializeOwned};

/// Decodes `text/*` bytes using the response charset (ISO-8859-1 if none)
pub fn text_transformer() -> impl ResponseTransformer + 'static {
    let decode = ContentTransformer::<RawBytes, Text>::new("text decoder", |bytes, entity| {
        let encoding = entity.charset().unwrap_or(DEFAULT_RESPONSE_CHARSET);
        match charset::decode(&bytes, encoding) {
            Some(text) => Ok(Some(text)),
            None => Err(Box::new(RequestError::with_message(
                "Cannot parse server response",
                Some(Cause::UndecodableText {
                    encoding: encoding.to_string(),
                }),
            ))),
        }
    })
    .on_input_type_mismatch(InputTypeMismatchAction::SkipIfOutputTypeMatches)
    .transform_errors(true);

    ContentTypeFilter::new(decode, &["text/*"])
}

/// Parses `*/json` and `*/*+json` bytes into a JSON value
pub fn json_transformer() -> impl ResponseTransformer + 'static {
    let parse = ContentTransformer::<RawBytes, Json>::new("JSON parser", |bytes, _| {
        Ok(Some(serde_json::from_slice(&bytes)?))
    })
    .on_input_type_mismatch(InputTypeMismatchAction::SkipIfOutputTypeMatches)
    .transform_errors(true);

    ContentTypeFilter::new(parse, &["*/json", "*/*+json"])
}

/// Deserializes parsed JSON into a model of type `T`.
///
/// Typically installed at the model stage through
/// [`Service::configure_transformer`](crate::Service::configure_transformer).
pub fn model_transformer<T>() -> ContentTransformer<Json, Model<T>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    ContentTransformer::<Json, Model<T>>::new(std::any::type_name::<T>(), |json, _| {
        Ok(Some(T::deserialize(&*json)?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use bytes::Bytes;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: u32,
    }

    #[test]
    fn test_text_uses_declared_charset() {
        let entity = Entity::new(Bytes::from_static(b"caf\xc3\xa9"), "text/plain; charset=utf-8");
        let text = text_transformer().process(Ok(entity)).unwrap();
        assert_eq!(text.content().as_text(), Some("caf\u{e9}"));

        let entity = Entity::new(Bytes::from_static(b"caf\xe9"), "text/plain");
        let text = text_transformer().process(Ok(entity)).unwrap();
        assert_eq!(text.content().as_text(), Some("caf\u{e9}"));
    }

    #[test]
    fn test_undecodable_text() {
        let entity = Entity::new(Bytes::from_static(b"\xff\xfe"), "text/plain; charset=utf-8");
        let error = text_transformer().process(Ok(entity)).unwrap_err();
        assert!(matches!(
            error.cause,
            Some(Cause::UndecodableText { ref encoding }) if encoding == "utf-8"
        ));
    }

    #[test]
    fn test_json_parsing_and_failure() {
        let entity = Entity::new(Bytes::from_static(b"{\"id\":7}"), "application/json");
        let json = json_transformer().process(Ok(entity)).unwrap();
        assert_eq!(json.content().as_json(), Some(&serde_json::json!({"id": 7})));

        let entity = Entity::new(Bytes::from_static(b"{nope"), "application/hal+json");
        let error = json_transformer().process(Ok(entity)).unwrap_err();
        assert!(matches!(error.cause, Some(Cause::Transformer { .. })));
    }

    #[test]
    fn test_model_from_json() {
        let entity = Entity::new(serde_json::json!({"id": 3}), "application/json");
        let model = model_transformer::<User>().process(Ok(entity)).unwrap();
        assert_eq!(model.content().as_model::<User>(), Some(&User { id: 3 }));
    }
}
