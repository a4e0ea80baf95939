//! Text encodings understood by request bodies and the text transformer

use bytes::Bytes;

/// Charset assumed when a response declares none
pub(crate) const DEFAULT_RESPONSE_CHARSET: &str = "iso-8859-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charset {
    Utf8,
    Ascii,
    Latin1,
}

impl Charset {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "us-ascii" | "ascii" => Some(Self::Ascii),
            "iso-8859-1" | "latin1" | "latin-1" | "iso_8859-1" => Some(Self::Latin1),
            _ => None,
        }
    }
}

/// Encode `text` in the named charset.
///
/// Returns `None` when the charset is unknown or the text contains characters
/// it cannot represent.
pub(crate) fn encode(text: &str, charset: &str) -> Option<Bytes> {
    match Charset::from_name(charset)? {
        Charset::Utf8 => Some(Bytes::copy_from_slice(text.as_bytes())),
        Charset::Ascii => text
            .is_ascii()
            .then(|| Bytes::copy_from_slice(text.as_bytes())),
        Charset::Latin1 => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from),
    }
}

/// Decode `bytes` from the named charset, or `None` if they are not valid in it
pub(crate) fn decode(bytes: &[u8], charset: &str) -> Option<String> {
    match Charset::from_name(charset)? {
        Charset::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
        Charset::Ascii => bytes
            .is_ascii()
            .then(|| String::from_utf8_lossy(bytes).into_owned()),
        Charset::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Extract the `charset` parameter from a `Content-Type` header value
pub(crate) fn parse_charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_ascii_lowercase())
        } else {
            None
        }
    })
}
