//! URL patterns selecting which resources a configuration rule applies to

use crate::error::{Error, Result};
use crate::resource::Resource;
use regex::Regex;
use std::fmt;
use std::rc::Rc;
use url::Url;

/// Selects the resources a configuration rule or wipe applies to
#[derive(Clone)]
pub enum ConfigurationPattern {
    /// Glob over the absolute URL, relative to the service base URL.
    ///
    /// `*` matches within one path segment, `**` across segments (and
    /// `/**/` also matches a single `/`), `?` matches one character other
    /// than `/`. Query strings are ignored.
    Glob(String),
    /// Exactly one URL
    Url(Url),
    /// Regex searched for in the absolute URL
    Regex(Regex),
    /// Arbitrary predicate over the absolute URL
    Predicate(Rc<dyn Fn(&Url) -> bool>),
}

impl ConfigurationPattern {
    /// Pattern from a predicate closure
    pub fn predicate(predicate: impl Fn(&Url) -> bool + 'static) -> Self {
        Self::Predicate(Rc::new(predicate))
    }

    /// Compile into a matcher, resolving globs against `base_url`
    pub(crate) fn compile(&self, base_url: Option<&Url>) -> Result<UrlMatcher> {
        let matcher = match self {
            Self::Glob(glob) => {
                let regex = glob_to_regex(glob, base_url);
                let regex = Regex::new(&regex).map_err(|e| Error::InvalidPattern {
                    pattern: glob.clone(),
                    message: e.to_string(),
                })?;
                UrlMatcher::Regex(regex)
            }
            Self::Url(url) => UrlMatcher::Exact(url.clone()),
            Self::Regex(regex) => UrlMatcher::Regex(regex.clone()),
            Self::Predicate(predicate) => UrlMatcher::Predicate(predicate.clone()),
        };
        Ok(matcher)
    }
}

impl fmt::Debug for ConfigurationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob(glob) => f.debug_tuple("Glob").field(glob).finish(),
            Self::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            Self::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            Self::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<&str> for ConfigurationPattern {
    fn from(glob: &str) -> Self {
        Self::Glob(glob.to_string())
    }
}

impl From<String> for ConfigurationPattern {
    fn from(glob: String) -> Self {
        Self::Glob(glob)
    }
}

impl From<Url> for ConfigurationPattern {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<&Resource> for ConfigurationPattern {
    fn from(resource: &Resource) -> Self {
        Self::Url(resource.url().clone())
    }
}

impl From<Regex> for ConfigurationPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

/// Compiled form of a [`ConfigurationPattern`]
#[derive(Clone)]
pub(crate) enum UrlMatcher {
    Exact(Url),
    Regex(Regex),
    Predicate(Rc<dyn Fn(&Url) -> bool>),
}

impl UrlMatcher {
    pub(crate) fn matches(&self, url: &Url) -> bool {
        match self {
            Self::Exact(expected) => expected == url,
            Self::Regex(regex) => regex.is_match(url.as_str()),
            Self::Predicate(predicate) => predicate(url),
        }
    }
}

/// Translate a glob into an anchored regex over absolute URLs
fn glob_to_regex(glob: &str, base_url: Option<&Url>) -> String {
    let resolved = match base_url {
        Some(base) if !glob.contains("://") => format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            glob.trim_start_matches('/')
        ),
        _ => glob.to_string(),
    };

    let pattern = regex::escape(&resolved)
        .replace(r"\*\*/", "([^:?]*/|)")
        .replace(r"\*\*", "[^:?]*")
        .replace(r"\*", "[^/:?]*")
        .replace(r"\?", "[^/:?]");

    format!("^{}($|\\?)", pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(glob: &str) -> UrlMatcher {
        let base = Url::parse("https://example.com/api/").unwrap();
        ConfigurationPattern::from(glob).compile(Some(&base)).unwrap()
    }

    fn matches(matcher: &UrlMatcher, url: &str) -> bool {
        matcher.matches(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let m = matcher("/foo/*/bar");
        assert!(matches(&m, "https://example.com/api/foo/1/bar"));
        assert!(!matches(&m, "https://example.com/api/foo/1/2/bar"));
        assert!(!matches(&m, "https://example.com/api/foo/bar"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let m = matcher("/foo/**/bar");
        assert!(matches(&m, "https://example.com/api/foo/bar"));
        assert!(matches(&m, "https://example.com/api/foo/1/bar"));
        assert!(matches(&m, "https://example.com/api/foo/1/2/bar"));
        assert!(!matches(&m, "https://example.com/api/foo/1/2/baz"));

        let m = matcher("/foo/**");
        assert!(matches(&m, "https://example.com/api/foo/"));
        assert!(matches(&m, "https://example.com/api/foo/a/b"));
    }

    #[test]
    fn test_question_mark_matches_one_character() {
        let m = matcher("/item?");
        assert!(matches(&m, "https://example.com/api/item1"));
        assert!(!matches(&m, "https://example.com/api/item12"));
        assert!(!matches(&m, "https://example.com/api/item/"));
    }

    #[test]
    fn test_query_string_ignored() {
        let m = matcher("/users/*");
        assert!(matches(&m, "https://example.com/api/users/7?expand=true"));
        assert!(!matches(&m, "https://example.com/api/users/7/posts?x=1"));
    }

    #[test]
    fn test_absolute_glob_ignores_base() {
        let m = matcher("https://other.org/**");
        assert!(matches(&m, "https://other.org/x/y"));
        assert!(!matches(&m, "https://example.com/api/x"));
    }

    #[test]
    fn test_glob_without_base_is_absolute() {
        let m = ConfigurationPattern::from("http://*.test/**")
            .compile(None)
            .unwrap();
        assert!(m.matches(&Url::parse("http://a.test/b").unwrap()));
    }

    #[test]
    fn test_glob_is_anchored() {
        let m = matcher("/users");
        assert!(!matches(&m, "https://example.com/api/users/7"));
        assert!(!matches(&m, "https://evil.com/?https://example.com/api/users"));
    }
}
