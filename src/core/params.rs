//! Multi-valued URL query parameters.

use crate::error::{MortarError, Result};

/// Decoded `key=value` pairs from a URL query string, in order of appearance.
///
/// Keys may repeat (`id=1&id=2`); [`UrlParams::get`] returns the first value
/// and [`UrlParams::get_all`] returns every one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParams {
    pairs: Vec<(String, String)>,
}

impl UrlParams {
    pub fn parse(query: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for part in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            pairs.push((decode_component(key)?, decode_component(value)?));
        }
        Ok(Self { pairs })
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self { pairs: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// First value for `key` if it is present and non-empty.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }
}

fn decode_component(raw: &str) -> Result<String> {
    // form encoding uses '+' for spaces
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| MortarError::Validation(format!("Invalid URL parameter '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_keys() {
        let params = UrlParams::parse("id=1&id=2&start=2020-01-01T00:00:00Z").unwrap();
        assert_eq!(params.get_all("id"), vec!["1", "2"]);
        assert_eq!(params.get("id"), Some("1"));
        assert_eq!(params.get("missing"), None);
    }

    #[test]
    fn test_percent_and_plus_decoding() {
        let params = UrlParams::parse("sparql=SELECT+%3Fs+WHERE+%7B%7D&apikey=").unwrap();
        assert_eq!(params.get("sparql"), Some("SELECT ?s WHERE {}"));
        assert!(params.contains("apikey"));
        assert_eq!(params.get_non_empty("apikey"), None);
    }
}
