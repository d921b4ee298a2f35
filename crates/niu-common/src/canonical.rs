//! Canonical signing strings.
//!
//! Both signer and verifier must produce byte-identical input, so objects
//! are flattened with their keys sorted lexicographically and joined as
//! `key=value` pairs separated by `&`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Canonicalizes a JSON value.
///
/// - objects: sorted `key=value` pairs joined with `&`
/// - strings: verbatim
/// - numbers and booleans: their display form
/// - `null`: empty string
/// - arrays, and objects nested inside an object: compact JSON
///
/// # Examples
///
/// ```
/// use niu_common::canonical::canonicalize;
/// use serde_json::json;
///
/// assert_eq!(canonicalize(&json!({"b": 1, "a": "x"})), "a=x&b=1");
/// assert_eq!(canonicalize(&json!(null)), "");
/// ```
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => canonicalize_map(map),
        other => scalar(other),
    }
}

fn canonicalize_map(map: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&str, &Value> = map.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let mut out = String::new();
    for (i, (key, value)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&scalar(value));
    }
    out
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Fields covered by a request or response signature.
///
/// `body` is only present for requests that carry one (POST/PUT) and for
/// every response; it holds the exact wire text, ciphertext included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignPayload<'a> {
    /// Session identifier.
    pub session: &'a str,
    /// Per-message nonce.
    pub nonce: &'a str,
    /// Unix seconds, as sent on the wire.
    pub timestamp: &'a str,
    /// Platform identifier.
    pub platform: &'a str,
    /// Upper-case HTTP method.
    pub method: &'a str,
    /// Request path without query.
    pub path: &'a str,
    /// Canonicalized query, empty when there is none.
    pub query: &'a str,
    /// Wire body.
    pub body: Option<&'a str>,
}

impl SignPayload<'_> {
    /// Renders the canonical string that gets signed.
    ///
    /// # Examples
    ///
    /// ```
    /// use niu_common::canonical::SignPayload;
    ///
    /// let payload = SignPayload {
    ///     session: "s",
    ///     nonce: "n",
    ///     timestamp: "1",
    ///     platform: "8",
    ///     method: "GET",
    ///     path: "/v1/user/info",
    ///     query: "",
    ///     body: None,
    /// };
    /// assert_eq!(
    ///     payload.canonical(),
    ///     "method=GET&nonce=n&path=/v1/user/info&platform=8&query=&session=s&timestamp=1"
    /// );
    /// ```
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        fields.insert("session", self.session);
        fields.insert("nonce", self.nonce);
        fields.insert("timestamp", self.timestamp);
        fields.insert("platform", self.platform);
        fields.insert("method", self.method);
        fields.insert("path", self.path);
        fields.insert("query", self.query);
        if let Some(body) = self.body {
            fields.insert("body", body);
        }
        fields
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        assert_eq!(
            canonicalize(&json!({"b": 1, "a": 2})),
            canonicalize(&json!({"a": 2, "b": 1}))
        );
    }

    #[test]
    fn scalars_stringify_directly() {
        assert_eq!(canonicalize(&json!("plain")), "plain");
        assert_eq!(canonicalize(&json!(42)), "42");
        assert_eq!(canonicalize(&json!(true)), "true");
        assert_eq!(canonicalize(&Value::Null), "");
    }

    #[test]
    fn null_field_renders_empty() {
        assert_eq!(canonicalize(&json!({"a": null, "b": "x"})), "a=&b=x");
    }

    #[test]
    fn nested_values_render_as_json() {
        assert_eq!(
            canonicalize(&json!({"ids": [1, 2], "page": {"n": 1}})),
            "ids=[1,2]&page={\"n\":1}"
        );
    }

    #[test]
    fn empty_object_is_empty_string() {
        assert_eq!(canonicalize(&json!({})), "");
    }

    #[test]
    fn sign_payload_includes_body_only_when_present() {
        let mut payload = SignPayload {
            session: "sid",
            nonce: "abc",
            timestamp: "1700000000",
            platform: "8",
            method: "POST",
            path: "/v1/auth/login",
            query: "",
            body: None,
        };
        assert!(!payload.canonical().contains("body="));
        payload.body = Some("CIPHERTEXT");
        assert!(payload.canonical().starts_with("body=CIPHERTEXT&method=POST"));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn insertion_order_is_irrelevant(
            entries in prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..12)
        ) {
            let forward: Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            let reverse: Map<String, Value> = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            prop_assert_eq!(
                canonicalize(&Value::Object(forward)),
                canonicalize(&Value::Object(reverse))
            );
        }
    }
}
