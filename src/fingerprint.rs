use std::{collections::BTreeMap, io::Write as _, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    hasher,
    storage::{BlobStore, Result, StorageError},
};

/// Headers that never participate in the request fingerprint: the hop-by-hop
/// set plus `X-Forwarded-For`, which the proxy itself rewrites.
pub const EXCLUDED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "x-forwarded-for",
];

/// Canonical request metadata. Hashing the compact JSON encoding of this
/// struct yields the request fingerprint; field order is fixed by the struct
/// and the header map sorts by name, so the encoding is reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestMeta {
    pub proto: String,
    pub method: String,
    pub user: String,
    pub query: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub content_len: i64,
    pub body_hash: String,
}

/// Stored response metadata (`-resp-head` entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseMeta {
    pub status_code: u16,
    pub content_len: i64,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl RequestMeta {
    /// The fingerprint: sha256 over the canonical JSON encoding.
    pub fn request_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|err| StorageError::Io(format!("serialize request meta: {err}")))?;
        Ok(hasher::from_bytes(&bytes))
    }
}

/// Builds the canonical request meta for fingerprinting. `ignore_headers`
/// holds extra lowercase header names excluded by config filters; the
/// built-in exclude set always applies. The audit copy written to
/// `-req-head` uses [`header_map`] instead, which keeps every header.
pub fn canonical_request_meta(
    version: hyper::Version,
    method: &hyper::Method,
    uri: &hyper::Uri,
    headers: &hyper::HeaderMap,
    body_len: usize,
    body_hash: &str,
    ignore_headers: &[String],
) -> RequestMeta {
    let mut filtered = header_map(headers);
    filtered.retain(|name, _| {
        !EXCLUDED_HEADERS.contains(&name.as_str()) && !ignore_headers.iter().any(|h| h == name)
    });
    RequestMeta {
        proto: proto_string(version),
        method: method.as_str().to_owned(),
        user: uri_userinfo(uri),
        query: canonical_query(uri.query()),
        headers: filtered,
        content_len: body_len as i64,
        body_hash: body_hash.to_owned(),
    }
}

/// Streams the request body into the blob store, returning its hash. The
/// stored blob doubles as the replayable body source and the `-req-body`
/// link target. An absent body hashes the empty string.
pub fn hash_body(store: &Arc<dyn BlobStore>, body: &[u8]) -> Result<String> {
    let mut writer = store.blob_create()?;
    writer
        .write_all(body)
        .map_err(|err| StorageError::Io(format!("write request body blob: {err}")))?;
    writer.close()
}

/// All headers as a sorted name → values map, multi-values in arrival order.
/// Names arrive lowercased from the HTTP stack.
pub fn header_map(headers: &hyper::HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        map.entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Re-encodes a query string with `name=value` pairs sorted by name then
/// value. Pairs keep their raw encoding; repeated keys are preserved.
pub fn canonical_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    let mut pairs: Vec<(&str, &str)> = Vec::new();
    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (name, value) = segment.split_once('=').unwrap_or((segment, ""));
        pairs.push((name, value));
    }
    pairs.sort_unstable_by(|(a_name, a_value), (b_name, b_value)| {
        a_name.cmp(b_name).then_with(|| a_value.cmp(b_value))
    });
    let mut out = String::with_capacity(query.len());
    for (idx, (name, value)) in pairs.iter().enumerate() {
        if idx > 0 {
            out.push('&');
        }
        out.push_str(name);
        out.push('=');
        out.push_str(value);
    }
    out
}

fn uri_userinfo(uri: &hyper::Uri) -> String {
    let Some(authority) = uri.authority() else {
        return String::new();
    };
    match authority.as_str().rsplit_once('@') {
        Some((userinfo, _)) => userinfo.to_owned(),
        None => String::new(),
    }
}

fn proto_string(version: hyper::Version) -> String {
    match version {
        hyper::Version::HTTP_09 => "HTTP/0.9".to_owned(),
        hyper::Version::HTTP_10 => "HTTP/1.0".to_owned(),
        hyper::Version::HTTP_11 => "HTTP/1.1".to_owned(),
        hyper::Version::HTTP_2 => "HTTP/2.0".to_owned(),
        hyper::Version::HTTP_3 => "HTTP/3.0".to_owned(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use hyper::{HeaderMap, Method, Uri, Version, header::HeaderValue};

    use super::{canonical_query, canonical_request_meta, hash_body, header_map};
    use crate::storage::Storage;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn meta_for(uri: &str, headers: &HeaderMap, body: &[u8]) -> super::RequestMeta {
        let uri: Uri = uri.parse().unwrap();
        canonical_request_meta(
            Version::HTTP_11,
            &Method::GET,
            &uri,
            headers,
            body.len(),
            &crate::hasher::from_bytes(body),
            &[],
        )
    }

    #[test]
    fn empty_body_hashes_to_the_empty_string_digest() {
        let storage = Storage::memory();
        let hash = hash_body(&storage.store(), b"").unwrap();
        assert_eq!(hash, EMPTY_SHA256);
        // The empty blob is stored so -req-body links resolve.
        assert!(storage.blob_open(EMPTY_SHA256).is_ok());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/plain"));
        let first = meta_for("http://example.com/a?x=1", &headers, b"");
        let second = meta_for("http://example.com/a?x=1", &headers, b"");
        assert_eq!(
            first.request_hash().unwrap(),
            second.request_hash().unwrap()
        );
    }

    #[test]
    fn excluded_headers_do_not_change_the_fingerprint() {
        let mut plain = HeaderMap::new();
        plain.insert("accept", HeaderValue::from_static("text/plain"));
        let mut noisy = plain.clone();
        noisy.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        noisy.insert("connection", HeaderValue::from_static("keep-alive"));

        let base = meta_for("http://example.com/a", &plain, b"");
        let with_noise = meta_for("http://example.com/a", &noisy, b"");
        assert_eq!(
            base.request_hash().unwrap(),
            with_noise.request_hash().unwrap()
        );
    }

    #[test]
    fn config_ignored_headers_do_not_change_the_fingerprint() {
        let uri: Uri = "http://example.com/a".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc123"));

        let ignoring = canonical_request_meta(
            Version::HTTP_11,
            &Method::GET,
            &uri,
            &headers,
            0,
            EMPTY_SHA256,
            &["x-request-id".to_owned()],
        );
        let without = canonical_request_meta(
            Version::HTTP_11,
            &Method::GET,
            &uri,
            &HeaderMap::new(),
            0,
            EMPTY_SHA256,
            &[],
        );
        assert_eq!(
            ignoring.request_hash().unwrap(),
            without.request_hash().unwrap()
        );
    }

    #[test]
    fn included_headers_change_the_fingerprint() {
        let plain = HeaderMap::new();
        let mut with_accept = HeaderMap::new();
        with_accept.insert("accept", HeaderValue::from_static("application/json"));

        let base = meta_for("http://example.com/a", &plain, b"");
        let changed = meta_for("http://example.com/a", &with_accept, b"");
        assert_ne!(
            base.request_hash().unwrap(),
            changed.request_hash().unwrap()
        );
    }

    #[test]
    fn body_bytes_change_the_fingerprint() {
        let headers = HeaderMap::new();
        let one = meta_for("http://example.com/a", &headers, br#"{"k":1}"#);
        let two = meta_for("http://example.com/a", &headers, br#"{"k":2}"#);
        assert_ne!(one.request_hash().unwrap(), two.request_hash().unwrap());
    }

    #[test]
    fn query_order_does_not_change_the_fingerprint() {
        let headers = HeaderMap::new();
        let first = meta_for("http://example.com/a?b=2&a=1", &headers, b"");
        let second = meta_for("http://example.com/a?a=1&b=2", &headers, b"");
        assert_eq!(
            first.request_hash().unwrap(),
            second.request_hash().unwrap()
        );
    }

    #[test]
    fn canonical_query_sorts_by_name_then_value() {
        assert_eq!(canonical_query(Some("b=2&a=1&a=0")), "a=0&a=1&b=2");
        assert_eq!(canonical_query(Some("flag&x=1")), "flag=&x=1");
        assert_eq!(canonical_query(Some("")), "");
        assert_eq!(canonical_query(None), "");
    }

    #[test]
    fn canonical_json_uses_fixed_field_names_in_order() {
        let meta = meta_for("http://example.com/a?x=1", &HeaderMap::new(), b"");
        let json = serde_json::to_string(&meta).unwrap();
        let proto = json.find("\"Proto\"").unwrap();
        let method = json.find("\"Method\"").unwrap();
        let body_hash = json.find("\"BodyHash\"").unwrap();
        assert!(proto < method && method < body_hash, "json: {json}");
        assert!(json.contains("\"ContentLen\""), "json: {json}");
    }

    #[test]
    fn multi_value_headers_are_preserved_in_order() {
        let mut headers = HeaderMap::new();
        headers.append("x-multi", HeaderValue::from_static("first"));
        headers.append("x-multi", HeaderValue::from_static("second"));
        let map = header_map(&headers);
        assert_eq!(map["x-multi"], vec!["first", "second"]);
    }
}
