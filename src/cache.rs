use std::{
    collections::HashMap,
    error::Error as StdError,
    io::{Read as _, Write as _},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming};

use crate::{
    fingerprint::{RequestMeta, ResponseMeta},
    root::Root,
    storage::{BlobRead, BlobWrite, Result, Storage, StorageError},
};

pub const REQ_HEAD_SUFFIX: &str = "-req-head";
pub const REQ_BODY_SUFFIX: &str = "-req-body";
pub const RESP_HEAD_SUFFIX: &str = "-resp-head";
pub const RESP_BODY_SUFFIX: &str = "-resp-body";

/// Directory path for a request inside the Merkle tree:
/// `[authority, url-without-query]`. File names under it carry the request
/// hash plus an entry suffix. Changing this scheme invalidates every
/// existing export, so it is pinned here.
pub fn request_dir_path(uri: &hyper::Uri) -> Result<Vec<String>> {
    let authority = uri
        .authority()
        .ok_or_else(|| StorageError::Invalid(format!("request URI has no authority: {uri}")))?;
    let host = match authority.as_str().rsplit_once('@') {
        Some((_, host)) => host,
        None => authority.as_str(),
    };
    let scheme = uri.scheme_str().unwrap_or("http");
    Ok(vec![
        host.to_owned(),
        format!("{scheme}://{host}{}", uri.path()),
    ])
}

pub fn entry_path(dir_path: &[String], req_hash: &str, suffix: &str) -> Vec<String> {
    let mut path = dir_path.to_vec();
    path.push(format!("{req_hash}{suffix}"));
    path
}

/// A cached response ready for replay.
pub struct CachedResponse {
    pub meta: ResponseMeta,
    pub body: Box<dyn BlobRead>,
}

/// Reads the stored response for a fingerprint. A missing `-resp-head` or
/// `-resp-body` entry is a cache miss, not an error.
pub fn lookup(root: &Root, dir_path: &[String], req_hash: &str) -> Result<Option<CachedResponse>> {
    let head_path = entry_path(dir_path, req_hash, RESP_HEAD_SUFFIX);
    let mut head = match root.read(&head_path) {
        Ok(reader) => reader,
        Err(StorageError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut head_bytes = Vec::new();
    head.read_to_end(&mut head_bytes)
        .map_err(|err| StorageError::Io(format!("read response head: {err}")))?;
    let meta: ResponseMeta = serde_json::from_slice(&head_bytes)
        .map_err(|err| StorageError::Invalid(format!("decode response head: {err}")))?;

    let body_path = entry_path(dir_path, req_hash, RESP_BODY_SUFFIX);
    let body = match root.read(&body_path) {
        Ok(reader) => reader,
        Err(StorageError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(Some(CachedResponse { meta, body }))
}

/// Writes the request side of a cache entry: the full (unfiltered) request
/// meta for audit, and a link to the already-stored body blob.
pub fn store_request(
    root: &Root,
    dir_path: &[String],
    req_hash: &str,
    audit_meta: &RequestMeta,
) -> Result<()> {
    let head_bytes = serde_json::to_vec(audit_meta)
        .map_err(|err| StorageError::Io(format!("serialize request head: {err}")))?;
    let mut writer = root.write(&entry_path(dir_path, req_hash, REQ_HEAD_SUFFIX))?;
    writer
        .write_all(&head_bytes)
        .map_err(|err| StorageError::Io(format!("write request head: {err}")))?;
    writer.close()?;

    root.link(
        &entry_path(dir_path, req_hash, REQ_BODY_SUFFIX),
        &audit_meta.body_hash,
    )
}

/// Writes the `-resp-head` entry for a fingerprint.
pub fn store_response_head(
    root: &Root,
    dir_path: &[String],
    req_hash: &str,
    meta: &ResponseMeta,
) -> Result<()> {
    let head_bytes = serde_json::to_vec(meta)
        .map_err(|err| StorageError::Io(format!("serialize response head: {err}")))?;
    let mut writer = root.write(&entry_path(dir_path, req_hash, RESP_HEAD_SUFFIX))?;
    writer
        .write_all(&head_bytes)
        .map_err(|err| StorageError::Io(format!("write response head: {err}")))?;
    writer.close()?;
    Ok(())
}

/// Response body that tees every upstream byte into a blob writer while
/// delivering it to the client. The `-resp-body` dirent is linked only after
/// the upstream body completes; an aborted stream drops the writer and no
/// entry is committed. The single-flight guard rides along so waiting
/// identical requests stay parked until the entry is fully stored (or the
/// stream dies and they retry themselves).
pub struct RecordingBody {
    upstream: Incoming,
    writer: Option<Box<dyn BlobWrite>>,
    root: Arc<Root>,
    entry_path: Vec<String>,
    flight: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl RecordingBody {
    pub fn new(
        upstream: Incoming,
        storage: &Storage,
        root: Arc<Root>,
        dir_path: &[String],
        req_hash: &str,
        flight: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<Self> {
        let writer = storage.blob_create()?;
        Ok(Self {
            upstream,
            writer: Some(writer),
            root,
            entry_path: entry_path(dir_path, req_hash, RESP_BODY_SUFFIX),
            flight: Some(flight),
        })
    }

    fn commit(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        match writer.close() {
            Ok(hash) => {
                if let Err(err) = self.root.link(&self.entry_path, &hash) {
                    tracing::warn!("link recorded response body: {err}");
                }
            }
            Err(err) => tracing::warn!("finalize recorded response body: {err}"),
        }
        self.flight = None;
    }
}

impl Body for RecordingBody {
    type Data = Bytes;
    type Error = Box<dyn StdError + Send + Sync>;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.upstream).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(writer) = this.writer.as_mut() {
                        if let Err(err) = writer.write_all(data) {
                            tracing::warn!("record response body chunk: {err}");
                            this.writer = None;
                        }
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                // Upstream failed mid-stream; the partial blob is abandoned
                // and any waiting identical request gets its turn.
                this.writer = None;
                this.flight = None;
                Poll::Ready(Some(Err(Box::new(err))))
            }
            Poll::Ready(None) => {
                this.commit();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Blob reader adapted to a hyper body, streaming in fixed-size chunks.
pub struct BlobBody {
    reader: Option<Box<dyn BlobRead>>,
}

impl BlobBody {
    const CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(reader: Box<dyn BlobRead>) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

impl Body for BlobBody {
    type Data = Bytes;
    type Error = Box<dyn StdError + Send + Sync>;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(None);
        };
        let mut buf = vec![0u8; Self::CHUNK_SIZE];
        match reader.read(&mut buf) {
            Ok(0) => {
                this.reader = None;
                Poll::Ready(None)
            }
            Ok(read) => {
                buf.truncate(read);
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(buf)))))
            }
            Err(err) => {
                this.reader = None;
                Poll::Ready(Some(Err(Box::new(err))))
            }
        }
    }
}

/// Keyed single-flight locks: at most one in-flight upstream fetch per
/// `(root, reqHash)`; concurrent identical requests wait and replay from the
/// just-stored entry.
#[derive(Default)]
pub struct FlightLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlightLocks {
    pub async fn acquire(&self, root_name: &str, req_hash: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let key = format!("{root_name}:{req_hash}");
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};

    use super::{lookup, request_dir_path, store_request, store_response_head};
    use crate::{
        fingerprint::{RequestMeta, ResponseMeta},
        storage::Storage,
    };

    fn sample_request_meta(body_hash: &str) -> RequestMeta {
        RequestMeta {
            proto: "HTTP/1.1".to_owned(),
            method: "GET".to_owned(),
            user: String::new(),
            query: String::new(),
            headers: Default::default(),
            content_len: 0,
            body_hash: body_hash.to_owned(),
        }
    }

    #[test]
    fn request_dir_path_is_authority_plus_url_without_query() {
        let uri: hyper::Uri = "http://example.com/a/b?x=1".parse().unwrap();
        assert_eq!(
            request_dir_path(&uri).unwrap(),
            vec![
                "example.com".to_owned(),
                "http://example.com/a/b".to_owned()
            ]
        );

        let with_port: hyper::Uri = "https://example.com:8443/path".parse().unwrap();
        assert_eq!(
            request_dir_path(&with_port).unwrap(),
            vec![
                "example.com:8443".to_owned(),
                "https://example.com:8443/path".to_owned()
            ]
        );
    }

    #[test]
    fn request_dir_path_requires_an_authority() {
        let uri: hyper::Uri = "/relative/only".parse().unwrap();
        assert!(request_dir_path(&uri).is_err());
    }

    #[test]
    fn store_then_lookup_round_trips_the_response() {
        let storage = Storage::memory();
        let (_, root) = storage.root_create();
        let uri: hyper::Uri = "http://example.com/a".parse().unwrap();
        let dir_path = request_dir_path(&uri).unwrap();
        let req_hash = "sha256:req";

        assert!(lookup(&root, &dir_path, req_hash).unwrap().is_none());

        let body_hash = crate::fingerprint::hash_body(&storage.store(), b"").unwrap();
        store_request(&root, &dir_path, req_hash, &sample_request_meta(&body_hash)).unwrap();

        let mut resp_headers = std::collections::BTreeMap::new();
        resp_headers.insert(
            "content-type".to_owned(),
            vec!["text/plain".to_owned()],
        );
        let meta = ResponseMeta {
            status_code: 200,
            content_len: 5,
            headers: resp_headers,
        };
        store_response_head(&root, &dir_path, req_hash, &meta).unwrap();

        // Head present but body still absent: still a miss.
        assert!(lookup(&root, &dir_path, req_hash).unwrap().is_none());

        let mut writer = root
            .write(&super::entry_path(&dir_path, req_hash, super::RESP_BODY_SUFFIX))
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer.close().unwrap();

        let cached = lookup(&root, &dir_path, req_hash).unwrap().unwrap();
        assert_eq!(cached.meta.status_code, 200);
        assert_eq!(cached.meta.headers["content-type"], vec!["text/plain"]);
        let mut body = Vec::new();
        let mut reader = cached.body;
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn stored_entries_use_the_expected_file_names() {
        let storage = Storage::memory();
        let (_, root) = storage.root_create();
        let uri: hyper::Uri = "http://example.com/a".parse().unwrap();
        let dir_path = request_dir_path(&uri).unwrap();
        let req_hash = "sha256:req";

        let body_hash = crate::fingerprint::hash_body(&storage.store(), b"payload").unwrap();
        store_request(
            &root,
            &dir_path,
            req_hash,
            &RequestMeta {
                content_len: 7,
                ..sample_request_meta(&body_hash)
            },
        )
        .unwrap();

        let listing = root.list(&dir_path).unwrap();
        let names: Vec<&String> = listing.keys().collect();
        assert_eq!(
            names,
            vec!["sha256:req-req-body", "sha256:req-req-head"]
        );

        // The -req-body link shares the body blob rather than copying it.
        assert_eq!(
            root.entry_hash(&super::entry_path(&dir_path, req_hash, super::REQ_BODY_SUFFIX))
                .unwrap(),
            body_hash
        );
    }
}
