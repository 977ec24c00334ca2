use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use base64::Engine as _;
use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    ca::Ca,
    cache,
    config::Config,
    export, import,
    proxy::{ProxyBody, boxed_full, simple_response},
    root,
    storage::{Storage, StorageError},
};

struct ApiState {
    storage: Arc<Storage>,
    ca: Arc<Ca>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ApiHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn serve(
    config: &Config,
    storage: Arc<Storage>,
    ca: Arc<Ca>,
) -> anyhow::Result<ApiHandle> {
    let listener = TcpListener::bind(&config.api.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind api {}: {err}", config.api.addr))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get api local_addr: {err}"))?;

    let state = Arc::new(ApiState { storage, ca });
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| api_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("api connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(addr = %listen_addr, "api listening");
    Ok(ApiHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

#[derive(Debug, Serialize)]
struct TokenCreateResponse {
    uuid: String,
    auth: String,
}

#[derive(Debug, Serialize)]
struct HashResponse {
    hash: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn api_handler(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    tracing::debug!(method = %method, path = %path, "api request");

    if path == "/api/ca" {
        if method != Method::GET {
            return Ok(method_not_allowed());
        }
        let mut response = Response::new(boxed_full(state.ca.ca_pem().to_owned()));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/text"),
        );
        return Ok(response);
    }

    if path == "/api/token" {
        if method != Method::POST {
            return Ok(method_not_allowed());
        }
        return Ok(token_create(&state, req.uri()));
    }

    if let Some(id) = parse_token_save_path(&path) {
        if method != Method::POST {
            return Ok(method_not_allowed());
        }
        return Ok(token_save(&state, id));
    }

    if let Some(id) = parse_token_path(&path) {
        if method != Method::DELETE {
            return Ok(method_not_allowed());
        }
        return Ok(token_destroy(&state, id));
    }

    if path == "/api/root" {
        if method != Method::GET {
            return Ok(method_not_allowed());
        }
        return Ok(json_response(StatusCode::OK, &state.storage.root_hashes()));
    }

    if let Some((root_id, action)) = parse_root_path(&path) {
        let root_id = root_id.to_owned();
        let action = action.to_owned();
        return Ok(root_action(req, state, &root_id, &action).await);
    }

    Ok(error_response(StatusCode::NOT_FOUND, "not found"))
}

fn token_create(state: &ApiState, uri: &hyper::Uri) -> Response<ProxyBody> {
    let base_hash = query_value(uri, "hash");
    let created = match base_hash.as_deref() {
        Some(hash) => state.storage.root_create_from(hash),
        None => Ok(state.storage.root_create()),
    };
    let (uuid, _root) = match created {
        Ok(created) => created,
        Err(err) => {
            tracing::warn!("failed to create token: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create token");
        }
    };
    let auth = base64::engine::general_purpose::STANDARD.encode(format!("token:{uuid}"));
    json_response(StatusCode::CREATED, &TokenCreateResponse { uuid, auth })
}

fn token_destroy(state: &ApiState, id: &str) -> Response<ProxyBody> {
    if state.storage.root_open(id).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "unknown token");
    }
    error_response(StatusCode::NOT_IMPLEMENTED, "token destroy is not implemented")
}

fn token_save(state: &ApiState, id: &str) -> Response<ProxyBody> {
    let root = match state.storage.root_open(id) {
        Ok(root) => root,
        Err(err) => {
            tracing::debug!("failed to open root {id}: {err}");
            return error_response(StatusCode::BAD_REQUEST, "unknown token");
        }
    };
    match state.storage.root_save(&root) {
        Ok(hash) => json_response(StatusCode::CREATED, &HashResponse { hash }),
        Err(err) => {
            tracing::warn!("failed to save root {id}: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save root")
        }
    }
}

async fn root_action(
    req: Request<Incoming>,
    state: Arc<ApiState>,
    root_id: &str,
    action: &str,
) -> Response<ProxyBody> {
    let method = req.method().clone();
    match (method, action) {
        (Method::GET, "dir") => root_dir(&state, root_id, req.uri()),
        (Method::GET, "file") => root_file(&state, root_id, req.uri()),
        (Method::GET, "info") => root_info(&state, root_id, req.uri()),
        (Method::GET, "resp") => root_resp(&state, root_id, req.uri()),
        (Method::GET, "diff") => root_diff(&state, root_id, req.uri()),
        (Method::GET, "export") => root_export(state, root_id).await,
        (Method::PUT, "import") => root_import(req, state, root_id).await,
        _ => method_not_allowed(),
    }
}

fn root_dir(state: &ApiState, root_id: &str, uri: &hyper::Uri) -> Response<ProxyBody> {
    let path = query_values(uri, "path");
    let root = match state.storage.root_open(root_id) {
        Ok(root) => root,
        Err(err) => return storage_error_response("open root", err),
    };
    match root.list(&path) {
        Ok(entries) => json_response(StatusCode::OK, &entries),
        Err(err) => storage_error_response("list directory", err),
    }
}

fn root_file(state: &ApiState, root_id: &str, uri: &hyper::Uri) -> Response<ProxyBody> {
    let path = query_values(uri, "path");
    if path.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "path is required");
    }
    let content_type =
        query_value(uri, "ct").unwrap_or_else(|| "application/octet-stream".to_owned());
    let root = match state.storage.root_open(root_id) {
        Ok(root) => root,
        Err(err) => return storage_error_response("open root", err),
    };
    let reader = match root.read(&path) {
        Ok(reader) => reader,
        Err(err) => return storage_error_response("read file", err),
    };
    let mut response = Response::new(cache::BlobBody::new(reader).boxed());
    match HeaderValue::from_str(&content_type) {
        Ok(value) => {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid ct parameter");
        }
    }
    response
}

fn root_info(state: &ApiState, root_id: &str, uri: &hyper::Uri) -> Response<ProxyBody> {
    let path = query_values(uri, "path");
    if path.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "path is required");
    }
    let root = match state.storage.root_open(root_id) {
        Ok(root) => root,
        Err(err) => return storage_error_response("open root", err),
    };
    match root.entry_hash(&path) {
        Ok(hash) => json_response(StatusCode::OK, &HashResponse { hash }),
        Err(err) => storage_error_response("resolve entry hash", err),
    }
}

/// Replays a stored response verbatim: original status, headers, and body
/// bytes for the `(path, reqHash)` cache entry.
fn root_resp(state: &ApiState, root_id: &str, uri: &hyper::Uri) -> Response<ProxyBody> {
    let path = query_values(uri, "path");
    if path.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "path is required");
    }
    let Some(req_hash) = query_value(uri, "hash") else {
        return error_response(StatusCode::BAD_REQUEST, "hash is required");
    };
    let root = match state.storage.root_open(root_id) {
        Ok(root) => root,
        Err(err) => return storage_error_response("open root", err),
    };
    let cached = match cache::lookup(&root, &path, &req_hash) {
        Ok(Some(cached)) => cached,
        Ok(None) => {
            return error_response(StatusCode::BAD_REQUEST, "no stored response for hash");
        }
        Err(err) => return storage_error_response("read stored response", err),
    };

    let mut response = Response::new(cache::BlobBody::new(cached.body).boxed());
    *response.status_mut() = StatusCode::from_u16(cached.meta.status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, values) in &cached.meta.headers {
        for value in values {
            let Ok(name) = header::HeaderName::try_from(name.as_str()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            response.headers_mut().append(name, value);
        }
    }
    response
}

fn root_diff(state: &ApiState, root_id: &str, uri: &hyper::Uri) -> Response<ProxyBody> {
    let Some(root2_id) = query_value(uri, "root2") else {
        return error_response(StatusCode::BAD_REQUEST, "root2 is required");
    };
    let root1 = match state.storage.root_open(root_id) {
        Ok(root) => root,
        Err(err) => return storage_error_response("open root", err),
    };
    let root2 = match state.storage.root_open(&root2_id) {
        Ok(root) => root,
        Err(err) => return storage_error_response("open root2", err),
    };
    match root::diff_roots(&root1, &root2) {
        Ok(report) => json_response(StatusCode::OK, &report),
        Err(err) => storage_error_response("diff roots", err),
    }
}

async fn root_export(state: Arc<ApiState>, root_id: &str) -> Response<ProxyBody> {
    if root_id.starts_with("uuid:") {
        return error_response(StatusCode::BAD_REQUEST, "only hash roots can be exported");
    }
    let storage = Arc::clone(&state.storage);
    let root_id = root_id.to_owned();
    let bundle = tokio::task::spawn_blocking(move || {
        let mut bundle = Vec::new();
        export::export(&storage, &root_id, &mut bundle).map(|_| bundle)
    })
    .await;
    match bundle {
        Ok(Ok(bundle)) => {
            let mut response = Response::new(boxed_full(bundle));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-gtar"),
            );
            response
        }
        Ok(Err(err)) => storage_error_response("export root", err),
        Err(err) => {
            tracing::warn!("join export task: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "export failed")
        }
    }
}

async fn root_import(
    req: Request<Incoming>,
    state: Arc<ApiState>,
    root_id: &str,
) -> Response<ProxyBody> {
    if root_id.starts_with("uuid:") {
        return error_response(StatusCode::BAD_REQUEST, "only hash roots can be imported");
    }
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("read import body: {err}");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    let storage = Arc::clone(&state.storage);
    let root_id = root_id.to_owned();
    let imported =
        tokio::task::spawn_blocking(move || import::import(&storage, &root_id, body.as_ref()))
            .await;
    match imported {
        Ok(Ok(())) => {
            let mut response = Response::new(boxed_full(Bytes::new()));
            *response.status_mut() = StatusCode::CREATED;
            response
        }
        Ok(Err(err)) => storage_error_response("import root", err),
        Err(err) => {
            tracing::warn!("join import task: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "import failed")
        }
    }
}

// ---- path and query parsing ----

fn parse_token_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix("/api/token/")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

fn parse_token_save_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/token/")?;
    let (id, save_suffix) = rest.split_once("/save")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    if save_suffix.is_empty() || save_suffix == "/" {
        return Some(id);
    }
    None
}

fn parse_root_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/api/root/")?;
    let (root_id, action) = rest.split_once('/')?;
    if root_id.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((root_id, action))
}

/// Repeated query values for a key, in order, percent-decoded.
fn query_values(uri: &hyper::Uri, key: &str) -> Vec<String> {
    let Some(query) = uri.query() else {
        return Vec::new();
    };
    let mut values = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if percent_decode(name) == key {
            values.push(percent_decode(value));
        }
    }
    values
}

fn query_value(uri: &hyper::Uri, key: &str) -> Option<String> {
    query_values(uri, key).into_iter().next()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok());
                match hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---- response helpers ----

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(boxed_full(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::warn!("failed to serialize api response: {err}");
            simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize response",
            )
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let payload = ErrorResponse {
        error: message.to_owned(),
    };
    let mut response = json_response(StatusCode::OK, &payload);
    *response.status_mut() = status;
    response
}

fn method_not_allowed() -> Response<ProxyBody> {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn storage_error_response(context: &str, err: StorageError) -> Response<ProxyBody> {
    tracing::debug!("api {context}: {err}");
    let status = match err {
        StorageError::NotFound(_)
        | StorageError::ReadOnly
        | StorageError::NotADir(_)
        | StorageError::NotAFile(_)
        | StorageError::AlreadyExists(_)
        | StorageError::HashMismatch { .. }
        | StorageError::Invalid(_) => StatusCode::BAD_REQUEST,
        StorageError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        StorageError::WriterOpen | StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}
