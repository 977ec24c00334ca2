use std::{
    convert::Infallible,
    error::Error as StdError,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    http::uri::Authority,
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_rustls::TlsAcceptor;

use crate::{
    ca::{Ca, LeafCertMaterial},
    cache::{self, BlobBody, FlightLocks, RecordingBody},
    config::Config,
    fingerprint,
    root::Root,
    storage::Storage,
};

pub type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type ProxyHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<ProxyHttpsConnector, ProxyBody>;

/// Hop-by-hop headers, removed in both directions.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyState {
    config: Config,
    storage: Arc<Storage>,
    ca: Arc<Ca>,
    client: HttpClient,
    flights: FlightLocks,
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn serve(
    config: &Config,
    storage: Arc<Storage>,
    ca: Arc<Ca>,
) -> anyhow::Result<ProxyHandle> {
    ensure_rustls_crypto_provider()?;

    let listener = TcpListener::bind(&config.proxy.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind proxy {}: {err}", config.proxy.addr))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get proxy local_addr: {err}"))?;

    let state = Arc::new(ProxyState {
        config: config.clone(),
        storage,
        ca,
        client: build_http_client()?,
        flights: FlightLocks::default(),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let client_ip = Some(peer.ip());
                        let service = service_fn(move |req| {
                            proxy_handler(req, Arc::clone(&state), client_ip)
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection_with_upgrades(io, service).await
                        {
                            tracing::debug!("proxy connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(addr = %listen_addr, "proxy listening");
    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_http_client() -> anyhow::Result<HttpClient> {
    let connector: ProxyHttpsConnector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

async fn proxy_handler(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_ip: Option<IpAddr>,
) -> Result<Response<ProxyBody>, Infallible> {
    tracing::debug!(method = %req.method(), uri = %req.uri(), "proxy request");

    // Authenticate before anything else; CONNECT with no credentials must
    // not resolve a root.
    let (root_name, root) = match authenticate(&state, req.headers()) {
        Ok(resolved) => resolved,
        Err(reason) => {
            tracing::debug!("proxy auth failed: {reason}");
            return Ok(proxy_auth_required_response());
        }
    };

    if req.method() == Method::CONNECT {
        let Some(connect_authority) = req.uri().authority().cloned() else {
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "CONNECT request target must include authority",
            ));
        };
        let on_upgrade = hyper::upgrade::on(&mut req);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = mitm_upgraded_connection(
                on_upgrade,
                connect_authority,
                state,
                root_name,
                root,
                client_ip,
            )
            .await
            {
                tracing::debug!("CONNECT MITM session finished: {err}");
            }
        });

        let mut response = Response::new(boxed_full(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        return Ok(response);
    }

    if !matches!(req.uri().scheme_str(), Some("http" | "https")) || req.uri().authority().is_none()
    {
        return Ok(simple_response(StatusCode::BAD_REQUEST, "unsupported request"));
    }

    Ok(serve_with_cache(req, state, root_name, root, client_ip).await)
}

/// The cache-first proxying path shared by plain requests and requests
/// arriving inside a CONNECT tunnel: lookup by fingerprint, on miss forward
/// upstream and tee the response into the store.
async fn serve_with_cache(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    root_name: String,
    root: Arc<Root>,
    client_ip: Option<IpAddr>,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    if let Some(client_ip) = client_ip {
        append_x_forwarded_for(&mut parts.headers, client_ip);
    }

    let actions = state.config.header_actions_for(&parts.uri.to_string());
    for name in &actions.strip {
        parts.headers.remove(name.as_str());
    }

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("read request body: {err}");
            return simple_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let body_hash = match fingerprint::hash_body(&state.storage.store(), &body_bytes) {
        Ok(hash) => hash,
        Err(err) => {
            tracing::warn!("hash request body: {err}");
            return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to hash request");
        }
    };
    let meta = fingerprint::canonical_request_meta(
        parts.version,
        &parts.method,
        &parts.uri,
        &parts.headers,
        body_bytes.len(),
        &body_hash,
        &actions.ignore,
    );
    let req_hash = match meta.request_hash() {
        Ok(hash) => hash,
        Err(err) => {
            tracing::warn!("compute request fingerprint: {err}");
            return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to hash request");
        }
    };
    let dir_path = match cache::request_dir_path(&parts.uri) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!("derive cache path: {err}");
            return simple_response(StatusCode::BAD_REQUEST, "unsupported request");
        }
    };

    // Single-flight: identical first-time requests fetch upstream once; the
    // losers replay from the entry the winner just stored. On a miss the
    // guard moves into the recording body, which releases it once the
    // -resp-body dirent is committed.
    let flight = state.flights.acquire(&root_name, &req_hash).await;

    match cache::lookup(&root, &dir_path, &req_hash) {
        Ok(Some(cached)) => {
            tracing::debug!(uri = %parts.uri, "cache hit");
            return replay_response(cached);
        }
        Ok(None) => tracing::debug!(uri = %parts.uri, "cache miss"),
        Err(err) => tracing::debug!(uri = %parts.uri, "cache lookup failed, treating as miss: {err}"),
    }

    // The audit copy keeps every request header; only the fingerprint
    // filters them.
    let audit_meta = fingerprint::RequestMeta {
        headers: fingerprint::header_map(&parts.headers),
        ..meta
    };

    let uri = parts.uri.clone();
    let mut upstream_req = Request::from_parts(parts, boxed_full(body_bytes));
    set_host_header(upstream_req.headers_mut(), &uri);

    let upstream_res = match state.client.request(upstream_req).await {
        Ok(res) => res,
        Err(err) => {
            tracing::debug!(uri = %uri, "upstream request failed: {err}");
            return simple_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    let (mut res_parts, res_body) = upstream_res.into_parts();
    strip_hop_by_hop_headers(&mut res_parts.headers);

    if root.readonly() {
        tracing::debug!(uri = %uri, "root is read-only, serving without recording");
        return Response::from_parts(res_parts, boxed_incoming(res_body));
    }

    let resp_meta = fingerprint::ResponseMeta {
        status_code: res_parts.status.as_u16(),
        content_len: parse_content_length(&res_parts.headers).unwrap_or(-1),
        headers: fingerprint::header_map(&res_parts.headers),
    };
    let recorded = cache::store_request(&root, &dir_path, &req_hash, &audit_meta)
        .and_then(|_| cache::store_response_head(&root, &dir_path, &req_hash, &resp_meta))
        .and_then(|_| {
            RecordingBody::new(
                res_body,
                &state.storage,
                Arc::clone(&root),
                &dir_path,
                &req_hash,
                flight,
            )
        });
    match recorded {
        Ok(recording_body) => Response::from_parts(res_parts, recording_body.boxed()),
        Err(err) => {
            tracing::warn!(uri = %uri, "failed to record response: {err}");
            simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to record response")
        }
    }
}

fn replay_response(cached: cache::CachedResponse) -> Response<ProxyBody> {
    let mut response = Response::new(BlobBody::new(cached.body).boxed());
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

// ---- auth ----

fn authenticate(
    state: &ProxyState,
    headers: &hyper::HeaderMap,
) -> Result<(String, Arc<Root>), String> {
    let Some(value) = headers.get(header::PROXY_AUTHORIZATION) else {
        return Err("no Proxy-Authorization header".to_owned());
    };
    let value = value
        .to_str()
        .map_err(|_| "malformed Proxy-Authorization header".to_owned())?;
    let Some((scheme, encoded)) = value.split_once(' ') else {
        return Err("Basic auth header not found".to_owned());
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(format!("unsupported proxy auth scheme {scheme}"));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| format!("decode proxy auth token: {err}"))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| "proxy auth token is not UTF-8".to_owned())?;
    let Some((user, token)) = decoded.split_once(':') else {
        return Err("Basic user/pass missing".to_owned());
    };
    if user != "token" {
        return Err(format!("auth user is not token: {user}"));
    }
    let root = state
        .storage
        .root_open(token)
        .map_err(|err| format!("open root for token: {err}"))?;
    Ok((token.to_owned(), root))
}

fn proxy_auth_required_response() -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::new()));
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    response.headers_mut().insert(
        header::PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic"),
    );
    response
        .headers_mut()
        .insert("proxy-connection", HeaderValue::from_static("close"));
    response
}

// ---- CONNECT MITM ----

async fn mitm_upgraded_connection(
    on_upgrade: hyper::upgrade::OnUpgrade,
    connect_authority: Authority,
    state: Arc<ProxyState>,
    root_name: String,
    root: Arc<Root>,
    client_ip: Option<IpAddr>,
) -> anyhow::Result<()> {
    let upgraded = on_upgrade
        .await
        .map_err(|err| anyhow::anyhow!("upgrade client CONNECT tunnel: {err}"))?;
    let leaf = state
        .ca
        .issue_for_host(connect_authority.host())
        .map_err(|err| {
            anyhow::anyhow!(
                "issue leaf certificate for CONNECT authority `{}`: {err}",
                connect_authority.host()
            )
        })?;
    let acceptor = build_leaf_tls_acceptor(&leaf)?;
    let upgraded = TokioIo::new(upgraded);
    let tls_stream = acceptor.accept(upgraded).await.map_err(|err| {
        anyhow::anyhow!(
            "TLS handshake for CONNECT authority `{connect_authority}` failed: {err}; ensure client trust includes the httplock CA certificate"
        )
    })?;

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let connect_authority = connect_authority.clone();
        let root_name = root_name.clone();
        let root = Arc::clone(&root);
        async move {
            let response = match normalize_tunneled_https_request(req, &connect_authority) {
                Ok(req) => serve_with_cache(req, state, root_name, root, client_ip).await,
                Err(err) => {
                    tracing::debug!(
                        authority = %connect_authority,
                        "failed to normalize CONNECT tunneled request: {err}"
                    );
                    simple_response(
                        StatusCode::BAD_REQUEST,
                        "invalid HTTPS request target inside CONNECT tunnel",
                    )
                }
            };
            Ok::<_, Infallible>(response)
        }
    });
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    builder
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|err| anyhow::anyhow!("serve CONNECT tunneled HTTP session: {err}"))?;
    Ok(())
}

fn build_leaf_tls_acceptor(leaf: &LeafCertMaterial) -> anyhow::Result<TlsAcceptor> {
    let cert_chain = vec![CertificateDer::from(leaf.cert_der.clone())];
    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|err| anyhow::anyhow!("build TLS server certificate: {err}"))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Requests inside the tunnel arrive in origin form; rebuild the absolute
/// `https://` URI from the CONNECT authority so caching and forwarding see
/// the real target.
fn normalize_tunneled_https_request(
    mut req: Request<Incoming>,
    connect_authority: &Authority,
) -> anyhow::Result<Request<Incoming>> {
    let request_uri = req.uri();
    let has_scheme = request_uri.scheme().is_some();
    let has_authority = request_uri.authority().is_some();
    if has_scheme || has_authority {
        if !(has_scheme && has_authority) {
            anyhow::bail!(
                "HTTPS CONNECT request target must be origin-form or absolute-form URI with authority"
            );
        }
        if !matches!(request_uri.scheme_str(), Some("http" | "https")) {
            anyhow::bail!("HTTPS CONNECT request target scheme must be `http` or `https`");
        }
        return Ok(req);
    }

    if request_uri.path() == "*" {
        anyhow::bail!("HTTPS CONNECT request target `*` is not supported");
    }
    let path_and_query = request_uri
        .path_and_query()
        .map(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("/");
    let uri: hyper::Uri = format!("https://{}{path_and_query}", connect_authority.as_str())
        .parse()
        .map_err(|err| anyhow::anyhow!("construct tunneled HTTPS request URI: {err}"))?;
    *req.uri_mut() = uri;
    Ok(req)
}

// ---- header plumbing ----

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    // Connection can name additional hop-by-hop headers; drop those too.
    let mut named: Vec<String> = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                named.push(token.to_ascii_lowercase());
            }
        }
    }
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Folds any prior X-Forwarded-For values with the client IP into a single
/// comma-separated header.
fn append_x_forwarded_for(headers: &mut hyper::HeaderMap, client_ip: IpAddr) {
    let mut chain: Vec<String> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_owned)
        .collect();
    chain.push(client_ip.to_string());
    let joined = chain.join(", ");
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.remove("x-forwarded-for");
        headers.insert("x-forwarded-for", value);
    }
}

fn set_host_header(headers: &mut hyper::HeaderMap, uri: &hyper::Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

fn parse_content_length(headers: &hyper::HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
}

// ---- response helpers ----

pub(crate) fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|err| -> Box<dyn StdError + Send + Sync> { Box::new(err) })
        .boxed()
}

pub(crate) fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(message.to_owned()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
