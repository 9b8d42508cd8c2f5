// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Per-transport ingress listeners: UDP, TCP, DoT and DoH/plain-HTTP, plus
//! the `/metrics` admin surface.
//!
//! The UDP accept loop is grounded directly on the teacher's
//! `dcompass/src/main.rs`/`worker.rs` (`recv_from` + bounded `tokio::spawn`
//! per packet); TCP/DoT framing and the per-connection reader loop are
//! generalized from `RoeeJ-heimdall`'s `protocol/{tcp,dot}.rs` length-prefix
//! handling, changed from heimdall's strictly-sequential per-connection loop
//! to a per-query spawn so that responses can return out of order (RFC 7766).
//! DoH and the admin surface are built on `axum`, again per heimdall's
//! `http_server.rs`, since the teacher has no HTTP server code to ground on.

use bytes::{Bytes, BytesMut};
use droute::{
    codec::{advertised_udp_size, pack, unpack, validate_framed_len, validate_outgoing_len, BufferPool},
    error::CoreError,
    graph::{eval, PluginMap, ResolvedNode},
    query::{QueryContext, Status},
};
use domain::base::{iana::Rcode, Message, MessageBuilder};
use log::{debug, error, info, warn};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{Mutex as AsyncMutex, Semaphore},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ListenerConfig,
    error::{DnsflowError, Result},
    metrics::Metrics,
    orchestrator::{Forwarder, ResolvedServer},
};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_WRITE_DEADLINE: Duration = Duration::from_secs(1);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Fixed concurrency cap per server; the distilled schema names no YAML
/// knob for it (only the concept, in §4.G), so it stays a constant here.
const MAX_CONCURRENT_QUERIES: usize = 4096;

/// Tracks every spawned listener task so shutdown can wait for them, the
/// idiomatic-tokio analogue of the teacher's absent WaitGroup (the teacher
/// just exits the process instead of draining in-flight work).
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Arc<AsyncMutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Arc::new(AsyncMutex::new(Vec::new())),
        }
    }

    async fn track(&self, handle: tokio::task::JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// Idempotent: repeated calls after the first are no-ops, matching the
    /// spec's `SendCloseSignal` N times == once contract.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for every tracked listener task to finish.
    pub async fn join(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.token.cancelled()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Start every listener for every configured server, plus the admin HTTP
/// surface if `api.http` is set. Returns once every listener task has been
/// spawned; callers await [`ShutdownCoordinator::join`] after triggering
/// [`ShutdownCoordinator::shutdown`].
pub async fn run(forwarder: Arc<Forwarder>, metrics: Arc<Metrics>) -> Result<ShutdownCoordinator> {
    let coordinator = ShutdownCoordinator::new();
    let buffer_pool = Arc::new(BufferPool::new());

    for server in &forwarder.servers {
        let exec = Arc::new(clone_resolved(&server.exec));
        for listener in &server.listeners {
            spawn_listener(
                listener.clone(),
                exec.clone(),
                server.timeout,
                metrics.clone(),
                buffer_pool.clone(),
                coordinator.clone(),
            )
            .await?;
        }
    }

    if let Some(api) = &forwarder.api {
        if let Some(addr) = api.http {
            spawn_admin(addr, metrics.clone(), forwarder.plugins.clone(), coordinator.clone()).await;
        }
    }

    Ok(coordinator)
}

/// `ResolvedNode` holds `Arc`s throughout; a shallow pointer-preserving copy
/// lets multiple listeners share one server's graph without a `Clone` impl
/// (its `Mutex<HealthTracker>` inside `Fallback` is intentionally not
/// `Clone`, since independent copies would defeat shared health tracking).
fn clone_resolved(node: &ResolvedNode) -> ResolvedNode {
    match node {
        ResolvedNode::Exec(e) => ResolvedNode::Exec(e.clone()),
        ResolvedNode::Return => ResolvedNode::Return,
        ResolvedNode::Sequence(children) => {
            ResolvedNode::Sequence(children.iter().map(clone_resolved).collect())
        }
        ResolvedNode::If { cond, body, is_and } => ResolvedNode::If {
            cond: cond.clone(),
            body: Box::new(clone_resolved(body)),
            is_and: *is_and,
        },
        ResolvedNode::Parallel { branches, timeout } => ResolvedNode::Parallel {
            branches: branches.iter().map(clone_resolved).collect(),
            timeout: *timeout,
        },
        ResolvedNode::Fallback {
            primary,
            secondary,
            tracker,
        } => ResolvedNode::Fallback {
            primary: Box::new(clone_resolved(primary)),
            secondary: Box::new(clone_resolved(secondary)),
            tracker: tracker.clone(),
        },
    }
}

async fn spawn_listener(
    listener: ListenerConfig,
    exec: Arc<ResolvedNode>,
    server_timeout: Duration,
    metrics: Arc<Metrics>,
    buffer_pool: Arc<BufferPool>,
    coordinator: ShutdownCoordinator,
) -> Result<()> {
    if listener.proxy_protocol {
        return Err(DnsflowError::Other(anyhow::anyhow!(
            "PROXY protocol listeners are not implemented"
        )));
    }

    let protocol = listener.protocol.to_ascii_lowercase();
    let addr = listener.addr;
    let timeout = if server_timeout.is_zero() {
        DEFAULT_QUERY_TIMEOUT
    } else {
        server_timeout
    };

    match protocol.as_str() {
        "" | "udp" => {
            let socket = Arc::new(UdpSocket::bind(addr).await.map_err(CoreError::from)?);
            info!("udp listener bound to {}", addr);
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES));
            let task = tokio::spawn(run_udp(
                socket,
                exec,
                timeout,
                metrics,
                buffer_pool.clone(),
                semaphore,
                coordinator.clone(),
            ));
            coordinator.track(task).await;
        }
        "tcp" => {
            let tcp_listener = TcpListener::bind(addr).await.map_err(CoreError::from)?;
            info!("tcp listener bound to {}", addr);
            let idle = listener
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT);
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES));
            let task = tokio::spawn(run_tcp(
                tcp_listener,
                exec,
                timeout,
                idle,
                metrics,
                semaphore,
                coordinator.clone(),
            ));
            coordinator.track(task).await;
        }
        "dot" | "tls" => {
            let tcp_listener = TcpListener::bind(addr).await.map_err(CoreError::from)?;
            info!("dot listener bound to {}", addr);
            let acceptor = build_tls_acceptor(&listener)?;
            let idle = listener
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT);
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES));
            let task = tokio::spawn(run_dot(
                tcp_listener,
                acceptor,
                exec,
                timeout,
                idle,
                metrics,
                semaphore,
                coordinator.clone(),
            ));
            coordinator.track(task).await;
        }
        "doh" | "https" | "http" => {
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES));
            let task = tokio::spawn(run_doh(
                listener.clone(),
                exec,
                timeout,
                metrics,
                semaphore,
                coordinator.clone(),
            ));
            coordinator.track(task).await;
        }
        other => {
            return Err(DnsflowError::Other(anyhow::anyhow!(
                "unknown listener protocol `{}`",
                other
            )))
        }
    }
    Ok(())
}

/// Synthesize a SERVFAIL carrying the original id/question, for the cases
/// where the graph errored or produced no response.
fn servfail(query: &Message<Bytes>) -> Message<Bytes> {
    MessageBuilder::from_target(BytesMut::with_capacity(16))
        .expect("fresh buffer always succeeds")
        .start_answer(query, Rcode::ServFail)
        .expect("start_answer on a parsed query always succeeds")
        .into_message()
}

/// Run the graph for one query; returns `None` when the plugin chain asked
/// for a silent drop.
async fn process(exec: &ResolvedNode, query: Message<Bytes>, from: SocketAddr, is_tcp_client: bool, deadline: Duration) -> Option<Message<Bytes>> {
    let mut qc = QueryContext::new(query.clone(), from, is_tcp_client);
    let outcome = timeout(deadline, eval(exec, &mut qc)).await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("query from {} failed: {}", from, e);
            qc.status = Status::ServerFailed;
        }
        Err(_) => {
            warn!("query from {} exceeded its deadline", from);
            qc.status = Status::ServerFailed;
        }
    }
    qc.run_hooks().await;

    match qc.status {
        Status::Drop => None,
        Status::Responded if qc.response.is_some() => qc.response,
        _ => Some(servfail(&query)),
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    exec: Arc<ResolvedNode>,
    timeout: Duration,
    metrics: Arc<Metrics>,
    buffer_pool: Arc<BufferPool>,
    semaphore: Arc<Semaphore>,
    coordinator: ShutdownCoordinator,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let recv = tokio::select! {
            res = socket.recv_from(&mut buf) => res,
            _ = coordinator.cancelled() => break,
        };
        let (len, from) = match recv {
            Ok(v) => v,
            Err(e) => {
                error!("udp recv error: {}", e);
                continue;
            }
        };
        // Each datagram gets its own size-classed buffer from the pool
        // rather than a one-off `Vec` allocation, since the decoded query
        // (and any response the cache later stores) outlives this loop
        // iteration's scratch `buf`.
        let mut owned = buffer_pool.get(len);
        owned.extend_from_slice(&buf[..len]);
        let data = owned.freeze();
        metrics.queries_total.with_label_values(&["udp"]).inc();

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            debug!("udp listener saturated, dropping query from {}", from);
            continue;
        };
        let exec = exec.clone();
        let socket = socket.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let query = match unpack(data) {
                Ok(q) => q,
                Err(e) => {
                    debug!("malformed udp query from {}: {}", from, e);
                    return;
                }
            };
            let is_v4 = from.is_ipv4();
            let max_size = advertised_udp_size(&query, is_v4).max(512) as usize;

            if let Some(response) = process(&exec, query, from, false, timeout).await {
                let mut wire = pack(&response);
                if wire.len() > max_size {
                    wire = truncate(&response);
                }
                if let Err(e) = socket.send_to(&wire, from).await {
                    warn!("failed to send udp response to {}: {}", from, e);
                    metrics.responses_total.with_label_values(&["udp", "error"]).inc();
                } else {
                    metrics.responses_total.with_label_values(&["udp", "ok"]).inc();
                }
            }
        });
    }
}

/// Rebuild `msg` with the TC bit set and only the question section, per
/// RFC 1035 §4.1.1 truncation. Mutating the header in place follows the
/// same `BytesMut`-reparse idiom as `droute::codec::rewrite_id`.
fn truncate(msg: &Message<Bytes>) -> Bytes {
    let header_only = MessageBuilder::from_target(BytesMut::with_capacity(32))
        .expect("fresh buffer always succeeds")
        .start_answer(msg, msg.header().rcode())
        .expect("start_answer on an already-parsed message always succeeds")
        .into_message();
    let mut mutable = Message::from_octets(BytesMut::from(header_only.as_slice()))
        .expect("already-parsed message reparses");
    mutable.header_mut().set_tc(true);
    pack(&mutable.for_slice())
}

async fn run_tcp(
    listener: TcpListener,
    exec: Arc<ResolvedNode>,
    timeout_dur: Duration,
    idle: Duration,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    coordinator: ShutdownCoordinator,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = coordinator.cancelled() => break,
        };
        let (stream, from) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("tcp accept error: {}", e);
                continue;
            }
        };
        let exec = exec.clone();
        let metrics = metrics.clone();
        let semaphore = semaphore.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            serve_stream(stream, from, exec, timeout_dur, idle, metrics, semaphore, "tcp", coordinator).await;
        });
    }
}

async fn run_dot(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    exec: Arc<ResolvedNode>,
    timeout_dur: Duration,
    idle: Duration,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    coordinator: ShutdownCoordinator,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = coordinator.cancelled() => break,
        };
        let (stream, from) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("dot accept error: {}", e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let exec = exec.clone();
        let metrics = metrics.clone();
        let semaphore = semaphore.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    warn!("tls handshake with {} failed: {}", from, e);
                    return;
                }
                Err(_) => {
                    warn!("tls handshake with {} timed out", from);
                    return;
                }
            };
            serve_stream(
                tls_stream,
                from,
                exec,
                timeout_dur,
                idle,
                metrics,
                semaphore,
                "dot",
                coordinator,
            )
            .await;
        });
    }
}

/// Per-connection reader loop shared by TCP and DoT: read a length-prefixed
/// query, spawn its processing as its own task so replies may return out of
/// order (RFC 7766), and serialize writes behind a mutex.
async fn serve_stream<S>(
    stream: S,
    from: SocketAddr,
    exec: Arc<ResolvedNode>,
    timeout_dur: Duration,
    idle: Duration,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    protocol: &'static str,
    coordinator: ShutdownCoordinator,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(AsyncMutex::new(writer));

    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            res = timeout(idle, reader.read_exact(&mut len_buf)) => res,
            _ = coordinator.cancelled() => break,
        };
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                debug!("{} connection from {} idle timeout", protocol, from);
                break;
            }
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if validate_framed_len(len).is_err() {
            break;
        }
        let mut msg_buf = vec![0u8; len];
        if reader.read_exact(&mut msg_buf).await.is_err() {
            break;
        }

        metrics.queries_total.with_label_values(&[protocol]).inc();
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            debug!("{} listener saturated, dropping query from {}", protocol, from);
            continue;
        };

        let exec = exec.clone();
        let writer = writer.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let query = match unpack(Bytes::from(msg_buf)) {
                Ok(q) => q,
                Err(e) => {
                    debug!("malformed {} query from {}: {}", protocol, from, e);
                    return;
                }
            };
            if let Some(response) = process(&exec, query, from, true, timeout_dur).await {
                let wire = pack(&response);
                if validate_outgoing_len(wire.len()).is_err() {
                    return;
                }
                let mut framed = Vec::with_capacity(2 + wire.len());
                framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
                framed.extend_from_slice(&wire);

                let mut guard = writer.lock().await;
                match timeout(TCP_WRITE_DEADLINE, guard.write_all(&framed)).await {
                    Ok(Ok(())) => {
                        metrics.responses_total.with_label_values(&[protocol, "ok"]).inc();
                    }
                    _ => {
                        metrics.responses_total.with_label_values(&[protocol, "error"]).inc();
                    }
                }
            }
        });
    }
}

fn build_tls_acceptor(listener: &ListenerConfig) -> Result<TlsAcceptor> {
    let cert_path = listener
        .cert
        .as_ref()
        .ok_or_else(|| DnsflowError::Other(anyhow::anyhow!("dot listener requires `cert`")))?;
    let key_path = listener
        .key
        .as_ref()
        .ok_or_else(|| DnsflowError::Other(anyhow::anyhow!("dot listener requires `key`")))?;

    let cert_file = std::fs::File::open(cert_path).map_err(CoreError::from)?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!(e)))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let key_file = std::fs::File::open(key_path).map_err(CoreError::from)?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!(e)))?;
    let key = rustls::PrivateKey(
        keys.pop()
            .ok_or_else(|| DnsflowError::Other(anyhow::anyhow!("no private key found in {}", key_path.display())))?,
    );

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!(e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

// --- DoH / plain HTTP + admin surface -------------------------------------

mod http {
    use super::*;
    use axum::{
        body::Bytes as AxumBytes,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use std::collections::HashMap;

    #[derive(Clone)]
    pub(super) struct DohState {
        pub exec: Arc<ResolvedNode>,
        pub timeout: Duration,
        pub metrics: Arc<Metrics>,
        pub get_user_ip_from_header: Option<String>,
        pub url_path: String,
    }

    pub(super) fn router(state: DohState) -> Router {
        let path = state.url_path.clone();
        Router::new()
            .route(&path, get(doh_get).post(doh_post))
            .with_state(state)
    }

    fn client_addr(headers: &HeaderMap, fallback: SocketAddr, header_name: &Option<String>) -> SocketAddr {
        if let Some(name) = header_name {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                if let Ok(ip) = value.trim().parse() {
                    return SocketAddr::new(ip, fallback.port());
                }
            }
        }
        fallback
    }

    async fn doh_get(
        State(state): State<DohState>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        let Some(encoded) = params.get("dns") else {
            return (StatusCode::BAD_REQUEST, "missing dns parameter").into_response();
        };
        let Ok(wire) = base64::decode_config(encoded, base64::URL_SAFE_NO_PAD) else {
            return (StatusCode::BAD_REQUEST, "invalid base64url").into_response();
        };
        respond(state, wire, headers, "0.0.0.0:0".parse().unwrap()).await
    }

    async fn doh_post(
        State(state): State<DohState>,
        headers: HeaderMap,
        body: AxumBytes,
    ) -> impl IntoResponse {
        respond(state, body.to_vec(), headers, "0.0.0.0:0".parse().unwrap()).await
    }

    async fn respond(state: DohState, wire: Vec<u8>, headers: HeaderMap, fallback: SocketAddr) -> axum::response::Response {
        state.metrics.queries_total.with_label_values(&["doh"]).inc();
        let from = client_addr(&headers, fallback, &state.get_user_ip_from_header);

        let query = match unpack(Bytes::from(wire)) {
            Ok(q) => q,
            Err(_) => return (StatusCode::BAD_REQUEST, "malformed dns message").into_response(),
        };

        match process(&state.exec, query, from, true, state.timeout).await {
            Some(response) => {
                state.metrics.responses_total.with_label_values(&["doh", "ok"]).inc();
                (
                    StatusCode::OK,
                    [("content-type", "application/dns-message")],
                    pack(&response).to_vec(),
                )
                    .into_response()
            }
            None => StatusCode::NO_CONTENT.into_response(),
        }
    }

    #[derive(Clone)]
    pub(super) struct AdminState {
        pub metrics: Arc<Metrics>,
        pub plugins: Arc<PluginMap>,
    }

    pub(super) fn admin_router(metrics: Arc<Metrics>, plugins: Arc<PluginMap>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/debug/pprof/*path", get(pprof_stub))
            .route("/plugins/:tag", get(plugin_status))
            .with_state(AdminState { metrics, plugins })
    }

    async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
        match state.metrics.export() {
            Ok(body) => (StatusCode::OK, [("content-type", "text/plain")], body).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    /// Rust has no pprof-compatible profiling endpoint equivalent; document
    /// the gap instead of silently dropping the route.
    async fn pprof_stub() -> impl IntoResponse {
        (StatusCode::NOT_FOUND, "pprof endpoints are not implemented")
    }

    /// `GET /plugins/{tag}`: the snapshot a plugin's `Introspect` capability
    /// returns, or 404 if the tag is unknown or the plugin doesn't implement
    /// it.
    async fn plugin_status(State(state): State<AdminState>, Path(tag): Path<String>) -> impl IntoResponse {
        let Ok(instance) = state.plugins.get(&droute::Label::from(tag.as_str())) else {
            return (StatusCode::NOT_FOUND, "unknown plugin tag").into_response();
        };
        match &instance.introspect {
            Some(introspect) => Json(introspect.snapshot()).into_response(),
            None => (StatusCode::NOT_FOUND, "plugin does not expose introspection").into_response(),
        }
    }
}

async fn run_doh(
    listener: ListenerConfig,
    exec: Arc<ResolvedNode>,
    timeout: Duration,
    metrics: Arc<Metrics>,
    _semaphore: Arc<Semaphore>,
    coordinator: ShutdownCoordinator,
) {
    let state = http::DohState {
        exec,
        timeout,
        metrics,
        get_user_ip_from_header: listener.get_user_ip_from_header.clone(),
        url_path: listener.url_path.clone().unwrap_or_else(|| "/dns-query".to_string()),
    };
    let app = http::router(state);

    let shutdown = {
        let coordinator = coordinator.clone();
        async move { coordinator.cancelled().await }
    };

    let server = axum::Server::bind(&listener.addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown);

    info!("doh listener bound to {}", listener.addr);
    if let Err(e) = server.await {
        error!("doh listener on {} failed: {}", listener.addr, e);
    }
}

async fn spawn_admin(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    plugins: Arc<PluginMap>,
    coordinator: ShutdownCoordinator,
) {
    let app = http::admin_router(metrics, plugins);
    let shutdown = {
        let coordinator = coordinator.clone();
        async move { coordinator.cancelled().await }
    };
    let task = tokio::spawn(async move {
        info!("admin http surface bound to {}", addr);
        let server = axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown);
        if let Err(e) = server.await {
            error!("admin http surface on {} failed: {}", addr, e);
        }
    });
    coordinator.track(task).await;
}
