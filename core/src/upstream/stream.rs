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

//! TCP and DNS-over-TLS upstream: a single socket multiplexes many
//! concurrent in-flight queries, disambiguated by a rewritten transaction
//! id. Grounded on `droute`'s `qhandle` pool shape (`ConnInitiator`/
//! `ConnPool`/`tls-rustls.rs`) for the dial/pool skeleton, extended with a
//! per-connection id -> oneshot map grounded on `RoeeJ-heimdall`'s
//! `DashMap`-keyed in-flight pattern (adapted from broadcast fan-out to a
//! single best-match waiter per id).

use super::{Protocol, STALE_RESET_WINDOW, Upstream, UpstreamError};
use crate::codec::{rewrite_id, validate_framed_len, validate_outgoing_len};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use domain::base::Message;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{oneshot, Mutex as AsyncMutex},
    time::timeout,
};

/// A boxed bidirectional stream: a raw `TcpStream` for plain TCP, or a
/// `tokio_rustls` `TlsStream<TcpStream>` for DoT.
trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
type DynStream = Box<dyn AsyncStream>;

/// How a connection is established.
enum Dialer {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP (DNS-over-TLS), with a 5-second handshake deadline.
    Dot {
        connector: tokio_rustls::TlsConnector,
        server_name: String,
    },
}

impl Dialer {
    async fn dial(&self, addr: SocketAddr) -> Result<DynStream, UpstreamError> {
        let tcp = TcpStream::connect(addr).await?;
        match self {
            Dialer::Tcp => Ok(Box::new(tcp)),
            Dialer::Dot {
                connector,
                server_name,
            } => {
                let name = rustls::ServerName::try_from(server_name.as_str())
                    .map_err(|_| UpstreamError::InvalidEndpoint(server_name.clone()))?;
                let tls = timeout(Duration::from_secs(5), connector.connect(name, tcp))
                    .await
                    .map_err(|_| UpstreamError::Timeout)??;
                Ok(Box::new(tls))
            }
        }
    }
}

fn rustls_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

type PendingReply = oneshot::Sender<Result<Message<Bytes>, UpstreamError>>;

/// One multiplexed connection: a single reader task dispatches framed
/// responses to the waiter registered under their id; writers serialise
/// through `write_half`'s lock.
struct Mux {
    write_half: AsyncMutex<WriteHalf<DynStream>>,
    next_id: AtomicU16,
    queue: Arc<DashMap<u16, PendingReply>>,
    closed: Arc<AtomicBool>,
    last_used: std::sync::Mutex<Instant>,
}

impl Mux {
    fn new(stream: DynStream) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let queue: Arc<DashMap<u16, PendingReply>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        spawn_reader(read_half, queue.clone(), closed.clone());
        Arc::new(Self {
            write_half: AsyncMutex::new(write_half),
            next_id: AtomicU16::new(0),
            queue,
            closed,
            last_used: std::sync::Mutex::new(Instant::now()),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    async fn exchange(
        &self,
        query: &Message<Bytes>,
        read_timeout: Duration,
    ) -> Result<Message<Bytes>, UpstreamError> {
        let rewritten_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut outgoing =
            Message::from_octets(BytesMut::from(query.as_slice())).expect("query already parsed");
        outgoing.header_mut().set_id(rewritten_id);
        let wire = outgoing.as_slice();
        validate_outgoing_len(wire.len())?;

        let (tx, rx) = oneshot::channel();
        self.queue.insert(rewritten_id, tx);

        let mut framed = BytesMut::with_capacity(2 + wire.len());
        framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        framed.extend_from_slice(wire);

        let checked_out_at = Instant::now();
        {
            let mut write_half = self.write_half.lock().await;
            if let Err(e) = write_half.write_all(&framed).await {
                self.queue.remove(&rewritten_id);
                if checked_out_at.elapsed() < STALE_RESET_WINDOW {
                    return Err(UpstreamError::ConnectionClosed);
                }
                return Err(UpstreamError::Io(e));
            }
        }
        self.touch();

        let reply = timeout(read_timeout, rx).await.map_err(|_| {
            self.queue.remove(&rewritten_id);
            UpstreamError::Timeout
        })?;
        let reply = reply.map_err(|_| UpstreamError::ConnectionClosed)??;
        self.touch();
        Ok(reply)
    }
}

fn spawn_reader(
    mut read_half: ReadHalf<DynStream>,
    queue: Arc<DashMap<u16, PendingReply>>,
    closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 2];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            if validate_framed_len(len).is_err() {
                break;
            }
            let mut body = BytesMut::with_capacity(len);
            body.resize(len, 0);
            if read_half.read_exact(&mut body).await.is_err() {
                break;
            }
            let msg = match Message::from_octets(body.freeze()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if let Some((_, tx)) = queue.remove(&msg.header().id()) {
                let _ = tx.send(Ok(msg));
            }
        }
        closed.store(true, Ordering::Release);
        // Drain and wake every still-pending waiter with a closed error.
        let pending: Vec<u16> = queue.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, tx)) = queue.remove(&id) {
                let _ = tx.send(Err(UpstreamError::ConnectionClosed));
            }
        }
    });
}

type DialFuture = Shared<BoxFuture<'static, Result<Arc<Mux>, String>>>;

struct PoolState {
    conns: Vec<Arc<Mux>>,
    dialing: Option<DialFuture>,
}

/// A small, bounded set of multiplexed connections to one endpoint, with
/// dial deduplication: concurrent callers racing to establish the first
/// connection share one in-flight dial.
pub struct StreamUpstream {
    addr: SocketAddr,
    dialer: Dialer,
    max_conns: usize,
    idle_timeout: Duration,
    read_timeout: Duration,
    state: AsyncMutex<PoolState>,
}

impl StreamUpstream {
    /// Build a plain-TCP upstream.
    pub fn tcp(addr: SocketAddr, max_conns: usize, idle_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            addr,
            dialer: Dialer::Tcp,
            max_conns: max_conns.max(1),
            idle_timeout,
            read_timeout,
            state: AsyncMutex::new(PoolState {
                conns: Vec::new(),
                dialing: None,
            }),
        }
    }

    /// Build a DNS-over-TLS upstream, verifying against the webpki Mozilla
    /// root set against `server_name`.
    pub fn dot(
        addr: SocketAddr,
        server_name: String,
        max_conns: usize,
        idle_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let connector = tokio_rustls::TlsConnector::from(Arc::new(rustls_client_config()));
        Self {
            addr,
            dialer: Dialer::Dot {
                connector,
                server_name,
            },
            max_conns: max_conns.max(1),
            idle_timeout,
            read_timeout,
            state: AsyncMutex::new(PoolState {
                conns: Vec::new(),
                dialing: None,
            }),
        }
    }

    async fn dial_new(addr: SocketAddr, dialer: &'_ Dialer) -> Result<Arc<Mux>, UpstreamError> {
        let stream = timeout(Duration::from_secs(5), dialer.dial(addr))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        Ok(Mux::new(stream))
    }

    async fn get_conn(&self) -> Result<Arc<Mux>, UpstreamError> {
        let mut state = self.state.lock().await;
        state.conns.retain(|c| {
            !c.is_closed() && (self.idle_timeout.is_zero() || c.idle_for() < self.idle_timeout)
        });

        if let Some(conn) = state.conns.first() {
            return Ok(conn.clone());
        }

        if state.conns.len() < self.max_conns {
            if let Some(dialing) = state.dialing.clone() {
                drop(state);
                return dialing.await.map_err(UpstreamError::DialFailed);
            }

            let addr = self.addr;
            // `Dialer` isn't `'static`-cloneable cheaply for non-TLS variants'
            // captured closures; clone what the dial needs instead.
            let server_name = match &self.dialer {
                Dialer::Tcp => None,
                Dialer::Dot { server_name, .. } => Some(server_name.clone()),
            };
            let connector = match &self.dialer {
                Dialer::Tcp => None,
                Dialer::Dot { connector, .. } => Some(connector.clone()),
            };
            let fut: BoxFuture<'static, Result<Arc<Mux>, String>> = Box::pin(async move {
                let dialer = match (server_name, connector) {
                    (Some(sn), Some(c)) => Dialer::Dot {
                        connector: c,
                        server_name: sn,
                    },
                    _ => Dialer::Tcp,
                };
                Self::dial_new(addr, &dialer).await.map_err(|e| e.to_string())
            });
            let shared = fut.shared();
            state.dialing = Some(shared.clone());
            drop(state);

            let result = shared.await;
            let mut state = self.state.lock().await;
            state.dialing = None;
            let conn = result.map_err(UpstreamError::DialFailed)?;
            state.conns.push(conn.clone());
            return Ok(conn);
        }

        // At cap: await the nearest in-flight dial, or hand back the first
        // (possibly busy) connection — the per-connection multiplexer
        // tolerates concurrent callers regardless.
        if let Some(dialing) = state.dialing.clone() {
            drop(state);
            return dialing.await.map_err(UpstreamError::DialFailed);
        }
        state
            .conns
            .first()
            .cloned()
            .ok_or(UpstreamError::ConnectionClosed)
    }
}

#[async_trait]
impl Upstream for StreamUpstream {
    async fn exchange(
        &self,
        query: &Message<Bytes>,
        _is_tcp_client: bool,
    ) -> Result<Message<Bytes>, UpstreamError> {
        let original_id = query.header().id();
        let conn = self.get_conn().await?;
        let reply = match conn.exchange(query, self.read_timeout).await {
            Ok(reply) => reply,
            Err(UpstreamError::ConnectionClosed) => {
                // Retry once against a freshly dialled connection.
                let mut state = self.state.lock().await;
                state.conns.retain(|c| !Arc::ptr_eq(c, &conn));
                drop(state);
                let fresh = Self::dial_new(self.addr, &self.dialer).await?;
                let mut state = self.state.lock().await;
                state.conns.push(fresh.clone());
                drop(state);
                fresh.exchange(query, self.read_timeout).await?
            }
            Err(e) => return Err(e),
        };
        Ok(rewrite_id(reply, original_id))
    }
}


/// `StreamUpstream` speaks either plain TCP or DoT.
pub fn protocol_for(is_tls: bool) -> Protocol {
    if is_tls {
        Protocol::Dot
    } else {
        Protocol::Tcp
    }
}
