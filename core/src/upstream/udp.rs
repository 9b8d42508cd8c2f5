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

//! Plain UDP upstream, with optional socket-reuse pooling and stale-reply
//! filtering. Grounded on `droute`'s `udp.rs` `ConnInitiator`/`QHandle` pair,
//! collapsed here into one concrete type since this crate builds a single
//! uniform `Upstream` rather than a generic connection-pool abstraction.

use super::{stream::StreamUpstream, Protocol, STALE_RESET_WINDOW, Upstream, UpstreamError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool::managed::{self, Manager, Pool, RecycleResult};
use domain::base::Message;
use std::{net::SocketAddr, time::{Duration, Instant}};
use tokio::{net::UdpSocket, time::timeout};

struct UdpManager {
    addr: SocketAddr,
}

#[async_trait]
impl Manager for UdpManager {
    type Type = UdpSocket;
    type Error = std::io::Error;

    async fn create(&self) -> Result<UdpSocket, std::io::Error> {
        dial(self.addr).await
    }

    async fn recycle(&self, _obj: &mut UdpSocket) -> RecycleResult<std::io::Error> {
        Ok(())
    }
}

async fn dial(addr: SocketAddr) -> Result<UdpSocket, std::io::Error> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Plain UDP upstream. When `idle_timeout > 0` a pool of connected sockets is
/// reused across exchanges; otherwise every exchange dials and discards its
/// own socket.
pub struct UdpUpstream {
    addr: SocketAddr,
    pool: Option<Pool<UdpManager>>,
    read_timeout: Duration,
    /// Re-issues a reply carrying TC=1 over TCP, per the mosdns-derived
    /// truncation-retry behaviour: a small one-connection pool is enough
    /// since a healthy resolver only truncates occasionally.
    tcp_fallback: StreamUpstream,
}

impl UdpUpstream {
    /// Build a UDP upstream. `idle_timeout <= 0` disables socket pooling.
    pub fn new(addr: SocketAddr, idle_timeout: Duration, read_timeout: Duration) -> Result<Self, UpstreamError> {
        let pool = if idle_timeout.is_zero() {
            None
        } else {
            Some(
                Pool::builder(UdpManager { addr })
                    .max_size(16)
                    .runtime(deadpool::Runtime::Tokio1)
                    .build()
                    .map_err(|e| UpstreamError::InvalidEndpoint(e.to_string()))?,
            )
        };
        Ok(Self {
            addr,
            pool,
            read_timeout,
            tcp_fallback: StreamUpstream::tcp(addr, 1, idle_timeout, read_timeout),
        })
    }

    async fn exchange_on(
        socket: &UdpSocket,
        query: &Message<Bytes>,
        read_timeout: Duration,
    ) -> Result<Message<Bytes>, UpstreamError> {
        let wire = query.as_slice();
        let checked_out_at = Instant::now();
        if let Err(e) = socket.send(wire).await {
            if checked_out_at.elapsed() < STALE_RESET_WINDOW {
                return Err(UpstreamError::ConnectionClosed);
            }
            return Err(UpstreamError::Io(e));
        }

        let deadline = tokio::time::Instant::now() + read_timeout;
        loop {
            let mut buf = BytesMut::with_capacity(4096);
            buf.resize(4096, 0);
            let len = timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), socket.recv(&mut buf))
                .await
                .map_err(|_| UpstreamError::Timeout)??;
            buf.resize(len, 0);
            let reply = match Message::from_octets(buf.freeze()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            // Drop stale replies: pooled sockets may still hold packets from
            // an earlier query, or a spoofed reply may race a genuine one.
            if reply.header().id() != query.header().id() {
                continue;
            }
            return Ok(reply);
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(
        &self,
        query: &Message<Bytes>,
        is_tcp_client: bool,
    ) -> Result<Message<Bytes>, UpstreamError> {
        let reply = match &self.pool {
            Some(pool) => {
                let conn = pool
                    .get()
                    .await
                    .map_err(|e| UpstreamError::InvalidEndpoint(e.to_string()))?;
                match Self::exchange_on(&conn, query, self.read_timeout).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        // Evict instead of returning a possibly-desynced
                        // socket to the pool.
                        managed::Object::take(conn);
                        return Err(e);
                    }
                }
            }
            None => {
                let socket = dial(self.addr).await?;
                Self::exchange_on(&socket, query, self.read_timeout).await?
            }
        };

        // mosdns-derived behaviour: a truncated UDP reply is retried over
        // TCP on the client's behalf, unless the client is already TCP/DoT/
        // DoH (no truncation to correct for there).
        if reply.header().tc() && !is_tcp_client {
            return self.tcp_fallback.exchange(query, true).await;
        }
        Ok(reply)
    }
}

/// `UdpUpstream` only ever speaks [`Protocol::Udp`].
pub const PROTOCOL: Protocol = Protocol::Udp;

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{Dname, MessageBuilder, Rtype};
    use std::str::FromStr;
    use tokio::net::UdpSocket as TokioUdpSocket;

    fn build_query(id: u16) -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(64))
            .unwrap()
            .question();
        builder.header_mut().set_id(id);
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        builder.push((&name, Rtype::A)).unwrap();
        builder.into_message()
    }

    #[tokio::test]
    async fn preserves_query_id_against_echo_server() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((len, from)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..len], from).await;
            }
        });

        let upstream = UdpUpstream::new(server_addr, Duration::ZERO, Duration::from_secs(2)).unwrap();
        let query = build_query(1234);
        let response = upstream.exchange(&query, false).await.unwrap();
        assert_eq!(response.header().id(), 1234);
    }
}
