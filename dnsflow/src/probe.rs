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

//! `probe` subcommand implementations: raw TCP diagnostics against a server
//! under test, built directly on the same framing helpers
//! (`droute::codec::{pack, validate_framed_len}`) the ingress/upstream layers
//! use, rather than going through the pooled `StreamUpstream` (a probe wants
//! to observe raw connection behaviour, not hide it behind pooling).

use bytes::{Bytes, BytesMut};
use droute::codec::{pack, unpack, validate_framed_len};
use domain::base::{Dname, Message, MessageBuilder, Rtype};
use std::{net::SocketAddr, str::FromStr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout, Instant},
};

use crate::{
    cli::PROBE_TIMEOUT,
    error::{DnsflowError, Result},
};

fn probe_query(id: u16) -> Message<Bytes> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(64))
        .expect("fresh buffer always succeeds")
        .question();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);
    let name = Dname::<Bytes>::from_str("dnsflow-probe.example.").expect("valid fqdn literal");
    builder
        .push((&name, Rtype::A))
        .expect("single question always fits a fresh buffer");
    builder.into_message()
}

async fn write_framed(stream: &mut TcpStream, query: &Message<Bytes>) -> Result<()> {
    let wire = pack(query);
    let mut framed = Vec::with_capacity(2 + wire.len());
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);
    stream
        .write_all(&framed)
        .await
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!("write failed: {}", e)))
}

async fn read_framed(stream: &mut TcpStream) -> Result<Message<Bytes>> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!("read failed: {}", e)))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    validate_framed_len(len).map_err(|e| DnsflowError::Other(anyhow::anyhow!(e)))?;
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!("short read: {}", e)))?;
    unpack(Bytes::from(buf)).map_err(|e| DnsflowError::Other(anyhow::anyhow!(e)))
}

/// Send one query, read one response, then keep the connection open and
/// probe at growing intervals until the peer closes it; reports the
/// observed idle window.
pub async fn idle_timeout(server: SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!("connect to {} failed: {}", server, e)))?;
    write_framed(&mut stream, &probe_query(1)).await?;
    read_framed(&mut stream).await?;
    println!("connected to {}, probing idle window...", server);

    let started = Instant::now();
    let mut probe_at = Duration::from_secs(1);
    loop {
        tokio::time::sleep(probe_at).await;
        let mut one_byte = [0u8; 1];
        match timeout(Duration::from_millis(500), stream.read(&mut one_byte)).await {
            Ok(Ok(0)) => {
                println!(
                    "connection closed by peer after ~{:?} idle",
                    started.elapsed()
                );
                return Ok(());
            }
            Ok(Ok(_)) => {
                println!("unexpected data on an idle connection");
                return Ok(());
            }
            Ok(Err(e)) => {
                println!("connection error after ~{:?}: {}", started.elapsed(), e);
                return Ok(());
            }
            Err(_) => {
                // still open; keep waiting, doubling the probe interval up to a cap
                probe_at = (probe_at * 2).min(Duration::from_secs(30));
                if started.elapsed() > Duration::from_secs(120) {
                    println!("connection still open after 120s, giving up");
                    return Ok(());
                }
            }
        }
    }
}

/// Send two queries sequentially on the same connection and report whether
/// the second one is answered (connection reuse) or the peer closed first.
pub async fn conn_reuse(server: SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!("connect to {} failed: {}", server, e)))?;

    write_framed(&mut stream, &probe_query(1)).await?;
    let first = timeout(PROBE_TIMEOUT, read_framed(&mut stream))
        .await
        .map_err(|_| DnsflowError::Other(anyhow::anyhow!("first query timed out")))??;
    println!("first query answered (id={})", first.header().id());

    write_framed(&mut stream, &probe_query(2)).await?;
    match timeout(PROBE_TIMEOUT, read_framed(&mut stream)).await {
        Ok(Ok(second)) => {
            println!(
                "second query answered on the same connection (id={}): connection reuse supported",
                second.header().id()
            );
        }
        Ok(Err(e)) => println!("second query failed, connection reuse not supported: {}", e),
        Err(_) => println!("second query timed out, connection reuse not supported"),
    }
    Ok(())
}

/// Write `count` queries back-to-back without waiting for any response, then
/// collect `count` responses and report whether their ids came back
/// reordered relative to the order they were sent.
pub async fn pipeline(server: SocketAddr, count: usize) -> Result<()> {
    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!("connect to {} failed: {}", server, e)))?;

    let ids: Vec<u16> = (1..=count as u16).collect();
    for &id in &ids {
        write_framed(&mut stream, &probe_query(id)).await?;
    }

    let mut received = Vec::with_capacity(count);
    for _ in 0..count {
        let response = timeout(PROBE_TIMEOUT, read_framed(&mut stream))
            .await
            .map_err(|_| DnsflowError::Other(anyhow::anyhow!("pipelined read timed out")))??;
        received.push(response.header().id());
    }

    let all_present = ids.iter().all(|id| received.contains(id));
    if !all_present {
        return Err(DnsflowError::Other(anyhow::anyhow!(
            "expected ids {:?}, got {:?}",
            ids,
            received
        )));
    }
    let in_order = received == ids;
    println!(
        "received {} responses for ids {:?}; order: {}",
        received.len(),
        received,
        if in_order { "in-order" } else { "reordered (RFC 7766 pipelining observed)" }
    );
    Ok(())
}
