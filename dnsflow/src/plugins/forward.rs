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

//! The `forward` plugin: races a bundle of upstreams and single-flights
//! identical in-flight queries.
//!
//! Generalizes the teacher's `actions/query.rs` `Query` action (send to one
//! named upstream) into a self-contained executable over `droute::dispatch`'s
//! `Bundle`/`SingleFlight`, since the spec's executable graph has no separate
//! "named upstream group" concept — a `forward` plugin owns its bundle
//! directly.

use async_trait::async_trait;
use droute::{
    dispatch::{Bundle, BundleEntry, SingleFlight},
    error::{ConfigError, CoreError},
    graph::{Executable, PluginInstance},
    query::QueryContext,
    registry::TypeRegistry,
    upstream::{doh::Framing, doh::DohUpstream, stream::StreamUpstream, udp::UdpUpstream, Upstream},
    Label,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};

fn default_timeout() -> u64 {
    5
}

fn default_max_conns() -> usize {
    4
}

#[derive(Debug, Deserialize)]
struct UpstreamSpec {
    /// `host:port` for udp/tcp/dot, or the full `https://...` URL for doh.
    addr: String,
    /// `""`/`udp`, `tcp`, `dot`/`tls`, `doh`/`https`. Empty defaults to udp.
    #[serde(default)]
    protocol: String,
    /// Accept this upstream's answer regardless of rcode. The first
    /// upstream in a bundle is always trusted regardless of this flag.
    #[serde(default)]
    trusted: bool,
    /// TLS server name (dot) — required for dot, ignored otherwise.
    name: Option<String>,
    /// DoH framing: `"get"` (default) or `"post"`.
    #[serde(default)]
    get: Option<bool>,
    /// SOCKS5 proxy URL for DoH.
    proxy: Option<String>,
    #[serde(default = "default_max_conns")]
    max_conns: usize,
}

#[derive(Debug, Deserialize)]
struct ForwardArgs {
    upstreams: Vec<UpstreamSpec>,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn invalid(tag: &Label, source: serde_yaml::Error) -> ConfigError {
    ConfigError::InvalidArgs {
        tag: tag.clone(),
        source,
    }
}

fn build_upstream(spec: &UpstreamSpec, timeout: Duration) -> Result<Arc<dyn Upstream>, ConfigError> {
    let proto = spec.protocol.to_ascii_lowercase();
    let upstream: Arc<dyn Upstream> = match proto.as_str() {
        "" | "udp" => {
            let addr: SocketAddr = spec
                .addr
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid_msg(e.to_string()))?;
            Arc::new(
                UdpUpstream::new(addr, Duration::from_secs(30), timeout)
                    .map_err(|e| invalid_msg(e.to_string()))?,
            )
        }
        "tcp" => {
            let addr: SocketAddr = spec
                .addr
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid_msg(e.to_string()))?;
            Arc::new(StreamUpstream::tcp(addr, spec.max_conns, Duration::from_secs(10), timeout))
        }
        "dot" | "tls" => {
            let addr: SocketAddr = spec
                .addr
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid_msg(e.to_string()))?;
            let server_name = spec.name.clone().unwrap_or_default();
            Arc::new(StreamUpstream::dot(
                addr,
                server_name,
                spec.max_conns,
                Duration::from_secs(10),
                timeout,
            ))
        }
        "doh" | "https" => {
            let framing = if spec.get.unwrap_or(true) {
                Framing::Get
            } else {
                Framing::Post
            };
            Arc::new(
                DohUpstream::new(&spec.addr, framing, spec.max_conns, timeout, spec.proxy.clone())
                    .map_err(|e| invalid_msg(e.to_string()))?,
            )
        }
        other => return Err(invalid_msg(format!("unknown upstream protocol `{}`", other))),
    };
    Ok(upstream)
}

fn invalid_msg(msg: String) -> ConfigError {
    ConfigError::InvalidArgs {
        tag: Label::from(""),
        source: serde::de::Error::custom(msg),
    }
}

/// Forwards a query to a bundle of upstreams, racing them per
/// `droute::dispatch::exchange_parallel` and deduplicating identical
/// concurrently in-flight queries via `SingleFlight`.
pub struct ForwardPlugin {
    bundle: Arc<Bundle>,
    dedup: SingleFlight,
}

impl ForwardPlugin {
    fn new(bundle: Bundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
            dedup: SingleFlight::new(),
        }
    }
}

#[async_trait]
impl Executable for ForwardPlugin {
    async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError> {
        match self
            .dedup
            .exchange(self.bundle.clone(), qc.query.clone(), qc.is_tcp_client)
            .await
        {
            Ok(response) => {
                qc.response = Some(response);
                qc.status = droute::query::Status::Responded;
            }
            Err(e) => {
                qc.status = droute::query::Status::ServerFailed;
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Register the `forward` plugin type.
pub fn register(registry: &TypeRegistry) {
    registry.register(
        "forward",
        Box::new(|tag, args| {
            let args: ForwardArgs = serde_yaml::from_value(args).map_err(|e| invalid(&tag, e))?;
            let timeout = Duration::from_secs(args.timeout);
            let entries = args
                .upstreams
                .iter()
                .map(|spec| {
                    Ok(BundleEntry {
                        upstream: build_upstream(spec, timeout)?,
                        trusted: spec.trusted,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            if entries.is_empty() {
                return Err(invalid(
                    &tag,
                    serde::de::Error::custom("forward plugin requires at least one upstream"),
                ));
            }
            let plugin = ForwardPlugin::new(Bundle::new(entries));
            Ok(PluginInstance::executable(tag, Arc::new(plugin)))
        }),
    );
}
