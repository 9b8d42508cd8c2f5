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

//! The `hosts` plugin: classic `ip name...` static entries, answered with a
//! synthetic NOERROR A/AAAA response on a hit. A miss (unknown name, or a
//! name with no entry of the queried family) leaves the context `Unhandled`
//! so the sequence falls through to the next plugin, typically `forward`.
//!
//! Entries load through the same `data_providers` tag indirection used by
//! the `domain`/`client_ipcidr` matcher-plugin factories in
//! `matcher_plugins.rs`; the NOERROR answer is built with the same
//! `start_answer`-based pattern as `blackhole.rs`'s SOA synthesis, pushing
//! `A`/`Aaaa` records into the answer section instead of an SOA into
//! additional.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::{
    base::{iana::Rcode, Message, MessageBuilder, Rtype},
    rdata::{Aaaa, A},
};
use droute::{
    error::{ConfigError, CoreError},
    graph::{Executable, PluginInstance},
    query::{QueryContext, Status},
    registry::TypeRegistry,
};
use serde::Deserialize;
use std::{collections::HashMap, net::IpAddr, sync::Arc};

use super::data::DataProviders;

fn default_ttl() -> u32 {
    60
}

#[derive(Debug, Default, Deserialize)]
struct HostsArgs {
    /// Data-provider tag whose lines are `ip name...` entries, one per line.
    provider: Option<String>,
    #[serde(default)]
    entries: Vec<String>,
    #[serde(default = "default_ttl")]
    ttl: u32,
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Parse `ip name...` lines into a name -> addresses table; ill-formed lines
/// (no address, or an address that doesn't parse) are skipped.
fn parse_entries(lines: &[String]) -> HashMap<String, Vec<IpAddr>> {
    let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
    for line in lines {
        let mut words = line.split_whitespace();
        let Some(ip) = words.next().and_then(|w| w.parse::<IpAddr>().ok()) else {
            continue;
        };
        for name in words {
            table.entry(normalize(name)).or_default().push(ip);
        }
    }
    table
}

fn synthesize(query: &Message<Bytes>, ips: &[IpAddr], qtype: Rtype, ttl: u32) -> Result<Message<Bytes>, CoreError> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(128))
        .map_err(droute::error::CodecError::from)?
        .start_answer(query, Rcode::NoError)
        .map_err(droute::error::CodecError::from)?
        .answer();
    let name = query
        .first_question()
        .expect("caller already matched a question")
        .qname();
    for ip in ips {
        match (qtype, ip) {
            (Rtype::A, IpAddr::V4(addr)) => builder
                .push((name, ttl, A::new(*addr)))
                .map_err(droute::error::CodecError::from)?,
            (Rtype::Aaaa, IpAddr::V6(addr)) => builder
                .push((name, ttl, Aaaa::new(*addr)))
                .map_err(droute::error::CodecError::from)?,
            _ => {}
        }
    }
    Ok(builder.into_message())
}

/// Static A/AAAA answers for configured names.
struct HostsPlugin {
    table: HashMap<String, Vec<IpAddr>>,
    ttl: u32,
}

#[async_trait]
impl Executable for HostsPlugin {
    async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError> {
        let Some(question) = qc.query.first_question() else {
            return Ok(());
        };
        let qtype = question.qtype();
        if qtype != Rtype::A && qtype != Rtype::Aaaa {
            return Ok(());
        }
        let qname = normalize(&question.qname().to_string());
        let Some(ips) = self.table.get(&qname) else {
            return Ok(());
        };
        let matching: Vec<IpAddr> = ips
            .iter()
            .copied()
            .filter(|ip| matches!((qtype, ip), (Rtype::A, IpAddr::V4(_)) | (Rtype::Aaaa, IpAddr::V6(_))))
            .collect();
        if matching.is_empty() {
            return Ok(());
        }
        qc.response = Some(synthesize(&qc.query, &matching, qtype, self.ttl)?);
        qc.status = Status::Responded;
        Ok(())
    }
}

/// Register the `hosts` plugin type.
pub fn register(registry: &TypeRegistry, data: Arc<DataProviders>) {
    registry.register(
        "hosts",
        Box::new(move |tag, args| {
            let args: HostsArgs = serde_yaml::from_value(args).map_err(|e| ConfigError::InvalidArgs {
                tag: tag.clone(),
                source: e,
            })?;
            let mut lines = Vec::new();
            if let Some(provider) = &args.provider {
                lines.extend(data.get(provider).unwrap_or(&[]).iter().cloned());
            }
            lines.extend(args.entries.iter().cloned());
            let table = parse_entries(&lines);
            Ok(PluginInstance::executable(
                tag,
                Arc::new(HostsPlugin { table, ttl: args.ttl }),
            ))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::Dname;
    use std::{net::SocketAddr, str::FromStr};

    fn build_query(name: &str, qtype: Rtype) -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(64))
            .unwrap()
            .question();
        let dname = Dname::<Bytes>::from_str(name).unwrap();
        builder.push((&dname, qtype)).unwrap();
        builder.into_message()
    }

    fn from(addr: SocketAddr) -> QueryContext {
        QueryContext::new(build_query("example.com", Rtype::A), addr, false)
    }

    #[test]
    fn parses_classic_hosts_lines() {
        let table = parse_entries(&[
            "127.0.0.1 example.com www.example.com".to_string(),
            "::1 example.com".to_string(),
            "not-an-ip broken.example.com".to_string(),
        ]);
        assert_eq!(table.get("example.com").unwrap().len(), 2);
        assert_eq!(table.get("www.example.com").unwrap().len(), 1);
        assert!(table.get("broken.example.com").is_none());
    }

    #[tokio::test]
    async fn answers_configured_a_record_and_falls_through_on_miss() {
        let plugin = HostsPlugin {
            table: parse_entries(&["93.184.216.34 example.com".to_string()]),
            ttl: 60,
        };
        let mut qc = from("127.0.0.1:53".parse().unwrap());
        plugin.exec(&mut qc).await.unwrap();
        assert_eq!(qc.status, Status::Responded);
        assert!(qc.response.is_some());

        let mut miss = QueryContext::new(build_query("unknown.example.com", Rtype::A), "127.0.0.1:53".parse().unwrap(), false);
        plugin.exec(&mut miss).await.unwrap();
        assert_eq!(miss.status, Status::Unhandled);
        assert!(miss.response.is_none());
    }

    #[tokio::test]
    async fn leaves_aaaa_query_unhandled_without_an_aaaa_entry() {
        let plugin = HostsPlugin {
            table: parse_entries(&["93.184.216.34 example.com".to_string()]),
            ttl: 60,
        };
        let mut qc = QueryContext::new(build_query("example.com", Rtype::Aaaa), "127.0.0.1:53".parse().unwrap(), false);
        plugin.exec(&mut qc).await.unwrap();
        assert_eq!(qc.status, Status::Unhandled);
    }
}
