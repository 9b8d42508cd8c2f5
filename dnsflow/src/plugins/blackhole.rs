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

//! The `blackhole` plugin: either answers with a synthetic NOERROR/SOA
//! response that discourages the client from retrying, or silently drops the
//! query.
//!
//! The NOERROR/SOA synthesis is taken near-verbatim from the teacher's
//! `router/script/utils/blackhole.rs` helper (SOA data sourced from
//! smartdns), which already builds its answer via `start_answer`, copying
//! the original id and question.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use droute::{
    error::{ConfigError, CoreError},
    graph::{Executable, PluginInstance},
    query::{QueryContext, Status},
    registry::TypeRegistry,
    MAX_TTL,
};
use domain::{
    base::{iana::Rcode, Dname, MessageBuilder},
    rdata::Soa,
};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{str::FromStr, sync::Arc};

// Data from smartdns, as in the teacher's blackhole helper.
static SOA_RDATA: Lazy<(Dname<Bytes>, u32, Soa<Dname<Bytes>>)> = Lazy::new(|| {
    (
        Dname::root_bytes(),
        MAX_TTL,
        Soa::new(
            Dname::from_str("a.gtld-servers.net").unwrap(),
            Dname::from_str("nstld.verisign-grs.com").unwrap(),
            1800.into(),
            1800,
            900,
            604800,
            86400,
        ),
    )
});

fn synthesize(query: &domain::base::Message<Bytes>) -> Result<domain::base::Message<Bytes>, CoreError> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(64))
        .map_err(droute::error::CodecError::from)?
        .start_answer(query, Rcode::NoError)
        .map_err(droute::error::CodecError::from)?
        .additional();
    builder
        .push(SOA_RDATA.clone())
        .map_err(droute::error::CodecError::from)?;
    Ok(builder.into_message())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    /// Answer with a synthetic NOERROR/SOA response.
    Soa,
    /// Drop the query silently (no response is written back).
    Drop,
    /// Answer with REFUSED.
    Reject,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Soa
    }
}

#[derive(Debug, Default, Deserialize)]
struct BlackholeArgs {
    #[serde(default)]
    mode: Mode,
}

struct BlackholePlugin {
    mode: Mode,
}

#[async_trait]
impl Executable for BlackholePlugin {
    async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError> {
        match self.mode {
            Mode::Soa => {
                qc.response = Some(synthesize(&qc.query)?);
                qc.status = Status::Responded;
            }
            Mode::Reject => {
                let response = MessageBuilder::from_target(BytesMut::with_capacity(32))
                    .map_err(droute::error::CodecError::from)?
                    .start_answer(&qc.query, Rcode::Refused)
                    .map_err(droute::error::CodecError::from)?
                    .into_message();
                qc.response = Some(response);
                qc.status = Status::Rejected;
            }
            Mode::Drop => {
                qc.status = Status::Drop;
            }
        }
        Ok(())
    }
}

/// Register the `blackhole` plugin type.
pub fn register(registry: &TypeRegistry) {
    registry.register(
        "blackhole",
        Box::new(|tag, args| {
            let args: BlackholeArgs = serde_yaml::from_value(args).map_err(|e| ConfigError::InvalidArgs {
                tag: tag.clone(),
                source: e,
            })?;
            Ok(PluginInstance::executable(
                tag,
                Arc::new(BlackholePlugin { mode: args.mode }),
            ))
        }),
    );
}
