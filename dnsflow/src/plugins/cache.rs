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

//! The `cache` plugin: an RespCache lookup on entry, and a deferred
//! cache-store hook for whatever response the rest of the sequence produces.
//!
//! Grounded on `droute/src/cache.rs`'s `RespCache`, used here exactly as the
//! spec's §4.F example use of deferred hooks describes ("cache-store after
//! forward").

use async_trait::async_trait;
use droute::{
    cache::{RespCache, RecordStatus},
    codec::{rewrite_id, rewrite_ttls},
    error::{ConfigError, CoreError},
    graph::{Executable, Introspect, PluginInstance},
    query::{DeferredHook, QueryContext, Status},
    registry::TypeRegistry,
    MAX_TTL,
};
use serde::Deserialize;
use std::{num::NonZeroUsize, sync::Arc};

fn default_shards() -> usize {
    16
}

fn default_cap_per_shard() -> usize {
    256
}

fn default_max_ttl() -> u32 {
    MAX_TTL
}

fn default_sweep_interval() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
struct CacheArgs {
    #[serde(default = "default_shards")]
    shards: usize,
    #[serde(default = "default_cap_per_shard")]
    size_per_shard: usize,
    #[serde(default = "default_max_ttl")]
    max_ttl: u32,
    /// Sweeper tick interval, in seconds; default 10 per §4.B/§5.
    #[serde(default = "default_sweep_interval")]
    sweep_interval: u64,
}

struct StoreHook {
    cache: RespCache,
    query: domain::base::Message<bytes::Bytes>,
    max_ttl: u32,
}

#[async_trait]
impl DeferredHook for StoreHook {
    async fn run(&self, qc: &mut QueryContext) -> droute::error::Result<()> {
        if qc.status == Status::Responded {
            if let Some(response) = &qc.response {
                self.cache
                    .store_response(&self.query, response.clone(), self.max_ttl);
            }
        }
        Ok(())
    }
}

/// Looks up the query in a shared `RespCache`; on a live hit, answers
/// immediately (id rewritten to match the caller's). On a miss, registers a
/// deferred hook that stores whatever response the rest of the sequence
/// eventually produces.
pub struct CachePlugin {
    cache: RespCache,
    max_ttl: u32,
}

#[async_trait]
impl Executable for CachePlugin {
    async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError> {
        if let Some((RecordStatus::Alive(response), remaining)) = self.cache.get(&qc.query) {
            let id = qc.query.header().id();
            let response = rewrite_ttls(&response, remaining.as_secs() as u32).map_err(CoreError::from)?;
            qc.response = Some(rewrite_id(response, id));
            qc.status = Status::Responded;
            return Ok(());
        }

        qc.defer(Arc::new(StoreHook {
            cache: self.cache.clone(),
            query: qc.query.clone(),
            max_ttl: self.max_ttl,
        }));
        Ok(())
    }
}

impl Introspect for CachePlugin {
    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "entries": self.cache.len(),
            "max_ttl": self.max_ttl,
        })
    }
}

/// Register the `cache` plugin type.
pub fn register(registry: &TypeRegistry) {
    registry.register(
        "cache",
        Box::new(|tag, args| {
            let args: CacheArgs = serde_yaml::from_value(args).map_err(|e| ConfigError::InvalidArgs {
                tag: tag.clone(),
                source: e,
            })?;
            let cap = NonZeroUsize::new(args.size_per_shard.max(1)).expect("max(1) is never zero");
            let cache = RespCache::new(args.shards.max(1), cap);
            // Periodic sweeper per §4.B: evicts expired entries on a fixed
            // tick so a cold cache doesn't carry stale entries indefinitely
            // between lookups.
            cache.spawn_sweeper(std::time::Duration::from_secs(args.sweep_interval.max(1)));
            let plugin = Arc::new(CachePlugin {
                cache,
                max_ttl: args.max_ttl,
            });
            Ok(PluginInstance::executable(tag, plugin.clone()).with_introspect(plugin))
        }),
    );
}
