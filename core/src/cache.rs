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

//! A sharded, concurrent LRU and the message cache built on top of it.
//!
//! Generalizes the single-`Mutex<CLruCache>` response cache into `S`
//! independently-locked shards, each a conventional LRU, plus a background
//! sweeper that evicts expired entries.

use self::RecordStatus::*;
use crate::MAX_TTL;
use bytes::Bytes;
use clru::CLruCache;
use domain::base::Message;
use log::info;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// A cached value plus the instant it was stored and its TTL.
#[derive(Clone)]
pub struct CacheRecord<T> {
    created_instant: Instant,
    content: T,
    ttl: Duration,
}

impl<T: Clone> CacheRecord<T> {
    /// Wrap `content` with a freshly-started TTL clock.
    pub fn new(content: T, ttl: Duration) -> Self {
        Self {
            created_instant: Instant::now(),
            content,
            ttl,
        }
    }

    /// Clone the stored content out.
    pub fn get(&self) -> T {
        self.content.clone()
    }

    /// Whether the entry is still within its TTL.
    pub fn validate(&self) -> bool {
        Instant::now().saturating_duration_since(self.created_instant) <= self.ttl
    }

    /// Time remaining until expiry, zero if already expired.
    pub fn remaining(&self) -> Duration {
        self.ttl
            .saturating_sub(Instant::now().saturating_duration_since(self.created_instant))
    }
}

/// The result of a cache lookup: the value, tagged with whether its TTL has
/// already elapsed.
pub enum RecordStatus<T> {
    /// Still within TTL.
    Alive(T),
    /// TTL has elapsed; returned for callers that want a stale value (e.g. to
    /// serve while refreshing).
    Expired(T),
}

/// One shard of the cache: a conventional LRU guarded by its own mutex.
struct Shard {
    lru: Mutex<CLruCache<Bytes, CacheRecord<Message<Bytes>>>>,
}

/// A sharded LRU cache of DNS responses keyed by the canonical fingerprint of
/// their question. Shard selection is `hash(key) mod S`; operations only ever
/// touch one shard's mutex.
#[derive(Clone)]
pub struct RespCache {
    shards: Arc<Vec<Shard>>,
}

impl RespCache {
    /// Build a cache with `shards` independently-locked partitions, each with
    /// capacity `per_shard_cap`.
    pub fn new(shards: usize, per_shard_cap: NonZeroUsize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Shard {
                lru: Mutex::new(CLruCache::new(per_shard_cap)),
            })
            .collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    fn shard_for(&self, key: &Bytes) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Canonical fingerprint of `msg`'s question section: the wire packing of
    /// the message with the 16-bit id field zeroed (or set to `salt`). This
    /// naturally incorporates EDNS0 options (including ECS) when present.
    pub fn fingerprint(msg: &Message<Bytes>, salt: u16) -> Bytes {
        let mut octets = msg.as_octets().to_vec();
        if octets.len() >= 2 {
            octets[0..2].copy_from_slice(&salt.to_be_bytes());
        }
        Bytes::from(octets)
    }

    /// Store a response keyed by its fingerprinted question, if `ttl > 0`.
    pub fn store(&self, query: &Message<Bytes>, response: Message<Bytes>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = Self::fingerprint(query, 0);
        let shard = self.shard_for(&key);
        shard
            .lru
            .lock()
            .unwrap()
            .put(key, CacheRecord::new(response, ttl));
    }

    /// Store a successfully-forwarded response, deriving its TTL as the minimum
    /// TTL across all non-OPT records, capped at `max_ttl`.
    pub fn store_response(&self, query: &Message<Bytes>, response: Message<Bytes>, max_ttl: u32) {
        if !response.no_error() {
            info!("response errored, not caching erroneous upstream response");
            return;
        }
        let min_ttl = response
            .answer()
            .ok()
            .map(|records| {
                records
                    .filter_map(|r| r.ok())
                    .map(|r| r.ttl())
                    .min()
                    .unwrap_or(MAX_TTL)
            })
            .unwrap_or(MAX_TTL)
            .min(max_ttl);
        if min_ttl == 0 {
            return;
        }
        self.store(query, response, Duration::from_secs(u64::from(min_ttl)));
    }

    /// Look up `query`'s fingerprint. On hit, the stored response is copied out
    /// and its remaining TTL is reported alongside.
    pub fn get(&self, query: &Message<Bytes>) -> Option<(RecordStatus<Message<Bytes>>, Duration)> {
        let key = Self::fingerprint(query, 0);
        let shard = self.shard_for(&key);
        let mut lru = shard.lru.lock().unwrap();
        let record = lru.get(&key)?;
        let remaining = record.remaining();
        let status = if record.validate() {
            Alive(record.get())
        } else {
            Expired(record.get())
        };
        Some((status, remaining))
    }

    /// Remove `query`'s entry, if present.
    pub fn del(&self, query: &Message<Bytes>) {
        let key = Self::fingerprint(query, 0);
        let shard = self.shard_for(&key);
        shard.lru.lock().unwrap().pop(&key);
    }

    /// Walk every shard evicting entries for which the record has expired.
    /// Returns the number of entries removed. Intended to be called
    /// periodically by a sweeper task.
    pub fn clean_expired(&self) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut lru = shard.lru.lock().unwrap();
            let expired: Vec<Bytes> = lru
                .iter()
                .filter(|(_, record)| !record.validate())
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                lru.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Total number of entries currently cached, across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lru.lock().unwrap().len()).sum()
    }

    /// Whether every shard is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweeper task, ticking every `interval` and removing
    /// expired entries. Returns a handle the orchestrator can abort at
    /// shutdown.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = cache.clean_expired();
                if removed > 0 {
                    info!("cache sweeper evicted {} expired entries", removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{iana::Rcode, Dname, MessageBuilder, Rtype};
    use std::str::FromStr;

    fn build_query_named(id: u16, qname: &str) -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::with_capacity(64))
            .unwrap()
            .question();
        builder.header_mut().set_id(id);
        let name = Dname::<Bytes>::from_str(qname).unwrap();
        builder.push((&name, Rtype::A)).unwrap();
        builder.into_message()
    }

    fn build_query(id: u16) -> Message<Bytes> {
        build_query_named(id, "example.com")
    }

    fn build_response(id: u16, rcode: Rcode) -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::with_capacity(64))
            .unwrap()
            .question();
        builder.header_mut().set_id(id);
        builder.header_mut().set_rcode(rcode);
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        builder.push((&name, Rtype::A)).unwrap();
        builder.into_message()
    }

    #[test]
    fn fingerprint_is_id_independent() {
        let q1 = build_query(1);
        let q2 = build_query(2);
        assert_eq!(RespCache::fingerprint(&q1, 0), RespCache::fingerprint(&q2, 0));
    }

    #[test]
    fn store_then_get_hits() {
        let cache = RespCache::new(4, NonZeroUsize::new(16).unwrap());
        let q = build_query(42);
        let r = build_response(42, Rcode::NoError);
        cache.store(&q, r, Duration::from_secs(30));
        let (status, _) = cache.get(&q).expect("should hit");
        assert!(matches!(status, RecordStatus::Alive(_)));
    }

    #[test]
    fn expired_entries_are_swept() {
        let cache = RespCache::new(1, NonZeroUsize::new(16).unwrap());
        let q = build_query(1);
        let r = build_response(1, Rcode::NoError);
        cache.store(&q, r, Duration::from_millis(0));
        // ttl=0 means "do not cache" per store()'s contract.
        assert!(cache.get(&q).is_none());
    }

    #[test]
    fn capacity_is_respected_per_shard() {
        let cache = RespCache::new(1, NonZeroUsize::new(2).unwrap());
        for i in 0..5u16 {
            let q = build_query_named(0, &format!("host{}.example.com", i));
            let r = build_response(i, Rcode::NoError);
            cache.store(&q, r, Duration::from_secs(60));
        }
        assert!(cache.len() <= 2);
    }
}
