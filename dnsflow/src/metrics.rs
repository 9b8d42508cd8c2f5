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

//! Prometheus metrics collectors, exported at `/metrics`.
//!
//! Grounded on `RoeeJ-heimdall`'s `metrics.rs`, scaled down to the counters
//! the graph evaluator and ingress loops actually have a hook for: the
//! teacher itself tracks nothing.

use prometheus::{opts, CounterVec, Encoder, Registry, TextEncoder};

/// Process-wide counters, registered once at startup and cloned (it is
/// itself a cheap handle around `Arc`-shared collectors) into every ingress
/// listener.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Queries accepted, labeled by `protocol` (udp/tcp/dot/doh).
    pub queries_total: CounterVec,
    /// Responses written back, labeled by `protocol` and `status`
    /// (responded/rejected/drop/servfail).
    pub responses_total: CounterVec,
}

impl Metrics {
    /// Build a fresh registry and register every collector.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queries_total = CounterVec::new(
            opts!("dnsflow_queries_total", "Queries accepted by ingress listeners"),
            &["protocol"],
        )?;
        let responses_total = CounterVec::new(
            opts!("dnsflow_responses_total", "Responses written back to clients"),
            &["protocol", "status"],
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            responses_total,
        })
    }

    /// Render the current collector state as Prometheus text exposition.
    pub fn export(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}
