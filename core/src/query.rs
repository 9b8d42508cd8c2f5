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

//! The per-query unit of work that flows through the executable graph.

use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use log::warn;
use std::{net::SocketAddr, sync::Arc};

/// The outcome of evaluating a query so far. Starts at `Unhandled`; a leaf
/// plugin moves it to a terminal state, which stops the enclosing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No plugin has produced an answer yet.
    Unhandled,
    /// A response has been set; the graph should stop.
    Responded,
    /// The query was rejected outright (e.g. by a blackhole plugin).
    Rejected,
    /// The query should be silently dropped; no response is written back.
    Drop,
    /// Something failed; a SERVFAIL should be synthesised if `R` is absent.
    ServerFailed,
}

impl Status {
    /// Whether this status should stop the enclosing `Sequence`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Unhandled)
    }
}

/// A callback registered on a [`QueryContext`] to run after the graph
/// finishes evaluating, regardless of whether it errored. Hooks run in
/// registration order; a failing hook is logged and does not replace an
/// already-set response.
#[async_trait]
pub trait DeferredHook: Send + Sync {
    /// Run the hook against the final context.
    async fn run(&self, qc: &mut QueryContext) -> crate::error::Result<()>;
}

/// The mutable unit of work carried through the graph for one client query.
///
/// A `QueryContext` is owned by exactly one task at a time, except when a
/// `Parallel` or `Fallback` node explicitly [`copy`](QueryContext::copy_for_branch)s
/// it to fan out; each branch then owns an independent copy and the
/// dispatcher splices the winning copy's `response`/`status` back into the
/// parent.
pub struct QueryContext {
    /// The request message. Plugins may rewrite it in place (qname
    /// normalisation, ECS add/strip, ...).
    pub query: Message<Bytes>,
    /// The response, once a leaf plugin has produced one.
    pub response: Option<Message<Bytes>>,
    /// Current status; drives sequence early-termination.
    pub status: Status,
    /// The client's network address.
    pub from: SocketAddr,
    /// Set by TCP/DoT/DoH ingress; consulted by the UDP upstream to suppress
    /// truncation retries performed on the client's behalf.
    pub is_tcp_client: bool,
    /// Set by a `Return` graph node to unwind the enclosing `Sequence`
    /// without otherwise changing `status`.
    pub returned: bool,
    hooks: Vec<Arc<dyn DeferredHook>>,
}

impl QueryContext {
    /// Start a fresh context for an incoming query.
    pub fn new(query: Message<Bytes>, from: SocketAddr, is_tcp_client: bool) -> Self {
        Self {
            query,
            response: None,
            status: Status::Unhandled,
            from,
            is_tcp_client,
            returned: false,
            hooks: Vec::new(),
        }
    }

    /// Register a deferred hook, to run in order after the graph completes.
    pub fn defer(&mut self, hook: Arc<dyn DeferredHook>) {
        self.hooks.push(hook);
    }

    /// Run every registered hook in order, logging (but not propagating)
    /// individual failures. The primary response is never overwritten by a
    /// hook failure.
    pub async fn run_hooks(&mut self) {
        let hooks = std::mem::take(&mut self.hooks);
        for hook in hooks {
            if let Err(e) = hook.run(self).await {
                warn!("deferred hook failed: {}", e);
            }
        }
    }

    /// Produce an independent copy for a `Parallel`/`Fallback` branch. The
    /// copy starts with no deferred hooks of its own; a plugin running inside
    /// the branch registers hooks on this copy, and [`adopt`](Self::adopt)
    /// carries them back into the parent if this branch wins. A losing
    /// branch's hooks are dropped along with the rest of its context.
    pub fn copy_for_branch(&self) -> Self {
        Self {
            query: self.query.clone(),
            response: self.response.clone(),
            status: self.status,
            from: self.from,
            is_tcp_client: self.is_tcp_client,
            returned: false,
            hooks: Vec::new(),
        }
    }

    /// Splice a winning branch's outcome back into `self`, including any
    /// hooks it deferred (e.g. a `cache` plugin nested under a `fallback`
    /// branch still gets its cache-store hook run).
    pub fn adopt(&mut self, branch: QueryContext) {
        self.response = branch.response;
        self.status = branch.status;
        self.hooks.extend(branch.hooks);
    }
}
