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

//! Plugin capability traits, the executable graph tree, and its evaluator.
//!
//! The source threads an explicit `next` continuation through every plugin's
//! `Exec` call so a plugin can decide whether following siblings run at all.
//! That is a natural idiom over goroutines; the idiomatic Rust analogue kept
//! here instead has each node's [`Sequence`](GraphNode::Sequence) itself
//! decide continuation by consulting the context's terminal
//! [`Status`](crate::query::Status) and the `returned` flag a `Return` node
//! sets, which a plain recursive walk checks between children. The externally
//! observable behaviour (stop the sequence on a terminal status or on
//! `_return`) is identical.

use crate::{
    dispatch::HealthTracker,
    error::{CoreError, PluginError},
    matchers::Matcher,
    query::{QueryContext, Status},
    Label,
};
use async_trait::async_trait;
use domain::base::iana::Rcode;
use futures::future::BoxFuture;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex as AsyncMutex;

/// The `Executable` plugin capability: may mutate the query context and
/// decide (via `qc.status`/`qc.returned`) whether later siblings should run.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Run this node's logic against `qc`.
    async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError>;
}

/// The `Closer` plugin capability, invoked once at shutdown.
#[async_trait]
pub trait Closer: Send + Sync {
    /// Release any held resources (connections, file handles, ...).
    async fn close(&self) -> Result<(), CoreError>;
}

/// The `Introspect` plugin capability: a plugin may expose a snapshot of its
/// internal state for the `/plugins/{tag}/...` admin surface. Kept
/// transport-agnostic (no `axum` dependency here) by returning a JSON value
/// the HTTP layer serialises as-is.
pub trait Introspect: Send + Sync {
    /// A point-in-time snapshot of this plugin's state, e.g. cache
    /// occupancy or health-tracker counters.
    fn snapshot(&self) -> serde_json::Value;
}

/// A named plugin instance presenting zero or more capabilities.
pub struct PluginInstance {
    /// The plugin's unique tag.
    pub tag: Label,
    /// Present if the plugin can act as a graph executable.
    pub executable: Option<Arc<dyn Executable>>,
    /// Present if the plugin can act as a matcher condition.
    pub matcher: Option<Arc<dyn Matcher>>,
    /// Present if the plugin holds resources that need releasing at shutdown.
    pub closer: Option<Arc<dyn Closer>>,
    /// Present if the plugin exposes an introspection snapshot.
    pub introspect: Option<Arc<dyn Introspect>>,
}

impl PluginInstance {
    /// A plugin instance presenting no capabilities; useful in tests and as
    /// a registry placeholder.
    pub fn empty(tag: Label) -> Self {
        Self {
            tag,
            executable: None,
            matcher: None,
            closer: None,
            introspect: None,
        }
    }

    /// Build an executable-only instance.
    pub fn executable(tag: Label, exec: Arc<dyn Executable>) -> Self {
        Self {
            tag,
            executable: Some(exec),
            matcher: None,
            closer: None,
            introspect: None,
        }
    }

    /// Build a matcher-only instance.
    pub fn matcher(tag: Label, matcher: Arc<dyn Matcher>) -> Self {
        Self {
            tag,
            executable: None,
            matcher: Some(matcher),
            closer: None,
            introspect: None,
        }
    }

    /// Attach an introspection capability to an already-built instance.
    pub fn with_introspect(mut self, introspect: Arc<dyn Introspect>) -> Self {
        self.introspect = Some(introspect);
        self
    }
}

/// One reference to a matcher inside an `If`'s condition list, with its
/// optional negation.
#[derive(Clone)]
pub struct CondRef {
    /// The matcher plugin's tag.
    pub tag: Label,
    /// Whether the match result should be inverted.
    pub negate: bool,
}

/// The unresolved graph: plugin references are bare tags, to be looked up in
/// the orchestrator's tag -> plugin map at build time.
#[derive(Clone)]
pub enum GraphNode {
    /// Invoke the named plugin as an executable.
    Ref(Label),
    /// Run children in order; stop on a terminal status or `_return`.
    Sequence(Vec<GraphNode>),
    /// Evaluate `cond` (OR by default, AND if `is_and`); run `body` on match.
    If {
        /// The matcher references to combine.
        cond: Vec<CondRef>,
        /// The node to run when the condition holds.
        body: Box<GraphNode>,
        /// Combine by AND instead of the default OR.
        is_and: bool,
    },
    /// Copy the context, run each branch concurrently, take the first
    /// `responded` result.
    Parallel {
        /// The competing branches.
        branches: Vec<GraphNode>,
        /// Per-branch timeout; `None` means bound by the parent's deadline.
        timeout: Option<Duration>,
    },
    /// Run `primary` alone while healthy; otherwise race it against
    /// `secondary`.
    Fallback {
        /// The preferred branch.
        primary: Box<GraphNode>,
        /// The branch raced in when primary is unhealthy.
        secondary: Box<GraphNode>,
        /// Sliding window length for the health tracker.
        window: usize,
        /// Failure count within `window` that marks primary unhealthy.
        threshold: usize,
    },
    /// Mark the enclosing sequence complete.
    Return,
}

impl GraphNode {
    /// Resolve every plugin reference against `plugins`, producing an
    /// evaluator-ready tree with pointers instead of tags.
    pub fn resolve(&self, plugins: &PluginMap) -> Result<ResolvedNode, CoreError> {
        Ok(match self {
            GraphNode::Ref(tag) => {
                let plugin = plugins.get(tag)?;
                let exec = plugin.executable.clone().ok_or_else(|| {
                    CoreError::Plugin(PluginError::Failed {
                        tag: tag.clone(),
                        message: "plugin is not executable".to_string(),
                    })
                })?;
                ResolvedNode::Exec(exec)
            }
            GraphNode::Sequence(children) => ResolvedNode::Sequence(
                children
                    .iter()
                    .map(|c| c.resolve(plugins))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            GraphNode::If { cond, body, is_and } => {
                let cond = cond
                    .iter()
                    .map(|c| {
                        let plugin = plugins.get(&c.tag)?;
                        let matcher = plugin.matcher.clone().ok_or_else(|| {
                            CoreError::Plugin(PluginError::Failed {
                                tag: c.tag.clone(),
                                message: "plugin is not a matcher".to_string(),
                            })
                        })?;
                        Ok((matcher, c.negate))
                    })
                    .collect::<Result<Vec<_>, CoreError>>()?;
                ResolvedNode::If {
                    cond,
                    body: Box::new(body.resolve(plugins)?),
                    is_and: *is_and,
                }
            }
            GraphNode::Parallel { branches, timeout } => ResolvedNode::Parallel {
                branches: branches
                    .iter()
                    .map(|b| b.resolve(plugins))
                    .collect::<Result<Vec<_>, _>>()?,
                timeout: *timeout,
            },
            GraphNode::Fallback {
                primary,
                secondary,
                window,
                threshold,
            } => ResolvedNode::Fallback {
                primary: Box::new(primary.resolve(plugins)?),
                secondary: Box::new(secondary.resolve(plugins)?),
                tracker: Arc::new(AsyncMutex::new(HealthTracker::new(*window, *threshold))),
            },
            GraphNode::Return => ResolvedNode::Return,
        })
    }
}

/// A resolved, evaluator-ready graph node. Immutable after construction;
/// plugin references have become pointers.
pub enum ResolvedNode {
    /// An executable plugin leaf.
    Exec(Arc<dyn Executable>),
    /// An ordered list of children.
    Sequence(Vec<ResolvedNode>),
    /// A conditional branch.
    If {
        /// Matcher + negation pairs, evaluated left to right.
        cond: Vec<(Arc<dyn Matcher>, bool)>,
        /// The node to run on match.
        body: Box<ResolvedNode>,
        /// Combine by AND instead of OR.
        is_and: bool,
    },
    /// A race between independently-copied branches.
    Parallel {
        /// The competing branches.
        branches: Vec<ResolvedNode>,
        /// Per-branch timeout.
        timeout: Option<Duration>,
    },
    /// A primary/secondary pair with a shared, persistent health tracker.
    Fallback {
        /// The preferred branch.
        primary: Box<ResolvedNode>,
        /// The branch raced in when primary is unhealthy.
        secondary: Box<ResolvedNode>,
        /// Sliding-window health state, shared across queries.
        tracker: Arc<AsyncMutex<HealthTracker>>,
    },
    /// Marks the enclosing sequence complete.
    Return,
}

/// Map from plugin tag to its constructed instance, built once at startup
/// and read-only thereafter.
pub struct PluginMap {
    plugins: std::collections::HashMap<Label, PluginInstance>,
}

impl PluginMap {
    /// Wrap an already-built tag -> instance map.
    pub fn new(plugins: std::collections::HashMap<Label, PluginInstance>) -> Self {
        Self { plugins }
    }

    /// Look up a plugin by tag.
    pub fn get(&self, tag: &Label) -> Result<&PluginInstance, CoreError> {
        self.plugins.get(tag).ok_or_else(|| {
            CoreError::Config(crate::error::ConfigError::PluginNotFound(tag.clone()))
        })
    }

    /// Iterate every constructed plugin, e.g. to call `Closer::close` at
    /// shutdown.
    pub fn iter(&self) -> impl Iterator<Item = &PluginInstance> {
        self.plugins.values()
    }
}

fn terminal(qc: &QueryContext) -> bool {
    qc.status.is_terminal() || qc.returned
}

/// Evaluate a resolved graph node against `qc`. Returns once the node (and
/// any children it ran) settled into either a terminal status or an
/// explicit `_return`.
pub fn eval<'a>(node: &'a ResolvedNode, qc: &'a mut QueryContext) -> BoxFuture<'a, Result<(), CoreError>> {
    Box::pin(async move {
        match node {
            ResolvedNode::Exec(plugin) => plugin.exec(qc).await,
            ResolvedNode::Return => {
                qc.returned = true;
                Ok(())
            }
            ResolvedNode::Sequence(children) => {
                for child in children {
                    eval(child, qc).await?;
                    if terminal(qc) {
                        break;
                    }
                }
                Ok(())
            }
            ResolvedNode::If { cond, body, is_and } => {
                let mut matched = *is_and;
                for (matcher, negate) in cond {
                    let mut hit = matcher.matches(qc).await.map_err(crate::error::CoreError::Match)?;
                    if *negate {
                        hit = !hit;
                    }
                    if *is_and {
                        if !hit {
                            matched = false;
                            break;
                        }
                    } else if hit {
                        matched = true;
                        break;
                    } else {
                        matched = false;
                    }
                }
                if matched {
                    eval(body, qc).await
                } else {
                    Ok(())
                }
            }
            ResolvedNode::Parallel { branches, timeout } => eval_parallel(branches, *timeout, qc).await,
            ResolvedNode::Fallback {
                primary,
                secondary,
                tracker,
            } => eval_fallback(primary, secondary, tracker, qc).await,
        }
    })
}

async fn eval_parallel(
    branches: &[ResolvedNode],
    timeout: Option<Duration>,
    qc: &mut QueryContext,
) -> Result<(), CoreError> {
    use futures::stream::{FuturesUnordered, StreamExt};

    if branches.is_empty() {
        qc.status = Status::ServerFailed;
        return Err(CoreError::NoResponse);
    }

    let mut futs = FuturesUnordered::new();
    for branch in branches {
        let mut copy = qc.copy_for_branch();
        let fut: BoxFuture<'_, (QueryContext, Result<(), CoreError>)> = Box::pin(async move {
            let run = eval(branch, &mut copy);
            let result = match timeout {
                Some(d) => tokio::time::timeout(d, run)
                    .await
                    .unwrap_or(Err(CoreError::NoResponse)),
                None => run.await,
            };
            (copy, result)
        });
        futs.push(fut);
    }

    while let Some((copy, result)) = futs.next().await {
        if result.is_ok() && copy.status == Status::Responded && copy.response.is_some() {
            qc.adopt(copy);
            return Ok(());
        }
    }
    qc.status = Status::ServerFailed;
    Err(CoreError::NoResponse)
}

/// Whether a branch's run should count as a *healthy* primary attempt: the
/// node must have run without error, settled `Responded` with a reply, and
/// that reply must not be a SERVFAIL. A plugin such as `forward` sets
/// `Responded` for any upstream reply regardless of rcode, so the rcode check
/// is what actually distinguishes "primary answered" from "primary is
/// failing" for the health tracker.
fn fallback_branch_ok(result: &Result<(), CoreError>, copy: &QueryContext) -> bool {
    result.is_ok()
        && copy.status == Status::Responded
        && copy
            .response
            .as_ref()
            .map(|r| r.header().rcode() != Rcode::ServFail)
            .unwrap_or(false)
}

async fn eval_fallback(
    primary: &ResolvedNode,
    secondary: &ResolvedNode,
    tracker: &Arc<AsyncMutex<HealthTracker>>,
    qc: &mut QueryContext,
) -> Result<(), CoreError> {
    let healthy = tracker.lock().await.good();

    if healthy {
        let mut copy = qc.copy_for_branch();
        let result = eval(primary, &mut copy).await;
        let ok = fallback_branch_ok(&result, &copy);
        tracker.lock().await.record(ok);
        if ok {
            qc.adopt(copy);
            return Ok(());
        }
        qc.status = Status::ServerFailed;
        return Err(CoreError::NoResponse);
    }

    let mut primary_copy = qc.copy_for_branch();
    let primary_fut = eval(primary, &mut primary_copy);
    let mut secondary_copy = qc.copy_for_branch();
    let secondary_fut = eval(secondary, &mut secondary_copy);

    tokio::pin!(primary_fut);
    tokio::pin!(secondary_fut);

    let mut primary_done = false;
    let mut secondary_done = false;
    let mut winner: Option<QueryContext> = None;

    while !(primary_done && secondary_done) && winner.is_none() {
        tokio::select! {
            r = &mut primary_fut, if !primary_done => {
                primary_done = true;
                let ok = fallback_branch_ok(&r, &primary_copy);
                tracker.lock().await.record(ok);
                if ok {
                    winner = Some(std::mem::replace(&mut primary_copy, qc.copy_for_branch()));
                }
            }
            r = &mut secondary_fut, if !secondary_done => {
                secondary_done = true;
                if r.is_ok() && secondary_copy.status == Status::Responded && secondary_copy.response.is_some() {
                    winner = Some(std::mem::replace(&mut secondary_copy, qc.copy_for_branch()));
                }
            }
        }
    }

    match winner {
        Some(w) => {
            qc.adopt(w);
            Ok(())
        }
        None => {
            qc.status = Status::ServerFailed;
            Err(CoreError::NoResponse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::{MatchError, Matcher};
    use bytes::{Bytes, BytesMut};
    use domain::base::{Dname, Message, MessageBuilder, Rtype};
    use std::{
        net::SocketAddr,
        str::FromStr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn build_query() -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(64))
            .unwrap()
            .question();
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        builder.push((&name, Rtype::A)).unwrap();
        builder.into_message()
    }

    fn build_response(rcode: Rcode) -> Message<Bytes> {
        MessageBuilder::from_target(BytesMut::with_capacity(16))
            .unwrap()
            .start_answer(&build_query(), rcode)
            .unwrap()
            .into_message()
    }

    fn new_qc() -> QueryContext {
        QueryContext::new(build_query(), SocketAddr::from(([127, 0, 0, 1], 5300)), false)
    }

    /// A stub leaf that records a hit, optionally sleeps, then sets a fixed
    /// status/response.
    struct Stub {
        status: Status,
        rcode: Option<Rcode>,
        hits: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Executable for Stub {
        async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            qc.status = self.status;
            if let Some(rcode) = self.rcode {
                qc.response = Some(build_response(rcode));
            }
            Ok(())
        }
    }

    fn stub_node(status: Status, rcode: Option<Rcode>, hits: &Arc<AtomicUsize>) -> ResolvedNode {
        ResolvedNode::Exec(Arc::new(Stub {
            status,
            rcode,
            hits: hits.clone(),
            delay: None,
        }))
    }

    #[tokio::test]
    async fn sequence_stops_at_first_terminal_child() {
        let hits = Arc::new(AtomicUsize::new(0));
        let node = ResolvedNode::Sequence(vec![
            stub_node(Status::Unhandled, None, &hits),
            stub_node(Status::Responded, Some(Rcode::NoError), &hits),
            stub_node(Status::Responded, Some(Rcode::NoError), &hits),
        ]);
        let mut qc = new_qc();
        eval(&node, &mut qc).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(qc.status, Status::Responded);
    }

    struct AlwaysMatch(bool);

    #[async_trait]
    impl Matcher for AlwaysMatch {
        async fn matches(&self, _qc: &QueryContext) -> Result<bool, MatchError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn if_skips_body_when_condition_misses() {
        let hits = Arc::new(AtomicUsize::new(0));
        let body = stub_node(Status::Responded, Some(Rcode::NoError), &hits);
        let node = ResolvedNode::If {
            cond: vec![(Arc::new(AlwaysMatch(false)) as Arc<dyn Matcher>, false)],
            body: Box::new(body),
            is_and: false,
        };
        let mut qc = new_qc();
        eval(&node, &mut qc).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(qc.status, Status::Unhandled);
    }

    #[tokio::test]
    async fn if_and_requires_every_condition() {
        let hits = Arc::new(AtomicUsize::new(0));
        let body = stub_node(Status::Responded, Some(Rcode::NoError), &hits);
        let node = ResolvedNode::If {
            cond: vec![
                (Arc::new(AlwaysMatch(true)) as Arc<dyn Matcher>, false),
                (Arc::new(AlwaysMatch(false)) as Arc<dyn Matcher>, true),
            ],
            body: Box::new(body),
            is_and: true,
        };
        let mut qc = new_qc();
        eval(&node, &mut qc).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(qc.status, Status::Responded);
    }

    #[tokio::test]
    async fn parallel_takes_first_responded_branch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let fast = ResolvedNode::Exec(Arc::new(Stub {
            status: Status::Responded,
            rcode: Some(Rcode::NoError),
            hits: hits.clone(),
            delay: None,
        }));
        let slow = ResolvedNode::Exec(Arc::new(Stub {
            status: Status::Responded,
            rcode: Some(Rcode::NoError),
            hits: hits.clone(),
            delay: Some(Duration::from_millis(200)),
        }));
        let node = ResolvedNode::Parallel {
            branches: vec![slow, fast],
            timeout: None,
        };
        let mut qc = new_qc();
        eval(&node, &mut qc).await.unwrap();
        assert_eq!(qc.status, Status::Responded);
        assert!(qc.response.is_some());
    }

    #[tokio::test]
    async fn fallback_runs_primary_alone_while_healthy() {
        let primary_hits = Arc::new(AtomicUsize::new(0));
        let secondary_hits = Arc::new(AtomicUsize::new(0));
        let primary = stub_node(Status::Responded, Some(Rcode::NoError), &primary_hits);
        let secondary = stub_node(Status::Responded, Some(Rcode::NoError), &secondary_hits);
        let node = ResolvedNode::Fallback {
            primary: Box::new(primary),
            secondary: Box::new(secondary),
            tracker: Arc::new(AsyncMutex::new(HealthTracker::new(5, 3))),
        };

        let mut qc = new_qc();
        eval(&node, &mut qc).await.unwrap();
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 0);
    }

    /// Mirrors a `forward` plugin whose upstream always returns SERVFAIL:
    /// `exec` returns `Ok(())` and sets `Status::Responded` for any reply,
    /// so only an rcode check (not `result.is_ok()`) can tell the health
    /// tracker the primary is actually failing.
    #[tokio::test]
    async fn fallback_counts_servfail_rcode_as_a_failure() {
        let primary_hits = Arc::new(AtomicUsize::new(0));
        let secondary_hits = Arc::new(AtomicUsize::new(0));
        let tracker = Arc::new(AsyncMutex::new(HealthTracker::new(10, 3)));

        for _ in 0..3 {
            let node = ResolvedNode::Fallback {
                primary: Box::new(stub_node(Status::Responded, Some(Rcode::ServFail), &primary_hits)),
                secondary: Box::new(stub_node(Status::Responded, Some(Rcode::NoError), &secondary_hits)),
                tracker: tracker.clone(),
            };
            let mut qc = new_qc();
            eval(&node, &mut qc).await.unwrap();
        }
        assert_eq!(primary_hits.load(Ordering::SeqCst), 3);
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 0);
        assert!(!tracker.lock().await.good());

        let node = ResolvedNode::Fallback {
            primary: Box::new(stub_node(Status::Responded, Some(Rcode::ServFail), &primary_hits)),
            secondary: Box::new(stub_node(Status::Responded, Some(Rcode::NoError), &secondary_hits)),
            tracker: tracker.clone(),
        };
        let mut qc = new_qc();
        eval(&node, &mut qc).await.unwrap();
        // Which of the two racing branches the executor happens to poll to
        // completion first is not deterministic, but since the primary can
        // never set `ok=true` here, the winner is always secondary.
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(qc.response.unwrap().header().rcode(), Rcode::NoError);
    }

    #[tokio::test]
    async fn fallback_propagates_a_transport_error_as_failure_too() {
        struct Failing(Arc<AtomicUsize>);

        #[async_trait]
        impl Executable for Failing {
            async fn exec(&self, _qc: &mut QueryContext) -> Result<(), CoreError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::NoResponse)
            }
        }

        let primary_hits = Arc::new(AtomicUsize::new(0));
        let secondary_hits = Arc::new(AtomicUsize::new(0));
        let tracker = Arc::new(AsyncMutex::new(HealthTracker::new(10, 1)));

        let node = ResolvedNode::Fallback {
            primary: Box::new(ResolvedNode::Exec(Arc::new(Failing(primary_hits.clone())))),
            secondary: Box::new(stub_node(Status::Responded, Some(Rcode::NoError), &secondary_hits)),
            tracker: tracker.clone(),
        };
        let mut qc = new_qc();
        assert!(eval(&node, &mut qc).await.is_err());
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert!(!tracker.lock().await.good());
    }
}
