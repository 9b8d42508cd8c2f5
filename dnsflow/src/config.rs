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

//! The YAML configuration schema and its merge/include resolution.
//!
//! Grounded on the teacher's `table/parsed.rs`/`builders/ifblock.rs`
//! `#[serde(rename = "if"/"then"/"else")]` idiom, generalized: the graph's
//! `If` has no `else` branch (a sibling placed after it in a `Sequence` plays
//! that role, since `If` only ever consumes `then` on a match and otherwise
//! falls through).

use droute::{graph::GraphNode, Label};
use serde::Deserialize;
use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crate::error::DnsflowError;

/// Maximum `include` nesting depth, per §4.H/§4.I.
const MAX_INCLUDE_DEPTH: usize = 8;

fn default_log_level() -> String {
    "info".to_string()
}

/// `log` top-level key.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// `off`/`error`/`warn`/`info`/`debug`/`trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append-only log file; stderr when absent.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_reload() -> String {
    "never".to_string()
}

/// `data_providers` entry: a tag naming a set of files whose lines are handed
/// to any plugin args that reference it (domain lists, CIDR lists, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct DataProviderConfig {
    /// Unique tag other plugin args reference by name.
    pub tag: Label,
    /// Files to read, concatenated line by line.
    pub path: Vec<PathBuf>,
    /// Reload policy; only `"never"` is implemented (files are read once at
    /// startup), matching the distilled spec's silence on live-reload.
    #[serde(default = "default_reload")]
    pub reload: String,
}

/// One `plugins` entry: `{tag, type, args}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// The plugin's unique tag.
    pub tag: Label,
    /// The registered plugin-type name (`forward`, `cache`, `domain`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw, not-yet-typed arguments; deserialized into the type's own args
    /// struct by its factory.
    #[serde(default = "serde_yaml::Value::default")]
    pub args: serde_yaml::Value,
}

/// One match-condition reference inside an `if` node: a matcher tag, plus
/// optional negation via a leading `!`.
#[derive(Debug, Clone)]
pub struct CondSpec {
    /// The referenced matcher plugin's tag.
    pub tag: Label,
    /// Whether the match result is inverted.
    pub negate: bool,
}

impl<'de> Deserialize<'de> for CondSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.strip_prefix('!') {
            Some(rest) => Ok(CondSpec {
                tag: rest.into(),
                negate: true,
            }),
            None => Ok(CondSpec {
                tag: raw.into(),
                negate: false,
            }),
        }
    }
}

/// The `exec` tree as written in YAML, before tags are resolved against the
/// orchestrator's plugin map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParsedNode {
    /// `ref: tag` — invoke a single plugin.
    Ref {
        /// The executable plugin's tag.
        #[serde(rename = "ref")]
        tag: Label,
    },
    /// `return: true` — mark the enclosing sequence done.
    Return {
        /// Present (and `true`) to mark this node a `Return`.
        #[serde(rename = "return")]
        marker: bool,
    },
    /// `sequence: [...]` — run children in order.
    Sequence {
        /// The ordered children.
        sequence: Vec<ParsedNode>,
    },
    /// `if: [...] then: ...` — conditional branch.
    If {
        /// The matcher references to combine (OR unless `and` is set).
        #[serde(rename = "if")]
        cond: Vec<CondSpec>,
        /// Combine the conditions with AND instead of OR.
        #[serde(default)]
        and: bool,
        /// The node to run on match.
        then: Box<ParsedNode>,
    },
    /// `parallel: [...] timeout: N` — race branches, first responder wins.
    Parallel {
        /// The competing branches.
        parallel: Vec<ParsedNode>,
        /// Per-branch timeout in seconds; absent bounds by the parent deadline.
        timeout: Option<u64>,
    },
    /// `fallback: {primary, secondary, window, threshold}`.
    Fallback {
        /// The fallback branch pair and health-tracking parameters.
        fallback: ParsedFallback,
    },
}

/// The body of a `fallback` node.
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedFallback {
    /// The preferred branch.
    pub primary: Box<ParsedNode>,
    /// The branch raced in when primary is unhealthy.
    pub secondary: Box<ParsedNode>,
    /// Sliding-window length.
    pub window: usize,
    /// Failure threshold within `window` that marks primary unhealthy.
    pub threshold: usize,
}

impl ParsedNode {
    /// Lower the parsed tree into the evaluator's unresolved [`GraphNode`].
    /// Tag resolution against the plugin map happens later, in
    /// [`GraphNode::resolve`].
    pub fn into_graph_node(self) -> GraphNode {
        match self {
            ParsedNode::Ref { tag } => GraphNode::Ref(tag),
            ParsedNode::Return { .. } => GraphNode::Return,
            ParsedNode::Sequence { sequence } => {
                GraphNode::Sequence(sequence.into_iter().map(Self::into_graph_node).collect())
            }
            ParsedNode::If { cond, and, then } => GraphNode::If {
                cond: cond
                    .into_iter()
                    .map(|c| droute::graph::CondRef {
                        tag: c.tag,
                        negate: c.negate,
                    })
                    .collect(),
                body: Box::new(then.into_graph_node()),
                is_and: and,
            },
            ParsedNode::Parallel { parallel, timeout } => GraphNode::Parallel {
                branches: parallel.into_iter().map(Self::into_graph_node).collect(),
                timeout: timeout.map(std::time::Duration::from_secs),
            },
            ParsedNode::Fallback { fallback } => GraphNode::Fallback {
                primary: Box::new(fallback.primary.into_graph_node()),
                secondary: Box::new(fallback.secondary.into_graph_node()),
                window: fallback.window,
                threshold: fallback.threshold,
            },
        }
    }
}

fn default_server_timeout() -> u64 {
    5
}

/// One `listeners` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// `""`/`udp`, `tcp`, `dot`/`tls`, `doh`/`https`, `http`.
    #[serde(default)]
    pub protocol: String,
    /// The bind address.
    pub addr: SocketAddr,
    /// TLS certificate path, required for `dot`/`doh`.
    pub cert: Option<PathBuf>,
    /// TLS key path, required for `dot`/`doh`.
    pub key: Option<PathBuf>,
    /// DoH path filter (defaults to accepting any path).
    pub url_path: Option<String>,
    /// Header name whose value replaces the peer address in `QC.From`.
    pub get_user_ip_from_header: Option<String>,
    /// Accept PROXY protocol v1/v2 preambles (not implemented; rejected at
    /// validation if set, since no pack example carries this).
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Idle read-deadline for TCP/DoT connections, in seconds.
    pub idle_timeout: Option<u64>,
    /// `SO_REUSEADDR`.
    #[serde(default)]
    pub reuse_addr: bool,
}

/// One `servers` entry: an exec tree plus the listeners that feed it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// The graph to run for every query accepted by this server's listeners.
    pub exec: ParsedNode,
    /// Per-query deadline, in seconds.
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
    /// The listeners feeding this server.
    pub listeners: Vec<ListenerConfig>,
}

/// `api` top-level key.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    /// `host:port` for `/metrics` and `/debug/pprof/*`.
    pub http: Option<SocketAddr>,
}

/// `security` top-level key.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Opaque args for a bad-ip observer plugin, if configured.
    pub bad_ip_observer: Option<serde_yaml::Value>,
}

/// The whole configuration file, after `include` merging.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logger configuration.
    #[serde(default)]
    pub log: LogConfig,
    /// Further YAML files to merge in before this file's own plugins.
    #[serde(default)]
    pub include: Vec<PathBuf>,
    /// Named file-backed data sources.
    #[serde(default)]
    pub data_providers: Vec<DataProviderConfig>,
    /// Plugin instances, in declaration (and construction) order.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    /// The servers to run.
    pub servers: Vec<ServerConfig>,
    /// Metrics/pprof HTTP admin surface.
    pub api: Option<ApiConfig>,
    /// Optional security-related configuration.
    pub security: Option<SecurityConfig>,
}

impl Config {
    /// Load `path`, recursively merging `include`d files (each included
    /// file's `data_providers`/`plugins` are prepended ahead of the host
    /// file's own, depth-first), per §4.H/§4.I.
    pub fn load(path: &Path) -> Result<Self, DnsflowError> {
        let mut seen = HashSet::new();
        Self::load_with_depth(path, 0, &mut seen)
    }

    fn load_with_depth(
        path: &Path,
        depth: usize,
        seen: &mut HashSet<PathBuf>,
    ) -> Result<Self, DnsflowError> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(droute::error::ConfigError::IncludeDepthExceeded(
                path.display().to_string(),
            )
            .into());
        }
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !seen.insert(canonical) {
            return Err(droute::error::ConfigError::IncludeDepthExceeded(format!(
                "include cycle at {}",
                path.display()
            ))
            .into());
        }

        let raw = std::fs::read_to_string(path).map_err(droute::error::ConfigError::from)?;
        let mut config: Config = serde_yaml::from_str(&raw).map_err(droute::error::ConfigError::from)?;

        let mut merged_providers = Vec::new();
        let mut merged_plugins = Vec::new();
        for include_path in std::mem::take(&mut config.include) {
            let resolved = resolve_relative(path, &include_path);
            let included = Self::load_with_depth(&resolved, depth + 1, seen)?;
            merged_providers.extend(included.data_providers);
            merged_plugins.extend(included.plugins);
        }
        merged_providers.append(&mut config.data_providers);
        merged_plugins.append(&mut config.plugins);
        config.data_providers = merged_providers;
        config.plugins = merged_plugins;

        Ok(config)
    }
}

fn resolve_relative(host: &Path, include: &Path) -> PathBuf {
    if include.is_absolute() {
        include.to_path_buf()
    } else {
        host.parent()
            .map(|dir| dir.join(include))
            .unwrap_or_else(|| include.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let yaml = r#"
servers:
  - exec:
      ref: fwd
    listeners:
      - protocol: udp
        addr: "127.0.0.1:5300"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn if_then_sequence_parses() {
        let yaml = r#"
sequence:
  - if: ["is_cn", "!is_private"]
    and: true
    then:
      ref: fwd_cn
  - ref: fwd_default
"#;
        let node: ParsedNode = serde_yaml::from_str(yaml).unwrap();
        match node {
            ParsedNode::Sequence { sequence } => assert_eq!(sequence.len(), 2),
            _ => panic!("expected a sequence"),
        }
    }
}
