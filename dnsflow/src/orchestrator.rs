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

//! Start-up init pipeline: logger, data providers, plugin-type registry,
//! preset + configured plugins, resolved per-server graphs.
//!
//! Ordering is grounded on the teacher's `Router::new` (`droute/src/router/mod.rs`):
//! build every table entry before resolving any rule tree against it, so
//! forward references are caught before the server starts accepting queries.

use droute::{
    error::ConfigError,
    graph::{GraphNode, PluginInstance, PluginMap, ResolvedNode},
    registry::TypeRegistry,
    Label,
};
use log::info;
use std::{collections::HashMap, path::Path, sync::Arc};

use crate::{
    config::Config,
    error::{DnsflowError, Result},
    plugins::{data::DataProviders, register_builtin_types},
};

/// Everything the server/CLI layers need once startup has finished:
/// per-server resolved graphs, listener configs and the plugin map (kept
/// alive for its `Closer`s and for any plugin holding long-lived state).
pub struct Forwarder {
    /// One resolved graph + its listeners per `servers` entry.
    pub servers: Vec<ResolvedServer>,
    /// Every constructed plugin, kept alive for shutdown and for plugins
    /// that hold state beyond what the graph references (e.g. shared
    /// caches referenced by more than one tag).
    pub plugins: Arc<PluginMap>,
    /// Parsed `api` admin-surface config, if present.
    pub api: Option<crate::config::ApiConfig>,
}

/// One `servers` entry, graph resolved and ready to evaluate.
pub struct ResolvedServer {
    /// The resolved exec graph.
    pub exec: ResolvedNode,
    /// Per-query deadline.
    pub timeout: std::time::Duration,
    /// The listeners that feed this server.
    pub listeners: Vec<crate::config::ListenerConfig>,
}

fn init_logger(log: &crate::config::LogConfig) -> Result<()> {
    use log::LevelFilter;
    let level = match log.level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if log.file.is_some() {
        // `simple_logger` (the teacher's logging crate) only ever writes to
        // stderr; redirect the process's own stderr at the shell if file
        // output is needed.
        eprintln!("log.file is set but file-backed logging is not supported; logging to stderr");
    }
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .map_err(|e| DnsflowError::Other(anyhow::anyhow!(e)))?;
    Ok(())
}

/// Build everything needed to run from a config file on disk: set up
/// logging, load and merge includes, load data providers, register plugin
/// types, build every configured plugin in declaration order, then resolve
/// each server's exec tree against the finished plugin map.
pub async fn build(config_path: &Path) -> Result<Forwarder> {
    let config = Config::load(config_path)?;
    init_logger(&config.log)?;
    info!("loaded configuration from {}", config_path.display());

    let data = Arc::new(DataProviders::load(&config.data_providers)?);

    let registry = TypeRegistry::new();
    register_builtin_types(&registry, data.clone());

    let mut instances: HashMap<Label, PluginInstance> = HashMap::new();
    for preset in crate::plugins::builtin::presets() {
        instances.insert(preset.tag.clone(), preset);
    }

    for entry in &config.plugins {
        if instances.contains_key(&entry.tag) {
            return Err(ConfigError::DuplicateTag(entry.tag.clone()).into());
        }
        let instance = registry.build(&entry.kind, entry.tag.clone(), entry.args.clone())?;
        instances.insert(entry.tag.clone(), instance);
    }

    let plugin_map = Arc::new(PluginMap::new(instances));

    let mut servers = Vec::with_capacity(config.servers.len());
    for server in &config.servers {
        let graph: GraphNode = server.exec.clone().into_graph_node();
        let exec = graph.resolve(&plugin_map)?;
        servers.push(ResolvedServer {
            exec,
            timeout: std::time::Duration::from_secs(server.timeout),
            listeners: server.listeners.clone(),
        });
    }

    info!(
        "initialized {} plugin(s) across {} server(s)",
        plugin_map.iter().count(),
        servers.len()
    );

    Ok(Forwarder {
        servers,
        plugins: plugin_map,
        api: config.api,
    })
}

impl Forwarder {
    /// Close every plugin that holds closeable resources, in map order
    /// (unspecified, matching the spec's "order not significant" note).
    pub async fn shutdown(&self) {
        for plugin in self.plugins.iter() {
            if let Some(closer) = &plugin.closer {
                if let Err(e) = closer.close().await {
                    log::warn!("plugin `{}` failed to close cleanly: {}", plugin.tag, e);
                }
            }
        }
    }
}
