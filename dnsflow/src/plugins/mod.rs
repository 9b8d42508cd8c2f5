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

//! Leaf plugin implementations and the built-in/preset plugin set.
//!
//! Generalizes the teacher's flat `Action`/`Matcher` implementations
//! (`actions/{query,ecs,blackhole,disable}.rs`, `matchers/{domain,ipcidr,qtype}.rs`)
//! into `droute::graph::Executable`/`droute::matchers::Matcher` plugin instances
//! registered by type name in a [`droute::registry::TypeRegistry`], per the
//! spec's type -> factory generalization (§4.H/§4.I/§9).

pub mod blackhole;
pub mod builtin;
pub mod cache;
pub mod data;
pub mod ecs;
pub mod forward;
pub mod hosts;
pub mod matcher_plugins;

use droute::registry::TypeRegistry;
use std::sync::Arc;

use data::DataProviders;

/// Register every built-in plugin-type factory. Called once by the
/// orchestrator before any configured plugin is built.
pub fn register_builtin_types(registry: &TypeRegistry, data: Arc<DataProviders>) {
    forward::register(registry);
    cache::register(registry);
    blackhole::register(registry);
    ecs::register(registry);
    hosts::register(registry, data.clone());
    matcher_plugins::register(registry, data);
}
