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

//! Preset plugins, instantiated directly by the orchestrator (not looked up
//! through a YAML `type`): `_return` and `_qtype_A_AAAA`.
//!
//! Grounded on the teacher's builtin matcher/action presets registered ahead
//! of user-configured ones in `router/mod.rs`'s table-building pass.

use async_trait::async_trait;
use droute::{
    error::CoreError,
    graph::{Executable, PluginInstance},
    matchers::QtypeMatcher,
    query::QueryContext,
    Label,
};
use matcher::intset::IntSetMatcher;
use std::sync::Arc;

struct ReturnPlugin;

#[async_trait]
impl Executable for ReturnPlugin {
    async fn exec(&self, qc: &mut QueryContext) -> Result<(), CoreError> {
        qc.returned = true;
        Ok(())
    }
}

/// `_return`: stops the enclosing sequence without changing `status`.
pub fn return_plugin() -> PluginInstance {
    PluginInstance::executable(Label::from("_return"), Arc::new(ReturnPlugin))
}

/// `_qtype_A_AAAA`: matches queries asking for A or AAAA records, the
/// common guard for IP-dependent matchers (`answer_ipcidr` and friends)
/// that would otherwise misfire on CNAME/MX/TXT queries.
pub fn qtype_a_aaaa_plugin() -> PluginInstance {
    use domain::base::iana::Rtype;
    let set = IntSetMatcher::from_iter([u16::from(Rtype::A), u16::from(Rtype::Aaaa)]);
    PluginInstance::matcher(
        Label::from("_qtype_A_AAAA"),
        Arc::new(QtypeMatcher::new(set)),
    )
}

/// Register both presets into a freshly built plugin map, ahead of any
/// configured plugin with the same tag (which is rejected as a duplicate).
pub fn presets() -> Vec<PluginInstance> {
    vec![return_plugin(), qtype_a_aaaa_plugin()]
}
