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

#![deny(unsafe_code)]
//! The query-processing engine and I/O substrate for `dnsflow`: the
//! executable graph, the upstream transport layer, the sharded message
//! cache, and the parallel/fallback dispatcher that sits between them.

pub mod cache;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod matchers;
pub mod query;
pub mod registry;
pub mod upstream;

use std::{collections::HashSet, sync::Arc};

/// Maximum TTL as defined in RFC 2181: `2147483647`, conventionally capped
/// to one day's worth of seconds when no configured maximum applies.
pub const MAX_TTL: u32 = 86400_u32;

/// Type alias used for plugin/rule tags across the workspace.
pub type Label = Arc<str>;

/// An object that can be validated against the set of tags already declared
/// elsewhere in the configuration (e.g. to catch forward references).
pub trait Validatable {
    /// The possible errors from the validation.
    type Error;
    /// Validate oneself. `used`: tags used by other parts, which must exist.
    fn validate(&self, used: Option<&HashSet<Label>>) -> std::result::Result<(), Self::Error>;
}
