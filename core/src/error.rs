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

//! Universal error type for the library. Each layer owns its own error enum;
//! `CoreError` wraps them all via `#[from]` the way `DrouteError` did upstream.

pub use crate::{codec::CodecError, matchers::MatchError, upstream::UpstreamError};
use crate::Label;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while parsing or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Two plugins were declared with the same tag.
    #[error("duplicate plugin tag: `{0}`")]
    DuplicateTag(Label),

    /// A graph node referenced a tag with no matching plugin.
    #[error("plugin not found: `{0}`")]
    PluginNotFound(Label),

    /// A plugin referenced another plugin that is declared later (topological order
    /// violation).
    #[error("plugin `{0}` references `{1}` which has not been declared yet")]
    ForwardReference(Label, Label),

    /// `include` directives nested beyond the allowed depth, or formed a cycle.
    #[error("include depth exceeded (max 8) or include cycle detected at `{0}`")]
    IncludeDepthExceeded(String),

    /// A plugin type name has no registered factory.
    #[error("unknown plugin type: `{0}`")]
    UnknownPluginType(String),

    /// A plugin type was registered twice.
    #[error("plugin type `{0}` is already registered")]
    DuplicatePluginType(String),

    /// Deserializing a plugin's `args` into its typed struct failed.
    #[error("invalid arguments for plugin `{tag}`: {source}")]
    InvalidArgs {
        /// The offending plugin's tag.
        tag: Label,
        /// The underlying deserialization error.
        source: serde_yaml::Error,
    },

    /// Generic I/O failure while reading a configuration or data file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic YAML parse failure.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors surfaced by the plugin-instance execution path.
#[derive(Error, Debug)]
pub enum PluginError {
    /// A plugin's `Exec`/`Match` failed with an application-level message.
    #[error("plugin `{tag}` failed: {message}")]
    Failed {
        /// The failing plugin's tag.
        tag: Label,
        /// Human-readable failure description.
        message: String,
    },
}

/// CoreError enumerates every error this library surfaces.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Error while packing/unpacking or framing a DNS message.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Error talking to an upstream resolver.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Error building or evaluating a matcher.
    #[error(transparent)]
    Match(#[from] MatchError),

    /// Error in configuration parsing or validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error from a plugin's own execution.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// No response could be obtained from any candidate upstream.
    #[error("no response")]
    NoResponse,

    /// Underlying I/O failure not otherwise categorised.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
