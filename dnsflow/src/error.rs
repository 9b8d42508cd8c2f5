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

//! The binary-level error type: wraps `droute::error::CoreError` plus
//! `anyhow::Error` for CLI-only failures, matching the teacher's `main.rs`
//! use of `anyhow::Result` at the process boundary while the library crates
//! stay on `thiserror`.

use droute::error::{ConfigError, CoreError};
use thiserror::Error;

/// Errors surfaced at the `dnsflow` binary boundary.
#[derive(Error, Debug)]
pub enum DnsflowError {
    /// A failure from the core query-processing engine.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A configuration-loading or validation failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Any other CLI-level failure (file I/O, service-manager integration, ...).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias used throughout the binary crate.
pub type Result<T> = std::result::Result<T, DnsflowError>;
