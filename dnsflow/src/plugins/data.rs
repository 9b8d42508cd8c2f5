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

//! Loaded `data_providers`: named, file-backed line lists read once at
//! startup and handed to matcher-plugin factories by tag.

use droute::{error::ConfigError, Label};
use std::collections::HashMap;

use crate::config::DataProviderConfig;

/// Tag -> concatenated, line-split file contents.
pub struct DataProviders {
    lists: HashMap<Label, Vec<String>>,
}

impl DataProviders {
    /// Read every configured provider's files, in declaration order.
    pub fn load(configs: &[DataProviderConfig]) -> Result<Self, ConfigError> {
        let mut lists = HashMap::new();
        for provider in configs {
            let mut lines = Vec::new();
            for path in &provider.path {
                let content = std::fs::read_to_string(path)?;
                lines.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(str::to_string),
                );
            }
            lists.insert(provider.tag.clone(), lines);
        }
        Ok(Self { lists })
    }

    /// Build an empty provider set, used by the stub configs in CLI tests.
    pub fn empty() -> Self {
        Self {
            lists: HashMap::new(),
        }
    }

    /// Look up a provider's lines by tag.
    pub fn get(&self, tag: &str) -> Option<&[String]> {
        self.lists.get(tag).map(Vec::as_slice)
    }
}
