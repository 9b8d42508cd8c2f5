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

//! Matcher-plugin factories: domain lists, client/answer CIDR sets, qtype and
//! rcode sets.
//!
//! Grounded on the teacher's `matchers/{domain,ipcidr,qtype}.rs` builders,
//! generalized to the mixed full/suffix/keyword/regex matcher and to the new
//! `data_providers` tag indirection instead of inline file paths.

use droute::{
    error::ConfigError,
    graph::PluginInstance,
    matchers::{AnswerCidrMatcher, ClientCidrMatcher, DomainMatcher, QtypeMatcher, RcodeMatcher},
    registry::TypeRegistry,
    Label,
};
use matcher::{cidr::CidrMatcher, domain::MixMatcher, intset::IntSetMatcher};
use serde::Deserialize;
use std::sync::Arc;

use super::data::DataProviders;

fn invalid_args(tag: &Label, source: serde_yaml::Error) -> ConfigError {
    ConfigError::InvalidArgs {
        tag: tag.clone(),
        source,
    }
}

#[derive(Debug, Default, Deserialize)]
struct DomainArgs {
    /// Data-provider tag whose lines are inserted as suffix entries.
    provider: Option<String>,
    #[serde(default)]
    full: Vec<String>,
    #[serde(default)]
    suffix: Vec<String>,
    #[serde(default)]
    keyword: Vec<String>,
    #[serde(default)]
    regex: Vec<String>,
}

fn build_domain_matcher(tag: &Label, args: serde_yaml::Value, data: &DataProviders) -> Result<MixMatcher<()>, ConfigError> {
    let args: DomainArgs = serde_yaml::from_value(args).map_err(|e| invalid_args(tag, e))?;
    let mut mix = MixMatcher::new();
    if let Some(provider) = &args.provider {
        for line in data.get(provider).unwrap_or(&[]) {
            mix.insert_suffix(line, ());
        }
    }
    for d in &args.full {
        mix.insert_full(d, ());
    }
    for d in &args.suffix {
        mix.insert_suffix(d, ());
    }
    for d in &args.keyword {
        mix.insert_keyword(d, ());
    }
    for d in &args.regex {
        mix.insert_regex(d, ())
            .map_err(|e| invalid_args(tag, serde::de::Error::custom(e.to_string())))?;
    }
    Ok(mix)
}

#[derive(Debug, Default, Deserialize)]
struct CidrArgs {
    provider: Option<String>,
    #[serde(default)]
    cidrs: Vec<String>,
}

fn build_cidr_matcher(tag: &Label, args: serde_yaml::Value, data: &DataProviders) -> Result<CidrMatcher, ConfigError> {
    let args: CidrArgs = serde_yaml::from_value(args).map_err(|e| invalid_args(tag, e))?;
    let mut cidr = CidrMatcher::new();
    if let Some(provider) = &args.provider {
        for line in data.get(provider).unwrap_or(&[]) {
            cidr.add_str(line)
                .map_err(|e| invalid_args(tag, serde::de::Error::custom(e.to_string())))?;
        }
    }
    for c in &args.cidrs {
        cidr.add_str(c)
            .map_err(|e| invalid_args(tag, serde::de::Error::custom(e.to_string())))?;
    }
    cidr.sort();
    Ok(cidr)
}

#[derive(Debug, Default, Deserialize)]
struct QtypeArgs {
    #[serde(default)]
    types: Vec<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RcodeArgs {
    #[serde(default)]
    codes: Vec<u16>,
}

/// Register the `domain`, `client_ipcidr`, `answer_ipcidr`, `qtype` and
/// `rcode` matcher-plugin types.
pub fn register(registry: &TypeRegistry, data: Arc<DataProviders>) {
    {
        let data = data.clone();
        registry.register(
            "domain",
            Box::new(move |tag, args| {
                let mix = build_domain_matcher(&tag, args, &data)?;
                Ok(PluginInstance::matcher(
                    tag,
                    Arc::new(DomainMatcher::new(mix)),
                ))
            }),
        );
    }
    {
        let data = data.clone();
        registry.register(
            "client_ipcidr",
            Box::new(move |tag, args| {
                let cidr = build_cidr_matcher(&tag, args, &data)?;
                Ok(PluginInstance::matcher(
                    tag,
                    Arc::new(ClientCidrMatcher::new(cidr)),
                ))
            }),
        );
    }
    {
        let data = data;
        registry.register(
            "answer_ipcidr",
            Box::new(move |tag, args| {
                let cidr = build_cidr_matcher(&tag, args, &data)?;
                Ok(PluginInstance::matcher(
                    tag,
                    Arc::new(AnswerCidrMatcher::new(cidr)),
                ))
            }),
        );
    }
    registry.register(
        "qtype",
        Box::new(move |tag, args| {
            let args: QtypeArgs = serde_yaml::from_value(args).map_err(|e| invalid_args(&tag, e))?;
            let set = IntSetMatcher::from_iter(args.types);
            Ok(PluginInstance::matcher(tag, Arc::new(QtypeMatcher::new(set))))
        }),
    );
    registry.register(
        "rcode",
        Box::new(move |tag, args| {
            let args: RcodeArgs = serde_yaml::from_value(args).map_err(|e| invalid_args(&tag, e))?;
            let set = IntSetMatcher::from_iter(args.codes);
            Ok(PluginInstance::matcher(tag, Arc::new(RcodeMatcher::new(set))))
        }),
    );
}
