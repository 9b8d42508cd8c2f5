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

//! The `Matcher` capability and the three concrete matcher plugins built on
//! top of the `matcher` crate's primitives.

use crate::query::QueryContext;
use async_trait::async_trait;
use matcher::{cidr::CidrMatcher, domain::MixMatcher, intset::IntSetMatcher};
use std::net::IpAddr;
use thiserror::Error;

/// Errors raised while building or evaluating a matcher.
#[derive(Debug, Error)]
pub enum MatchError {
    /// A regex sub-pattern failed to compile.
    #[error(transparent)]
    Regex(#[from] regex::Error),

    /// A CIDR literal failed to parse.
    #[error(transparent)]
    Cidr(#[from] matcher::cidr::CidrError),

    /// `CidrMatcher::contains` was called before `sort()`.
    #[error("cidr matcher queried before being sorted")]
    Unsorted,
}

/// The `Matcher` plugin capability: given the current query context, decide
/// whether it matches.
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Evaluate the match.
    async fn matches(&self, qc: &QueryContext) -> Result<bool, MatchError>;
}

/// Matches the request qname against a [`MixMatcher`].
pub struct DomainMatcher {
    inner: MixMatcher<()>,
}

impl DomainMatcher {
    /// Wrap a prebuilt mixed domain matcher.
    pub fn new(inner: MixMatcher<()>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Matcher for DomainMatcher {
    async fn matches(&self, qc: &QueryContext) -> Result<bool, MatchError> {
        let question = match qc.query.first_question() {
            Some(q) => q,
            None => return Ok(false),
        };
        let qname = question.qname().to_string();
        Ok(self.inner.matches(qname.trim_end_matches('.')))
    }
}

/// Matches the client's source IP against a sorted [`CidrMatcher`].
pub struct ClientCidrMatcher {
    inner: CidrMatcher,
}

impl ClientCidrMatcher {
    /// Wrap a prebuilt, sorted CIDR matcher.
    pub fn new(inner: CidrMatcher) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Matcher for ClientCidrMatcher {
    async fn matches(&self, qc: &QueryContext) -> Result<bool, MatchError> {
        Ok(self.inner.contains(qc.from.ip()))
    }
}

/// Matches a response IP address against a sorted [`CidrMatcher`]; used for
/// IP-set-style plugins that inspect answers rather than the client address.
pub struct AnswerCidrMatcher {
    inner: CidrMatcher,
}

impl AnswerCidrMatcher {
    /// Wrap a prebuilt, sorted CIDR matcher.
    pub fn new(inner: CidrMatcher) -> Self {
        Self { inner }
    }

    fn answer_ips(qc: &QueryContext) -> Vec<IpAddr> {
        use domain::{base::ParsedDname, rdata::AllRecordData};

        let Some(response) = qc.response.as_ref() else {
            return Vec::new();
        };
        let Ok(records) = response.answer() else {
            return Vec::new();
        };
        records
            .filter_map(|r| r.ok())
            .filter_map(|r| {
                r.into_record::<AllRecordData<bytes::Bytes, ParsedDname<&bytes::Bytes>>>()
                    .ok()
                    .flatten()
            })
            .filter_map(|r| match r.data() {
                AllRecordData::A(a) => Some(IpAddr::V4(a.addr())),
                AllRecordData::Aaaa(a) => Some(IpAddr::V6(a.addr())),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Matcher for AnswerCidrMatcher {
    async fn matches(&self, qc: &QueryContext) -> Result<bool, MatchError> {
        Ok(Self::answer_ips(qc).into_iter().any(|ip| self.inner.contains(ip)))
    }
}

/// Matches the request qtype against an [`IntSetMatcher`].
pub struct QtypeMatcher {
    inner: IntSetMatcher<u16>,
}

impl QtypeMatcher {
    /// Wrap a prebuilt qtype set.
    pub fn new(inner: IntSetMatcher<u16>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Matcher for QtypeMatcher {
    async fn matches(&self, qc: &QueryContext) -> Result<bool, MatchError> {
        let qtype = qc
            .query
            .first_question()
            .map(|q| q.qtype().to_int())
            .unwrap_or(0);
        Ok(self.inner.contains(&qtype))
    }
}

/// Matches the response rcode against an [`IntSetMatcher`].
pub struct RcodeMatcher {
    inner: IntSetMatcher<u16>,
}

impl RcodeMatcher {
    /// Wrap a prebuilt rcode set.
    pub fn new(inner: IntSetMatcher<u16>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Matcher for RcodeMatcher {
    async fn matches(&self, qc: &QueryContext) -> Result<bool, MatchError> {
        let rcode = qc
            .response
            .as_ref()
            .map(|r| u16::from(r.header().rcode().to_int()))
            .unwrap_or(0);
        Ok(self.inner.contains(&rcode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use domain::base::{Dname, MessageBuilder, Rtype};
    use std::str::FromStr;

    fn query_for(name: &str, from: std::net::SocketAddr) -> QueryContext {
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(64))
            .unwrap()
            .question();
        let dname = Dname::<Bytes>::from_str(name).unwrap();
        builder.push((&dname, Rtype::A)).unwrap();
        QueryContext::new(builder.into_message(), from, false)
    }

    #[tokio::test]
    async fn domain_matcher_hits_suffix() {
        let mut mix = MixMatcher::new();
        mix.insert_suffix("example.com", ());
        let m = DomainMatcher::new(mix);
        let qc = query_for("www.example.com", "127.0.0.1:1234".parse().unwrap());
        assert!(m.matches(&qc).await.unwrap());
    }

    #[tokio::test]
    async fn client_cidr_matcher_hits() {
        let mut cidr = CidrMatcher::new();
        cidr.add_str("10.0.0.0/8").unwrap();
        cidr.sort();
        let m = ClientCidrMatcher::new(cidr);
        let qc = query_for("example.com", "10.1.2.3:53".parse().unwrap());
        assert!(m.matches(&qc).await.unwrap());
        let qc2 = query_for("example.com", "8.8.8.8:53".parse().unwrap());
        assert!(!m.matches(&qc2).await.unwrap());
    }

    #[tokio::test]
    async fn qtype_matcher_hits() {
        let set = IntSetMatcher::from_iter([Rtype::A.to_int()]);
        let m = QtypeMatcher::new(set);
        let qc = query_for("example.com", "127.0.0.1:1234".parse().unwrap());
        assert!(m.matches(&qc).await.unwrap());
    }
}
