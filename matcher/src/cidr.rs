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

//! A CIDR range matcher: ranges are canonicalised to IPv6, kept in a flat sorted
//! slice, and looked up with a binary search.

use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building a [`CidrMatcher`].
#[derive(Debug, Error)]
pub enum CidrError {
    /// The input string is not a valid IP or CIDR range.
    #[error("invalid CIDR range `{0}`")]
    Parse(String),
}

fn canonicalize(ip: IpAddr, prefix: u8) -> (u128, u8) {
    match ip {
        IpAddr::V6(v6) => (u128::from(v6), prefix),
        IpAddr::V4(v4) => (0xffffu128 << 32 | u128::from(v4.to_bits()), prefix + 96),
    }
}

/// A sorted, dominance-eliminated set of IP ranges.
///
/// `Add` appends entries and marks the set unsorted; `Sort` must be called
/// before `Contains` is used. Calling `Contains` pre-`Sort` panics, matching the
/// "fails if called pre-`Sort`" contract.
#[derive(Debug, Clone, Default)]
pub struct CidrMatcher {
    ranges: Vec<(u128, u8)>,
    sorted: bool,
}

impl CidrMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            sorted: false,
        }
    }

    /// Append a range parsed from CIDR notation (e.g. `"10.0.0.0/8"` or a bare IP).
    pub fn add_str(&mut self, cidr: &str) -> Result<(), CidrError> {
        let (addr_part, prefix_part) = match cidr.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (cidr, None),
        };
        let ip = IpAddr::from_str(addr_part).map_err(|_| CidrError::Parse(cidr.to_string()))?;
        let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|&p| p <= max_prefix)
                .ok_or_else(|| CidrError::Parse(cidr.to_string()))?,
            None => max_prefix,
        };
        self.add(ip, prefix);
        Ok(())
    }

    /// Append a raw `(ip, prefix)` range. Marks the set unsorted.
    pub fn add(&mut self, ip: IpAddr, prefix: u8) {
        self.ranges.push(canonicalize(ip, prefix));
        self.sorted = false;
    }

    /// Load every `\n`-separated line of `data` as a range.
    pub fn add_lines(&mut self, data: &str) -> Result<(), CidrError> {
        for line in data.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
            self.add_str(line)?;
        }
        Ok(())
    }

    /// Sort the accumulated ranges and drop any range fully contained in an
    /// earlier (i.e. broader or equal) one. Must be called before `contains`.
    pub fn sort(&mut self) {
        self.ranges.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut deduped: Vec<(u128, u8)> = Vec::with_capacity(self.ranges.len());
        for &(ip, mask) in &self.ranges {
            let dominated = deduped
                .last()
                .map(|&(base_ip, base_mask)| {
                    base_mask <= mask && in_range(ip, base_ip, base_mask)
                })
                .unwrap_or(false);
            if !dominated {
                deduped.push((ip, mask));
            }
        }
        self.ranges = deduped;
        self.sorted = true;
    }

    /// Whether `ip` falls within any stored range. Panics if `sort` was not
    /// called since the last `add`.
    pub fn contains(&self, ip: IpAddr) -> bool {
        assert!(self.sorted, "CidrMatcher::contains called before sort()");
        let (target, _) = canonicalize(ip, 0);
        // Largest entry whose base IP <= target.
        let idx = match self.ranges.binary_search_by(|&(base, _)| base.cmp(&target)) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        };
        idx.map(|i| {
            let (base, mask) = self.ranges[i];
            in_range(target, base, mask)
        })
        .unwrap_or(false)
    }
}

fn in_range(ip: u128, base: u128, mask: u8) -> bool {
    if mask == 0 {
        return true;
    }
    let shift = 128 - mask as u32;
    (ip >> shift) == (base >> shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ipv4_range() {
        let mut m = CidrMatcher::new();
        m.add_str("10.0.0.0/8").unwrap();
        m.sort();
        assert!(m.contains("10.1.2.3".parse().unwrap()));
        assert!(!m.contains("11.1.2.3".parse().unwrap()));
    }

    #[test]
    fn matches_ipv6_range() {
        let mut m = CidrMatcher::new();
        m.add_str("2001:db8::/32").unwrap();
        m.sort();
        assert!(m.contains("2001:db8::1".parse().unwrap()));
        assert!(!m.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn dominance_elimination_drops_narrower_overlap() {
        let mut m = CidrMatcher::new();
        m.add_str("10.0.0.0/8").unwrap();
        m.add_str("10.1.0.0/16").unwrap();
        m.sort();
        assert_eq!(m.ranges.len(), 1);
        assert!(m.contains("10.1.2.3".parse().unwrap()));
    }

    #[test]
    #[should_panic]
    fn contains_before_sort_panics() {
        let mut m = CidrMatcher::new();
        m.add_str("10.0.0.0/8").unwrap();
        m.contains("10.0.0.1".parse().unwrap());
    }
}
