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

//! A constant-time integer-set matcher, used for qtype/qclass/rcode filters.

use hashbrown::HashSet;
use std::hash::Hash;

/// A hash-set-backed matcher over small integer domains (`u16` qtype/qclass
/// codes, `u8` rcodes, ...).
#[derive(Debug, Clone, Default)]
pub struct IntSetMatcher<T: Eq + Hash> {
    set: HashSet<T>,
}

impl<T: Eq + Hash> IntSetMatcher<T> {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self { set: HashSet::new() }
    }

    /// Build a matcher from an iterator of values.
    pub fn from_iter(values: impl IntoIterator<Item = T>) -> Self {
        Self {
            set: values.into_iter().collect(),
        }
    }

    /// Insert a value.
    pub fn insert(&mut self, value: T) {
        self.set.insert(value);
    }

    /// Constant-time membership test.
    pub fn contains(&self, value: &T) -> bool {
        self.set.contains(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qtype_set_matches() {
        let m: IntSetMatcher<u16> = IntSetMatcher::from_iter([1u16, 28]); // A, AAAA
        assert!(m.contains(&1));
        assert!(m.contains(&28));
        assert!(!m.contains(&5)); // CNAME
    }
}
