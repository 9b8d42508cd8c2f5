#![deny(missing_docs)]
// Documentation
//! Domain, CIDR and integer-set matching primitives.
//!
//! Three independent matcher families live here:
//!
//! - [`domain`]: a mixed domain matcher combining full, suffix, keyword and regex
//!   sub-matchers.
//! - [`cidr`]: an IPv6-canonicalised, sorted CIDR range matcher.
//! - [`intset`]: a constant-time integer-set matcher (qtype/qclass/rcode filters).

pub mod cidr;
pub mod domain;
pub mod intset;

use std::sync::Arc;

/// Type alias used for plugin/rule tags across the workspace.
pub type Label = Arc<str>;

/// A value that can be merged with another value of the same type instead of being
/// replaced outright. When two inserts collide on the same matcher key and the
/// stored value implements `Append`, the new value is appended rather than
/// overwriting the old one.
pub trait Append {
    /// Merge `other` into `self`.
    fn append(&mut self, other: Self);
}

impl<T> Append for Vec<T> {
    fn append(&mut self, mut other: Self) {
        Vec::append(self, &mut other)
    }
}

/// A bare presence marker has nothing to merge.
impl Append for () {
    fn append(&mut self, _other: Self) {}
}
