//! Resolved call-target identities.

use std::fmt;

use smallvec::SmallVec;

/// One concrete method (or field/type identity) a call site may reach.
///
/// `descriptor` is the textual descriptor form so the same identity shape
/// works for method calls, field accesses, and type-level checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallTarget {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    /// True when `owner` lives outside the build-set union.
    pub external: bool,
}

impl CallTarget {
    pub fn new(owner: &str, name: &str, descriptor: &str, external: bool) -> CallTarget {
        CallTarget {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            external,
        }
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Possible-target set for one call site. Almost always 1–2 entries.
pub type TargetSet = SmallVec<[CallTarget; 2]>;
