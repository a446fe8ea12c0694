//! Call-target resolution over the union of all build sets in a match.
//!
//! Virtual and interface dispatch cannot be resolved to a single method at
//! instrumentation time (the concrete receiver type is unknown), so
//! [`Hierarchy::resolve_invoke`] returns the conservative *set* of methods a
//! call site may reach: the declared target, the implementation it inherits,
//! and every override in every subtype present in the union. Types outside
//! the union (platform/library types) resolve to a single external target
//! identified by `(owner, name, descriptor)`; policy checks apply to that
//! identity directly.

mod hierarchy;
mod target;

pub use hierarchy::{Hierarchy, UnresolvedHierarchyError};
pub use target::{CallTarget, TargetSet};
