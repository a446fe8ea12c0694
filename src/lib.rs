//! Arena Sandbox
//!
//! Instrumentation pipeline for player-submitted robot modules:
//!
//! - **IR model**: parse/emit the `RBMX` binary module format ([`arena_ir`])
//! - **Resolution**: conservative call-target sets over a build-set union
//!   ([`arena_resolver`])
//! - **Policy**: ordered forbidden-operation table loaded from JSON
//!   ([`arena_policy`])
//! - **Pipeline**: check, rewrite with resource checkpoints, re-emit
//!   verified bytes ([`arena_sandbox_core`])
//!
//! The core is a deterministic pure function from (raw bytes, policy table)
//! to (instrumented bytes | error); callers parallelize and cache around it.

pub use arena_ir;
pub use arena_policy;
pub use arena_resolver;
pub use arena_sandbox_core;

pub use arena_ir::{
    emit_module, parse_module, verify_module, EmitError, MalformedModuleError, Module,
    ModuleBuilder, VerificationError,
};
pub use arena_policy::{parse_policy_json, PolicyTable, Verdict};
pub use arena_resolver::{Hierarchy, UnresolvedHierarchyError};
pub use arena_sandbox_core::{
    content_fingerprint, instrument_match, BuildSet, InstrumentedModule, MatchOutput,
    PipelineError, Violation, ViolationReport,
};
