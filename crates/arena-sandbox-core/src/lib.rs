//! Instrumentation pipeline for a match's build sets.
//!
//! A build set (the submitted module plus everything reachable through
//! nesting/closure synthesis) flows through: parse -> hierarchy resolution
//! -> violation check -> rewrite (resource checkpoints + stub substitution)
//! -> emit + verify. The whole pipeline is a pure synchronous function from
//! (raw bytes, policy table) to (instrumented bytes | error): no I/O, no
//! shared mutable state, trivially memoizable and parallelizable by the
//! caller.

pub mod checker;
pub mod pipeline;
pub mod rewriter;

pub use checker::{check_modules, CheckSummary, Violation, ViolationReport};
pub use pipeline::{
    content_fingerprint, instrument_match, BuildSet, InstrumentedModule, InternalError,
    MatchOutput, PipelineError,
};
pub use rewriter::{rewrite_module, RewriteError};
