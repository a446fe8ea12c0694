//! Policy table: qualified operation identity -> verdict.
//!
//! The table is loaded once from JSON at process start, validated into an
//! immutable [`PolicyTable`] value, and shared by reference across
//! concurrent pipeline invocations for a match's lifetime. There is no
//! mutation after load and no hot-reload contract; changing policy means
//! restarting the pipeline.

mod config;
mod table;

pub use config::{
    parse_policy_json, MatcherKind, PolicyConfig, PolicyConfigError, PolicyEntryConfig,
    StubConfig, VerdictKind,
};
pub use table::{Matcher, PolicyEntry, PolicyTable, StubTarget, Verdict, RESTRICTED_NAMESPACE_REASON};
