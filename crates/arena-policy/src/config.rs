//! JSON policy configuration.
//!
//! Loaded once at process start; reload requires restarting the pipeline.
//! Example:
//!
//! ```json
//! {
//!   "version": "2026-season-1",
//!   "restricted_roots": ["sys"],
//!   "entries": [
//!     { "matcher": "exact", "owner": "sys.time.Clock", "name": "now",
//!       "verdict": "forbidden", "reason": "wall-clock" },
//!     { "matcher": "prefix", "owner": "sys.io",
//!       "verdict": "forbidden", "reason": "file-io" },
//!     { "matcher": "exact", "owner": "sys.math.Random", "name": "next",
//!       "verdict": "rewritten", "stub": "det-random" }
//!   ],
//!   "stubs": {
//!     "det-random": { "owner": "arena.runtime.DetRandom", "name": "next" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::table::{Matcher, PolicyEntry, PolicyTable, StubTarget, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Allowed,
    Forbidden,
    Rewritten,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyEntryConfig {
    pub matcher: MatcherKind,
    pub owner: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub descriptor: Option<String>,
    pub verdict: VerdictKind,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub stub: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StubConfig {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub version: String,
    #[serde(default)]
    pub restricted_roots: Vec<String>,
    #[serde(default)]
    pub entries: Vec<PolicyEntryConfig>,
    #[serde(default)]
    pub stubs: BTreeMap<String, StubConfig>,
}

#[derive(Debug)]
pub enum PolicyConfigError {
    Json(serde_json::Error),
    MissingReason { index: usize },
    MissingStub { index: usize },
    UnknownStub { index: usize, stub_id: String },
    MemberOnPrefix { index: usize },
}

impl fmt::Display for PolicyConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyConfigError::Json(e) => write!(f, "policy config is not valid JSON: {}", e),
            PolicyConfigError::MissingReason { index } => {
                write!(f, "entry {}: forbidden verdict requires a reason code", index)
            }
            PolicyConfigError::MissingStub { index } => {
                write!(f, "entry {}: rewritten verdict requires a stub id", index)
            }
            PolicyConfigError::UnknownStub { index, stub_id } => {
                write!(f, "entry {}: stub id '{}' is not in the stub registry", index, stub_id)
            }
            PolicyConfigError::MemberOnPrefix { index } => {
                write!(f, "entry {}: prefix matchers cannot carry name/descriptor", index)
            }
        }
    }
}

impl std::error::Error for PolicyConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PolicyConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl PolicyConfig {
    /// Validate and freeze into an immutable [`PolicyTable`].
    pub fn into_table(self) -> Result<PolicyTable, PolicyConfigError> {
        let stubs: BTreeMap<String, StubTarget> = self
            .stubs
            .into_iter()
            .map(|(id, s)| (id, StubTarget { owner: s.owner, name: s.name }))
            .collect();

        let mut entries = Vec::with_capacity(self.entries.len());
        for (index, entry) in self.entries.into_iter().enumerate() {
            let matcher = match entry.matcher {
                MatcherKind::Exact => Matcher::Exact {
                    owner: entry.owner,
                    name: entry.name,
                    descriptor: entry.descriptor,
                },
                MatcherKind::Prefix => {
                    if entry.name.is_some() || entry.descriptor.is_some() {
                        return Err(PolicyConfigError::MemberOnPrefix { index });
                    }
                    Matcher::Prefix { owner_prefix: entry.owner }
                }
            };
            let verdict = match entry.verdict {
                VerdictKind::Allowed => Verdict::Allowed,
                VerdictKind::Forbidden => Verdict::Forbidden {
                    reason: entry.reason.ok_or(PolicyConfigError::MissingReason { index })?,
                },
                VerdictKind::Rewritten => {
                    let stub_id = entry.stub.ok_or(PolicyConfigError::MissingStub { index })?;
                    if !stubs.contains_key(&stub_id) {
                        return Err(PolicyConfigError::UnknownStub { index, stub_id });
                    }
                    Verdict::Rewritten { stub_id }
                }
            };
            entries.push(PolicyEntry { matcher, verdict });
        }

        info!(
            version = %self.version,
            entries = entries.len(),
            restricted_roots = self.restricted_roots.len(),
            "policy table loaded"
        );
        Ok(PolicyTable::new(self.version, entries, self.restricted_roots, stubs))
    }
}

/// Parse and validate a policy table from its JSON configuration text.
pub fn parse_policy_json(text: &str) -> Result<PolicyTable, PolicyConfigError> {
    let config: PolicyConfig = serde_json::from_str(text).map_err(PolicyConfigError::Json)?;
    config.into_table()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_resolver::CallTarget;

    const SAMPLE: &str = r#"{
        "version": "2026-season-1",
        "restricted_roots": ["sys"],
        "entries": [
            { "matcher": "exact", "owner": "sys.time.Clock", "name": "now",
              "verdict": "forbidden", "reason": "wall-clock" },
            { "matcher": "exact", "owner": "sys.Strings", "name": "intern",
              "verdict": "forbidden", "reason": "string-intern" },
            { "matcher": "prefix", "owner": "sys.io",
              "verdict": "forbidden", "reason": "file-io" },
            { "matcher": "prefix", "owner": "sys.math",
              "verdict": "allowed" },
            { "matcher": "exact", "owner": "sys.math.Random", "name": "next",
              "verdict": "rewritten", "stub": "det-random" }
        ],
        "stubs": {
            "det-random": { "owner": "arena.runtime.DetRandom", "name": "next" }
        }
    }"#;

    #[test]
    fn loads_sample_config() {
        let table = parse_policy_json(SAMPLE).unwrap();
        assert_eq!(table.version(), "2026-season-1");
        assert_eq!(
            table.verdict(&CallTarget::new("sys.time.Clock", "now", "()I", true)),
            Verdict::Forbidden { reason: "wall-clock".to_string() }
        );
        assert_eq!(
            table.verdict(&CallTarget::new("sys.math.Random", "next", "()I", true)),
            Verdict::Rewritten { stub_id: "det-random".to_string() }
        );
        // Allowed prefix overrides the restricted root default.
        assert_eq!(
            table.verdict(&CallTarget::new("sys.math.Trig", "sin", "(D)D", true)),
            Verdict::Allowed
        );
        // Unlisted sys member falls back to the restricted root.
        assert_eq!(
            table.verdict(&CallTarget::new("sys.threads.Park", "wait", "()V", true)),
            Verdict::Forbidden { reason: "restricted-namespace".to_string() }
        );
    }

    #[test]
    fn forbidden_without_reason_is_rejected() {
        let text = r#"{ "version": "v", "entries": [
            { "matcher": "exact", "owner": "a.B", "verdict": "forbidden" } ] }"#;
        assert!(matches!(
            parse_policy_json(text).unwrap_err(),
            PolicyConfigError::MissingReason { index: 0 }
        ));
    }

    #[test]
    fn rewritten_requires_registered_stub() {
        let text = r#"{ "version": "v", "entries": [
            { "matcher": "exact", "owner": "a.B", "name": "m",
              "verdict": "rewritten", "stub": "ghost" } ] }"#;
        assert!(matches!(
            parse_policy_json(text).unwrap_err(),
            PolicyConfigError::UnknownStub { index: 0, .. }
        ));
    }

    #[test]
    fn prefix_with_member_is_rejected() {
        let text = r#"{ "version": "v", "entries": [
            { "matcher": "prefix", "owner": "sys.io", "name": "open",
              "verdict": "forbidden", "reason": "file-io" } ] }"#;
        assert!(matches!(
            parse_policy_json(text).unwrap_err(),
            PolicyConfigError::MemberOnPrefix { index: 0 }
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            parse_policy_json("{ not json").unwrap_err(),
            PolicyConfigError::Json(_)
        ));
    }
}
