//! Verdict lookup.

use arena_resolver::CallTarget;
use std::collections::BTreeMap;
use tracing::trace;

/// Reason code attached to unmatched calls into a restricted namespace root.
pub const RESTRICTED_NAMESPACE_REASON: &str = "restricted-namespace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Forbidden { reason: String },
    Rewritten { stub_id: String },
}

/// How a [`PolicyEntry`] selects targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Full owner-type equality; `name`/`descriptor` of `None` match any
    /// member (and type-level lookups).
    Exact {
        owner: String,
        name: Option<String>,
        descriptor: Option<String>,
    },
    /// Owner-type namespace prefix on segment boundaries: `sys.io` matches
    /// `sys.io.File` but not `sys.iodine.X`.
    Prefix { owner_prefix: String },
}

impl Matcher {
    fn matches(&self, owner: &str, name: Option<&str>, descriptor: Option<&str>) -> bool {
        match self {
            Matcher::Exact { owner: o, name: n, descriptor: d } => {
                o == owner
                    && n.as_deref().map_or(true, |n| Some(n) == name)
                    && d.as_deref().map_or(true, |d| Some(d) == descriptor)
            }
            Matcher::Prefix { owner_prefix } => prefix_matches(owner_prefix, owner),
        }
    }
}

fn prefix_matches(prefix: &str, owner: &str) -> bool {
    match owner.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub matcher: Matcher,
    pub verdict: Verdict,
}

/// Runtime stand-in for a rewritten call. Same descriptor and dispatch as
/// the call it replaces, so operand-stack balance is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubTarget {
    pub owner: String,
    pub name: String,
}

/// Ordered first-match-wins verdict table. Exact entries beat prefix
/// entries; among prefix matches the longest owner prefix wins, ties broken
/// by declaration order. Read-only after construction; `Send + Sync`.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    version: String,
    entries: Vec<PolicyEntry>,
    restricted_roots: Vec<String>,
    stubs: BTreeMap<String, StubTarget>,
}

impl PolicyTable {
    pub fn new(
        version: String,
        entries: Vec<PolicyEntry>,
        restricted_roots: Vec<String>,
        stubs: BTreeMap<String, StubTarget>,
    ) -> PolicyTable {
        PolicyTable { version, entries, restricted_roots, stubs }
    }

    /// Policy-table version string, part of the instrumented-output
    /// fingerprint.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn stub(&self, stub_id: &str) -> Option<&StubTarget> {
        self.stubs.get(stub_id)
    }

    /// True when an invoke already points at a registered stub, which is how
    /// re-instrumentation recognizes prior substitutions.
    pub fn is_stub_target(&self, owner: &str, name: &str) -> bool {
        self.stubs.values().any(|s| s.owner == owner && s.name == name)
    }

    /// Verdict for a resolved call or field target.
    pub fn verdict(&self, target: &CallTarget) -> Verdict {
        self.lookup(&target.owner, Some(&target.name), Some(&target.descriptor))
    }

    /// Type-level verdict, used for `New` and owner-only checks. Only
    /// entries without a member name can match.
    pub fn verdict_for_type(&self, owner: &str) -> Verdict {
        self.lookup(owner, None, None)
    }

    fn lookup(&self, owner: &str, name: Option<&str>, descriptor: Option<&str>) -> Verdict {
        // Exact entries in declaration order.
        for entry in &self.entries {
            if matches!(entry.matcher, Matcher::Exact { .. })
                && entry.matcher.matches(owner, name, descriptor)
            {
                trace!(owner, ?name, verdict = ?entry.verdict, "exact policy match");
                return entry.verdict.clone();
            }
        }
        // Longest prefix wins; order breaks ties (max_by_key keeps the
        // first maximum, so earlier entries win on equal length).
        let best_prefix = self
            .entries
            .iter()
            .filter_map(|entry| match &entry.matcher {
                Matcher::Prefix { owner_prefix } if prefix_matches(owner_prefix, owner) => {
                    Some((owner_prefix.len(), entry))
                }
                _ => None,
            })
            .reduce(|best, candidate| if candidate.0 > best.0 { candidate } else { best });
        if let Some((_, entry)) = best_prefix {
            trace!(owner, ?name, verdict = ?entry.verdict, "prefix policy match");
            return entry.verdict.clone();
        }

        // Default: Allowed, except under a restricted platform root.
        if self.restricted_roots.iter().any(|r| prefix_matches(r, owner)) {
            return Verdict::Forbidden { reason: RESTRICTED_NAMESPACE_REASON.to_string() };
        }
        Verdict::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(owner: &str, name: &str, descriptor: &str) -> CallTarget {
        CallTarget::new(owner, name, descriptor, true)
    }

    fn table(entries: Vec<PolicyEntry>, restricted: &[&str]) -> PolicyTable {
        PolicyTable::new(
            "test".to_string(),
            entries,
            restricted.iter().map(|s| s.to_string()).collect(),
            BTreeMap::new(),
        )
    }

    fn exact(owner: &str, name: Option<&str>, verdict: Verdict) -> PolicyEntry {
        PolicyEntry {
            matcher: Matcher::Exact {
                owner: owner.to_string(),
                name: name.map(str::to_string),
                descriptor: None,
            },
            verdict,
        }
    }

    fn prefix(p: &str, verdict: Verdict) -> PolicyEntry {
        PolicyEntry {
            matcher: Matcher::Prefix { owner_prefix: p.to_string() },
            verdict,
        }
    }

    fn forbidden(reason: &str) -> Verdict {
        Verdict::Forbidden { reason: reason.to_string() }
    }

    #[test]
    fn exact_beats_prefix_regardless_of_order() {
        let t = table(
            vec![
                prefix("sys.time", forbidden("wall-clock")),
                exact("sys.time.Clock", Some("monotonic"), Verdict::Allowed),
            ],
            &[],
        );
        assert_eq!(
            t.verdict(&target("sys.time.Clock", "monotonic", "()I")),
            Verdict::Allowed
        );
        assert_eq!(
            t.verdict(&target("sys.time.Clock", "now", "()I")),
            forbidden("wall-clock")
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table(
            vec![
                prefix("sys", forbidden("restricted-namespace")),
                prefix("sys.io", forbidden("file-io")),
            ],
            &[],
        );
        assert_eq!(t.verdict(&target("sys.io.File", "open", "()V")), forbidden("file-io"));
        assert_eq!(
            t.verdict(&target("sys.net.Socket", "open", "()V")),
            forbidden("restricted-namespace")
        );
    }

    #[test]
    fn prefix_tie_broken_by_declaration_order() {
        let t = table(
            vec![prefix("sys.io", forbidden("first")), prefix("sys.io", forbidden("second"))],
            &[],
        );
        assert_eq!(t.verdict(&target("sys.io.File", "open", "()V")), forbidden("first"));
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        let t = table(vec![prefix("sys.io", forbidden("file-io"))], &[]);
        assert_eq!(t.verdict(&target("sys.iodine.X", "f", "()V")), Verdict::Allowed);
        assert_eq!(t.verdict(&target("sys.io", "f", "()V")), forbidden("file-io"));
    }

    #[test]
    fn unmatched_defaults_allowed_unless_restricted_root() {
        let t = table(vec![], &["sys"]);
        assert_eq!(t.verdict(&target("team.Bot", "run", "()V")), Verdict::Allowed);
        assert_eq!(
            t.verdict(&target("sys.reflect.Mirror", "byName", "(Lcore.String;)V")),
            forbidden(RESTRICTED_NAMESPACE_REASON)
        );
    }

    #[test]
    fn exact_with_name_and_descriptor_discriminates() {
        let t = table(
            vec![PolicyEntry {
                matcher: Matcher::Exact {
                    owner: "sys.Strings".to_string(),
                    name: Some("intern".to_string()),
                    descriptor: Some("()Lcore.String;".to_string()),
                },
                verdict: forbidden("string-intern"),
            }],
            &[],
        );
        assert_eq!(
            t.verdict(&target("sys.Strings", "intern", "()Lcore.String;")),
            forbidden("string-intern")
        );
        assert_eq!(
            t.verdict(&target("sys.Strings", "intern", "(I)Lcore.String;")),
            Verdict::Allowed
        );
        assert_eq!(t.verdict(&target("sys.Strings", "concat", "()Lcore.String;")), Verdict::Allowed);
    }

    #[test]
    fn type_level_lookup_ignores_member_entries() {
        let t = table(
            vec![
                exact("sys.io.File", Some("read"), forbidden("file-io")),
                exact("sys.io.Tape", None, forbidden("file-io")),
            ],
            &[],
        );
        assert_eq!(t.verdict_for_type("sys.io.File"), Verdict::Allowed);
        assert_eq!(t.verdict_for_type("sys.io.Tape"), forbidden("file-io"));
    }

    #[test]
    fn stub_registry_lookup() {
        let mut stubs = BTreeMap::new();
        stubs.insert(
            "det-random".to_string(),
            StubTarget { owner: "arena.runtime.DetRandom".to_string(), name: "next".to_string() },
        );
        let t = PolicyTable::new("v".into(), Vec::new(), Vec::new(), stubs);
        assert!(t.stub("det-random").is_some());
        assert!(t.is_stub_target("arena.runtime.DetRandom", "next"));
        assert!(!t.is_stub_target("arena.runtime.DetRandom", "seed"));
    }
}
