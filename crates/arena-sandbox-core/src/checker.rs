//! Violation checker.
//!
//! Walks every method body of every module in the build-set union
//! (static-field initializers are ordinary `<modinit>` methods, so they are
//! covered automatically), resolves every call site to its possible-target
//! set, and takes a policy verdict on each target. Checking is exhaustive:
//! all violations are collected so the submitter sees the complete list, and
//! nothing is ever rewritten when any Forbidden verdict exists.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use arena_ir::{Instruction, Module};
use arena_policy::{PolicyTable, Verdict};
use arena_resolver::{CallTarget, Hierarchy};

/// One forbidden operation reached from submitted code. Carries enough
/// detail (module, method, instruction offset, target, reason) for the
/// submitter to fix their code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub module: String,
    pub method: String,
    pub offset: u32,
    pub target_owner: String,
    pub target_name: String,
    pub target_descriptor: String,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} @{}: illegal operation {}.{}{} ({})",
            self.module,
            self.method,
            self.offset,
            self.target_owner,
            self.target_name,
            self.target_descriptor,
            self.reason
        )
    }
}

/// Non-empty list of violations. A normal rejection outcome, not a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationReport {
    pub violations: Vec<Violation>,
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} violation(s):", self.violations.len())?;
        for v in &self.violations {
            writeln!(f, "  {}", v)?;
        }
        Ok(())
    }
}

impl std::error::Error for ViolationReport {}

/// Counters from a clean check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub modules_checked: usize,
    pub methods_checked: usize,
    pub call_sites_checked: usize,
}

/// Check every module against the policy. `Ok` only when zero violations.
pub fn check_modules(
    modules: &[Module],
    hierarchy: &Hierarchy<'_>,
    policy: &PolicyTable,
) -> Result<CheckSummary, ViolationReport> {
    let mut summary = CheckSummary { modules_checked: modules.len(), ..Default::default() };
    let mut violations: Vec<Violation> = Vec::new();

    for module in modules {
        for method in &module.methods {
            summary.methods_checked += 1;
            for (offset, instr) in method.code.iter().enumerate() {
                check_instruction(
                    module,
                    &method.name,
                    offset as u32,
                    instr,
                    hierarchy,
                    policy,
                    &mut summary,
                    &mut violations,
                );
            }
        }
    }

    if violations.is_empty() {
        debug!(
            modules = summary.modules_checked,
            call_sites = summary.call_sites_checked,
            "policy check passed"
        );
        Ok(summary)
    } else {
        debug!(count = violations.len(), "policy check rejected build set");
        Err(ViolationReport { violations })
    }
}

#[allow(clippy::too_many_arguments)]
fn check_instruction(
    module: &Module,
    method: &str,
    offset: u32,
    instr: &Instruction,
    hierarchy: &Hierarchy<'_>,
    policy: &PolicyTable,
    summary: &mut CheckSummary,
    violations: &mut Vec<Violation>,
) {
    match instr {
        Instruction::Invoke(inv) => {
            // Calls already routed to a registered stub were substituted by
            // a previous rewrite; they are deterministic by construction.
            if policy.is_stub_target(&inv.owner, &inv.name) {
                return;
            }
            summary.call_sites_checked += 1;
            for target in hierarchy.resolve_invoke(inv) {
                if let Verdict::Forbidden { reason } = policy.verdict(&target) {
                    violations.push(Violation {
                        module: module.name.clone(),
                        method: method.to_string(),
                        offset,
                        target_owner: target.owner,
                        target_name: target.name,
                        target_descriptor: target.descriptor,
                        reason,
                    });
                }
            }
        }
        Instruction::FieldGet(f) | Instruction::FieldSet(f) => {
            if hierarchy.is_internal_name(&f.owner) {
                return;
            }
            summary.call_sites_checked += 1;
            let target =
                CallTarget::new(&f.owner, &f.name, &f.type_desc.to_string(), true);
            if let Verdict::Forbidden { reason } = policy.verdict(&target) {
                violations.push(Violation {
                    module: module.name.clone(),
                    method: method.to_string(),
                    offset,
                    target_owner: target.owner,
                    target_name: target.name,
                    target_descriptor: target.descriptor,
                    reason,
                });
            }
        }
        Instruction::New { type_name } => {
            if hierarchy.is_internal_name(type_name) {
                return;
            }
            summary.call_sites_checked += 1;
            if let Verdict::Forbidden { reason } = policy.verdict_for_type(type_name) {
                violations.push(Violation {
                    module: module.name.clone(),
                    method: method.to_string(),
                    offset,
                    target_owner: type_name.clone(),
                    target_name: "<new>".to_string(),
                    target_descriptor: String::new(),
                    reason,
                });
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_ir::{MethodDispatch, ModuleBuilder, ModuleKind, MODULE_INIT_NAME, WELL_KNOWN_ROOT};
    use arena_policy::parse_policy_json;

    fn policy() -> PolicyTable {
        parse_policy_json(
            r#"{
                "version": "test",
                "restricted_roots": ["sys"],
                "entries": [
                    { "matcher": "exact", "owner": "sys.time.Clock", "name": "now",
                      "verdict": "forbidden", "reason": "wall-clock" },
                    { "matcher": "prefix", "owner": "sys.io",
                      "verdict": "forbidden", "reason": "file-io" },
                    { "matcher": "prefix", "owner": "sys.math", "verdict": "allowed" }
                ]
            }"#,
        )
        .unwrap()
    }

    fn check(modules: Vec<Module>) -> Result<CheckSummary, ViolationReport> {
        let hierarchy = Hierarchy::build(&modules).unwrap();
        check_modules(&modules, &hierarchy, &policy())
    }

    #[test]
    fn clean_module_passes() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .method("run", "()V", MethodDispatch::Instance, 2, 1, |m| {
                m.load_const_int(1)
                    .invoke_static("sys.math.Trig", "abs", "(I)I")
                    .store_local(0)
                    .ret();
            })
            .build()];
        let summary = check(modules).unwrap();
        assert_eq!(summary.call_sites_checked, 1);
    }

    #[test]
    fn forbidden_call_reports_offset_and_reason() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .method("run", "()V", MethodDispatch::Instance, 1, 1, |m| {
                m.invoke_static("sys.time.Clock", "now", "()I").store_local(0).ret();
            })
            .build()];
        let report = check(modules).unwrap_err();
        assert_eq!(report.violations.len(), 1);
        let v = &report.violations[0];
        assert_eq!(v.offset, 0);
        assert_eq!(v.method, "run");
        assert_eq!(v.reason, "wall-clock");
        assert_eq!(v.target_owner, "sys.time.Clock");
    }

    #[test]
    fn collects_every_violation_not_just_the_first() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .method("run", "()V", MethodDispatch::Instance, 1, 2, |m| {
                m.invoke_static("sys.time.Clock", "now", "()I")
                    .store_local(0)
                    .invoke_static("sys.io.File", "create", "()I")
                    .store_local(1)
                    .ret();
            })
            .build()];
        let report = check(modules).unwrap_err();
        let reasons: Vec<&str> = report.violations.iter().map(|v| v.reason.as_str()).collect();
        assert_eq!(reasons, vec!["wall-clock", "file-io"]);
    }

    #[test]
    fn static_initializer_is_checked_like_a_method_body() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .field("START", "I", true, None)
            .method(MODULE_INIT_NAME, "()V", MethodDispatch::Static, 1, 0, |m| {
                m.invoke_static("sys.time.Clock", "now", "()I")
                    .field_set("team.Bot", "START", "I", true)
                    .ret();
            })
            .build()];
        let report = check(modules).unwrap_err();
        assert_eq!(report.violations[0].method, MODULE_INIT_NAME);
        assert_eq!(report.violations[0].reason, "wall-clock");
    }

    #[test]
    fn violation_reachable_only_through_override_is_reported() {
        // Base.step calls a method on itself virtually; Derived's override
        // reaches the forbidden target.
        let modules = vec![
            ModuleBuilder::new("team.Base", ModuleKind::Class)
                .superclass(WELL_KNOWN_ROOT)
                .method("step", "()V", MethodDispatch::Instance, 1, 1, |m| {
                    m.ret();
                })
                .build(),
            ModuleBuilder::new("team.Derived", ModuleKind::Class)
                .superclass("team.Base")
                .method("step", "()V", MethodDispatch::Instance, 1, 1, |m| {
                    m.invoke_static("sys.time.Clock", "now", "()I").store_local(0).ret();
                })
                .build(),
        ];
        let report = check(modules).unwrap_err();
        assert_eq!(report.violations[0].module, "team.Derived");
    }

    #[test]
    fn external_field_access_is_checked() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .method("peek", "()V", MethodDispatch::Instance, 1, 1, |m| {
                m.field_get("sys.io.Console", "handle", "I", true).store_local(0).ret();
            })
            .build()];
        let report = check(modules).unwrap_err();
        assert_eq!(report.violations[0].reason, "file-io");
    }

    #[test]
    fn new_of_forbidden_type_is_checked() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .method("open", "()V", MethodDispatch::Instance, 1, 1, |m| {
                m.new_obj("sys.io.FileWriter").store_local(0).ret();
            })
            .build()];
        let report = check(modules).unwrap_err();
        assert_eq!(report.violations[0].target_name, "<new>");
        assert_eq!(report.violations[0].reason, "file-io");
    }

    #[test]
    fn internal_field_access_and_new_are_allowed() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass(WELL_KNOWN_ROOT)
            .field("hp", "I", false, None)
            .method("heal", "()V", MethodDispatch::Instance, 2, 1, |m| {
                m.new_obj("team.Bot")
                    .store_local(0)
                    .load_local(0)
                    .field_get("team.Bot", "hp", "I", false)
                    .store_local(0)
                    .ret();
            })
            .build()];
        let summary = check(modules).unwrap();
        assert_eq!(summary.call_sites_checked, 0);
    }
}
