//! Method-body rewriting.
//!
//! Two independent passes over a checked module:
//!
//! 1. **Resource metering**: a `ResourceCheckpoint(cost)` goes at every
//!    method entry, every backward-branch target (loop header), and every
//!    exception-handler entry. Every cycle in the control-flow graph passes
//!    through a backward edge or a handler entry, so no loop can run with
//!    zero accounted cost. `cost` is the length of the straight-line region
//!    the checkpoint guards (instructions up to the next checkpoint or the
//!    end of the body).
//! 2. **Stub substitution**: an `Invoke` whose declared target carries a
//!    `Rewritten` verdict is redirected to the registered stub, keeping the
//!    descriptor and dispatch kind so operand-stack balance is untouched.
//!
//! Both passes are deterministic and idempotent: existing checkpoints are
//! reused (insertion points that already hold one are skipped) and invokes
//! already routed to a stub are left alone, so re-instrumenting rewritten IR
//! changes nothing.

use std::collections::BTreeSet;
use std::fmt;

use tracing::trace;

use arena_ir::{Instruction, Method, Module};
use arena_policy::{PolicyTable, Verdict};
use arena_resolver::CallTarget;

/// Internal rewriter defect (not the submitter's fault). Config validation
/// makes `UnknownStub` unreachable for tables loaded from JSON; it guards
/// hand-constructed tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    UnknownStub { module: String, method: String, offset: u32, stub_id: String },
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::UnknownStub { module, method, offset, stub_id } => write!(
                f,
                "no stub registered for id '{}' (rewriting {}.{} at instruction {})",
                stub_id, module, method, offset
            ),
        }
    }
}

impl std::error::Error for RewriteError {}

/// Run both passes over every method body. Mutates in place; instruction
/// lists only grow (checkpoints) or have invokes redirected, never lose
/// user instructions.
pub fn rewrite_module(module: &mut Module, policy: &PolicyTable) -> Result<(), RewriteError> {
    let module_name = module.name.clone();
    for method in &mut module.methods {
        if method.code.is_empty() {
            continue;
        }
        meter_method(method);
        substitute_stubs(&module_name, method, policy)?;
        trace!(module = %module_name, method = %method.name, code = method.code.len(), "method rewritten");
    }
    Ok(())
}

fn is_checkpoint(instr: &Instruction) -> bool {
    matches!(instr, Instruction::ResourceCheckpoint { .. })
}

fn meter_method(method: &mut Method) {
    // Insertion points in old-index space: method entry, every backward
    // branch target, and every handler entry. Points already holding a
    // checkpoint (from a previous rewrite) are reused.
    let mut points: BTreeSet<usize> = BTreeSet::new();
    if !is_checkpoint(&method.code[0]) {
        points.insert(0);
    }
    for (i, instr) in method.code.iter().enumerate() {
        if let Instruction::Branch { target, .. } = instr {
            let t = *target as usize;
            if t <= i && t < method.code.len() && !is_checkpoint(&method.code[t]) {
                points.insert(t);
            }
        }
    }
    // A handler whose entry precedes its protected range closes a cycle
    // that contains no backward branch (throw, handle, fall back into the
    // range), so handler entries are metered like loop headers.
    for handler in &method.handlers {
        let e = handler.entry as usize;
        if e < method.code.len() && !is_checkpoint(&method.code[e]) {
            points.insert(e);
        }
    }

    if !points.is_empty() {
        let sorted: Vec<usize> = points.iter().copied().collect();
        // New index of old position `idx`, and of branch targets: a target
        // that is itself an insertion point must land on the checkpoint so
        // the loop passes through it every iteration.
        let shift = |idx: usize| -> u32 { (idx + sorted.partition_point(|&p| p < idx)) as u32 };

        let old = std::mem::take(&mut method.code);
        let mut code = Vec::with_capacity(old.len() + sorted.len());
        for (i, mut instr) in old.into_iter().enumerate() {
            if points.contains(&i) {
                code.push(Instruction::ResourceCheckpoint { cost: 0 });
            }
            if let Instruction::Branch { target, .. } = &mut instr {
                *target = shift(*target as usize);
            }
            code.push(instr);
        }
        method.code = code;

        for handler in &mut method.handlers {
            handler.start = shift(handler.start as usize);
            handler.end = shift(handler.end as usize);
            handler.entry = shift(handler.entry as usize);
        }
    }

    recompute_costs(&mut method.code);
}

/// Recompute every checkpoint's cost from the current layout. Running this
/// on an unchanged layout produces unchanged costs, which is what keeps
/// re-instrumentation byte-identical.
fn recompute_costs(code: &mut [Instruction]) {
    for i in 0..code.len() {
        if !is_checkpoint(&code[i]) {
            continue;
        }
        let cost = code[i + 1..].iter().take_while(|n| !is_checkpoint(n)).count() as u32;
        if let Instruction::ResourceCheckpoint { cost: c } = &mut code[i] {
            *c = cost;
        }
    }
}

fn substitute_stubs(
    module_name: &str,
    method: &mut Method,
    policy: &PolicyTable,
) -> Result<(), RewriteError> {
    for (offset, instr) in method.code.iter_mut().enumerate() {
        let Instruction::Invoke(inv) = instr else {
            continue;
        };
        if policy.is_stub_target(&inv.owner, &inv.name) {
            continue;
        }
        // Substitution keys on the declared target; conservative Forbidden
        // handling over the whole resolved set is the checker's job.
        let declared =
            CallTarget::new(&inv.owner, &inv.name, &inv.descriptor.to_string(), false);
        if let Verdict::Rewritten { stub_id } = policy.verdict(&declared) {
            let stub = policy.stub(&stub_id).ok_or_else(|| RewriteError::UnknownStub {
                module: module_name.to_string(),
                method: method.name.clone(),
                offset: offset as u32,
                stub_id: stub_id.clone(),
            })?;
            trace!(call = %declared, stub = %stub_id, "substituting deterministic stub");
            inv.owner = stub.owner.clone();
            inv.name = stub.name.clone();
        }
    }
    Ok(())
}
