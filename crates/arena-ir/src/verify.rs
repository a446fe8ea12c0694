//! Structural self-check over a module.
//!
//! Run by the emitter stage after rewriting: every branch and handler index
//! must be in range, the declared operand-stack ceiling must hold on every
//! path, local slots must fit `max_locals`, and control must never fall off
//! the end of a body. A failure here is an internal defect (a rewriter bug),
//! not the submitter's fault.

use std::fmt;

use tracing::trace;

use crate::module::{ConditionKind, Instruction, Method, Module};

/// Post-rewrite self-check failure. Internal defect, always fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationError {
    pub module: String,
    pub method: String,
    /// Instruction index the check failed at, when attributable.
    pub offset: Option<u32>,
    pub detail: String,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "verification failed in {}.{}", self.module, self.method)?;
        if let Some(offset) = self.offset {
            write!(f, " at instruction {}", offset)?;
        }
        write!(f, ": {}", self.detail)
    }
}

impl std::error::Error for VerificationError {}

/// Check every method body of `module`. Bodyless methods are skipped.
pub fn verify_module(module: &Module) -> Result<(), VerificationError> {
    for method in &module.methods {
        if method.code.is_empty() {
            continue;
        }
        verify_method(module, method)?;
        trace!(module = %module.name, method = %method.name, "method verified");
    }
    Ok(())
}

fn err(
    module: &Module,
    method: &Method,
    offset: Option<u32>,
    detail: String,
) -> VerificationError {
    VerificationError {
        module: module.name.clone(),
        method: method.name.clone(),
        offset,
        detail,
    }
}

fn verify_method(module: &Module, method: &Method) -> Result<(), VerificationError> {
    let len = method.code.len();

    for (i, instr) in method.code.iter().enumerate() {
        match instr {
            Instruction::Branch { target, .. } => {
                if *target as usize >= len {
                    return Err(err(
                        module,
                        method,
                        Some(i as u32),
                        format!("branch target {} out of range (code length {})", target, len),
                    ));
                }
            }
            Instruction::LoadLocal(slot) | Instruction::StoreLocal(slot) => {
                if *slot >= method.max_locals {
                    return Err(err(
                        module,
                        method,
                        Some(i as u32),
                        format!("local slot {} exceeds max_locals {}", slot, method.max_locals),
                    ));
                }
            }
            _ => {}
        }
    }

    for handler in &method.handlers {
        let valid_range = (handler.start as usize) < (handler.end as usize)
            && (handler.end as usize) <= len
            && (handler.entry as usize) < len;
        if !valid_range {
            return Err(err(
                module,
                method,
                None,
                format!(
                    "handler range [{}, {}) -> {} invalid for code length {}",
                    handler.start, handler.end, handler.entry, len
                ),
            ));
        }
    }

    simulate_stack(module, method)
}

/// Worklist simulation of operand-stack depth. Every join must agree on
/// depth; any disagreement means the rewriter broke stack consistency.
fn simulate_stack(module: &Module, method: &Method) -> Result<(), VerificationError> {
    let len = method.code.len();
    let returns_value = method.descriptor.returns_value();
    let mut depths: Vec<Option<usize>> = vec![None; len];
    let mut worklist: Vec<usize> = Vec::new();

    depths[0] = Some(0);
    worklist.push(0);
    for handler in &method.handlers {
        // Handler entries start with exactly the thrown value on the stack.
        let entry = handler.entry as usize;
        match depths[entry] {
            None => {
                depths[entry] = Some(1);
                worklist.push(entry);
            }
            Some(1) => {}
            Some(d) => {
                return Err(err(
                    module,
                    method,
                    Some(handler.entry),
                    format!("handler entry depth {} conflicts with expected 1", d),
                ));
            }
        }
    }

    while let Some(i) = worklist.pop() {
        let depth = depths[i].unwrap_or(0);
        let instr = &method.code[i];
        let (pops, pushes) = instr.stack_effect(returns_value);
        if depth < pops {
            return Err(err(
                module,
                method,
                Some(i as u32),
                format!("stack underflow: depth {} but instruction pops {}", depth, pops),
            ));
        }
        let next_depth = depth - pops + pushes;
        if next_depth > method.max_stack as usize {
            return Err(err(
                module,
                method,
                Some(i as u32),
                format!(
                    "stack depth {} exceeds declared max_stack {}",
                    next_depth, method.max_stack
                ),
            ));
        }

        let mut successors: Vec<usize> = Vec::with_capacity(2);
        match instr {
            Instruction::Return | Instruction::Throw => {}
            Instruction::Branch { target, cond: ConditionKind::Goto } => {
                successors.push(*target as usize);
            }
            Instruction::Branch { target, .. } => {
                successors.push(i + 1);
                successors.push(*target as usize);
            }
            _ => successors.push(i + 1),
        }

        for s in successors {
            if s >= len {
                return Err(err(
                    module,
                    method,
                    Some(i as u32),
                    "control flow falls off the end of the method".to_string(),
                ));
            }
            match depths[s] {
                None => {
                    depths[s] = Some(next_depth);
                    worklist.push(s);
                }
                Some(existing) if existing == next_depth => {}
                Some(existing) => {
                    return Err(err(
                        module,
                        method,
                        Some(s as u32),
                        format!(
                            "inconsistent stack depth at join: {} vs {}",
                            existing, next_depth
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}
