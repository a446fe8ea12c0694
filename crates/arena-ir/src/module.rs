//! In-memory structural representation of a compiled module.
//!
//! Instances are built once by [`crate::parse::parse_module`] (or a
//! [`crate::builder::ModuleBuilder`]), mutated only by the rewriter stage,
//! and treated as immutable once emitted.

use crate::types::{MethodDescriptor, TypeDescriptor};

/// Every superclass chain of a well-formed build set terminates here.
pub const WELL_KNOWN_ROOT: &str = "core.Object";

/// Name of the implicit method that runs static-field initialization at
/// module-load time. Checked like any other method body.
pub const MODULE_INIT_NAME: &str = "<modinit>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Class,
    Interface,
    /// Compiler-synthesized function object backing a closure. Declares
    /// exactly one functional-interface implementation plus captured-state
    /// fields.
    SyntheticClosure,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub kind: ModuleKind,
    /// `None` only for root types (`core.Object` itself and interfaces).
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    /// Nested/inner modules (including synthesized closures) that travel
    /// with this module in a build set.
    pub nested: Vec<String>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

impl Module {
    pub fn method(&self, name: &str, descriptor: &MethodDescriptor) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && &m.descriptor == descriptor)
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub type_desc: TypeDescriptor,
    pub is_static: bool,
    /// Trivial compile-time constant, if any. Non-trivial static
    /// initialization lives in the `<modinit>` method instead.
    pub const_init: Option<ConstValue>,
}

/// Dispatch flag declared on a method definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodDispatch {
    Instance,
    Static,
    /// Constructors and other directly-bound instance methods.
    Special,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub dispatch: MethodDispatch,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Empty for bodyless (abstract/interface) methods.
    pub code: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
}

/// Exception-handler range over instruction indices: `[start, end)` routes
/// to `entry` when a matching value is thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub entry: u32,
    /// `None` catches everything.
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// How an `Invoke` selects its target at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    Static,
    Virtual,
    Special,
    Interface,
}

/// Condition attached to a `Branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Goto,
    IfTrue,
    IfFalse,
    IfCmpEq,
    IfCmpNe,
    IfCmpLt,
    IfCmpGt,
}

impl ConditionKind {
    /// Operand-stack values consumed by the conditional test.
    pub fn pops(self) -> usize {
        match self {
            ConditionKind::Goto => 0,
            ConditionKind::IfTrue | ConditionKind::IfFalse => 1,
            ConditionKind::IfCmpEq
            | ConditionKind::IfCmpNe
            | ConditionKind::IfCmpLt
            | ConditionKind::IfCmpGt => 2,
        }
    }
}

/// A field access site: `owner.name` of declared type `type_desc`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub type_desc: TypeDescriptor,
    pub is_static: bool,
}

/// A call site as declared in the bytecode. The resolver widens this to the
/// set of concrete methods it may dispatch to.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRef {
    pub owner: String,
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub dispatch: DispatchKind,
}

impl InvokeRef {
    /// Stack values consumed: parameters plus the receiver for
    /// non-static dispatch.
    pub fn pops(&self) -> usize {
        let receiver = if self.dispatch == DispatchKind::Static {
            0
        } else {
            1
        };
        self.descriptor.param_count() + receiver
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    LoadConst(ConstValue),
    LoadLocal(u16),
    StoreLocal(u16),
    FieldGet(FieldRef),
    FieldSet(FieldRef),
    Invoke(InvokeRef),
    Branch { target: u32, cond: ConditionKind },
    Return,
    New { type_name: String },
    Throw,
    /// Introduced only by the rewriter; reports `cost` accumulated
    /// instructions to the scheduler's budget tracker at runtime.
    ResourceCheckpoint { cost: u32 },
}

impl Instruction {
    /// (pops, pushes) on the operand stack. `method_returns_value` matters
    /// only for `Return`.
    pub fn stack_effect(&self, method_returns_value: bool) -> (usize, usize) {
        match self {
            Instruction::LoadConst(_) => (0, 1),
            Instruction::LoadLocal(_) => (0, 1),
            Instruction::StoreLocal(_) => (1, 0),
            Instruction::FieldGet(f) => {
                if f.is_static {
                    (0, 1)
                } else {
                    (1, 1)
                }
            }
            Instruction::FieldSet(f) => {
                if f.is_static {
                    (1, 0)
                } else {
                    (2, 0)
                }
            }
            Instruction::Invoke(inv) => {
                let pushes = if inv.descriptor.returns_value() { 1 } else { 0 };
                (inv.pops(), pushes)
            }
            Instruction::Branch { cond, .. } => (cond.pops(), 0),
            Instruction::Return => {
                if method_returns_value {
                    (1, 0)
                } else {
                    (0, 0)
                }
            }
            Instruction::New { .. } => (0, 1),
            Instruction::Throw => (1, 0),
            Instruction::ResourceCheckpoint { .. } => (0, 0),
        }
    }

    /// True when control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Return
                | Instruction::Throw
                | Instruction::Branch {
                    cond: ConditionKind::Goto,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke(dispatch: DispatchKind, descriptor: &str) -> Instruction {
        Instruction::Invoke(InvokeRef {
            owner: "team.Bot".to_string(),
            name: "step".to_string(),
            descriptor: MethodDescriptor::parse(descriptor).unwrap(),
            dispatch,
        })
    }

    #[test]
    fn invoke_stack_effect_counts_receiver() {
        assert_eq!(invoke(DispatchKind::Static, "(II)I").stack_effect(false), (2, 1));
        assert_eq!(invoke(DispatchKind::Virtual, "(II)I").stack_effect(false), (3, 1));
        assert_eq!(invoke(DispatchKind::Interface, "()V").stack_effect(false), (1, 0));
    }

    #[test]
    fn branch_stack_effect_follows_condition() {
        let goto = Instruction::Branch { target: 0, cond: ConditionKind::Goto };
        let if_true = Instruction::Branch { target: 0, cond: ConditionKind::IfTrue };
        let cmp = Instruction::Branch { target: 0, cond: ConditionKind::IfCmpLt };
        assert_eq!(goto.stack_effect(false), (0, 0));
        assert_eq!(if_true.stack_effect(false), (1, 0));
        assert_eq!(cmp.stack_effect(false), (2, 0));
    }

    #[test]
    fn terminators() {
        assert!(Instruction::Return.is_terminator());
        assert!(Instruction::Throw.is_terminator());
        assert!(Instruction::Branch { target: 0, cond: ConditionKind::Goto }.is_terminator());
        assert!(!Instruction::Branch { target: 0, cond: ConditionKind::IfTrue }.is_terminator());
        assert!(!Instruction::ResourceCheckpoint { cost: 1 }.is_terminator());
    }

    #[test]
    fn field_access_static_flag_changes_effect() {
        let f = FieldRef {
            owner: "team.Bot".to_string(),
            name: "hp".to_string(),
            type_desc: TypeDescriptor::Int,
            is_static: false,
        };
        assert_eq!(Instruction::FieldGet(f.clone()).stack_effect(false), (1, 1));
        let mut s = f;
        s.is_static = true;
        assert_eq!(Instruction::FieldGet(s.clone()).stack_effect(false), (0, 1));
        assert_eq!(Instruction::FieldSet(s).stack_effect(false), (1, 0));
    }
}
