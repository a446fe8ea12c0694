//! IR model and binary module format for the arena sandbox.
//!
//! A compiled robot module arrives as a byte blob in the `RBMX` format and is
//! parsed into a [`Module`] tree (types, fields, methods, instructions,
//! exception tables). The pipeline mutates the tree (checkpoint insertion,
//! stub substitution) and re-serializes it with [`emit::emit_module`], then
//! self-checks the result with [`verify::verify_module`].
//!
//! Parsing is all-or-nothing: a structurally invalid blob produces a
//! [`parse::MalformedModuleError`] and no partial module.

pub mod builder;
pub mod emit;
pub mod module;
pub mod parse;
pub mod types;
pub mod verify;

pub use builder::{MethodBuilder, ModuleBuilder};
pub use emit::{emit_module, EmitError};
pub use module::{
    ConditionKind, ConstValue, DispatchKind, ExceptionHandler, Field, FieldRef, Instruction,
    InvokeRef, Method, MethodDispatch, Module, ModuleKind, MODULE_INIT_NAME, WELL_KNOWN_ROOT,
};
pub use parse::{parse_module, MalformedModuleError};
pub use types::{MethodDescriptor, TypeDescriptor};
pub use verify::{verify_module, VerificationError};

/// First namespace segment of a qualified name (`team.nav.Pathing` -> `team`).
pub fn namespace_root(qualified: &str) -> &str {
    qualified.split('.').next().unwrap_or(qualified)
}
