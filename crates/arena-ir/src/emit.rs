//! Binary module writer.
//!
//! Emission is deterministic: the symbol table is the sorted, deduplicated
//! set of every string the module references, so identical IR always
//! serializes to identical bytes (which is what makes instrumented output
//! safely memoizable by the loader).

use std::collections::BTreeMap;
use std::fmt;

use crate::module::{
    ConditionKind, ConstValue, DispatchKind, Field, Instruction, Method, MethodDispatch, Module,
    ModuleKind,
};
use crate::parse::{FORMAT_VERSION, MAGIC, NO_SYMBOL};

/// The module references more strings, or a longer string, than the wire
/// format's u16 length and count fields can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    SymbolTooLong { len: usize },
    SymbolTableOverflow { count: usize },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::SymbolTooLong { len } => {
                write!(f, "symbol of {} bytes exceeds the u16 length limit", len)
            }
            EmitError::SymbolTableOverflow { count } => {
                write!(f, "{} distinct symbols exceed the u16 table limit", count)
            }
        }
    }
}

impl std::error::Error for EmitError {}

struct SymbolTable {
    indices: BTreeMap<String, u16>,
}

impl SymbolTable {
    fn collect(module: &Module) -> Result<SymbolTable, EmitError> {
        let mut strings: Vec<&str> = Vec::new();
        strings.push(&module.name);
        if let Some(s) = &module.superclass {
            strings.push(s);
        }
        strings.extend(module.interfaces.iter().map(String::as_str));
        strings.extend(module.nested.iter().map(String::as_str));
        let mut owned: Vec<String> = Vec::new();
        for field in &module.fields {
            strings.push(&field.name);
            owned.push(field.type_desc.to_string());
            if let Some(ConstValue::Str(s)) = &field.const_init {
                strings.push(s);
            }
        }
        for method in &module.methods {
            strings.push(&method.name);
            owned.push(method.descriptor.to_string());
            for handler in &method.handlers {
                if let Some(t) = &handler.catch_type {
                    strings.push(t);
                }
            }
            for instr in &method.code {
                match instr {
                    Instruction::LoadConst(ConstValue::Str(s)) => strings.push(s),
                    Instruction::FieldGet(f) | Instruction::FieldSet(f) => {
                        strings.push(&f.owner);
                        strings.push(&f.name);
                        owned.push(f.type_desc.to_string());
                    }
                    Instruction::Invoke(inv) => {
                        strings.push(&inv.owner);
                        strings.push(&inv.name);
                        owned.push(inv.descriptor.to_string());
                    }
                    Instruction::New { type_name } => strings.push(type_name),
                    _ => {}
                }
            }
        }

        let mut indices: BTreeMap<String, u16> = BTreeMap::new();
        for s in strings.into_iter().map(str::to_string).chain(owned) {
            if s.len() > u16::MAX as usize {
                return Err(EmitError::SymbolTooLong { len: s.len() });
            }
            indices.entry(s).or_insert(0);
        }
        if indices.len() > u16::MAX as usize {
            return Err(EmitError::SymbolTableOverflow { count: indices.len() });
        }
        // BTreeMap iteration order is the sorted symbol order.
        let mut next = 0u16;
        for index in indices.values_mut() {
            *index = next;
            next += 1;
        }
        Ok(SymbolTable { indices })
    }

    fn index(&self, s: &str) -> u16 {
        self.indices[s]
    }
}

/// Serialize a module to the binary format. Inverse of
/// [`crate::parse::parse_module`] for structurally valid modules. Fails
/// only when a symbol cannot fit the wire format's u16 limits.
pub fn emit_module(module: &Module) -> Result<Vec<u8>, EmitError> {
    let symbols = SymbolTable::collect(module)?;
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());

    out.extend_from_slice(&(symbols.indices.len() as u16).to_be_bytes());
    for text in symbols.indices.keys() {
        out.extend_from_slice(&(text.len() as u16).to_be_bytes());
        out.extend_from_slice(text.as_bytes());
    }

    out.extend_from_slice(&symbols.index(&module.name).to_be_bytes());
    out.push(match module.kind {
        ModuleKind::Class => 0,
        ModuleKind::Interface => 1,
        ModuleKind::SyntheticClosure => 2,
    });
    let super_index = module
        .superclass
        .as_deref()
        .map(|s| symbols.index(s))
        .unwrap_or(NO_SYMBOL);
    out.extend_from_slice(&super_index.to_be_bytes());

    out.extend_from_slice(&(module.interfaces.len() as u16).to_be_bytes());
    for iface in &module.interfaces {
        out.extend_from_slice(&symbols.index(iface).to_be_bytes());
    }
    out.extend_from_slice(&(module.nested.len() as u16).to_be_bytes());
    for nested in &module.nested {
        out.extend_from_slice(&symbols.index(nested).to_be_bytes());
    }

    out.extend_from_slice(&(module.fields.len() as u16).to_be_bytes());
    for field in &module.fields {
        write_field(&mut out, field, &symbols);
    }

    out.extend_from_slice(&(module.methods.len() as u16).to_be_bytes());
    for method in &module.methods {
        write_method(&mut out, method, &symbols);
    }

    Ok(out)
}

fn write_field(out: &mut Vec<u8>, field: &Field, symbols: &SymbolTable) {
    out.extend_from_slice(&symbols.index(&field.name).to_be_bytes());
    out.extend_from_slice(&symbols.index(&field.type_desc.to_string()).to_be_bytes());
    let mut flags = 0u8;
    if field.is_static {
        flags |= 0b01;
    }
    if field.const_init.is_some() {
        flags |= 0b10;
    }
    out.push(flags);
    if let Some(value) = &field.const_init {
        write_const(out, value, symbols);
    }
}

fn write_method(out: &mut Vec<u8>, method: &Method, symbols: &SymbolTable) {
    out.extend_from_slice(&symbols.index(&method.name).to_be_bytes());
    out.extend_from_slice(&symbols.index(&method.descriptor.to_string()).to_be_bytes());
    out.push(match method.dispatch {
        MethodDispatch::Instance => 0,
        MethodDispatch::Static => 1,
        MethodDispatch::Special => 2,
    });
    out.extend_from_slice(&method.max_stack.to_be_bytes());
    out.extend_from_slice(&method.max_locals.to_be_bytes());

    out.extend_from_slice(&(method.code.len() as u32).to_be_bytes());
    for instr in &method.code {
        write_instruction(out, instr, symbols);
    }

    out.extend_from_slice(&(method.handlers.len() as u16).to_be_bytes());
    for handler in &method.handlers {
        out.extend_from_slice(&handler.start.to_be_bytes());
        out.extend_from_slice(&handler.end.to_be_bytes());
        out.extend_from_slice(&handler.entry.to_be_bytes());
        let catch_index = handler
            .catch_type
            .as_deref()
            .map(|t| symbols.index(t))
            .unwrap_or(NO_SYMBOL);
        out.extend_from_slice(&catch_index.to_be_bytes());
    }
}

fn write_const(out: &mut Vec<u8>, value: &ConstValue, symbols: &SymbolTable) {
    match value {
        ConstValue::Null => out.push(0),
        ConstValue::Int(v) => {
            out.push(1);
            out.extend_from_slice(&(*v as u64).to_be_bytes());
        }
        ConstValue::Float(v) => {
            out.push(2);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        ConstValue::Bool(v) => {
            out.push(3);
            out.push(u8::from(*v));
        }
        ConstValue::Str(s) => {
            out.push(4);
            out.extend_from_slice(&symbols.index(s).to_be_bytes());
        }
    }
}

fn write_instruction(out: &mut Vec<u8>, instr: &Instruction, symbols: &SymbolTable) {
    match instr {
        Instruction::LoadConst(value) => {
            out.push(0x01);
            write_const(out, value, symbols);
        }
        Instruction::LoadLocal(slot) => {
            out.push(0x02);
            out.extend_from_slice(&slot.to_be_bytes());
        }
        Instruction::StoreLocal(slot) => {
            out.push(0x03);
            out.extend_from_slice(&slot.to_be_bytes());
        }
        Instruction::FieldGet(f) | Instruction::FieldSet(f) => {
            out.push(if matches!(instr, Instruction::FieldGet(_)) { 0x04 } else { 0x05 });
            out.extend_from_slice(&symbols.index(&f.owner).to_be_bytes());
            out.extend_from_slice(&symbols.index(&f.name).to_be_bytes());
            out.extend_from_slice(&symbols.index(&f.type_desc.to_string()).to_be_bytes());
            out.push(u8::from(f.is_static));
        }
        Instruction::Invoke(inv) => {
            out.push(0x06);
            out.extend_from_slice(&symbols.index(&inv.owner).to_be_bytes());
            out.extend_from_slice(&symbols.index(&inv.name).to_be_bytes());
            out.extend_from_slice(&symbols.index(&inv.descriptor.to_string()).to_be_bytes());
            out.push(match inv.dispatch {
                DispatchKind::Static => 0,
                DispatchKind::Virtual => 1,
                DispatchKind::Special => 2,
                DispatchKind::Interface => 3,
            });
        }
        Instruction::Branch { target, cond } => {
            out.push(0x07);
            out.extend_from_slice(&target.to_be_bytes());
            out.push(match cond {
                ConditionKind::Goto => 0,
                ConditionKind::IfTrue => 1,
                ConditionKind::IfFalse => 2,
                ConditionKind::IfCmpEq => 3,
                ConditionKind::IfCmpNe => 4,
                ConditionKind::IfCmpLt => 5,
                ConditionKind::IfCmpGt => 6,
            });
        }
        Instruction::Return => out.push(0x08),
        Instruction::New { type_name } => {
            out.push(0x09);
            out.extend_from_slice(&symbols.index(type_name).to_be_bytes());
        }
        Instruction::Throw => out.push(0x0A),
        Instruction::ResourceCheckpoint { cost } => {
            out.push(0x0B);
            out.extend_from_slice(&cost.to_be_bytes());
        }
    }
}
