//! Binary module reader.
//!
//! All-or-nothing: any structural problem produces a
//! [`MalformedModuleError`] and no partial [`Module`]. The wire layout is
//! documented in the workspace README; integers are big-endian, and every
//! name/descriptor is an index into a per-module symbol table.

use std::fmt;

use crate::module::{
    ConditionKind, ConstValue, DispatchKind, ExceptionHandler, Field, FieldRef, Instruction,
    InvokeRef, Method, MethodDispatch, Module, ModuleKind,
};
use crate::types::{MethodDescriptor, TypeDescriptor};

pub const MAGIC: [u8; 4] = *b"RBMX";
pub const FORMAT_VERSION: u16 = 1;

/// Sentinel symbol index meaning "absent" (superclass of a root type,
/// catch-all handler type).
pub const NO_SYMBOL: u16 = u16::MAX;

/// Structurally invalid input. Always fatal to the module; never the
/// submitter's semantic fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedModuleError {
    Truncated { at: usize, needed: usize },
    BadMagic { found: [u8; 4] },
    UnsupportedVersion { found: u16 },
    SymbolOutOfRange { index: u16, table_len: usize },
    InvalidSymbolText { index: u16 },
    InvalidOpcode { opcode: u8, offset: u32 },
    InvalidOperand { what: &'static str, value: u8, offset: u32 },
    BadDescriptor { text: String, detail: String },
    ClosureInterfaceCount { module: String, count: usize },
    DuplicateMethod { module: String, name: String, descriptor: String },
    TrailingBytes { remaining: usize },
}

impl fmt::Display for MalformedModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedModuleError::Truncated { at, needed } => {
                write!(f, "truncated module: needed {} byte(s) at offset {}", needed, at)
            }
            MalformedModuleError::BadMagic { found } => {
                write!(f, "bad magic {:02x?}, expected {:02x?}", found, MAGIC)
            }
            MalformedModuleError::UnsupportedVersion { found } => {
                write!(f, "unrecognized format version {} (supported: {})", found, FORMAT_VERSION)
            }
            MalformedModuleError::SymbolOutOfRange { index, table_len } => {
                write!(f, "symbol index {} out of range (table has {} entries)", index, table_len)
            }
            MalformedModuleError::InvalidSymbolText { index } => {
                write!(f, "symbol {} is not valid UTF-8", index)
            }
            MalformedModuleError::InvalidOpcode { opcode, offset } => {
                write!(f, "invalid opcode {:#04x} at instruction {}", opcode, offset)
            }
            MalformedModuleError::InvalidOperand { what, value, offset } => {
                write!(f, "invalid {} byte {:#04x} at instruction {}", what, value, offset)
            }
            MalformedModuleError::BadDescriptor { text, detail } => {
                write!(f, "bad descriptor '{}': {}", text, detail)
            }
            MalformedModuleError::ClosureInterfaceCount { module, count } => {
                write!(
                    f,
                    "synthetic closure {} must implement exactly one interface, found {}",
                    module, count
                )
            }
            MalformedModuleError::DuplicateMethod { module, name, descriptor } => {
                write!(f, "duplicate method {}.{}{}", module, name, descriptor)
            }
            MalformedModuleError::TrailingBytes { remaining } => {
                write!(f, "{} trailing byte(s) after module body", remaining)
            }
        }
    }
}

impl std::error::Error for MalformedModuleError {}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    symbols: Vec<String>,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MalformedModuleError> {
        if self.pos + n > self.bytes.len() {
            return Err(MalformedModuleError::Truncated { at: self.pos, needed: n });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MalformedModuleError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MalformedModuleError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MalformedModuleError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, MalformedModuleError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn sym(&mut self) -> Result<String, MalformedModuleError> {
        let index = self.u16()?;
        self.lookup(index)
    }

    fn opt_sym(&mut self) -> Result<Option<String>, MalformedModuleError> {
        let index = self.u16()?;
        if index == NO_SYMBOL {
            return Ok(None);
        }
        self.lookup(index).map(Some)
    }

    fn lookup(&self, index: u16) -> Result<String, MalformedModuleError> {
        self.symbols
            .get(index as usize)
            .cloned()
            .ok_or(MalformedModuleError::SymbolOutOfRange {
                index,
                table_len: self.symbols.len(),
            })
    }
}

fn type_desc(text: String) -> Result<TypeDescriptor, MalformedModuleError> {
    TypeDescriptor::parse(&text)
        .map_err(|detail| MalformedModuleError::BadDescriptor { text, detail })
}

fn method_desc(text: String) -> Result<MethodDescriptor, MalformedModuleError> {
    MethodDescriptor::parse(&text)
        .map_err(|detail| MalformedModuleError::BadDescriptor { text, detail })
}

/// Parse one module blob. Pure transform from bytes to structure; no I/O.
pub fn parse_module(bytes: &[u8]) -> Result<Module, MalformedModuleError> {
    let mut r = Reader { bytes, pos: 0, symbols: Vec::new() };

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(MalformedModuleError::BadMagic {
            found: [magic[0], magic[1], magic[2], magic[3]],
        });
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(MalformedModuleError::UnsupportedVersion { found: version });
    }

    let symbol_count = r.u16()?;
    let mut symbols = Vec::with_capacity(symbol_count as usize);
    for index in 0..symbol_count {
        let len = r.u16()? as usize;
        let raw = r.take(len)?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| MalformedModuleError::InvalidSymbolText { index })?;
        symbols.push(text.to_string());
    }
    r.symbols = symbols;

    let name = r.sym()?;
    let kind = match r.u8()? {
        0 => ModuleKind::Class,
        1 => ModuleKind::Interface,
        2 => ModuleKind::SyntheticClosure,
        value => {
            return Err(MalformedModuleError::InvalidOperand { what: "module kind", value, offset: 0 })
        }
    };
    let superclass = r.opt_sym()?;

    let interface_count = r.u16()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        interfaces.push(r.sym()?);
    }
    if kind == ModuleKind::SyntheticClosure && interfaces.len() != 1 {
        return Err(MalformedModuleError::ClosureInterfaceCount {
            module: name,
            count: interfaces.len(),
        });
    }

    let nested_count = r.u16()? as usize;
    let mut nested = Vec::with_capacity(nested_count);
    for _ in 0..nested_count {
        nested.push(r.sym()?);
    }

    let field_count = r.u16()? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let field_name = r.sym()?;
        let field_type = type_desc(r.sym()?)?;
        let flags = r.u8()?;
        if flags & !0b11 != 0 {
            return Err(MalformedModuleError::InvalidOperand {
                what: "field flags",
                value: flags,
                offset: 0,
            });
        }
        let const_init = if flags & 0b10 != 0 {
            Some(read_const(&mut r, 0)?)
        } else {
            None
        };
        fields.push(Field {
            name: field_name,
            type_desc: field_type,
            is_static: flags & 0b01 != 0,
            const_init,
        });
    }

    let method_count = r.u16()? as usize;
    let mut methods: Vec<Method> = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        let method = read_method(&mut r)?;
        if methods
            .iter()
            .any(|m| m.name == method.name && m.descriptor == method.descriptor)
        {
            return Err(MalformedModuleError::DuplicateMethod {
                module: name,
                name: method.name,
                descriptor: method.descriptor.to_string(),
            });
        }
        methods.push(method);
    }

    if r.pos != r.bytes.len() {
        return Err(MalformedModuleError::TrailingBytes { remaining: r.bytes.len() - r.pos });
    }

    Ok(Module { name, kind, superclass, interfaces, nested, fields, methods })
}

fn read_method(r: &mut Reader<'_>) -> Result<Method, MalformedModuleError> {
    let name = r.sym()?;
    let descriptor = method_desc(r.sym()?)?;
    let dispatch = match r.u8()? {
        0 => MethodDispatch::Instance,
        1 => MethodDispatch::Static,
        2 => MethodDispatch::Special,
        value => {
            return Err(MalformedModuleError::InvalidOperand {
                what: "method dispatch",
                value,
                offset: 0,
            })
        }
    };
    let max_stack = r.u16()?;
    let max_locals = r.u16()?;

    let code_len = r.u32()?;
    // Each instruction takes at least one byte, so a declared count beyond
    // the remaining input is truncation. Checked before any preallocation:
    // the count is attacker-controlled.
    let remaining = r.bytes.len() - r.pos;
    if code_len as usize > remaining {
        return Err(MalformedModuleError::Truncated { at: r.pos, needed: code_len as usize });
    }
    let mut code = Vec::with_capacity(code_len as usize);
    for offset in 0..code_len {
        code.push(read_instruction(r, offset)?);
    }

    let handler_count = r.u16()? as usize;
    let mut handlers = Vec::with_capacity(handler_count);
    for _ in 0..handler_count {
        handlers.push(ExceptionHandler {
            start: r.u32()?,
            end: r.u32()?,
            entry: r.u32()?,
            catch_type: r.opt_sym()?,
        });
    }

    Ok(Method { name, descriptor, dispatch, max_stack, max_locals, code, handlers })
}

fn read_const(r: &mut Reader<'_>, offset: u32) -> Result<ConstValue, MalformedModuleError> {
    match r.u8()? {
        0 => Ok(ConstValue::Null),
        1 => Ok(ConstValue::Int(r.u64()? as i64)),
        2 => Ok(ConstValue::Float(f64::from_bits(r.u64()?))),
        3 => match r.u8()? {
            0 => Ok(ConstValue::Bool(false)),
            1 => Ok(ConstValue::Bool(true)),
            value => Err(MalformedModuleError::InvalidOperand { what: "bool constant", value, offset }),
        },
        4 => Ok(ConstValue::Str(r.sym()?)),
        value => Err(MalformedModuleError::InvalidOperand { what: "constant tag", value, offset }),
    }
}

fn read_instruction(r: &mut Reader<'_>, offset: u32) -> Result<Instruction, MalformedModuleError> {
    match r.u8()? {
        0x01 => Ok(Instruction::LoadConst(read_const(r, offset)?)),
        0x02 => Ok(Instruction::LoadLocal(r.u16()?)),
        0x03 => Ok(Instruction::StoreLocal(r.u16()?)),
        0x04 => Ok(Instruction::FieldGet(read_field_ref(r, offset)?)),
        0x05 => Ok(Instruction::FieldSet(read_field_ref(r, offset)?)),
        0x06 => {
            let owner = r.sym()?;
            let name = r.sym()?;
            let descriptor = method_desc(r.sym()?)?;
            let dispatch = match r.u8()? {
                0 => DispatchKind::Static,
                1 => DispatchKind::Virtual,
                2 => DispatchKind::Special,
                3 => DispatchKind::Interface,
                value => {
                    return Err(MalformedModuleError::InvalidOperand {
                        what: "dispatch kind",
                        value,
                        offset,
                    })
                }
            };
            Ok(Instruction::Invoke(InvokeRef { owner, name, descriptor, dispatch }))
        }
        0x07 => {
            let target = r.u32()?;
            let cond = match r.u8()? {
                0 => ConditionKind::Goto,
                1 => ConditionKind::IfTrue,
                2 => ConditionKind::IfFalse,
                3 => ConditionKind::IfCmpEq,
                4 => ConditionKind::IfCmpNe,
                5 => ConditionKind::IfCmpLt,
                6 => ConditionKind::IfCmpGt,
                value => {
                    return Err(MalformedModuleError::InvalidOperand {
                        what: "condition kind",
                        value,
                        offset,
                    })
                }
            };
            Ok(Instruction::Branch { target, cond })
        }
        0x08 => Ok(Instruction::Return),
        0x09 => Ok(Instruction::New { type_name: r.sym()? }),
        0x0A => Ok(Instruction::Throw),
        0x0B => Ok(Instruction::ResourceCheckpoint { cost: r.u32()? }),
        opcode => Err(MalformedModuleError::InvalidOpcode { opcode, offset }),
    }
}

fn read_field_ref(r: &mut Reader<'_>, offset: u32) -> Result<FieldRef, MalformedModuleError> {
    let owner = r.sym()?;
    let name = r.sym()?;
    let type_desc = type_desc(r.sym()?)?;
    let flags = r.u8()?;
    if flags & !0b1 != 0 {
        return Err(MalformedModuleError::InvalidOperand { what: "field flags", value: flags, offset });
    }
    Ok(FieldRef { owner, name, type_desc, is_static: flags & 0b1 != 0 })
}
