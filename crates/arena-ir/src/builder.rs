//! Programmatic module construction.
//!
//! Used by tests and tooling to assemble small modules without hand-writing
//! binary blobs. Descriptor arguments are literals; the builder panics on a
//! malformed descriptor rather than returning a `Result`, since that is a
//! programming error at the construction site, not input corruption.

use crate::module::{
    ConditionKind, ConstValue, DispatchKind, ExceptionHandler, Field, FieldRef, Instruction,
    InvokeRef, Method, MethodDispatch, Module, ModuleKind,
};
use crate::types::{MethodDescriptor, TypeDescriptor};

pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str, kind: ModuleKind) -> ModuleBuilder {
        ModuleBuilder {
            module: Module {
                name: name.to_string(),
                kind,
                superclass: None,
                interfaces: Vec::new(),
                nested: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
            },
        }
    }

    pub fn superclass(mut self, name: &str) -> Self {
        self.module.superclass = Some(name.to_string());
        self
    }

    pub fn implements(mut self, name: &str) -> Self {
        self.module.interfaces.push(name.to_string());
        self
    }

    pub fn nested(mut self, name: &str) -> Self {
        self.module.nested.push(name.to_string());
        self
    }

    pub fn field(
        mut self,
        name: &str,
        type_desc: &str,
        is_static: bool,
        const_init: Option<ConstValue>,
    ) -> Self {
        self.module.fields.push(Field {
            name: name.to_string(),
            type_desc: TypeDescriptor::parse(type_desc).expect("field type descriptor"),
            is_static,
            const_init,
        });
        self
    }

    pub fn method(
        mut self,
        name: &str,
        descriptor: &str,
        dispatch: MethodDispatch,
        max_stack: u16,
        max_locals: u16,
        body: impl FnOnce(&mut MethodBuilder),
    ) -> Self {
        let mut mb = MethodBuilder { code: Vec::new() };
        body(&mut mb);
        self.module.methods.push(Method {
            name: name.to_string(),
            descriptor: MethodDescriptor::parse(descriptor).expect("method descriptor"),
            dispatch,
            max_stack,
            max_locals,
            code: mb.code,
            handlers: Vec::new(),
        });
        self
    }

    /// Attach an exception handler to the most recently added method.
    pub fn handler_on_last_method(
        mut self,
        start: u32,
        end: u32,
        entry: u32,
        catch_type: Option<&str>,
    ) -> Self {
        let method = self
            .module
            .methods
            .last_mut()
            .expect("handler_on_last_method requires a method");
        method.handlers.push(ExceptionHandler {
            start,
            end,
            entry,
            catch_type: catch_type.map(str::to_string),
        });
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}

pub struct MethodBuilder {
    code: Vec<Instruction>,
}

impl MethodBuilder {
    pub fn load_const_null(&mut self) -> &mut Self {
        self.push(Instruction::LoadConst(ConstValue::Null))
    }

    pub fn load_const_int(&mut self, v: i64) -> &mut Self {
        self.push(Instruction::LoadConst(ConstValue::Int(v)))
    }

    pub fn load_const_float(&mut self, v: f64) -> &mut Self {
        self.push(Instruction::LoadConst(ConstValue::Float(v)))
    }

    pub fn load_const_bool(&mut self, v: bool) -> &mut Self {
        self.push(Instruction::LoadConst(ConstValue::Bool(v)))
    }

    pub fn load_const_str(&mut self, v: &str) -> &mut Self {
        self.push(Instruction::LoadConst(ConstValue::Str(v.to_string())))
    }

    pub fn load_local(&mut self, slot: u16) -> &mut Self {
        self.push(Instruction::LoadLocal(slot))
    }

    pub fn store_local(&mut self, slot: u16) -> &mut Self {
        self.push(Instruction::StoreLocal(slot))
    }

    pub fn field_get(&mut self, owner: &str, name: &str, ty: &str, is_static: bool) -> &mut Self {
        self.push(Instruction::FieldGet(field_ref(owner, name, ty, is_static)))
    }

    pub fn field_set(&mut self, owner: &str, name: &str, ty: &str, is_static: bool) -> &mut Self {
        self.push(Instruction::FieldSet(field_ref(owner, name, ty, is_static)))
    }

    pub fn invoke_static(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        self.invoke(owner, name, descriptor, DispatchKind::Static)
    }

    pub fn invoke_virtual(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        self.invoke(owner, name, descriptor, DispatchKind::Virtual)
    }

    pub fn invoke_special(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        self.invoke(owner, name, descriptor, DispatchKind::Special)
    }

    pub fn invoke_interface(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        self.invoke(owner, name, descriptor, DispatchKind::Interface)
    }

    pub fn invoke(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        dispatch: DispatchKind,
    ) -> &mut Self {
        self.push(Instruction::Invoke(InvokeRef {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: MethodDescriptor::parse(descriptor).expect("invoke descriptor"),
            dispatch,
        }))
    }

    pub fn branch_goto(&mut self, target: u32) -> &mut Self {
        self.push(Instruction::Branch { target, cond: ConditionKind::Goto })
    }

    pub fn branch_if_true(&mut self, target: u32) -> &mut Self {
        self.push(Instruction::Branch { target, cond: ConditionKind::IfTrue })
    }

    pub fn branch_if_false(&mut self, target: u32) -> &mut Self {
        self.push(Instruction::Branch { target, cond: ConditionKind::IfFalse })
    }

    pub fn branch_if_cmp(&mut self, cond: ConditionKind, target: u32) -> &mut Self {
        self.push(Instruction::Branch { target, cond })
    }

    pub fn new_obj(&mut self, type_name: &str) -> &mut Self {
        self.push(Instruction::New { type_name: type_name.to_string() })
    }

    pub fn throw(&mut self) -> &mut Self {
        self.push(Instruction::Throw)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.push(Instruction::Return)
    }

    pub fn checkpoint(&mut self, cost: u32) -> &mut Self {
        self.push(Instruction::ResourceCheckpoint { cost })
    }

    fn push(&mut self, instr: Instruction) -> &mut Self {
        self.code.push(instr);
        self
    }
}

fn field_ref(owner: &str, name: &str, ty: &str, is_static: bool) -> FieldRef {
    FieldRef {
        owner: owner.to_string(),
        name: name.to_string(),
        type_desc: TypeDescriptor::parse(ty).expect("field type descriptor"),
        is_static,
    }
}
