//! Hierarchy view over a build-set union.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use smallvec::smallvec;
use tracing::debug;

use arena_ir::{namespace_root, DispatchKind, InvokeRef, Module, ModuleKind, WELL_KNOWN_ROOT};

use crate::target::{CallTarget, TargetSet};

/// An internal (build-set-local) supertype reference could not be resolved.
/// Fatal: the caller submitted an incomplete build set. External/platform
/// supertypes are never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedHierarchyError {
    MissingSupertype { module: String, supertype: String },
    SupertypeCycle { module: String },
    MissingRoot { module: String },
}

impl fmt::Display for UnresolvedHierarchyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedHierarchyError::MissingSupertype { module, supertype } => {
                write!(
                    f,
                    "module {} references build-set-local supertype {} which is not in the build set",
                    module, supertype
                )
            }
            UnresolvedHierarchyError::SupertypeCycle { module } => {
                write!(f, "superclass chain of {} contains a cycle", module)
            }
            UnresolvedHierarchyError::MissingRoot { module } => {
                write!(
                    f,
                    "superclass chain of {} terminates without reaching {}",
                    module, WELL_KNOWN_ROOT
                )
            }
        }
    }
}

impl std::error::Error for UnresolvedHierarchyError {}

/// Ancestor chains, interface closures, and subtype indexes for every module
/// in the union of build sets being instrumented together. Immutable once
/// built.
#[derive(Debug)]
pub struct Hierarchy<'a> {
    modules: BTreeMap<&'a str, &'a Module>,
    namespaces: BTreeSet<&'a str>,
    /// Internal type -> internal modules that subtype it (transitively,
    /// through superclasses and interfaces). Excludes the type itself.
    subtypes: BTreeMap<&'a str, Vec<&'a str>>,
}

impl<'a> Hierarchy<'a> {
    /// Validate every internal supertype reference and build the view.
    pub fn build(modules: &'a [Module]) -> Result<Hierarchy<'a>, UnresolvedHierarchyError> {
        let mut by_name: BTreeMap<&str, &Module> = BTreeMap::new();
        let mut namespaces: BTreeSet<&str> = BTreeSet::new();
        for module in modules {
            by_name.insert(&module.name, module);
            namespaces.insert(namespace_root(&module.name));
        }

        let view = Hierarchy { modules: by_name, namespaces, subtypes: BTreeMap::new() };
        for module in modules {
            view.validate_chain(module)?;
        }

        let mut subtypes: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for module in modules {
            for ancestor in view.internal_supertype_closure(module) {
                subtypes.entry(ancestor).or_default().push(&module.name);
            }
        }
        debug!(
            modules = modules.len(),
            namespaces = view.namespaces.len(),
            "hierarchy view built"
        );

        Ok(Hierarchy { subtypes, ..view })
    }

    /// Whether a qualified type name belongs to the build-set union's
    /// namespaces (and must therefore be present in the union).
    pub fn is_internal_name(&self, name: &str) -> bool {
        self.namespaces.contains(namespace_root(name))
    }

    pub fn module(&self, name: &str) -> Option<&'a Module> {
        self.modules.get(name).copied()
    }

    /// Internal modules that subtype `name`, transitively. Empty for
    /// external or leaf types.
    pub fn subtypes_of(&self, name: &str) -> &[&'a str] {
        self.subtypes.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a call site to the set of concrete methods it may dispatch
    /// to. Deliberately conservative for virtual/interface dispatch.
    pub fn resolve_invoke(&self, inv: &InvokeRef) -> TargetSet {
        let descriptor = inv.descriptor.to_string();
        if !self.is_internal_name(&inv.owner) {
            return smallvec![CallTarget::new(&inv.owner, &inv.name, &descriptor, true)];
        }

        // Static and special dispatch bind exactly the declared target;
        // only virtual/interface dispatch fans out.
        let mut set: TargetSet = smallvec![CallTarget::new(&inv.owner, &inv.name, &descriptor, false)];

        if matches!(inv.dispatch, DispatchKind::Virtual | DispatchKind::Interface) {
            // The implementation the declared owner actually inherits.
            if let Some(defining) = self.defining_module(&inv.owner, &inv.name, &inv.descriptor) {
                push_unique(&mut set, CallTarget::new(defining, &inv.name, &descriptor, false));
            }
            for subtype in self.subtypes_of(&inv.owner) {
                let declares = self
                    .module(subtype)
                    .and_then(|m| m.method(&inv.name, &inv.descriptor))
                    .is_some();
                if declares {
                    push_unique(&mut set, CallTarget::new(subtype, &inv.name, &descriptor, false));
                }
            }
        }
        set
    }

    /// Nearest module in `owner`'s internal superclass chain (including
    /// `owner` itself) that declares `(name, descriptor)`.
    fn defining_module(
        &self,
        owner: &str,
        name: &str,
        descriptor: &arena_ir::MethodDescriptor,
    ) -> Option<&'a str> {
        let mut cursor = self.module(owner);
        while let Some(module) = cursor {
            if module.method(name, descriptor).is_some() {
                return Some(&module.name);
            }
            cursor = module
                .superclass
                .as_deref()
                .filter(|s| self.is_internal_name(s))
                .and_then(|s| self.module(s));
        }
        None
    }

    /// All internal supertypes of `module`: superclass chain plus the
    /// transitive interface closure. Excludes the module itself.
    fn internal_supertype_closure(&self, module: &'a Module) -> BTreeSet<&'a str> {
        let mut closure: BTreeSet<&'a str> = BTreeSet::new();
        let mut pending: Vec<&'a Module> = vec![module];
        while let Some(current) = pending.pop() {
            let supers = current
                .superclass
                .iter()
                .chain(current.interfaces.iter());
            for name in supers {
                if !self.is_internal_name(name) {
                    continue;
                }
                if let Some(parent) = self.module(name) {
                    if closure.insert(&parent.name) {
                        pending.push(parent);
                    }
                }
            }
        }
        closure
    }

    fn validate_chain(&self, module: &Module) -> Result<(), UnresolvedHierarchyError> {
        // Interface references, direct or inherited, follow the same
        // internality rule as superclasses.
        for iface in &module.interfaces {
            if self.is_internal_name(iface) && self.module(iface).is_none() {
                return Err(UnresolvedHierarchyError::MissingSupertype {
                    module: module.name.clone(),
                    supertype: iface.clone(),
                });
            }
        }

        if module.kind == ModuleKind::Interface {
            return Ok(());
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        seen.insert(&module.name);
        let mut current = module;
        loop {
            match current.superclass.as_deref() {
                None => {
                    if current.name == WELL_KNOWN_ROOT {
                        return Ok(());
                    }
                    return Err(UnresolvedHierarchyError::MissingRoot {
                        module: module.name.clone(),
                    });
                }
                Some(parent) if !self.is_internal_name(parent) => {
                    // External supertype: treated as reaching the root.
                    return Ok(());
                }
                Some(parent) => {
                    if !seen.insert(parent) {
                        return Err(UnresolvedHierarchyError::SupertypeCycle {
                            module: module.name.clone(),
                        });
                    }
                    current = self.module(parent).ok_or_else(|| {
                        UnresolvedHierarchyError::MissingSupertype {
                            module: module.name.clone(),
                            supertype: parent.to_string(),
                        }
                    })?;
                }
            }
        }
    }
}

fn push_unique(set: &mut TargetSet, target: CallTarget) {
    if !set.contains(&target) {
        set.push(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_ir::{MethodDispatch, ModuleBuilder};

    fn base_and_override() -> Vec<Module> {
        vec![
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
        ]
    }

    #[test]
    fn virtual_dispatch_includes_overrides() {
        let modules = base_and_override();
        let view = Hierarchy::build(&modules).unwrap();
        let inv = InvokeRef {
            owner: "team.Base".to_string(),
            name: "step".to_string(),
            descriptor: arena_ir::MethodDescriptor::parse("()V").unwrap(),
            dispatch: DispatchKind::Virtual,
        };
        let targets = view.resolve_invoke(&inv);
        let owners: Vec<&str> = targets.iter().map(|t| t.owner.as_str()).collect();
        assert!(owners.contains(&"team.Base"));
        assert!(owners.contains(&"team.Derived"));
        assert!(targets.iter().all(|t| !t.external));
    }

    #[test]
    fn special_dispatch_resolves_only_declared_target() {
        let modules = base_and_override();
        let view = Hierarchy::build(&modules).unwrap();
        let inv = InvokeRef {
            owner: "team.Base".to_string(),
            name: "step".to_string(),
            descriptor: arena_ir::MethodDescriptor::parse("()V").unwrap(),
            dispatch: DispatchKind::Special,
        };
        let targets = view.resolve_invoke(&inv);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].owner, "team.Base");
    }

    #[test]
    fn inherited_call_resolves_to_defining_ancestor() {
        // Derived does not declare `scan`; the declared owner is Derived but
        // the implementation lives on Base.
        let modules = vec![
            ModuleBuilder::new("team.Base", ModuleKind::Class)
                .superclass(WELL_KNOWN_ROOT)
                .method("scan", "()I", MethodDispatch::Instance, 1, 1, |m| {
                    m.load_const_int(0).ret();
                })
                .build(),
            ModuleBuilder::new("team.Derived", ModuleKind::Class)
                .superclass("team.Base")
                .build(),
        ];
        let view = Hierarchy::build(&modules).unwrap();
        let inv = InvokeRef {
            owner: "team.Derived".to_string(),
            name: "scan".to_string(),
            descriptor: arena_ir::MethodDescriptor::parse("()I").unwrap(),
            dispatch: DispatchKind::Virtual,
        };
        let targets = view.resolve_invoke(&inv);
        let owners: Vec<&str> = targets.iter().map(|t| t.owner.as_str()).collect();
        assert!(owners.contains(&"team.Base"), "got {:?}", owners);
    }

    #[test]
    fn static_dispatch_ignores_inherited_definition() {
        // Derived inherits `helper` from Base, but a static call binds the
        // declared owner alone.
        let modules = vec![
            ModuleBuilder::new("team.Base", ModuleKind::Class)
                .superclass(WELL_KNOWN_ROOT)
                .method("helper", "()I", MethodDispatch::Static, 1, 0, |m| {
                    m.load_const_int(1).ret();
                })
                .build(),
            ModuleBuilder::new("team.Derived", ModuleKind::Class)
                .superclass("team.Base")
                .build(),
        ];
        let view = Hierarchy::build(&modules).unwrap();
        let inv = InvokeRef {
            owner: "team.Derived".to_string(),
            name: "helper".to_string(),
            descriptor: arena_ir::MethodDescriptor::parse("()I").unwrap(),
            dispatch: DispatchKind::Static,
        };
        let targets = view.resolve_invoke(&inv);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].owner, "team.Derived");
    }

    #[test]
    fn interface_dispatch_reaches_closure_implementations() {
        let modules = vec![
            ModuleBuilder::new("team.Task", ModuleKind::Interface)
                .method("apply", "(I)I", MethodDispatch::Instance, 0, 0, |_| {})
                .build(),
            ModuleBuilder::new("team.Bot$lambda0", ModuleKind::SyntheticClosure)
                .superclass(WELL_KNOWN_ROOT)
                .implements("team.Task")
                .method("apply", "(I)I", MethodDispatch::Instance, 2, 2, |m| {
                    m.load_local(1).ret();
                })
                .build(),
        ];
        let view = Hierarchy::build(&modules).unwrap();
        let inv = InvokeRef {
            owner: "team.Task".to_string(),
            name: "apply".to_string(),
            descriptor: arena_ir::MethodDescriptor::parse("(I)I").unwrap(),
            dispatch: DispatchKind::Interface,
        };
        let targets = view.resolve_invoke(&inv);
        let owners: Vec<&str> = targets.iter().map(|t| t.owner.as_str()).collect();
        assert!(owners.contains(&"team.Bot$lambda0"), "got {:?}", owners);
    }

    #[test]
    fn external_owner_resolves_to_single_external_target() {
        let modules = base_and_override();
        let view = Hierarchy::build(&modules).unwrap();
        let inv = InvokeRef {
            owner: "sys.time.Clock".to_string(),
            name: "now".to_string(),
            descriptor: arena_ir::MethodDescriptor::parse("()I").unwrap(),
            dispatch: DispatchKind::Virtual,
        };
        let targets = view.resolve_invoke(&inv);
        assert_eq!(targets.len(), 1);
        assert!(targets[0].external);
        assert_eq!(targets[0].owner, "sys.time.Clock");
    }

    #[test]
    fn missing_internal_supertype_is_an_error() {
        let modules = vec![ModuleBuilder::new("team.Derived", ModuleKind::Class)
            .superclass("team.Base")
            .build()];
        let err = Hierarchy::build(&modules).unwrap_err();
        assert_eq!(
            err,
            UnresolvedHierarchyError::MissingSupertype {
                module: "team.Derived".to_string(),
                supertype: "team.Base".to_string(),
            }
        );
    }

    #[test]
    fn external_supertype_is_never_an_error() {
        let modules = vec![ModuleBuilder::new("team.Bot", ModuleKind::Class)
            .superclass("sys.robot.BasePlayer")
            .build()];
        assert!(Hierarchy::build(&modules).is_ok());
    }

    #[test]
    fn supertype_cycle_is_an_error() {
        let modules = vec![
            ModuleBuilder::new("team.A", ModuleKind::Class).superclass("team.B").build(),
            ModuleBuilder::new("team.B", ModuleKind::Class).superclass("team.A").build(),
        ];
        let err = Hierarchy::build(&modules).unwrap_err();
        assert!(matches!(err, UnresolvedHierarchyError::SupertypeCycle { .. }));
    }

    #[test]
    fn rootless_internal_class_is_an_error() {
        let modules = vec![ModuleBuilder::new("team.Floating", ModuleKind::Class).build()];
        let err = Hierarchy::build(&modules).unwrap_err();
        assert!(matches!(err, UnresolvedHierarchyError::MissingRoot { .. }));
    }
}
