//! Entity storage, scope discipline, declaration and lookup.

use std::collections::HashMap;

use scatha_core::Builtin;

use crate::ast::PointerQual;
use crate::issue::{BadStmt, IssueHandler, IssueKind};
use crate::sema::entity::*;
use crate::source::SourceRange;

/// Handles to the pre-declared builtin types.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinTypes {
    pub void: EntityId,
    pub byte: EntityId,
    pub bool_: EntityId,
    pub s8: EntityId,
    pub s16: EntityId,
    pub s32: EntityId,
    pub s64: EntityId,
    pub u8: EntityId,
    pub u16: EntityId,
    pub u32: EntityId,
    pub u64: EntityId,
    pub f32: EntityId,
    pub f64: EntityId,
    pub nullptr: EntityId,
    /// `str` = `[byte]`.
    pub str_: EntityId,
}

/// Result of a name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    None,
    Single(EntityId),
    /// All findings were functions; an ad-hoc overload set was formed.
    Overloads(EntityId),
    /// Distinct non-function entities share the name (e.g. found through
    /// multiple base classes).
    Ambiguous(Vec<EntityId>),
}

impl Lookup {
    pub fn single(&self) -> Option<EntityId> {
        match self {
            Lookup::Single(id) | Lookup::Overloads(id) => Some(*id),
            _ => None,
        }
    }
}

pub struct SymbolTable {
    entities: Vec<Entity>,
    global: EntityId,
    current: EntityId,
    /// Currently analyzed file; governs file-private visibility.
    current_file: Option<u32>,
    builtins: BuiltinTypes,
    builtin_functions: HashMap<Builtin, EntityId>,
    pointer_cache: HashMap<(QualType, PointerQual), EntityId>,
    reference_cache: HashMap<QualType, EntityId>,
    array_cache: HashMap<(EntityId, Option<u64>), EntityId>,
    temporary_count: u32,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut entities = Vec::new();
        let global = EntityId::from_raw(0);
        entities.push(Entity {
            name: String::new(),
            parent: None,
            access: AccessControl::Public,
            file: None,
            range: SourceRange::default(),
            kind: EntityKind::GlobalScope(ScopeData::default()),
        });
        let mut table = SymbolTable {
            entities,
            global,
            current: global,
            current_file: None,
            // Overwritten right below once the type entities exist.
            builtins: BuiltinTypes {
                void: global,
                byte: global,
                bool_: global,
                s8: global,
                s16: global,
                s32: global,
                s64: global,
                u8: global,
                u16: global,
                u32: global,
                u64: global,
                f32: global,
                f64: global,
                nullptr: global,
                str_: global,
            },
            builtin_functions: HashMap::new(),
            pointer_cache: HashMap::new(),
            reference_cache: HashMap::new(),
            array_cache: HashMap::new(),
            temporary_count: 0,
        };
        table.declare_builtin_types();
        table.declare_builtin_functions();
        table
    }

    // ------------------------------------------------------------------
    // Entity access
    // ------------------------------------------------------------------

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.raw() as usize]
    }

    pub fn entity_mut(&mut self, id: EntityId) -> &mut Entity {
        &mut self.entities[id.raw() as usize]
    }

    /// Chase alias entities to the aliased entity.
    pub fn resolve(&self, mut id: EntityId) -> EntityId {
        while let EntityKind::Alias { target } = self.entity(id).kind {
            id = target;
        }
        id
    }

    pub fn global_scope(&self) -> EntityId {
        self.global
    }

    pub fn builtins(&self) -> &BuiltinTypes {
        &self.builtins
    }

    pub fn builtin_function(&self, builtin: Builtin) -> EntityId {
        self.builtin_functions[&builtin]
    }

    fn add_entity(&mut self, entity: Entity) -> EntityId {
        let id = EntityId::from_raw(self.entities.len() as u32);
        self.entities.push(entity);
        id
    }

    // ------------------------------------------------------------------
    // Scope discipline
    // ------------------------------------------------------------------

    pub fn current_scope(&self) -> EntityId {
        self.current
    }

    pub fn current_file(&self) -> Option<u32> {
        self.current_file
    }

    pub fn set_current_file(&mut self, file: Option<u32>) {
        self.current_file = file;
    }

    pub fn push_scope(&mut self, scope: EntityId) {
        debug_assert!(self.entity(scope).is_scope(), "pushed entity is not a scope");
        debug_assert_eq!(self.entity(scope).parent, Some(self.current));
        self.current = scope;
    }

    pub fn pop_scope(&mut self) {
        self.current = self
            .entity(self.current)
            .parent
            .expect("popped the global scope");
    }

    /// Run `f` with `scope` temporarily current; the previous scope is
    /// restored on all exits.
    pub fn with_scope_current<R>(
        &mut self,
        scope: EntityId,
        f: impl FnOnce(&mut SymbolTable) -> R,
    ) -> R {
        debug_assert!(self.entity(scope).is_scope(), "entity is not a scope");
        let previous = self.current;
        self.current = scope;
        let result = f(self);
        self.current = previous;
        result
    }

    /// A fresh anonymous block scope under the current scope.
    pub fn add_anonymous_scope(&mut self) -> EntityId {
        let id = self.add_entity(Entity {
            name: String::new(),
            parent: Some(self.current),
            access: AccessControl::Public,
            file: self.current_file,
            range: SourceRange::default(),
            kind: EntityKind::AnonymousScope(ScopeData::default()),
        });
        self.attach_child(id);
        id
    }

    fn attach_child(&mut self, child: EntityId) {
        let parent = self.entity(child).parent.expect("child without parent");
        self.entity_mut(parent)
            .scope_data_mut()
            .expect("parent is not a scope")
            .children
            .push(child);
    }

    // ------------------------------------------------------------------
    // Declaration
    // ------------------------------------------------------------------

    /// Bind `name -> id` in the current scope, enforcing the redefinition
    /// rules. Functions stack into overload sets; private entities from
    /// different files may coexist.
    fn bind_name(
        &mut self,
        name: &str,
        id: EntityId,
        range: SourceRange,
        issues: &mut IssueHandler,
    ) -> bool {
        let current = self.current;
        let existing = self
            .entity(current)
            .scope_data()
            .and_then(|s| s.names.get(name))
            .cloned()
            .unwrap_or_default();
        for &other in &existing {
            let other_ent = self.entity(other);
            if other_ent.is_poison() {
                continue;
            }
            let both_functions = other_ent.as_function().is_some()
                && self.entity(id).as_function().is_some();
            if both_functions {
                continue;
            }
            let file_private_coexistence = other_ent.access == AccessControl::Private
                && self.entity(id).access == AccessControl::Private
                && other_ent.file != self.entity(id).file;
            if file_private_coexistence {
                continue;
            }
            issues.error(
                range,
                IssueKind::BadStmt(BadStmt::Redefinition {
                    name: name.to_string(),
                    previous: Some(other_ent.range),
                }),
            );
            return false;
        }
        self.entity_mut(current)
            .scope_data_mut()
            .expect("current entity is not a scope")
            .names
            .entry(name.to_string())
            .or_default()
            .push(id);
        true
    }

    fn declare_named(
        &mut self,
        name: &str,
        access: AccessControl,
        range: SourceRange,
        kind: EntityKind,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        let id = self.add_entity(Entity {
            name: name.to_string(),
            parent: Some(self.current),
            access,
            file: self.current_file,
            range,
            kind,
        });
        if !self.bind_name(name, id, range, issues) {
            self.declare_poison(name);
            return None;
        }
        self.attach_child(id);
        Some(id)
    }

    pub fn declare_record_type(
        &mut self,
        name: &str,
        protocol: bool,
        access: AccessControl,
        range: SourceRange,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        let data = RecordData::default();
        let kind = if protocol {
            EntityKind::ProtocolType(data)
        } else {
            EntityKind::StructType(data)
        };
        self.declare_named(name, access, range, kind, issues)
    }

    pub fn declare_variable(
        &mut self,
        name: &str,
        mutability: Mutability,
        is_static: bool,
        access: AccessControl,
        range: SourceRange,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        self.declare_named(
            name,
            access,
            range,
            EntityKind::Variable(VariableData {
                mutability,
                is_static,
                ..VariableData::default()
            }),
            issues,
        )
    }

    pub fn declare_func_name(
        &mut self,
        name: &str,
        access: AccessControl,
        range: SourceRange,
        data: FunctionData,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        self.declare_named(name, access, range, EntityKind::Function(data), issues)
    }

    pub fn declare_base_class(
        &mut self,
        range: SourceRange,
    ) -> EntityId {
        // Base class objects are positional, not named; no binding needed.
        let id = self.add_entity(Entity {
            name: String::new(),
            parent: Some(self.current),
            access: AccessControl::Public,
            file: self.current_file,
            range,
            kind: EntityKind::BaseClassObject { ty: None, offset: None, index: None },
        });
        self.attach_child(id);
        id
    }

    pub fn declare_file_scope(&mut self, index: u32, name: &str) -> EntityId {
        debug_assert_eq!(self.current, self.global);
        let id = self.add_entity(Entity {
            name: name.to_string(),
            parent: Some(self.global),
            access: AccessControl::Public,
            file: Some(index),
            range: SourceRange::default(),
            kind: EntityKind::FileScope { index, scope: ScopeData::default() },
        });
        self.attach_child(id);
        id
    }

    pub fn declare_native_library(
        &mut self,
        name: &str,
        range: SourceRange,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        self.declare_named(
            name,
            AccessControl::Public,
            range,
            EntityKind::NativeLibrary(ScopeData::default()),
            issues,
        )
    }

    pub fn declare_foreign_library(
        &mut self,
        name: &str,
        range: SourceRange,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        self.declare_named(name, AccessControl::Public, range, EntityKind::ForeignLibrary, issues)
    }

    pub fn declare_alias(
        &mut self,
        name: &str,
        target: EntityId,
        access: AccessControl,
        range: SourceRange,
        issues: &mut IssueHandler,
    ) -> Option<EntityId> {
        self.declare_named(name, access, range, EntityKind::Alias { target }, issues)
    }

    /// Insert a poison binding so later references to `name` neither re-emit
    /// errors nor silently succeed.
    pub fn declare_poison(&mut self, name: &str) -> EntityId {
        let id = self.add_entity(Entity {
            name: name.to_string(),
            parent: Some(self.current),
            access: AccessControl::Public,
            file: self.current_file,
            range: SourceRange::default(),
            kind: EntityKind::Poison,
        });
        self.entity_mut(self.current)
            .scope_data_mut()
            .expect("current entity is not a scope")
            .names
            .entry(name.to_string())
            .or_default()
            .push(id);
        id
    }

    /// A fresh unnamed temporary object of the given type.
    pub fn create_temporary(&mut self, ty: QualType) -> EntityId {
        self.temporary_count += 1;
        let name = format!("tmp.{}", self.temporary_count);
        let id = self.add_entity(Entity {
            name,
            parent: Some(self.current),
            access: AccessControl::Public,
            file: self.current_file,
            range: SourceRange::default(),
            kind: EntityKind::Temporary { ty },
        });
        self.attach_child(id);
        id
    }

    pub fn create_this_property(&mut self, function: EntityId, ty: QualType) -> EntityId {
        let id = self.add_entity(Entity {
            name: "this".to_string(),
            parent: Some(function),
            access: AccessControl::Public,
            file: self.current_file,
            range: SourceRange::default(),
            kind: EntityKind::ThisProperty { ty },
        });
        let scope = self
            .entity_mut(function)
            .scope_data_mut()
            .expect("function entity has a scope");
        scope.names.entry("this".to_string()).or_default().push(id);
        scope.children.push(id);
        id
    }

    // ------------------------------------------------------------------
    // Definition
    // ------------------------------------------------------------------

    pub fn define_variable(&mut self, id: EntityId, ty: QualType) {
        match &mut self.entity_mut(id).kind {
            EntityKind::Variable(data) => data.ty = Some(ty),
            EntityKind::Parameter { ty: slot, .. } => *slot = ty,
            _ => panic!("define_variable on non-variable entity"),
        }
    }

    /// Commit a signature to a declared function. Fails with `Redefinition`
    /// when an overload with the same parameter types already exists in the
    /// same scope.
    pub fn set_function_type(
        &mut self,
        id: EntityId,
        signature: Signature,
        issues: &mut IssueHandler,
    ) -> bool {
        let (name, parent, range) = {
            let e = self.entity(id);
            (e.name.clone(), e.parent, e.range)
        };
        if let Some(parent) = parent {
            let siblings = self
                .entity(parent)
                .scope_data()
                .and_then(|s| s.names.get(&name))
                .cloned()
                .unwrap_or_default();
            for other in siblings {
                if other == id {
                    continue;
                }
                let Some(f) = self.entity(other).as_function() else { continue };
                if let Some(sig) = &f.signature {
                    if sig.params == signature.params {
                        issues.error(
                            range,
                            IssueKind::BadStmt(BadStmt::Redefinition {
                                name,
                                previous: Some(self.entity(other).range),
                            }),
                        );
                        return false;
                    }
                }
            }
        }
        self.entity_mut(id)
            .as_function_mut()
            .expect("set_function_type on non-function")
            .signature = Some(signature);
        true
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Is `entity` visible from the current scope under the file-private
    /// rules?
    fn is_visible(&self, id: EntityId) -> bool {
        let entity = self.entity(id);
        entity.access != AccessControl::Private
            || entity.file.is_none()
            || entity.file == self.current_file
    }

    fn findings_to_lookup(&mut self, found: Vec<EntityId>) -> Lookup {
        match found.len() {
            0 => Lookup::None,
            1 => {
                let id = self.resolve(found[0]);
                if self.entity(id).as_function().is_some() {
                    let set = self.make_overload_set(vec![id]);
                    Lookup::Overloads(set)
                } else {
                    Lookup::Single(id)
                }
            }
            _ => {
                let resolved: Vec<_> = found.iter().map(|&id| self.resolve(id)).collect();
                if resolved.iter().all(|&id| self.entity(id).as_function().is_some()) {
                    let set = self.make_overload_set(resolved);
                    Lookup::Overloads(set)
                } else {
                    Lookup::Ambiguous(resolved)
                }
            }
        }
    }

    fn make_overload_set(&mut self, functions: Vec<EntityId>) -> EntityId {
        let name = self.entity(functions[0]).name.clone();
        self.add_entity(Entity {
            name,
            parent: Some(self.current),
            access: AccessControl::Public,
            file: self.current_file,
            range: SourceRange::default(),
            kind: EntityKind::OverloadSet { functions },
        })
    }

    /// Walk outward from the current scope; the first scope binding the name
    /// (visibly) wins.
    pub fn unqualified_lookup(&mut self, name: &str) -> Lookup {
        let mut scope = Some(self.current);
        while let Some(s) = scope {
            let found: Vec<_> = self
                .entity(s)
                .scope_data()
                .and_then(|data| data.names.get(name))
                .map(|ids| ids.iter().copied().filter(|&id| self.is_visible(id)).collect())
                .unwrap_or_default();
            if !found.is_empty() {
                return self.findings_to_lookup(found);
            }
            // Record scopes also expose names inherited from base classes.
            if self.entity(s).is_record_type() {
                let found = self.lookup_in_bases(s, name);
                if !matches!(found, Lookup::None) {
                    return found;
                }
            }
            scope = self.entity(s).parent;
        }
        Lookup::None
    }

    /// Does any scope on the lookup path bind `name`, visible or not? Used
    /// to distinguish access violations from undeclared names.
    pub fn name_exists_anywhere(&self, name: &str) -> bool {
        let mut scope = Some(self.current);
        while let Some(s) = scope {
            if self
                .entity(s)
                .scope_data()
                .is_some_and(|data| data.names.contains_key(name))
            {
                return true;
            }
            scope = self.entity(s).parent;
        }
        false
    }

    /// Search only `scope` (and, for record types, its base classes).
    pub fn qualified_lookup(&mut self, scope: EntityId, name: &str) -> Lookup {
        let scope = self.resolve(scope);
        let found: Vec<_> = self
            .entity(scope)
            .scope_data()
            .and_then(|data| data.names.get(name))
            .map(|ids| ids.iter().copied().filter(|&id| self.is_visible(id)).collect())
            .unwrap_or_default();
        if !found.is_empty() {
            return self.findings_to_lookup(found);
        }
        if self.entity(scope).is_record_type() {
            return self.lookup_in_bases(scope, name);
        }
        Lookup::None
    }

    /// Search the base classes of `record`; findings from more than one base
    /// are ambiguous unless all are functions.
    fn lookup_in_bases(&mut self, record: EntityId, name: &str) -> Lookup {
        let bases: Vec<_> = self
            .entity(record)
            .as_record()
            .map(|r| {
                r.elements
                    .iter()
                    .filter_map(|&e| match self.entity(e).kind {
                        EntityKind::BaseClassObject { ty: Some(base_ty), .. } => Some(base_ty),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut findings: Vec<EntityId> = Vec::new();
        let mut source_bases = 0;
        for base in bases {
            match self.qualified_lookup(base, name) {
                Lookup::None => {}
                Lookup::Single(id) => {
                    findings.push(id);
                    source_bases += 1;
                }
                Lookup::Overloads(set) => {
                    if let EntityKind::OverloadSet { functions } = &self.entity(set).kind {
                        findings.extend(functions.iter().copied());
                    }
                    source_bases += 1;
                }
                Lookup::Ambiguous(ids) => {
                    findings.extend(ids);
                    source_bases += 2;
                }
            }
        }
        match (findings.len(), source_bases) {
            (0, _) => Lookup::None,
            (_, 1) => self.findings_to_lookup(findings),
            _ => {
                if findings.iter().all(|&id| self.entity(id).as_function().is_some()) {
                    self.findings_to_lookup(findings)
                } else {
                    Lookup::Ambiguous(findings)
                }
            }
        }
    }

    /// Candidate functions behind an entity: the overload set members or the
    /// single function itself.
    pub fn overload_candidates(&self, id: EntityId) -> Vec<EntityId> {
        match &self.entity(id).kind {
            EntityKind::OverloadSet { functions } => functions.clone(),
            EntityKind::Function(_) => vec![id],
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Derived types (interned)
    // ------------------------------------------------------------------

    pub fn pointer_type(&mut self, base: QualType, qual: PointerQual) -> EntityId {
        if let Some(&id) = self.pointer_cache.get(&(base, qual)) {
            return id;
        }
        let name = format!(
            "*{}{}",
            match qual {
                PointerQual::Raw => "",
                PointerQual::Unique => "unique ",
            },
            self.qual_type_name(&base)
        );
        let id = self.add_entity(Entity {
            name,
            parent: Some(self.global),
            access: AccessControl::Public,
            file: None,
            range: SourceRange::default(),
            kind: EntityKind::PointerType { base, qual },
        });
        self.pointer_cache.insert((base, qual), id);
        id
    }

    pub fn reference_type(&mut self, base: QualType) -> EntityId {
        if let Some(&id) = self.reference_cache.get(&base) {
            return id;
        }
        let name = format!("&{}", self.qual_type_name(&base));
        let id = self.add_entity(Entity {
            name,
            parent: Some(self.global),
            access: AccessControl::Public,
            file: None,
            range: SourceRange::default(),
            kind: EntityKind::ReferenceType { base },
        });
        self.reference_cache.insert(base, id);
        id
    }

    pub fn array_type(&mut self, elem: EntityId, count: Option<u64>) -> EntityId {
        if let Some(&id) = self.array_cache.get(&(elem, count)) {
            return id;
        }
        let name = match count {
            Some(n) => format!("[{}, {}]", self.entity(elem).name, n),
            None => format!("[{}]", self.entity(elem).name),
        };
        let id = self.add_entity(Entity {
            name,
            parent: Some(self.global),
            access: AccessControl::Public,
            file: None,
            range: SourceRange::default(),
            kind: EntityKind::ArrayType { elem, count },
        });
        self.array_cache.insert((elem, count), id);
        id
    }

    // ------------------------------------------------------------------
    // Type queries
    // ------------------------------------------------------------------

    pub fn size_of(&self, ty: EntityId) -> u64 {
        let ty = self.resolve(ty);
        match &self.entity(ty).kind {
            EntityKind::VoidType => 0,
            EntityKind::ByteType | EntityKind::BoolType => 1,
            EntityKind::IntType(data) => u64::from(data.width) / 8,
            EntityKind::FloatType { width } => u64::from(*width) / 8,
            EntityKind::NullPtrType => 8,
            EntityKind::PointerType { base, .. } | EntityKind::ReferenceType { base } => {
                if self.is_dynamic_array(base.ty) {
                    16
                } else {
                    8
                }
            }
            EntityKind::ArrayType { elem, count } => match count {
                Some(n) => self.size_of(*elem) * n,
                None => 0,
            },
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => r.size.unwrap_or(0),
            _ => 0,
        }
    }

    pub fn align_of(&self, ty: EntityId) -> u64 {
        let ty = self.resolve(ty);
        match &self.entity(ty).kind {
            EntityKind::VoidType => 1,
            EntityKind::ByteType | EntityKind::BoolType => 1,
            EntityKind::IntType(data) => u64::from(data.width) / 8,
            EntityKind::FloatType { width } => u64::from(*width) / 8,
            EntityKind::NullPtrType | EntityKind::PointerType { .. }
            | EntityKind::ReferenceType { .. } => 8,
            EntityKind::ArrayType { elem, .. } => self.align_of(*elem),
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => r.align.unwrap_or(1),
            _ => 1,
        }
    }

    /// A type is complete when it can be the type of an object.
    pub fn is_complete(&self, ty: EntityId) -> bool {
        let ty = self.resolve(ty);
        match &self.entity(ty).kind {
            EntityKind::VoidType => false,
            EntityKind::ArrayType { count, .. } => count.is_some(),
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => r.size.is_some(),
            _ => self.entity(ty).is_type(),
        }
    }

    pub fn is_dynamic_array(&self, ty: EntityId) -> bool {
        matches!(
            self.entity(self.resolve(ty)).kind,
            EntityKind::ArrayType { count: None, .. }
        )
    }

    pub fn is_integral(&self, ty: EntityId) -> bool {
        matches!(self.entity(self.resolve(ty)).kind, EntityKind::IntType(_))
    }

    pub fn is_float(&self, ty: EntityId) -> bool {
        matches!(self.entity(self.resolve(ty)).kind, EntityKind::FloatType { .. })
    }

    pub fn is_pointer(&self, ty: EntityId) -> bool {
        matches!(self.entity(self.resolve(ty)).kind, EntityKind::PointerType { .. })
    }

    pub fn is_reference(&self, ty: EntityId) -> bool {
        matches!(self.entity(self.resolve(ty)).kind, EntityKind::ReferenceType { .. })
    }

    /// Strip one reference layer: `&T -> T` preserving the reference's
    /// qualifiers; non-references pass through.
    pub fn strip_reference(&self, ty: QualType) -> QualType {
        match self.entity(self.resolve(ty.ty)).kind {
            EntityKind::ReferenceType { base } => base,
            _ => ty,
        }
    }

    /// Lifetime metadata for any object type. Records carry their own;
    /// arrays derive from the element; everything else is trivial.
    pub fn lifetime(&self, ty: EntityId) -> LifetimeMetadata {
        let ty = self.resolve(ty);
        match &self.entity(ty).kind {
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => {
                r.lifetime.clone().unwrap_or_else(LifetimeMetadata::trivial)
            }
            EntityKind::ArrayType { elem, .. } => {
                let elem_meta = self.lifetime(*elem);
                if elem_meta.is_trivial() {
                    LifetimeMetadata::trivial()
                } else {
                    let mut meta = LifetimeMetadata::trivial();
                    for kind in SMFKind::ALL {
                        let op = match elem_meta.operation(kind) {
                            LifetimeOperation::Trivial => LifetimeOperation::Trivial,
                            LifetimeOperation::Deleted => LifetimeOperation::Deleted,
                            _ => LifetimeOperation::NontrivialInline,
                        };
                        meta.set_operation(kind, op);
                    }
                    meta
                }
            }
            EntityKind::PointerType { qual: PointerQual::Unique, .. } => {
                // Unique pointers own their pointee: no default (null) value,
                // no copies, moves transfer ownership, destruction
                // deallocates.
                LifetimeMetadata::new(
                    LifetimeOperation::Deleted,
                    LifetimeOperation::Deleted,
                    LifetimeOperation::NontrivialInline,
                    LifetimeOperation::NontrivialInline,
                )
            }
            _ => LifetimeMetadata::trivial(),
        }
    }

    pub fn has_trivial_lifetime(&self, ty: EntityId) -> bool {
        self.lifetime(ty).is_trivial()
    }

    /// Display name of a type, for diagnostics.
    pub fn type_name(&self, ty: EntityId) -> String {
        let ty = self.resolve(ty);
        let entity = self.entity(ty);
        match &entity.kind {
            EntityKind::PointerType { base, qual } => format!(
                "*{}{}",
                match qual {
                    PointerQual::Raw => "",
                    PointerQual::Unique => "unique ",
                },
                self.qual_type_name(base)
            ),
            EntityKind::ReferenceType { base } => format!("&{}", self.qual_type_name(base)),
            EntityKind::ArrayType { elem, count } => match count {
                Some(n) => format!("[{}, {}]", self.type_name(*elem), n),
                None => format!("[{}]", self.type_name(*elem)),
            },
            _ => entity.name.clone(),
        }
    }

    pub fn qual_type_name(&self, ty: &QualType) -> String {
        let mutability = if ty.is_mut() { "mut " } else { "" };
        format!("{}{}", mutability, self.type_name(ty.ty))
    }

    // ------------------------------------------------------------------
    // Builtin declarations
    // ------------------------------------------------------------------

    fn declare_builtin_type(&mut self, name: &str, kind: EntityKind) -> EntityId {
        let id = self.add_entity(Entity {
            name: name.to_string(),
            parent: Some(self.global),
            access: AccessControl::Public,
            file: None,
            range: SourceRange::default(),
            kind,
        });
        self.entity_mut(self.global)
            .scope_data_mut()
            .unwrap()
            .names
            .entry(name.to_string())
            .or_default()
            .push(id);
        id
    }

    fn declare_builtin_types(&mut self) {
        let void = self.declare_builtin_type("void", EntityKind::VoidType);
        let byte = self.declare_builtin_type("byte", EntityKind::ByteType);
        let bool_ = self.declare_builtin_type("bool", EntityKind::BoolType);
        let int = |width, signed| EntityKind::IntType(IntTypeData { width, signed });
        let s8 = self.declare_builtin_type("s8", int(8, true));
        let s16 = self.declare_builtin_type("s16", int(16, true));
        let s32 = self.declare_builtin_type("s32", int(32, true));
        let s64 = self.declare_builtin_type("s64", int(64, true));
        let u8 = self.declare_builtin_type("u8", int(8, false));
        let u16 = self.declare_builtin_type("u16", int(16, false));
        let u32 = self.declare_builtin_type("u32", int(32, false));
        let u64 = self.declare_builtin_type("u64", int(64, false));
        let f32 = self.declare_builtin_type("f32", EntityKind::FloatType { width: 32 });
        let f64 = self.declare_builtin_type("f64", EntityKind::FloatType { width: 64 });
        let nullptr = self.declare_builtin_type("__nullptr_t", EntityKind::NullPtrType);
        let str_ = self.array_type(byte, None);
        self.entity_mut(self.global)
            .scope_data_mut()
            .unwrap()
            .names
            .insert("str".to_string(), vec![str_]);
        // Spelling aliases.
        for (alias, target) in [("int", s64), ("double", f64), ("float", f32)] {
            let id = self.add_entity(Entity {
                name: alias.to_string(),
                parent: Some(self.global),
                access: AccessControl::Public,
                file: None,
                range: SourceRange::default(),
                kind: EntityKind::Alias { target },
            });
            self.entity_mut(self.global)
                .scope_data_mut()
                .unwrap()
                .names
                .insert(alias.to_string(), vec![id]);
        }
        self.builtins = BuiltinTypes {
            void,
            byte,
            bool_,
            s8,
            s16,
            s32,
            s64,
            u8,
            u16,
            u32,
            u64,
            f32,
            f64,
            nullptr,
            str_,
        };
    }

    fn declare_builtin_functions(&mut self) {
        let b = self.builtins;
        let f64_t = QualType::const_(b.f64);
        let u64_t = QualType::const_(b.u64);
        let s64_t = QualType::const_(b.s64);
        let void_t = QualType::const_(b.void);
        let byte_t = QualType::const_(b.byte);
        let bool_t = QualType::const_(b.bool_);
        let byte_ptr = QualType::const_(self.pointer_type(byte_t, PointerQual::Raw));
        let byte_ptr_mut =
            QualType::const_(self.pointer_type(QualType::mut_(b.byte), PointerQual::Raw));
        let str_ptr = QualType::const_(self.pointer_type(QualType::const_(b.str_), PointerQual::Raw));
        let buf_t =
            QualType::const_(self.pointer_type(QualType::mut_(b.str_), PointerQual::Raw));

        let unary_math = Signature { params: vec![f64_t], ret: f64_t };
        let binary_math = Signature { params: vec![f64_t, f64_t], ret: f64_t };
        let writer = |value: QualType| Signature { params: vec![buf_t, value], ret: buf_t };

        for builtin in Builtin::all() {
            let signature = match builtin {
                Builtin::Pow | Builtin::Hypot => binary_math.clone(),
                Builtin::Memcpy => Signature {
                    params: vec![byte_ptr_mut, byte_ptr, u64_t],
                    ret: void_t,
                },
                Builtin::Alloc => Signature { params: vec![u64_t, u64_t], ret: buf_t },
                Builtin::Dealloc => Signature { params: vec![byte_ptr_mut, u64_t], ret: void_t },
                Builtin::Putchar => Signature { params: vec![byte_t], ret: void_t },
                Builtin::Puti64 => Signature { params: vec![s64_t], ret: void_t },
                Builtin::Putf64 => Signature { params: vec![f64_t], ret: void_t },
                Builtin::Putstr => Signature { params: vec![str_ptr], ret: void_t },
                Builtin::FstringWritestr => writer(str_ptr),
                Builtin::FstringWriteptr => writer(byte_ptr),
                Builtin::FstringWrites64 => writer(s64_t),
                Builtin::FstringWriteu64 => writer(u64_t),
                Builtin::FstringWritef64 => writer(f64_t),
                Builtin::FstringWritechar => writer(byte_t),
                Builtin::FstringWritebool => writer(bool_t),
                Builtin::Trap => Signature { params: vec![], ret: void_t },
                _ => unary_math.clone(),
            };
            let id = self.add_entity(Entity {
                name: builtin.name().to_string(),
                parent: Some(self.global),
                access: AccessControl::Public,
                file: None,
                range: SourceRange::default(),
                kind: EntityKind::Function(FunctionData {
                    signature: Some(signature),
                    kind: FunctionKind::Foreign {
                        slot: scatha_core::BUILTIN_SLOT,
                        index: builtin.into(),
                    },
                    builtin: Some(builtin),
                    ..FunctionData::default()
                }),
            });
            self.entity_mut(self.global)
                .scope_data_mut()
                .unwrap()
                .names
                .entry(builtin.name().to_string())
                .or_default()
                .push(id);
            self.builtin_functions.insert(builtin, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (SymbolTable, IssueHandler) {
        (SymbolTable::new(), IssueHandler::new())
    }

    #[test]
    fn test_builtin_types_are_predeclared() {
        let (mut sym, _) = fresh();
        for name in ["void", "bool", "byte", "s64", "u8", "f32", "f64", "str", "int"] {
            assert!(
                !matches!(sym.unqualified_lookup(name), Lookup::None),
                "{name} should be predeclared"
            );
        }
        let b = *sym.builtins();
        assert_eq!(sym.size_of(b.s64), 8);
        assert_eq!(sym.size_of(b.byte), 1);
        assert_eq!(sym.align_of(b.f32), 4);
    }

    #[test]
    fn test_int_alias_resolves_to_s64() {
        let (mut sym, _) = fresh();
        let Lookup::Single(id) = sym.unqualified_lookup("int") else {
            panic!("expected single entity");
        };
        assert_eq!(id, sym.builtins().s64);
    }

    #[test]
    fn test_redefinition_is_rejected() {
        let (mut sym, mut issues) = fresh();
        let range = SourceRange::default();
        assert!(sym
            .declare_record_type("X", false, AccessControl::Public, range, &mut issues)
            .is_some());
        assert!(sym
            .declare_record_type("X", false, AccessControl::Public, range, &mut issues)
            .is_none());
        assert!(issues.has_errors());
        // The failed name is poisoned, not lost.
        let found = sym.unqualified_lookup("X");
        assert!(!matches!(found, Lookup::None));
    }

    #[test]
    fn test_function_names_stack_into_overload_sets() {
        let (mut sym, mut issues) = fresh();
        let range = SourceRange::default();
        let f1 = sym
            .declare_func_name("f", AccessControl::Public, range, FunctionData::default(), &mut issues)
            .unwrap();
        let f2 = sym
            .declare_func_name("f", AccessControl::Public, range, FunctionData::default(), &mut issues)
            .unwrap();
        assert!(!issues.has_errors());
        let Lookup::Overloads(set) = sym.unqualified_lookup("f") else {
            panic!("expected overload set");
        };
        assert_eq!(sym.overload_candidates(set), vec![f1, f2]);
    }

    #[test]
    fn test_same_signature_overload_is_redefinition() {
        let (mut sym, mut issues) = fresh();
        let range = SourceRange::default();
        let s64 = sym.builtins().s64;
        let sig = Signature {
            params: vec![QualType::const_(s64)],
            ret: QualType::const_(sym.builtins().void),
        };
        let f1 = sym
            .declare_func_name("f", AccessControl::Public, range, FunctionData::default(), &mut issues)
            .unwrap();
        let f2 = sym
            .declare_func_name("f", AccessControl::Public, range, FunctionData::default(), &mut issues)
            .unwrap();
        assert!(sym.set_function_type(f1, sig.clone(), &mut issues));
        assert!(!sym.set_function_type(f2, sig, &mut issues));
        assert!(issues.has_errors());
    }

    #[test]
    fn test_file_private_entities_coexist() {
        let (mut sym, mut issues) = fresh();
        let range = SourceRange::default();
        sym.set_current_file(Some(0));
        let a = sym
            .declare_variable("x", Mutability::Const, true, AccessControl::Private, range, &mut issues)
            .unwrap();
        sym.set_current_file(Some(1));
        let b = sym
            .declare_variable("x", Mutability::Const, true, AccessControl::Private, range, &mut issues)
            .unwrap();
        assert!(!issues.has_errors());
        assert_ne!(a, b);
        // Lookup from file 1 sees only file 1's binding.
        let Lookup::Single(found) = sym.unqualified_lookup("x") else {
            panic!("expected single entity");
        };
        assert_eq!(found, b);
    }

    #[test]
    fn test_with_scope_current_restores() {
        let (mut sym, _) = fresh();
        let scope = sym.add_anonymous_scope();
        let before = sym.current_scope();
        let inside = sym.with_scope_current(scope, |sym| sym.current_scope());
        assert_eq!(inside, scope);
        assert_eq!(sym.current_scope(), before);
    }

    #[test]
    fn test_unqualified_lookup_walks_outward() {
        let (mut sym, mut issues) = fresh();
        let range = SourceRange::default();
        sym.declare_variable("x", Mutability::Const, false, AccessControl::Public, range, &mut issues)
            .unwrap();
        let inner = sym.add_anonymous_scope();
        sym.push_scope(inner);
        assert!(matches!(sym.unqualified_lookup("x"), Lookup::Single(_)));
        sym.pop_scope();
    }

    #[test]
    fn test_derived_types_are_interned() {
        let (mut sym, _) = fresh();
        let s64 = sym.builtins().s64;
        let a = sym.pointer_type(QualType::const_(s64), PointerQual::Raw);
        let b = sym.pointer_type(QualType::const_(s64), PointerQual::Raw);
        assert_eq!(a, b);
        let c = sym.pointer_type(QualType::mut_(s64), PointerQual::Raw);
        assert_ne!(a, c);
        let arr = sym.array_type(s64, Some(4));
        assert_eq!(sym.size_of(arr), 32);
        assert_eq!(sym.align_of(arr), 8);
    }

    #[test]
    fn test_fat_pointer_size() {
        let (mut sym, _) = fresh();
        let str_ = sym.builtins().str_;
        let ptr = sym.pointer_type(QualType::const_(str_), PointerQual::Raw);
        assert_eq!(sym.size_of(ptr), 16);
        let s64 = sym.builtins().s64;
        let thin = sym.pointer_type(QualType::const_(s64), PointerQual::Raw);
        assert_eq!(sym.size_of(thin), 8);
    }

    #[test]
    fn test_unique_pointer_lifetime() {
        let (mut sym, _) = fresh();
        let s64 = sym.builtins().s64;
        let unique = sym.pointer_type(QualType::mut_(s64), PointerQual::Unique);
        let meta = sym.lifetime(unique);
        assert!(meta.operation(SMFKind::CopyConstructor).is_deleted());
        assert!(!meta.operation(SMFKind::Destructor).is_trivial());
        assert!(!sym.has_trivial_lifetime(unique));
    }

    #[test]
    fn test_builtin_functions_are_declared() {
        let (mut sym, _) = fresh();
        let id = sym.builtin_function(Builtin::Sqrt);
        let f = sym.entity(id).as_function().unwrap();
        assert_eq!(
            f.kind,
            FunctionKind::Foreign { slot: 0, index: Builtin::Sqrt.into() }
        );
        assert!(matches!(sym.unqualified_lookup("__builtin_sqrt"), Lookup::Overloads(_)));
    }
}
