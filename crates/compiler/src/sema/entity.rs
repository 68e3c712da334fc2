//! The semantic universe: every named thing the analyzer knows about.
//!
//! All entities live in the [`SymbolTable`](super::symbol_table::SymbolTable)
//! arena and refer to each other through [`EntityId`] handles, so the cyclic
//! scope/member/type graph needs no owning back-pointers.

use std::collections::HashMap;

use crate::ast::PointerQual;
use crate::source::SourceRange;

/// Handle into the symbol table's entity arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    pub fn from_raw(raw: u32) -> Self {
        EntityId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mutability {
    #[default]
    Const,
    Mut,
}

impl Mutability {
    /// The weaker of two mutabilities; used when qualifying member access
    /// through an object.
    pub fn join(self, other: Mutability) -> Mutability {
        if self == Mutability::Mut && other == Mutability::Mut {
            Mutability::Mut
        } else {
            Mutability::Const
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueCategory {
    LValue,
    RValue,
}

impl ValueCategory {
    /// LValue & LValue = LValue, anything else RValue.
    pub fn common(self, other: ValueCategory) -> ValueCategory {
        if self == ValueCategory::LValue && other == ValueCategory::LValue {
            ValueCategory::LValue
        } else {
            ValueCategory::RValue
        }
    }
}

/// How a pointer or reference binds its pointee with respect to dynamic type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindMode {
    #[default]
    Static,
    Dynamic,
}

/// (object type, mutability, bind mode). Equality is structural on all three;
/// object types are interned so handle equality suffices for the type part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QualType {
    pub ty: EntityId,
    pub mutability: Mutability,
    pub bind: BindMode,
}

impl QualType {
    pub fn const_(ty: EntityId) -> Self {
        QualType { ty, mutability: Mutability::Const, bind: BindMode::Static }
    }

    pub fn mut_(ty: EntityId) -> Self {
        QualType { ty, mutability: Mutability::Mut, bind: BindMode::Static }
    }

    pub fn with_mutability(self, mutability: Mutability) -> Self {
        QualType { mutability, ..self }
    }

    pub fn is_mut(&self) -> bool {
        self.mutability == Mutability::Mut
    }
}

/// Compile-time constant attached to expressions and `let` variables.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessControl {
    #[default]
    Public,
    Private,
}

/// The four special member functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SMFKind {
    DefaultConstructor,
    CopyConstructor,
    MoveConstructor,
    Destructor,
}

impl SMFKind {
    pub const ALL: [SMFKind; 4] = [
        SMFKind::DefaultConstructor,
        SMFKind::CopyConstructor,
        SMFKind::MoveConstructor,
        SMFKind::Destructor,
    ];

    fn index(self) -> usize {
        match self {
            SMFKind::DefaultConstructor => 0,
            SMFKind::CopyConstructor => 1,
            SMFKind::MoveConstructor => 2,
            SMFKind::Destructor => 3,
        }
    }
}

/// How one special member function is performed for a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeOperation {
    /// Bitwise; no code needs to run.
    Trivial,
    /// The operation does not exist for this type.
    Deleted,
    /// Synthesized element- or member-wise by the compiler (arrays,
    /// aggregates of non-trivial members).
    NontrivialInline,
    UserDefined(EntityId),
}

impl LifetimeOperation {
    pub fn is_trivial(&self) -> bool {
        matches!(self, LifetimeOperation::Trivial)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, LifetimeOperation::Deleted)
    }
}

/// Lifetime metadata of a record or array type, synthesized during
/// instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifetimeMetadata {
    ops: [LifetimeOperation; 4],
}

impl LifetimeMetadata {
    pub fn trivial() -> Self {
        LifetimeMetadata { ops: [LifetimeOperation::Trivial; 4] }
    }

    pub fn new(
        default_ctor: LifetimeOperation,
        copy_ctor: LifetimeOperation,
        move_ctor: LifetimeOperation,
        dtor: LifetimeOperation,
    ) -> Self {
        LifetimeMetadata { ops: [default_ctor, copy_ctor, move_ctor, dtor] }
    }

    pub fn operation(&self, kind: SMFKind) -> LifetimeOperation {
        self.ops[kind.index()]
    }

    pub fn set_operation(&mut self, kind: SMFKind, op: LifetimeOperation) {
        self.ops[kind.index()] = op;
    }

    /// A type has trivial lifetime iff all four operations are trivial.
    pub fn is_trivial(&self) -> bool {
        self.ops.iter().all(LifetimeOperation::is_trivial)
    }
}

/// Name bindings and child entities owned by a scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeData {
    /// Multiple entries under one name are only ever functions (overload
    /// sets) or file-private entities from different files.
    pub names: HashMap<String, Vec<EntityId>>,
    pub children: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntTypeData {
    /// Width in bits: 8, 16, 32 or 64.
    pub width: u32,
    pub signed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordData {
    pub scope: ScopeData,
    /// Base class objects followed by non-static data members, in
    /// declaration order; the layout algorithm walks this list.
    pub elements: Vec<EntityId>,
    pub size: Option<u64>,
    pub align: Option<u64>,
    pub lifetime: Option<LifetimeMetadata>,
    /// Member functions that may be dispatched dynamically; protocols always
    /// have one.
    pub vtable: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<QualType>,
    pub ret: QualType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Defined in source.
    Native,
    /// `extern "C"`; dispatched through the foreign function table.
    Foreign { slot: u8, index: u16 },
    /// Synthesized by the compiler (lifetime operations).
    Generated,
}

#[derive(Debug, Clone)]
pub struct FunctionData {
    pub scope: ScopeData,
    pub signature: Option<Signature>,
    pub kind: FunctionKind,
    pub is_member: bool,
    /// Which special member function this is, if its name is `new`, `move`
    /// or `delete`.
    pub smf: Option<SMFKind>,
    /// The builtin this function binds when it is one of the intrinsics.
    pub builtin: Option<scatha_core::Builtin>,
}

impl Default for FunctionData {
    fn default() -> Self {
        FunctionData {
            scope: ScopeData::default(),
            signature: None,
            kind: FunctionKind::Native,
            is_member: false,
            smf: None,
            builtin: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VariableData {
    pub ty: Option<QualType>,
    pub mutability: Mutability,
    pub is_static: bool,
    /// Byte offset inside the parent record, for data members.
    pub offset: Option<u64>,
    /// Index among the parent record's elements, for data members.
    pub index: Option<usize>,
    pub constant: Option<ConstValue>,
}

#[derive(Debug, Clone)]
pub enum EntityKind {
    // Scopes
    GlobalScope(ScopeData),
    FileScope { index: u32, scope: ScopeData },
    Namespace(ScopeData),
    AnonymousScope(ScopeData),

    // Types
    VoidType,
    ByteType,
    BoolType,
    IntType(IntTypeData),
    FloatType { width: u32 },
    NullPtrType,
    PointerType { base: QualType, qual: PointerQual },
    ReferenceType { base: QualType },
    ArrayType { elem: EntityId, count: Option<u64> },
    StructType(RecordData),
    ProtocolType(RecordData),

    // Objects
    Variable(VariableData),
    Parameter { ty: QualType, index: usize },
    BaseClassObject { ty: Option<EntityId>, offset: Option<u64>, index: Option<usize> },
    Temporary { ty: QualType },
    /// The implicit `this` property of a member function.
    ThisProperty { ty: QualType },

    // Functions
    Function(FunctionData),
    /// Candidates sharing one name in one scope.
    OverloadSet { functions: Vec<EntityId> },

    // Libraries
    NativeLibrary(ScopeData),
    ForeignLibrary,

    Alias { target: EntityId },

    /// Sentinel for names whose declaration failed; suppresses cascading
    /// diagnostics.
    Poison,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub parent: Option<EntityId>,
    pub access: AccessControl,
    /// File the entity was declared in; governs file-scoped privacy.
    pub file: Option<u32>,
    pub range: SourceRange,
    pub kind: EntityKind,
}

impl Entity {
    pub fn scope_data(&self) -> Option<&ScopeData> {
        match &self.kind {
            EntityKind::GlobalScope(s)
            | EntityKind::FileScope { scope: s, .. }
            | EntityKind::Namespace(s)
            | EntityKind::AnonymousScope(s)
            | EntityKind::NativeLibrary(s) => Some(s),
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => Some(&r.scope),
            EntityKind::Function(f) => Some(&f.scope),
            _ => None,
        }
    }

    pub fn scope_data_mut(&mut self) -> Option<&mut ScopeData> {
        match &mut self.kind {
            EntityKind::GlobalScope(s)
            | EntityKind::FileScope { scope: s, .. }
            | EntityKind::Namespace(s)
            | EntityKind::AnonymousScope(s)
            | EntityKind::NativeLibrary(s) => Some(s),
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => Some(&mut r.scope),
            EntityKind::Function(f) => Some(&mut f.scope),
            _ => None,
        }
    }

    pub fn is_scope(&self) -> bool {
        self.scope_data().is_some()
    }

    pub fn is_type(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::VoidType
                | EntityKind::ByteType
                | EntityKind::BoolType
                | EntityKind::IntType(_)
                | EntityKind::FloatType { .. }
                | EntityKind::NullPtrType
                | EntityKind::PointerType { .. }
                | EntityKind::ReferenceType { .. }
                | EntityKind::ArrayType { .. }
                | EntityKind::StructType(_)
                | EntityKind::ProtocolType(_)
        )
    }

    pub fn is_record_type(&self) -> bool {
        matches!(self.kind, EntityKind::StructType(_) | EntityKind::ProtocolType(_))
    }

    pub fn is_value(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Variable(_)
                | EntityKind::Parameter { .. }
                | EntityKind::BaseClassObject { .. }
                | EntityKind::Temporary { .. }
                | EntityKind::ThisProperty { .. }
        )
    }

    pub fn is_poison(&self) -> bool {
        matches!(self.kind, EntityKind::Poison)
    }

    pub fn as_function(&self) -> Option<&FunctionData> {
        match &self.kind {
            EntityKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut FunctionData> {
        match &mut self.kind {
            EntityKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordData> {
        match &self.kind {
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut RecordData> {
        match &mut self.kind {
            EntityKind::StructType(r) | EntityKind::ProtocolType(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableData> {
        match &self.kind {
            EntityKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variable_mut(&mut self) -> Option<&mut VariableData> {
        match &mut self.kind {
            EntityKind::Variable(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutability_join() {
        assert_eq!(Mutability::Mut.join(Mutability::Mut), Mutability::Mut);
        assert_eq!(Mutability::Mut.join(Mutability::Const), Mutability::Const);
        assert_eq!(Mutability::Const.join(Mutability::Mut), Mutability::Const);
    }

    #[test]
    fn test_value_category_common() {
        use ValueCategory::*;
        assert_eq!(LValue.common(LValue), LValue);
        assert_eq!(LValue.common(RValue), RValue);
        assert_eq!(RValue.common(RValue), RValue);
    }

    #[test]
    fn test_lifetime_metadata_triviality() {
        let mut meta = LifetimeMetadata::trivial();
        assert!(meta.is_trivial());
        meta.set_operation(SMFKind::MoveConstructor, LifetimeOperation::Deleted);
        assert!(!meta.is_trivial());
        assert!(meta.operation(SMFKind::MoveConstructor).is_deleted());
        assert!(meta.operation(SMFKind::Destructor).is_trivial());
    }
}
