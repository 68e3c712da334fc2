//! Conversion engine: value category, mutability and object type
//! conversions, the common type computation and conversion ranking.

use crate::ast::{Expr, ExprKind, PointerQual};
use crate::issue::{BadExpr, IssueHandler, IssueKind};
use crate::sema::entity::*;
use crate::sema::symbol_table::SymbolTable;
use crate::source::SourceRange;

/// Which conversions are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    /// Widenings and safe casts only.
    Implicit,
    /// Additionally narrowings and float/int conversions.
    Explicit,
    /// Additionally pointer re-typings, subject to trivial-lifetime and size
    /// constraints.
    Reinterpret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCatConv {
    LValueToRValue,
    MaterializeTemporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutConv {
    MutToConst,
}

/// The closed set of object type conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTypeConv {
    UniqueToRawPtr,
    NullptrToRawPtr,
    NullptrToUniquePtr,
    ArrayPtrFixedToDynamic,
    ReinterpretValuePtr,
    ReinterpretValuePtrToByteArray,
    ReinterpretDynArrayPtrToByte,
    ReinterpretDynArrayPtrFromByte,
    IntTrunc { width: u32 },
    SignedWiden { width: u32 },
    UnsignedWiden { width: u32 },
    FloatTrunc32,
    FloatWiden64,
    SignedToUnsigned,
    UnsignedToSigned,
    SignedToFloat { width: u32 },
    UnsignedToFloat { width: u32 },
    FloatToSigned { width: u32 },
    FloatToUnsigned { width: u32 },
    IntToByte,
    ByteToSigned,
    ByteToUnsigned,
}

impl ObjectTypeConv {
    /// The weakest conversion kind that permits this step.
    fn required_kind(self) -> ConvKind {
        use ObjectTypeConv::*;
        match self {
            UniqueToRawPtr | NullptrToRawPtr | NullptrToUniquePtr | ArrayPtrFixedToDynamic
            | SignedWiden { .. } | UnsignedWiden { .. } | FloatWiden64
            | SignedToFloat { width: 64 } | UnsignedToFloat { width: 64 } => ConvKind::Implicit,
            IntTrunc { .. } | FloatTrunc32 | SignedToUnsigned | UnsignedToSigned
            | SignedToFloat { .. } | UnsignedToFloat { .. } | FloatToSigned { .. }
            | FloatToUnsigned { .. } | IntToByte | ByteToSigned | ByteToUnsigned => {
                ConvKind::Explicit
            }
            ReinterpretValuePtr | ReinterpretValuePtrToByteArray | ReinterpretDynArrayPtrToByte
            | ReinterpretDynArrayPtrFromByte => ConvKind::Reinterpret,
        }
    }

    /// Contribution to overload ranking: widenings are preferred over
    /// narrowings.
    fn rank(self) -> u32 {
        use ObjectTypeConv::*;
        match self {
            UniqueToRawPtr | NullptrToRawPtr | NullptrToUniquePtr | ArrayPtrFixedToDynamic => 1,
            SignedWiden { .. } | UnsignedWiden { .. } | FloatWiden64
            | SignedToFloat { .. } | UnsignedToFloat { .. } => 2,
            _ => 3,
        }
    }
}

/// A computed conversion: at most one value category step, at most one
/// mutability step, and a chain of object type steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub value_cat: Option<ValueCatConv>,
    pub mutability: Option<MutConv>,
    pub object: Vec<ObjectTypeConv>,
    /// Resulting type and category, used to decorate the conversion node.
    pub target: QualType,
    pub target_cat: ValueCategory,
}

impl Conversion {
    fn identity(target: QualType, target_cat: ValueCategory) -> Self {
        Conversion { value_cat: None, mutability: None, object: Vec::new(), target, target_cat }
    }

    pub fn is_identity(&self) -> bool {
        self.value_cat.is_none() && self.mutability.is_none() && self.object.is_empty()
    }

    /// Identity = 0, qualifier-only > 0, widening > qualifier, narrowing >
    /// widening.
    pub fn rank(&self) -> u32 {
        let qual = u32::from(self.value_cat.is_some() || self.mutability.is_some());
        qual + self.object.iter().map(|c| c.rank()).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    BadTypeConv,
    BadValueCatConv,
    BadMutConv,
}

/// Compute the chain converting `(from, from_cat)` to `(to, to_cat)`, or
/// explain why none exists.
pub fn compute_conversion(
    sym: &SymbolTable,
    kind: ConvKind,
    from: QualType,
    from_cat: ValueCategory,
    to: QualType,
    to_cat: ValueCategory,
) -> Result<Conversion, ConvError> {
    let mut conv = Conversion::identity(to, to_cat);

    // Value category.
    match (from_cat, to_cat) {
        (ValueCategory::LValue, ValueCategory::RValue) => {
            conv.value_cat = Some(ValueCatConv::LValueToRValue);
        }
        (ValueCategory::RValue, ValueCategory::LValue) => {
            // Temporaries may only materialize into immutable bindings.
            if to.is_mut() {
                return Err(ConvError::BadValueCatConv);
            }
            conv.value_cat = Some(ValueCatConv::MaterializeTemporary);
        }
        _ => {}
    }

    // Mutability. Only meaningful when the result is addressable.
    if to_cat == ValueCategory::LValue {
        match (from.mutability, to.mutability) {
            (Mutability::Const, Mutability::Mut) => return Err(ConvError::BadMutConv),
            (Mutability::Mut, Mutability::Const) => conv.mutability = Some(MutConv::MutToConst),
            _ => {}
        }
    }

    // Object type.
    conv.object = object_conversion(sym, sym.resolve(from.ty), sym.resolve(to.ty))
        .ok_or(ConvError::BadTypeConv)?;
    if to_cat == ValueCategory::LValue && !conv.object.is_empty() {
        // An object conversion produces a new value, never an alias.
        return Err(ConvError::BadValueCatConv);
    }
    let allowed = |step: &ObjectTypeConv| match (step.required_kind(), kind) {
        (ConvKind::Implicit, _) => true,
        (ConvKind::Explicit, ConvKind::Explicit | ConvKind::Reinterpret) => true,
        (ConvKind::Reinterpret, ConvKind::Reinterpret) => true,
        _ => false,
    };
    if !conv.object.iter().all(allowed) {
        return Err(ConvError::BadTypeConv);
    }
    Ok(conv)
}

fn int_info(sym: &SymbolTable, ty: EntityId) -> Option<IntTypeData> {
    match sym.entity(sym.resolve(ty)).kind {
        EntityKind::IntType(data) => Some(data),
        _ => None,
    }
}

fn float_width(sym: &SymbolTable, ty: EntityId) -> Option<u32> {
    match sym.entity(sym.resolve(ty)).kind {
        EntityKind::FloatType { width } => Some(width),
        _ => None,
    }
}

/// The object conversion chain between two resolved object types, ignoring
/// kind restrictions; `None` when no chain exists at all.
fn object_conversion(
    sym: &SymbolTable,
    from: EntityId,
    to: EntityId,
) -> Option<Vec<ObjectTypeConv>> {
    use ObjectTypeConv::*;
    if from == to {
        return Some(vec![]);
    }
    let from_kind = &sym.entity(from).kind;
    let to_kind = &sym.entity(to).kind;

    // Integers.
    if let (Some(a), Some(b)) = (int_info(sym, from), int_info(sym, to)) {
        let mut chain = Vec::new();
        match (a.signed, b.signed) {
            (true, true) | (false, false) => {
                if b.width > a.width {
                    chain.push(if a.signed {
                        SignedWiden { width: b.width }
                    } else {
                        UnsignedWiden { width: b.width }
                    });
                } else {
                    chain.push(IntTrunc { width: b.width });
                }
            }
            (false, true) => {
                // Value preserving when widening; reinterpreting otherwise.
                if b.width > a.width {
                    chain.push(UnsignedWiden { width: b.width });
                } else if b.width < a.width {
                    chain.push(IntTrunc { width: b.width });
                }
                chain.push(UnsignedToSigned);
            }
            (true, false) => {
                if b.width > a.width {
                    chain.push(SignedWiden { width: b.width });
                } else if b.width < a.width {
                    chain.push(IntTrunc { width: b.width });
                }
                chain.push(SignedToUnsigned);
            }
        }
        return Some(chain);
    }

    // Floats.
    if let (Some(a), Some(b)) = (float_width(sym, from), float_width(sym, to)) {
        return Some(vec![if b > a { FloatWiden64 } else { FloatTrunc32 }]);
    }

    // Int <-> float.
    if let (Some(a), Some(b)) = (int_info(sym, from), float_width(sym, to)) {
        return Some(vec![if a.signed {
            SignedToFloat { width: b }
        } else {
            UnsignedToFloat { width: b }
        }]);
    }
    if let (Some(_), Some(b)) = (float_width(sym, from), int_info(sym, to)) {
        return Some(vec![if b.signed {
            FloatToSigned { width: b.width }
        } else {
            FloatToUnsigned { width: b.width }
        }]);
    }

    // Byte <-> int.
    if matches!(from_kind, EntityKind::ByteType) {
        if let Some(b) = int_info(sym, to) {
            let mut chain = vec![if b.signed { ByteToSigned } else { ByteToUnsigned }];
            if b.width > 8 {
                chain.push(if b.signed {
                    SignedWiden { width: b.width }
                } else {
                    UnsignedWiden { width: b.width }
                });
            }
            return Some(chain);
        }
    }
    if matches!(to_kind, EntityKind::ByteType) && int_info(sym, from).is_some() {
        return Some(vec![IntToByte]);
    }

    // Null pointer literal to any pointer.
    if matches!(from_kind, EntityKind::NullPtrType) {
        if let EntityKind::PointerType { qual, .. } = to_kind {
            return Some(vec![match qual {
                PointerQual::Raw => NullptrToRawPtr,
                PointerQual::Unique => NullptrToUniquePtr,
            }]);
        }
    }

    // Pointers.
    if let (
        EntityKind::PointerType { base: from_base, qual: from_qual },
        EntityKind::PointerType { base: to_base, qual: to_qual },
    ) = (from_kind, to_kind)
    {
        let mut chain = Vec::new();
        match (from_qual, to_qual) {
            (PointerQual::Unique, PointerQual::Raw) => chain.push(UniqueToRawPtr),
            (PointerQual::Raw, PointerQual::Unique) => return None,
            _ => {}
        }
        // Pointee mutability may only weaken.
        if from_base.mutability == Mutability::Const && to_base.is_mut() {
            return None;
        }
        let from_pointee = sym.resolve(from_base.ty);
        let to_pointee = sym.resolve(to_base.ty);
        if from_pointee == to_pointee {
            return Some(chain);
        }
        // *[T, N] -> *[T]
        if let (
            EntityKind::ArrayType { elem: e1, count: Some(_) },
            EntityKind::ArrayType { elem: e2, count: None },
        ) = (&sym.entity(from_pointee).kind, &sym.entity(to_pointee).kind)
        {
            if sym.resolve(*e1) == sym.resolve(*e2) {
                chain.push(ArrayPtrFixedToDynamic);
                return Some(chain);
            }
        }
        // Reinterpretations, subject to trivial lifetime on both sides.
        if !sym.has_trivial_lifetime(from_pointee) || !sym.has_trivial_lifetime(to_pointee) {
            return None;
        }
        let dyn_from = sym.is_dynamic_array(from_pointee);
        let dyn_to = sym.is_dynamic_array(to_pointee);
        match (dyn_from, dyn_to) {
            (false, false) => {
                if let EntityKind::ArrayType { elem, count: Some(n) } =
                    sym.entity(to_pointee).kind
                {
                    let elem = sym.resolve(elem);
                    if matches!(sym.entity(elem).kind, EntityKind::ByteType)
                        && n == sym.size_of(from_pointee)
                    {
                        chain.push(ReinterpretValuePtrToByteArray);
                        return Some(chain);
                    }
                }
                if sym.size_of(from_pointee) == sym.size_of(to_pointee) {
                    chain.push(ReinterpretValuePtr);
                    return Some(chain);
                }
                None
            }
            (true, true) => {
                let to_byte = matches!(
                    array_elem_kind(sym, to_pointee),
                    Some(EntityKind::ByteType)
                );
                let from_byte = matches!(
                    array_elem_kind(sym, from_pointee),
                    Some(EntityKind::ByteType)
                );
                if to_byte {
                    chain.push(ReinterpretDynArrayPtrToByte);
                    Some(chain)
                } else if from_byte {
                    chain.push(ReinterpretDynArrayPtrFromByte);
                    Some(chain)
                } else {
                    None
                }
            }
            _ => None,
        }
    } else {
        None
    }
}

fn array_elem_kind<'a>(sym: &'a SymbolTable, array: EntityId) -> Option<&'a EntityKind> {
    match sym.entity(sym.resolve(array)).kind {
        EntityKind::ArrayType { elem, .. } => Some(&sym.entity(sym.resolve(elem)).kind),
        _ => None,
    }
}

/// Fold a constant through an object conversion chain.
fn fold_constant(constant: &ConstValue, chain: &[ObjectTypeConv]) -> Option<ConstValue> {
    use ObjectTypeConv::*;
    let mut value = constant.clone();
    for step in chain {
        value = match (step, &value) {
            (SignedToFloat { .. } | UnsignedToFloat { .. }, ConstValue::Int(i)) => {
                ConstValue::Float(*i as f64)
            }
            (FloatToSigned { .. } | FloatToUnsigned { .. }, ConstValue::Float(f)) => {
                ConstValue::Int(*f as i64)
            }
            (IntTrunc { width }, ConstValue::Int(i)) => {
                let mask = if *width == 64 { u64::MAX } else { (1u64 << width) - 1 };
                ConstValue::Int((*i as u64 & mask) as i64)
            }
            (
                SignedWiden { .. } | UnsignedWiden { .. } | SignedToUnsigned | UnsignedToSigned,
                ConstValue::Int(_),
            ) => value,
            (FloatWiden64 | FloatTrunc32, ConstValue::Float(_)) => value,
            _ => return None,
        };
    }
    Some(value)
}

/// Convert `expr` to `(to, to_cat)`, wrapping it in a conversion node and
/// re-decorating on success; emits the appropriate issue on failure.
pub fn convert(
    sym: &mut SymbolTable,
    issues: &mut IssueHandler,
    kind: ConvKind,
    expr: Expr,
    to: QualType,
    to_cat: ValueCategory,
) -> Option<Expr> {
    // Poisoned subexpressions convert silently to anything.
    if let Some(entity) = expr.entity() {
        if sym.entity(entity).is_poison() {
            return Some(expr);
        }
    }
    let from = expr.ty();
    let from_cat = expr.value_cat();
    match compute_conversion(sym, kind, from, from_cat, to, to_cat) {
        Ok(conv) => Some(apply_conversion(sym, conv, expr)),
        Err(err) => {
            report_conv_error(sym, issues, err, &expr, to, to_cat, expr.range);
            None
        }
    }
}

/// Wrap `expr` per an already computed conversion.
pub fn apply_conversion(sym: &mut SymbolTable, conv: Conversion, expr: Expr) -> Expr {
    if conv.is_identity() && expr.ty() == conv.target {
        return expr;
    }
    let range = expr.range;
    let constant = expr
        .constant()
        .and_then(|c| fold_constant(c, &conv.object));
    let target = conv.target;
    let target_cat = conv.target_cat;
    let materializes = conv.value_cat == Some(ValueCatConv::MaterializeTemporary);
    let mut node = Expr::new(
        ExprKind::Conversion { conv, operand: Box::new(expr) },
        range,
    );
    node.deco.ty = Some(target);
    node.deco.value_cat = Some(target_cat);
    node.deco.constant = constant;
    if materializes {
        node.deco.entity = Some(sym.create_temporary(target));
    }
    node
}

pub fn report_conv_error(
    sym: &SymbolTable,
    issues: &mut IssueHandler,
    err: ConvError,
    expr: &Expr,
    to: QualType,
    to_cat: ValueCategory,
    range: SourceRange,
) {
    let kind = match err {
        ConvError::BadTypeConv => IssueKind::BadExpr(BadExpr::BadTypeConv {
            from: sym.qual_type_name(&expr.ty()),
            to: sym.qual_type_name(&to),
        }),
        ConvError::BadValueCatConv => IssueKind::BadExpr(BadExpr::BadValueCatConv {
            to_category: match to_cat {
                ValueCategory::LValue => "lvalue",
                ValueCategory::RValue => "rvalue",
            },
        }),
        ConvError::BadMutConv => IssueKind::BadExpr(BadExpr::BadMutConv {
            from: sym.qual_type_name(&expr.ty()),
            to: sym.qual_type_name(&to),
        }),
    };
    issues.error(range, kind);
}

/// A type both operands convert to implicitly, or `None`.
pub fn common_type(sym: &SymbolTable, a: QualType, b: QualType) -> Option<QualType> {
    let a_ty = sym.resolve(a.ty);
    let b_ty = sym.resolve(b.ty);
    let mutability = a.mutability.join(b.mutability);
    if a_ty == b_ty {
        return Some(QualType { ty: a_ty, mutability, bind: BindMode::Static });
    }
    let pick = |ty: EntityId| Some(QualType { ty, mutability, bind: BindMode::Static });
    // Prefer whichever direction converts implicitly.
    let a_to_b = object_conversion(sym, a_ty, b_ty)
        .is_some_and(|chain| chain.iter().all(|c| c.required_kind() == ConvKind::Implicit));
    if a_to_b {
        return pick(b_ty);
    }
    let b_to_a = object_conversion(sym, b_ty, a_ty)
        .is_some_and(|chain| chain.iter().all(|c| c.required_kind() == ConvKind::Implicit));
    if b_to_a {
        return pick(a_ty);
    }
    None
}
