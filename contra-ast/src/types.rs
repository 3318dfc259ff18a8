use std::fmt;
use std::rc::Rc;

use crate::Span;
use crate::error::ContraError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    I64,
    F64,
    Bool,
    String,
    Void,
}

impl BuiltinKind {
    pub const ALL: [BuiltinKind; 5] = [
        BuiltinKind::I64,
        BuiltinKind::F64,
        BuiltinKind::Bool,
        BuiltinKind::String,
        BuiltinKind::Void,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinKind::I64 => "i64",
            BuiltinKind::F64 => "f64",
            BuiltinKind::Bool => "bool",
            BuiltinKind::String => "string",
            BuiltinKind::Void => "void",
        }
    }

    pub fn is_number(self) -> bool {
        matches!(self, BuiltinKind::I64 | BuiltinKind::F64)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeDefKind {
    BuiltIn(BuiltinKind),
    User { span: Span },
}

/// A named base type. Two definitions are the same type only if they are the
/// same allocation; the name is for diagnostics.
#[derive(Debug)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeDefKind,
}

pub type TypeRef = Rc<TypeDef>;

impl TypeDef {
    pub fn builtin(kind: BuiltinKind) -> TypeRef {
        Rc::new(TypeDef {
            name: kind.name().to_string(),
            kind: TypeDefKind::BuiltIn(kind),
        })
    }

    pub fn user(name: impl Into<String>, span: Span) -> TypeRef {
        Rc::new(TypeDef {
            name: name.into(),
            kind: TypeDefKind::User { span },
        })
    }

    pub fn builtin_kind(&self) -> Option<BuiltinKind> {
        match self.kind {
            TypeDefKind::BuiltIn(k) => Some(k),
            TypeDefKind::User { .. } => None,
        }
    }

    pub fn is_number(&self) -> bool {
        self.builtin_kind().is_some_and(BuiltinKind::is_number)
    }
}

/// Orthogonal qualifiers layered on top of a base type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Facets {
    pub array: bool,
    pub future: bool,
    pub field: bool,
    pub partition: bool,
    pub range: bool,
    pub global: bool,
}

/// The value descriptor attached to every analyzed node. The default value
/// has no base type and counts as unset.
#[derive(Clone, Debug, Default)]
pub struct VariableType {
    base: Option<TypeRef>,
    facets: Facets,
}

impl PartialEq for VariableType {
    fn eq(&self, other: &Self) -> bool {
        let same_base = match (&self.base, &other.base) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        // `global` is a lifetime, not part of the type.
        same_base
            && Facets {
                global: false,
                ..self.facets
            } == Facets {
                global: false,
                ..other.facets
            }
    }
}

impl VariableType {
    pub fn new(base: TypeRef) -> Self {
        Self {
            base: Some(base),
            facets: Facets::default(),
        }
    }

    pub fn with_facets(base: TypeRef, facets: Facets) -> Self {
        Self {
            base: Some(base),
            facets,
        }
    }

    pub fn is_set(&self) -> bool {
        self.base.is_some()
    }

    pub fn base(&self) -> Option<&TypeRef> {
        self.base.as_ref()
    }

    pub fn facets(&self) -> Facets {
        self.facets
    }

    pub fn builtin_kind(&self) -> Option<BuiltinKind> {
        self.base.as_ref().and_then(|b| b.builtin_kind())
    }

    pub fn is_number(&self) -> bool {
        self.base.as_ref().is_some_and(|b| b.is_number())
    }

    /// A numeric value that is not a collection or index space.
    pub fn is_scalar_number(&self) -> bool {
        self.is_number()
            && !self.facets.array
            && !self.facets.field
            && !self.facets.range
            && !self.facets.partition
    }

    pub fn is_void(&self) -> bool {
        self.builtin_kind() == Some(BuiltinKind::Void)
    }

    pub fn is_bool(&self) -> bool {
        self.builtin_kind() == Some(BuiltinKind::Bool) && self.is_plain()
    }

    pub fn is_int(&self) -> bool {
        self.builtin_kind() == Some(BuiltinKind::I64) && self.is_plain()
    }

    /// No collection, index-space or deferred facet.
    pub fn is_plain(&self) -> bool {
        let f = self.facets;
        !(f.array || f.field || f.range || f.partition)
    }

    pub fn is_array(&self) -> bool {
        self.facets.array
    }

    pub fn is_future(&self) -> bool {
        self.facets.future
    }

    pub fn is_field(&self) -> bool {
        self.facets.field
    }

    pub fn is_partition(&self) -> bool {
        self.facets.partition
    }

    pub fn is_range(&self) -> bool {
        self.facets.range
    }

    pub fn is_global(&self) -> bool {
        self.facets.global
    }

    pub fn with_array(mut self, on: bool) -> Self {
        self.facets.array = on;
        self
    }

    pub fn with_future(mut self, on: bool) -> Self {
        self.facets.future = on;
        self
    }

    pub fn with_field(mut self, on: bool) -> Self {
        self.facets.field = on;
        self
    }

    pub fn with_partition(mut self, on: bool) -> Self {
        self.facets.partition = on;
        self
    }

    pub fn with_range(mut self, on: bool) -> Self {
        self.facets.range = on;
        self
    }

    pub fn with_global(mut self, on: bool) -> Self {
        self.facets.global = on;
        self
    }

    /// The type with the deferred and lifetime facets removed.
    pub fn value_view(&self) -> Self {
        self.clone().with_future(false).with_global(false)
    }

    /// The type of one element of an array or field.
    pub fn element(&self) -> Self {
        self.value_view().with_array(false).with_field(false)
    }

    pub fn same_base(&self, other: &Self) -> bool {
        match (&self.base, &other.base) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Names the first invalid facet combination, if any.
    pub fn facet_conflict(&self) -> Option<&'static str> {
        let f = self.facets;
        if f.array && f.future {
            Some("an array cannot be a future")
        } else if f.future && f.field {
            Some("a field cannot be a future")
        } else if f.range && f.array {
            Some("a range cannot be an array")
        } else if f.partition && (f.array || f.field) {
            Some("a partition cannot be an array or a field")
        } else if f.range && f.future {
            Some("a range cannot be a future")
        } else {
            None
        }
    }

    pub fn validate(self, span: Span) -> Result<Self, ContraError> {
        match self.facet_conflict() {
            Some(msg) => Err(ContraError::type_error(
                format!("invalid type '{}': {msg}", self.display()),
                span,
            )),
            None => Ok(self),
        }
    }

    pub fn is_castable_to(&self, to: &Self) -> bool {
        self.value_view() == to.value_view() || (self.is_scalar_number() && to.is_scalar_number())
    }

    pub fn is_assignable_to(&self, left: &Self) -> bool {
        if self.facets.array && !(left.facets.array || left.facets.field) {
            return false;
        }
        self.is_castable_to(left)
    }

    /// Common type of a mixed numeric pair: `f64` if either side is `f64`,
    /// otherwise the left operand's type.
    pub fn promote(&self, right: &Self, span: Span) -> Result<Self, ContraError> {
        let (l, r) = (self.value_view(), right.value_view());
        if l == r {
            return Ok(l);
        }
        if l.is_number() && r.is_number() {
            if r.builtin_kind() == Some(BuiltinKind::F64) {
                return Ok(r);
            }
            return Ok(l);
        }
        Err(ContraError::type_error(
            format!(
                "no promotion rule between '{}' and '{}'",
                self.display(),
                right.display()
            ),
            span,
        ))
    }

    pub fn display(&self) -> String {
        let Some(base) = &self.base else {
            return "<unset>".to_string();
        };
        let f = self.facets;
        if f.range {
            return "range".to_string();
        }
        if f.partition {
            return "partition".to_string();
        }
        let mut s = base.name.clone();
        if f.array {
            s = format!("[{s}]");
        }
        if f.field {
            s = format!("field {s}");
        }
        if f.future {
            s = format!("future {s}");
        }
        s
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// One instance of every built-in base type; types from different instances
/// never compare equal.
#[derive(Clone, Debug)]
pub struct BuiltinTypes {
    pub i64: TypeRef,
    pub f64: TypeRef,
    pub bool: TypeRef,
    pub string: TypeRef,
    pub void: TypeRef,
}

impl Default for BuiltinTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinTypes {
    pub fn new() -> Self {
        Self {
            i64: TypeDef::builtin(BuiltinKind::I64),
            f64: TypeDef::builtin(BuiltinKind::F64),
            bool: TypeDef::builtin(BuiltinKind::Bool),
            string: TypeDef::builtin(BuiltinKind::String),
            void: TypeDef::builtin(BuiltinKind::Void),
        }
    }

    pub fn get(&self, kind: BuiltinKind) -> &TypeRef {
        match kind {
            BuiltinKind::I64 => &self.i64,
            BuiltinKind::F64 => &self.f64,
            BuiltinKind::Bool => &self.bool,
            BuiltinKind::String => &self.string,
            BuiltinKind::Void => &self.void,
        }
    }

    pub fn int(&self) -> VariableType {
        VariableType::new(self.i64.clone())
    }

    pub fn real(&self) -> VariableType {
        VariableType::new(self.f64.clone())
    }

    pub fn boolean(&self) -> VariableType {
        VariableType::new(self.bool.clone())
    }

    pub fn string(&self) -> VariableType {
        VariableType::new(self.string.clone())
    }

    pub fn void(&self) -> VariableType {
        VariableType::new(self.void.clone())
    }

    pub fn range(&self) -> VariableType {
        self.int().with_range(true)
    }

    pub fn partition(&self) -> VariableType {
        self.int().with_partition(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span;
    use proptest::prelude::*;

    fn numeric(b: &BuiltinTypes, real: bool) -> VariableType {
        if real { b.real() } else { b.int() }
    }

    #[test]
    fn equality_is_by_identity() {
        let a = BuiltinTypes::new();
        let b = BuiltinTypes::new();
        assert_eq!(a.int(), a.int());
        assert_ne!(a.int(), b.int());
        assert_ne!(a.int(), a.int().with_array(true));
    }

    #[test]
    fn global_facet_does_not_affect_equality() {
        let b = BuiltinTypes::new();
        assert_eq!(b.real().with_global(true), b.real());
    }

    #[test]
    fn unset_type_is_falsy() {
        let t = VariableType::default();
        assert!(!t.is_set());
        assert_eq!(t.display(), "<unset>");
    }

    #[test]
    fn array_is_not_assignable_to_scalar() {
        let b = BuiltinTypes::new();
        let arr = b.int().with_array(true);
        assert!(!arr.is_assignable_to(&b.int()));
        assert!(arr.is_assignable_to(&b.int().with_array(true)));
        assert!(b.int().is_assignable_to(&b.real()));
    }

    #[test]
    fn promote_rejects_non_numbers() {
        let b = BuiltinTypes::new();
        let err = b.string().promote(&b.int(), span(0, 1)).unwrap_err();
        assert!(err.message().contains("no promotion rule"), "unexpected error: {err}");
    }

    #[test]
    fn facet_conflicts_are_reported() {
        let b = BuiltinTypes::new();
        assert!(b.int().with_array(true).with_future(true).facet_conflict().is_some());
        assert!(b.int().with_field(true).with_future(true).facet_conflict().is_some());
        assert!(b.int().with_future(true).facet_conflict().is_none());
        assert!(b.int().with_array(true).validate(span(0, 1)).is_ok());
    }

    #[test]
    fn display_names_facets() {
        let b = BuiltinTypes::new();
        assert_eq!(b.int().with_array(true).display(), "[i64]");
        assert_eq!(b.real().with_future(true).display(), "future f64");
        assert_eq!(b.range().display(), "range");
    }

    proptest! {
        #[test]
        fn promotion_is_symmetric(l in any::<bool>(), r in any::<bool>(), fl in any::<bool>(), fr in any::<bool>()) {
            let b = BuiltinTypes::new();
            let left = numeric(&b, l).with_future(fl);
            let right = numeric(&b, r).with_future(fr);
            let lr = left.promote(&right, span(0, 1)).unwrap();
            let rl = right.promote(&left, span(0, 1)).unwrap();
            prop_assert_eq!(lr, rl);
        }

        #[test]
        fn promoting_with_self_is_identity(real in any::<bool>()) {
            let b = BuiltinTypes::new();
            let t = numeric(&b, real);
            prop_assert_eq!(t.promote(&t, span(0, 1)).unwrap(), t.clone());
            prop_assert!(t.is_castable_to(&t));
        }
    }
}
