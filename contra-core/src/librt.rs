//! Runtime-library installer: built-ins that are not declared by user code
//! but materialize on first use, as a symbol for the analyzer and as an
//! extern declaration for the generator.

use contra_ast::{BuiltinTypes, Span, VariableType};
use contra_ir::{Builder, IrError, Type};

use crate::symbols::FunctionDef;

pub const PRINT: &str = "print";
pub const SQRT: &str = "sqrt";
pub const ABS: &str = "abs";
pub const MAX: &str = "max";
pub const MIN: &str = "min";

pub const ALLOCATE: &str = "allocate";
pub const DEALLOCATE: &str = "deallocate";
pub const COPY: &str = "copy";

/// Lowered by the generator itself rather than by a library call.
pub const LEN: &str = "len";
pub const PART: &str = "part";

pub fn is_intrinsic(name: &str) -> bool {
    matches!(name, LEN | PART)
}

fn def(name: &str, span: Span, params: Vec<VariableType>, ret: VariableType, variadic: bool) -> FunctionDef {
    FunctionDef {
        name: name.to_string(),
        span,
        params,
        ret,
        is_task: false,
        variadic,
        declared_only: false,
    }
}

/// The analyzer-facing signature of a callable built-in.
pub fn function_def(name: &str, span: Span, types: &BuiltinTypes) -> Option<FunctionDef> {
    let real = types.real();
    let f = match name {
        PRINT => def(name, span, vec![types.string()], types.void(), true),
        SQRT | ABS => def(name, span, vec![real.clone()], real, false),
        MAX | MIN => def(name, span, vec![real.clone(), real.clone()], real, false),
        _ => return None,
    };
    Some(f)
}

/// Declares the extern for a built-in on the module. Returns false if the
/// name is not a library function.
pub fn install(b: &mut Builder, name: &str) -> Result<bool, IrError> {
    let (params, ret, variadic) = match name {
        PRINT => (vec![Type::Str], Type::Void, true),
        SQRT | ABS => (vec![Type::F64], Type::F64, false),
        MAX | MIN => (vec![Type::F64, Type::F64], Type::F64, false),
        ALLOCATE => (vec![Type::I64, Type::I64, Type::void_ptr()], Type::Void, false),
        DEALLOCATE => (vec![Type::void_ptr()], Type::Void, false),
        COPY => (vec![Type::void_ptr(), Type::void_ptr()], Type::Void, false),
        _ => return Ok(false),
    };
    b.declare_extern(name, params, ret, variadic)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contra_ast::span;

    #[test]
    fn print_is_variadic_over_a_format_string() {
        let types = BuiltinTypes::new();
        let print = function_def(PRINT, span(0, 0), &types).unwrap();
        assert!(print.variadic);
        assert_eq!(print.params, vec![types.string()]);
        assert!(print.ret.is_void());
    }

    #[test]
    fn dope_vector_helpers_are_not_user_callable() {
        let types = BuiltinTypes::new();
        assert!(function_def(ALLOCATE, span(0, 0), &types).is_none());
        let mut b = Builder::new("m");
        assert!(install(&mut b, ALLOCATE).unwrap());
        assert!(b.module().externs.contains_key(ALLOCATE));
        assert!(!install(&mut b, "nope").unwrap());
    }
}
