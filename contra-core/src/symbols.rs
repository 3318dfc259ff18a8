use std::collections::HashMap;

use contra_ast::{
    AccessedVar, BuiltinKind, BuiltinTypes, ContraError, Ident, Span, TypeRef, VarId, VariableType,
};
use tracing::trace;

use crate::librt;

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDef {
    pub id: VarId,
    pub name: String,
    pub span: Span,
    pub ty: VariableType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub span: Span,
    pub params: Vec<VariableType>,
    pub ret: VariableType,
    pub is_task: bool,
    pub variadic: bool,
    /// Prototype only; a later definition with the same signature may complete it.
    pub declared_only: bool,
}

#[derive(Default)]
struct Frame {
    variables: HashMap<String, VariableDef>,
}

struct AccessTracker {
    base_depth: usize,
    seen: Vec<AccessedVar>,
}

/// Scoped symbol tables. Variables live in a stack of frames; functions and
/// named types live in the outermost frame for the whole session.
pub struct Context {
    builtins: BuiltinTypes,
    frames: Vec<Frame>,
    functions: HashMap<String, FunctionDef>,
    types: HashMap<String, TypeRef>,
    trackers: Vec<AccessTracker>,
    next_var: u32,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let builtins = BuiltinTypes::new();
        let types = BuiltinKind::ALL
            .iter()
            .map(|k| (k.name().to_string(), builtins.get(*k).clone()))
            .collect();
        Self {
            builtins,
            frames: vec![Frame::default()],
            functions: HashMap::new(),
            types,
            trackers: Vec::new(),
            next_var: 0,
        }
    }

    pub fn builtins(&self) -> &BuiltinTypes {
        &self.builtins
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_global_scope(&self) -> bool {
        self.frames.len() == 1
    }

    pub fn push_scope(&mut self) {
        self.frames.push(Frame::default());
        trace!(depth = self.frames.len(), "push symbol scope");
    }

    pub fn pop_scope(&mut self) {
        // The global frame is never popped.
        if self.frames.len() > 1 {
            self.frames.pop();
        }
        trace!(depth = self.frames.len(), "pop symbol scope");
    }

    /// Pops frames until `depth` remain; used to recover after a failed pass.
    pub fn unwind_to(&mut self, depth: usize) {
        while self.frames.len() > depth.max(1) {
            self.frames.pop();
        }
        self.trackers.retain(|t| t.base_depth < depth);
    }

    pub fn insert_variable(&mut self, name: &Ident, ty: VariableType) -> Result<VariableDef, ContraError> {
        let id = VarId(self.next_var);
        let def = VariableDef {
            id,
            name: name.node.clone(),
            span: name.span,
            ty,
        };
        let Some(frame) = self.frames.last_mut() else {
            return Err(ContraError::implementation("symbol table has no frames", name.span));
        };
        if frame.variables.contains_key(&name.node) {
            return Err(ContraError::name(
                format!("variable '{}' has been previously defined", name.node),
                name.span,
            ));
        }
        self.next_var += 1;
        frame.variables.insert(name.node.clone(), def.clone());
        Ok(def)
    }

    /// Looks a variable up innermost-first, recording the access for every
    /// open tracker whose scope lies inside the frame it was found in.
    pub fn get_variable(&mut self, name: &Ident) -> Result<VariableDef, ContraError> {
        let found = self
            .frames
            .iter()
            .enumerate()
            .rev()
            .find_map(|(depth, f)| f.variables.get(&name.node).map(|d| (depth, d.clone())));
        let Some((depth, def)) = found else {
            return Err(ContraError::name(
                format!("variable '{}' has not been previously defined", name.node),
                name.span,
            ));
        };
        for tracker in &mut self.trackers {
            if depth < tracker.base_depth && !tracker.seen.iter().any(|a| a.def == def.id) {
                tracker.seen.push(AccessedVar {
                    name: def.name.clone(),
                    def: def.id,
                    ty: def.ty.clone(),
                });
            }
        }
        Ok(def)
    }

    pub fn find_variable(&self, name: &str) -> Option<&VariableDef> {
        self.frames.iter().rev().find_map(|f| f.variables.get(name))
    }

    /// Index of the frame `name` resolves to, outermost frame first.
    pub fn variable_depth(&self, name: &str) -> Option<usize> {
        self.frames.iter().rposition(|f| f.variables.contains_key(name))
    }

    /// Starts collecting variables from frames outside the current one.
    pub fn begin_access_tracking(&mut self) {
        self.trackers.push(AccessTracker {
            base_depth: self.frames.len() - 1,
            seen: Vec::new(),
        });
    }

    pub fn end_access_tracking(&mut self) -> Vec<AccessedVar> {
        self.trackers.pop().map(|t| t.seen).unwrap_or_default()
    }

    pub fn insert_function(&mut self, def: FunctionDef) -> Result<(), ContraError> {
        if self.functions.contains_key(&def.name) {
            return Err(ContraError::name(
                format!("prototype already exists for '{}'", def.name),
                def.span,
            ));
        }
        trace!(name = %def.name, task = def.is_task, "insert function");
        self.functions.insert(def.name.clone(), def);
        Ok(())
    }

    /// User functions first, then the runtime library.
    pub fn get_function(&mut self, name: &Ident) -> Result<FunctionDef, ContraError> {
        if let Some(f) = self.functions.get(&name.node) {
            return Ok(f.clone());
        }
        if let Some(f) = librt::function_def(&name.node, name.span, &self.builtins) {
            self.functions.insert(f.name.clone(), f.clone());
            return Ok(f);
        }
        Err(ContraError::name(
            format!("no valid prototype for '{}'", name.node),
            name.span,
        ))
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn erase_function(&mut self, name: &str) -> Option<FunctionDef> {
        self.functions.remove(name)
    }

    pub fn insert_type(&mut self, name: &Ident, def: TypeRef) -> Result<(), ContraError> {
        if self.types.contains_key(&name.node) {
            return Err(ContraError::name(
                format!("type '{}' already exists", name.node),
                name.span,
            ));
        }
        self.types.insert(name.node.clone(), def);
        Ok(())
    }

    pub fn get_type(&self, name: &str, span: Span) -> Result<TypeRef, ContraError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| ContraError::name(format!("unknown type specifier '{name}'"), span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contra_ast::build::ident;
    use contra_ast::{ErrorKind, TypeDef};

    #[test]
    fn shadowing_in_nested_scope_is_allowed() {
        let mut cx = Context::new();
        let int = cx.builtins().int();
        let outer = cx.insert_variable(&ident("x"), int.clone()).unwrap();
        cx.push_scope();
        let inner = cx.insert_variable(&ident("x"), cx.builtins().real()).unwrap();
        assert_ne!(outer.id, inner.id);
        assert_eq!(cx.get_variable(&ident("x")).unwrap().id, inner.id);
        cx.pop_scope();
        assert_eq!(cx.get_variable(&ident("x")).unwrap().id, outer.id);
    }

    #[test]
    fn redeclaration_in_same_scope_is_a_name_error() {
        let mut cx = Context::new();
        let int = cx.builtins().int();
        cx.insert_variable(&ident("x"), int.clone()).unwrap();
        let err = cx.insert_variable(&ident("x"), int).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Name);
    }

    #[test]
    fn functions_fall_back_to_runtime_library() {
        let mut cx = Context::new();
        let sqrt = cx.get_function(&ident("sqrt")).unwrap();
        assert_eq!(sqrt.ret, cx.builtins().real());
        let err = cx.get_function(&ident("nope")).unwrap_err();
        assert!(err.message().contains("no valid prototype"), "unexpected error: {err}");
    }

    #[test]
    fn access_tracking_sees_only_outer_frames() {
        let mut cx = Context::new();
        let int = cx.builtins().int();
        cx.insert_variable(&ident("a"), int.clone()).unwrap();
        cx.push_scope();
        cx.begin_access_tracking();
        cx.insert_variable(&ident("i"), int).unwrap();
        cx.get_variable(&ident("i")).unwrap();
        cx.get_variable(&ident("a")).unwrap();
        cx.get_variable(&ident("a")).unwrap();
        let seen = cx.end_access_tracking();
        cx.pop_scope();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "a");
    }

    #[test]
    fn user_types_resolve_by_name() {
        let mut cx = Context::new();
        let def = TypeDef::user("point", contra_ast::span(0, 5));
        cx.insert_type(&ident("point"), def.clone()).unwrap();
        assert!(std::rc::Rc::ptr_eq(&cx.get_type("point", contra_ast::span(0, 0)).unwrap(), &def));
        assert!(cx.insert_type(&ident("i64"), def).is_err());
    }
}
