use std::collections::BTreeMap;

use contra_ast::Span;

use crate::{
    BasicBlock, BinOp, BlockId, Constant, ExternFnSig, FunctionIR, Global, IdGen, Inst, InstKind,
    IrError, ModuleIR, Param, StructDef, Terminator, Type, UnaryOp, ValueId,
};

struct FunctionState {
    func: FunctionIR,
    ids: IdGen,
    current: Option<BlockId>,
    allocas: Vec<Inst>,
    span: Span,
}

/// Emits instructions into a module. Functions nest: beginning a function
/// while another is open suspends the outer one until the inner finishes.
pub struct Builder {
    module: ModuleIR,
    frames: Vec<FunctionState>,
}

fn dope_vector_fields(elem: &Type) -> Vec<Type> {
    vec![Type::ptr(elem.clone()), Type::I64, Type::I64]
}

impl Builder {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module: ModuleIR::new(module_name),
            frames: Vec::new(),
        }
    }

    pub fn module(&self) -> &ModuleIR {
        &self.module
    }

    pub fn into_module(self) -> ModuleIR {
        self.module
    }

    pub fn declare_struct(&mut self, name: &str, fields: Vec<Type>) -> Result<Type, IrError> {
        if let Some(existing) = self.module.structs.get(name) {
            if existing.fields != fields {
                return Err(IrError::new(
                    format!("struct '{name}' redeclared with a different layout"),
                    self.span(),
                ));
            }
        } else {
            self.module.structs.insert(
                name.to_string(),
                StructDef {
                    name: name.to_string(),
                    fields,
                },
            );
        }
        Ok(Type::Struct(name.to_string()))
    }

    pub fn declare_extern(
        &mut self,
        name: &str,
        params: Vec<Type>,
        ret: Type,
        variadic: bool,
    ) -> Result<(), IrError> {
        let sig = ExternFnSig {
            params,
            ret,
            variadic,
        };
        match self.module.externs.get(name) {
            Some(existing) if *existing != sig => Err(IrError::new(
                format!("extern '{name}' redeclared with a different signature"),
                self.span(),
            )),
            Some(_) => Ok(()),
            None => {
                self.module.externs.insert(name.to_string(), sig);
                Ok(())
            }
        }
    }

    pub fn has_callable(&self, name: &str) -> bool {
        self.module.functions.contains_key(name)
            || self.module.externs.contains_key(name)
            || self.frames.iter().any(|f| f.func.name == name)
    }

    pub fn declare_global(&mut self, name: &str, ty: Type) {
        self.module.globals.insert(
            name.to_string(),
            Global {
                name: name.to_string(),
                ty,
            },
        );
    }

    pub fn remove_function(&mut self, name: &str) -> bool {
        self.module.functions.remove(name).is_some()
    }

    /// Opens a new function with an `entry` block and returns its parameter values.
    pub fn begin_function(
        &mut self,
        name: &str,
        span: Span,
        params: Vec<(String, Type)>,
        ret: Type,
    ) -> Vec<ValueId> {
        let mut ids = IdGen::default();
        let entry = ids.fresh_block();
        let mut values = BTreeMap::new();
        let params: Vec<Param> = params
            .into_iter()
            .map(|(name, ty)| {
                let value = ids.fresh_value();
                values.insert(value, ty.clone());
                Param {
                    name,
                    ty,
                    span,
                    value,
                }
            })
            .collect();
        let param_values = params.iter().map(|p| p.value).collect();

        let func = FunctionIR {
            name: name.to_string(),
            span,
            params,
            ret,
            blocks: vec![BasicBlock {
                id: entry,
                label: "entry".to_string(),
                insts: Vec::new(),
                term: None,
            }],
            entry,
            values,
        };
        self.frames.push(FunctionState {
            func,
            ids,
            current: Some(entry),
            allocas: Vec::new(),
            span,
        });
        param_values
    }

    /// Closes the innermost open function and stores it on the module,
    /// replacing any earlier function of the same name.
    pub fn finish_function(&mut self) -> Result<String, IrError> {
        let Some(mut state) = self.frames.pop() else {
            return Err(IrError::new("no function is being built", contra_ast::span(0, 0)));
        };
        let entry = state.func.entry;
        if let Some(bb) = state.func.blocks.iter_mut().find(|b| b.id == entry) {
            let mut insts = std::mem::take(&mut state.allocas);
            insts.append(&mut bb.insts);
            bb.insts = insts;
        }
        let name = state.func.name.clone();
        self.module.functions.insert(name.clone(), state.func);
        Ok(name)
    }

    /// Drops the innermost open function without storing it.
    pub fn abandon_function(&mut self) {
        self.frames.pop();
    }

    pub fn function_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_function(&self) -> Option<&str> {
        self.frames.last().map(|f| f.func.name.as_str())
    }

    pub fn set_span(&mut self, span: Span) {
        if let Some(f) = self.frames.last_mut() {
            f.span = span;
        }
    }

    fn span(&self) -> Span {
        self.frames
            .last()
            .map(|f| f.span)
            .unwrap_or_else(|| contra_ast::span(0, 0))
    }

    fn frame(&self) -> Result<&FunctionState, IrError> {
        self.frames
            .last()
            .ok_or_else(|| IrError::new("no function is being built", contra_ast::span(0, 0)))
    }

    fn frame_mut(&mut self) -> Result<&mut FunctionState, IrError> {
        self.frames
            .last_mut()
            .ok_or_else(|| IrError::new("no function is being built", contra_ast::span(0, 0)))
    }

    pub fn append_block(&mut self, label: &str) -> Result<BlockId, IrError> {
        let f = self.frame_mut()?;
        let id = f.ids.fresh_block();
        f.func.blocks.push(BasicBlock {
            id,
            label: label.to_string(),
            insts: Vec::new(),
            term: None,
        });
        Ok(id)
    }

    pub fn position_at_end(&mut self, bb: BlockId) -> Result<(), IrError> {
        let span = self.span();
        let f = self.frame_mut()?;
        if !f.func.blocks.iter().any(|b| b.id == bb) {
            return Err(IrError::new(format!("unknown block {bb:?}"), span));
        }
        f.current = Some(bb);
        Ok(())
    }

    pub fn current_block(&self) -> Result<BlockId, IrError> {
        self.frame()?
            .current
            .ok_or_else(|| IrError::new("builder is not positioned in a block", self.span()))
    }

    pub fn is_terminated(&self) -> bool {
        let Ok(f) = self.frame() else {
            return true;
        };
        f.current
            .and_then(|id| f.func.block(id))
            .is_none_or(|b| b.term.is_some())
    }

    pub fn type_of(&self, v: ValueId) -> Result<Type, IrError> {
        self.frame()?
            .func
            .values
            .get(&v)
            .cloned()
            .ok_or_else(|| IrError::new(format!("unknown value {v:?}"), self.span()))
    }

    fn pointee_of(&self, ptr: ValueId) -> Result<Type, IrError> {
        match self.type_of(ptr)? {
            Type::Ptr(t) => Ok(*t),
            other => Err(IrError::new(
                format!("expected a pointer, found '{}'", other.display()),
                self.span(),
            )),
        }
    }

    fn push(&mut self, kind: InstKind, result: Option<Type>) -> Result<Option<ValueId>, IrError> {
        let span = self.span();
        let f = self.frame_mut()?;
        let Some(bb) = f.current else {
            return Err(IrError::new("builder is not positioned in a block", span));
        };
        let dest = result.map(|ty| {
            let v = f.ids.fresh_value();
            f.func.values.insert(v, ty);
            v
        });
        let Some(block) = f.func.blocks.iter_mut().find(|b| b.id == bb) else {
            return Err(IrError::new(format!("unknown block {bb:?}"), span));
        };
        if block.term.is_some() {
            return Err(IrError::new(
                format!("block '{}' is already terminated", block.label),
                span,
            ));
        }
        block.insts.push(Inst { span, dest, kind });
        Ok(dest)
    }

    fn push_value(&mut self, kind: InstKind, ty: Type) -> Result<ValueId, IrError> {
        let span = self.span();
        self.push(kind, Some(ty))?
            .ok_or_else(|| IrError::new("instruction produced no value", span))
    }

    fn terminate(&mut self, term: Terminator) -> Result<(), IrError> {
        let span = self.span();
        let f = self.frame_mut()?;
        let Some(bb) = f.current else {
            return Err(IrError::new("builder is not positioned in a block", span));
        };
        let Some(block) = f.func.blocks.iter_mut().find(|b| b.id == bb) else {
            return Err(IrError::new(format!("unknown block {bb:?}"), span));
        };
        if block.term.is_some() {
            return Err(IrError::new(
                format!("block '{}' is already terminated", block.label),
                span,
            ));
        }
        block.term = Some(term);
        Ok(())
    }

    /// Stack slot for a value of type `ty`, hoisted into the entry block.
    pub fn alloca(&mut self, name: &str, ty: Type) -> Result<ValueId, IrError> {
        let span = self.span();
        let f = self.frame_mut()?;
        let v = f.ids.fresh_value();
        f.func.values.insert(v, Type::ptr(ty.clone()));
        f.allocas.push(Inst {
            span,
            dest: Some(v),
            kind: InstKind::Alloca {
                name: name.to_string(),
                ty,
            },
        });
        Ok(v)
    }

    pub fn global(&mut self, name: &str) -> Result<ValueId, IrError> {
        let Some(g) = self.module.globals.get(name) else {
            return Err(IrError::new(format!("unknown global '{name}'"), self.span()));
        };
        let ty = Type::ptr(g.ty.clone());
        self.push_value(
            InstKind::Global {
                name: name.to_string(),
            },
            ty,
        )
    }

    pub fn constant(&mut self, c: Constant) -> Result<ValueId, IrError> {
        let ty = c.ty();
        self.push_value(InstKind::Const(c), ty)
    }

    pub fn const_i64(&mut self, v: i64) -> Result<ValueId, IrError> {
        self.constant(Constant::I64(v))
    }

    pub fn const_i32(&mut self, v: i32) -> Result<ValueId, IrError> {
        self.constant(Constant::I32(v))
    }

    pub fn const_f64(&mut self, v: f64) -> Result<ValueId, IrError> {
        self.constant(Constant::F64(v))
    }

    pub fn const_bool(&mut self, v: bool) -> Result<ValueId, IrError> {
        self.constant(Constant::Bool(v))
    }

    pub fn const_str(&mut self, v: &str) -> Result<ValueId, IrError> {
        self.constant(Constant::Str(v.to_string()))
    }

    pub fn null(&mut self, pointee: Type) -> Result<ValueId, IrError> {
        self.constant(Constant::Null(pointee))
    }

    pub fn function_ref(&mut self, name: &str) -> Result<ValueId, IrError> {
        self.constant(Constant::Function(name.to_string()))
    }

    pub fn load(&mut self, ptr: ValueId) -> Result<ValueId, IrError> {
        let ty = self.pointee_of(ptr)?;
        self.push_value(InstKind::Load { ptr }, ty)
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId) -> Result<(), IrError> {
        let slot = self.pointee_of(ptr)?;
        let ty = self.type_of(value)?;
        if slot != ty {
            return Err(IrError::new(
                format!(
                    "cannot store '{}' into a slot of '{}'",
                    ty.display(),
                    slot.display()
                ),
                self.span(),
            ));
        }
        self.push(InstKind::Store { ptr, value }, None)?;
        Ok(())
    }

    pub fn field_ptr(&mut self, base: ValueId, index: u32) -> Result<ValueId, IrError> {
        let fields = match self.pointee_of(base)? {
            Type::Struct(name) => match self.module.structs.get(&name) {
                Some(s) => s.fields.clone(),
                None => {
                    return Err(IrError::new(format!("unknown struct '{name}'"), self.span()));
                }
            },
            Type::Array(elem) => dope_vector_fields(&elem),
            other => {
                return Err(IrError::new(
                    format!("'{}' has no fields", other.display()),
                    self.span(),
                ));
            }
        };
        let Some(field) = fields.get(index as usize) else {
            return Err(IrError::new(
                format!("field index {index} out of bounds"),
                self.span(),
            ));
        };
        let ty = Type::ptr(field.clone());
        self.push_value(InstKind::FieldPtr { base, index }, ty)
    }

    pub fn element_ptr(&mut self, array: ValueId, index: ValueId) -> Result<ValueId, IrError> {
        let elem = match self.pointee_of(array)? {
            Type::Array(elem) => *elem,
            other => {
                return Err(IrError::new(
                    format!("cannot index into '{}'", other.display()),
                    self.span(),
                ));
            }
        };
        if self.type_of(index)? != Type::I64 {
            return Err(IrError::new("array index must be i64", self.span()));
        }
        self.push_value(InstKind::ElementPtr { array, index }, Type::ptr(elem))
    }

    pub fn unary(&mut self, op: UnaryOp, operand: ValueId) -> Result<ValueId, IrError> {
        let ty = self.type_of(operand)?;
        self.push_value(InstKind::Unary { op, operand }, ty)
    }

    pub fn binary(&mut self, op: BinOp, left: ValueId, right: ValueId) -> Result<ValueId, IrError> {
        let (lt, rt) = (self.type_of(left)?, self.type_of(right)?);
        if lt != rt {
            return Err(IrError::new(
                format!(
                    "operands of '{}' differ: '{}' and '{}'",
                    op.mnemonic(),
                    lt.display(),
                    rt.display()
                ),
                self.span(),
            ));
        }
        let ty = if op.is_comparison() { Type::Bool } else { lt };
        self.push_value(InstKind::Binary { op, left, right }, ty)
    }

    pub fn cast(&mut self, value: ValueId, to: Type) -> Result<ValueId, IrError> {
        if self.type_of(value)? == to {
            return Ok(value);
        }
        self.push_value(InstKind::Cast { value, to: to.clone() }, to)
    }

    /// Emits a call; returns `None` when the callee returns `void`.
    pub fn call(&mut self, callee: &str, args: Vec<ValueId>) -> Result<Option<ValueId>, IrError> {
        let (params, ret, variadic) = match self.module.signature(callee) {
            Some(sig) => sig,
            None => match self.frames.iter().rev().find(|f| f.func.name == callee) {
                Some(f) => (
                    f.func.params.iter().map(|p| p.ty.clone()).collect(),
                    f.func.ret.clone(),
                    false,
                ),
                None => {
                    return Err(IrError::new(
                        format!("call to undeclared function '{callee}'"),
                        self.span(),
                    ));
                }
            },
        };
        let arity_ok = if variadic {
            args.len() >= params.len()
        } else {
            args.len() == params.len()
        };
        if !arity_ok {
            return Err(IrError::new(
                format!(
                    "'{callee}' expects {} arguments, got {}",
                    params.len(),
                    args.len()
                ),
                self.span(),
            ));
        }
        for (i, (arg, param)) in args.iter().zip(&params).enumerate() {
            let ty = self.type_of(*arg)?;
            let opaque = *param == Type::void_ptr() && (ty.is_ptr() || ty == Type::Str);
            if ty != *param && !opaque {
                return Err(IrError::new(
                    format!(
                        "argument {i} of '{callee}' is '{}', expected '{}'",
                        ty.display(),
                        param.display()
                    ),
                    self.span(),
                ));
            }
        }
        let result = if ret == Type::Void { None } else { Some(ret) };
        self.push(
            InstKind::Call {
                callee: callee.to_string(),
                args,
            },
            result,
        )
    }

    pub fn memcopy(&mut self, dst: ValueId, src: ValueId) -> Result<(), IrError> {
        let (d, s) = (self.pointee_of(dst)?, self.pointee_of(src)?);
        if d != s {
            return Err(IrError::new(
                format!("cannot copy '{}' into '{}'", s.display(), d.display()),
                self.span(),
            ));
        }
        self.push(InstKind::MemCopy { dst, src }, None)?;
        Ok(())
    }

    pub fn size_of(&mut self, ty: Type) -> Result<ValueId, IrError> {
        self.push_value(InstKind::SizeOf { ty }, Type::I64)
    }

    pub fn br(&mut self, target: BlockId) -> Result<(), IrError> {
        self.terminate(Terminator::Br(target))
    }

    pub fn cond_br(&mut self, cond: ValueId, then_bb: BlockId, else_bb: BlockId) -> Result<(), IrError> {
        if self.type_of(cond)? != Type::Bool {
            return Err(IrError::new("branch condition must be i1", self.span()));
        }
        self.terminate(Terminator::CondBr {
            cond,
            then_bb,
            else_bb,
        })
    }

    pub fn ret(&mut self, value: Option<ValueId>) -> Result<(), IrError> {
        let expected = self.frame()?.func.ret.clone();
        let found = match value {
            Some(v) => self.type_of(v)?,
            None => Type::Void,
        };
        if found != expected {
            return Err(IrError::new(
                format!(
                    "function returns '{}' but '{}' was returned",
                    expected.display(),
                    found.display()
                ),
                self.span(),
            ));
        }
        self.terminate(Terminator::Return(value))
    }

    pub fn unreachable(&mut self) -> Result<(), IrError> {
        self.terminate(Terminator::Unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contra_ast::span;

    fn builder_with_fn(ret: Type) -> Builder {
        let mut b = Builder::new("test");
        b.begin_function("f", span(0, 1), vec![("n".to_string(), Type::I64)], ret);
        b
    }

    #[test]
    fn allocas_are_hoisted_into_entry() {
        let mut b = builder_with_fn(Type::Void);
        let body = b.append_block("body").unwrap();
        b.br(body).unwrap();
        b.position_at_end(body).unwrap();
        let slot = b.alloca("x", Type::I64).unwrap();
        let one = b.const_i64(1).unwrap();
        b.store(slot, one).unwrap();
        b.ret(None).unwrap();
        b.finish_function().unwrap();

        let f = &b.module().functions["f"];
        let entry = f.block(f.entry).unwrap();
        assert!(matches!(entry.insts[0].kind, InstKind::Alloca { .. }));
        assert!(f.block(body).unwrap().insts.iter().all(|i| !matches!(i.kind, InstKind::Alloca { .. })));
    }

    #[test]
    fn store_rejects_mismatched_types() {
        let mut b = builder_with_fn(Type::Void);
        let slot = b.alloca("x", Type::I64).unwrap();
        let v = b.const_f64(1.0).unwrap();
        let err = b.store(slot, v).unwrap_err();
        assert!(err.message.contains("cannot store"), "unexpected error: {}", err.message);
    }

    #[test]
    fn emitting_after_terminator_fails() {
        let mut b = builder_with_fn(Type::Void);
        b.ret(None).unwrap();
        assert!(b.is_terminated());
        let err = b.const_i64(3).unwrap_err();
        assert!(err.message.contains("already terminated"), "unexpected error: {}", err.message);
    }

    #[test]
    fn calls_check_arity_and_variadics() {
        let mut b = builder_with_fn(Type::Void);
        b.declare_extern("print", vec![Type::Str], Type::Void, true).unwrap();
        let fmt = b.const_str("%d\n").unwrap();
        let n = b.const_i64(4).unwrap();
        assert_eq!(b.call("print", vec![fmt, n]).unwrap(), None);
        let err = b.call("print", vec![]).unwrap_err();
        assert!(err.message.contains("expects 1 arguments"), "unexpected error: {}", err.message);
    }

    #[test]
    fn nested_functions_resume_outer() {
        let mut b = builder_with_fn(Type::I64);
        b.begin_function("inner", span(0, 1), vec![], Type::Void);
        b.ret(None).unwrap();
        assert_eq!(b.finish_function().unwrap(), "inner");
        assert_eq!(b.current_function(), Some("f"));
        let v = b.const_i64(0).unwrap();
        b.ret(Some(v)).unwrap();
        b.finish_function().unwrap();
        assert_eq!(b.module().functions.len(), 2);
    }

    #[test]
    fn dope_vector_fields_are_addressable() {
        let mut b = builder_with_fn(Type::Void);
        let arr = b.alloca("a", Type::array(Type::F64)).unwrap();
        let size = b.field_ptr(arr, 1).unwrap();
        assert_eq!(b.type_of(size).unwrap(), Type::ptr(Type::I64));
        let i = b.const_i64(0).unwrap();
        let elem = b.element_ptr(arr, i).unwrap();
        assert_eq!(b.type_of(elem).unwrap(), Type::ptr(Type::F64));
    }
}
