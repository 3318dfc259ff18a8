use std::collections::HashMap;

use contra_ast::{
    AssignStmt, BinOp, BuiltinKind, CallExpr, ContraError, Expr, ExprKind, ForStmt, ForeachStmt,
    FunctionDecl, Ident, IfStmt, IndexTaskDecl, Item, LoopBounds, Prototype, RangeLit, ReduceOp,
    Span, Stmt, UnaryOp, VarDecl, VarRef, VariableType,
};
use contra_ir::{Builder, ModuleIR, Type, ValueId, validate_function};
use tracing::{debug, trace};

use crate::librt;
use crate::storage::{Ownership, Slot, StorageEntry, StorageTable, Teardown};
use crate::tasker::{
    Launch, LaunchArg, ReduceKind, ReductionTarget, ResourceKind, TaskArg, Tasker,
};

/// What lowering an expression produced.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Lowered {
    Value(ValueId),
    /// Pointer to storage holding the value.
    Slot(ValueId),
    Void,
}

pub fn reduce_kind(op: &ReduceOp) -> ReduceKind {
    match op {
        ReduceOp::Op(BinOp::Add) => ReduceKind::Add,
        ReduceOp::Op(BinOp::Mul) => ReduceKind::Mul,
        ReduceOp::Op(other) => ReduceKind::Function(other.function_name()),
        ReduceOp::Named(name) => ReduceKind::Function(name.clone()),
    }
}

/// Lowers analyzed items to IR, reaching every parallel construct through a
/// [`Tasker`].
pub struct CodeGen {
    ir: Builder,
    tasker: Box<dyn Tasker>,
    storage: StorageTable,
    runtime_args: Vec<String>,
    validate: bool,
}

impl CodeGen {
    pub fn new(module: &str, tasker: Box<dyn Tasker>) -> Self {
        Self {
            ir: Builder::new(module),
            tasker,
            storage: StorageTable::new(),
            runtime_args: Vec::new(),
            validate: true,
        }
    }

    pub fn with_runtime_args(mut self, args: Vec<String>) -> Self {
        self.runtime_args = args;
        self
    }

    pub fn set_validate(&mut self, on: bool) {
        self.validate = on;
    }

    pub fn module(&self) -> &ModuleIR {
        self.ir.module()
    }

    pub fn into_module(self) -> ModuleIR {
        self.ir.into_module()
    }

    pub fn tasker(&self) -> &dyn Tasker {
        self.tasker.as_ref()
    }

    pub fn storage_depth(&self) -> usize {
        self.storage.depth()
    }

    /// Forgets a generated function or task so that it can be generated again.
    pub fn remove_function(&mut self, name: &str) -> bool {
        let task = self.tasker.tasks_mut().remove(name).is_some();
        self.ir.remove_function(name) || task
    }

    /// Generates one item and returns the name of the IR function it became.
    /// A failure leaves no half-built function or open scope behind.
    pub fn generate(&mut self, item: &Item) -> Result<String, ContraError> {
        let depth = self.storage.depth();
        let functions = self.ir.function_depth();
        let result = match item {
            Item::Prototype(p) => self.gen_prototype(p),
            Item::Function(f) => self.gen_function(f),
            Item::IndexTask(t) => self.gen_index_task(t),
        };
        if let Err(e) = &result {
            debug!(name = %item.name(), error = %e, "generation failed");
            self.storage.unwind_to(depth);
            while self.ir.function_depth() > functions {
                self.ir.abandon_function();
            }
            let is_task = match item {
                Item::Function(f) => f.is_task,
                Item::IndexTask(_) => true,
                Item::Prototype(_) => false,
            };
            if is_task {
                self.tasker.tasks_mut().remove(item.name());
            }
        }
        result
    }

    fn check(&self, name: &str) -> Result<(), ContraError> {
        if !self.validate {
            return Ok(());
        }
        let module = self.ir.module();
        if let Some(f) = module.functions.get(name) {
            validate_function(module, f)?;
        }
        Ok(())
    }

    fn lower_scalar(&self, ty: &VariableType, span: Span) -> Result<Type, ContraError> {
        match ty.builtin_kind() {
            Some(BuiltinKind::I64) => Ok(Type::I64),
            Some(BuiltinKind::F64) => Ok(Type::F64),
            Some(BuiltinKind::Bool) => Ok(Type::Bool),
            Some(BuiltinKind::String) => Ok(Type::Str),
            Some(BuiltinKind::Void) => Ok(Type::Void),
            None => Err(ContraError::implementation(
                format!("type '{ty}' has no lowering"),
                span,
            )),
        }
    }

    fn lower_type(&mut self, ty: &VariableType, span: Span) -> Result<Type, ContraError> {
        if ty.is_range() {
            return self.tasker.range_type(&mut self.ir);
        }
        if ty.is_partition() {
            return self.tasker.partition_type(&mut self.ir);
        }
        if ty.is_field() {
            return self.tasker.field_type(&mut self.ir);
        }
        let scalar = self.lower_scalar(ty, span)?;
        if ty.is_array() {
            Ok(Type::array(scalar))
        } else if ty.is_future() {
            self.tasker.future_type(&mut self.ir, &scalar)
        } else {
            Ok(scalar)
        }
    }

    fn pointee(&self, ptr: ValueId) -> Result<Type, ContraError> {
        match self.ir.type_of(ptr)? {
            Type::Ptr(t) => Ok(*t),
            other => Err(ContraError::implementation(
                format!("expected storage, found a value of type '{}'", other.display()),
                contra_ast::span(0, 0),
            )),
        }
    }

    fn slot_ptr(&mut self, slot: &Slot) -> Result<ValueId, ContraError> {
        match slot {
            Slot::Local(ptr) => Ok(*ptr),
            Slot::Global(name) => Ok(self.ir.global(name)?),
        }
    }

    fn lookup(&mut self, name: &str, span: Span) -> Result<(ValueId, Type), ContraError> {
        let Some(entry) = self.storage.get(name).cloned() else {
            return Err(ContraError::implementation(
                format!("variable '{name}' has no storage"),
                span,
            ));
        };
        let ptr = self.slot_ptr(&entry.slot)?;
        Ok((ptr, entry.ty))
    }

    fn ensure_callable(&mut self, name: &str, span: Span) -> Result<(), ContraError> {
        if self.ir.has_callable(name) || librt::install(&mut self.ir, name)? {
            return Ok(());
        }
        Err(ContraError::implementation(
            format!("function '{name}' has not been generated"),
            span,
        ))
    }

    fn temporary(&mut self, ptr: ValueId) -> Result<(), ContraError> {
        let ty = self.pointee(ptr)?;
        let name = self.storage.insert_temporary(ptr, ty);
        trace!(name = %name, "temporary");
        Ok(())
    }

    fn push_scope(&mut self) {
        self.storage.push_scope();
    }

    /// Pops the innermost storage scope and releases everything it owned.
    fn pop_scope(&mut self) -> Result<(), ContraError> {
        let tasker = &self.tasker;
        let teardown = self.storage.pop_scope(|ty| tasker.kind_of(ty));
        self.destroy(teardown)
    }

    fn slot_ptrs(&mut self, slots: &[Slot]) -> Result<Vec<ValueId>, ContraError> {
        slots.iter().map(|s| self.slot_ptr(s)).collect()
    }

    fn destroy(&mut self, t: Teardown) -> Result<(), ContraError> {
        if t.is_empty() {
            return Ok(());
        }
        debug!(
            arrays = t.arrays.len(),
            futures = t.futures.len(),
            fields = t.fields.len(),
            accessors = t.accessors.len(),
            partitions = t.partitions.len(),
            ranges = t.ranges.len(),
            "scope teardown"
        );
        let arrays = self.slot_ptrs(&t.arrays)?;
        if !arrays.is_empty() {
            self.ensure_callable(librt::DEALLOCATE, contra_ast::span(0, 0))?;
            for a in arrays {
                self.ir.call(librt::DEALLOCATE, vec![a])?;
            }
        }
        let futures = self.slot_ptrs(&t.futures)?;
        self.tasker.destroy_futures(&mut self.ir, &futures)?;
        let fields = self.slot_ptrs(&t.fields)?;
        self.tasker.destroy_fields(&mut self.ir, &fields)?;
        let accessors = self.slot_ptrs(&t.accessors)?;
        self.tasker.destroy_accessors(&mut self.ir, &accessors)?;
        let partitions = self.slot_ptrs(&t.partitions)?;
        self.tasker.destroy_partitions(&mut self.ir, &partitions)?;
        let ranges = self.slot_ptrs(&t.ranges)?;
        self.tasker.destroy_ranges(&mut self.ir, &ranges)
    }

    // Items

    fn gen_prototype(&mut self, p: &Prototype) -> Result<String, ContraError> {
        let mut params = Vec::with_capacity(p.param_types.len());
        for ty in &p.param_types {
            params.push(self.lower_type(ty, p.span)?);
        }
        let ret = self.lower_type(&p.ret_ty, p.span)?;
        self.ir.declare_extern(&p.name.node, params, ret, false)?;
        Ok(p.name.node.clone())
    }

    fn gen_function(&mut self, f: &FunctionDecl) -> Result<String, ContraError> {
        if f.is_task {
            return self.gen_task(f);
        }
        let name = f.proto.name.node.as_str();
        let ret = self.lower_type(&f.proto.ret_ty, f.span)?;
        let mut params = Vec::with_capacity(f.proto.params.len());
        for (p, ty) in f.proto.params.iter().zip(&f.proto.param_types) {
            params.push((p.name.node.clone(), self.lower_type(ty, p.name.span)?));
        }

        let values = self.ir.begin_function(name, f.span, params.clone(), ret.clone());
        if f.top_level && self.tasker.is_started() {
            self.tasker.postregister_tasks(&mut self.ir)?;
        }
        self.push_scope();
        for ((pname, ty), value) in params.into_iter().zip(values) {
            let slot = self.ir.alloca(&pname, ty.clone())?;
            self.ir.store(slot, value)?;
            self.storage
                .insert(&pname, StorageEntry::local(slot, ty, Ownership::Borrowed));
        }

        self.gen_block(&f.body)?;
        let result = self.gen_return(f.ret.as_ref(), &ret)?;
        self.pop_scope()?;
        self.ir.ret(result)?;

        let name = self.ir.finish_function()?;
        self.check(&name)?;
        debug!(name = %name, top_level = f.top_level, "generated function");
        Ok(name)
    }

    fn gen_task(&mut self, f: &FunctionDecl) -> Result<String, ContraError> {
        let name = f.proto.name.node.as_str();
        let mut args = Vec::with_capacity(f.proto.params.len());
        for (p, ty) in f.proto.params.iter().zip(&f.proto.param_types) {
            let ty = self.lower_type(ty, p.name.span)?;
            args.push(TaskArg::new(p.name.node.clone(), ty));
        }
        let ret = self.lower_type(&f.proto.ret_ty, f.span)?;
        let results = if ret == Type::Void { Vec::new() } else { vec![ret.clone()] };

        self.tasker
            .tasks_mut()
            .insert(name, name, false, args.clone(), results.clone());
        let wrapper = self
            .tasker
            .task_preamble(&mut self.ir, name, f.span, &args, false, &results)?;

        self.push_scope();
        for (arg, slot) in args.iter().zip(&wrapper.args) {
            self.storage.insert(
                &arg.name,
                StorageEntry::local(*slot, arg.ty.clone(), Ownership::Borrowed),
            );
        }
        self.gen_block(&f.body)?;
        let result = self.gen_return(f.ret.as_ref(), &ret)?;
        self.pop_scope()?;
        let results: Vec<ValueId> = result.into_iter().collect();
        self.tasker.task_postamble(&mut self.ir, &results)?;

        let name = self.ir.finish_function()?;
        self.check(&name)?;
        debug!(name = %name, backend = self.tasker.name(), "generated task");
        Ok(name)
    }

    fn gen_index_task(&mut self, t: &IndexTaskDecl) -> Result<String, ContraError> {
        let mut args = Vec::with_capacity(t.captures.len());
        for c in &t.captures {
            let name = c.name.node.clone();
            let arg = if c.ty.is_field() {
                TaskArg::new(name, self.tasker.accessor_type(&mut self.ir)?)
            } else if c.partitioned {
                TaskArg::piece(name, self.tasker.partition_type(&mut self.ir)?)
            } else {
                TaskArg::new(name, self.lower_type(&c.ty.value_view(), c.name.span)?)
            };
            args.push(arg);
        }
        let mut results = Vec::with_capacity(t.reductions.len());
        for r in &t.reductions {
            results.push(self.lower_type(&r.ty, r.var.span)?);
        }

        self.tasker
            .tasks_mut()
            .insert(&t.name, &t.name, true, args.clone(), results.clone());
        let wrapper = self
            .tasker
            .task_preamble(&mut self.ir, &t.name, t.span, &args, true, &results)?;
        let Some(index) = wrapper.index else {
            return Err(ContraError::implementation(
                format!("backend '{}' gave index task '{}' no index", self.tasker.name(), t.name),
                t.span,
            ));
        };

        self.push_scope();
        for (arg, slot) in args.iter().zip(&wrapper.args) {
            // A piece arrives as a range rather than the partition it was cut from.
            let ty = self.pointee(*slot)?;
            // Accessors are created per point and released with the body.
            let ownership = if self.tasker.is_accessor(&ty) {
                Ownership::Owned
            } else {
                Ownership::Borrowed
            };
            self.storage
                .insert(&arg.name, StorageEntry::local(*slot, ty, ownership));
        }
        self.storage.insert(
            &t.loop_var.node,
            StorageEntry::local(index, Type::I64, Ownership::Borrowed),
        );

        // Per-point accumulators shadow the captured reduction variables.
        self.push_scope();
        let mut accumulators = Vec::with_capacity(t.reductions.len());
        for (r, ty) in t.reductions.iter().zip(&results) {
            let init = match reduce_kind(&r.op) {
                ReduceKind::Add => self.identity(ty, 0)?,
                ReduceKind::Mul => self.identity(ty, 1)?,
                ReduceKind::Function(_) => {
                    let (captured, _) = self.lookup(&r.var.node, r.var.span)?;
                    self.ir.load(captured)?
                }
            };
            let slot = self.ir.alloca(&r.var.node, ty.clone())?;
            self.ir.store(slot, init)?;
            self.storage.insert(
                &r.var.node,
                StorageEntry::local(slot, ty.clone(), Ownership::Borrowed),
            );
            accumulators.push(slot);
        }

        self.gen_block(&t.body)?;
        let mut values = Vec::with_capacity(accumulators.len());
        for slot in accumulators {
            values.push(self.ir.load(slot)?);
        }
        self.pop_scope()?;
        self.pop_scope()?;
        self.tasker.task_postamble(&mut self.ir, &values)?;

        let name = self.ir.finish_function()?;
        self.check(&name)?;
        debug!(name = %name, captures = args.len(), reductions = values.len(), "generated index task");
        Ok(name)
    }

    fn identity(&mut self, ty: &Type, v: i64) -> Result<ValueId, ContraError> {
        let value = if ty.is_float() {
            self.ir.const_f64(v as f64)?
        } else {
            self.ir.const_i64(v)?
        };
        Ok(value)
    }

    /// Lowers the return expression. Storage handed out by value stops being
    /// owned here so the scope pop does not release it.
    fn gen_return(&mut self, ret: Option<&Expr>, ty: &Type) -> Result<Option<ValueId>, ContraError> {
        let Some(e) = ret else {
            return Ok(None);
        };
        let lowered = self.gen_expr(e)?;
        if *ty == Type::Void {
            return Ok(None);
        }
        if let Lowered::Slot(ptr) = lowered {
            let stored = self.pointee(ptr)?;
            let handed_out = matches!(stored, Type::Array(_))
                || matches!(
                    self.tasker.kind_of(&stored),
                    Some(ResourceKind::Range | ResourceKind::Partition | ResourceKind::Field)
                );
            if handed_out {
                self.storage.release_slot(ptr);
            }
        }
        let value = self.resolve(lowered, &e.ty, e.span)?;
        Ok(Some(value))
    }

    // Statements

    fn gen_block(&mut self, stmts: &[Stmt]) -> Result<(), ContraError> {
        for stmt in stmts {
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), ContraError> {
        match stmt {
            Stmt::Expr(e) => self.gen_expr(e).map(|_| ()),
            Stmt::VarDecl(d) => self.gen_var_decl(d),
            Stmt::Assign(a) => self.gen_assign(a),
            Stmt::If(i) => self.gen_if(i),
            Stmt::For(f) => self.gen_for(f),
            Stmt::Foreach(f) => match &f.lifted {
                Some(task) => self.gen_launch_loop(f, task),
                None => self.gen_for(&f.looping),
            },
            // Only meaningful at a launch; elsewhere evaluated for effect.
            Stmt::Partition(p) => self.gen_expr(&p.part).map(|_| ()),
        }
    }

    fn gen_var_decl(&mut self, d: &VarDecl) -> Result<(), ContraError> {
        self.ir.set_span(d.span);
        let init = self.gen_expr(&d.init)?;
        for name in &d.names {
            self.declare(name, &d.ty, init, &d.init.ty, d.size.as_ref(), d.span)?;
        }
        Ok(())
    }

    fn global_slot(&mut self, name: &str, ty: Type) -> Result<ValueId, ContraError> {
        self.ir.declare_global(name, ty.clone());
        self.storage.insert_global(name, ty);
        Ok(self.ir.global(name)?)
    }

    fn new_slot(&mut self, name: &str, ty: &Type, global: bool) -> Result<ValueId, ContraError> {
        if global {
            self.global_slot(name, ty.clone())
        } else {
            Ok(self.ir.alloca(name, ty.clone())?)
        }
    }

    fn bind(&mut self, name: &str, ptr: ValueId, ty: Type, global: bool, ownership: Ownership) {
        // Globals were registered when their slot was declared.
        if !global {
            self.storage
                .insert(name, StorageEntry::local(ptr, ty, ownership));
        }
    }

    /// Takes over an owned temporary instead of copying it.
    fn adopt(&mut self, name: &str, src: ValueId, ty: Type, global: bool) -> Result<(), ContraError> {
        trace!(name, global, "adopt temporary");
        if global {
            let dst = self.global_slot(name, ty)?;
            self.ir.memcopy(dst, src)?;
            self.storage.release_slot(src);
            return Ok(());
        }
        if let Some(mut entry) = self.storage.take_temporary(src) {
            entry.ownership = Ownership::Owned;
            self.storage.insert(name, entry);
        }
        Ok(())
    }

    fn declare(
        &mut self,
        name: &Ident,
        ty: &VariableType,
        init: Lowered,
        init_ty: &VariableType,
        size: Option<&Expr>,
        span: Span,
    ) -> Result<(), ContraError> {
        let global = ty.is_global();
        if ty.is_field() {
            return self.declare_field(name, ty, init, init_ty, size, span);
        }
        let stored = self.lower_type(ty, span)?;
        if let Type::Array(elem) = &stored {
            let elem = (**elem).clone();
            return self.declare_array(name, stored, elem, global, init, init_ty, size, span);
        }

        if let Lowered::Slot(src) = init {
            if self.pointee(src)? == stored && self.storage.is_temporary(src) {
                return self.adopt(&name.node, src, stored, global);
            }
        }

        match self.tasker.kind_of(&stored) {
            Some(ResourceKind::Future) => {
                let value = self.lower_scalar(ty, span)?;
                let future = if global {
                    self.global_slot(&name.node, stored.clone())?
                } else {
                    self.tasker.create_future(&mut self.ir, &name.node, &value)?
                };
                match init {
                    Lowered::Slot(src) if self.tasker.is_future(&self.pointee(src)?) => {
                        self.tasker.copy_future(&mut self.ir, src, future)?;
                    }
                    other => {
                        let v = self.resolve(other, init_ty, span)?;
                        self.tasker.to_future(&mut self.ir, v, future)?;
                    }
                }
                self.bind(&name.node, future, stored, global, Ownership::Owned);
            }
            Some(ResourceKind::Range | ResourceKind::Partition) => {
                // Shares a handle some other variable owns.
                let Lowered::Slot(src) = init else {
                    return Err(ContraError::implementation(
                        format!("'{}' needs a handle to be initialized from", name.node),
                        span,
                    ));
                };
                let slot = self.new_slot(&name.node, &stored, global)?;
                let handle = self.ir.load(src)?;
                self.ir.store(slot, handle)?;
                self.bind(&name.node, slot, stored, global, Ownership::Borrowed);
            }
            Some(kind @ (ResourceKind::Field | ResourceKind::Accessor)) => {
                return Err(ContraError::implementation(
                    format!("cannot declare '{}' as a bare {kind:?}", name.node),
                    span,
                ));
            }
            None => {
                let v = self.resolve(init, init_ty, span)?;
                let slot = self.new_slot(&name.node, &stored, global)?;
                self.ir.store(slot, v)?;
                self.bind(&name.node, slot, stored, global, Ownership::Owned);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn declare_array(
        &mut self,
        name: &Ident,
        stored: Type,
        elem: Type,
        global: bool,
        init: Lowered,
        init_ty: &VariableType,
        size: Option<&Expr>,
        span: Span,
    ) -> Result<(), ContraError> {
        match init {
            Lowered::Slot(src) if matches!(self.pointee(src)?, Type::Array(_)) => {
                if self.storage.is_temporary(src) {
                    return self.adopt(&name.node, src, stored, global);
                }
                let dst = self.new_slot(&name.node, &stored, global)?;
                let len_ptr = self.ir.field_ptr(src, 1)?;
                let len = self.ir.load(len_ptr)?;
                self.allocate_array(dst, len, &elem)?;
                self.ensure_callable(librt::COPY, span)?;
                self.ir.call(librt::COPY, vec![src, dst])?;
                self.bind(&name.node, dst, stored, global, Ownership::Owned);
            }
            other => {
                // A scalar initializer is broadcast.
                let v = self.resolve(other, init_ty, span)?;
                let len = match size {
                    Some(s) => self.value_of(s)?,
                    None => self.ir.const_i64(1)?,
                };
                let dst = self.new_slot(&name.node, &stored, global)?;
                self.allocate_array(dst, len, &elem)?;
                self.fill_array(dst, len, v)?;
                self.bind(&name.node, dst, stored, global, Ownership::Owned);
            }
        }
        Ok(())
    }

    fn declare_field(
        &mut self,
        name: &Ident,
        ty: &VariableType,
        init: Lowered,
        init_ty: &VariableType,
        size: Option<&Expr>,
        span: Span,
    ) -> Result<(), ContraError> {
        let value = self.lower_scalar(ty, span)?;
        let Some(size) = size else {
            return Err(ContraError::implementation(
                format!("field '{}' has no extent", name.node),
                span,
            ));
        };
        let extent = if size.ty.is_range() {
            let lowered = self.gen_expr(size)?;
            self.spill(lowered, size.span)?
        } else {
            self.value_of(size)?
        };
        let v = self.resolve(init, init_ty, span)?;
        let stored = self.tasker.field_type(&mut self.ir)?;
        let field = if ty.is_global() {
            let slot = self.global_slot(&name.node, stored.clone())?;
            self.tasker
                .init_field(&mut self.ir, slot, &name.node, &value, extent, Some(v))?;
            slot
        } else {
            self.tasker
                .create_field(&mut self.ir, &name.node, &value, extent, Some(v))?
        };
        self.bind(&name.node, field, stored, ty.is_global(), Ownership::Owned);
        Ok(())
    }

    fn allocate_array(&mut self, dst: ValueId, len: ValueId, elem: &Type) -> Result<(), ContraError> {
        self.ensure_callable(librt::ALLOCATE, contra_ast::span(0, 0))?;
        let bytes = self.ir.size_of(elem.clone())?;
        self.ir.call(librt::ALLOCATE, vec![len, bytes, dst])?;
        Ok(())
    }

    /// Stores `value` into each of the first `len` elements.
    fn fill_array(&mut self, dst: ValueId, len: ValueId, value: ValueId) -> Result<(), ContraError> {
        let counter = self.ir.alloca("__i", Type::I64)?;
        let zero = self.ir.const_i64(0)?;
        self.ir.store(counter, zero)?;
        let head = self.ir.append_block("fill.cond")?;
        let body = self.ir.append_block("fill.body")?;
        let done = self.ir.append_block("fill.done")?;
        self.ir.br(head)?;

        self.ir.position_at_end(head)?;
        let i = self.ir.load(counter)?;
        let more = self.ir.binary(contra_ir::BinOp::Lt, i, len)?;
        self.ir.cond_br(more, body, done)?;

        self.ir.position_at_end(body)?;
        let elem = self.ir.element_ptr(dst, i)?;
        self.ir.store(elem, value)?;
        let one = self.ir.const_i64(1)?;
        let next = self.ir.binary(contra_ir::BinOp::Add, i, one)?;
        self.ir.store(counter, next)?;
        self.ir.br(head)?;

        self.ir.position_at_end(done)?;
        Ok(())
    }

    fn gen_assign(&mut self, a: &AssignStmt) -> Result<(), ContraError> {
        self.ir.set_span(a.span);
        let ExprKind::Var(lhs) = &a.lhs.kind else {
            return Err(ContraError::implementation(
                "assignment destination is not a variable",
                a.lhs.span,
            ));
        };
        let rhs = self.gen_expr(&a.rhs)?;
        if a.declares {
            return self.declare(&lhs.name, &a.lhs.ty, rhs, &a.rhs.ty, None, a.span);
        }

        let (ptr, stored) = self.lookup(&lhs.name.node, lhs.name.span)?;
        let kind = self.tasker.kind_of(&stored);

        if let Some(index) = &lhs.index {
            let idx = self.value_of(index)?;
            let v = self.resolve(rhs, &a.rhs.ty, a.span)?;
            return match (kind, &stored) {
                (Some(ResourceKind::Accessor), _) => {
                    self.tasker.store_accessor(&mut self.ir, ptr, v, Some(idx))
                }
                (Some(ResourceKind::Field), _) => {
                    let value = self.ir.type_of(v)?;
                    self.tasker.destroy_field(&mut self.ir, ptr)?;
                    self.tasker
                        .init_field(&mut self.ir, ptr, &lhs.name.node, &value, idx, Some(v))
                }
                (_, Type::Array(_)) => {
                    let elem = self.ir.element_ptr(ptr, idx)?;
                    Ok(self.ir.store(elem, v)?)
                }
                _ => Err(ContraError::implementation(
                    format!("cannot index into '{}'", lhs.name.node),
                    a.span,
                )),
            };
        }

        match (kind, &stored) {
            (_, Type::Array(_)) => {
                let Lowered::Slot(src) = rhs else {
                    return Err(ContraError::implementation(
                        format!("array '{}' assigned from a non-array", lhs.name.node),
                        a.span,
                    ));
                };
                self.ensure_callable(librt::COPY, a.span)?;
                self.ir.call(librt::COPY, vec![src, ptr])?;
            }
            (Some(ResourceKind::Future), _) => match rhs {
                Lowered::Slot(src) if self.tasker.is_future(&self.pointee(src)?) => {
                    self.tasker.copy_future(&mut self.ir, src, ptr)?;
                }
                other => {
                    let v = self.resolve(other, &a.rhs.ty, a.span)?;
                    self.tasker.to_future(&mut self.ir, v, ptr)?;
                }
            },
            (Some(ResourceKind::Accessor), _) => {
                let v = self.resolve(rhs, &a.rhs.ty, a.span)?;
                self.tasker.store_accessor(&mut self.ir, ptr, v, None)?;
            }
            (Some(kind @ (ResourceKind::Range | ResourceKind::Partition | ResourceKind::Field)), _) => {
                let Lowered::Slot(src) = rhs else {
                    return Err(ContraError::implementation(
                        format!("'{}' assigned from a non-handle", lhs.name.node),
                        a.span,
                    ));
                };
                self.replace_handle(&lhs.name.node, kind, ptr, src)?;
            }
            (None, _) => {
                let v = self.resolve(rhs, &a.rhs.ty, a.span)?;
                self.ir.store(ptr, v)?;
            }
        }
        Ok(())
    }

    /// Points a range, partition or field variable at another handle. A
    /// temporary hands its resource over; anything else is only borrowed.
    fn replace_handle(
        &mut self,
        name: &str,
        kind: ResourceKind,
        ptr: ValueId,
        src: ValueId,
    ) -> Result<(), ContraError> {
        let owned = self.storage.get(name).map(|e| e.ownership) == Some(Ownership::Owned);
        if owned {
            match kind {
                ResourceKind::Range => self.tasker.destroy_range(&mut self.ir, ptr)?,
                ResourceKind::Partition => self.tasker.destroy_partition(&mut self.ir, ptr)?,
                ResourceKind::Field => self.tasker.destroy_field(&mut self.ir, ptr)?,
                ResourceKind::Future | ResourceKind::Accessor => {}
            }
        }
        let handle = self.ir.load(src)?;
        self.ir.store(ptr, handle)?;
        if self.storage.is_temporary(src) {
            self.storage.release_slot(src);
        } else {
            self.storage.demote(name);
        }
        Ok(())
    }

    fn gen_if(&mut self, i: &IfStmt) -> Result<(), ContraError> {
        let cond = self.value_of(&i.cond)?;
        let then_bb = self.ir.append_block("then")?;
        let else_bb = self.ir.append_block("else")?;
        let merge = self.ir.append_block("ifcont")?;
        self.ir.cond_br(cond, then_bb, else_bb)?;

        for (bb, body) in [(then_bb, &i.then_body), (else_bb, &i.else_body)] {
            self.ir.position_at_end(bb)?;
            self.push_scope();
            self.gen_block(body)?;
            self.pop_scope()?;
            if !self.ir.is_terminated() {
                self.ir.br(merge)?;
            }
        }
        self.ir.position_at_end(merge)?;
        Ok(())
    }

    fn gen_for(&mut self, f: &ForStmt) -> Result<(), ContraError> {
        self.ir.set_span(f.span);
        self.push_scope();
        let var = self.ir.alloca(&f.var.node, Type::I64)?;
        self.storage.insert(
            &f.var.node,
            StorageEntry::local(var, Type::I64, Ownership::Borrowed),
        );

        let head = self.ir.append_block("beforeloop")?;
        let body = self.ir.append_block("loop")?;
        let incr = self.ir.append_block("incr")?;
        let after = self.ir.append_block("afterloop")?;

        match &f.bounds {
            LoopBounds::Counted {
                start,
                end,
                step,
                inclusive,
            } => {
                let start = self.value_of(start)?;
                let end = self.value_of(end)?;
                let step = match step {
                    Some(s) => self.value_of(s)?,
                    None => self.ir.const_i64(1)?,
                };
                self.ir.store(var, start)?;
                self.ir.br(head)?;

                self.ir.position_at_end(head)?;
                let i = self.ir.load(var)?;
                let cmp = if *inclusive {
                    contra_ir::BinOp::Le
                } else {
                    contra_ir::BinOp::Lt
                };
                let more = self.ir.binary(cmp, i, end)?;
                self.ir.cond_br(more, body, after)?;

                self.ir.position_at_end(body)?;
                self.gen_loop_body(&f.body, incr)?;

                self.ir.position_at_end(incr)?;
                let i = self.ir.load(var)?;
                let next = self.ir.binary(contra_ir::BinOp::Add, i, step)?;
                self.ir.store(var, next)?;
                self.ir.br(head)?;
            }
            LoopBounds::Over(r) => {
                let lowered = self.gen_expr(r)?;
                let range = self.spill(lowered, r.span)?;
                let size = self.tasker.range_size(&mut self.ir, range)?;
                let counter = self.ir.alloca("__idx", Type::I64)?;
                let zero = self.ir.const_i64(0)?;
                self.ir.store(counter, zero)?;
                self.ir.br(head)?;

                self.ir.position_at_end(head)?;
                let k = self.ir.load(counter)?;
                let more = self.ir.binary(contra_ir::BinOp::Lt, k, size)?;
                self.ir.cond_br(more, body, after)?;

                self.ir.position_at_end(body)?;
                let point = self.tasker.load_range_value(&mut self.ir, range, k)?;
                self.ir.store(var, point)?;
                self.gen_loop_body(&f.body, incr)?;

                self.ir.position_at_end(incr)?;
                let k = self.ir.load(counter)?;
                let one = self.ir.const_i64(1)?;
                let next = self.ir.binary(contra_ir::BinOp::Add, k, one)?;
                self.ir.store(counter, next)?;
                self.ir.br(head)?;
            }
        }

        self.ir.position_at_end(after)?;
        self.pop_scope()
    }

    fn gen_loop_body(&mut self, stmts: &[Stmt], incr: contra_ir::BlockId) -> Result<(), ContraError> {
        self.push_scope();
        self.gen_block(stmts)?;
        self.pop_scope()?;
        if !self.ir.is_terminated() {
            self.ir.br(incr)?;
        }
        Ok(())
    }

    /// Launches a lifted loop as one index task over its range, handing over
    /// every variable the body touches.
    fn gen_launch_loop(&mut self, f: &ForeachStmt, task: &str) -> Result<(), ContraError> {
        let span = f.looping.span;
        self.ir.set_span(span);
        self.push_scope();

        let range = match &f.looping.bounds {
            LoopBounds::Counted {
                start,
                end,
                step,
                inclusive,
            } => {
                let start = self.value_of(start)?;
                let mut end = self.value_of(end)?;
                if !inclusive {
                    let one = self.ir.const_i64(1)?;
                    end = self.ir.binary(contra_ir::BinOp::Sub, end, one)?;
                }
                let step = match step {
                    Some(s) => Some(self.value_of(s)?),
                    None => None,
                };
                let range = self
                    .tasker
                    .create_range(&mut self.ir, "__launch", start, end, step)?;
                self.temporary(range)?;
                range
            }
            LoopBounds::Over(r) => {
                let lowered = self.gen_expr(r)?;
                self.spill(lowered, r.span)?
            }
        };

        let mut partitions: HashMap<&str, ValueId> = HashMap::new();
        for stmt in &f.looping.body {
            if let Stmt::Partition(p) = stmt {
                let lowered = self.gen_expr(&p.part)?;
                let part = self.spill(lowered, p.span)?;
                for target in &p.targets {
                    partitions.insert(target.node.as_str(), part);
                }
            }
        }

        let task = self.tasker.get_task(task, span)?;
        let mut args = Vec::with_capacity(f.accessed.len());
        for acc in &f.accessed {
            let (ptr, _) = self.lookup(&acc.name, span)?;
            args.push(LaunchArg {
                value: ptr,
                partition: partitions.get(acc.name.as_str()).copied(),
            });
        }
        let mut reductions = Vec::with_capacity(f.reduction_defs.len());
        for r in &f.reduction_defs {
            let (slot, ty) = self.lookup(&r.var.node, r.var.span)?;
            let op = reduce_kind(&r.op);
            if let ReduceKind::Function(name) = &op {
                self.ensure_callable(name, r.var.span)?;
            }
            reductions.push(ReductionTarget {
                name: r.var.node.clone(),
                slot,
                op,
                ty,
            });
        }

        debug!(
            task = %task.name,
            args = args.len(),
            partitioned = partitions.len(),
            reductions = reductions.len(),
            "index launch"
        );
        self.tasker.launch(
            &mut self.ir,
            Launch {
                task,
                args,
                range: Some(range),
                reductions,
                span,
            },
        )?;
        self.pop_scope()
    }

    // Expressions

    /// Gives a lowered expression an address, copying a bare value into a
    /// fresh slot when needed.
    fn spill(&mut self, lowered: Lowered, span: Span) -> Result<ValueId, ContraError> {
        match lowered {
            Lowered::Slot(ptr) => Ok(ptr),
            Lowered::Value(v) => {
                let ty = self.ir.type_of(v)?;
                let slot = self.ir.alloca("__spill", ty)?;
                self.ir.store(slot, v)?;
                Ok(slot)
            }
            Lowered::Void => Err(ContraError::implementation(
                "expression produces no value",
                span,
            )),
        }
    }

    fn value_of(&mut self, e: &Expr) -> Result<ValueId, ContraError> {
        let lowered = self.gen_expr(e)?;
        self.resolve(lowered, &e.ty, e.span)
    }

    /// Turns a lowered expression into a plain value, waiting on futures and
    /// reading through accessors.
    fn resolve(&mut self, lowered: Lowered, ty: &VariableType, span: Span) -> Result<ValueId, ContraError> {
        match lowered {
            Lowered::Value(v) => Ok(v),
            Lowered::Slot(ptr) => {
                let stored = self.pointee(ptr)?;
                match self.tasker.kind_of(&stored) {
                    Some(ResourceKind::Future) => {
                        let value = self.lower_scalar(ty, span)?;
                        self.tasker.load_future(&mut self.ir, ptr, &value)
                    }
                    Some(ResourceKind::Accessor) => {
                        let value = self.lower_scalar(ty, span)?;
                        self.tasker.load_accessor(&mut self.ir, ptr, &value, None)
                    }
                    _ => Ok(self.ir.load(ptr)?),
                }
            }
            Lowered::Void => Err(ContraError::implementation(
                "expression produces no value",
                span,
            )),
        }
    }

    fn gen_expr(&mut self, e: &Expr) -> Result<Lowered, ContraError> {
        self.ir.set_span(e.span);
        let lowered = match &e.kind {
            ExprKind::Int(v) => Lowered::Value(self.ir.const_i64(*v)?),
            ExprKind::Real(v) => Lowered::Value(self.ir.const_f64(*v)?),
            ExprKind::Str(s) => Lowered::Value(self.ir.const_str(s)?),
            ExprKind::Bool(b) => Lowered::Value(self.ir.const_bool(*b)?),
            ExprKind::Var(v) => self.gen_var(v, e)?,
            ExprKind::Array(a) => {
                let elem = self.lower_scalar(&e.ty, e.span)?;
                let len = match &a.size {
                    Some(s) => self.value_of(s)?,
                    None => self.ir.const_i64(a.elems.len() as i64)?,
                };
                let slot = self.ir.alloca("__array", Type::array(elem.clone()))?;
                self.allocate_array(slot, len, &elem)?;
                if a.size.is_some() {
                    let Some(first) = a.elems.first() else {
                        return Err(ContraError::implementation("sized array has no value", e.span));
                    };
                    let v = self.value_of(first)?;
                    self.fill_array(slot, len, v)?;
                } else {
                    for (i, elem) in a.elems.iter().enumerate() {
                        let v = self.value_of(elem)?;
                        let idx = self.ir.const_i64(i as i64)?;
                        let ptr = self.ir.element_ptr(slot, idx)?;
                        self.ir.store(ptr, v)?;
                    }
                }
                self.temporary(slot)?;
                Lowered::Slot(slot)
            }
            ExprKind::Range(r) => self.gen_range(r)?,
            ExprKind::Cast(c) => {
                let v = self.value_of(&c.expr)?;
                let to = self.lower_scalar(&e.ty, e.span)?;
                Lowered::Value(self.ir.cast(v, to)?)
            }
            ExprKind::Unary(u) => {
                let v = self.value_of(&u.operand)?;
                match u.op {
                    UnaryOp::Neg => Lowered::Value(self.ir.unary(contra_ir::UnaryOp::Neg, v)?),
                    UnaryOp::Plus => Lowered::Value(v),
                    UnaryOp::User(_) => self.call_function(&u.op.function_name(), vec![v], e.span)?,
                }
            }
            ExprKind::Binary(b) => {
                let l = self.value_of(&b.lhs)?;
                let r = self.value_of(&b.rhs)?;
                let op = match b.op {
                    BinOp::Add => contra_ir::BinOp::Add,
                    BinOp::Sub => contra_ir::BinOp::Sub,
                    BinOp::Mul => contra_ir::BinOp::Mul,
                    BinOp::Div => contra_ir::BinOp::Div,
                    BinOp::Mod => contra_ir::BinOp::Rem,
                    BinOp::Eq => contra_ir::BinOp::Eq,
                    BinOp::Ne => contra_ir::BinOp::Ne,
                    BinOp::Lt => contra_ir::BinOp::Lt,
                    BinOp::Gt => contra_ir::BinOp::Gt,
                    BinOp::Le => contra_ir::BinOp::Le,
                    BinOp::Ge => contra_ir::BinOp::Ge,
                    BinOp::User(_) => {
                        return self.call_function(&b.op.function_name(), vec![l, r], e.span);
                    }
                };
                Lowered::Value(self.ir.binary(op, l, r)?)
            }
            ExprKind::Call(c) => self.gen_call(c, e)?,
        };
        Ok(lowered)
    }

    fn gen_var(&mut self, v: &VarRef, e: &Expr) -> Result<Lowered, ContraError> {
        let (ptr, stored) = self.lookup(&v.name.node, v.name.span)?;
        let Some(index) = &v.index else {
            return Ok(Lowered::Slot(ptr));
        };
        let idx = self.value_of(index)?;
        match (self.tasker.kind_of(&stored), &stored) {
            (Some(ResourceKind::Accessor), _) => {
                let value = self.lower_scalar(&e.ty, e.span)?;
                let v = self
                    .tasker
                    .load_accessor(&mut self.ir, ptr, &value, Some(idx))?;
                Ok(Lowered::Value(v))
            }
            (Some(ResourceKind::Field), _) => Err(ContraError::implementation(
                format!("field '{}' can only be read inside a parallel loop", v.name.node),
                e.span,
            )),
            (_, Type::Array(_)) => {
                let elem = self.ir.element_ptr(ptr, idx)?;
                Ok(Lowered::Value(self.ir.load(elem)?))
            }
            _ => Err(ContraError::implementation(
                format!("cannot index into '{}'", v.name.node),
                e.span,
            )),
        }
    }

    fn gen_range(&mut self, r: &RangeLit) -> Result<Lowered, ContraError> {
        let start = self.value_of(&r.start)?;
        let end = self.value_of(&r.end)?;
        let step = match &r.step {
            Some(s) => Some(self.value_of(s)?),
            None => None,
        };
        let range = self
            .tasker
            .create_range(&mut self.ir, "__range", start, end, step)?;
        self.temporary(range)?;
        Ok(Lowered::Slot(range))
    }

    fn call_function(&mut self, name: &str, args: Vec<ValueId>, span: Span) -> Result<Lowered, ContraError> {
        self.ensure_callable(name, span)?;
        Ok(match self.ir.call(name, args)? {
            Some(v) => Lowered::Value(v),
            None => Lowered::Void,
        })
    }

    fn gen_call(&mut self, c: &CallExpr, e: &Expr) -> Result<Lowered, ContraError> {
        let span = e.span;
        match c.callee.node.as_str() {
            librt::LEN => return self.gen_len(c, span),
            librt::PART => return self.gen_part(c, span),
            _ => {}
        }
        if c.top_level_task {
            return self.start_runtime(&c.callee);
        }
        if c.task {
            return self.launch_task(c, e);
        }
        let mut args = Vec::with_capacity(c.args.len());
        for arg in &c.args {
            args.push(self.value_of(arg)?);
        }
        self.call_function(&c.callee.node, args, span)
    }

    fn gen_len(&mut self, c: &CallExpr, span: Span) -> Result<Lowered, ContraError> {
        let Some(arg) = c.args.first() else {
            return Err(ContraError::implementation("'len' without an argument", span));
        };
        let lowered = self.gen_expr(arg)?;
        let ptr = self.spill(lowered, arg.span)?;
        let stored = self.pointee(ptr)?;
        if self.tasker.is_range(&stored) {
            return Ok(Lowered::Value(self.tasker.range_size(&mut self.ir, ptr)?));
        }
        if matches!(stored, Type::Array(_)) {
            let len = self.ir.field_ptr(ptr, 1)?;
            return Ok(Lowered::Value(self.ir.load(len)?));
        }
        Err(ContraError::implementation(
            format!("'len' of '{}'", stored.display()),
            span,
        ))
    }

    fn gen_part(&mut self, c: &CallExpr, span: Span) -> Result<Lowered, ContraError> {
        let [range, colors] = c.args.as_slice() else {
            return Err(ContraError::implementation("'part' takes two arguments", span));
        };
        let lowered = self.gen_expr(range)?;
        let range = self.spill(lowered, range.span)?;
        let by_count = colors.ty.value_view().is_int();
        let colors = if by_count {
            self.value_of(colors)?
        } else {
            let lowered = self.gen_expr(colors)?;
            self.spill(lowered, colors.span)?
        };
        let part = self
            .tasker
            .partition(&mut self.ir, range, colors, by_count)?;
        self.temporary(part)?;
        Ok(Lowered::Slot(part))
    }

    /// Registers every task, names the entry task and hands control to the
    /// runtime. Runs once per program.
    fn start_runtime(&mut self, entry: &Ident) -> Result<Lowered, ContraError> {
        let task = self.tasker.get_task(&entry.node, entry.span)?;
        debug!(task = %task.name, backend = self.tasker.name(), tasks = self.tasker.tasks().len(), "start runtime");
        self.tasker.preregister_tasks(&mut self.ir)?;
        self.tasker.set_top_level_task(&mut self.ir, &task)?;
        self.tasker.start(&mut self.ir, &self.runtime_args)?;
        self.tasker.stop(&mut self.ir)?;
        Ok(Lowered::Void)
    }

    fn launch_task(&mut self, c: &CallExpr, e: &Expr) -> Result<Lowered, ContraError> {
        let task = self.tasker.get_task(&c.callee.node, c.callee.span)?;
        let mut args = Vec::with_capacity(c.args.len());
        for arg in &c.args {
            let mut lowered = self.gen_expr(arg)?;
            if let Lowered::Slot(ptr) = lowered {
                // A task is handed the value at the current point, not the accessor.
                if self.tasker.is_accessor(&self.pointee(ptr)?) {
                    lowered = Lowered::Value(self.resolve(lowered, &arg.ty, arg.span)?);
                }
            }
            args.push(LaunchArg {
                value: self.spill(lowered, arg.span)?,
                partition: None,
            });
        }
        debug!(task = %task.name, args = args.len(), "launch");
        let future = self.tasker.launch(
            &mut self.ir,
            Launch {
                task,
                args,
                range: None,
                reductions: Vec::new(),
                span: e.span,
            },
        )?;
        let Some(future) = future else {
            return Ok(Lowered::Void);
        };
        self.temporary(future)?;
        if e.ty.is_future() {
            return Ok(Lowered::Slot(future));
        }
        let value = self.lower_scalar(&e.ty, e.span)?;
        let v = self.tasker.load_future(&mut self.ir, future, &value)?;
        Ok(Lowered::Value(v))
    }
}
