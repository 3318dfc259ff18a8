use contra_ast::{
    AssignStmt, BinOp, CallExpr, ContraError, Expr, ExprKind, ForStmt, ForeachStmt, FunctionDecl,
    Ident, IfStmt, IndexTaskDecl, Item, LoopBounds, PartitionStmt, ProtoKind, Prototype,
    ReduceOp, ReductionDef, Shape, Span, Stmt, TypeAnnot, UnaryOp, VarDecl, VariableType,
};
use tracing::{debug, trace};

use crate::librt;
use crate::precedence::BinopPrecedence;
use crate::symbols::{Context, FunctionDef};

/// Wraps `inner` in an inserted cast to `to`.
fn insert_cast(inner: Expr, to: VariableType) -> Expr {
    Expr {
        span: inner.span,
        ty: to,
        kind: ExprKind::Cast(contra_ast::CastExpr {
            target: None,
            expr: Box::new(inner),
        }),
    }
}

fn cast_in_place(slot: &mut Expr, to: VariableType) {
    let inner = slot.take();
    *slot = insert_cast(inner, to);
}

/// Resolves names, attaches a type to every node and inserts casts.
pub struct Analyzer {
    cx: Context,
    precedence: BinopPrecedence,
    have_top_level_task: bool,
    /// The function being checked is a task, so its parallel loops are lifted.
    in_task: bool,
    /// First frame of each enclosing lifted loop body, outermost first.
    loops: Vec<usize>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            cx: Context::new(),
            precedence: BinopPrecedence::default(),
            have_top_level_task: false,
            in_task: false,
            loops: Vec::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.cx
    }

    pub fn precedence(&self) -> &BinopPrecedence {
        &self.precedence
    }

    pub fn have_top_level_task(&self) -> bool {
        self.have_top_level_task
    }

    /// Forgets a function so that it can be declared again.
    pub fn remove_function(&mut self, name: &str) -> bool {
        self.cx.erase_function(name).is_some()
    }

    /// Analyzes one item in place. On failure the symbol tables are left as
    /// they were before the call.
    pub fn analyze(&mut self, item: &mut Item) -> Result<(), ContraError> {
        let depth = self.cx.depth();
        let had_top_level_task = self.have_top_level_task;
        let name = item.name().to_string();
        let previous = self.cx.find_function(&name).cloned();

        let result = match item {
            Item::Prototype(p) => self.check_prototype(p, false, true).map(|_| ()),
            Item::Function(f) => self.check_function(f),
            Item::IndexTask(t) => self.check_index_task(t),
        };

        match &result {
            Ok(()) => debug!(name = %name, "analyzed"),
            Err(e) => {
                debug!(name = %name, error = %e, "analysis failed");
                self.cx.unwind_to(depth);
                self.have_top_level_task = had_top_level_task;
                self.in_task = false;
                self.loops.clear();
                if !matches!(item, Item::IndexTask(_)) {
                    self.cx.erase_function(&name);
                    if let Some(prev) = previous {
                        self.cx.insert_function(prev)?;
                    }
                }
            }
        }
        result
    }

    fn resolve_annot(&self, annot: &TypeAnnot) -> Result<VariableType, ContraError> {
        let base = VariableType::new(self.cx.get_type(&annot.name, annot.span)?);
        Ok(match annot.shape {
            Shape::Scalar => base,
            Shape::Array => base.with_array(true),
            Shape::Field => base.with_field(true),
        })
    }

    /// A field declared outside the enclosing lifted loop is reached through
    /// an accessor, one element per point.
    fn through_accessor(&self, name: &str, ty: &VariableType) -> bool {
        match (self.loops.first(), self.cx.variable_depth(name)) {
            (Some(&body), Some(depth)) => ty.is_field() && depth < body,
            _ => false,
        }
    }

    fn check_castable(&self, from: &VariableType, to: &VariableType, span: Span) -> Result<(), ContraError> {
        if from.is_castable_to(to) {
            Ok(())
        } else {
            Err(ContraError::type_error(
                format!("cannot cast from type '{from}' to type '{to}'"),
                span,
            ))
        }
    }

    fn check_assignable(&self, left: &VariableType, right: &VariableType, span: Span) -> Result<(), ContraError> {
        if right.is_assignable_to(left) {
            Ok(())
        } else {
            Err(ContraError::type_error(
                format!(
                    "a variable of type '{right}' cannot be assigned to a variable of type '{left}'"
                ),
                span,
            ))
        }
    }

    fn check_prototype(
        &mut self,
        p: &mut Prototype,
        is_task: bool,
        declared_only: bool,
    ) -> Result<FunctionDef, ContraError> {
        let mut params = Vec::with_capacity(p.params.len());
        for param in &p.params {
            params.push(self.resolve_annot(&param.annot)?);
        }
        let ret = match &p.ret {
            Some(annot) => self.resolve_annot(annot)?,
            None => self.cx.builtins().void(),
        };
        p.param_types = params.clone();
        p.ret_ty = ret.clone();

        let def = FunctionDef {
            name: p.name.node.clone(),
            span: p.name.span,
            params,
            ret,
            is_task,
            variadic: false,
            declared_only,
        };

        // A definition may complete an earlier matching declaration.
        if let Some(existing) = self.cx.find_function(&def.name) {
            let completes = existing.declared_only
                && !declared_only
                && existing.params == def.params
                && existing.ret == def.ret;
            if completes {
                self.cx.erase_function(&def.name);
            }
        }
        self.cx.insert_function(def.clone())?;
        Ok(def)
    }

    fn check_function(&mut self, f: &mut FunctionDecl) -> Result<(), ContraError> {
        let created_scope = !f.top_level;
        if created_scope {
            self.cx.push_scope();
        }

        let def = if f.top_level {
            // Anonymous top-level code is never callable, so it is not registered.
            FunctionDef {
                name: f.proto.name.node.clone(),
                span: f.proto.span,
                params: Vec::new(),
                ret: self.cx.builtins().void(),
                is_task: f.is_task,
                variadic: false,
                declared_only: false,
            }
        } else {
            self.check_prototype(&mut f.proto, f.is_task, false)?
        };

        if let ProtoKind::BinaryOp { op, precedence } = f.proto.kind {
            self.precedence.insert(op, precedence);
        }

        f.param_defs.clear();
        for (param, ty) in f.proto.params.iter().zip(&def.params) {
            let var = self.cx.insert_variable(&param.name, ty.clone())?;
            f.param_defs.push(var.id);
        }

        let outer = std::mem::replace(&mut self.in_task, f.is_task);
        self.check_block(&mut f.body)?;
        self.in_task = outer;

        match &mut f.ret {
            Some(ret) => {
                let ret_ty = self.infer_expr(ret, None)?;
                if f.proto.is_anonymous() {
                    f.proto.ret_ty = ret_ty.value_view();
                } else if ret_ty.value_view() != def.ret {
                    return Err(ContraError::type_error(
                        format!(
                            "function return type does not match prototype for '{}': the type '{ret_ty}' cannot be converted to the type '{}'",
                            def.name, def.ret
                        ),
                        ret.span,
                    ));
                }
            }
            None if !def.ret.is_void() && !f.proto.is_anonymous() => {
                return Err(ContraError::type_error(
                    format!("function '{}' must return a value of type '{}'", def.name, def.ret),
                    f.span,
                ));
            }
            None => {
                if f.proto.is_anonymous() {
                    f.proto.ret_ty = self.cx.builtins().void();
                }
            }
        }

        if created_scope {
            self.cx.pop_scope();
        }
        Ok(())
    }

    fn check_index_task(&mut self, t: &mut IndexTaskDecl) -> Result<(), ContraError> {
        self.cx.push_scope();
        for capture in &mut t.captures {
            let var = self.cx.insert_variable(&capture.name, capture.ty.clone())?;
            capture.def = Some(var.id);
        }
        let int = self.cx.builtins().int();
        let index = self.cx.insert_variable(&t.loop_var, int)?;
        t.loop_def = Some(index.id);
        for r in &mut t.reductions {
            if self.cx.find_variable(&r.var.node).is_none() {
                let var = self.cx.insert_variable(&r.var, r.ty.clone())?;
                r.def = var.id;
            }
        }
        self.cx.push_scope();
        self.loops.push(self.cx.depth() - 1);
        self.check_block(&mut t.body)?;
        self.loops.pop();
        self.cx.pop_scope();
        self.cx.pop_scope();
        Ok(())
    }

    fn check_block(&mut self, stmts: &mut [Stmt]) -> Result<(), ContraError> {
        for stmt in stmts {
            self.check_stmt(stmt)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) -> Result<(), ContraError> {
        match stmt {
            Stmt::Expr(e) => self.infer_expr(e, None).map(|_| ()),
            Stmt::VarDecl(d) => self.check_var_decl(d),
            Stmt::Assign(a) => self.check_assign(a),
            Stmt::If(i) => self.check_if(i),
            Stmt::For(f) => {
                self.cx.push_scope();
                self.check_loop_head(f)?;
                self.check_block(&mut f.body)?;
                self.cx.pop_scope();
                Ok(())
            }
            Stmt::Foreach(f) => self.check_foreach(f),
            Stmt::Partition(p) => self.check_partition(p),
        }
    }

    fn check_if(&mut self, i: &mut IfStmt) -> Result<(), ContraError> {
        let cond = self.infer_expr(&mut i.cond, None)?;
        if !cond.value_view().is_bool() {
            return Err(ContraError::type_error(
                format!("if condition must result in boolean type, found '{cond}'"),
                i.cond.span,
            ));
        }
        self.cx.push_scope();
        self.check_block(&mut i.then_body)?;
        self.cx.pop_scope();
        self.cx.push_scope();
        self.check_block(&mut i.else_body)?;
        self.cx.pop_scope();
        Ok(())
    }

    fn check_int(&mut self, e: &mut Expr, what: &str) -> Result<(), ContraError> {
        let ty = self.infer_expr(e, None)?;
        if !ty.value_view().is_int() {
            return Err(ContraError::type_error(
                format!("{what} must result in an integer type, found '{ty}'"),
                e.span,
            ));
        }
        Ok(())
    }

    /// Declares the loop variable in the current scope and checks the bounds.
    fn check_loop_head(&mut self, f: &mut ForStmt) -> Result<(), ContraError> {
        let int = self.cx.builtins().int();
        let var = self.cx.insert_variable(&f.var, int)?;
        f.var_def = Some(var.id);
        match &mut f.bounds {
            LoopBounds::Counted { start, end, step, .. } => {
                self.check_int(start, "for loop start expression")?;
                self.check_int(end, "for loop end expression")?;
                if let Some(step) = step {
                    self.check_int(step, "for loop step expression")?;
                }
            }
            LoopBounds::Over(r) => {
                let ty = self.infer_expr(r, None)?;
                if !ty.is_range() {
                    return Err(ContraError::type_error(
                        format!("for loop must iterate over a range, found '{ty}'"),
                        r.span,
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_foreach(&mut self, f: &mut ForeachStmt) -> Result<(), ContraError> {
        self.cx.push_scope();
        let lifted = self.in_task || !self.loops.is_empty();
        if lifted {
            self.loops.push(self.cx.depth() - 1);
        }
        self.check_loop_head(&mut f.looping)?;

        self.cx.begin_access_tracking();
        let body = self.check_block(&mut f.looping.body);
        let accessed = self.cx.end_access_tracking();
        if lifted {
            self.loops.pop();
        }
        body?;
        f.accessed = accessed;
        trace!(accessed = f.accessed.len(), "foreach accesses");

        f.reduction_defs.clear();
        for clause in &f.reductions {
            for var in &clause.vars {
                if f.reduction_defs.iter().any(|r| r.var.node == var.node) {
                    return Err(ContraError::name(
                        format!("variable '{}' is reduced more than once", var.node),
                        var.span,
                    ));
                }
                let def = self.cx.get_variable(var)?;
                if Some(def.id) == f.looping.var_def {
                    return Err(ContraError::name(
                        "the loop variable cannot be reduced".to_string(),
                        var.span,
                    ));
                }
                if !def.ty.is_scalar_number() {
                    return Err(ContraError::type_error(
                        format!(
                            "reduction variable '{}' must be a scalar number, found '{}'",
                            var.node, def.ty
                        ),
                        var.span,
                    ));
                }
                self.check_reduce_op(&clause.op, &def.ty, clause.span)?;
                f.reduction_defs.push(ReductionDef {
                    var: var.clone(),
                    def: def.id,
                    ty: def.ty.value_view(),
                    op: clause.op.clone(),
                });
            }
        }

        self.cx.pop_scope();
        Ok(())
    }

    fn check_reduce_op(&mut self, op: &ReduceOp, ty: &VariableType, span: Span) -> Result<(), ContraError> {
        let name = match op {
            ReduceOp::Op(BinOp::Add | BinOp::Mul) => return Ok(()),
            ReduceOp::Op(BinOp::User(c)) => format!("binary{c}"),
            ReduceOp::Op(other) => {
                return Err(ContraError::type_error(
                    format!("operator '{}' cannot be used as a reduction", other.symbol()),
                    span,
                ));
            }
            ReduceOp::Named(name) => name.clone(),
        };
        let f = self.cx.get_function(&Ident::new(span, name.clone()))?;
        let combines = f.params.len() == 2
            && f.params.iter().all(|p| ty.is_castable_to(p))
            && f.ret.is_castable_to(ty);
        if !combines || f.is_task {
            return Err(ContraError::type_error(
                format!("'{name}' cannot combine two values of type '{ty}'"),
                span,
            ));
        }
        Ok(())
    }

    fn check_partition(&mut self, p: &mut PartitionStmt) -> Result<(), ContraError> {
        let part = self.infer_expr(&mut p.part, None)?;
        if !part.is_partition() {
            return Err(ContraError::type_error(
                format!("partition statement requires a partition, found '{part}'"),
                p.part.span,
            ));
        }
        p.target_defs.clear();
        p.target_types.clear();
        for target in &p.targets {
            let def = self.cx.get_variable(target)?;
            if !(def.ty.is_range() || def.ty.is_field()) {
                return Err(ContraError::type_error(
                    format!(
                        "only ranges and fields can be partitioned, '{}' is '{}'",
                        target.node, def.ty
                    ),
                    target.span,
                ));
            }
            p.target_defs.push(def.id);
            p.target_types.push(def.ty);
        }
        Ok(())
    }

    fn check_var_decl(&mut self, d: &mut VarDecl) -> Result<(), ContraError> {
        let declared = match &d.annot {
            Some(annot) => Some(self.resolve_annot(annot)?),
            None => None,
        };
        let init = self.infer_expr(&mut d.init, declared.as_ref())?;
        let mut ty = declared.clone().unwrap_or_else(|| init.clone().with_global(false));

        if let Some(size) = &mut d.size {
            let size_ty = self.infer_expr(size, None)?;
            let ok = if ty.is_field() {
                size_ty.value_view().is_int() || size_ty.is_range()
            } else {
                size_ty.value_view().is_int()
            };
            if !(ty.is_array() || ty.is_field()) {
                return Err(ContraError::type_error(
                    "only array and field declarations take a size",
                    size.span,
                ));
            }
            if !ok {
                return Err(ContraError::type_error(
                    format!("size expression must be an integer, found '{size_ty}'"),
                    size.span,
                ));
            }
        }

        if ty.is_field() {
            if d.size.is_none() {
                return Err(ContraError::type_error(
                    "field declarations need a size or a range",
                    d.span,
                ));
            }
            let elem = ty.element();
            if !init.is_plain() {
                return Err(ContraError::type_error(
                    format!("a field must be initialized from a scalar, found '{init}'"),
                    d.init.span,
                ));
            }
            if init.value_view() != elem {
                self.check_castable(&init, &elem, d.init.span)?;
                cast_in_place(&mut d.init, elem);
            }
        } else if ty.is_array() {
            if init.is_array() {
                self.check_assignable(&ty, &init, d.init.span)?;
            } else {
                // A scalar initializer is broadcast to every element.
                let elem = ty.element();
                if init.value_view() != elem {
                    self.check_castable(&init, &elem, d.init.span)?;
                    cast_in_place(&mut d.init, elem);
                }
            }
        } else {
            self.check_assignable(&ty, &init, d.init.span)?;
            if init.value_view() != ty.value_view() {
                self.check_castable(&init, &ty, d.init.span)?;
                cast_in_place(&mut d.init, ty.value_view());
            }
        }

        if self.cx.is_global_scope() {
            ty = ty.with_global(true);
        }
        let ty = ty.validate(d.span)?;

        d.defs.clear();
        for name in &d.names {
            let var = self.cx.insert_variable(name, ty.clone())?;
            d.defs.push(var.id);
        }
        d.ty = ty;
        Ok(())
    }

    fn check_assign(&mut self, a: &mut AssignStmt) -> Result<(), ContraError> {
        let ExprKind::Var(lhs) = &a.lhs.kind else {
            return Err(ContraError::name("destination of '=' must be a variable", a.lhs.span));
        };
        let existing = self.cx.find_variable(&lhs.name.node).map(|v| v.ty.clone());
        let dest = match (&existing, &lhs.index) {
            (Some(ty), None) if self.through_accessor(&lhs.name.node, ty) => Some(ty.element()),
            (Some(ty), None) => Some(ty.clone()),
            (Some(ty), Some(_)) => Some(ty.element()),
            (None, _) => None,
        };
        let rhs = self.infer_expr(&mut a.rhs, dest.as_ref())?;

        if existing.is_none() && lhs.index.is_none() {
            // Assigning to an unknown name declares it.
            let name = lhs.name.clone();
            let mut ty = rhs.clone().with_global(false);
            if self.cx.is_global_scope() {
                ty = ty.with_global(true);
            }
            let ty = ty.validate(a.span)?;
            let var = self.cx.insert_variable(&name, ty.clone())?;
            if let ExprKind::Var(lhs) = &mut a.lhs.kind {
                lhs.def = Some(var.id);
            }
            a.lhs.ty = ty;
            a.declares = true;
            return Ok(());
        }

        let left = self.infer_expr(&mut a.lhs, None)?;
        self.check_assignable(&left, &rhs, a.span)?;
        if !rhs.same_base(&left) {
            self.check_castable(&rhs, &left, a.span)?;
            cast_in_place(&mut a.rhs, left.value_view());
        }
        Ok(())
    }

    /// Computes, attaches and returns the type of `e`. `dest` is the type an
    /// enclosing declaration expects; only array literals consult it.
    pub fn infer_expr(&mut self, e: &mut Expr, dest: Option<&VariableType>) -> Result<VariableType, ContraError> {
        let span = e.span;
        let ty = match &mut e.kind {
            ExprKind::Int(_) => self.cx.builtins().int(),
            ExprKind::Real(_) => self.cx.builtins().real(),
            ExprKind::Str(_) => self.cx.builtins().string(),
            ExprKind::Bool(_) => self.cx.builtins().boolean(),

            ExprKind::Var(v) => {
                let def = self.cx.get_variable(&v.name)?;
                v.def = Some(def.id);
                match &mut v.index {
                    None if self.through_accessor(&v.name.node, &def.ty) => def.ty.element(),
                    None => def.ty,
                    Some(index) => {
                        if !(def.ty.is_array() || def.ty.is_field()) {
                            return Err(ContraError::type_error(
                                format!("cannot index scalar '{}' using '[]' operator", v.name.node),
                                index.span,
                            ));
                        }
                        let it = self.infer_expr(index, None)?;
                        if !it.value_view().is_int() {
                            return Err(ContraError::type_error(
                                format!(
                                    "array index for variable '{}' must evaluate to an integer",
                                    v.name.node
                                ),
                                index.span,
                            ));
                        }
                        def.ty.element()
                    }
                }
            }

            ExprKind::Array(arr) => {
                if let Some(size) = &mut arr.size {
                    let st = self.infer_expr(size, None)?;
                    if !st.value_view().is_int() {
                        return Err(ContraError::type_error(
                            "size expression for arrays must be an integer",
                            size.span,
                        ));
                    }
                }
                if arr.elems.is_empty() {
                    return Err(ContraError::type_error("array literal has no values", span));
                }
                let mut types = Vec::with_capacity(arr.elems.len());
                let mut common: Option<VariableType> = None;
                for elem in &mut arr.elems {
                    let t = self.infer_expr(elem, None)?;
                    if !t.is_plain() {
                        return Err(ContraError::type_error(
                            format!("array values must be scalars, found '{t}'"),
                            elem.span,
                        ));
                    }
                    common = Some(match common {
                        None => t.value_view(),
                        Some(c) => t.promote(&c, elem.span)?,
                    });
                    types.push(t);
                }
                let mut common = common.unwrap_or_default();
                if let Some(dest) = dest {
                    common = dest.element();
                }
                for (elem, t) in arr.elems.iter_mut().zip(&types) {
                    if t.value_view() != common {
                        self.check_castable(t, &common, elem.span)?;
                        cast_in_place(elem, common.clone());
                    }
                }
                common.with_array(true)
            }

            ExprKind::Range(r) => {
                self.check_int(&mut r.start, "range start")?;
                self.check_int(&mut r.end, "range end")?;
                if let Some(step) = &mut r.step {
                    self.check_int(step, "range step")?;
                }
                self.cx.builtins().range()
            }

            ExprKind::Cast(c) => {
                let from = self.infer_expr(&mut c.expr, None)?;
                let to = match &c.target {
                    Some(id) => VariableType::new(self.cx.get_type(&id.node, id.span)?),
                    None if e.ty.is_set() => e.ty.clone(),
                    None => {
                        return Err(ContraError::implementation("inserted cast has no target type", span));
                    }
                };
                self.check_castable(&from, &to, span)?;
                to
            }

            ExprKind::Unary(u) => {
                let t = self.infer_expr(&mut u.operand, None)?;
                if t.is_array() {
                    return Err(ContraError::type_error(
                        format!(
                            "unary operation '{}' not allowed for array expressions",
                            u.op.symbol()
                        ),
                        span,
                    ));
                }
                if !t.is_scalar_number() {
                    return Err(ContraError::type_error(
                        format!(
                            "unary operators only allowed for scalar numeric expressions, expression is of type '{t}'"
                        ),
                        span,
                    ));
                }
                match u.op {
                    UnaryOp::Neg | UnaryOp::Plus => t.value_view(),
                    UnaryOp::User(_) => {
                        let f = self.cx.get_function(&Ident::new(span, u.op.function_name()))?;
                        if let Some(param) = f.params.first() {
                            if t.value_view() != param.value_view() {
                                self.check_castable(&t, param, u.operand.span)?;
                                cast_in_place(&mut u.operand, param.value_view());
                            }
                        }
                        f.ret
                    }
                }
            }

            ExprKind::Binary(b) => {
                let lt = self.infer_expr(&mut b.lhs, None)?;
                let rt = self.infer_expr(&mut b.rhs, None)?;
                if !lt.is_scalar_number() || !rt.is_scalar_number() {
                    return Err(ContraError::type_error(
                        format!(
                            "binary operators only allowed for scalar numeric expressions, found '{lt}' {} '{rt}'",
                            b.op.symbol()
                        ),
                        span,
                    ));
                }
                if let BinOp::User(_) = b.op {
                    // Each operand takes the type of the parameter it binds to.
                    let f = self.cx.get_function(&Ident::new(span, b.op.function_name()))?;
                    let operands = [(&mut *b.lhs, lt), (&mut *b.rhs, rt)];
                    for ((operand, t), param) in operands.into_iter().zip(&f.params) {
                        if t.value_view() != param.value_view() {
                            self.check_castable(&t, param, operand.span)?;
                            cast_in_place(operand, param.value_view());
                        }
                    }
                    f.ret
                } else {
                    let mut common = lt.value_view();
                    if lt.value_view() != rt.value_view() {
                        self.check_castable(&rt, &lt, b.rhs.span)?;
                        self.check_castable(&lt, &rt, b.lhs.span)?;
                        common = lt.promote(&rt, span)?;
                        if rt.value_view() != common {
                            cast_in_place(&mut b.rhs, common.clone());
                        } else {
                            cast_in_place(&mut b.lhs, common.clone());
                        }
                    }
                    if b.op.is_comparison() {
                        self.cx.builtins().boolean()
                    } else {
                        common
                    }
                }
            }

            ExprKind::Call(c) => self.check_call(c, span)?,
        };
        e.ty = ty.clone();
        Ok(ty)
    }

    fn check_call(&mut self, c: &mut CallExpr, span: Span) -> Result<VariableType, ContraError> {
        if librt::is_intrinsic(&c.callee.node) {
            return self.check_intrinsic(c, span);
        }
        let f = self.cx.get_function(&c.callee)?;

        if f.is_task && self.cx.is_global_scope() {
            if self.have_top_level_task {
                return Err(ContraError::name(
                    "you are not allowed to have more than one top-level task",
                    span,
                ));
            }
            if !c.args.is_empty() {
                return Err(ContraError::name(
                    "you are not allowed to pass arguments to the top-level task",
                    span,
                ));
            }
            self.have_top_level_task = true;
            c.top_level_task = true;
        }

        let fixed = f.params.len();
        if f.variadic && c.args.len() < fixed {
            return Err(ContraError::name(
                format!(
                    "variadic function '{}' must have at least {fixed} arguments, but only {} provided",
                    f.name,
                    c.args.len()
                ),
                span,
            ));
        }
        if !f.variadic && c.args.len() != fixed {
            return Err(ContraError::name(
                format!(
                    "incorrect number of arguments specified for '{}', {} provided but expected {fixed}",
                    f.name,
                    c.args.len()
                ),
                span,
            ));
        }

        c.arg_types.clear();
        for (i, arg) in c.args.iter_mut().enumerate() {
            let at = self.infer_expr(arg, None)?;
            if let Some(param) = f.params.get(i) {
                if at.value_view() != param.value_view() {
                    self.check_castable(&at, param, arg.span)?;
                    cast_in_place(arg, param.value_view());
                }
            }
            c.arg_types.push(at);
        }

        c.task = f.is_task;
        let ret = f.ret.clone();
        let future = f.is_task && !ret.is_void();
        Ok(ret.with_future(future))
    }

    fn check_intrinsic(&mut self, c: &mut CallExpr, span: Span) -> Result<VariableType, ContraError> {
        c.arg_types.clear();
        for arg in &mut c.args {
            let t = self.infer_expr(arg, None)?;
            c.arg_types.push(t);
        }
        let types = &c.arg_types;
        match c.callee.node.as_str() {
            librt::LEN => {
                if types.len() != 1 {
                    return Err(ContraError::name(
                        format!("'len' takes one argument, {} provided", types.len()),
                        span,
                    ));
                }
                if !(types[0].is_array() || types[0].is_range()) {
                    return Err(ContraError::type_error(
                        format!("'len' requires an array or a range, found '{}'", types[0]),
                        span,
                    ));
                }
                Ok(self.cx.builtins().int())
            }
            _ => {
                if types.len() != 2 {
                    return Err(ContraError::name(
                        format!("'part' takes a range and a count or coloring, {} provided", types.len()),
                        span,
                    ));
                }
                if !types[0].is_range() {
                    return Err(ContraError::type_error(
                        format!("'part' partitions a range, found '{}'", types[0]),
                        c.args[0].span,
                    ));
                }
                let colors = &types[1];
                let by_count = colors.value_view().is_int();
                let by_colors = colors.is_array() && colors.element().is_int();
                if !(by_count || by_colors) {
                    return Err(ContraError::type_error(
                        format!("'part' needs a count or an [i64] coloring, found '{colors}'"),
                        c.args[1].span,
                    ));
                }
                Ok(self.cx.builtins().partition())
            }
        }
    }
}
