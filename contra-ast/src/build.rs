//! Shorthand constructors for building trees by hand, as a front end or a test would.
//! Every node gets an empty span at offset zero unless built with `at`.

use crate::*;

fn nowhere() -> Span {
    span(0, 0)
}

pub fn ident(name: &str) -> Ident {
    Ident::new(nowhere(), name.to_string())
}

pub fn at(start: usize, len: usize, mut e: Expr) -> Expr {
    e.span = span(start, len);
    e
}

pub fn int(v: i64) -> Expr {
    Expr::new(nowhere(), ExprKind::Int(v))
}

pub fn real(v: f64) -> Expr {
    Expr::new(nowhere(), ExprKind::Real(v))
}

pub fn string(v: &str) -> Expr {
    Expr::new(nowhere(), ExprKind::Str(v.to_string()))
}

pub fn boolean(v: bool) -> Expr {
    Expr::new(nowhere(), ExprKind::Bool(v))
}

pub fn var(name: &str) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Var(VarRef {
            name: ident(name),
            index: None,
            def: None,
        }),
    )
}

pub fn index(name: &str, idx: Expr) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Var(VarRef {
            name: ident(name),
            index: Some(Box::new(idx)),
            def: None,
        }),
    )
}

pub fn array(elems: Vec<Expr>) -> Expr {
    Expr::new(nowhere(), ExprKind::Array(ArrayLit { elems, size: None }))
}

pub fn array_sized(value: Expr, size: Expr) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Array(ArrayLit {
            elems: vec![value],
            size: Some(Box::new(size)),
        }),
    )
}

pub fn range(start: Expr, end: Expr) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Range(RangeLit {
            start: Box::new(start),
            end: Box::new(end),
            step: None,
        }),
    )
}

pub fn cast(ty: &str, e: Expr) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Cast(CastExpr {
            target: Some(ident(ty)),
            expr: Box::new(e),
        }),
    )
}

pub fn unary(op: UnaryOp, e: Expr) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Unary(UnaryExpr {
            op,
            operand: Box::new(e),
        }),
    )
}

pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Binary(BinaryExpr {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }),
    )
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::new(
        nowhere(),
        ExprKind::Call(CallExpr {
            callee: ident(name),
            args,
            arg_types: Vec::new(),
            task: false,
            top_level_task: false,
        }),
    )
}

pub fn scalar(ty: &str) -> TypeAnnot {
    TypeAnnot {
        span: nowhere(),
        name: ty.to_string(),
        shape: Shape::Scalar,
    }
}

pub fn array_of(ty: &str) -> TypeAnnot {
    TypeAnnot {
        shape: Shape::Array,
        ..scalar(ty)
    }
}

pub fn field_of(ty: &str) -> TypeAnnot {
    TypeAnnot {
        shape: Shape::Field,
        ..scalar(ty)
    }
}

pub fn expr(e: Expr) -> Stmt {
    Stmt::Expr(e)
}

pub fn decl(name: &str, annot: Option<TypeAnnot>, init: Expr) -> Stmt {
    decl_many(&[name], annot, None, init)
}

pub fn decl_many(names: &[&str], annot: Option<TypeAnnot>, size: Option<Expr>, init: Expr) -> Stmt {
    Stmt::VarDecl(VarDecl {
        span: nowhere(),
        names: names.iter().map(|n| ident(n)).collect(),
        annot,
        size,
        init,
        ty: VariableType::default(),
        defs: Vec::new(),
    })
}

pub fn assign(lhs: Expr, rhs: Expr) -> Stmt {
    Stmt::Assign(AssignStmt {
        span: nowhere(),
        lhs,
        rhs,
        declares: false,
    })
}

pub fn if_else(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
    Stmt::If(IfStmt {
        span: nowhere(),
        cond,
        then_body,
        else_body,
    })
}

fn looping(var: &str, bounds: LoopBounds, body: Vec<Stmt>) -> ForStmt {
    ForStmt {
        span: nowhere(),
        var: ident(var),
        var_def: None,
        bounds,
        body,
    }
}

pub fn counted(start: Expr, end: Expr, step: Option<Expr>, inclusive: bool) -> LoopBounds {
    LoopBounds::Counted {
        start: Box::new(start),
        end: Box::new(end),
        step: step.map(Box::new),
        inclusive,
    }
}

pub fn over(r: Expr) -> LoopBounds {
    LoopBounds::Over(Box::new(r))
}

/// `for i in start to end do ... end`
pub fn for_to(var: &str, start: Expr, end: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::For(looping(var, counted(start, end, None, true), body))
}

pub fn for_loop(var: &str, bounds: LoopBounds, body: Vec<Stmt>) -> Stmt {
    Stmt::For(looping(var, bounds, body))
}

pub fn foreach(var: &str, bounds: LoopBounds, body: Vec<Stmt>) -> ForeachStmt {
    ForeachStmt {
        looping: looping(var, bounds, body),
        lifted: None,
        reductions: Vec::new(),
        accessed: Vec::new(),
        reduction_defs: Vec::new(),
    }
}

pub fn reduce(op: ReduceOp, vars: &[&str]) -> ReductionClause {
    ReductionClause {
        span: nowhere(),
        vars: vars.iter().map(|v| ident(v)).collect(),
        op,
    }
}

pub fn partition(targets: &[&str], part: Expr) -> Stmt {
    Stmt::Partition(PartitionStmt {
        span: nowhere(),
        targets: targets.iter().map(|t| ident(t)).collect(),
        target_defs: Vec::new(),
        target_types: Vec::new(),
        part,
    })
}

pub fn param(name: &str, annot: TypeAnnot) -> Param {
    Param {
        name: ident(name),
        annot,
    }
}

pub fn proto(name: &str, params: Vec<Param>, ret: Option<TypeAnnot>) -> Prototype {
    Prototype {
        span: nowhere(),
        name: ident(name),
        params,
        ret,
        kind: ProtoKind::Function,
        param_types: Vec::new(),
        ret_ty: VariableType::default(),
    }
}

pub fn function(proto: Prototype, body: Vec<Stmt>, ret: Option<Expr>) -> FunctionDecl {
    FunctionDecl {
        span: nowhere(),
        proto,
        is_task: false,
        body,
        ret,
        top_level: false,
        param_defs: Vec::new(),
    }
}

pub fn task(proto: Prototype, body: Vec<Stmt>, ret: Option<Expr>) -> FunctionDecl {
    FunctionDecl {
        is_task: true,
        ..function(proto, body, ret)
    }
}

/// Outermost statements wrapped as the anonymous function a driver executes.
pub fn top_level(body: Vec<Stmt>, ret: Option<Expr>) -> FunctionDecl {
    FunctionDecl {
        top_level: true,
        ..function(proto("__anon_expr", Vec::new(), None), body, ret)
    }
}
