#![forbid(unsafe_code)]

pub mod build;
pub mod error;
pub mod types;

use miette::SourceSpan;

pub use error::{ContraError, ErrorKind};
pub use types::{BuiltinKind, BuiltinTypes, Facets, TypeDef, TypeDefKind, TypeRef, VariableType};

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

/// Identity of one declared variable, assigned by the analyzer. Names can be
/// shadowed; ids cannot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    /// Unset until the analyzer has visited the node.
    pub ty: VariableType,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Self {
            span,
            ty: VariableType::default(),
            kind,
        }
    }

    /// Moves the expression out, leaving a placeholder literal behind.
    pub fn take(&mut self) -> Expr {
        let placeholder = Expr::new(self.span, ExprKind::Int(0));
        std::mem::replace(self, placeholder)
    }

    /// A plain variable read with no index.
    pub fn as_plain_var(&self) -> Option<&VarRef> {
        match &self.kind {
            ExprKind::Var(v) if v.index.is_none() => Some(v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Real(f64),
    Str(String),
    Bool(bool),
    Var(VarRef),
    Array(ArrayLit),
    Range(RangeLit),
    Cast(CastExpr),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
    Call(CallExpr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct VarRef {
    pub name: Ident,
    pub index: Option<Box<Expr>>,
    pub def: Option<VarId>,
}

/// `[a, b, c]`, or `[v; n]` when `size` is present.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayLit {
    pub elems: Vec<Expr>,
    pub size: Option<Box<Expr>>,
}

/// `start..end` with an inclusive end.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeLit {
    pub start: Box<Expr>,
    pub end: Box<Expr>,
    pub step: Option<Box<Expr>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CastExpr {
    /// `None` for casts inserted by the analyzer; the node's own type is the target.
    pub target: Option<Ident>,
    pub expr: Box<Expr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Plus,
    User(char),
}

impl UnaryOp {
    pub fn symbol(self) -> char {
        match self {
            UnaryOp::Neg => '-',
            UnaryOp::Plus => '+',
            UnaryOp::User(c) => c,
        }
    }

    pub fn function_name(self) -> String {
        format!("unary{}", self.symbol())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    User(char),
}

impl BinOp {
    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::User(_) => "?",
        }
    }

    /// Name of the function implementing a user-defined operator.
    pub fn function_name(self) -> String {
        match self {
            BinOp::User(c) => format!("binary{c}"),
            other => format!("binary{}", other.symbol()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub operand: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinaryExpr {
    pub op: BinOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallExpr {
    pub callee: Ident,
    pub args: Vec<Expr>,
    /// Argument types as analyzed, one per argument.
    pub arg_types: Vec<VariableType>,
    /// The callee is a task.
    pub task: bool,
    /// This call is the program's entry task.
    pub top_level_task: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    VarDecl(VarDecl),
    Assign(AssignStmt),
    If(IfStmt),
    For(ForStmt),
    Foreach(ForeachStmt),
    Partition(PartitionStmt),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Array,
    Field,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeAnnot {
    pub span: Span,
    pub name: String,
    pub shape: Shape,
}

/// `var a, b : [f64][n] = init`
#[derive(Clone, Debug, PartialEq)]
pub struct VarDecl {
    pub span: Span,
    pub names: Vec<Ident>,
    pub annot: Option<TypeAnnot>,
    /// Explicit extent for array and field declarations.
    pub size: Option<Expr>,
    pub init: Expr,
    pub ty: VariableType,
    pub defs: Vec<VarId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub lhs: Expr,
    pub rhs: Expr,
    /// Set by the analyzer when the left side names a variable not yet declared.
    pub declares: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub span: Span,
    pub cond: Expr,
    pub then_body: Vec<Stmt>,
    pub else_body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoopBounds {
    Counted {
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        /// `to` includes `end`, `until` stops before it.
        inclusive: bool,
    },
    /// Iterate every point of a range-typed expression.
    Over(Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForStmt {
    pub span: Span,
    pub var: Ident,
    pub var_def: Option<VarId>,
    pub bounds: LoopBounds,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReduceOp {
    Op(BinOp),
    Named(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReductionClause {
    pub span: Span,
    pub vars: Vec<Ident>,
    pub op: ReduceOp,
}

/// A variable paired with the operator that combines its per-point values.
#[derive(Clone, Debug, PartialEq)]
pub struct ReductionDef {
    pub var: Ident,
    pub def: VarId,
    pub ty: VariableType,
    pub op: ReduceOp,
}

/// A variable from an enclosing scope read or written inside a loop body.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessedVar {
    pub name: String,
    pub def: VarId,
    pub ty: VariableType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForeachStmt {
    pub looping: ForStmt,
    /// Name of the index task this loop was lifted into.
    pub lifted: Option<String>,
    pub reductions: Vec<ReductionClause>,
    pub accessed: Vec<AccessedVar>,
    pub reduction_defs: Vec<ReductionDef>,
}

/// `use a, b for part(r, 4)`
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionStmt {
    pub span: Span,
    pub targets: Vec<Ident>,
    pub target_defs: Vec<VarId>,
    pub target_types: Vec<VariableType>,
    pub part: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub annot: TypeAnnot,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProtoKind {
    Function,
    BinaryOp { op: char, precedence: u32 },
    UnaryOp { op: char },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Prototype {
    pub span: Span,
    pub name: Ident,
    pub params: Vec<Param>,
    pub ret: Option<TypeAnnot>,
    pub kind: ProtoKind,
    pub param_types: Vec<VariableType>,
    pub ret_ty: VariableType,
}

impl Prototype {
    pub fn is_anonymous(&self) -> bool {
        self.name.node.starts_with("__anon")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub span: Span,
    pub proto: Prototype,
    pub is_task: bool,
    pub body: Vec<Stmt>,
    pub ret: Option<Expr>,
    /// Statements entered at the outermost level, compiled as an anonymous function.
    pub top_level: bool,
    pub param_defs: Vec<VarId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Capture {
    pub name: Ident,
    pub ty: VariableType,
    pub def: Option<VarId>,
    /// A range the launch splits with a partition; each point sees its piece.
    pub partitioned: bool,
}

/// The body of a parallel loop as a standalone launchable task.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexTaskDecl {
    pub span: Span,
    pub name: String,
    pub loop_var: Ident,
    pub loop_def: Option<VarId>,
    pub captures: Vec<Capture>,
    pub body: Vec<Stmt>,
    pub reductions: Vec<ReductionDef>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Prototype(Prototype),
    Function(FunctionDecl),
    IndexTask(IndexTaskDecl),
}

impl Item {
    pub fn name(&self) -> &str {
        match self {
            Item::Prototype(p) => &p.name.node,
            Item::Function(f) => &f.proto.name.node,
            Item::IndexTask(t) => &t.name,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Item::Prototype(p) => p.span,
            Item::Function(f) => f.span,
            Item::IndexTask(t) => t.span,
        }
    }
}
