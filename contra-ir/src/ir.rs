use std::collections::BTreeMap;

use contra_ast::Span;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    I8,
    I32,
    I64,
    F64,
    /// Pointer to a NUL-terminated byte string.
    Str,
    Ptr(Box<Type>),
    /// A struct declared on the module by name.
    Struct(String),
    /// Dope vector: `{ data: *elem, size: i64, data_size: i64 }`.
    Array(Box<Type>),
}

impl Type {
    pub fn ptr(to: Type) -> Type {
        Type::Ptr(Box::new(to))
    }

    pub fn array(of: Type) -> Type {
        Type::Array(Box::new(of))
    }

    pub fn void_ptr() -> Type {
        Type::ptr(Type::Void)
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Bool | Type::I8 | Type::I32 | Type::I64)
    }

    pub fn struct_name(&self) -> Option<&str> {
        match self {
            Type::Struct(n) => Some(n),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            Type::Void => "void".to_string(),
            Type::Bool => "i1".to_string(),
            Type::I8 => "i8".to_string(),
            Type::I32 => "i32".to_string(),
            Type::I64 => "i64".to_string(),
            Type::F64 => "f64".to_string(),
            Type::Str => "str".to_string(),
            Type::Ptr(t) => format!("{}*", t.display()),
            Type::Struct(n) => format!("%{n}"),
            Type::Array(t) => format!("[{}]", t.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,

    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Gt => "gt",
            BinOp::Le => "le",
            BinOp::Ge => "ge",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Null(Type),
    /// Address of a function, for runtimes that take callbacks.
    Function(String),
}

impl Constant {
    pub fn ty(&self) -> Type {
        match self {
            Constant::Bool(_) => Type::Bool,
            Constant::I32(_) => Type::I32,
            Constant::I64(_) => Type::I64,
            Constant::F64(_) => Type::F64,
            Constant::Str(_) => Type::Str,
            Constant::Null(t) => Type::ptr(t.clone()),
            Constant::Function(_) => Type::void_ptr(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModuleIR {
    pub name: String,
    /// Host triple the module was generated on.
    pub target: String,
    pub functions: BTreeMap<String, FunctionIR>,
    pub externs: BTreeMap<String, ExternFnSig>,
    pub structs: BTreeMap<String, StructDef>,
    pub globals: BTreeMap<String, Global>,
}

impl ModuleIR {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target_lexicon::HOST.to_string(),
            functions: BTreeMap::new(),
            externs: BTreeMap::new(),
            structs: BTreeMap::new(),
            globals: BTreeMap::new(),
        }
    }

    /// Parameter and return types of a defined or external function.
    pub fn signature(&self, name: &str) -> Option<(Vec<Type>, Type, bool)> {
        if let Some(f) = self.functions.get(name) {
            return Some((f.params.iter().map(|p| p.ty.clone()).collect(), f.ret.clone(), false));
        }
        self.externs
            .get(name)
            .map(|e| (e.params.clone(), e.ret.clone(), e.variadic))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternFnSig {
    pub params: Vec<Type>,
    pub ret: Type,
    pub variadic: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Type>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug)]
pub struct FunctionIR {
    pub name: String,
    pub span: Span,
    pub params: Vec<Param>,
    pub ret: Type,
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    /// Type of every value defined in the function.
    pub values: BTreeMap<ValueId, Type>,
}

impl FunctionIR {
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn insts(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }

    /// Names of every function or runtime entry point called, in order.
    pub fn callees(&self) -> Vec<&str> {
        self.insts()
            .filter_map(|i| match &i.kind {
                InstKind::Call { callee, .. } => Some(callee.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub span: Span,
    pub value: ValueId,
}

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub label: String,
    pub insts: Vec<Inst>,
    /// `None` while the block is still being filled.
    pub term: Option<Terminator>,
}

#[derive(Clone, Debug)]
pub enum InstKind {
    /// Reserve a stack slot; the result is a pointer to it.
    Alloca { name: String, ty: Type },

    /// Address of a module-level global.
    Global { name: String },

    Const(Constant),

    Load { ptr: ValueId },

    Store { ptr: ValueId, value: ValueId },

    /// Address of the `index`-th field of the struct or dope vector behind `base`.
    FieldPtr { base: ValueId, index: u32 },

    /// Address of one element of the dope vector behind `array`.
    ElementPtr { array: ValueId, index: ValueId },

    Unary { op: UnaryOp, operand: ValueId },

    Binary {
        op: BinOp,
        left: ValueId,
        right: ValueId,
    },

    /// Numeric conversion or pointer reinterpretation.
    Cast { value: ValueId, to: Type },

    Call {
        callee: String,
        args: Vec<ValueId>,
    },

    /// Copy the whole pointee of `src` into `dst`.
    MemCopy { dst: ValueId, src: ValueId },

    /// Byte size of a type, as `i64`.
    SizeOf { ty: Type },
}

#[derive(Clone, Debug)]
pub struct Inst {
    pub span: Span,
    pub dest: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Clone, Debug)]
pub enum Terminator {
    Return(Option<ValueId>),

    Br(BlockId),

    CondBr {
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    },

    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr { then_bb, else_bb, .. } => vec![*then_bb, *else_bb],
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct IdGen {
    next_block: u32,
    next_value: u32,
}

impl IdGen {
    pub fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }
}
