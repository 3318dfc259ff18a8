use std::fmt::Write;

use crate::{Constant, FunctionIR, InstKind, ModuleIR, Terminator, ValueId};

fn v(id: ValueId) -> String {
    format!("%{}", id.0)
}

fn list(ids: &[ValueId]) -> String {
    ids.iter().map(|i| v(*i)).collect::<Vec<_>>().join(", ")
}

fn constant(c: &Constant) -> String {
    match c {
        Constant::Bool(b) => b.to_string(),
        Constant::I32(n) => format!("{n}i32"),
        Constant::I64(n) => n.to_string(),
        Constant::F64(x) => format!("{x:?}"),
        Constant::Str(s) => format!("{s:?}"),
        Constant::Null(t) => format!("null {}*", t.display()),
        Constant::Function(name) => format!("@{name}"),
    }
}

/// Textual rendering of a module, for logs and test failure output.
pub fn render_module(module: &ModuleIR) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; module {}", module.name);
    let _ = writeln!(out, "target triple = \"{}\"", module.target);
    for s in module.structs.values() {
        let fields = s.fields.iter().map(|t| t.display()).collect::<Vec<_>>().join(", ");
        let _ = writeln!(out, "%{} = type {{ {fields} }}", s.name);
    }
    for g in module.globals.values() {
        let _ = writeln!(out, "@{} = global {}", g.name, g.ty.display());
    }
    for (name, sig) in &module.externs {
        let mut params = sig.params.iter().map(|t| t.display()).collect::<Vec<_>>();
        if sig.variadic {
            params.push("...".to_string());
        }
        let _ = writeln!(out, "declare {} @{name}({})", sig.ret.display(), params.join(", "));
    }
    for f in module.functions.values() {
        out.push('\n');
        out.push_str(&render_function(f));
    }
    out
}

pub fn render_function(f: &FunctionIR) -> String {
    let mut out = String::new();
    let params = f
        .params
        .iter()
        .map(|p| format!("{} {} ; {}", p.ty.display(), v(p.value), p.name))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "define {} @{}({params}) {{", f.ret.display(), f.name);
    for bb in &f.blocks {
        let _ = writeln!(out, "{}.{}:", bb.label, bb.id.0);
        for inst in &bb.insts {
            out.push_str("  ");
            if let Some(d) = inst.dest {
                let _ = write!(out, "{} = ", v(d));
            }
            let text = match &inst.kind {
                InstKind::Alloca { name, ty } => format!("alloca {} ; {name}", ty.display()),
                InstKind::Global { name } => format!("global @{name}"),
                InstKind::Const(c) => format!("const {}", constant(c)),
                InstKind::Load { ptr } => format!("load {}", v(*ptr)),
                InstKind::Store { ptr, value } => format!("store {}, {}", v(*value), v(*ptr)),
                InstKind::FieldPtr { base, index } => format!("fieldptr {}, {index}", v(*base)),
                InstKind::ElementPtr { array, index } => {
                    format!("elemptr {}, {}", v(*array), v(*index))
                }
                InstKind::Unary { op, operand } => format!("{op:?} {}", v(*operand)).to_lowercase(),
                InstKind::Binary { op, left, right } => {
                    format!("{} {}, {}", op.mnemonic(), v(*left), v(*right))
                }
                InstKind::Cast { value, to } => format!("cast {} to {}", v(*value), to.display()),
                InstKind::Call { callee, args } => format!("call @{callee}({})", list(args)),
                InstKind::MemCopy { dst, src } => format!("memcopy {}, {}", v(*dst), v(*src)),
                InstKind::SizeOf { ty } => format!("sizeof {}", ty.display()),
            };
            out.push_str(&text);
            out.push('\n');
        }
        let term = match &bb.term {
            Some(Terminator::Return(Some(r))) => format!("ret {}", v(*r)),
            Some(Terminator::Return(None)) => "ret void".to_string(),
            Some(Terminator::Br(b)) => format!("br .{}", b.0),
            Some(Terminator::CondBr {
                cond,
                then_bb,
                else_bb,
            }) => format!("br {}, .{}, .{}", v(*cond), then_bb.0, else_bb.0),
            Some(Terminator::Unreachable) => "unreachable".to_string(),
            None => "; <unterminated>".to_string(),
        };
        let _ = writeln!(out, "  {term}");
    }
    out.push_str("}\n");
    out
}
