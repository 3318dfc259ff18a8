use std::collections::{BTreeMap, BTreeSet};

use crate::{FunctionIR, InstKind, IrError, ModuleIR, Terminator, ValueId};

/// Structural sanity check run after each generated function.
pub fn validate_module(module: &ModuleIR) -> Result<(), IrError> {
    for (name, f) in &module.functions {
        if f.name != *name {
            return Err(IrError::new(
                format!("function key '{name}' mismatches FunctionIR.name='{}'", f.name),
                f.span,
            ));
        }
        validate_function(module, f)?;
    }
    Ok(())
}

fn operands(kind: &InstKind) -> Vec<ValueId> {
    match kind {
        InstKind::Alloca { .. }
        | InstKind::Global { .. }
        | InstKind::Const(_)
        | InstKind::SizeOf { .. } => Vec::new(),
        InstKind::Load { ptr } => vec![*ptr],
        InstKind::Store { ptr, value } => vec![*ptr, *value],
        InstKind::FieldPtr { base, .. } => vec![*base],
        InstKind::ElementPtr { array, index } => vec![*array, *index],
        InstKind::Unary { operand, .. } => vec![*operand],
        InstKind::Binary { left, right, .. } => vec![*left, *right],
        InstKind::Cast { value, .. } => vec![*value],
        InstKind::Call { args, .. } => args.clone(),
        InstKind::MemCopy { dst, src } => vec![*dst, *src],
    }
}

pub fn validate_function(module: &ModuleIR, f: &FunctionIR) -> Result<(), IrError> {
    let fail = |message: String| Err(IrError::new(message, f.span));

    if f.blocks.is_empty() {
        return fail(format!("function '{}' has no blocks", f.name));
    }

    let mut blocks_by_id = BTreeMap::new();
    for (i, bb) in f.blocks.iter().enumerate() {
        if blocks_by_id.insert(bb.id, i).is_some() {
            return fail(format!("function '{}' has duplicate block id {:?}", f.name, bb.id));
        }
    }
    if !blocks_by_id.contains_key(&f.entry) {
        return fail(format!("function '{}' entry block {:?} missing", f.name, f.entry));
    }

    let mut defined: BTreeSet<ValueId> = f.params.iter().map(|p| p.value).collect();
    for inst in f.insts() {
        if let Some(d) = inst.dest {
            if !defined.insert(d) {
                return fail(format!("function '{}' defines {d:?} twice", f.name));
            }
        }
    }

    for bb in &f.blocks {
        for inst in &bb.insts {
            for v in operands(&inst.kind) {
                if !defined.contains(&v) {
                    return fail(format!(
                        "function '{}' block '{}' uses undefined value {v:?}",
                        f.name, bb.label
                    ));
                }
            }
            if let InstKind::Call { callee, .. } = &inst.kind {
                if module.signature(callee).is_none() {
                    return fail(format!(
                        "function '{}' calls undeclared '{callee}'",
                        f.name
                    ));
                }
            }
        }

        let Some(term) = &bb.term else {
            return fail(format!(
                "function '{}' block '{}' has no terminator",
                f.name, bb.label
            ));
        };
        if let Terminator::CondBr { cond, .. } | Terminator::Return(Some(cond)) = term {
            if !defined.contains(cond) {
                return fail(format!(
                    "function '{}' block '{}' terminator uses undefined value {cond:?}",
                    f.name, bb.label
                ));
            }
        }
        for succ in term.successors() {
            if !blocks_by_id.contains_key(&succ) {
                return fail(format!(
                    "function '{}' terminator branches to missing block {succ:?}",
                    f.name
                ));
            }
        }
    }

    Ok(())
}
