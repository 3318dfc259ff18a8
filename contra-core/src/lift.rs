use contra_ast::{Capture, ForeachStmt, IndexTaskDecl, Item, Stmt, VarId};
use tracing::debug;

/// Turns the parallel loops of analyzed task bodies into standalone index
/// tasks. Each lifted loop remembers the task it launches; the launch-side
/// partition statements stay with the loop.
#[derive(Debug, Default)]
pub struct Lifter {
    next: u32,
}

impl Lifter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loops lifted so far.
    pub fn lifted(&self) -> u32 {
        self.next
    }

    /// Forgets the loops lifted after `mark`, so their names are reused.
    pub fn rewind(&mut self, mark: u32) {
        self.next = self.next.min(mark);
    }

    /// Returns the index tasks split out of `item`, outermost loops first.
    /// Only task bodies are lifted; elsewhere a foreach runs as a plain loop.
    pub fn lift(&mut self, item: &mut Item) -> Vec<IndexTaskDecl> {
        let Item::Function(f) = item else {
            return Vec::new();
        };
        if !f.is_task {
            return Vec::new();
        }
        let owner = f.proto.name.node.clone();
        let mut out = Vec::new();
        self.lift_block(&owner, &mut f.body, &mut out);
        out
    }

    fn lift_block(&mut self, owner: &str, stmts: &mut [Stmt], out: &mut Vec<IndexTaskDecl>) {
        for stmt in stmts {
            match stmt {
                Stmt::Foreach(f) if f.lifted.is_none() => out.push(self.lift_loop(owner, f)),
                Stmt::If(i) => {
                    self.lift_block(owner, &mut i.then_body, out);
                    self.lift_block(owner, &mut i.else_body, out);
                }
                Stmt::For(f) => self.lift_block(owner, &mut f.body, out),
                _ => {}
            }
        }
    }

    fn lift_loop(&mut self, owner: &str, f: &mut ForeachStmt) -> IndexTaskDecl {
        let name = format!("{owner}_loop{}", self.next);
        self.next += 1;

        let looping = &f.looping;
        let split: Vec<VarId> = looping
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Partition(p) => Some(p),
                _ => None,
            })
            .flat_map(|p| p.target_defs.iter().zip(&p.target_types))
            .filter(|(_, ty)| ty.is_range())
            .map(|(def, _)| *def)
            .collect();
        let captures = f
            .accessed
            .iter()
            .map(|a| Capture {
                name: contra_ast::Ident::new(looping.span, a.name.clone()),
                ty: a.ty.clone().with_global(false),
                def: None,
                partitioned: a.ty.is_range() && split.contains(&a.def),
            })
            .collect();
        let body = looping
            .body
            .iter()
            .filter(|s| !matches!(s, Stmt::Partition(_)))
            .cloned()
            .collect();

        debug!(task = %name, captures = f.accessed.len(), reductions = f.reduction_defs.len(), "lift foreach");
        f.lifted = Some(name.clone());
        IndexTaskDecl {
            span: looping.span,
            name,
            loop_var: looping.var.clone(),
            loop_def: None,
            captures,
            body,
            reductions: f.reduction_defs.clone(),
        }
    }
}
