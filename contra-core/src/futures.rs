use std::collections::{BTreeMap, BTreeSet};

use contra_ast::{Expr, ExprKind, Item, LoopBounds, Stmt, VarId};
use tracing::debug;

/// Marks every variable that may hold an unresolved task result. A variable
/// assigned (directly or through other variables) from a future stays a
/// future for its whole lifetime.
#[derive(Debug, Default)]
pub struct FutureFlow {
    /// Variable to the variables it was assigned from.
    flows: BTreeMap<VarId, BTreeSet<VarId>>,
    futures: BTreeSet<VarId>,
    /// Declared with an explicit type; resolved on store instead.
    pinned: BTreeSet<VarId>,
}

impl FutureFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_future(&self, id: VarId) -> bool {
        self.futures.contains(&id)
    }

    pub fn run(&mut self, item: &mut Item) {
        self.flows.clear();
        self.futures.clear();
        self.pinned.clear();

        let (body, ret) = match item {
            Item::Function(f) => (&mut f.body, f.ret.as_mut()),
            Item::IndexTask(t) => (&mut t.body, None),
            Item::Prototype(_) => return,
        };

        self.collect_block(body);
        self.solve();
        self.rewrite_block(body);
        if let Some(ret) = ret {
            self.rewrite_expr(ret);
        }
        debug!(name = %item.name(), futures = self.futures.len(), "future flow");
    }

    fn add_flow(&mut self, to: VarId, from: VarId) {
        self.flows.entry(to).or_default().insert(from);
    }

    fn mark(&mut self, id: VarId) {
        if !self.pinned.contains(&id) {
            self.futures.insert(id);
        }
    }

    fn collect_block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.collect_stmt(stmt);
        }
    }

    fn collect_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::VarDecl(d) => {
                if d.annot.is_some() {
                    self.pinned.extend(d.defs.iter().copied());
                    return;
                }
                let source = d.init.as_plain_var().and_then(|v| v.def);
                for id in &d.defs {
                    if d.ty.is_future() {
                        self.mark(*id);
                    }
                    if let Some(src) = source {
                        self.add_flow(*id, src);
                    }
                }
            }
            Stmt::Assign(a) => {
                let Some(lhs) = a.lhs.as_plain_var().and_then(|v| v.def) else {
                    return;
                };
                if a.rhs.ty.is_future() {
                    self.mark(lhs);
                }
                if let Some(src) = a.rhs.as_plain_var().and_then(|v| v.def) {
                    self.add_flow(lhs, src);
                }
            }
            Stmt::If(i) => {
                self.collect_block(&i.then_body);
                self.collect_block(&i.else_body);
            }
            Stmt::For(f) => self.collect_block(&f.body),
            Stmt::Foreach(f) => self.collect_block(&f.looping.body),
            Stmt::Expr(_) | Stmt::Partition(_) => {}
        }
    }

    /// Propagates the future mark along flow edges until nothing changes.
    fn solve(&mut self) {
        loop {
            let newly: Vec<VarId> = self
                .flows
                .iter()
                .filter(|(to, from)| {
                    !self.futures.contains(to)
                        && !self.pinned.contains(to)
                        && from.iter().any(|f| self.futures.contains(f))
                })
                .map(|(to, _)| *to)
                .collect();
            if newly.is_empty() {
                break;
            }
            self.futures.extend(newly);
        }
    }

    fn rewrite_block(&self, stmts: &mut [Stmt]) {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(e) => self.rewrite_expr(e),
                Stmt::VarDecl(d) => {
                    self.rewrite_expr(&mut d.init);
                    if let Some(size) = &mut d.size {
                        self.rewrite_expr(size);
                    }
                    if d.ty.is_plain() && d.defs.iter().any(|id| self.futures.contains(id)) {
                        d.ty = d.ty.clone().with_future(true);
                    }
                }
                Stmt::Assign(a) => {
                    self.rewrite_expr(&mut a.rhs);
                    self.rewrite_expr(&mut a.lhs);
                }
                Stmt::If(i) => {
                    self.rewrite_expr(&mut i.cond);
                    self.rewrite_block(&mut i.then_body);
                    self.rewrite_block(&mut i.else_body);
                }
                Stmt::For(f) => {
                    self.rewrite_bounds(&mut f.bounds);
                    self.rewrite_block(&mut f.body);
                }
                Stmt::Foreach(f) => {
                    self.rewrite_bounds(&mut f.looping.bounds);
                    self.rewrite_block(&mut f.looping.body);
                    for acc in &mut f.accessed {
                        if acc.ty.is_plain() && self.futures.contains(&acc.def) {
                            acc.ty = acc.ty.clone().with_future(true);
                        }
                    }
                }
                Stmt::Partition(p) => self.rewrite_expr(&mut p.part),
            }
        }
    }

    fn rewrite_bounds(&self, bounds: &mut LoopBounds) {
        match bounds {
            LoopBounds::Counted { start, end, step, .. } => {
                self.rewrite_expr(start);
                self.rewrite_expr(end);
                if let Some(step) = step {
                    self.rewrite_expr(step);
                }
            }
            LoopBounds::Over(r) => self.rewrite_expr(r),
        }
    }

    fn rewrite_expr(&self, e: &mut Expr) {
        match &mut e.kind {
            ExprKind::Int(_) | ExprKind::Real(_) | ExprKind::Str(_) | ExprKind::Bool(_) => {}
            ExprKind::Var(v) => match &mut v.index {
                Some(index) => self.rewrite_expr(index),
                None => {
                    if let Some(id) = v.def {
                        if e.ty.is_plain() && self.futures.contains(&id) {
                            e.ty = e.ty.clone().with_future(true);
                        }
                    }
                }
            },
            ExprKind::Array(a) => {
                for elem in &mut a.elems {
                    self.rewrite_expr(elem);
                }
                if let Some(size) = &mut a.size {
                    self.rewrite_expr(size);
                }
            }
            ExprKind::Range(r) => {
                self.rewrite_expr(&mut r.start);
                self.rewrite_expr(&mut r.end);
                if let Some(step) = &mut r.step {
                    self.rewrite_expr(step);
                }
            }
            ExprKind::Cast(c) => self.rewrite_expr(&mut c.expr),
            ExprKind::Unary(u) => self.rewrite_expr(&mut u.operand),
            ExprKind::Binary(b) => {
                self.rewrite_expr(&mut b.lhs);
                self.rewrite_expr(&mut b.rhs);
            }
            ExprKind::Call(c) => {
                for arg in &mut c.args {
                    self.rewrite_expr(arg);
                    // Ordinary functions only take resolved values.
                    if !c.task {
                        arg.ty = arg.ty.clone().with_future(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contra_ast::build::*;

    use crate::sema::Analyzer;

    fn analyzer_with_task() -> Analyzer {
        let mut a = Analyzer::new();
        let t = task(proto("t", vec![], Some(scalar("i64"))), vec![], Some(int(1)));
        a.analyze(&mut Item::Function(t)).unwrap();
        let h = function(
            proto("h", vec![param("x", scalar("i64"))], Some(scalar("i64"))),
            vec![],
            Some(var("x")),
        );
        a.analyze(&mut Item::Function(h)).unwrap();
        a
    }

    fn flowed(body: Vec<Stmt>) -> Vec<Stmt> {
        let mut a = analyzer_with_task();
        let mut item = Item::Function(task(proto("user", vec![], None), body, None));
        a.analyze(&mut item).unwrap();
        FutureFlow::new().run(&mut item);
        let Item::Function(f) = item else { unreachable!() };
        f.body
    }

    fn lhs_is_future(stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Assign(a) => a.lhs.ty.is_future(),
            Stmt::VarDecl(d) => d.ty.is_future(),
            _ => false,
        }
    }

    #[test]
    fn future_marks_are_transitive() {
        let body = flowed(vec![
            assign(var("a"), call("t", vec![])),
            assign(var("b"), var("a")),
            assign(var("c"), int(5)),
            assign(var("c"), var("b")),
            assign(var("d"), int(1)),
        ]);
        let marks: Vec<bool> = body.iter().map(lhs_is_future).collect();
        assert_eq!(marks, [true, true, true, true, false]);
    }

    #[test]
    fn reads_before_the_future_assignment_are_marked_too() {
        let body = flowed(vec![
            assign(var("c"), int(5)),
            decl("e", None, var("c")),
            assign(var("c"), call("t", vec![])),
        ]);
        let Stmt::VarDecl(e) = &body[1] else { unreachable!() };
        assert!(e.init.ty.is_future());
        assert!(e.ty.is_future());
    }

    #[test]
    fn annotated_declarations_stay_synchronous() {
        let body = flowed(vec![
            assign(var("f"), call("t", vec![])),
            decl("g", Some(scalar("i64")), var("f")),
            assign(var("g"), var("f")),
        ]);
        assert!(lhs_is_future(&body[0]));
        assert!(!lhs_is_future(&body[1]));
        assert!(!lhs_is_future(&body[2]));
    }

    #[test]
    fn ordinary_calls_take_resolved_arguments() {
        let body = flowed(vec![
            assign(var("f"), call("t", vec![])),
            decl("y", None, call("h", vec![var("f")])),
        ]);
        let Stmt::VarDecl(y) = &body[1] else { unreachable!() };
        let ExprKind::Call(c) = &y.init.kind else { unreachable!() };
        assert!(!c.args[0].ty.is_future());
        assert!(!y.ty.is_future());
    }
}
