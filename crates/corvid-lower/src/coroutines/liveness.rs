//! Values that must survive a suspension.
//!
//! The analysis is a scope walk, not a dataflow analysis: at every suspension
//! point everything visible is considered live. Composite blocks (state
//! bodies among them) do not open a scope, so a value declared in one state
//! stays visible in the states numbered after it.

use crate::coroutines::classify::SuspendableNodes;
use corvid_ir::{Expr, ExprId, ExprKind, IrModule, VarId};
use rustc_hash::FxHashSet;

/// Values that must survive suspension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessInfo {
    /// Visible values at each suspension point, in walk order.
    pub per_point: Vec<(ExprId, Vec<VarId>)>,
    /// Union over all points, first seen first.
    pub live: Vec<VarId>,
}

impl LivenessInfo {
    pub fn is_live(&self, var: VarId) -> bool {
        self.live.contains(&var)
    }
}

/// Values visible at the suspension points of `stmts`. `params` are visible
/// everywhere; `excluded` values are never reported.
pub fn compute_liveness_at_suspension_points(
    module: &IrModule,
    stmts: &[Expr],
    nodes: &SuspendableNodes,
    params: &[VarId],
    excluded: &[VarId],
) -> LivenessInfo {
    let mut walker = ScopeWalker {
        nodes,
        excluded: excluded.iter().copied().collect(),
        scopes: vec![params.to_vec()],
        info: LivenessInfo::default(),
        seen: FxHashSet::default(),
    };
    for stmt in stmts {
        walker.visit(stmt);
    }
    tracing::trace!(
        target: "corvid_lower::coroutines",
        points = walker.info.per_point.len(),
        live = walker.info.live.len(),
        values = module.var_count(),
        "liveness computed"
    );
    walker.info
}

struct ScopeWalker<'a> {
    nodes: &'a SuspendableNodes,
    excluded: FxHashSet<VarId>,
    scopes: Vec<Vec<VarId>>,
    info: LivenessInfo,
    seen: FxHashSet<VarId>,
}

impl ScopeWalker<'_> {
    fn declare(&mut self, var: VarId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(var);
        }
    }

    fn with_scope(&mut self, f: impl FnOnce(&mut Self)) {
        self.scopes.push(Vec::new());
        f(self);
        self.scopes.pop();
    }

    fn visit(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Block {
                stmts,
                transparent: false,
            } => self.with_scope(|w| {
                for stmt in stmts {
                    w.visit(stmt);
                }
            }),
            ExprKind::VarDecl { var, init } => {
                if let Some(init) = init {
                    self.visit(init);
                }
                self.declare(*var);
            }
            ExprKind::Try {
                body,
                catches,
                finally,
            } => {
                self.visit(body);
                for catch in catches {
                    self.with_scope(|w| {
                        w.declare(catch.param);
                        w.visit(&catch.body);
                    });
                }
                if let Some(finally) = finally {
                    self.visit(finally);
                }
            }
            ExprKind::Lambda { .. } | ExprKind::Declaration(_) => {}
            _ => e.visit_children(&mut |child| self.visit(child)),
        }

        if self.nodes.is_suspension_point(e.id) {
            self.record(e.id);
        }
    }

    fn record(&mut self, point: ExprId) {
        let visible: Vec<VarId> = self
            .scopes
            .iter()
            .flatten()
            .copied()
            .filter(|v| !self.excluded.contains(v))
            .collect();
        for &var in &visible {
            if self.seen.insert(var) {
                self.info.live.push(var);
            }
        }
        self.info.per_point.push((point, visible));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutines::classify::classify_suspension_points;
    use corvid_ir::{DeclParent, FunctionDecl, IrBuilder, Type};

    #[test]
    fn test_visible_locals_at_point() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let fetch = b.function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Unit).suspend());
        let p = b.local("p", Type::Int);
        let a = b.local("a", Type::Int);
        let hidden = b.local("hidden", Type::Int);
        let after = b.local("after", Type::Int);

        let zero = b.int(0);
        let decl_hidden = b.decl_var(hidden, Some(zero));
        let scoped = b.block(vec![decl_hidden]);
        let one = b.int(1);
        let decl_a = b.decl_var(a, Some(one));
        let call = b.call(fetch, vec![]);
        let call_id = call.id;
        let two = b.int(2);
        let decl_after = b.decl_var(after, Some(two));
        let stmts = vec![scoped, decl_a, call, decl_after];

        let nodes = classify_suspension_points(&m, &stmts);
        let info = compute_liveness_at_suspension_points(&m, &stmts, &nodes, &[p], &[]);
        assert_eq!(info.per_point, vec![(call_id, vec![p, a])]);
        assert!(!info.is_live(hidden));
        assert!(!info.is_live(after));
    }

    #[test]
    fn test_composite_does_not_open_scope_and_excluded_are_skipped() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let fetch = b.function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Unit).suspend());
        let reserved = b.local_var("suspendResult", Type::nullable_any());
        let a = b.local("a", Type::Int);

        let init = b.null();
        let decl_reserved = b.decl_var(reserved, Some(init));
        let one = b.int(1);
        let decl_a = b.decl_var(a, Some(one));
        let first_state = b.composite(vec![decl_a]);
        let call = b.call(fetch, vec![]);
        let second_state = b.composite(vec![call]);
        let stmts = vec![decl_reserved, first_state, second_state];

        let nodes = classify_suspension_points(&m, &stmts);
        let info = compute_liveness_at_suspension_points(&m, &stmts, &nodes, &[], &[reserved]);
        assert_eq!(info.live, vec![a]);
    }

    #[test]
    fn test_union_keeps_first_seen_order() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let fetch = b.function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Unit).suspend());
        let a = b.local("a", Type::Int);
        let c = b.local("c", Type::Int);

        let one = b.int(1);
        let decl_a = b.decl_var(a, Some(one));
        let first = b.call(fetch, vec![]);
        let two = b.int(2);
        let decl_c = b.decl_var(c, Some(two));
        let second = b.call(fetch, vec![]);
        let stmts = vec![decl_a, first, decl_c, second];

        let nodes = classify_suspension_points(&m, &stmts);
        let info = compute_liveness_at_suspension_points(&m, &stmts, &nodes, &[], &[]);
        assert_eq!(info.per_point.len(), 2);
        assert_eq!(info.live, vec![a, c]);
    }
}
