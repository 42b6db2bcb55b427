//! Suspension point classification.
//!
//! Marks every node of a body by its suspension behavior:
//! - **Suspension point**: a call whose target is a suspend function, or an
//!   invocation of a value of suspend function type
//! - **Suspendable**: a node containing a suspension point, a loop containing
//!   one, or a `break`/`continue` leaving such a loop
//! - everything else is copied verbatim into the state it falls in.
//!
//! Function literals and local declarations are opaque: their bodies are
//! separate functions.

use corvid_ir::{Expr, ExprId, ExprKind, IrModule};
use rustc_hash::FxHashSet;

/// Classification result for one body.
#[derive(Debug, Clone, Default)]
pub struct SuspendableNodes {
    points: FxHashSet<ExprId>,
    suspendable: FxHashSet<ExprId>,
    /// Loops that will be rebuilt out of states.
    loops: FxHashSet<ExprId>,
    /// Suspension points in source order.
    ordered_points: Vec<ExprId>,
}

impl SuspendableNodes {
    pub fn is_suspension_point(&self, id: ExprId) -> bool {
        self.points.contains(&id)
    }

    pub fn is_suspendable(&self, id: ExprId) -> bool {
        self.suspendable.contains(&id)
    }

    pub fn is_suspendable_loop(&self, id: ExprId) -> bool {
        self.loops.contains(&id)
    }

    pub fn has_suspension_points(&self) -> bool {
        !self.points.is_empty()
    }

    pub fn suspension_points(&self) -> &[ExprId] {
        &self.ordered_points
    }
}

/// True if `expr` suspends by itself (its arguments aside).
pub fn is_suspension_point(module: &IrModule, expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Call { callee, .. } => match module.function(*callee) {
            Some(f) => f.is_suspend,
            None => {
                // Unresolved target: treated as non-suspending
                tracing::warn!(
                    target: "corvid_lower::coroutines",
                    callee = %callee,
                    "call target is not a function; assuming it does not suspend"
                );
                false
            }
        },
        ExprKind::Invoke { callee, .. } => callee.ty.is_suspend_function(),
        _ => false,
    }
}

/// Classify every node of `stmts`. Never mutates the tree.
pub fn classify_suspension_points(module: &IrModule, stmts: &[Expr]) -> SuspendableNodes {
    let mut nodes = SuspendableNodes::default();
    for stmt in stmts {
        stmt.walk(&mut |e| {
            if is_suspension_point(module, e) {
                nodes.points.insert(e.id);
                nodes.ordered_points.push(e.id);
            }
        });
    }

    // A loop becomes suspendable once a jump out of it is, so iterate until
    // the loop set is stable.
    loop {
        let loops_before = nodes.loops.len();
        nodes.suspendable.clear();
        for stmt in stmts {
            mark(stmt, &mut nodes);
        }
        if nodes.loops.len() == loops_before {
            break;
        }
    }
    nodes
}

fn mark(e: &Expr, nodes: &mut SuspendableNodes) -> bool {
    let mut suspendable = nodes.points.contains(&e.id);
    match &e.kind {
        ExprKind::Lambda { .. } | ExprKind::Declaration(_) => return false,
        ExprKind::Break { target } | ExprKind::Continue { target } => {
            suspendable |= nodes.loops.contains(target);
        }
        _ => {}
    }
    e.visit_children(&mut |child| {
        if mark(child, nodes) {
            suspendable = true;
        }
    });
    if suspendable {
        nodes.suspendable.insert(e.id);
        if matches!(e.kind, ExprKind::Loop { .. }) {
            nodes.loops.insert(e.id);
        }
    }
    suspendable
}
