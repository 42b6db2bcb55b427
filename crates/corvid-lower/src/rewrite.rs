//! Tree rewriting across nested declaration bodies.
//!
//! Function literals and local declarations keep their bodies in the arena,
//! not in the tree of the enclosing function. Remapping a value or a return
//! target of a function must reach those bodies too.

use corvid_ir::{DeclId, DeclKind, DeclParent, Expr, ExprKind, IrModule, VarId};
use rustc_hash::FxHashMap;

/// Declarations whose bodies belong to the code of the enclosing function.
pub(crate) fn nested_declaration(e: &Expr) -> Option<DeclId> {
    match e.kind {
        ExprKind::Declaration(d) | ExprKind::Lambda { function: d } => Some(d),
        ExprKind::FunctionRef {
            function,
            adapted: true,
            ..
        } => Some(function),
        _ => None,
    }
}

/// Post-order rewrite of `stmts` and of every nested declaration body.
pub(crate) fn rewrite_deep(
    module: &mut IrModule,
    stmts: &mut [Expr],
    f: &mut dyn FnMut(&mut IrModule, &mut Expr),
) {
    let mut nested = Vec::new();
    for stmt in stmts.iter_mut() {
        stmt.walk_mut(&mut |e| {
            if let Some(d) = nested_declaration(e) {
                nested.push(d);
            }
            f(module, e);
        });
    }
    for decl in nested {
        rewrite_declaration_deep(module, decl, f);
    }
}

pub(crate) fn rewrite_declaration_deep(
    module: &mut IrModule,
    decl: DeclId,
    f: &mut dyn FnMut(&mut IrModule, &mut Expr),
) {
    let members = match &module.decl(decl).kind {
        DeclKind::Function(_) => None,
        DeclKind::Class(class) => Some(class.members.clone()),
        _ => return,
    };
    match members {
        None => {
            module.with_body(decl, |m, body| rewrite_deep(m, &mut body.stmts, f));
        }
        Some(members) => {
            for member in members {
                rewrite_declaration_deep(module, member, f);
            }
        }
    }
}

/// Pre-order read-only walk of `stmts` and every nested declaration body.
pub(crate) fn walk_deep(module: &IrModule, stmts: &[Expr], f: &mut dyn FnMut(&Expr)) {
    let mut nested = Vec::new();
    for stmt in stmts {
        stmt.walk(&mut |e| {
            if let Some(d) = nested_declaration(e) {
                nested.push(d);
            }
            f(e);
        });
    }
    for decl in nested {
        walk_declaration_deep(module, decl, f);
    }
}

pub(crate) fn walk_declaration_deep(module: &IrModule, decl: DeclId, f: &mut dyn FnMut(&Expr)) {
    match &module.decl(decl).kind {
        DeclKind::Function(function) => {
            if let Some(body) = &function.body {
                walk_deep(module, &body.stmts, f);
            }
        }
        DeclKind::Class(class) => {
            for &member in &class.members {
                walk_declaration_deep(module, member, f);
            }
        }
        _ => {}
    }
}

/// Replace value references according to `mapping`.
pub(crate) fn remap_values(module: &mut IrModule, stmts: &mut [Expr], mapping: &FxHashMap<VarId, VarId>) {
    if mapping.is_empty() {
        return;
    }
    rewrite_deep(module, stmts, &mut |_, e| match &mut e.kind {
        ExprKind::GetVar(v) | ExprKind::SetVar { var: v, .. } | ExprKind::VarDecl { var: v, .. } => {
            if let Some(&to) = mapping.get(v) {
                *v = to;
            }
        }
        _ => {}
    });
}

/// Move returns from `from` to `to`, including non-local returns in lambdas.
pub(crate) fn retarget_returns(module: &mut IrModule, stmts: &mut [Expr], from: DeclId, to: DeclId) {
    rewrite_deep(module, stmts, &mut |_, e| {
        if let ExprKind::Return { target, .. } = &mut e.kind {
            if *target == from {
                *target = to;
            }
        }
    });
}

/// Reparent local declarations directly owned by `from` to `to`.
pub(crate) fn reparent_locals(module: &mut IrModule, stmts: &[Expr], from: DeclId, to: DeclId) {
    let mut locals = Vec::new();
    for stmt in stmts {
        stmt.walk(&mut |e| {
            if let Some(d) = nested_declaration(e) {
                locals.push(d);
            }
        });
    }
    for decl in locals {
        if module.decl(decl).parent == DeclParent::Decl(from) {
            module.set_parent(decl, DeclParent::Decl(to));
        }
    }
}
