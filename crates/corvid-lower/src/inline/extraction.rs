//! Local classes of inline functions.
//!
//! Every call site of an inline function receives a copy of its body. A local
//! class of that body does not need a copy per call site when nothing in it
//! depends on the call: such a class is moved to the nearest file or class and
//! shared. Classes reading a `crossinline` parameter, and all local classes of
//! functions with reified type parameters, stay in the body and are copied.

use crate::context::LoweringContext;
use crate::error::LowerResult;
use crate::inline::captures::{convert_captures, Scope};
use crate::inline::local_classes::parent_name;
use crate::pass::BodyLoweringPass;
use crate::report::ExtractionRecord;
use crate::rewrite::{nested_declaration, rewrite_deep, walk_declaration_deep};
use corvid_ir::{Body, DeclId, Expr, ExprKind, IrBuilder, IrModule, VarId};
use rustc_hash::FxHashSet;

/// What the inliner does with a local class of an inline function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPolicy {
    /// Shared by all call sites after being moved out of the body.
    Relocate,
    /// Copied into every call site with the body.
    Copy,
}

/// Copy policy of the local class `class` declared in `function`.
pub fn copy_policy(module: &IrModule, function: DeclId, class: DeclId) -> CopyPolicy {
    let Some(f) = module.function(function) else {
        return CopyPolicy::Copy;
    };
    if !f.is_inline || f.has_reified_type_params() {
        return CopyPolicy::Copy;
    }
    let crossinline = crossinline_params(module, function);
    if reads_any(module, class, &crossinline) {
        CopyPolicy::Copy
    } else {
        CopyPolicy::Relocate
    }
}

/// Append the local classes of `function` that can leave its body to `out`.
pub fn collect_extractable_local_classes_into(module: &IrModule, function: DeclId, out: &mut Vec<DeclId>) {
    let Some(body) = module.function(function).and_then(|f| f.body.as_ref()) else {
        return;
    };
    collect_in_stmts(module, function, &body.stmts, out);
}

fn collect_in_stmts(module: &IrModule, function: DeclId, stmts: &[Expr], out: &mut Vec<DeclId>) {
    let Some(f) = module.function(function) else {
        return;
    };
    if !f.is_inline || f.has_reified_type_params() {
        return;
    }
    let crossinline = crossinline_params(module, function);
    let mut classes = Vec::new();
    local_classes(module, stmts, &mut classes);
    for class in classes {
        if !reads_any(module, class, &crossinline) && !out.contains(&class) {
            out.push(class);
        }
    }
}

/// Local classes declared in `stmts` or in the bodies of lambdas and local
/// functions, but not inside other local classes.
fn local_classes(module: &IrModule, stmts: &[Expr], out: &mut Vec<DeclId>) {
    let mut functions = Vec::new();
    for stmt in stmts {
        stmt.walk(&mut |e| {
            if let Some(d) = nested_declaration(e) {
                if module.is_class(d) {
                    out.push(d);
                } else {
                    functions.push(d);
                }
            }
        });
    }
    for function in functions {
        if let Some(body) = module.function(function).and_then(|f| f.body.as_ref()) {
            local_classes(module, &body.stmts, out);
        }
    }
}

fn crossinline_params(module: &IrModule, function: DeclId) -> FxHashSet<VarId> {
    module
        .function(function)
        .map(|f| {
            f.params
                .iter()
                .copied()
                .filter(|&p| module.var(p).is_crossinline())
                .collect()
        })
        .unwrap_or_default()
}

fn reads_any(module: &IrModule, decl: DeclId, values: &FxHashSet<VarId>) -> bool {
    if values.is_empty() {
        return false;
    }
    let mut found = false;
    walk_declaration_deep(module, decl, &mut |e| {
        if let ExprKind::GetVar(v) = e.kind {
            found |= values.contains(&v);
        }
    });
    found
}

/// Moves local classes and functions out of inline function bodies. Call
/// sites then share one copy of each.
#[derive(Debug, Default)]
pub struct LocalClassesExtractionFromInlineFunctionsLowering;

impl BodyLoweringPass for LocalClassesExtractionFromInlineFunctionsLowering {
    fn name(&self) -> &'static str {
        "LocalClassesExtractionFromInlineFunctionsLowering"
    }

    fn lower_body(
        &mut self,
        cx: &mut LoweringContext<'_>,
        body: &mut Body,
        container: DeclId,
    ) -> LowerResult<()> {
        let mut classes = Vec::new();
        collect_in_stmts(cx.module, container, &body.stmts, &mut classes);
        if classes.is_empty() {
            return Ok(());
        }

        let outer = Scope::of_body(cx.module, container, &body.stmts, &FxHashSet::default());
        let converted = convert_captures(cx, &mut body.stmts, &classes, &outer);
        if converted.is_empty() {
            return Ok(());
        }

        let moved: FxHashSet<DeclId> = converted.iter().map(|c| c.decl).collect();
        rewrite_deep(cx.module, &mut body.stmts, &mut |m, e| {
            if matches!(e.kind, ExprKind::Declaration(d) if moved.contains(&d)) {
                *e = IrBuilder::new(m).composite(Vec::new());
            }
        });

        let target = cx.module.nearest_container(container);
        let target_name = parent_name(cx.module, target);
        for c in converted {
            cx.module.push_member(target, c.decl);
            tracing::debug!(
                target: "corvid_lower::inline",
                class = %cx.module.render_decl(c.decl),
                function = %cx.module.render_decl(container),
                container = %target_name,
                "local class moved out of inline function"
            );
            let captured = c
                .captured
                .iter()
                .map(|&v| cx.module.var(v).name.clone())
                .collect();
            cx.report.extracted.push(ExtractionRecord {
                declaration: cx.module.name(c.decl).to_string(),
                new_parent: target_name.clone(),
                captured,
            });
        }
        Ok(())
    }
}
