//! Local declarations of inline lambdas.
//!
//! A lambda passed to an inline parameter is copied into every call site of
//! the inline function. Local classes and functions it declares are moved in
//! front of the call, into a block `{ declarations; call }`, so the inliner
//! copies only the code that uses them.

use crate::context::LoweringContext;
use crate::error::LowerResult;
use crate::inline::captures::{convert_captures, Scope};
use crate::pass::BodyLoweringPass;
use crate::report::ExtractionRecord;
use crate::rewrite::rewrite_deep;
use corvid_ir::{Body, DeclId, DeclKind, DeclParent, Expr, ExprKind, IrBuilder, IrModule};
use rustc_hash::FxHashSet;

/// Moves local classes and functions declared in inline lambda arguments out
/// to the enclosing container.
#[derive(Debug, Default)]
pub struct LocalClassesInInlineLambdasLowering;

/// Local declarations found in the inline lambdas of one call.
#[derive(Debug, Default)]
struct Collected {
    declarations: Vec<DeclId>,
    /// Inline lambdas of nested inline calls, left for when those calls are
    /// lowered.
    adapted_functions: FxHashSet<DeclId>,
}

impl BodyLoweringPass for LocalClassesInInlineLambdasLowering {
    fn name(&self) -> &'static str {
        "LocalClassesInInlineLambdasLowering"
    }

    fn lower_body(
        &mut self,
        cx: &mut LoweringContext<'_>,
        body: &mut Body,
        container: DeclId,
    ) -> LowerResult<()> {
        for stmt in &mut body.stmts {
            self.transform(cx, stmt, container)?;
        }
        Ok(())
    }
}

impl LocalClassesInInlineLambdasLowering {
    fn transform(&mut self, cx: &mut LoweringContext<'_>, e: &mut Expr, owner: DeclId) -> LowerResult<()> {
        if matches!(e.kind, ExprKind::Call { callee, .. } if cx.module.is_inline(callee)) {
            return self.lower_inline_call(cx, e, owner);
        }
        match &mut e.kind {
            ExprKind::Declaration(d) | ExprKind::Lambda { function: d } => {
                let d = *d;
                return self.transform_declaration(cx, d);
            }
            ExprKind::FunctionRef {
                function,
                bound,
                adapted: true,
            } => {
                let function = *function;
                for value in bound.iter_mut() {
                    self.transform(cx, value, owner)?;
                }
                return self.transform_declaration(cx, function);
            }
            _ => {}
        }
        let mut result = Ok(());
        e.visit_children_mut(&mut |child| {
            if result.is_ok() {
                result = self.transform(cx, child, owner);
            }
        });
        result
    }

    fn transform_declaration(&mut self, cx: &mut LoweringContext<'_>, decl: DeclId) -> LowerResult<()> {
        let members = match &cx.module.decl(decl).kind {
            DeclKind::Class(c) => c.members.clone(),
            DeclKind::Function(_) => {
                let Some(mut body) = cx.module.take_body(decl) else {
                    return Ok(());
                };
                let mut result = Ok(());
                for stmt in &mut body.stmts {
                    result = self.transform(cx, stmt, decl);
                    if result.is_err() {
                        break;
                    }
                }
                cx.module.set_body(decl, body);
                return result;
            }
            _ => return Ok(()),
        };
        for member in members {
            self.transform_declaration(cx, member)?;
        }
        Ok(())
    }

    fn lower_inline_call(&mut self, cx: &mut LoweringContext<'_>, e: &mut Expr, owner: DeclId) -> LowerResult<()> {
        let ExprKind::Call { callee, args } = &mut e.kind else {
            return Ok(());
        };
        let params: Vec<_> = cx
            .module
            .function(*callee)
            .map(|f| f.value_params().collect())
            .unwrap_or_default();

        let mut lambdas = Vec::new();
        for (i, arg) in args.iter_mut().enumerate() {
            let inline_param = params
                .get(i)
                .is_some_and(|&p| cx.module.var(p).is_inline_param());
            match inline_lambda(arg).filter(|_| inline_param) {
                Some(lambda) => lambdas.push(lambda),
                None => self.transform(cx, arg, owner)?,
            }
        }

        let mut collected = Collected::default();
        for &lambda in &lambdas {
            self.collect_in_function(cx, lambda, &mut collected)?;
        }
        if collected.declarations.is_empty() {
            return Ok(());
        }

        let mut outer = Scope::default();
        for &lambda in &lambdas {
            let scope = Scope::of_function(cx.module, lambda, &collected.adapted_functions);
            outer.values.extend(scope.values);
            outer.decls.extend(scope.decls);
        }
        let converted = convert_captures(cx, std::slice::from_mut(e), &collected.declarations, &outer);
        if converted.is_empty() {
            return Ok(());
        }

        let moved: FxHashSet<DeclId> = converted.iter().map(|c| c.decl).collect();
        rewrite_deep(cx.module, std::slice::from_mut(e), &mut |m, x| {
            if matches!(x.kind, ExprKind::Declaration(d) if moved.contains(&d)) {
                *x = IrBuilder::new(m).composite(Vec::new());
            }
        });

        let parent = cx.module.nearest_non_lambda(owner);
        let parent_name = parent_name(cx.module, parent);
        let mut stmts = Vec::with_capacity(converted.len() + 1);
        for c in &converted {
            cx.module.set_parent(c.decl, parent);
            let captured = c.captured.iter().map(|&v| cx.module.var(v).name.clone()).collect();
            tracing::debug!(
                target: "corvid_lower::inline",
                decl = %cx.module.render_decl(c.decl),
                parent = %parent_name,
                adapted = collected.adapted_functions.len(),
                "local declaration moved out of inline lambda"
            );
            cx.report.extracted.push(ExtractionRecord {
                declaration: cx.module.name(c.decl).to_string(),
                new_parent: parent_name.clone(),
                captured,
            });
            stmts.push(cx.builder().declaration(c.decl));
        }
        let call = std::mem::replace(e, Expr::placeholder());
        stmts.push(call);
        *e = cx.builder().block(stmts);
        Ok(())
    }

    fn collect_in_function(
        &mut self,
        cx: &mut LoweringContext<'_>,
        function: DeclId,
        collected: &mut Collected,
    ) -> LowerResult<()> {
        let Some(body) = cx.module.take_body(function) else {
            return Ok(());
        };
        let mut result = Ok(());
        for stmt in &body.stmts {
            result = self.collect(cx, stmt, collected);
            if result.is_err() {
                break;
            }
        }
        cx.module.set_body(function, body);
        result
    }

    fn collect(&mut self, cx: &mut LoweringContext<'_>, e: &Expr, collected: &mut Collected) -> LowerResult<()> {
        match &e.kind {
            ExprKind::Declaration(d) => {
                let d = *d;
                // Delegated properties keep their accessors in place
                let movable = matches!(
                    cx.module.decl(d).kind,
                    DeclKind::Class(_) | DeclKind::Function(_)
                );
                if movable {
                    self.transform_declaration(cx, d)?;
                    collected.declarations.push(d);
                }
                Ok(())
            }
            ExprKind::Lambda { function } => self.collect_in_function(cx, *function, collected),
            ExprKind::FunctionRef {
                function,
                bound,
                adapted: true,
            } => {
                for value in bound {
                    self.collect(cx, value, collected)?;
                }
                self.collect_in_function(cx, *function, collected)
            }
            ExprKind::Call { callee, args } if cx.module.is_inline(*callee) => {
                let params: Vec<_> = cx
                    .module
                    .function(*callee)
                    .map(|f| f.value_params().collect())
                    .unwrap_or_default();
                for (i, arg) in args.iter().enumerate() {
                    let inline_param = params
                        .get(i)
                        .is_some_and(|&p| cx.module.var(p).is_inline_param());
                    match inline_lambda(arg).filter(|_| inline_param) {
                        Some(lambda) => {
                            collected.adapted_functions.insert(lambda);
                        }
                        None => self.collect(cx, arg, collected)?,
                    }
                }
                Ok(())
            }
            _ => {
                let mut result = Ok(());
                e.visit_children(&mut |child| {
                    if result.is_ok() {
                        result = self.collect(cx, child, collected);
                    }
                });
                result
            }
        }
    }
}

/// Function of a lambda or adapted reference argument.
fn inline_lambda(arg: &Expr) -> Option<DeclId> {
    match arg.kind {
        ExprKind::Lambda { function } => Some(function),
        ExprKind::FunctionRef {
            function,
            adapted: true,
            ..
        } => Some(function),
        _ => None,
    }
}

pub(crate) fn parent_name(module: &IrModule, parent: DeclParent) -> String {
    match parent {
        DeclParent::File(file) => module.file(file).name.clone(),
        DeclParent::Decl(decl) => module.qualified_name(decl),
    }
}
