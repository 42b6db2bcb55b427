//! Suspend function lowering.
//!
//! [`lower_suspend_function`] picks one of three shapes per function:
//!
//! - no suspension points: the stub runs the body and ignores `$completion`
//! - only suspend tail calls: the stub forwards `$completion`
//! - otherwise: a continuation class with a state machine resume method,
//!   and a stub body that starts it.
//!
//! [`SuspendFunctionsLowering`] applies it to member declarations,
//! [`LocalSuspendFunctionsLowering`] to local functions and suspend lambdas.

use crate::context::LoweringContext;
use crate::coroutines::classify::{classify_suspension_points, SuspendableNodes};
use crate::coroutines::continuation::{
    create_continuation_class, ContinuationClass, ContinuationSynthesizer, LiveLocalsTransformer,
};
use crate::coroutines::liveness::compute_liveness_at_suspension_points;
use crate::coroutines::state_machine::StateMachineBuilder;
use crate::coroutines::stubs::{
    transform_suspend_function, LoweredSuspendFunction, LoweringStrategy,
};
use crate::coroutines::tail_call::{collect_tail_calls, generate_delegated_call, rewrite_tail_calls};
use crate::error::{LowerError, LowerResult};
use crate::pass::{BodyLoweringPass, DeclarationTransformer};
use crate::report::StateMachineSummary;
use corvid_ir::{Body, DeclId, DeclKind, DeclParent, Expr, ExprKind, Type, ValueDecl, VarId};

/// Lower `function`, or return what an earlier request produced.
pub fn lower_suspend_function(
    cx: &mut LoweringContext<'_>,
    function: DeclId,
) -> LowerResult<LoweredSuspendFunction> {
    let module_id = cx.module_id();
    if let Some(done) = cx.stubs().lowered(module_id, function) {
        return Ok(done);
    }
    if !cx.module.is_suspend(function) {
        return Err(LowerError::precondition(
            cx.module.render_decl(function),
            "suspend lowering requested for a non-suspend function",
        ));
    }

    let name = cx.module.qualified_name(function);
    let has_body = cx
        .module
        .function(function)
        .is_some_and(|f| f.body.is_some());
    let stub = transform_suspend_function(cx, function)?;

    let strategy = match cx.module.take_body(stub) {
        None => LoweringStrategy::Plain,
        Some(body) => {
            let mut stmts = body.stmts;
            let nodes = classify_suspension_points(cx.module, &stmts);
            let tails = if nodes.has_suspension_points() && cx.config.tail_call_optimization {
                collect_tail_calls(cx.module, &stmts, &nodes, stub)
            } else {
                None
            };

            let strategy = if !nodes.has_suspension_points() {
                LoweringStrategy::Plain
            } else if let Some(tails) = tails {
                rewrite_tail_calls(cx, &mut stmts, stub, &tails)?;
                LoweringStrategy::TailCall
            } else {
                let (strategy, start) = build_coroutine(cx, function, stub, stmts, &nodes, &name)?;
                stmts = start;
                strategy
            };
            cx.module.set_body(stub, Body::new(stmts));
            strategy
        }
    };

    match strategy {
        LoweringStrategy::Plain if has_body => cx.report.plain_functions.push(name.clone()),
        LoweringStrategy::TailCall => cx.report.tail_call_functions.push(name.clone()),
        _ => {}
    }
    tracing::debug!(
        target: "corvid_lower::coroutines",
        function = %name,
        strategy = ?strategy,
        "lowered suspend function"
    );

    let lowered = LoweredSuspendFunction {
        original: function,
        stub,
        strategy,
    };
    cx.stubs().record_lowered(module_id, lowered);
    Ok(lowered)
}

/// Build the continuation class and resume method of `function`. Returns the
/// strategy and the stub body that starts the coroutine.
fn build_coroutine(
    cx: &mut LoweringContext<'_>,
    function: DeclId,
    stub: DeclId,
    stmts: Vec<Expr>,
    nodes: &SuspendableNodes,
    name: &str,
) -> LowerResult<(LoweringStrategy, Vec<Expr>)> {
    let cont = create_continuation_class(cx, function, stub)?;
    let machine = StateMachineBuilder::new(cx, nodes, cont.slots, stub, cont.resume).build(stmts)?;
    if cx.config.verify_state_machines {
        machine.verify()?;
    }
    let state_count = machine.state_count();
    let successors = machine.successor_ids();
    let reserved = machine.reserved_locals();
    let mut resume_body = machine.into_resume_body(cx);

    // Fields for live locals are created only now that states are numbered
    let params: Vec<VarId> = cont.arguments.iter().map(|&(p, _)| p).collect();
    let liveness =
        compute_liveness_at_suspension_points(cx.module, &resume_body.stmts, nodes, &params, &reserved);
    let mut synthesizer = ContinuationSynthesizer::new(cont.slots.class);
    let promoted = synthesizer.promote_all(cx.module, &liveness.live, &cont.arguments);
    LiveLocalsTransformer::new(
        cont.slots.this,
        cont.arguments.iter().chain(&promoted).copied(),
    )
    .run(cx.module, &mut resume_body.stmts);
    cx.module.set_body(cont.resume, resume_body);

    let start = coroutine_start(cx, stub, &cont)?;

    let summary = StateMachineSummary {
        function: name.to_string(),
        continuation_class: cx.module.qualified_name(cont.slots.class),
        state_count,
        successors,
        live_local_fields: promoted
            .iter()
            .map(|&(_, field)| cx.module.name(field).to_string())
            .collect(),
        argument_fields: cont
            .arguments
            .iter()
            .map(|&(_, field)| cx.module.name(field).to_string())
            .collect(),
    };
    tracing::debug!(
        target: "corvid_lower::coroutines",
        function = %name,
        states = summary.state_count,
        live_locals = summary.live_local_fields.len(),
        "built state machine"
    );
    cx.report.state_machines.push(summary);

    Ok((
        LoweringStrategy::StateMachine {
            class: cont.slots.class,
            resume: cont.resume,
        },
        start,
    ))
}

/// Stub body of a function with a state machine:
///
/// ```text
/// val $cont = C(args..., $completion)
/// $cont.result = Unit
/// $cont.exception = null
/// return $cont.doResume()
/// ```
fn coroutine_start(
    cx: &mut LoweringContext<'_>,
    stub: DeclId,
    cont: &ContinuationClass,
) -> LowerResult<Vec<Expr>> {
    let (args, return_type) = match cx.module.function(stub) {
        Some(f) => (f.value_params().collect::<Vec<_>>(), f.return_type.clone()),
        None => {
            return Err(LowerError::precondition(
                cx.module.render_decl(stub),
                "coroutine start requested for a non-function stub",
            ))
        }
    };
    let slots = cont.slots;
    let cont_var = cx
        .module
        .add_var(ValueDecl::local("$cont", Type::Class(slots.class), false));

    let mut b = cx.builder();
    let args: Vec<Expr> = args.into_iter().map(|a| b.get(a)).collect();
    let created = b.new_object(slots.class, args);
    let decl = b.decl_var(cont_var, Some(created));
    let target = b.get(cont_var);
    let unit = b.unit();
    let reset_result = b.set_field(target, slots.result, unit);
    let target = b.get(cont_var);
    let null = b.null();
    let reset_exception = b.set_field(target, slots.exception, null);
    let receiver = b.get(cont_var);
    let resume = b.call(cont.resume, vec![receiver]);

    let from = Type::nullable_any();
    let value = generate_delegated_call(cx, &return_type, &from, resume, stub);
    let ret = cx.builder().ret(stub, value);
    Ok(vec![decl, reset_result, reset_exception, ret])
}

/// Replaces member suspend functions by their continuation class (if any)
/// and stub.
#[derive(Debug, Default)]
pub struct SuspendFunctionsLowering;

impl DeclarationTransformer for SuspendFunctionsLowering {
    fn name(&self) -> &'static str {
        "SuspendFunctionsLowering"
    }

    fn transform_flat(
        &mut self,
        cx: &mut LoweringContext<'_>,
        decl: DeclId,
    ) -> LowerResult<Option<Vec<DeclId>>> {
        if !cx.module.is_suspend(decl) {
            return Ok(None);
        }
        let lowered = lower_suspend_function(cx, decl)?;
        Ok(Some(lowered.declarations()))
    }
}

/// Lowers suspend functions declared inside bodies: local suspend functions,
/// suspend lambdas, and suspend members of local classes. A generated
/// continuation class is declared right where the function was.
#[derive(Debug, Default)]
pub struct LocalSuspendFunctionsLowering;

impl BodyLoweringPass for LocalSuspendFunctionsLowering {
    fn name(&self) -> &'static str {
        "LocalSuspendFunctionsLowering"
    }

    fn lower_body(
        &mut self,
        cx: &mut LoweringContext<'_>,
        body: &mut Body,
        _container: DeclId,
    ) -> LowerResult<()> {
        for stmt in &mut body.stmts {
            self.lower_expr(cx, stmt)?;
        }
        Ok(())
    }
}

impl LocalSuspendFunctionsLowering {
    fn lower_expr(&mut self, cx: &mut LoweringContext<'_>, e: &mut Expr) -> LowerResult<()> {
        match e.kind {
            ExprKind::Declaration(decl) => {
                if cx.module.is_class(decl) {
                    return self.lower_local_class(cx, decl);
                }
                self.lower_nested_body(cx, decl)?;
                if cx.module.is_suspend(decl) {
                    let lowered = lower_local(cx, decl)?;
                    let last = Expr::new(e.id, Type::Unit, ExprKind::Declaration(lowered.stub));
                    *e = declare_with_class(cx, &lowered, last);
                }
                Ok(())
            }
            ExprKind::Lambda { function } => {
                self.lower_nested_body(cx, function)?;
                if cx.module.is_suspend(function) {
                    let lowered = lower_local(cx, function)?;
                    let ty = lowered_function_type(&e.ty);
                    let last = Expr::new(e.id, ty, ExprKind::Lambda { function: lowered.stub });
                    *e = declare_with_class(cx, &lowered, last);
                }
                Ok(())
            }
            ExprKind::FunctionRef {
                function,
                adapted: true,
                ..
            } => self.lower_nested_body(cx, function),
            _ => {
                let mut result = Ok(());
                e.visit_children_mut(&mut |child| {
                    if result.is_ok() {
                        result = self.lower_expr(cx, child);
                    }
                });
                result
            }
        }
    }

    fn lower_nested_body(&mut self, cx: &mut LoweringContext<'_>, function: DeclId) -> LowerResult<()> {
        let Some(mut body) = cx.module.take_body(function) else {
            return Ok(());
        };
        let result = self.lower_body(cx, &mut body, function);
        cx.module.set_body(function, body);
        result
    }

    fn lower_local_class(&mut self, cx: &mut LoweringContext<'_>, class: DeclId) -> LowerResult<()> {
        let members = cx.module.members_of(DeclParent::Decl(class));
        for member in members {
            let (is_class, is_function) = match cx.module.decl(member).kind {
                DeclKind::Class(_) => (true, false),
                DeclKind::Function(_) => (false, true),
                _ => (false, false),
            };
            if is_class {
                self.lower_local_class(cx, member)?;
            } else if is_function {
                self.lower_nested_body(cx, member)?;
                if cx.module.is_suspend(member) {
                    let lowered = lower_suspend_function(cx, member)?;
                    cx.module
                        .replace_member(DeclParent::Decl(class), member, &lowered.declarations());
                }
            }
        }
        Ok(())
    }
}

/// Lower a local function and move its products next to it.
fn lower_local(cx: &mut LoweringContext<'_>, function: DeclId) -> LowerResult<LoweredSuspendFunction> {
    let parent = cx.module.decl(function).parent;
    let lowered = lower_suspend_function(cx, function)?;
    // A call site may have created the stub while the function had another
    // owner
    for decl in lowered.declarations() {
        cx.module.set_parent(decl, parent);
    }
    Ok(lowered)
}

fn declare_with_class(cx: &mut LoweringContext<'_>, lowered: &LoweredSuspendFunction, last: Expr) -> Expr {
    match lowered.continuation_class() {
        Some(class) => {
            let mut b = cx.builder();
            let declare_class = b.declaration(class);
            let ty = last.ty.clone();
            b.typed_composite(ty, vec![declare_class, last])
        }
        None => last,
    }
}

/// `suspend (P) -> R` becomes `(P, Continuation<R>) -> Any`.
fn lowered_function_type(ty: &Type) -> Type {
    match ty {
        Type::Function {
            params,
            ret,
            suspend: true,
        } => {
            let mut params = params.clone();
            params.push(Type::continuation((**ret).clone()));
            Type::function(params, ret.lowered_suspend_return())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoweringConfig;
    use crate::pass::PassManager;
    use corvid_ir::{FunctionDecl, IrBuilder, IrModule, Origin};

    fn module_with_suspend_call() -> (IrModule, DeclId) {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let fetch = b.function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Int).suspend());
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Int).suspend());
        let call = b.call(fetch, vec![]);
        let one = b.int(1);
        let sum = b.binary(corvid_ir::BinaryOp::Add, call, one);
        let ret = b.ret(f, sum);
        b.set_body(f, vec![ret]);
        (m, f)
    }

    #[test]
    fn test_lowering_is_memoized() {
        let (mut m, f) = module_with_suspend_call();
        let config = LoweringConfig::default();
        let mut cx = LoweringContext::new(&mut m, &config);

        let first = lower_suspend_function(&mut cx, f).unwrap();
        let second = lower_suspend_function(&mut cx, f).unwrap();
        assert_eq!(first, second);
        assert!(first.resume_method().is_some());
        assert_eq!(cx.report.state_machines.len(), 1);
    }

    #[test]
    fn test_stub_body_starts_coroutine() {
        let (mut m, f) = module_with_suspend_call();
        let config = LoweringConfig::default();
        let mut cx = LoweringContext::new(&mut m, &config);

        let lowered = lower_suspend_function(&mut cx, f).unwrap();
        let body = cx.module.function(lowered.stub).unwrap().body.as_ref().unwrap();
        assert_eq!(body.stmts.len(), 4);
        assert!(matches!(
            &body.stmts[0].kind,
            ExprKind::VarDecl { init: Some(init), .. } if matches!(init.kind, ExprKind::New { .. })
        ));
        assert!(matches!(
            &body.stmts[3].kind,
            ExprKind::Return { value, .. }
                if matches!(value.kind, ExprKind::Call { callee, .. } if Some(callee) == lowered.resume_method())
        ));
    }

    #[test]
    fn test_body_without_suspension_is_plain() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Int).suspend());
        let one = b.int(1);
        let ret = b.ret(f, one);
        b.set_body(f, vec![ret]);
        let config = LoweringConfig::default();
        let mut cx = LoweringContext::new(&mut m, &config);

        let lowered = lower_suspend_function(&mut cx, f).unwrap();
        assert_eq!(lowered.strategy, LoweringStrategy::Plain);
        assert_eq!(lowered.declarations(), vec![lowered.stub]);
        assert_eq!(cx.report.plain_functions, vec!["f".to_string()]);
    }

    #[test]
    fn test_tail_calls_can_be_disabled() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let fetch = b.function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Int).suspend());
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Int).suspend());
        let call = b.call(fetch, vec![]);
        let ret = b.ret(f, call);
        b.set_body(f, vec![ret]);
        let config = LoweringConfig {
            tail_call_optimization: false,
            ..LoweringConfig::default()
        };
        let mut cx = LoweringContext::new(&mut m, &config);

        let lowered = lower_suspend_function(&mut cx, f).unwrap();
        assert!(matches!(lowered.strategy, LoweringStrategy::StateMachine { .. }));
    }

    #[test]
    fn test_suspend_lambda_is_lowered_in_place() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let fetch = b.function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Int).suspend());
        let host = b.function(DeclParent::File(file), "host", FunctionDecl::new(Type::Unit));
        let lambda = b.lambda_function(host, Type::Int);
        b.module().function_mut(lambda).unwrap().is_suspend = true;
        let call = b.call(fetch, vec![]);
        let one = b.int(1);
        let sum = b.binary(corvid_ir::BinaryOp::Add, call, one);
        let ret = b.ret(lambda, sum);
        b.set_body(lambda, vec![ret]);
        let lit = b.lambda(lambda);
        let sink = b.local("block", Type::suspend_function(vec![], Type::Int));
        let store = b.decl_var(sink, Some(lit));
        b.set_body(host, vec![store]);

        let config = LoweringConfig::default();
        {
            let mut cx = LoweringContext::new(&mut m, &config);
            let mut pm = PassManager::new();
            pm.add_body_pass(LocalSuspendFunctionsLowering);
            pm.run_on_module(&mut cx).unwrap();
        }

        let body = m.function(host).unwrap().body.as_ref().unwrap();
        let ExprKind::VarDecl { init: Some(init), .. } = &body.stmts[0].kind else {
            panic!("expected a declaration");
        };
        let ExprKind::Block { stmts, transparent: true } = &init.kind else {
            panic!("expected the continuation class to be declared in place");
        };
        let ExprKind::Declaration(class) = stmts[0].kind else {
            panic!("expected a class declaration");
        };
        assert_eq!(m.decl(class).origin, Origin::ContinuationClass);
        assert_eq!(m.decl(class).parent, DeclParent::Decl(host));
        assert!(matches!(
            &stmts[1].ty,
            Type::Function { suspend: false, params, .. } if params.len() == 1
        ));
    }
}
