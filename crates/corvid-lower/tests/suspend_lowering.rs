//! End-to-end suspend function lowering through the default pipeline.

use corvid_ir::{
    verify_module, BinaryOp, Catch, Const, DeclId, DeclParent, Expr, ExprId, ExprKind, FileId,
    FunctionDecl, IrBuilder, IrModule, PrettyPrint, Type, VarId,
};
use corvid_lower::{
    lower_module, lower_suspend_function, LowerError, LoweringConfig, LoweringContext,
    StateMachineSummary,
};
use rustc_hash::FxHashSet;

struct Scenario {
    module: IrModule,
    file: FileId,
    f: DeclId,
    a: VarId,
    /// Ids of `val a = ..`, `suspendCall()` and `return a`.
    statement_ids: [ExprId; 3],
}

/// ```text
/// suspend fun suspendCall()
/// suspend fun f(x: Int): Int { val a = x + 1; suspendCall(); return a }
/// ```
fn scenario() -> Scenario {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let suspend_call = b.function(
        DeclParent::File(file),
        "suspendCall",
        FunctionDecl::new(Type::Unit).suspend(),
    );
    let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Int).suspend());
    let x = b.param(f, "x", Type::Int);
    let a = b.local("a", Type::Int);

    let read_x = b.get(x);
    let one = b.int(1);
    let sum = b.binary(BinaryOp::Add, read_x, one);
    let decl_a = b.decl_var(a, Some(sum));
    let call = b.call(suspend_call, vec![]);
    let read_a = b.get(a);
    let ret = b.ret(f, read_a);
    let statement_ids = [decl_a.id, call.id, ret.id];
    b.set_body(f, vec![decl_a, call, ret]);
    Scenario {
        module: m,
        file,
        f,
        a,
        statement_ids,
    }
}

fn member_named(m: &IrModule, class: DeclId, name: &str) -> Option<DeclId> {
    m.class(class)?
        .members
        .iter()
        .copied()
        .find(|&d| m.name(d) == name)
}

fn walk_body(m: &IrModule, function: DeclId, f: &mut dyn FnMut(&Expr)) {
    if let Some(body) = m.function(function).and_then(|f| f.body.as_ref()) {
        body.walk(f);
    }
}

#[test]
fn test_scenario_two_states_and_field_for_local() {
    let Scenario {
        mut module, file, a, ..
    } = scenario();
    let report = lower_module(&mut module, &LoweringConfig::default()).unwrap();

    assert_eq!(report.state_machines.len(), 1);
    let summary = &report.state_machines[0];
    assert_eq!(summary.function, "f");
    assert_eq!(summary.continuation_class, "$fCOROUTINE$0");
    assert_eq!(summary.state_count, 2);
    assert_eq!(summary.successors[0], vec![1]);
    assert_eq!(summary.live_local_fields, vec!["a0".to_string()]);
    assert_eq!(summary.argument_fields, vec!["x".to_string()]);

    let class = module.find("$fCOROUTINE$0").unwrap();
    assert_eq!(module.decl(class).parent, DeclParent::File(file));
    let field = member_named(&module, class, "a0").unwrap();
    let resume = member_named(&module, class, "doResume").unwrap();

    // `a` is only reached through its field after lowering
    let mut field_reads = 0;
    let mut local_uses = 0;
    walk_body(&module, resume, &mut |e| match &e.kind {
        ExprKind::GetField { field: f, .. } if *f == field => field_reads += 1,
        ExprKind::GetVar(v) | ExprKind::VarDecl { var: v, .. } if *v == a => local_uses += 1,
        _ => {}
    });
    assert_eq!(field_reads, 1);
    assert_eq!(local_uses, 0);

    verify_module(&module).unwrap();
}

#[test]
fn test_every_statement_lands_in_exactly_one_state() {
    let Scenario {
        mut module,
        statement_ids,
        ..
    } = scenario();
    lower_module(&mut module, &LoweringConfig::default()).unwrap();

    let class = module.find("$fCOROUTINE$0").unwrap();
    let resume = member_named(&module, class, "doResume").unwrap();
    let mut counts = [0usize; 3];
    walk_body(&module, resume, &mut |e| {
        if let Some(i) = statement_ids.iter().position(|&id| id == e.id) {
            counts[i] += 1;
        }
    });
    assert_eq!(counts, [1, 1, 1]);
}

#[test]
fn test_dispatch_cases_follow_state_ids() {
    let Scenario { mut module, .. } = scenario();
    lower_module(&mut module, &LoweringConfig::default()).unwrap();

    let class = module.find("$fCOROUTINE$0").unwrap();
    let resume = member_named(&module, class, "doResume").unwrap();
    let mut labels = Vec::new();
    walk_body(&module, resume, &mut |e| {
        if let ExprKind::Switch { cases, .. } = &e.kind {
            for case in cases {
                if let ExprKind::Const(Const::Int(label)) = case.label.kind {
                    labels.push(label);
                }
            }
        }
    });
    // Two states and the root trap
    assert_eq!(labels, vec![0, 1, 2]);
}

/// Every local the resume method touches is declared in it; saved locals
/// are reached through fields and never appear as locals.
fn assert_locals_backed(m: &IrModule, resume: DeclId) {
    let mut declared: FxHashSet<VarId> = FxHashSet::default();
    declared.extend(m.function(resume).unwrap().dispatch_receiver);
    walk_body(m, resume, &mut |e| match &e.kind {
        ExprKind::VarDecl { var, .. } => {
            declared.insert(*var);
        }
        ExprKind::Try { catches, .. } => declared.extend(catches.iter().map(|c| c.param)),
        _ => {}
    });
    walk_body(m, resume, &mut |e| {
        if let ExprKind::GetVar(v) | ExprKind::SetVar { var: v, .. } = &e.kind {
            assert!(declared.contains(v), "{} is read without a backing declaration", m.var(*v).name);
        }
    });
}

/// Lower `module` and check the resume method of `function`: the module
/// verifies, each of `statements` lands in exactly one state and no local is
/// read without a declaration or a field.
fn lower_and_check(module: &mut IrModule, function: &str, statements: &[ExprId]) -> StateMachineSummary {
    let report = lower_module(module, &LoweringConfig::default()).unwrap();
    verify_module(module).unwrap();

    let summary = report
        .state_machines
        .into_iter()
        .find(|s| s.function == function)
        .unwrap();
    let class = module.find(&summary.continuation_class).unwrap();
    let resume = member_named(module, class, "doResume").unwrap();

    let mut counts = vec![0usize; statements.len()];
    walk_body(module, resume, &mut |e| {
        if let Some(i) = statements.iter().position(|&id| id == e.id) {
            counts[i] += 1;
        }
    });
    assert_eq!(counts, vec![1; statements.len()]);
    assert_locals_backed(module, resume);
    summary
}

#[test]
fn test_no_local_is_read_without_declaration_or_field() {
    let Scenario { mut module, .. } = scenario();
    lower_module(&mut module, &LoweringConfig::default()).unwrap();

    let class = module.find("$fCOROUTINE$0").unwrap();
    let resume = member_named(&module, class, "doResume").unwrap();
    assert_locals_backed(&module, resume);
}

/// A module with `suspend fun fetch(): Int` in `main.kt`.
fn with_fetch() -> (IrModule, FileId, DeclId) {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let fetch = m.add_function(DeclParent::File(file), "fetch", FunctionDecl::new(Type::Int).suspend());
    (m, file, fetch)
}

/// ```text
/// suspend fun sum(n: Int): Int {
///     var i = 0; var acc = 0
///     while (i < n) { val a = fetch(); acc = acc + a; i = i + 1 }
///     return acc
/// }
/// ```
#[test]
fn test_while_loop_with_suspension_keeps_invariants() {
    let (mut m, file, fetch) = with_fetch();
    let mut b = IrBuilder::new(&mut m);
    let f = b.function(DeclParent::File(file), "sum", FunctionDecl::new(Type::Int).suspend());
    let n = b.param(f, "n", Type::Int);
    let i = b.local_var("i", Type::Int);
    let acc = b.local_var("acc", Type::Int);
    let a = b.local("a", Type::Int);

    let zero = b.int(0);
    let decl_i = b.decl_var(i, Some(zero));
    let zero = b.int(0);
    let decl_acc = b.decl_var(acc, Some(zero));
    let loop_id = b.loop_id();
    let read_i = b.get(i);
    let read_n = b.get(n);
    let cond = b.binary(BinaryOp::Lt, read_i, read_n);
    let call = b.call(fetch, vec![]);
    let call_id = call.id;
    let decl_a = b.decl_var(a, Some(call));
    let read_acc = b.get(acc);
    let read_a = b.get(a);
    let added = b.binary(BinaryOp::Add, read_acc, read_a);
    let set_acc = b.set(acc, added);
    let read_i = b.get(i);
    let one = b.int(1);
    let next = b.binary(BinaryOp::Add, read_i, one);
    let set_i = b.set(i, next);
    let statements = [decl_i.id, decl_acc.id, decl_a.id, call_id, set_acc.id, set_i.id];
    let body = b.block(vec![decl_a, set_acc, set_i]);
    let lp = b.while_loop(loop_id, cond, body);
    let read_acc = b.get(acc);
    let ret = b.ret(f, read_acc);
    let ret_id = ret.id;
    b.set_body(f, vec![decl_i, decl_acc, lp, ret]);

    let mut statements = statements.to_vec();
    statements.push(ret_id);
    let summary = lower_and_check(&mut m, "sum", &statements);
    // entry, header, body, resumed body, exit
    assert_eq!(summary.state_count, 5);
    assert_eq!(summary.argument_fields, vec!["n".to_string()]);
    assert_eq!(summary.live_local_fields[..2], ["i0".to_string(), "acc1".to_string()]);
}

/// ```text
/// suspend fun repeat(n: Int): Int {
///     var i = 0
///     do { fetch(); i = i + 1 } while (i < n)
///     return i
/// }
/// ```
#[test]
fn test_do_while_loop_with_suspension_keeps_invariants() {
    let (mut m, file, fetch) = with_fetch();
    let mut b = IrBuilder::new(&mut m);
    let f = b.function(DeclParent::File(file), "repeat", FunctionDecl::new(Type::Int).suspend());
    let n = b.param(f, "n", Type::Int);
    let i = b.local_var("i", Type::Int);

    let zero = b.int(0);
    let decl_i = b.decl_var(i, Some(zero));
    let loop_id = b.loop_id();
    let call = b.call(fetch, vec![]);
    let read_i = b.get(i);
    let one = b.int(1);
    let next = b.binary(BinaryOp::Add, read_i, one);
    let set_i = b.set(i, next);
    let read_i = b.get(i);
    let read_n = b.get(n);
    let cond = b.binary(BinaryOp::Lt, read_i, read_n);
    let statements = vec![decl_i.id, call.id, set_i.id, cond.id];
    let body = b.block(vec![call, set_i]);
    let lp = b.do_while_loop(loop_id, body, cond);
    let read_i = b.get(i);
    let ret = b.ret(f, read_i);
    let mut statements = statements;
    statements.push(ret.id);
    b.set_body(f, vec![decl_i, lp, ret]);

    let summary = lower_and_check(&mut m, "repeat", &statements);
    // entry, body, resumed body, condition check, exit
    assert_eq!(summary.state_count, 5);
    assert_eq!(summary.live_local_fields[0], "i0");
}

/// ```text
/// suspend fun guarded(): Int {
///     var r = 0
///     try { val a = fetch(); r = a } catch (e: Throwable) { r = -1 }
///     return r
/// }
/// ```
#[test]
fn test_suspension_inside_try_keeps_invariants() {
    let (mut m, file, fetch) = with_fetch();
    let mut b = IrBuilder::new(&mut m);
    let f = b.function(DeclParent::File(file), "guarded", FunctionDecl::new(Type::Int).suspend());
    let r = b.local_var("r", Type::Int);
    let a = b.local("a", Type::Int);
    let e = b.catch_param("e", Type::Throwable);

    let zero = b.int(0);
    let decl_r = b.decl_var(r, Some(zero));
    let call = b.call(fetch, vec![]);
    let call_id = call.id;
    let decl_a = b.decl_var(a, Some(call));
    let read_a = b.get(a);
    let set_r = b.set(r, read_a);
    let failed = b.int(-1);
    let recover = b.set(r, failed);
    let statements = vec![decl_r.id, call_id, decl_a.id, set_r.id, recover.id];
    let body = b.block(vec![decl_a, set_r]);
    let handler = b.block(vec![recover]);
    let protected = b.try_catch(body, vec![Catch { param: e, body: handler }]);
    let read_r = b.get(r);
    let ret = b.ret(f, read_r);
    let mut statements = statements;
    statements.push(ret.id);
    b.set_body(f, vec![decl_r, protected, ret]);

    let summary = lower_and_check(&mut m, "guarded", &statements);
    assert_eq!(summary.live_local_fields[0], "r0");
    // The protected state hands exceptions to its own trap, not the root one
    let traps = summary.successors.len() - summary.state_count;
    assert_eq!(traps, 2);
}

/// ```text
/// suspend fun pick(c: Boolean): Int {
///     val x = if (c) fetch() else 2
///     return x + 1
/// }
/// ```
#[test]
fn test_if_value_with_suspending_branch_keeps_invariants() {
    let (mut m, file, fetch) = with_fetch();
    let mut b = IrBuilder::new(&mut m);
    let f = b.function(DeclParent::File(file), "pick", FunctionDecl::new(Type::Int).suspend());
    let c = b.param(f, "c", Type::Bool);
    let x = b.local("x", Type::Int);

    let cond = b.get(c);
    let call = b.call(fetch, vec![]);
    let call_id = call.id;
    let two = b.int(2);
    let two_id = two.id;
    let chosen = b.if_else(cond, call, two);
    let decl_x = b.decl_var(x, Some(chosen));
    let read_x = b.get(x);
    let one = b.int(1);
    let sum = b.binary(BinaryOp::Add, read_x, one);
    let ret = b.ret(f, sum);
    let statements = [decl_x.id, call_id, two_id, ret.id];
    b.set_body(f, vec![decl_x, ret]);

    let summary = lower_and_check(&mut m, "pick", &statements);
    // entry, then, resumed then, else, exit
    assert_eq!(summary.state_count, 5);
}

/// ```text
/// fun plus(a: Int, b: Int, c: Int): Int
/// suspend fun fetchWith(v: Int): Int
/// suspend fun combine(x: Int): Int = plus(x, fetch(), fetchWith(fetch()))
/// ```
#[test]
fn test_nested_suspensions_in_arguments_keep_invariants() {
    let (mut m, file, fetch) = with_fetch();
    let mut b = IrBuilder::new(&mut m);
    let plus = b.function(DeclParent::File(file), "plus", FunctionDecl::new(Type::Int));
    for name in ["a", "b", "c"] {
        b.param(plus, name, Type::Int);
    }
    let fetch_with = b.function(DeclParent::File(file), "fetchWith", FunctionDecl::new(Type::Int).suspend());
    b.param(fetch_with, "v", Type::Int);
    let f = b.function(DeclParent::File(file), "combine", FunctionDecl::new(Type::Int).suspend());
    let x = b.param(f, "x", Type::Int);

    let read_x = b.get(x);
    let first = b.call(fetch, vec![]);
    let inner = b.call(fetch, vec![]);
    let inner_id = inner.id;
    let outer = b.call(fetch_with, vec![inner]);
    let ids = [first.id, outer.id];
    let combined = b.call(plus, vec![read_x, first, outer]);
    let combined_id = combined.id;
    let ret = b.ret(f, combined);
    let statements = [ids[0], inner_id, ids[1], combined_id, ret.id];
    b.set_body(f, vec![ret]);

    let summary = lower_and_check(&mut m, "combine", &statements);
    // entry and one state after each of the three suspensions
    assert_eq!(summary.state_count, 4);
    assert_eq!(summary.successors[..3], [vec![1], vec![2], vec![3]]);
}

/// ```text
/// suspend fun classify(x: Int): Int {
///     var r = 0
///     when (x) {
///         0 -> { val a = fetch(); r = a }
///         1 -> { r = 2 }
///         else -> { fetch() }
///     }
///     return r
/// }
/// ```
#[test]
fn test_suspending_when_keeps_invariants() {
    let (mut m, file, fetch) = with_fetch();
    let mut b = IrBuilder::new(&mut m);
    let f = b.function(DeclParent::File(file), "classify", FunctionDecl::new(Type::Int).suspend());
    let x = b.param(f, "x", Type::Int);
    let r = b.local_var("r", Type::Int);
    let a = b.local("a", Type::Int);

    let zero = b.int(0);
    let decl_r = b.decl_var(r, Some(zero));
    let call = b.call(fetch, vec![]);
    let first_call = call.id;
    let decl_a = b.decl_var(a, Some(call));
    let read_a = b.get(a);
    let set_from_a = b.set(r, read_a);
    let two = b.int(2);
    let set_two = b.set(r, two);
    let other_call = b.call(fetch, vec![]);
    let statements = vec![
        decl_r.id,
        first_call,
        decl_a.id,
        set_from_a.id,
        set_two.id,
        other_call.id,
    ];
    let zero_case = b.block(vec![decl_a, set_from_a]);
    let one_case = b.block(vec![set_two]);
    let default = b.block(vec![other_call]);
    let subject = b.get(x);
    let when = b.when_expr(subject, vec![(0, zero_case), (1, one_case)], Some(default));
    let read_r = b.get(r);
    let ret = b.ret(f, read_r);
    let mut statements = statements;
    statements.push(ret.id);
    b.set_body(f, vec![decl_r, when, ret]);

    let summary = lower_and_check(&mut m, "classify", &statements);
    // entry, both suspending cases and their resumed states, the plain case, exit
    assert_eq!(summary.state_count, 7);
    assert_eq!(summary.successors[0].len(), 3);
    assert_eq!(summary.live_local_fields[0], "r0");
}

#[test]
fn test_lowering_twice_returns_same_resume() {
    let Scenario { mut module, f, .. } = scenario();
    let config = LoweringConfig::default();
    let mut cx = LoweringContext::new(&mut module, &config);

    let first = lower_suspend_function(&mut cx, f).unwrap();
    let second = lower_suspend_function(&mut cx, f).unwrap();
    assert_eq!(first.resume_method(), second.resume_method());
    assert_eq!(first.stub, second.stub);
    assert_eq!(cx.report.state_machines.len(), 1);
}

#[test]
fn test_second_pipeline_run_changes_nothing() {
    let Scenario { mut module, .. } = scenario();
    let config = LoweringConfig::default();
    lower_module(&mut module, &config).unwrap();
    let once = module.pretty_print();

    let report = lower_module(&mut module, &config).unwrap();
    assert!(report.state_machines.is_empty());
    assert_eq!(module.pretty_print(), once);
}

#[test]
fn test_lowering_is_deterministic() {
    let config = LoweringConfig::default();
    let mut first = scenario().module;
    let mut second = scenario().module;
    let a = lower_module(&mut first, &config).unwrap();
    let b = lower_module(&mut second, &config).unwrap();
    assert_eq!(a, b);
    assert_eq!(first.pretty_print(), second.pretty_print());
}

/// `suspend fun g() { suspendCall() }`.
fn unit_scenario() -> (IrModule, DeclId) {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let suspend_call = b.function(
        DeclParent::File(file),
        "suspendCall",
        FunctionDecl::new(Type::Unit).suspend(),
    );
    let g = b.function(DeclParent::File(file), "g", FunctionDecl::new(Type::Unit).suspend());
    let call = b.call(suspend_call, vec![]);
    b.set_body(g, vec![call]);
    (m, g)
}

#[test]
fn test_unit_function_tail_call_forwards_completion() {
    let (mut module, g) = unit_scenario();
    let config = LoweringConfig::default();
    let report = {
        let mut cx = LoweringContext::new(&mut module, &config);
        let lowered = lower_suspend_function(&mut cx, g).unwrap();
        assert!(lowered.continuation_class().is_none());

        let body = cx.module.function(lowered.stub).unwrap().body.as_ref().unwrap();
        let last = body.stmts.last().unwrap();
        let ExprKind::Return { target, value } = &last.kind else {
            panic!("expected an explicit trailing return");
        };
        assert_eq!(*target, lowered.stub);
        let ExprKind::Call { args, .. } = &value.kind else {
            panic!("expected the delegated call to be returned");
        };
        let completion = cx.module.function(lowered.stub).unwrap().params[0];
        assert_eq!(args.last().and_then(|a| a.as_var()), Some(completion));
        cx.into_report()
    };
    assert_eq!(report.tail_call_functions, vec!["g".to_string()]);
}

#[test]
fn test_unit_function_state_machine_returns_unit_explicitly() {
    let (mut module, _) = unit_scenario();
    let config = LoweringConfig {
        tail_call_optimization: false,
        ..LoweringConfig::default()
    };
    lower_module(&mut module, &config).unwrap();

    let class = module.find("$gCOROUTINE$0").unwrap();
    let resume = member_named(&module, class, "doResume").unwrap();
    let mut unit_returns = 0;
    walk_body(&module, resume, &mut |e| {
        if let ExprKind::Return { target, value } = &e.kind {
            if *target == resume && matches!(value.kind, ExprKind::Const(Const::Unit)) {
                unit_returns += 1;
            }
        }
    });
    assert_eq!(unit_returns, 1);
    verify_module(&module).unwrap();
}

#[test]
fn test_suspend_inside_try_finally_is_unsupported() {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let suspend_call = b.function(
        DeclParent::File(file),
        "suspendCall",
        FunctionDecl::new(Type::Unit).suspend(),
    );
    let h = b.function(DeclParent::File(file), "h", FunctionDecl::new(Type::Unit).suspend());
    let call = b.call(suspend_call, vec![]);
    let body = b.block(vec![call]);
    let cleanup = b.unit();
    let protected = b.try_finally(body, vec![], cleanup);
    b.set_body(h, vec![protected]);

    let err = lower_module(&mut m, &LoweringConfig::default()).unwrap_err();
    assert!(matches!(err, LowerError::Unsupported { ref decl, .. } if decl.contains("fun h(")));
}
