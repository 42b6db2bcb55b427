//! Local declarations leaving inline lambdas and inline function bodies.

use corvid_ir::{
    verify_module, DeclId, DeclParent, ExprKind, FileId, FunctionDecl, InlineMode, IrBuilder,
    IrModule, Type, VarId,
};
use corvid_lower::{copy_policy, lower_module, CopyPolicy, LoweringConfig};

struct Scenario {
    module: IrModule,
    main: DeclId,
    lambda: DeclId,
    local: DeclId,
}

/// ```text
/// inline fun run(f: () -> Unit) { f() }
/// fun main() { run { class Local { } } }
/// ```
fn scenario() -> Scenario {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let run = b.function(DeclParent::File(file), "run", FunctionDecl::new(Type::Unit).inline());
    let f = b.inline_param(run, "f", Type::function(vec![], Type::Unit), InlineMode::Inline);
    let callee = b.get(f);
    let invoke = b.invoke(callee, vec![]);
    b.set_body(run, vec![invoke]);

    let main = b.function(DeclParent::File(file), "main", FunctionDecl::new(Type::Unit));
    let lambda = b.lambda_function(main, Type::Unit);
    let local = b.module().add_class(DeclParent::Decl(lambda), "Local");
    let declare = b.declaration(local);
    b.set_body(lambda, vec![declare]);
    let lit = b.lambda(lambda);
    let call = b.call(run, vec![lit]);
    b.set_body(main, vec![call]);
    Scenario {
        module: m,
        main,
        lambda,
        local,
    }
}

#[test]
fn test_scenario_local_class_leaves_inline_lambda() {
    let Scenario {
        mut module,
        main,
        lambda,
        local,
    } = scenario();
    let report = lower_module(&mut module, &LoweringConfig::default()).unwrap();

    assert_eq!(module.decl(local).parent, DeclParent::Decl(main));

    let lambda_body = module.function(lambda).unwrap().body.as_ref().unwrap();
    let mut still_declared = false;
    lambda_body.walk(&mut |e| still_declared |= matches!(e.kind, ExprKind::Declaration(d) if d == local));
    assert!(!still_declared);

    let main_body = module.function(main).unwrap().body.as_ref().unwrap();
    let ExprKind::Block { stmts, .. } = &main_body.stmts[0].kind else {
        panic!("expected the inline call to be wrapped in a block");
    };
    assert!(matches!(stmts[0].kind, ExprKind::Declaration(d) if d == local));
    assert!(matches!(stmts.last().map(|s| &s.kind), Some(ExprKind::Call { .. })));

    assert_eq!(report.extracted.len(), 1);
    assert_eq!(report.extracted[0].declaration, "Local");
    assert_eq!(report.extracted[0].new_parent, "main");
    assert!(report.extracted[0].captured.is_empty());

    verify_module(&module).unwrap();
}

/// ```text
/// inline fun each(block: (Int) -> Unit) { block(1) }
/// fun main() { each { it -> fun show() = it; show() } }
/// ```
#[test]
fn test_local_function_receives_lambda_parameter() {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let each = b.function(DeclParent::File(file), "each", FunctionDecl::new(Type::Unit).inline());
    let block_ty = Type::function(vec![Type::Int], Type::Unit);
    let block = b.inline_param(each, "block", block_ty, InlineMode::Inline);
    let callee = b.get(block);
    let one = b.int(1);
    let invoke = b.invoke(callee, vec![one]);
    b.set_body(each, vec![invoke]);

    let main = b.function(DeclParent::File(file), "main", FunctionDecl::new(Type::Unit));
    let lambda = b.lambda_function(main, Type::Unit);
    let it: VarId = b.param(lambda, "it", Type::Int);
    let show = b.function(DeclParent::Decl(lambda), "show", FunctionDecl::new(Type::Int));
    let read = b.get(it);
    let ret = b.ret(show, read);
    b.set_body(show, vec![ret]);
    let declare = b.declaration(show);
    let call_show = b.call(show, vec![]);
    b.set_body(lambda, vec![declare, call_show]);
    let lit = b.lambda(lambda);
    let call = b.call(each, vec![lit]);
    b.set_body(main, vec![call]);

    let report = lower_module(&mut m, &LoweringConfig::default()).unwrap();

    assert_eq!(m.decl(show).parent, DeclParent::Decl(main));
    let params = &m.function(show).unwrap().params;
    assert_eq!(params.len(), 1);
    assert_eq!(m.var(params[0]).name, "it");

    let lambda_body = m.function(lambda).unwrap().body.as_ref().unwrap();
    assert!(lambda_body.stmts[0].is_empty_composite());
    let ExprKind::Call { args, .. } = &lambda_body.stmts[1].kind else {
        panic!("expected the call of the local function");
    };
    assert_eq!(args[0].as_var(), Some(it));

    // The body of `show` reads its own parameter now
    let show_body = m.function(show).unwrap().body.as_ref().unwrap();
    let ExprKind::Return { value, .. } = &show_body.stmts[0].kind else {
        panic!("expected a return");
    };
    assert_eq!(value.as_var(), Some(params[0]));

    assert_eq!(report.extracted[0].captured, vec!["it".to_string()]);
    verify_module(&m).unwrap();
}

struct InlineFunction {
    module: IrModule,
    file: FileId,
    function: DeclId,
    shared: DeclId,
    per_call: DeclId,
}

/// ```text
/// inline fun f(crossinline g: () -> Unit) {
///     class Shared { }
///     class PerCall { fun run() = g() }
/// }
/// ```
fn inline_function() -> InlineFunction {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let function = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Unit).inline());
    let g = b.inline_param(function, "g", Type::function(vec![], Type::Unit), InlineMode::CrossInline);

    let shared = b.module().add_class(DeclParent::Decl(function), "Shared");
    let per_call = b.module().add_class(DeclParent::Decl(function), "PerCall");
    let run = b.function(DeclParent::Decl(per_call), "run", FunctionDecl::new(Type::Unit));
    let callee = b.get(g);
    let invoke = b.invoke(callee, vec![]);
    b.set_body(run, vec![invoke]);

    let declare_shared = b.declaration(shared);
    let declare_per_call = b.declaration(per_call);
    b.set_body(function, vec![declare_shared, declare_per_call]);
    InlineFunction {
        module: m,
        file,
        function,
        shared,
        per_call,
    }
}

#[test]
fn test_crossinline_reader_stays_in_inline_function() {
    let InlineFunction {
        mut module,
        file,
        function,
        shared,
        per_call,
    } = inline_function();
    assert_eq!(copy_policy(&module, function, shared), CopyPolicy::Relocate);
    assert_eq!(copy_policy(&module, function, per_call), CopyPolicy::Copy);

    let report = lower_module(&mut module, &LoweringConfig::default()).unwrap();

    assert_eq!(module.decl(shared).parent, DeclParent::File(file));
    assert_eq!(module.file(file).declarations, vec![function, shared]);
    assert_eq!(module.decl(per_call).parent, DeclParent::Decl(function));
    assert_eq!(report.extracted.len(), 1);
    assert_eq!(report.extracted[0].new_parent, "main.kt");

    verify_module(&module).unwrap();
}

#[test]
fn test_non_inline_function_keeps_local_classes() {
    let mut m = IrModule::new("app");
    let file = m.add_file("main.kt");
    let mut b = IrBuilder::new(&mut m);
    let function = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Unit));
    let local = b.module().add_class(DeclParent::Decl(function), "Local");
    let declare = b.declaration(local);
    b.set_body(function, vec![declare]);

    let report = lower_module(&mut m, &LoweringConfig::default()).unwrap();
    assert!(report.extracted.is_empty());
    assert_eq!(m.decl(local).parent, DeclParent::Decl(function));
    assert_eq!(copy_policy(&m, function, local), CopyPolicy::Copy);
}
