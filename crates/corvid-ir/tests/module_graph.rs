//! Building, navigating and checking a small module.

use corvid_ir::{
    verify_module, DeclId, DeclParent, FileId, FunctionDecl, IrBuilder, IrError, IrModule,
    Origin, PrettyPrint, Type,
};

struct Fixture {
    module: IrModule,
    file: FileId,
    outer: DeclId,
    method: DeclId,
    lambda: DeclId,
    local: DeclId,
}

/// ```text
/// class Outer(size) {
///     fun method() { run { class Local { } } }
/// }
/// ```
fn fixture() -> Fixture {
    let mut m = IrModule::new("graph");
    let file = m.add_file("outer.kt");
    let mut b = IrBuilder::new(&mut m);
    let outer = b.module().add_class(DeclParent::File(file), "Outer");
    b.module()
        .add_constructor_field(outer, "size", Type::Int, Origin::Source);
    let method = b.function(DeclParent::Decl(outer), "method", FunctionDecl::new(Type::Unit));
    b.dispatch_receiver(method, outer);
    let lambda = b.lambda_function(method, Type::Unit);
    let local = b.module().add_class(DeclParent::Decl(lambda), "Local");
    let declare = b.declaration(local);
    b.set_body(lambda, vec![declare]);
    let lit = b.lambda(lambda);
    b.set_body(method, vec![lit]);
    Fixture {
        module: m,
        file,
        outer,
        method,
        lambda,
        local,
    }
}

#[test]
fn test_navigation_through_parents() {
    let fx = fixture();
    let m = &fx.module;

    assert_eq!(m.nearest_container(fx.local), DeclParent::Decl(fx.outer));
    assert_eq!(m.nearest_container(fx.outer), DeclParent::File(fx.file));
    assert_eq!(m.nearest_non_lambda(fx.lambda), DeclParent::Decl(fx.method));
    assert_eq!(m.nearest_non_lambda(fx.method), DeclParent::Decl(fx.method));
    assert_eq!(m.enclosing_file(fx.local), fx.file);
    assert_eq!(m.qualified_name(fx.method), "Outer.method");
    assert_eq!(m.find("Local"), Some(fx.local));

    // Local declarations are not members of their function
    assert_eq!(m.members_of(DeclParent::Decl(fx.lambda)), vec![fx.local]);
    assert!(!m.members_of(DeclParent::Decl(fx.outer)).contains(&fx.lambda));
    assert_eq!(m.functions_postfix(fx.file), vec![fx.method]);
}

#[test]
fn test_fixture_verifies_and_prints() {
    let fx = fixture();
    verify_module(&fx.module).unwrap();

    let text = fx.module.pretty_print();
    assert!(text.contains("class Outer(size) {"));
    assert!(text.contains("fun Outer.method(): Unit {"));
    assert!(text.contains("lambda "));
}

#[test]
fn test_moved_member_keeps_lists_consistent() {
    let Fixture {
        mut module,
        file,
        outer,
        local,
        ..
    } = fixture();

    module.push_member(DeclParent::Decl(outer), local);
    assert_eq!(module.decl(local).parent, DeclParent::Decl(outer));
    assert!(module.members_of(DeclParent::Decl(outer)).contains(&local));
    assert_eq!(module.enclosing_file(local), file);

    assert!(module.remove_member(DeclParent::Decl(outer), local));
    assert!(!module.remove_member(DeclParent::Decl(outer), local));
}

#[test]
fn test_member_with_wrong_parent_is_reported() {
    let Fixture {
        mut module,
        file,
        method,
        ..
    } = fixture();
    module.set_parent(method, DeclParent::File(file));

    let errors = verify_module(&module).unwrap_err();
    assert!(errors.iter().any(|e| matches!(
        e,
        IrError::ParentMismatch { expected, found, .. } if expected == "Outer" && found == "outer.kt"
    )));
}
