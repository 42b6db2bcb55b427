//! Continuation class synthesis.
//!
//! Every suspend function lowered to a state machine gets a class holding
//! the machine's registers:
//!
//! | field                | type                  |
//! |----------------------|-----------------------|
//! | `label`              | `Int`                 |
//! | `exceptionState`     | `Int`                 |
//! | `result`             | `Any?`                |
//! | `exception`          | `Throwable?`          |
//! | one per argument     | argument type         |
//! | `resultContinuation` | `Continuation<R>`     |
//! | one per live local   | local type            |.
//!
//! Argument fields and `resultContinuation` are constructor fields, in stub
//! parameter order. Live locals are promoted after the states are numbered.

use crate::context::LoweringContext;
use crate::coroutines::stubs::completion_param;
use crate::error::{LowerError, LowerResult};
use crate::rewrite::rewrite_deep;
use corvid_ir::{
    DeclId, DeclParent, Expr, ExprKind, FunctionDecl, IrModule, Origin, Type, ValueKind, VarId,
};
use rustc_hash::FxHashMap;

/// Built-in fields of a continuation class and the resume receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationSlots {
    /// The continuation class.
    pub class: DeclId,
    /// `this` of the resume method.
    pub this: VarId,
    /// Id of the state to run on the next resume.
    pub label: DeclId,
    /// Trap state that handles exceptions thrown by the current state.
    pub exception_state: DeclId,
    /// Value the machine is resumed with.
    pub result: DeclId,
    /// Exception the machine is resumed with, or the one being dispatched.
    pub exception: DeclId,
    /// Caller continuation completed when the machine returns.
    pub result_continuation: DeclId,
}

/// A generated continuation class and its resume method.
#[derive(Debug, Clone)]
pub struct ContinuationClass {
    /// Built-in fields of the class.
    pub slots: ContinuationSlots,
    /// The resume method that runs the state machine.
    pub resume: DeclId,
    /// Stub value parameter to the field saving it.
    pub arguments: Vec<(VarId, DeclId)>,
}

/// Create the continuation class of `original`, whose body now lives in
/// `stub`. The class is not attached to any member list.
pub fn create_continuation_class(
    cx: &mut LoweringContext<'_>,
    original: DeclId,
    stub: DeclId,
) -> LowerResult<ContinuationClass> {
    let (name, parent) = {
        let decl = cx.module.decl(original);
        (decl.name.clone(), decl.parent)
    };
    let Some(stub_fn) = cx.module.function(stub) else {
        return Err(LowerError::precondition(
            cx.module.render_decl(stub),
            "continuation class requested for a non-function stub",
        ));
    };
    let completion = completion_param(cx.module, stub).ok_or_else(|| {
        LowerError::precondition(cx.module.render_decl(stub), "stub has no completion parameter")
    })?;
    let params: Vec<VarId> = stub_fn.value_params().filter(|&p| p != completion).collect();

    let number = cx.next_coroutine_id();
    let class_name = format!("${}{}{}", name, cx.config.coroutine_class_suffix, number);
    let m = &mut *cx.module;
    let class = m.add_detached_class(parent, &class_name, Origin::ContinuationClass);
    let this = match m.class(class) {
        Some(c) => c.this_receiver,
        None => return Err(LowerError::internal("continuation synthesizer", "class vanished")),
    };

    let label = m.add_field(class, "label", Type::Int, true, Origin::ContinuationField);
    let exception_state = m.add_field(class, "exceptionState", Type::Int, true, Origin::ContinuationField);
    let result = m.add_field(class, "result", Type::nullable_any(), true, Origin::ContinuationField);
    let exception = m.add_field(
        class,
        "exception",
        Type::Throwable.nullable(),
        true,
        Origin::ContinuationField,
    );

    let mut arguments = Vec::with_capacity(params.len());
    for param in params {
        let value = m.var(param);
        let field_name = match value.kind {
            ValueKind::Receiver => "$this".to_string(),
            _ => value.name.clone(),
        };
        let ty = value.ty.clone();
        let field = m.add_constructor_field(class, &field_name, ty, Origin::ContinuationField);
        arguments.push((param, field));
    }
    let completion_ty = m.var(completion).ty.clone();
    let result_continuation =
        m.add_constructor_field(class, "resultContinuation", completion_ty, Origin::ContinuationField);

    let mut resume_fn = FunctionDecl::new(Type::nullable_any());
    resume_fn.dispatch_receiver = Some(this);
    let method_name = cx.config.state_machine_method_name.clone();
    let resume = m.add_function_with_origin(
        DeclParent::Decl(class),
        &method_name,
        Origin::StateMachineMethod,
        resume_fn,
    );

    Ok(ContinuationClass {
        slots: ContinuationSlots {
            class,
            this,
            label,
            exception_state,
            result,
            exception,
            result_continuation,
        },
        resume,
        arguments,
    })
}

/// Promotes live locals to fields named `<name><counter>`. The counter
/// belongs to one lowering invocation and counts promoted locals in
/// discovery order.
pub struct ContinuationSynthesizer {
    class: DeclId,
    counter: u32,
}

impl ContinuationSynthesizer {
    pub fn new(class: DeclId) -> Self {
        Self { class, counter: 0 }
    }

    /// Add a field for `local` and return it.
    pub fn promote(&mut self, module: &mut IrModule, local: VarId) -> DeclId {
        let value = module.var(local);
        let name = format!("{}{}", value.name, self.counter);
        let ty = value.ty.clone();
        self.counter += 1;
        module.add_field(self.class, &name, ty, true, Origin::ContinuationField)
    }

    /// Promote every local of `live` that is not already saved as an argument.
    pub fn promote_all(
        &mut self,
        module: &mut IrModule,
        live: &[VarId],
        arguments: &[(VarId, DeclId)],
    ) -> Vec<(VarId, DeclId)> {
        live.iter()
            .filter(|v| !arguments.iter().any(|(arg, _)| arg == *v))
            .map(|&v| (v, self.promote(module, v)))
            .collect()
    }
}

/// Rewrites accesses to saved values into field accesses on the resume
/// receiver. Node ids are kept.
pub struct LiveLocalsTransformer {
    this: VarId,
    fields: FxHashMap<VarId, DeclId>,
}

impl LiveLocalsTransformer {
    pub fn new(this: VarId, fields: impl IntoIterator<Item = (VarId, DeclId)>) -> Self {
        Self {
            this,
            fields: fields.into_iter().collect(),
        }
    }

    /// Rewrite `stmts` in place.
    pub fn run(&self, module: &mut IrModule, stmts: &mut [Expr]) {
        if self.fields.is_empty() {
            return;
        }
        rewrite_deep(module, stmts, &mut |m, e| self.rewrite(m, e));
    }

    fn receiver(&self, module: &mut IrModule) -> Box<Expr> {
        let ty = module.var(self.this).ty.clone();
        Box::new(Expr::new(module.fresh_expr_id(), ty, ExprKind::GetVar(self.this)))
    }

    fn rewrite(&self, module: &mut IrModule, e: &mut Expr) {
        let kind = std::mem::replace(&mut e.kind, ExprKind::Block {
            stmts: Vec::new(),
            transparent: true,
        });
        e.kind = match kind {
            ExprKind::GetVar(var) => match self.fields.get(&var) {
                Some(&field) => ExprKind::GetField {
                    receiver: self.receiver(module),
                    field,
                },
                None => ExprKind::GetVar(var),
            },
            ExprKind::SetVar { var, value } => match self.fields.get(&var) {
                Some(&field) => ExprKind::SetField {
                    receiver: self.receiver(module),
                    field,
                    value,
                },
                None => ExprKind::SetVar { var, value },
            },
            ExprKind::VarDecl { var, init } => match (self.fields.get(&var), init) {
                (Some(&field), Some(value)) => ExprKind::SetField {
                    receiver: self.receiver(module),
                    field,
                    value,
                },
                // Left empty: the field starts out unset
                (Some(_), None) => ExprKind::Block {
                    stmts: Vec::new(),
                    transparent: true,
                },
                (None, init) => ExprKind::VarDecl { var, init },
            },
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoweringConfig;
    use crate::coroutines::stubs::get_or_create_function_with_continuation_stub;
    use corvid_ir::{IrBuilder, ValueDecl};

    fn setup() -> (IrModule, DeclId) {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "load", FunctionDecl::new(Type::Int).suspend());
        b.param(f, "id", Type::Int);
        b.param(f, "name", Type::String);
        (m, f)
    }

    #[test]
    fn test_class_layout() {
        let (mut m, f) = setup();
        let config = LoweringConfig::default();
        let mut cx = LoweringContext::new(&mut m, &config);
        let stub = get_or_create_function_with_continuation_stub(&mut cx, f).unwrap();
        let cont = create_continuation_class(&mut cx, f, stub).unwrap();

        let class = cx.module.class(cont.slots.class).unwrap();
        let names: Vec<&str> = class.members.iter().map(|&d| cx.module.name(d)).collect();
        assert_eq!(
            names,
            vec!["label", "exceptionState", "result", "exception", "id", "name", "resultContinuation", "doResume"]
        );
        assert_eq!(class.constructor_fields.len(), 3);
        assert_eq!(cx.module.name(cont.slots.class), "$loadCOROUTINE$0");
        assert_eq!(cont.arguments.len(), 2);
        assert_eq!(
            cx.module.function(cont.resume).unwrap().dispatch_receiver,
            Some(cont.slots.this)
        );
        assert!(!cx.module.file(cx.module.file_ids()[0]).declarations.contains(&cont.slots.class));
    }

    #[test]
    fn test_promoted_names_follow_discovery_order() {
        let (mut m, _) = setup();
        let class = m.add_class(DeclParent::File(m.file_ids()[0]), "C");
        let a = m.add_var(ValueDecl::local("a", Type::Int, false));
        let b = m.add_var(ValueDecl::local("b", Type::String, true));
        let a_twin = m.add_var(ValueDecl::local("a", Type::Int, false));

        let mut synth = ContinuationSynthesizer::new(class);
        let promoted = synth.promote_all(&mut m, &[a, b, a_twin], &[]);
        let names: Vec<&str> = promoted.iter().map(|&(_, field)| m.name(field)).collect();
        assert_eq!(names, vec!["a0", "b1", "a2"]);
    }

    #[test]
    fn test_transformer_rewrites_declarations_and_reads() {
        let (mut m, _) = setup();
        let class = m.add_class(DeclParent::File(m.file_ids()[0]), "C");
        let this = m.class(class).unwrap().this_receiver;
        let field = m.add_field(class, "a0", Type::Int, true, Origin::ContinuationField);
        let mut b = IrBuilder::new(&mut m);
        let a = b.local("a", Type::Int);
        let one = b.int(1);
        let decl = b.decl_var(a, Some(one));
        let decl_id = decl.id;
        let read = b.get(a);
        let read_id = read.id;
        let mut stmts = vec![decl, read];

        LiveLocalsTransformer::new(this, [(a, field)]).run(&mut m, &mut stmts);
        assert_eq!(stmts[0].id, decl_id);
        assert!(matches!(stmts[0].kind, ExprKind::SetField { field: f, .. } if f == field));
        assert_eq!(stmts[1].id, read_id);
        assert!(matches!(
            &stmts[1].kind,
            ExprKind::GetField { receiver, field: f } if *f == field && receiver.as_var() == Some(this)
        ));
    }
}
