//! Continuation stubs.
//!
//! A suspend function `suspend fun f(x: X): R` is replaced by a regular
//! function `fun f(x: X, $completion: Continuation<R>): Any` (or `Any?` when
//! `R` is nullable) that either returns its value or the suspended sentinel.
//!
//! Stubs are created lazily through [`ContinuationStubCache`]: a call site may
//! ask for the stub of a function that has not been lowered yet, or of an
//! external function that never will be, and must get the same declaration the
//! lowering itself installs later.

use crate::context::LoweringContext;
use crate::error::{LowerError, LowerResult};
use crate::rewrite::{remap_values, reparent_locals, retarget_returns};
use corvid_ir::{
    DeclId, DeclKind, Declaration, ExprKind, FunctionDecl, InlineMode, IrModule, ModuleId,
    Origin, ParamInfo, Type, ValueDecl, ValueKind, VarId,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

type StubKey = (ModuleId, DeclId);

/// How a suspend function was lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweringStrategy {
    /// No suspension points: the stub just ignores its continuation.
    Plain,
    /// Every suspension point is a tail call that forwards `$completion`.
    TailCall,
    /// A continuation class drives a state machine.
    StateMachine { class: DeclId, resume: DeclId },
}

/// Outcome of lowering one suspend function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoweredSuspendFunction {
    /// The suspend function as declared.
    pub original: DeclId,
    /// Replacement taking a trailing continuation parameter.
    pub stub: DeclId,
    /// How the body was lowered.
    pub strategy: LoweringStrategy,
}

impl LoweredSuspendFunction {
    /// Declarations that replace the original in its parent.
    pub fn declarations(&self) -> Vec<DeclId> {
        match self.strategy {
            LoweringStrategy::StateMachine { class, .. } => vec![class, self.stub],
            _ => vec![self.stub],
        }
    }

    pub fn continuation_class(&self) -> Option<DeclId> {
        match self.strategy {
            LoweringStrategy::StateMachine { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn resume_method(&self) -> Option<DeclId> {
        match self.strategy {
            LoweringStrategy::StateMachine { resume, .. } => Some(resume),
            _ => None,
        }
    }
}

#[derive(Default)]
struct StubTables {
    stubs: FxHashMap<StubKey, DeclId>,
    originals: FxHashMap<StubKey, DeclId>,
    lowered: FxHashMap<StubKey, LoweredSuspendFunction>,
}

/// Get-or-create side table from suspend declarations to their stubs.
#[derive(Default)]
pub struct ContinuationStubCache {
    tables: Mutex<StubTables>,
}

impl ContinuationStubCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stub created for `function`, if any.
    pub fn stub_of(&self, module: ModuleId, function: DeclId) -> Option<DeclId> {
        self.tables.lock().stubs.get(&(module, function)).copied()
    }

    /// The suspend function a stub was created for.
    pub fn original_of(&self, module: ModuleId, stub: DeclId) -> Option<DeclId> {
        self.tables.lock().originals.get(&(module, stub)).copied()
    }

    /// How `function` was lowered, once it has been.
    pub fn lowered(&self, module: ModuleId, function: DeclId) -> Option<LoweredSuspendFunction> {
        self.tables.lock().lowered.get(&(module, function)).copied()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `stub` unless another stub won the race; returns the winner.
    fn insert_stub(&self, module: ModuleId, function: DeclId, stub: DeclId) -> DeclId {
        let mut tables = self.tables.lock();
        let winner = *tables.stubs.entry((module, function)).or_insert(stub);
        tables.originals.insert((module, winner), function);
        winner
    }

    pub(crate) fn record_lowered(&self, module: ModuleId, lowered: LoweredSuspendFunction) {
        self.tables
            .lock()
            .lowered
            .insert((module, lowered.original), lowered);
    }
}

/// Stub of `function`, created on first request.
pub fn get_or_create_function_with_continuation_stub(
    cx: &mut LoweringContext<'_>,
    function: DeclId,
) -> LowerResult<DeclId> {
    let module_id = cx.module_id();
    if let Some(stub) = cx.stubs().stub_of(module_id, function) {
        return Ok(stub);
    }
    // The lock is not held while creating: overridden functions recurse here.
    let stub = create_suspend_function_stub(cx, function)?;
    Ok(cx.stubs().insert_stub(module_id, function, stub))
}

fn create_suspend_function_stub(
    cx: &mut LoweringContext<'_>,
    function: DeclId,
) -> LowerResult<DeclId> {
    let (name, parent, original) = {
        let decl = cx.module.decl(function);
        let DeclKind::Function(f) = &decl.kind else {
            return Err(LowerError::precondition(
                cx.module.render_decl(function),
                "continuation stub requested for a non-function declaration",
            ));
        };
        if !f.is_suspend {
            return Err(LowerError::precondition(
                cx.module.render_decl(function),
                "continuation stub requested for a non-suspend function",
            ));
        }
        (decl.name.clone(), decl.parent, signature_of(f))
    };

    let mut overridden = Vec::with_capacity(original.overridden.len());
    for &base in &original.overridden {
        if cx.module.is_suspend(base) {
            overridden.push(get_or_create_function_with_continuation_stub(cx, base)?);
        }
    }

    let m = &mut *cx.module;
    let dispatch_receiver = original.dispatch_receiver.map(|r| copy_value(m, r));
    let params: Vec<VarId> = original.params.iter().map(|&p| copy_value(m, p)).collect();
    let completion = m.add_var(ValueDecl {
        name: "$completion".to_string(),
        ty: Type::continuation(original.return_type.clone()),
        mutable: false,
        kind: ValueKind::Param(ParamInfo {
            inline_mode: InlineMode::NoInline,
            is_continuation: true,
        }),
    });

    let mut stub = FunctionDecl::new(original.return_type.lowered_suspend_return());
    stub.params = params;
    stub.params.push(completion);
    stub.dispatch_receiver = dispatch_receiver;
    stub.type_params = original.type_params;
    stub.is_inline = original.is_inline;
    stub.overridden = overridden;

    Ok(m.add_detached(Declaration {
        name,
        parent,
        origin: Origin::LoweredSuspendFunction,
        kind: DeclKind::Function(stub),
    }))
}

fn copy_value(module: &mut IrModule, var: VarId) -> VarId {
    let copy = module.var(var).clone();
    module.add_var(copy)
}

/// Everything of a function declaration but its body.
fn signature_of(f: &FunctionDecl) -> FunctionDecl {
    FunctionDecl {
        params: f.params.clone(),
        dispatch_receiver: f.dispatch_receiver,
        type_params: f.type_params.clone(),
        return_type: f.return_type.clone(),
        is_suspend: f.is_suspend,
        is_inline: f.is_inline,
        body: None,
        overridden: f.overridden.clone(),
    }
}

/// The trailing `$completion` parameter of a stub.
pub fn completion_param(module: &IrModule, stub: DeclId) -> Option<VarId> {
    module
        .function(stub)?
        .params
        .iter()
        .copied()
        .find(|&p| module.var(p).param_info().map(|i| i.is_continuation).unwrap_or(false))
}

/// Move the body of `function` into its stub: parameters are remapped,
/// returns retargeted, and a `Unit` function gets an explicit trailing
/// `return Unit`. Returns the stub.
pub fn transform_suspend_function(
    cx: &mut LoweringContext<'_>,
    function: DeclId,
) -> LowerResult<DeclId> {
    let stub = get_or_create_function_with_continuation_stub(cx, function)?;
    let Some(mut body) = cx.module.take_body(function) else {
        return Ok(stub);
    };

    let mapping: FxHashMap<VarId, VarId> = {
        let from = cx
            .module
            .function(function)
            .map(|f| f.value_params().collect::<Vec<_>>())
            .unwrap_or_default();
        let to = cx
            .module
            .function(stub)
            .map(|f| f.value_params().collect::<Vec<_>>())
            .unwrap_or_default();
        from.into_iter().zip(to).collect()
    };

    remap_values(cx.module, &mut body.stmts, &mapping);
    retarget_returns(cx.module, &mut body.stmts, function, stub);
    reparent_locals(cx.module, &body.stmts, function, stub);

    let returns_unit = cx
        .module
        .function(function)
        .map(|f| f.return_type.is_unit())
        .unwrap_or(false);
    let ends_with_return = matches!(
        body.stmts.last().map(|s| &s.kind),
        Some(ExprKind::Return { .. })
    );
    if returns_unit && !ends_with_return {
        let ret = cx.builder().ret_unit(stub);
        body.stmts.push(ret);
    }

    cx.module.set_body(stub, body);
    Ok(stub)
}
