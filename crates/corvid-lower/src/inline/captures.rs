//! Capture conversion for local declarations leaving their scope.
//!
//! A local class or function moved out of the code that declares the values
//! it captures must get those values explicitly: a class through extra
//! constructor fields, a function through extra leading parameters. Every
//! constructor call, call and reference in the original scope passes them.
//!
//! Only declarations in the requested set are converted. A candidate is left
//! alone when it writes a captured value, captures a mutable one, or refers
//! to a local declaration that stays behind.

use crate::context::LoweringContext;
use crate::rewrite::{nested_declaration, rewrite_declaration_deep, rewrite_deep};
use corvid_ir::{DeclId, DeclKind, Expr, ExprKind, IrModule, Origin, ValueDecl, VarId};
use rustc_hash::{FxHashMap, FxHashSet};

/// A converted declaration and the values it now receives explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConvertedDeclaration {
    /// The converted declaration.
    pub decl: DeclId,
    /// Captured values, in the order of the new parameters.
    pub captured: Vec<VarId>,
}

/// Values and local declarations introduced by some code.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    /// Parameters and locals.
    pub values: FxHashSet<VarId>,
    /// Local classes and functions.
    pub decls: FxHashSet<DeclId>,
}

impl Scope {
    /// Everything declared by `function`: its parameters, its locals and
    /// what nested declarations declare. `skip` bodies are not entered.
    pub fn of_function(module: &IrModule, function: DeclId, skip: &FxHashSet<DeclId>) -> Self {
        let mut scope = Scope::default();
        scope.add_declaration(module, function, skip);
        scope
    }

    /// Like [`Scope::of_function`] for statements detached from the module.
    pub fn of_body(
        module: &IrModule,
        function: DeclId,
        stmts: &[Expr],
        skip: &FxHashSet<DeclId>,
    ) -> Self {
        let mut scope = Scope::default();
        if let Some(f) = module.function(function) {
            scope.values.extend(f.value_params());
        }
        scope.add_stmts(module, stmts, skip);
        scope
    }

    fn add_declaration(&mut self, module: &IrModule, decl: DeclId, skip: &FxHashSet<DeclId>) {
        if skip.contains(&decl) {
            return;
        }
        match &module.decl(decl).kind {
            DeclKind::Function(f) => {
                self.values.extend(f.value_params());
                if let Some(body) = &f.body {
                    self.add_stmts(module, &body.stmts, skip);
                }
            }
            DeclKind::Class(c) => {
                self.values.insert(c.this_receiver);
                for &member in &c.members {
                    self.add_declaration(module, member, skip);
                }
            }
            _ => {}
        }
    }

    fn add_stmts(&mut self, module: &IrModule, stmts: &[Expr], skip: &FxHashSet<DeclId>) {
        let mut nested = Vec::new();
        for stmt in stmts {
            stmt.walk(&mut |e| match &e.kind {
                ExprKind::VarDecl { var, .. } => {
                    self.values.insert(*var);
                }
                ExprKind::Try { catches, .. } => {
                    self.values.extend(catches.iter().map(|c| c.param));
                }
                ExprKind::Declaration(d) => {
                    self.decls.insert(*d);
                    nested.push(*d);
                }
                _ => nested.extend(nested_declaration(e)),
            });
        }
        for decl in nested {
            self.add_declaration(module, decl, skip);
        }
    }
}

/// What a declaration reads, writes and refers to.
#[derive(Debug, Default)]
struct Usage {
    reads: Vec<VarId>,
    writes: FxHashSet<VarId>,
    refs: FxHashSet<DeclId>,
    own: Scope,
}

impl Usage {
    fn of(module: &IrModule, decl: DeclId) -> Self {
        let mut usage = Usage {
            own: Scope::of_function(module, decl, &FxHashSet::default()),
            ..Usage::default()
        };
        let mut seen = FxHashSet::default();
        usage.collect(module, decl, &mut seen);
        usage
    }

    fn collect(&mut self, module: &IrModule, decl: DeclId, seen: &mut FxHashSet<VarId>) {
        let stmts: Vec<&Expr> = match &module.decl(decl).kind {
            DeclKind::Function(f) => f.body.iter().flat_map(|b| b.stmts.iter()).collect(),
            DeclKind::Class(c) => {
                for &member in &c.members {
                    self.collect(module, member, seen);
                }
                return;
            }
            _ => return,
        };
        let mut nested = Vec::new();
        for stmt in stmts {
            stmt.walk(&mut |e| {
                match &e.kind {
                    ExprKind::GetVar(v) => {
                        if seen.insert(*v) {
                            self.reads.push(*v);
                        }
                    }
                    ExprKind::SetVar { var, .. } => {
                        if seen.insert(*var) {
                            self.reads.push(*var);
                        }
                        self.writes.insert(*var);
                    }
                    ExprKind::Call { callee: d, .. }
                    | ExprKind::New { class: d, .. }
                    | ExprKind::FunctionRef { function: d, .. } => {
                        self.refs.insert(*d);
                    }
                    _ => {}
                }
                nested.extend(nested_declaration(e));
            });
        }
        for d in nested {
            self.collect(module, d, seen);
        }
    }
}

/// Convert the captures of `candidates`, whose uses all lie in `tree`.
/// `outer` is what the code being left declares.
pub(crate) fn convert_captures(
    cx: &mut LoweringContext<'_>,
    tree: &mut [Expr],
    candidates: &[DeclId],
    outer: &Scope,
) -> Vec<ConvertedDeclaration> {
    let usages: FxHashMap<DeclId, Usage> = candidates
        .iter()
        .map(|&d| (d, Usage::of(cx.module, d)))
        .collect();
    let mut captured: FxHashMap<DeclId, Vec<VarId>> = candidates
        .iter()
        .map(|&d| {
            let usage = &usages[&d];
            let values = usage
                .reads
                .iter()
                .copied()
                .filter(|v| outer.values.contains(v) && !usage.own.values.contains(v))
                .collect();
            (d, values)
        })
        .collect();

    // A declaration using another one needs that one's captures too
    let mut skipped: FxHashSet<DeclId> = FxHashSet::default();
    loop {
        let mut changed = false;
        for &decl in candidates {
            if skipped.contains(&decl) {
                continue;
            }
            let usage = &usages[&decl];
            let unsafe_capture = captured[&decl]
                .iter()
                .any(|v| usage.writes.contains(v) || cx.module.var(*v).mutable);
            let left_behind = usage.refs.iter().any(|r| {
                *r != decl
                    && !usage.own.decls.contains(r)
                    && ((outer.decls.contains(r) && !candidates.contains(r)) || skipped.contains(r))
            });
            if unsafe_capture || left_behind {
                tracing::trace!(
                    target: "corvid_lower::inline",
                    decl = %cx.module.render_decl(decl),
                    "local declaration stays in place"
                );
                skipped.insert(decl);
                changed = true;
                continue;
            }
            for r in &usage.refs {
                if *r == decl || !candidates.contains(r) || skipped.contains(r) {
                    continue;
                }
                let extra: Vec<VarId> = captured[r].clone();
                let list = captured.entry(decl).or_default();
                for v in extra {
                    if !list.contains(&v) {
                        list.push(v);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    let converted: Vec<ConvertedDeclaration> = candidates
        .iter()
        .filter(|d| !skipped.contains(d))
        .map(|&decl| ConvertedDeclaration {
            decl,
            captured: captured.remove(&decl).unwrap_or_default(),
        })
        .collect();

    let to_pass: FxHashMap<DeclId, Vec<VarId>> = converted
        .iter()
        .filter(|c| !c.captured.is_empty())
        .map(|c| (c.decl, c.captured.clone()))
        .collect();
    if to_pass.is_empty() {
        return converted;
    }

    pass_captured_values(cx.module, tree, &to_pass);
    for c in &converted {
        if !c.captured.is_empty() {
            receive_captured_values(cx.module, c);
        }
    }
    converted
}

/// Append or prepend the captured values at every use of a converted
/// declaration.
fn pass_captured_values(module: &mut IrModule, tree: &mut [Expr], to_pass: &FxHashMap<DeclId, Vec<VarId>>) {
    rewrite_deep(module, tree, &mut |m, e| {
        let reads = |m: &mut IrModule, values: &[VarId]| -> Vec<Expr> {
            values
                .iter()
                .map(|&v| {
                    let ty = m.var(v).ty.clone();
                    Expr::new(m.fresh_expr_id(), ty, ExprKind::GetVar(v))
                })
                .collect()
        };
        match &mut e.kind {
            ExprKind::New { class, args } => {
                if let Some(values) = to_pass.get(class) {
                    args.extend(reads(m, values));
                }
            }
            ExprKind::Call { callee, args } => {
                if let Some(values) = to_pass.get(callee) {
                    args.splice(0..0, reads(m, values));
                }
            }
            ExprKind::FunctionRef { function, bound, .. } => {
                if let Some(values) = to_pass.get(function) {
                    bound.splice(0..0, reads(m, values));
                }
            }
            _ => {}
        }
    });
}

/// Add the fields or parameters of a converted declaration and read the
/// captured values through them.
fn receive_captured_values(module: &mut IrModule, converted: &ConvertedDeclaration) {
    let decl = converted.decl;
    match &module.decl(decl).kind {
        DeclKind::Class(class) => {
            let this = class.this_receiver;
            let members = class.members.clone();
            let fields: FxHashMap<VarId, DeclId> = converted
                .captured
                .iter()
                .map(|&v| {
                    let value = module.var(v);
                    let name = format!("${}", value.name);
                    let ty = value.ty.clone();
                    (v, module.add_constructor_field(decl, &name, ty, Origin::CapturedValue))
                })
                .collect();
            for member in members {
                let receiver = module
                    .function(member)
                    .and_then(|f| f.dispatch_receiver)
                    .unwrap_or(this);
                rewrite_declaration_deep(module, member, &mut |m, e| {
                    if let ExprKind::GetVar(v) = e.kind {
                        if let Some(&field) = fields.get(&v) {
                            let ty = m.var(receiver).ty.clone();
                            let read = Expr::new(m.fresh_expr_id(), ty, ExprKind::GetVar(receiver));
                            e.kind = ExprKind::GetField {
                                receiver: Box::new(read),
                                field,
                            };
                        }
                    }
                });
            }
        }
        DeclKind::Function(_) => {
            let params: Vec<(VarId, VarId)> = converted
                .captured
                .iter()
                .map(|&v| {
                    let value = module.var(v);
                    let param = ValueDecl::param(&value.name, value.ty.clone());
                    (v, module.add_var(param))
                })
                .collect();
            if let Some(f) = module.function_mut(decl) {
                f.params.splice(0..0, params.iter().map(|&(_, p)| p));
            }
            let mapping: FxHashMap<VarId, VarId> = params.into_iter().collect();
            rewrite_declaration_deep(module, decl, &mut |_, e| {
                if let ExprKind::GetVar(v) = &mut e.kind {
                    if let Some(&to) = mapping.get(v) {
                        *v = to;
                    }
                }
            });
        }
        _ => {}
    }
}
