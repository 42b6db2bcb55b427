//! Structural verification of a module.
//!
//! Run after lowering passes in tests and, optionally, by the pass manager.
//! Checks that member lists and parent links agree, that every reference
//! points into the arenas, that no expression id is shared between nodes and
//! that no state placeholder survived.

use crate::decl::{DeclKind, DeclParent};
use crate::error::IrError;
use crate::expr::{Expr, ExprKind};
use crate::ids::{DeclId, ExprId};
use crate::module::IrModule;
use rustc_hash::FxHashSet;

/// Check the structural invariants of `module` and return every violation found.
pub fn verify_module(module: &IrModule) -> Result<(), Vec<IrError>> {
    let mut verifier = Verifier {
        module,
        errors: Vec::new(),
        seen: FxHashSet::default(),
    };
    verifier.run();
    if verifier.errors.is_empty() {
        Ok(())
    } else {
        Err(verifier.errors)
    }
}

struct Verifier<'m> {
    module: &'m IrModule,
    errors: Vec<IrError>,
    seen: FxHashSet<ExprId>,
}

impl<'m> Verifier<'m> {
    fn run(&mut self) {
        let m = self.module;
        for (file_id, file) in m.files() {
            for &decl in &file.declarations {
                self.check_parent(decl, DeclParent::File(file_id), &file.name);
                self.declaration(decl);
            }
        }
    }

    fn check_parent(&mut self, decl: DeclId, expected: DeclParent, expected_name: &str) {
        let m = self.module;
        if m.decl(decl).parent != expected {
            let found = match m.decl(decl).parent {
                DeclParent::File(f) => m.file(f).name.clone(),
                DeclParent::Decl(d) => m.qualified_name(d),
            };
            self.errors.push(IrError::ParentMismatch {
                decl: m.render_decl(decl),
                expected: expected_name.to_string(),
                found,
            });
        }
    }

    fn declaration(&mut self, id: DeclId) {
        let m = self.module;
        match &m.decl(id).kind {
            DeclKind::Class(class) => {
                let name = m.qualified_name(id);
                for &member in &class.members {
                    self.check_parent(member, DeclParent::Decl(id), &name);
                    self.declaration(member);
                }
            }
            DeclKind::Function(f) => {
                if let Some(body) = &f.body {
                    for stmt in &body.stmts {
                        self.expr(id, stmt);
                    }
                }
            }
            _ => {}
        }
    }

    fn encloses(&self, target: DeclId, function: DeclId) -> bool {
        let mut current = DeclParent::Decl(function);
        while let DeclParent::Decl(d) = current {
            if d == target {
                return true;
            }
            current = self.module.decl(d).parent;
        }
        false
    }

    fn expr(&mut self, function: DeclId, root: &Expr) {
        let m = self.module;
        let decls = m.decl_count();
        let vars = m.var_count();
        let mut errors = Vec::new();
        let mut nested = Vec::new();
        let mut ids = Vec::new();

        root.walk(&mut |e| {
            ids.push(e.id);
            let dangling = |what: &'static str, id: u32| IrError::DanglingReference {
                decl: m.render_decl(function),
                what,
                id,
            };
            match &e.kind {
                ExprKind::GetVar(v) | ExprKind::SetVar { var: v, .. } | ExprKind::VarDecl { var: v, .. } => {
                    if v.index() >= vars {
                        errors.push(dangling("value", v.as_u32()));
                    }
                }
                ExprKind::Call { callee: d, .. }
                | ExprKind::New { class: d, .. }
                | ExprKind::GetField { field: d, .. }
                | ExprKind::SetField { field: d, .. } => {
                    if d.index() >= decls {
                        errors.push(dangling("declaration", d.as_u32()));
                    }
                }
                ExprKind::Declaration(d) | ExprKind::Lambda { function: d } => {
                    if d.index() >= decls {
                        errors.push(dangling("declaration", d.as_u32()));
                    } else {
                        nested.push(*d);
                    }
                }
                ExprKind::FunctionRef {
                    function: d,
                    adapted: true,
                    ..
                } => {
                    if d.index() >= decls {
                        errors.push(dangling("declaration", d.as_u32()));
                    }
                }
                ExprKind::StateRef(state) => errors.push(IrError::UnresolvedState {
                    decl: m.render_decl(function),
                    state: *state,
                }),
                _ => {}
            }
        });

        root.walk(&mut |e| {
            if let ExprKind::Return { target, .. } = e.kind {
                if target.index() < decls && !self.encloses(target, function) {
                    errors.push(IrError::ForeignReturn {
                        decl: m.render_decl(function),
                        target: m.render_decl(target),
                    });
                }
            }
        });

        for id in ids {
            if id != ExprId::PLACEHOLDER && !self.seen.insert(id) {
                errors.push(IrError::DuplicateExprId {
                    decl: m.render_decl(function),
                    id: id.as_u32(),
                });
            }
        }
        self.errors.extend(errors);

        for decl in nested {
            self.declaration(decl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::decl::FunctionDecl;
    use crate::types::Type;

    #[test]
    fn test_valid_module() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Unit));
        let ret = b.ret_unit(f);
        b.set_body(f, vec![ret]);
        assert!(verify_module(&m).is_ok());
    }

    #[test]
    fn test_detects_state_placeholder() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Unit));
        let state = b.state_ref(3);
        b.set_body(f, vec![state]);

        let errors = verify_module(&m).unwrap_err();
        assert!(matches!(errors[0], IrError::UnresolvedState { state: 3, .. }));
    }

    #[test]
    fn test_detects_foreign_return() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Unit));
        let g = b.function(DeclParent::File(file), "g", FunctionDecl::new(Type::Unit));
        let ret = b.ret_unit(g);
        b.set_body(f, vec![ret]);

        let errors = verify_module(&m).unwrap_err();
        assert!(matches!(errors[0], IrError::ForeignReturn { .. }));
    }

    #[test]
    fn test_detects_duplicate_ids() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::Unit));
        let one = b.int(1);
        b.set_body(f, vec![one.clone(), one]);

        let errors = verify_module(&m).unwrap_err();
        assert!(matches!(errors[0], IrError::DuplicateExprId { .. }));
    }
}
