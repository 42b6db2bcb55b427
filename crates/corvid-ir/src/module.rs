//! Module: arenas and the query surface used by the lowering passes.

use crate::decl::{
    ClassDecl, DeclKind, DeclParent, Declaration, FieldDecl, FunctionDecl, Origin, ValueDecl,
    ValueKind,
};
use crate::expr::{Body, Expr, ExprKind};
use crate::ids::{DeclId, ExprId, FileId, ModuleId, VarId};
use crate::types::Type;

/// A source file and its top-level declarations, in source order.
#[derive(Debug, Clone)]
pub struct IrFile {
    /// File name as given to [`IrModule::add_file`].
    pub name: String,
    /// Top-level declarations in source order.
    pub declarations: Vec<DeclId>,
}

/// A module: owns every declaration, value declaration and expression id.
#[derive(Debug, Clone)]
pub struct IrModule {
    /// Identity among the modules of one parallel run.
    pub id: ModuleId,
    /// Module name used in reports.
    pub name: String,
    files: Vec<IrFile>,
    decls: Vec<Declaration>,
    vars: Vec<ValueDecl>,
    next_expr: u32,
}

impl IrModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(ModuleId(0), name)
    }

    pub fn with_id(id: ModuleId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            files: Vec::new(),
            decls: Vec::new(),
            vars: Vec::new(),
            next_expr: 0,
        }
    }

    // ===== Files =====

    /// Add an empty file.
    pub fn add_file(&mut self, name: impl Into<String>) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(IrFile {
            name: name.into(),
            declarations: Vec::new(),
        });
        id
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &IrFile)> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (FileId(i as u32), f))
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        (0..self.files.len() as u32).map(FileId).collect()
    }

    pub fn file(&self, id: FileId) -> &IrFile {
        &self.files[id.index()]
    }

    // ===== Ids =====

    /// Next unused expression id.
    pub fn fresh_expr_id(&mut self) -> ExprId {
        let id = ExprId(self.next_expr);
        self.next_expr += 1;
        id
    }

    pub fn decl_count(&self) -> usize {
        self.decls.len()
    }

    pub fn decl_ids(&self) -> impl Iterator<Item = DeclId> {
        (0..self.decls.len() as u32).map(DeclId)
    }

    // ===== Declarations =====

    /// Push a declaration into the arena and attach it to its parent's member
    /// list. Declarations whose parent is a function are local: they are
    /// reachable through a declaration statement in the function body only.
    pub fn add_decl(&mut self, decl: Declaration) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        let parent = decl.parent;
        self.decls.push(decl);
        self.attach(parent, id);
        id
    }

    /// Push a declaration into the arena without attaching it anywhere.
    pub fn add_detached(&mut self, decl: Declaration) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(decl);
        id
    }

    /// Add `function` to the member list of `parent`.
    pub fn add_function(
        &mut self,
        parent: DeclParent,
        name: &str,
        function: FunctionDecl,
    ) -> DeclId {
        self.add_function_with_origin(parent, name, Origin::Source, function)
    }

    pub fn add_function_with_origin(
        &mut self,
        parent: DeclParent,
        name: &str,
        origin: Origin,
        function: FunctionDecl,
    ) -> DeclId {
        self.add_decl(Declaration {
            name: name.to_string(),
            parent,
            origin,
            kind: DeclKind::Function(function),
        })
    }

    /// Add a class; its `this` receiver is created along with it.
    pub fn add_class(&mut self, parent: DeclParent, name: &str) -> DeclId {
        self.add_class_with_origin(parent, name, Origin::Source)
    }

    pub fn add_class_with_origin(
        &mut self,
        parent: DeclParent,
        name: &str,
        origin: Origin,
    ) -> DeclId {
        let id = self.add_detached_class(parent, name, origin);
        self.attach(parent, id);
        id
    }

    /// Add a class without attaching it to its parent's member list.
    pub fn add_detached_class(&mut self, parent: DeclParent, name: &str, origin: Origin) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        let this_receiver = self.add_var(ValueDecl {
            name: "this".to_string(),
            ty: Type::Class(id),
            mutable: false,
            kind: ValueKind::Receiver,
        });
        self.add_detached(Declaration {
            name: name.to_string(),
            parent,
            origin,
            kind: DeclKind::Class(ClassDecl {
                members: Vec::new(),
                constructor_fields: Vec::new(),
                this_receiver,
                super_class: None,
            }),
        })
    }

    /// Add a field to `class`.
    pub fn add_field(
        &mut self,
        class: DeclId,
        name: &str,
        ty: Type,
        mutable: bool,
        origin: Origin,
    ) -> DeclId {
        self.add_decl(Declaration {
            name: name.to_string(),
            parent: DeclParent::Decl(class),
            origin,
            kind: DeclKind::Field(FieldDecl { ty, mutable }),
        })
    }

    /// Add a field initialized from the next constructor argument.
    pub fn add_constructor_field(
        &mut self,
        class: DeclId,
        name: &str,
        ty: Type,
        origin: Origin,
    ) -> DeclId {
        let field = self.add_field(class, name, ty, false, origin);
        if let Some(c) = self.class_mut(class) {
            c.constructor_fields.push(field);
        }
        field
    }

    pub fn decl(&self, id: DeclId) -> &Declaration {
        &self.decls[id.index()]
    }

    pub fn decl_mut(&mut self, id: DeclId) -> &mut Declaration {
        &mut self.decls[id.index()]
    }

    pub fn name(&self, id: DeclId) -> &str {
        &self.decls[id.index()].name
    }

    pub fn function(&self, id: DeclId) -> Option<&FunctionDecl> {
        self.decls.get(id.index()).and_then(|d| d.as_function())
    }

    pub fn function_mut(&mut self, id: DeclId) -> Option<&mut FunctionDecl> {
        self.decls.get_mut(id.index()).and_then(|d| d.as_function_mut())
    }

    pub fn class(&self, id: DeclId) -> Option<&ClassDecl> {
        self.decls.get(id.index()).and_then(|d| d.as_class())
    }

    pub fn class_mut(&mut self, id: DeclId) -> Option<&mut ClassDecl> {
        self.decls.get_mut(id.index()).and_then(|d| d.as_class_mut())
    }

    pub fn field(&self, id: DeclId) -> Option<&FieldDecl> {
        self.decls.get(id.index()).and_then(|d| d.as_field())
    }

    pub fn is_suspend(&self, id: DeclId) -> bool {
        self.function(id).map(|f| f.is_suspend).unwrap_or(false)
    }

    pub fn is_inline(&self, id: DeclId) -> bool {
        self.function(id).map(|f| f.is_inline).unwrap_or(false)
    }

    pub fn is_class(&self, id: DeclId) -> bool {
        self.class(id).is_some()
    }

    /// Target declaration of a call node.
    pub fn callee_of(&self, expr: &Expr) -> Option<DeclId> {
        match &expr.kind {
            ExprKind::Call { callee, .. } => Some(*callee),
            _ => None,
        }
    }

    // ===== Values =====

    /// Allocate a value declaration.
    pub fn add_var(&mut self, var: ValueDecl) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(var);
        id
    }

    /// Add a value parameter at the end of `function`'s parameter list.
    pub fn add_param(&mut self, function: DeclId, var: ValueDecl) -> VarId {
        let id = self.add_var(var);
        if let Some(f) = self.function_mut(function) {
            f.params.push(id);
        }
        id
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn var(&self, id: VarId) -> &ValueDecl {
        &self.vars[id.index()]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut ValueDecl {
        &mut self.vars[id.index()]
    }

    // ===== Structure =====

    /// Point `id` at a new parent without touching member lists.
    pub fn set_parent(&mut self, id: DeclId, parent: DeclParent) {
        self.decls[id.index()].parent = parent;
    }

    fn attach(&mut self, parent: DeclParent, id: DeclId) {
        match parent {
            DeclParent::File(file) => self.files[file.index()].declarations.push(id),
            DeclParent::Decl(owner) => {
                if let Some(class) = self.class_mut(owner) {
                    class.members.push(id);
                }
            }
        }
    }

    /// Reparent `id` and append it to the member list of `parent`.
    pub fn push_member(&mut self, parent: DeclParent, id: DeclId) {
        self.set_parent(id, parent);
        self.attach(parent, id);
    }

    /// Member declarations of a file or class, or the local declarations
    /// declared directly in a function body.
    pub fn members_of(&self, parent: DeclParent) -> Vec<DeclId> {
        match parent {
            DeclParent::File(file) => self.files[file.index()].declarations.clone(),
            DeclParent::Decl(owner) => match &self.decl(owner).kind {
                DeclKind::Class(c) => c.members.clone(),
                DeclKind::Function(f) => {
                    let mut locals = Vec::new();
                    if let Some(body) = &f.body {
                        body.walk(&mut |e| {
                            if let ExprKind::Declaration(d) = e.kind {
                                locals.push(d);
                            }
                        });
                    }
                    locals
                }
                _ => Vec::new(),
            },
        }
    }

    fn member_list_mut(&mut self, parent: DeclParent) -> Option<&mut Vec<DeclId>> {
        match parent {
            DeclParent::File(file) => Some(&mut self.files[file.index()].declarations),
            DeclParent::Decl(owner) => self.class_mut(owner).map(|c| &mut c.members),
        }
    }

    /// Replace `old` in its parent's member list by `new`, reparenting the
    /// replacements. Returns false if `old` is not a member of `parent`.
    pub fn replace_member(&mut self, parent: DeclParent, old: DeclId, new: &[DeclId]) -> bool {
        let Some(list) = self.member_list_mut(parent) else {
            return false;
        };
        let Some(pos) = list.iter().position(|&m| m == old) else {
            return false;
        };
        list.splice(pos..=pos, new.iter().copied());
        for &id in new {
            self.set_parent(id, parent);
        }
        true
    }

    pub fn remove_member(&mut self, parent: DeclParent, id: DeclId) -> bool {
        self.replace_member(parent, id, &[])
    }

    /// Detach the body of `function`, leaving it without one.
    pub fn take_body(&mut self, function: DeclId) -> Option<Body> {
        self.function_mut(function).and_then(|f| f.body.take())
    }

    pub fn set_body(&mut self, function: DeclId, body: Body) {
        if let Some(f) = self.function_mut(function) {
            f.body = Some(body);
        }
    }

    /// Run `f` with the body of `function` taken out of the arena, so the
    /// closure may mutate the module and the body at the same time.
    pub fn with_body<R>(
        &mut self,
        function: DeclId,
        f: impl FnOnce(&mut IrModule, &mut Body) -> R,
    ) -> Option<R> {
        let mut body = self.take_body(function)?;
        let result = f(self, &mut body);
        self.set_body(function, body);
        Some(result)
    }

    /// Nearest file or class that contains `id`.
    pub fn nearest_container(&self, id: DeclId) -> DeclParent {
        let mut parent = self.decl(id).parent;
        loop {
            match parent {
                DeclParent::File(_) => return parent,
                DeclParent::Decl(owner) => {
                    if self.is_class(owner) {
                        return parent;
                    }
                    parent = self.decl(owner).parent;
                }
            }
        }
    }

    /// File that transitively contains `id`.
    pub fn enclosing_file(&self, id: DeclId) -> FileId {
        let mut parent = self.decl(id).parent;
        loop {
            match parent {
                DeclParent::File(file) => return file,
                DeclParent::Decl(owner) => parent = self.decl(owner).parent,
            }
        }
    }

    /// Nearest enclosing declaration that is not a function literal.
    pub fn nearest_non_lambda(&self, id: DeclId) -> DeclParent {
        let mut current = DeclParent::Decl(id);
        while let DeclParent::Decl(owner) = current {
            if !self.decl(owner).is_lambda() {
                return current;
            }
            current = self.decl(owner).parent;
        }
        current
    }

    /// Functions with bodies reachable through file and class member lists,
    /// nested declarations before their containers.
    pub fn functions_postfix(&self, file: FileId) -> Vec<DeclId> {
        let mut out = Vec::new();
        for &decl in &self.files[file.index()].declarations {
            self.collect_functions_postfix(decl, &mut out);
        }
        out
    }

    fn collect_functions_postfix(&self, id: DeclId, out: &mut Vec<DeclId>) {
        match &self.decl(id).kind {
            DeclKind::Class(c) => {
                for &member in &c.members {
                    self.collect_functions_postfix(member, out);
                }
            }
            DeclKind::Function(f) if f.body.is_some() => out.push(id),
            _ => {}
        }
    }

    /// First declaration with the given name.
    pub fn find(&self, name: &str) -> Option<DeclId> {
        self.decls
            .iter()
            .position(|d| d.name == name)
            .map(|i| DeclId(i as u32))
    }

    /// Dotted name through enclosing declarations.
    pub fn qualified_name(&self, id: DeclId) -> String {
        let mut parts = vec![self.decl(id).name.as_str()];
        let mut parent = self.decl(id).parent;
        while let DeclParent::Decl(owner) = parent {
            parts.push(self.decl(owner).name.as_str());
            parent = self.decl(owner).parent;
        }
        parts.reverse();
        parts.join(".")
    }

    pub fn render_type(&self, ty: &Type) -> String {
        match ty {
            Type::Class(id) if id.index() < self.decls.len() => self.name(*id).to_string(),
            Type::Function {
                params,
                ret,
                suspend,
            } => {
                let params: Vec<String> = params.iter().map(|p| self.render_type(p)).collect();
                format!(
                    "{}({}) -> {}",
                    if *suspend { "suspend " } else { "" },
                    params.join(", "),
                    self.render_type(ret)
                )
            }
            Type::Continuation(inner) => format!("Continuation<{}>", self.render_type(inner)),
            Type::Nullable(inner) => format!("{}?", self.render_type(inner)),
            other => other.to_string(),
        }
    }

    /// One-line rendering used in diagnostics.
    pub fn render_decl(&self, id: DeclId) -> String {
        let decl = self.decl(id);
        let name = self.qualified_name(id);
        match &decl.kind {
            DeclKind::Function(f) => {
                let params: Vec<String> = f
                    .params
                    .iter()
                    .map(|&p| format!("{}: {}", self.var(p).name, self.render_type(&self.var(p).ty)))
                    .collect();
                format!(
                    "{}{}fun {}({}): {}",
                    if f.is_inline { "inline " } else { "" },
                    if f.is_suspend { "suspend " } else { "" },
                    name,
                    params.join(", "),
                    self.render_type(&f.return_type)
                )
            }
            DeclKind::Class(_) => format!("class {}", name),
            DeclKind::Field(f) => format!(
                "{} {}: {}",
                if f.mutable { "var" } else { "val" },
                name,
                self.render_type(&f.ty)
            ),
            DeclKind::LocalDelegatedProperty(p) => {
                format!("val {}: {} by delegate", name, self.render_type(&p.ty))
            }
        }
    }
}
