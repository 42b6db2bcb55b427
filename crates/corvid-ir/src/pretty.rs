//! Pretty-printing for the IR.
//!
//! Provides human-readable output for debugging and for comparing lowered
//! trees in tests. The output is deterministic for a given module.

use crate::decl::DeclKind;
use crate::expr::{Const, Expr, ExprKind, LoopKind, TypeOp};
use crate::ids::{DeclId, VarId};
use crate::module::IrModule;
use std::fmt::Write;

/// Trait for pretty-printing IR constructs.
pub trait PrettyPrint {
    fn pretty_print(&self) -> String;
}

impl PrettyPrint for IrModule {
    fn pretty_print(&self) -> String {
        let mut output = String::new();
        writeln!(output, "// module {}", self.name).unwrap();
        for (_, file) in self.files() {
            writeln!(output, "// file {}", file.name).unwrap();
            for &decl in &file.declarations {
                output.push_str(&self.render_decl_tree(decl));
            }
        }
        output
    }
}

impl IrModule {
    /// A declaration with its members and body.
    pub fn render_decl_tree(&self, id: DeclId) -> String {
        let mut printer = Printer::new(self);
        printer.decl(id);
        printer.out
    }

    pub fn render_expr(&self, expr: &Expr) -> String {
        let mut printer = Printer::new(self);
        printer.expr(expr);
        printer.out
    }

    fn var_label(&self, var: VarId) -> String {
        format!("{}_{}", self.var(var).name, var.as_u32())
    }
}

struct Printer<'m> {
    module: &'m IrModule,
    out: String,
    indent: usize,
}

impl<'m> Printer<'m> {
    fn new(module: &'m IrModule) -> Self {
        Self {
            module,
            out: String::new(),
            indent: 0,
        }
    }

    fn line_start(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
    }

    fn decl(&mut self, id: DeclId) {
        let m = self.module;
        self.line_start();
        self.out.push_str(&m.render_decl(id));
        match &m.decl(id).kind {
            DeclKind::Class(class) => {
                if !class.constructor_fields.is_empty() {
                    let fields: Vec<&str> = class
                        .constructor_fields
                        .iter()
                        .map(|&f| m.name(f))
                        .collect();
                    write!(self.out, "({})", fields.join(", ")).unwrap();
                }
                self.out.push_str(" {\n");
                self.indent += 1;
                for &member in &class.members {
                    self.decl(member);
                }
                self.indent -= 1;
                self.line_start();
                self.out.push_str("}\n");
            }
            DeclKind::Function(f) => match &f.body {
                Some(body) => {
                    self.out.push_str(" {\n");
                    self.indent += 1;
                    for stmt in &body.stmts {
                        self.stmt(stmt);
                    }
                    self.indent -= 1;
                    self.line_start();
                    self.out.push_str("}\n");
                }
                None => self.out.push('\n'),
            },
            _ => self.out.push('\n'),
        }
    }

    fn stmt(&mut self, e: &Expr) {
        if let ExprKind::Declaration(d) = e.kind {
            self.decl(d);
            return;
        }
        self.line_start();
        self.expr(e);
        self.out.push('\n');
    }

    fn block_body(&mut self, stmts: &[Expr]) {
        self.out.push_str("{\n");
        self.indent += 1;
        for stmt in stmts {
            self.stmt(stmt);
        }
        self.indent -= 1;
        self.line_start();
        self.out.push('}');
    }

    fn branch(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Block { stmts, .. } => self.block_body(stmts),
            _ => self.block_body(std::slice::from_ref(e)),
        }
    }

    fn args(&mut self, args: &[Expr]) {
        self.out.push('(');
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(a);
        }
        self.out.push(')');
    }

    fn expr(&mut self, e: &Expr) {
        let m = self.module;
        match &e.kind {
            ExprKind::Const(c) => match c {
                Const::Unit => self.out.push_str("Unit"),
                Const::Null => self.out.push_str("null"),
                Const::Bool(b) => write!(self.out, "{}", b).unwrap(),
                Const::Int(i) => write!(self.out, "{}", i).unwrap(),
                Const::String(s) => write!(self.out, "{:?}", s).unwrap(),
            },
            ExprKind::Suspended => self.out.push_str("SUSPENDED"),
            ExprKind::GetVar(v) => self.out.push_str(&m.var_label(*v)),
            ExprKind::SetVar { var, value } => {
                write!(self.out, "{} = ", m.var_label(*var)).unwrap();
                self.expr(value);
            }
            ExprKind::VarDecl { var, init } => {
                let decl = m.var(*var);
                write!(
                    self.out,
                    "{} {}: {}",
                    if decl.mutable { "var" } else { "val" },
                    m.var_label(*var),
                    m.render_type(&decl.ty)
                )
                .unwrap();
                if let Some(init) = init {
                    self.out.push_str(" = ");
                    self.expr(init);
                }
            }
            ExprKind::GetField { receiver, field } => {
                self.expr(receiver);
                write!(self.out, ".{}", m.name(*field)).unwrap();
            }
            ExprKind::SetField {
                receiver,
                field,
                value,
            } => {
                self.expr(receiver);
                write!(self.out, ".{} = ", m.name(*field)).unwrap();
                self.expr(value);
            }
            ExprKind::Call { callee, args } => {
                self.out.push_str(&m.qualified_name(*callee));
                self.args(args);
            }
            ExprKind::Invoke { callee, args } => {
                self.expr(callee);
                self.out.push_str(".invoke");
                self.args(args);
            }
            ExprKind::New { class, args } => {
                write!(self.out, "new {}", m.name(*class)).unwrap();
                self.args(args);
            }
            ExprKind::Block { stmts, transparent } => {
                if *transparent {
                    self.out.push_str("composite ");
                }
                self.block_body(stmts);
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.out.push_str("if (");
                self.expr(cond);
                self.out.push_str(") ");
                self.branch(then_branch);
                if let Some(e) = else_branch {
                    self.out.push_str(" else ");
                    self.branch(e);
                }
            }
            ExprKind::Switch {
                subject,
                cases,
                default,
            } => {
                self.out.push_str("when (");
                self.expr(subject);
                self.out.push_str(") {\n");
                self.indent += 1;
                for case in cases {
                    self.line_start();
                    self.expr(&case.label);
                    self.out.push_str(" -> ");
                    self.branch(&case.body);
                    self.out.push('\n');
                }
                if let Some(d) = default {
                    self.line_start();
                    self.out.push_str("else -> ");
                    self.branch(d);
                    self.out.push('\n');
                }
                self.indent -= 1;
                self.line_start();
                self.out.push('}');
            }
            ExprKind::Loop {
                kind,
                label,
                cond,
                body,
            } => {
                write!(self.out, "{}@ ", label.as_deref().unwrap_or(&e.id.to_string())).unwrap();
                match kind {
                    LoopKind::While => {
                        self.out.push_str("while (");
                        self.expr(cond);
                        self.out.push_str(") ");
                        self.branch(body);
                    }
                    LoopKind::DoWhile => {
                        self.out.push_str("do ");
                        self.branch(body);
                        self.out.push_str(" while (");
                        self.expr(cond);
                        self.out.push(')');
                    }
                }
            }
            ExprKind::Break { target } => write!(self.out, "break@{}", target).unwrap(),
            ExprKind::Continue { target } => write!(self.out, "continue@{}", target).unwrap(),
            ExprKind::Return { target, value } => {
                write!(self.out, "return@{} ", m.name(*target)).unwrap();
                self.expr(value);
            }
            ExprKind::Throw(value) => {
                self.out.push_str("throw ");
                self.expr(value);
            }
            ExprKind::Try {
                body,
                catches,
                finally,
            } => {
                self.out.push_str("try ");
                self.branch(body);
                for catch in catches {
                    let param = m.var(catch.param);
                    write!(
                        self.out,
                        " catch ({}: {}) ",
                        m.var_label(catch.param),
                        m.render_type(&param.ty)
                    )
                    .unwrap();
                    self.branch(&catch.body);
                }
                if let Some(fin) = finally {
                    self.out.push_str(" finally ");
                    self.branch(fin);
                }
            }
            ExprKind::Lambda { function } => {
                write!(self.out, "lambda {}", function).unwrap();
            }
            ExprKind::FunctionRef {
                function,
                bound,
                adapted,
            } => {
                write!(
                    self.out,
                    "{}::{}",
                    if *adapted { "adapted " } else { "" },
                    m.name(*function)
                )
                .unwrap();
                if !bound.is_empty() {
                    self.args(bound);
                }
            }
            ExprKind::Declaration(d) => write!(self.out, "decl {}", m.name(*d)).unwrap(),
            ExprKind::TypeOp {
                op,
                operand,
                target,
            } => {
                self.expr(operand);
                let op = match op {
                    TypeOp::InstanceOf => "is",
                    TypeOp::Cast => "as",
                    TypeOp::ImplicitCast => "as!",
                };
                write!(self.out, " {} {}", op, m.render_type(target)).unwrap();
            }
            ExprKind::Binary { op, left, right } => {
                self.out.push('(');
                self.expr(left);
                write!(self.out, " {} ", op.symbol()).unwrap();
                self.expr(right);
                self.out.push(')');
            }
            ExprKind::StateRef(s) => write!(self.out, "<state {}>", s).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::decl::{DeclParent, FunctionDecl};
    use crate::expr::BinaryOp;
    use crate::types::Type;

    #[test]
    fn test_pretty_print_function() {
        let mut m = IrModule::new("demo");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "inc", FunctionDecl::new(Type::Int));
        let x = b.param(f, "x", Type::Int);
        let get = b.get(x);
        let one = b.int(1);
        let sum = b.binary(BinaryOp::Add, get, one);
        let ret = b.ret(f, sum);
        b.set_body(f, vec![ret]);

        let text = m.pretty_print();
        assert!(text.contains("fun inc(x: Int): Int {"));
        assert!(text.contains("return@inc (x_0 + 1)"));
    }

    #[test]
    fn test_pretty_print_is_deterministic() {
        let mut m = IrModule::new("demo");
        let file = m.add_file("a.kt");
        let c = m.add_class(DeclParent::File(file), "Box");
        m.add_constructor_field(c, "value", Type::Int, crate::decl::Origin::Source);
        assert_eq!(m.pretty_print(), m.pretty_print());
        assert!(m.pretty_print().contains("class Box(value) {"));
    }
}
