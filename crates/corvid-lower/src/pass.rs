//! Pass protocol.
//!
//! Two shapes of lowering:
//! - [`BodyLoweringPass`]: rewrites one function body at a time
//! - [`DeclarationTransformer`]: replaces a member declaration by zero or
//!   more declarations.
//!
//! [`PassManager`] runs passes in a fixed total order. Each pass finishes a
//! whole file before the next pass starts on it.

use crate::context::LoweringContext;
use crate::error::LowerResult;
use corvid_ir::{Body, DeclId, DeclParent, FileId};

/// A pass that rewrites function bodies in place.
pub trait BodyLoweringPass {
    fn name(&self) -> &'static str;

    /// Lower `body`, which belongs to the function `container`. The body is
    /// detached from the module while the pass runs.
    fn lower_body(
        &mut self,
        cx: &mut LoweringContext<'_>,
        body: &mut Body,
        container: DeclId,
    ) -> LowerResult<()>;

    /// Lower every body of `file`, nested declarations before their
    /// containers.
    fn lower_file(&mut self, cx: &mut LoweringContext<'_>, file: FileId) -> LowerResult<()> {
        for function in cx.module.functions_postfix(file) {
            let Some(mut body) = cx.module.take_body(function) else {
                continue;
            };
            let result = self.lower_body(cx, &mut body, function);
            cx.module.set_body(function, body);
            result?;
        }
        Ok(())
    }
}

/// A pass that replaces member declarations.
pub trait DeclarationTransformer {
    fn name(&self) -> &'static str;

    /// `None` keeps `decl`; `Some(list)` replaces it in its parent's member
    /// list.
    fn transform_flat(
        &mut self,
        cx: &mut LoweringContext<'_>,
        decl: DeclId,
    ) -> LowerResult<Option<Vec<DeclId>>>;

    fn lower_file(&mut self, cx: &mut LoweringContext<'_>, file: FileId) -> LowerResult<()> {
        let members = cx.module.file(file).declarations.clone();
        self.transform_members(cx, DeclParent::File(file), members)
    }

    fn transform_members(
        &mut self,
        cx: &mut LoweringContext<'_>,
        parent: DeclParent,
        members: Vec<DeclId>,
    ) -> LowerResult<()> {
        for decl in members {
            let nested = cx.module.class(decl).map(|c| c.members.clone());
            if let Some(nested) = nested {
                self.transform_members(cx, DeclParent::Decl(decl), nested)?;
            }
            if let Some(replacement) = self.transform_flat(cx, decl)? {
                cx.module.replace_member(parent, decl, &replacement);
            }
        }
        Ok(())
    }
}

/// A registered pass of either shape.
pub enum LoweringPass {
    Body(Box<dyn BodyLoweringPass + Send>),
    Declaration(Box<dyn DeclarationTransformer + Send>),
}

impl LoweringPass {
    pub fn name(&self) -> &'static str {
        match self {
            LoweringPass::Body(p) => p.name(),
            LoweringPass::Declaration(p) => p.name(),
        }
    }

    fn lower_file(&mut self, cx: &mut LoweringContext<'_>, file: FileId) -> LowerResult<()> {
        match self {
            LoweringPass::Body(p) => p.lower_file(cx, file),
            LoweringPass::Declaration(p) => p.lower_file(cx, file),
        }
    }
}

/// Runs passes in registration order.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<LoweringPass>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_body_pass(&mut self, pass: impl BodyLoweringPass + Send + 'static) -> &mut Self {
        self.passes.push(LoweringPass::Body(Box::new(pass)));
        self
    }

    pub fn add_declaration_transformer(
        &mut self,
        pass: impl DeclarationTransformer + Send + 'static,
    ) -> &mut Self {
        self.passes.push(LoweringPass::Declaration(Box::new(pass)));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run_on_file(&mut self, cx: &mut LoweringContext<'_>, file: FileId) -> LowerResult<()> {
        for pass in &mut self.passes {
            tracing::trace!(target: "corvid_lower::pass", pass = pass.name(), file = %file, "running");
            pass.lower_file(cx, file)?;
        }
        Ok(())
    }

    /// Run every pass over every file of the module, file by file.
    pub fn run_on_module(&mut self, cx: &mut LoweringContext<'_>) -> LowerResult<()> {
        for file in cx.module.file_ids() {
            self.run_on_file(cx, file)?;
        }
        Ok(())
    }
}
