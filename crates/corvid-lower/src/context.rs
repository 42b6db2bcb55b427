//! Per-module lowering context.

use crate::config::LoweringConfig;
use crate::coroutines::stubs::ContinuationStubCache;
use crate::report::ModuleReport;
use corvid_ir::{IrBuilder, IrModule, ModuleId};
use std::sync::Arc;

/// Everything a pass needs while lowering one module: the module itself, the
/// configuration, the shared stub side table and the counters that make
/// generated names unique.
pub struct LoweringContext<'m> {
    /// Module being lowered.
    pub module: &'m mut IrModule,
    /// Pipeline configuration.
    pub config: &'m LoweringConfig,
    stubs: Arc<ContinuationStubCache>,
    coroutine_counter: u32,
    /// What the passes produced so far.
    pub report: ModuleReport,
}

impl<'m> LoweringContext<'m> {
    pub fn new(module: &'m mut IrModule, config: &'m LoweringConfig) -> Self {
        Self::with_stub_cache(module, config, Arc::new(ContinuationStubCache::new()))
    }

    /// A context sharing `stubs` with other modules of the same run.
    pub fn with_stub_cache(
        module: &'m mut IrModule,
        config: &'m LoweringConfig,
        stubs: Arc<ContinuationStubCache>,
    ) -> Self {
        let report = ModuleReport::new(&module.name);
        Self {
            module,
            config,
            stubs,
            coroutine_counter: 0,
            report,
        }
    }

    pub fn module_id(&self) -> ModuleId {
        self.module.id
    }

    pub fn stubs(&self) -> &ContinuationStubCache {
        &self.stubs
    }

    pub fn builder(&mut self) -> IrBuilder<'_> {
        IrBuilder::new(&mut *self.module)
    }

    /// Next continuation class number of this module.
    pub fn next_coroutine_id(&mut self) -> u32 {
        let id = self.coroutine_counter;
        self.coroutine_counter += 1;
        id
    }

    pub fn into_report(self) -> ModuleReport {
        self.report
    }
}
