//! Lowering pipeline.
//!
//! [`default_pipeline`] is the fixed pass order. [`lower_module`] runs it on
//! one module; [`lower_modules_parallel`] spreads independent modules over
//! worker threads that pull from a shared injector queue.

use crate::config::LoweringConfig;
use crate::context::LoweringContext;
use crate::coroutines::{ContinuationStubCache, LocalSuspendFunctionsLowering, SuspendFunctionsLowering};
use crate::error::{LowerError, LowerResult};
use crate::inline::{LocalClassesExtractionFromInlineFunctionsLowering, LocalClassesInInlineLambdasLowering};
use crate::pass::PassManager;
use crate::report::ModuleReport;
use corvid_ir::IrModule;
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Local declarations leave inline lambdas and inline functions before any
/// suspend function is lowered.
pub fn default_pipeline() -> PassManager {
    let mut pm = PassManager::new();
    pm.add_body_pass(LocalClassesInInlineLambdasLowering)
        .add_body_pass(LocalClassesExtractionFromInlineFunctionsLowering)
        .add_declaration_transformer(SuspendFunctionsLowering)
        .add_body_pass(LocalSuspendFunctionsLowering);
    pm
}

/// Run the default pipeline over `module` and return what it produced.
pub fn lower_module(module: &mut IrModule, config: &LoweringConfig) -> LowerResult<ModuleReport> {
    let stubs = Arc::new(ContinuationStubCache::new());
    lower_module_with_stubs(module, config, stubs)
}

fn lower_module_with_stubs(
    module: &mut IrModule,
    config: &LoweringConfig,
    stubs: Arc<ContinuationStubCache>,
) -> LowerResult<ModuleReport> {
    let mut cx = LoweringContext::with_stub_cache(module, config, stubs);
    default_pipeline().run_on_module(&mut cx)?;
    let report = cx.into_report();
    tracing::debug!(
        target: "corvid_lower::pipeline",
        module = %report.module,
        state_machines = report.state_machines.len(),
        tail_calls = report.tail_call_functions.len(),
        extracted = report.extracted.len(),
        "module lowered"
    );
    Ok(report)
}

/// Lower independent modules on `config.worker_count()` threads. Reports come
/// back in module order. After the first failure no new module is started,
/// and the error of the lowest-indexed failed module is returned.
pub fn lower_modules_parallel(
    modules: &mut [IrModule],
    config: &LoweringConfig,
) -> LowerResult<Vec<ModuleReport>> {
    let mut ids = FxHashSet::default();
    for module in modules.iter() {
        if !ids.insert(module.id) {
            return Err(LowerError::precondition(
                &module.name,
                format!("module id {} is used by more than one module", module.id),
            ));
        }
    }

    let count = modules.len();
    let workers = config.worker_count().min(count.max(1));
    let stubs = Arc::new(ContinuationStubCache::new());
    let injector = Injector::new();
    for index in 0..count {
        injector.push(index);
    }
    let slots: Vec<Mutex<&mut IrModule>> = modules.iter_mut().map(Mutex::new).collect();
    let results: Mutex<Vec<Option<LowerResult<ModuleReport>>>> =
        Mutex::new((0..count).map(|_| None).collect());
    let failed = AtomicBool::new(false);

    tracing::debug!(
        target: "corvid_lower::pipeline",
        modules = count,
        workers,
        "parallel lowering started"
    );

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let (injector, slots, results, failed, stubs) = (&injector, &slots, &results, &failed, &stubs);
            scope.spawn(move || loop {
                if failed.load(Ordering::Acquire) {
                    break;
                }
                let index = match injector.steal() {
                    Steal::Success(index) => index,
                    Steal::Retry => continue,
                    Steal::Empty => break,
                };
                let mut module = slots[index].lock();
                tracing::trace!(
                    target: "corvid_lower::pipeline",
                    worker,
                    module = %module.name,
                    "lowering module"
                );
                let result = lower_module_with_stubs(&mut **module, config, Arc::clone(stubs));
                if result.is_err() {
                    failed.store(true, Ordering::Release);
                }
                results.lock()[index] = Some(result);
            });
        }
    });

    let mut reports = Vec::with_capacity(count);
    for (index, result) in results.into_inner().into_iter().enumerate() {
        match result {
            Some(Ok(report)) => reports.push(report),
            Some(Err(err)) => return Err(err),
            None if failed.load(Ordering::Acquire) => continue,
            None => {
                return Err(LowerError::internal(
                    "lower_modules_parallel",
                    format!("module #{index} was never lowered"),
                ))
            }
        }
    }
    Ok(reports)
}
