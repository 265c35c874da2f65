use super::latch::CountdownLatch;
use super::queue::{TaskQueue, UnitHandle};
use super::worker::{RunContext, UnitWorker};
use crate::model::{ExecutionMode, ExecutionUnit, TestRun, UnitResolution};
use crate::report::progress::{ProgressEvent, ProgressSink};
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Set once by a stop request; units that have not started yet skip.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fan-in side of a dispatched run.
pub struct DispatchHandle {
    run_id: String,
    latch: Arc<CountdownLatch<UnitResolution>>,
    stop: StopSignal,
}

impl DispatchHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn resolved(&self) -> usize {
        self.latch.arrived()
    }

    /// Waits for every unit to resolve.
    pub async fn wait(&self) -> Vec<UnitResolution> {
        self.latch.wait().await
    }

    /// Registers the fan-in callback; it runs once, after every unit resolved.
    pub fn on_complete<F, Fut>(self, callback: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(Vec<UnitResolution>) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let outcomes = self.latch.wait().await;
            callback(outcomes).await
        })
    }
}

/// Expands a run into units and feeds them to the task queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    worker: Arc<UnitWorker>,
    progress: Option<ProgressSink>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, worker: Arc<UnitWorker>) -> Self {
        Self {
            queue,
            worker,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn dispatch(&self, run: &TestRun, ctx: RunContext) -> DispatchHandle {
        self.dispatch_with_stop(run, ctx, StopSignal::default())
    }

    /// Submits one unit per test case, each stamped with the run's tenant.
    ///
    /// Parallel mode submits everything at once and lets the queue bound
    /// concurrency. Sequential mode submits unit i+1 only after unit i has
    /// resolved.
    pub fn dispatch_with_stop(&self, run: &TestRun, ctx: RunContext, stop: StopSignal) -> DispatchHandle {
        let units: Vec<ExecutionUnit> = ctx
            .config
            .tests
            .iter()
            .map(|tc| ExecutionUnit::new(&run.id, &tc.id, run.tenant.clone()))
            .collect();
        let total = units.len();
        let latch = Arc::new(CountdownLatch::new(total));
        let ctx = Arc::new(ctx);
        let mode = ctx.config.mode;

        tracing::info!(run_id = %run.id, units = total, mode = mode.as_str(), queue = self.queue.name(), "dispatching run");

        match mode {
            ExecutionMode::Parallel => {
                for unit in units {
                    let handle = self.submit(&ctx, unit, &stop);
                    let latch = latch.clone();
                    let progress = self.progress.clone();
                    tokio::spawn(async move {
                        let res = handle.await;
                        resolve(&latch, res, progress.as_ref());
                    });
                }
            }
            ExecutionMode::Sequential => {
                let this = self.clone();
                let latch = latch.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    for unit in units {
                        let res = this.submit(&ctx, unit, &stop).await;
                        resolve(&latch, res, this.progress.as_ref());
                    }
                });
            }
        }

        DispatchHandle {
            run_id: run.id.clone(),
            latch,
            stop,
        }
    }

    fn submit(&self, ctx: &Arc<RunContext>, unit: ExecutionUnit, stop: &StopSignal) -> UnitHandle {
        let worker = self.worker.clone();
        let ctx = ctx.clone();
        let stop = stop.clone();
        let envelope = unit.clone();
        let task = async move {
            if stop.is_stopped() {
                return worker.skip_unit(&envelope);
            }
            worker.run_unit(&ctx, envelope).await
        };
        self.queue.submit(&unit, task.boxed())
    }
}

fn resolve(latch: &CountdownLatch<UnitResolution>, res: UnitResolution, progress: Option<&ProgressSink>) {
    let total = latch.expected();
    latch.count_down(res);
    if let Some(sink) = progress {
        sink(ProgressEvent {
            done: latch.arrived().min(total),
            total,
        });
    }
}
