use crate::model::{ExecutionUnit, UnitResolution};
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Semaphore};

pub const DEFAULT_QUEUE_WORKERS: usize = 4;

/// Work submitted for one unit. Must resolve, never panic out to the caller.
pub type UnitTask = BoxFuture<'static, UnitResolution>;

/// Fan-out primitive. Implementations decide where and when a task runs; the
/// handle always resolves, even if the task is lost.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, unit: &ExecutionUnit, task: UnitTask) -> UnitHandle;

    fn name(&self) -> &'static str;
}

/// Resolves to the unit's resolution once the queue is done with it.
pub struct UnitHandle {
    test_case_id: String,
    rx: oneshot::Receiver<UnitResolution>,
}

impl UnitHandle {
    pub fn new(test_case_id: impl Into<String>, rx: oneshot::Receiver<UnitResolution>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            rx,
        }
    }

    pub fn test_case_id(&self) -> &str {
        &self.test_case_id
    }
}

impl Future for UnitHandle {
    type Output = UnitResolution;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(UnitResolution::Failed {
                test_case_id: this.test_case_id.clone(),
                reason: "unit was dropped by the task queue".into(),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// In-process queue: tokio tasks gated by a semaphore of `workers` permits.
#[derive(Clone)]
pub struct LocalTaskQueue {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl LocalTaskQueue {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Default for LocalTaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_WORKERS)
    }
}

impl TaskQueue for LocalTaskQueue {
    fn submit(&self, unit: &ExecutionUnit, task: UnitTask) -> UnitHandle {
        let (tx, rx) = oneshot::channel();
        let permits = self.permits.clone();
        let test_case_id = unit.test_case_id().to_string();
        let id = test_case_id.clone();

        tokio::spawn(async move {
            let resolution = match permits.acquire_owned().await {
                Ok(_permit) => match tokio::spawn(task).await {
                    Ok(res) => res,
                    Err(e) => {
                        tracing::error!(test_case_id = %id, error = %e, "unit task aborted");
                        UnitResolution::Failed {
                            test_case_id: id,
                            reason: format!("unit task aborted: {e}"),
                        }
                    }
                },
                Err(_) => UnitResolution::Failed {
                    test_case_id: id,
                    reason: "task queue closed".into(),
                },
            };
            let _ = tx.send(resolution);
        });

        UnitHandle::new(test_case_id, rx)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
