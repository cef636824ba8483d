// ========================================================================================
//                               Dispatch fabric
// ========================================================================================
//
// The orchestrator hands task descriptors to a `DispatchFabric` and collects
// `TaskResult`s from it in completion order. Two backends are provided:
//
//   - `InlineFabric` runs each task on the submitting thread. It is deterministic and
//     is what tests and small runs use.
//   - `PoolFabric` runs tasks on a dedicated rayon pool, bounds the number of tasks in
//     flight, dispatches submissions in batches and returns results over a channel.
//
// Both own the `TaskContext` their tasks run against, including the block cache and
// the cleanup trigger.

use crate::task::{TaskContext, TaskDescriptor, TaskError, TaskResult, run_block_task};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use crossbeam_queue::SegQueue;
use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FabricError {
    #[error("Failed to build the worker pool: {0}")]
    PoolBuild(String),
    #[error("The dispatch fabric's result channel disconnected.")]
    Disconnected,
}

/// Counts task executions and fires every `frequency` of them. A frequency of
/// zero never fires.
#[derive(Debug, Default)]
pub struct CleanupTrigger {
    frequency: u64,
    executions: AtomicU64,
}

impl CleanupTrigger {
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency,
            executions: AtomicU64::new(0),
        }
    }

    pub fn tick(&self) -> bool {
        if self.frequency == 0 {
            return false;
        }
        let count = self.executions.fetch_add(1, Ordering::AcqRel) + 1;
        count % self.frequency == 0
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Acquire)
    }
}

/// Anything that can run block tasks and report their results.
pub trait DispatchFabric: Send + Sync {
    /// Queues one task. May block to apply backpressure.
    fn submit(&self, task: TaskDescriptor) -> Result<(), FabricError>;

    /// Waits up to `timeout` for the next completed task.
    fn next_result(&self, timeout: Duration) -> Result<Option<TaskResult>, FabricError>;

    /// Dispatches any submissions still held back for batching.
    fn flush(&self) -> Result<(), FabricError> {
        Ok(())
    }

    /// How many submissions are grouped before they are dispatched.
    fn batch_size(&self) -> usize {
        1
    }

    fn worker_count(&self) -> usize;
}

/// Runs a task, turning a panic into a failed result.
fn execute_guarded(context: &TaskContext, task: &TaskDescriptor) -> TaskResult {
    match panic::catch_unwind(AssertUnwindSafe(|| run_block_task(context, task))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            error!("Task {} panicked: {message}", task.task_id);
            TaskResult::failed(
                task,
                &context.host,
                TaskError::Panicked(message),
                "Processing".to_string(),
            )
        }
    }
}

// ========================================================================================
//                                 Inline backend
// ========================================================================================

pub struct InlineFabric {
    context: Arc<TaskContext>,
    completed: SegQueue<TaskResult>,
}

impl InlineFabric {
    pub fn new(context: Arc<TaskContext>) -> Self {
        Self {
            context,
            completed: SegQueue::new(),
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }
}

impl DispatchFabric for InlineFabric {
    fn submit(&self, task: TaskDescriptor) -> Result<(), FabricError> {
        self.completed.push(execute_guarded(&self.context, &task));
        Ok(())
    }

    fn next_result(&self, timeout: Duration) -> Result<Option<TaskResult>, FabricError> {
        if let Some(result) = self.completed.pop() {
            return Ok(Some(result));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        Ok(self.completed.pop())
    }

    fn worker_count(&self) -> usize {
        1
    }
}

// ========================================================================================
//                                  Pool backend
// ========================================================================================

/// Tuning for the pool backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub workers: usize,
    pub max_in_flight: usize,
    pub batch_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            workers,
            max_in_flight: workers * 4,
            batch_size: workers,
        }
    }
}

pub struct PoolFabric {
    pool: rayon::ThreadPool,
    context: Arc<TaskContext>,
    results_tx: Sender<TaskResult>,
    results_rx: Receiver<TaskResult>,
    // One token per task submitted and not yet collected.
    in_flight_tx: Sender<()>,
    in_flight_rx: Receiver<()>,
    pending: Mutex<Vec<TaskDescriptor>>,
    settings: PoolSettings,
}

impl PoolFabric {
    pub fn new(context: Arc<TaskContext>, settings: PoolSettings) -> Result<Self, FabricError> {
        let workers = settings.workers.max(1);
        let batch_size = settings.batch_size.max(1);
        // A batch must fit in flight, or the last partial batch could never be dispatched.
        let max_in_flight = settings.max_in_flight.max(batch_size);
        let settings = PoolSettings {
            workers,
            max_in_flight,
            batch_size,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rayvar-worker-{i}"))
            .build()
            .map_err(|e| FabricError::PoolBuild(e.to_string()))?;
        let (results_tx, results_rx) = unbounded();
        let (in_flight_tx, in_flight_rx) = bounded(max_in_flight);
        debug!(
            "Worker pool ready: {workers} workers, {max_in_flight} tasks in flight, batches of {batch_size}."
        );

        Ok(Self {
            pool,
            context,
            results_tx,
            results_rx,
            in_flight_tx,
            in_flight_rx,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            settings,
        })
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    fn dispatch(&self, tasks: Vec<TaskDescriptor>) {
        for task in tasks {
            let context = Arc::clone(&self.context);
            let tx = self.results_tx.clone();
            self.pool.spawn(move || {
                let result = execute_guarded(&context, &task);
                // The receiver lives as long as the fabric.
                let _ = tx.send(result);
            });
        }
    }

    fn take_pending(&self, only_if_full: bool) -> Vec<TaskDescriptor> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if only_if_full && pending.len() < self.settings.batch_size {
            return Vec::new();
        }
        std::mem::take(&mut *pending)
    }
}

impl DispatchFabric for PoolFabric {
    fn submit(&self, task: TaskDescriptor) -> Result<(), FabricError> {
        self.in_flight_tx
            .send(())
            .map_err(|_| FabricError::Disconnected)?;
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        let batch = self.take_pending(true);
        self.dispatch(batch);
        Ok(())
    }

    fn next_result(&self, timeout: Duration) -> Result<Option<TaskResult>, FabricError> {
        match self.results_rx.recv_timeout(timeout) {
            Ok(result) => {
                let _ = self.in_flight_rx.try_recv();
                Ok(Some(result))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FabricError::Disconnected),
        }
    }

    fn flush(&self) -> Result<(), FabricError> {
        let batch = self.take_pending(false);
        self.dispatch(batch);
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    fn worker_count(&self) -> usize {
        self.settings.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_trigger_fires_every_nth_execution() {
        let trigger = CleanupTrigger::new(3);
        let fired: Vec<bool> = (0..7).map(|_| trigger.tick()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
        assert_eq!(trigger.executions(), 7);

        let never = CleanupTrigger::new(0);
        assert!((0..5).all(|_| !never.tick()));
    }

    #[test]
    fn cleanup_trigger_counts_across_threads() {
        let trigger = Arc::new(CleanupTrigger::new(10));
        let fired: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let trigger = Arc::clone(&trigger);
                    scope.spawn(move || (0..25).filter(|_| trigger.tick()).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(fired, 10);
        assert_eq!(trigger.executions(), 100);
    }
}
