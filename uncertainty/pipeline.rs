// ========================================================================================
//
//                           THE PHASE ORCHESTRATOR
//
// ========================================================================================
//
// ### Purpose ###
//
// One phase enumerates every block task, hands them to a dispatch fabric and merges the
// results as they come back. Submission and collection run concurrently:
//
//   - A producer thread computes the total task count, announces it once, then walks
//     the lazy task enumeration and submits each task, announcing every submission.
//   - The orchestrating thread waits for the count, then for each announced submission
//     waits for one completed result (polling with a short timeout), reports its
//     warnings, fails the phase on a task failure and merges it otherwise.
//
// Results arrive in completion order. Any unrecovered error stops the producer, drains
// whatever is still in flight and aborts the phase without producing output.

use crate::accumulate::{FinalResults, MergeError, VarianceAccumulator};
use crate::blocks::{BlockError, BlockServers, CovarianceBlockStore};
use crate::config::{ConfigError, RunConfig, StagedLayout};
use crate::debug::DebugRays;
use crate::fabric::{CleanupTrigger, DispatchFabric, FabricError, InlineFabric, PoolFabric};
use crate::nodes::NonRepresentedStore;
use crate::progress::PhaseObserver;
use crate::rayweights::RayWeightStore;
use crate::task::{SitePairs, TaskContext, TaskDescriptor, TaskKind};
use crate::types::{BlockKey, MatrixLayout};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long one wait for a completed task lasts before it is retried.
const RESULT_POLL: Duration = Duration::from_secs(1);
/// Waits longer than this many polls are reported.
const SLOW_RESULT_POLLS: u32 = 60;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error("The task producer thread failed: {0}")]
    Producer(String),
}

#[derive(Debug, Error)]
pub enum SolveError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(
        "{pairs} site pairs are configured, but '{}' holds no unpartitioned ray weight set. Rerun prepare with `stage_site_pairs = true`.",
        .dir.display()
    )]
    MissingSitePairSet { pairs: usize, dir: std::path::PathBuf },
}

// ========================================================================================
//                                  Task plan
// ========================================================================================

/// The full, lazily enumerated set of tasks for one phase.
///
/// Blocks are visited in lower-triangular row order followed by the pseudo row
/// `(n, n)`. Each block gets one self-variance task per numbered ray weight set
/// and, when site pairs are configured, one site-pair task.
pub struct TaskPlan {
    layout: MatrixLayout,
    set_count: u32,
    site_pairs: Option<Arc<SitePairs>>,
    nonrep: Arc<NonRepresentedStore>,
    debug: Option<Arc<DebugRays>>,
}

impl TaskPlan {
    pub fn new(
        layout: MatrixLayout,
        set_count: u32,
        site_pairs: SitePairs,
        nonrep: NonRepresentedStore,
        debug: DebugRays,
    ) -> Self {
        Self {
            layout,
            set_count,
            site_pairs: (!site_pairs.is_empty()).then(|| Arc::new(site_pairs)),
            nonrep: Arc::new(nonrep),
            debug: (!debug.is_empty()).then(|| Arc::new(debug)),
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockKey> + '_ {
        let n = self.layout.num_blocks();
        (0..=n)
            .flat_map(move |row| (0..=row).map(move |col| BlockKey::new(row, col)))
            .filter(move |key| key.row < n || key.col == n)
    }

    pub fn block_count(&self) -> usize {
        let n = self.layout.num_blocks();
        n * (n + 1) / 2 + 1
    }

    pub fn tasks_per_block(&self) -> usize {
        self.set_count as usize + usize::from(self.site_pairs.is_some())
    }

    /// Number of tasks `tasks()` yields, known before any is produced.
    pub fn total(&self) -> usize {
        self.block_count() * self.tasks_per_block()
    }

    pub fn tasks(&self) -> impl Iterator<Item = TaskDescriptor> + '_ {
        self.blocks()
            .flat_map(move |block| {
                let self_variance = (0..self.set_count).map(move |set| {
                    (
                        block,
                        TaskKind::SelfVariance {
                            set_min: set,
                            set_max: set,
                        },
                    )
                });
                let site_pairs = self
                    .site_pairs
                    .clone()
                    .map(|pairs| (block, TaskKind::SitePairs(pairs)));
                self_variance.chain(site_pairs)
            })
            .enumerate()
            .map(move |(task_id, (block, kind))| TaskDescriptor {
                task_id: task_id as u64,
                block,
                kind,
                nonrep: self
                    .layout
                    .is_pseudo_row(block.row)
                    .then(|| Arc::clone(&self.nonrep)),
                debug: self.debug.clone(),
            })
    }
}

// ========================================================================================
//                                 Phase execution
// ========================================================================================

fn produce<F: DispatchFabric + ?Sized>(
    plan: &TaskPlan,
    fabric: &F,
    abort: &AtomicBool,
    count_tx: Sender<usize>,
    submitted_tx: Sender<Result<u64, PipelineError>>,
) {
    if count_tx.send(plan.total()).is_err() {
        return;
    }
    drop(count_tx);

    let batch_size = fabric.batch_size().max(1);
    for (submitted, task) in plan.tasks().enumerate() {
        if abort.load(Ordering::Acquire) {
            debug!("Producer stopping after {submitted} submissions.");
            return;
        }
        let task_id = task.task_id;
        if let Err(e) = fabric.submit(task) {
            let _ = submitted_tx.send(Err(e.into()));
            return;
        }
        if (submitted + 1) % batch_size == 0 {
            if let Err(e) = fabric.flush() {
                let _ = submitted_tx.send(Err(e.into()));
                return;
            }
        }
        if submitted_tx.send(Ok(task_id)).is_err() {
            return;
        }
    }
    if let Err(e) = fabric.flush() {
        let _ = submitted_tx.send(Err(e.into()));
    }
}

fn consume<F: DispatchFabric + ?Sized>(
    fabric: &F,
    count_rx: Receiver<usize>,
    submitted_rx: Receiver<Result<u64, PipelineError>>,
    observer: &mut dyn PhaseObserver,
    started: Instant,
) -> Result<FinalResults, PipelineError> {
    let total = count_rx.recv().map_err(|_| {
        PipelineError::Producer("exited before reporting the task count".to_string())
    })?;
    info!("Phase has {total} block tasks.");
    observer.on_phase_start(total);

    let mut accumulator = VarianceAccumulator::new();
    for completed in 1..=total {
        match submitted_rx.recv() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(PipelineError::Producer(format!(
                    "stopped after {} of {total} submissions",
                    completed - 1
                )));
            }
        }

        let mut polls = 0u32;
        let result = loop {
            if let Some(result) = fabric.next_result(RESULT_POLL)? {
                break result;
            }
            polls += 1;
            if polls % SLOW_RESULT_POLLS == 0 {
                warn!(
                    "Still waiting for a task result after {} s ({} of {total} collected).",
                    polls as u64 * RESULT_POLL.as_secs(),
                    completed - 1
                );
            }
        };

        if !result.warnings.is_empty() {
            warn!(
                "Task {} on {} recovered from {} I/O failures:\n{}",
                result.task_id,
                result.host,
                result.warnings.len(),
                result.warnings
            );
        }
        observer.on_task_complete(completed, &result);
        accumulator.merge(result)?;
    }

    observer.on_phase_finish();
    Ok(accumulator.finalize(started.elapsed(), fabric.worker_count()))
}

/// Runs every task of `plan` on `fabric` and returns the merged results.
pub fn run_phase<F: DispatchFabric + ?Sized>(
    plan: &TaskPlan,
    fabric: &F,
    observer: &mut dyn PhaseObserver,
) -> Result<FinalResults, PipelineError> {
    let started = Instant::now();
    let (count_tx, count_rx) = bounded::<usize>(1);
    let (submitted_tx, submitted_rx) = unbounded::<Result<u64, PipelineError>>();
    let abort = AtomicBool::new(false);

    let outcome = thread::scope(|scope| {
        let producer = thread::Builder::new()
            .name("rayvar-producer".to_string())
            .spawn_scoped(scope, || produce(plan, fabric, &abort, count_tx, submitted_tx))
            .map_err(|e| PipelineError::Producer(e.to_string()))?;

        let outcome = consume(fabric, count_rx, submitted_rx, observer, started);

        if outcome.is_err() {
            abort.store(true, Ordering::Release);
            // Keep collecting so a producer blocked on backpressure can observe the abort.
            while !producer.is_finished() {
                let _ = fabric.next_result(Duration::from_millis(50));
            }
        }
        match producer.join() {
            Ok(()) => outcome,
            Err(_) => Err(PipelineError::Producer("panicked".to_string())),
        }
    });

    match &outcome {
        Ok(results) => info!(
            "Phase complete: {} tasks in {:.2} s, {} self-variance and {} site-pair entries.",
            results.summary.tasks,
            results.summary.wall_seconds,
            results.self_variance.len(),
            results.pair_covariance.len()
        ),
        Err(e) => log::error!("Phase aborted:\n{e}"),
    }
    outcome
}

// ========================================================================================
//                                  Solve phase
// ========================================================================================

/// Builds the stores, plan and fabric a run configuration describes and runs
/// the phase on them.
pub fn run_solve(
    config: &RunConfig,
    observer: &mut dyn PhaseObserver,
) -> Result<FinalResults, SolveError> {
    let staged = StagedLayout::load(&config.ray_weight_dir)?;
    let layout = staged.layout()?;
    info!(
        "Matrix of {} columns in {} block rows of {}; {} ray weight sets staged.",
        layout.matrix_size,
        layout.num_blocks(),
        layout.block_size,
        staged.set_count
    );

    let site_pairs = config.site_pair_map();
    if !site_pairs.is_empty() && !staged.site_pair_set {
        return Err(SolveError::MissingSitePairSet {
            pairs: config.site_pairs.len(),
            dir: config.ray_weight_dir.clone(),
        });
    }

    let servers = BlockServers::new(config.block_servers.clone())?;
    let context = Arc::new(TaskContext::new(
        CovarianceBlockStore::new(layout, servers, config.retry),
        RayWeightStore::new(&config.ray_weight_dir, config.retry),
        CleanupTrigger::new(config.workers.cleanup_frequency),
    ));
    let plan = TaskPlan::new(
        layout,
        staged.set_count,
        site_pairs,
        NonRepresentedStore::new(&config.nonrep_dir, config.retry),
        DebugRays::new(&config.debug_rays),
    );
    info!(
        "{} block tasks over {} blocks, running on {}.",
        plan.total(),
        plan.block_count(),
        context.host
    );

    let results = if config.workers.inline {
        let fabric = InlineFabric::new(context);
        run_phase(&plan, &fabric, observer)?
    } else {
        let fabric = PoolFabric::new(context, config.workers.pool_settings())?;
        run_phase(&plan, &fabric, observer)?
    };
    Ok(results)
}
