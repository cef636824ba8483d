// ========================================================================================
//
//                              THE BLOCK TASK
//
// ========================================================================================
//
// ### Purpose ###
//
// One task owns one lower-triangular block `(r, c)` of the covariance matrix (or the
// pseudo row `(n, n)` of non-represented nodes) and contracts it against every ray that
// touches it. For a ray with weights `u` in block row `r` and `v` in block column `c`,
// the contribution is
//
//     sum over index pairs (i, j) with i >= j of  u[i] * v[j] * C[i, j]
//
// split into a diagonal part (i == j), an off-diagonal part (i > j, counted twice for
// the symmetric upper triangle), and a non-represented part (pseudo row only, i == j,
// weighted by the variance of the node's layer).
//
// Site-pair covariance tasks contract one ray against another. Off-diagonal blocks
// stand in for their own transpose: the ray of site A in row r against site B in
// column c, then site B in row r against site A in column c, both accumulated into
// the same (A, B) entry with no factor of two.
//
// ### Failure model ###
//
// A task never panics across the worker boundary and never returns an error. It
// returns a `TaskResult` that carries either its partial sums or a `TaskFailure` with
// the host, block, task id, the I/O it was performing and every retry warning it saw.

use crate::blocks::{BlockError, BlockGuard, CovarianceBlockStore};
use crate::debug::{DebugEntry, DebugRays, DebugTrace};
use crate::fabric::CleanupTrigger;
use crate::nodes::{NonRepresentedStore, NonRepresentedVariance};
use crate::rayweights::{RayGroup, RayWeightSet, RayWeightStore};
use crate::retry::{IoFailure, WarningTrail};
use crate::types::{
    AaKey, AbKey, BlockKey, MatrixLayout, PartialVariance, Phase, RaySetId, SiteId, SourceId,
    SparseRayVector, WaveType,
};
use ahash::AHashMap;
use log::{debug, trace};
use ndarray::ArrayView2;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Site A to the set of sites B whose covariance with A is wanted.
pub type SitePairs = BTreeMap<SiteId, BTreeSet<SiteId>>;
pub type SelfVarianceTable = AHashMap<AaKey, PartialVariance>;
pub type PairCovarianceTable = AHashMap<AbKey, PartialVariance>;

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Io(#[from] IoFailure),
    #[error("The task needs the {wave}-wave non-represented variance, but none was provided.")]
    MissingNonRepresented { wave: WaveType },
    #[error(
        "Pseudo-column {column} needs entry {offset} of the {wave}-wave non-represented variance, which has only {len} entries."
    )]
    NonRepresentedTooShort {
        wave: WaveType,
        column: u32,
        offset: usize,
        len: usize,
    },
    #[error("Column {column} lies outside block {block} (first column {start}, edge {edge}).")]
    IndexOutsideBlock {
        column: u32,
        block: BlockKey,
        start: usize,
        edge: usize,
    },
    #[error("Column {column} of a pseudo-row ray is below the matrix size {matrix_size}.")]
    NotPseudoColumn { column: u32, matrix_size: usize },
    #[error("Task describes the empty set range {set_min}..={set_max}.")]
    EmptySetRange { set_min: u32, set_max: u32 },
    #[error("{0}")]
    UnsupportedPhase(String),
    #[error("Worker panicked while running the task: {0}")]
    Panicked(String),
}

// ========================================================================================
//                              Descriptors and results
// ========================================================================================

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Self-variance of every ray in numbered sets `set_min..=set_max`.
    SelfVariance { set_min: u32, set_max: u32 },
    /// Covariance between rays of configured site pairs, from the unpartitioned set.
    SitePairs(Arc<SitePairs>),
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::SelfVariance { .. } => "AA",
            TaskKind::SitePairs(_) => "AB",
        }
    }
}

/// Everything a worker needs to know about one unit of work. The large shared
/// inputs are behind `Arc`s so descriptors stay cheap to clone and send.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_id: u64,
    pub block: BlockKey,
    pub kind: TaskKind,
    /// Present only on the pseudo row.
    pub nonrep: Option<Arc<NonRepresentedStore>>,
    pub debug: Option<Arc<DebugRays>>,
}

/// Node-local resources shared by every task a worker pool runs.
pub struct TaskContext {
    pub layout: MatrixLayout,
    pub blocks: CovarianceBlockStore,
    pub ray_weights: RayWeightStore,
    pub cleanup: CleanupTrigger,
    pub host: String,
}

impl TaskContext {
    pub fn new(
        blocks: CovarianceBlockStore,
        ray_weights: RayWeightStore,
        cleanup: CleanupTrigger,
    ) -> Self {
        Self {
            layout: *blocks.layout(),
            blocks,
            ray_weights,
            cleanup,
            host: host_name(),
        }
    }
}

pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounters {
    pub ray_weight_reads: u64,
    pub rays_loaded: u64,
    pub ray_elements_loaded: u64,
    pub block_reads: u64,
    pub block_cache_hits: u64,
    pub nonrep_reads: u64,
    pub ray_pairs: u64,
    pub contributions: u64,
    pub cleanups: u64,
}

impl TaskCounters {
    pub fn add(&mut self, other: &TaskCounters) {
        self.ray_weight_reads += other.ray_weight_reads;
        self.rays_loaded += other.rays_loaded;
        self.ray_elements_loaded += other.ray_elements_loaded;
        self.block_reads += other.block_reads;
        self.block_cache_hits += other.block_cache_hits;
        self.nonrep_reads += other.nonrep_reads;
        self.ray_pairs += other.ray_pairs;
        self.contributions += other.contributions;
        self.cleanups += other.cleanups;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskTimings {
    pub ray_weight_read: Duration,
    pub block_read: Duration,
    pub nonrep_read: Duration,
    pub process: Duration,
    pub cleanup: Duration,
    pub total: Duration,
}

impl TaskTimings {
    pub fn add(&mut self, other: &TaskTimings) {
        self.ray_weight_read += other.ray_weight_read;
        self.block_read += other.block_read;
        self.nonrep_read += other.nonrep_read;
        self.process += other.process;
        self.cleanup += other.cleanup;
        self.total += other.total;
    }
}

/// A task error together with the context needed to diagnose it remotely.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub error: TaskError,
    pub host: String,
    pub task_id: u64,
    pub block: BlockKey,
    pub kind: &'static str,
    pub state: String,
    pub warnings: WarningTrail,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} task {} failed on host {}", self.kind, self.task_id, self.host)?;
        writeln!(f, "  Block: {}", self.block)?;
        writeln!(f, "  State: {}", self.state)?;
        writeln!(f, "  Error: {}", self.error)?;
        if !self.warnings.is_empty() {
            writeln!(f, "  I/O warnings ({}):", self.warnings.len())?;
            for line in self.warnings.lines() {
                writeln!(f, "    {line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: u64,
    pub block: BlockKey,
    pub host: String,
    pub self_variance: Option<SelfVarianceTable>,
    pub pair_covariance: Option<PairCovarianceTable>,
    pub debug: Vec<DebugTrace>,
    pub counters: TaskCounters,
    pub timings: TaskTimings,
    pub warnings: WarningTrail,
    pub failure: Option<TaskFailure>,
}

impl TaskResult {
    /// A result for a task that never ran to completion.
    pub fn failed(task: &TaskDescriptor, host: &str, error: TaskError, state: String) -> Self {
        Self {
            task_id: task.task_id,
            block: task.block,
            host: host.to_string(),
            self_variance: None,
            pair_covariance: None,
            debug: Vec::new(),
            counters: TaskCounters::default(),
            timings: TaskTimings::default(),
            warnings: WarningTrail::new(),
            failure: Some(TaskFailure {
                error,
                host: host.to_string(),
                task_id: task.task_id,
                block: task.block,
                kind: task.kind.label(),
                state,
                warnings: WarningTrail::new(),
            }),
        }
    }
}

// ========================================================================================
//                               Contraction kernel
// ========================================================================================

/// Where the covariance values of one task come from.
pub enum Covariance<'a> {
    /// A stored dense block whose local (0, 0) sits at global (`row_start`, `col_start`).
    Block {
        key: BlockKey,
        values: ArrayView2<'a, f64>,
        row_start: usize,
        col_start: usize,
    },
    /// The pseudo row: independent pseudo-columns with a diagonal variance each.
    NonRepresented {
        wave: WaveType,
        variance: &'a NonRepresentedVariance,
        matrix_size: usize,
    },
}

/// How index pairs are enumerated and weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairMode {
    /// One ray against itself: pairs with `i >= j`, off-diagonal terms doubled.
    SelfVariance,
    /// Two different rays: every pair, transposed into the lower triangle, each
    /// counted once.
    Covariance,
}

#[inline]
fn local_offset(column: u32, start: usize, edge: usize, block: BlockKey) -> Result<usize, TaskError> {
    let offset = (column as usize)
        .checked_sub(start)
        .filter(|offset| *offset < edge);
    offset.ok_or(TaskError::IndexOutsideBlock {
        column,
        block,
        start,
        edge,
    })
}

/// Contracts `row` (entries in the task's block row) against `col` (entries in
/// its block column). Every pair with a non-zero covariance counts as a
/// contribution and is appended to `trace` when one is given, with its indices
/// and weights in lower-triangle order.
pub fn contract(
    row: &SparseRayVector,
    col: &SparseRayVector,
    covariance: &Covariance<'_>,
    mode: PairMode,
    mut trace: Option<&mut DebugTrace>,
    counters: &mut TaskCounters,
) -> Result<PartialVariance, TaskError> {
    let mut result = PartialVariance::default();
    let off_diagonal_factor = match mode {
        PairMode::SelfVariance => 2.0,
        PairMode::Covariance => 1.0,
    };

    for (i, (row_index, row_weight)) in row.iter().enumerate() {
        for (j, (col_index, col_weight)) in col.iter().enumerate() {
            let (high, low, high_weight, low_weight) = if row_index >= col_index {
                (row_index, col_index, row_weight, col_weight)
            } else if mode == PairMode::Covariance {
                (col_index, row_index, col_weight, row_weight)
            } else {
                continue;
            };
            let product = high_weight * low_weight;

            let (value, local_row, local_col) = match covariance {
                Covariance::NonRepresented {
                    wave,
                    variance,
                    matrix_size,
                } => {
                    if high != low {
                        continue;
                    }
                    let offset = (high as usize).checked_sub(*matrix_size).ok_or(
                        TaskError::NotPseudoColumn {
                            column: high,
                            matrix_size: *matrix_size,
                        },
                    )?;
                    let value =
                        variance
                            .get(offset)
                            .ok_or(TaskError::NonRepresentedTooShort {
                                wave: *wave,
                                column: high,
                                offset,
                                len: variance.len(),
                            })?;
                    result.non_represented += product * value;
                    (value, offset, offset)
                }
                Covariance::Block {
                    key,
                    values,
                    row_start,
                    col_start,
                } => {
                    let edge = values.nrows();
                    let local_row = local_offset(high, *row_start, edge, *key)?;
                    let local_col = local_offset(low, *col_start, edge, *key)?;
                    let value = values[[local_row, local_col]];
                    if high == low {
                        result.diagonal += product * value;
                    } else {
                        result.off_diagonal += off_diagonal_factor * product * value;
                    }
                    (value, local_row, local_col)
                }
            };

            if value == 0.0 {
                continue;
            }
            counters.contributions += 1;
            if let Some(trace) = trace.as_deref_mut() {
                let count = trace.entries.len() + 1;
                trace.entries.push(DebugEntry {
                    row_position: i,
                    col_position: j,
                    row_index: high,
                    col_index: low,
                    row_weight: high_weight,
                    col_weight: low_weight,
                    local_row,
                    local_col,
                    covariance: value,
                    count,
                });
            }
        }
    }
    Ok(result)
}

// ========================================================================================
//                                 Task execution
// ========================================================================================

struct TaskRun<'a> {
    ctx: &'a TaskContext,
    task: &'a TaskDescriptor,
    trail: WarningTrail,
    state: String,
    counters: TaskCounters,
    timings: TaskTimings,
    block: Option<BlockGuard>,
    nonrep: [Option<NonRepresentedVariance>; 2],
    traces: Vec<DebugTrace>,
}

/// The rays of one (phase, site A, site B) combination: `row_group` from the
/// task's block row, `col_group` from its block column.
struct GroupPairing<'g> {
    phase: &'g Phase,
    wave: WaveType,
    site_a: SiteId,
    site_b: SiteId,
    row_group: &'g RayGroup,
    col_group: &'g RayGroup,
}

fn wave_slot(wave: WaveType) -> usize {
    match wave {
        WaveType::P => 0,
        WaveType::S => 1,
    }
}

fn phase_wave(phase: &Phase) -> Result<WaveType, TaskError> {
    phase.wave_type().map_err(TaskError::UnsupportedPhase)
}

/// Builds the covariance source for rays of `wave` from whatever the task has
/// loaded.
fn covariance_view<'b>(
    layout: &MatrixLayout,
    key: BlockKey,
    block: &'b Option<BlockGuard>,
    nonrep: &'b [Option<NonRepresentedVariance>; 2],
    wave: WaveType,
) -> Result<Covariance<'b>, TaskError> {
    if layout.is_pseudo_row(key.row) {
        let variance = nonrep[wave_slot(wave)]
            .as_ref()
            .ok_or(TaskError::MissingNonRepresented { wave })?;
        return Ok(Covariance::NonRepresented {
            wave,
            variance,
            matrix_size: layout.matrix_size,
        });
    }
    let guard = block.as_ref().ok_or(BlockError::NotStored {
        key,
        num_blocks: layout.num_blocks(),
    })?;
    Ok(Covariance::Block {
        key,
        values: guard.view(),
        row_start: layout.block_start(key.row),
        col_start: layout.block_start(key.col),
    })
}

impl<'a> TaskRun<'a> {
    fn new(ctx: &'a TaskContext, task: &'a TaskDescriptor) -> Self {
        Self {
            ctx,
            task,
            trail: WarningTrail::new(),
            state: "Starting".to_string(),
            counters: TaskCounters::default(),
            timings: TaskTimings::default(),
            block: None,
            nonrep: [None, None],
            traces: Vec::new(),
        }
    }

    fn read_rays(&mut self, set: RaySetId, block_row: usize) -> Result<RayWeightSet, TaskError> {
        let path = self.ctx.ray_weights.path_for(set, block_row);
        self.state = format!("Reading: {}", path.display());
        let start = Instant::now();
        let rays = self.ctx.ray_weights.read(set, block_row, &mut self.trail)?;
        self.timings.ray_weight_read += start.elapsed();
        self.counters.ray_weight_reads += 1;
        self.counters.rays_loaded += rays.ray_count() as u64;
        self.counters.ray_elements_loaded += rays.element_count() as u64;
        Ok(rays)
    }

    /// Reads the (row, column) ray weight files of one set. On diagonal blocks
    /// the row file serves as the column file.
    fn read_row_and_col(
        &mut self,
        set: RaySetId,
    ) -> Result<(RayWeightSet, Option<RayWeightSet>), TaskError> {
        let key = self.task.block;
        let row = self.read_rays(set, key.row)?;
        let col = if key.is_diagonal() {
            None
        } else {
            Some(self.read_rays(set, key.col)?)
        };
        Ok((row, col))
    }

    /// Loads the block, or the non-represented variance for `wave`, the first
    /// time the task needs it.
    fn ensure_covariance(&mut self, wave: WaveType) -> Result<(), TaskError> {
        let key = self.task.block;
        if self.ctx.layout.is_pseudo_row(key.row) {
            let slot = wave_slot(wave);
            if self.nonrep[slot].is_some() {
                return Ok(());
            }
            let store = self
                .task
                .nonrep
                .as_ref()
                .ok_or(TaskError::MissingNonRepresented { wave })?;
            self.state = format!("Reading: {}", store.path_for(wave).display());
            let start = Instant::now();
            let variance = store.read(wave, &mut self.trail)?;
            self.timings.nonrep_read += start.elapsed();
            self.counters.nonrep_reads += 1;
            self.nonrep[slot] = Some(variance);
            return Ok(());
        }

        if self.block.is_none() {
            self.state = format!("Reading: {}", self.ctx.blocks.path_for(key).display());
            let start = Instant::now();
            let (guard, loaded) = self.ctx.blocks.acquire(key, &mut self.trail)?;
            self.timings.block_read += start.elapsed();
            if loaded {
                self.counters.block_reads += 1;
            } else {
                self.counters.block_cache_hits += 1;
            }
            self.block = Some(guard);
        }
        Ok(())
    }

    /// Drops this task's reader on the block so the next cleanup may evict it.
    fn release_block(&mut self) {
        self.block = None;
    }

    fn debug_trace(
        &self,
        phase: &Phase,
        site_a: SiteId,
        site_b: SiteId,
        source: SourceId,
    ) -> Option<DebugTrace> {
        let rays = self.task.debug.as_ref()?;
        rays.wants(site_a, site_b, source).then(|| {
            DebugTrace::new(
                self.task.task_id,
                self.task.block,
                phase.clone(),
                site_a,
                site_b,
                source,
            )
        })
    }

    fn run_self_variance(&mut self, set_min: u32, set_max: u32) -> Result<SelfVarianceTable, TaskError> {
        if set_min > set_max {
            return Err(TaskError::EmptySetRange { set_min, set_max });
        }
        let mut table = SelfVarianceTable::new();
        for set in set_min..=set_max {
            let (row_file, col_file) = self.read_row_and_col(RaySetId::Numbered(set))?;
            let col_file = col_file.as_ref().unwrap_or(&row_file);

            self.state = "Processing".to_string();
            let start = Instant::now();
            for (phase, site, row_group) in row_file.groups() {
                let Some(col_group) = col_file.group(phase, site) else {
                    continue;
                };
                if row_group.is_empty() || col_group.is_empty() {
                    continue;
                }
                let wave = phase_wave(phase)?;
                self.ensure_covariance(wave)?;
                self.state = "Processing".to_string();

                for (source, row_vector) in row_group {
                    let Some(col_vector) = col_group.get(source) else {
                        continue;
                    };
                    let mut trace = self.debug_trace(phase, site, site, *source);
                    let covariance = covariance_view(
                        &self.ctx.layout,
                        self.task.block,
                        &self.block,
                        &self.nonrep,
                        wave,
                    )?;
                    self.counters.ray_pairs += 1;
                    let partial = contract(
                        row_vector,
                        col_vector,
                        &covariance,
                        PairMode::SelfVariance,
                        trace.as_mut(),
                        &mut self.counters,
                    )?;
                    table
                        .entry(AaKey {
                            phase: phase.clone(),
                            site,
                            source: *source,
                        })
                        .or_default()
                        .add(&partial);
                    if let Some(trace) = trace {
                        self.traces.push(trace);
                    }
                }
            }
            self.timings.process += start.elapsed();
        }
        self.release_block();
        Ok(table)
    }

    /// Adds `row_group` x `col_group` into the (A, B) entries of `table` for every
    /// source both groups share.
    fn contract_groups(
        &mut self,
        table: &mut PairCovarianceTable,
        pairing: GroupPairing<'_>,
    ) -> Result<(), TaskError> {
        let GroupPairing {
            phase,
            wave,
            site_a,
            site_b,
            row_group,
            col_group,
        } = pairing;
        for (source, row_vector) in row_group {
            let Some(col_vector) = col_group.get(source) else {
                continue;
            };
            let mut trace = self.debug_trace(phase, site_a, site_b, *source);
            let covariance = covariance_view(
                &self.ctx.layout,
                self.task.block,
                &self.block,
                &self.nonrep,
                wave,
            )?;
            self.counters.ray_pairs += 1;
            let partial = contract(
                row_vector,
                col_vector,
                &covariance,
                PairMode::Covariance,
                trace.as_mut(),
                &mut self.counters,
            )?;
            table
                .entry(AbKey {
                    phase: phase.clone(),
                    site_a,
                    site_b,
                    source: *source,
                })
                .or_default()
                .add(&partial);
            if let Some(trace) = trace {
                self.traces.push(trace);
            }
        }
        Ok(())
    }

    fn run_site_pairs(&mut self, pairs: &SitePairs) -> Result<PairCovarianceTable, TaskError> {
        let (row_file, col_file) = self.read_row_and_col(RaySetId::Unpartitioned)?;
        let col_file = col_file.as_ref().unwrap_or(&row_file);
        let transpose = !self.task.block.is_diagonal();

        self.state = "Processing".to_string();
        let start = Instant::now();
        let mut table = PairCovarianceTable::new();
        for phase in row_file.phases() {
            let wave = phase_wave(phase)?;
            for (&site_a, partners) in pairs {
                for &site_b in partners {
                    // Site A in the block row against site B in the block column.
                    if let (Some(row_group), Some(col_group)) =
                        (row_file.group(phase, site_a), col_file.group(phase, site_b))
                    {
                        self.ensure_covariance(wave)?;
                        self.state = "Processing".to_string();
                        let pairing = GroupPairing {
                            phase,
                            wave,
                            site_a,
                            site_b,
                            row_group,
                            col_group,
                        };
                        self.contract_groups(&mut table, pairing)?;
                    }
                    if !transpose {
                        continue;
                    }
                    // The transposed block: site B in the block row against site A in
                    // the block column.
                    if let (Some(row_group), Some(col_group)) =
                        (row_file.group(phase, site_b), col_file.group(phase, site_a))
                    {
                        self.ensure_covariance(wave)?;
                        self.state = "Processing".to_string();
                        let pairing = GroupPairing {
                            phase,
                            wave,
                            site_a,
                            site_b,
                            row_group,
                            col_group,
                        };
                        self.contract_groups(&mut table, pairing)?;
                    }
                }
            }
        }
        self.timings.process += start.elapsed();
        self.release_block();
        Ok(table)
    }

    fn finish(mut self, outcome: Result<TaskOutcome, TaskError>, started: Instant) -> TaskResult {
        // Release this task's block before giving the cache a chance to evict it.
        self.block = None;
        if self.ctx.cleanup.tick() {
            let start = Instant::now();
            let evicted = self.ctx.blocks.cache().evict_idle();
            self.timings.cleanup = start.elapsed();
            self.counters.cleanups += 1;
            debug!(
                "Task {} triggered cache cleanup on {}: {evicted} blocks evicted.",
                self.task.task_id, self.ctx.host
            );
        }
        self.timings.total = started.elapsed();

        let (self_variance, pair_covariance, failure) = match outcome {
            Ok(TaskOutcome::SelfVariance(table)) => (Some(table), None, None),
            Ok(TaskOutcome::SitePairs(table)) => (None, Some(table), None),
            Err(error) => (
                None,
                None,
                Some(TaskFailure {
                    error,
                    host: self.ctx.host.clone(),
                    task_id: self.task.task_id,
                    block: self.task.block,
                    kind: self.task.kind.label(),
                    state: self.state.clone(),
                    warnings: self.trail.clone(),
                }),
            ),
        };

        TaskResult {
            task_id: self.task.task_id,
            block: self.task.block,
            host: self.ctx.host.clone(),
            self_variance,
            pair_covariance,
            debug: self.traces,
            counters: self.counters,
            timings: self.timings,
            warnings: self.trail,
            failure,
        }
    }
}

enum TaskOutcome {
    SelfVariance(SelfVarianceTable),
    SitePairs(PairCovarianceTable),
}

/// Runs one block task to completion. Every error is folded into the result.
pub fn run_block_task(ctx: &TaskContext, task: &TaskDescriptor) -> TaskResult {
    let started = Instant::now();
    let mut run = TaskRun::new(ctx, task);
    trace!(
        "Task {} ({}) starting on block {}.",
        task.task_id,
        task.kind.label(),
        task.block
    );

    let outcome = match &task.kind {
        TaskKind::SelfVariance { set_min, set_max } => run
            .run_self_variance(*set_min, *set_max)
            .map(TaskOutcome::SelfVariance),
        TaskKind::SitePairs(pairs) => run.run_site_pairs(pairs).map(TaskOutcome::SitePairs),
    };
    run.finish(outcome, started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockServers, write_block_file};
    use crate::retry::RetryPolicy;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    fn vector(indices: &[u32], weights: &[f64]) -> SparseRayVector {
        SparseRayVector::new(indices.to_vec(), weights.to_vec()).unwrap()
    }

    #[test]
    fn self_variance_on_a_diagonal_block_doubles_off_diagonal_terms() {
        let block = array![[4.0, 1.0], [1.0, 3.0]];
        let covariance = Covariance::Block {
            key: BlockKey::new(0, 0),
            values: block.view(),
            row_start: 0,
            col_start: 0,
        };
        let ray = vector(&[0, 1], &[1.0, 0.3]);
        let mut counters = TaskCounters::default();
        let pv = contract(
            &ray,
            &ray,
            &covariance,
            PairMode::SelfVariance,
            None,
            &mut counters,
        )
        .unwrap();

        assert_abs_diff_eq!(pv.diagonal, 4.27, epsilon = 1e-12);
        assert_abs_diff_eq!(pv.off_diagonal, 0.6, epsilon = 1e-12);
        assert_eq!(pv.non_represented, 0.0);
        assert_eq!(counters.contributions, 3);
    }

    #[test]
    fn covariance_mode_counts_each_ordered_pair_once() {
        let block = array![[4.0, 1.0], [1.0, 3.0]];
        let covariance = Covariance::Block {
            key: BlockKey::new(0, 0),
            values: block.view(),
            row_start: 0,
            col_start: 0,
        };
        let a = vector(&[0], &[2.0]);
        let b = vector(&[1], &[0.5]);
        let mut counters = TaskCounters::default();
        let ab = contract(&a, &b, &covariance, PairMode::Covariance, None, &mut counters).unwrap();
        let ba = contract(&b, &a, &covariance, PairMode::Covariance, None, &mut counters).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.off_diagonal, 1.0);
        assert_eq!(ab.diagonal, 0.0);
    }

    #[test]
    fn pseudo_row_only_counts_matching_pseudo_columns() {
        let variance = NonRepresentedVariance::new(vec![0.5, 2.0]);
        let covariance = Covariance::NonRepresented {
            wave: WaveType::P,
            variance: &variance,
            matrix_size: 4,
        };
        let ray = vector(&[4, 5], &[2.0, 1.0]);
        let mut counters = TaskCounters::default();
        let pv = contract(
            &ray,
            &ray,
            &covariance,
            PairMode::SelfVariance,
            None,
            &mut counters,
        )
        .unwrap();
        assert_eq!(pv.non_represented, 2.0 * 2.0 * 0.5 + 2.0);
        assert_eq!(pv.diagonal, 0.0);
        assert_eq!(pv.off_diagonal, 0.0);

        let beyond = vector(&[6], &[1.0]);
        assert!(matches!(
            contract(&beyond, &beyond, &covariance, PairMode::SelfVariance, None, &mut counters),
            Err(TaskError::NonRepresentedTooShort { offset: 2, .. })
        ));
    }

    #[test]
    fn indices_outside_the_block_are_rejected() {
        let block = array![[1.0, 0.0], [0.0, 1.0]];
        let covariance = Covariance::Block {
            key: BlockKey::new(1, 1),
            values: block.view(),
            row_start: 2,
            col_start: 2,
        };
        let ray = vector(&[0], &[1.0]);
        let mut counters = TaskCounters::default();
        assert!(matches!(
            contract(&ray, &ray, &covariance, PairMode::SelfVariance, None, &mut counters),
            Err(TaskError::IndexOutsideBlock { column: 0, start: 2, .. })
        ));
    }

    #[test]
    fn debug_trace_skips_zero_covariance_pairs() {
        let block = array![[4.0, 0.0], [0.0, 3.0]];
        let covariance = Covariance::Block {
            key: BlockKey::new(0, 0),
            values: block.view(),
            row_start: 0,
            col_start: 0,
        };
        let ray = vector(&[0, 1], &[1.0, 0.5]);
        let mut trace = DebugTrace::new(7, BlockKey::new(0, 0), Phase::new("Pn").unwrap(), 1, 1, 9);
        let mut counters = TaskCounters::default();
        let pv = contract(
            &ray,
            &ray,
            &covariance,
            PairMode::SelfVariance,
            Some(&mut trace),
            &mut counters,
        )
        .unwrap();

        assert_abs_diff_eq!(pv.diagonal, 4.75, epsilon = 1e-12);
        assert_eq!(pv.off_diagonal, 0.0);
        assert_eq!(counters.contributions, 2);
        assert_eq!(trace.entries.len(), 2);
        let indices: Vec<_> = trace
            .entries
            .iter()
            .map(|entry| (entry.row_index, entry.col_index, entry.count))
            .collect();
        assert_eq!(indices, vec![(0, 0, 1), (1, 1, 2)]);
    }

    #[test]
    fn debug_trace_records_pairs_in_lower_triangle_order() {
        let block = array![[4.0, 1.0], [1.0, 3.0]];
        let covariance = Covariance::Block {
            key: BlockKey::new(0, 0),
            values: block.view(),
            row_start: 0,
            col_start: 0,
        };
        let a = vector(&[0], &[2.0]);
        let b = vector(&[1], &[0.5]);
        let mut trace = DebugTrace::new(3, BlockKey::new(0, 0), Phase::new("Pn").unwrap(), 1, 2, 9);
        let mut counters = TaskCounters::default();
        contract(
            &a,
            &b,
            &covariance,
            PairMode::Covariance,
            Some(&mut trace),
            &mut counters,
        )
        .unwrap();

        assert_eq!(trace.entries.len(), 1);
        let entry = &trace.entries[0];
        assert_eq!((entry.row_position, entry.col_position), (0, 0));
        assert_eq!((entry.row_index, entry.col_index), (1, 0));
        assert_eq!((entry.row_weight, entry.col_weight), (0.5, 2.0));
        assert_eq!((entry.local_row, entry.local_col), (1, 0));
        assert_eq!(entry.covariance, 1.0);
    }

    #[test]
    fn block_is_released_as_soon_as_its_contractions_finish() {
        let dir = tempdir().unwrap();
        let layout = MatrixLayout::new(2, 2).unwrap();
        let policy = RetryPolicy::new(1, Duration::ZERO);
        let servers = BlockServers::new(vec![dir.path().join("srv")]).unwrap();
        let key = BlockKey::new(0, 0);
        write_block_file(&servers.path_for(key), &array![[4.0, 1.0], [1.0, 3.0]]).unwrap();

        let ray_weights = RayWeightStore::new(dir.path().join("rays"), policy);
        let mut rays = RayWeightSet::new();
        rays.insert(Phase::new("Pn").unwrap(), 1, 9, vector(&[0, 1], &[1.0, 0.3]));
        rays.insert(Phase::new("Pn").unwrap(), 2, 9, vector(&[1], &[2.0]));
        let mut trail = WarningTrail::new();
        for set in [RaySetId::Numbered(0), RaySetId::Unpartitioned] {
            ray_weights.write_split(set, &rays, &layout, &mut trail).unwrap();
        }
        let ctx = TaskContext::new(
            CovarianceBlockStore::new(layout, servers, policy),
            ray_weights,
            CleanupTrigger::new(1000),
        );

        let aa = TaskDescriptor {
            task_id: 0,
            block: key,
            kind: TaskKind::SelfVariance {
                set_min: 0,
                set_max: 0,
            },
            nonrep: None,
            debug: None,
        };
        let mut run = TaskRun::new(&ctx, &aa);
        let table = run.run_self_variance(0, 0).unwrap();
        assert_eq!(table.len(), 2);
        assert!(run.block.is_none());
        assert_eq!(ctx.blocks.cache().evict_idle(), 1);

        let pairs = Arc::new(SitePairs::from([(1, BTreeSet::from([2]))]));
        let ab = TaskDescriptor {
            task_id: 1,
            block: key,
            kind: TaskKind::SitePairs(Arc::clone(&pairs)),
            nonrep: None,
            debug: None,
        };
        let mut run = TaskRun::new(&ctx, &ab);
        let table = run.run_site_pairs(&pairs).unwrap();
        assert_eq!(table.len(), 1);
        assert!(run.block.is_none());
        assert_eq!(ctx.blocks.cache().evict_idle(), 1);
    }

    #[test]
    fn failure_display_carries_provenance() {
        let task = TaskDescriptor {
            task_id: 12,
            block: BlockKey::new(3, 1),
            kind: TaskKind::SelfVariance {
                set_min: 0,
                set_max: 0,
            },
            nonrep: None,
            debug: None,
        };
        let result = TaskResult::failed(
            &task,
            "node-17",
            TaskError::Panicked("boom".to_string()),
            "Processing".to_string(),
        );
        let text = result.failure.unwrap().to_string();
        assert!(text.contains("AA task 12 failed on host node-17"));
        assert!(text.contains("Block: (3, 1)"));
        assert!(text.contains("State: Processing"));
        assert!(text.contains("boom"));
    }
}
