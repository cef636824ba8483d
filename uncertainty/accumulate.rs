// ========================================================================================
//                            Variance accumulation
// ========================================================================================
//
// Every block task returns partial sums for the rays it touched. The accumulator adds
// them into one table per result kind. Addition is elementwise and commutative, so the
// order in which tasks complete does not affect the result beyond floating-point
// rounding. Each task id may be merged exactly once.

use crate::debug::DebugTrace;
use crate::task::{
    PairCovarianceTable, SelfVarianceTable, TaskCounters, TaskFailure, TaskResult, TaskTimings,
};
use crate::types::{AaKey, AbKey, PartialVariance};
use ahash::AHashSet;
use itertools::Itertools;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MergeError {
    #[error("{0}")]
    TaskFailed(Box<TaskFailure>),
    #[error("Task {task_id} was merged twice.")]
    Duplicate { task_id: u64 },
    #[error("Task {task_id} returned neither self-variance nor site-pair results.")]
    NoResult { task_id: u64 },
}

/// A ray's variance (or a ray pair's covariance) with the derived totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FinalVariance {
    pub diagonal: f64,
    pub off_diagonal: f64,
    pub non_represented: f64,
    pub total: f64,
    pub represented_fraction: f64,
}

impl From<PartialVariance> for FinalVariance {
    fn from(pv: PartialVariance) -> Self {
        Self {
            diagonal: pv.diagonal,
            off_diagonal: pv.off_diagonal,
            non_represented: pv.non_represented,
            total: pv.total(),
            represented_fraction: pv.represented_fraction(),
        }
    }
}

#[derive(Debug, Default)]
pub struct VarianceAccumulator {
    self_variance: SelfVarianceTable,
    pair_covariance: PairCovarianceTable,
    debug: Vec<DebugTrace>,
    counters: TaskCounters,
    timings: TaskTimings,
    merged: AHashSet<u64>,
    self_variance_tasks: u64,
    site_pair_tasks: u64,
    warnings: u64,
}

impl VarianceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, result: TaskResult) -> Result<(), MergeError> {
        if let Some(failure) = result.failure {
            return Err(MergeError::TaskFailed(Box::new(failure)));
        }
        if result.self_variance.is_none() && result.pair_covariance.is_none() {
            return Err(MergeError::NoResult {
                task_id: result.task_id,
            });
        }
        if !self.merged.insert(result.task_id) {
            return Err(MergeError::Duplicate {
                task_id: result.task_id,
            });
        }

        if let Some(table) = result.self_variance {
            self.self_variance_tasks += 1;
            for (key, partial) in table {
                self.self_variance.entry(key).or_default().add(&partial);
            }
        }
        if let Some(table) = result.pair_covariance {
            self.site_pair_tasks += 1;
            for (key, partial) in table {
                self.pair_covariance.entry(key).or_default().add(&partial);
            }
        }
        self.debug.extend(result.debug);
        self.counters.add(&result.counters);
        self.timings.add(&result.timings);
        self.warnings += result.warnings.len() as u64;
        Ok(())
    }

    pub fn tasks_merged(&self) -> usize {
        self.merged.len()
    }

    pub fn counters(&self) -> &TaskCounters {
        &self.counters
    }

    pub fn self_variance(&self, key: &AaKey) -> Option<&PartialVariance> {
        self.self_variance.get(key)
    }

    pub fn pair_covariance(&self, key: &AbKey) -> Option<&PartialVariance> {
        self.pair_covariance.get(key)
    }

    /// Derives totals and sorts every table by key.
    pub fn finalize(self, wall_time: Duration, workers: usize) -> FinalResults {
        let summary = PerformanceSummary::new(&self, wall_time, workers);
        let self_variance = self
            .self_variance
            .into_iter()
            .map(|(key, pv)| (key, FinalVariance::from(pv)))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect();
        let pair_covariance = self
            .pair_covariance
            .into_iter()
            .map(|(key, pv)| (key, FinalVariance::from(pv)))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect();
        let debug = self
            .debug
            .into_iter()
            .sorted_by_key(|trace| (trace.task_id, trace.source, trace.site_a, trace.site_b))
            .collect();

        FinalResults {
            self_variance,
            pair_covariance,
            debug,
            summary,
        }
    }
}

/// The completed phase, ready to be written out.
#[derive(Debug, Clone)]
pub struct FinalResults {
    pub self_variance: Vec<(AaKey, FinalVariance)>,
    pub pair_covariance: Vec<(AbKey, FinalVariance)>,
    pub debug: Vec<DebugTrace>,
    pub summary: PerformanceSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub tasks: u64,
    pub self_variance_tasks: u64,
    pub site_pair_tasks: u64,
    pub io_warnings: u64,
    pub workers: usize,
    pub wall_seconds: f64,
    pub mean_task_ms: f64,
    pub mean_ray_weight_read_ms: f64,
    pub mean_block_read_ms: f64,
    pub mean_nonrep_read_ms: f64,
    pub mean_process_ms: f64,
    pub mean_cleanup_ms: f64,
    /// Summed task time over the time the workers were available.
    pub processor_utilization: f64,
    pub counters: TaskCounters,
}

fn mean_ms(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_secs_f64() * 1000.0 / count as f64
    }
}

impl PerformanceSummary {
    fn new(acc: &VarianceAccumulator, wall_time: Duration, workers: usize) -> Self {
        let tasks = acc.merged.len() as u64;
        let timings = &acc.timings;
        let counters = acc.counters;
        let wall_seconds = wall_time.as_secs_f64();
        let capacity = wall_seconds * workers.max(1) as f64;
        let processor_utilization = if capacity > 0.0 {
            timings.total.as_secs_f64() / capacity
        } else {
            0.0
        };
        Self {
            tasks,
            self_variance_tasks: acc.self_variance_tasks,
            site_pair_tasks: acc.site_pair_tasks,
            io_warnings: acc.warnings,
            workers,
            wall_seconds,
            mean_task_ms: mean_ms(timings.total, tasks),
            mean_ray_weight_read_ms: mean_ms(timings.ray_weight_read, tasks),
            mean_block_read_ms: mean_ms(timings.block_read, tasks),
            mean_nonrep_read_ms: mean_ms(timings.nonrep_read, tasks),
            mean_process_ms: mean_ms(timings.process, tasks),
            mean_cleanup_ms: mean_ms(timings.cleanup, counters.cleanups),
            processor_utilization,
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::WarningTrail;
    use crate::task::{TaskDescriptor, TaskError, TaskKind};
    use crate::types::{BlockKey, Phase};

    fn aa_key(site: i64, source: i64) -> AaKey {
        AaKey {
            phase: Phase::new("Pn").unwrap(),
            site,
            source,
        }
    }

    fn result_with(task_id: u64, entries: &[(AaKey, PartialVariance)]) -> TaskResult {
        TaskResult {
            task_id,
            block: BlockKey::new(0, 0),
            host: "test".to_string(),
            self_variance: Some(entries.iter().cloned().collect()),
            pair_covariance: None,
            debug: Vec::new(),
            counters: TaskCounters {
                contributions: 1,
                ..TaskCounters::default()
            },
            timings: TaskTimings {
                total: Duration::from_millis(4),
                ..TaskTimings::default()
            },
            warnings: WarningTrail::new(),
            failure: None,
        }
    }

    fn pv(diagonal: f64, off_diagonal: f64, non_represented: f64) -> PartialVariance {
        PartialVariance {
            diagonal,
            off_diagonal,
            non_represented,
        }
    }

    #[test]
    fn merge_adds_partials_for_the_same_ray() {
        let mut acc = VarianceAccumulator::new();
        acc.merge(result_with(0, &[(aa_key(1, 1), pv(4.0, 0.0, 0.0))]))
            .unwrap();
        acc.merge(result_with(1, &[(aa_key(1, 1), pv(0.5, 0.25, 0.0))]))
            .unwrap();
        acc.merge(result_with(2, &[(aa_key(1, 1), pv(0.0, 0.0, 1.5))]))
            .unwrap();

        assert_eq!(acc.self_variance(&aa_key(1, 1)), Some(&pv(4.5, 0.25, 1.5)));
        assert_eq!(acc.tasks_merged(), 3);
        assert_eq!(acc.counters().contributions, 3);

        let results = acc.finalize(Duration::from_millis(6), 2);
        let (key, total) = &results.self_variance[0];
        assert_eq!(key, &aa_key(1, 1));
        assert_eq!(total.total, 6.25);
        assert_eq!(total.represented_fraction, 4.75 / 6.25);
        assert_eq!(results.summary.tasks, 3);
        assert_eq!(results.summary.self_variance_tasks, 3);
        assert!((results.summary.processor_utilization - 1.0).abs() < 1e-9);
        assert!((results.summary.mean_task_ms - 4.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_empty_and_failed_results_are_rejected() {
        let mut acc = VarianceAccumulator::new();
        acc.merge(result_with(5, &[])).unwrap();
        assert!(matches!(
            acc.merge(result_with(5, &[])),
            Err(MergeError::Duplicate { task_id: 5 })
        ));

        let mut empty = result_with(6, &[]);
        empty.self_variance = None;
        assert!(matches!(
            acc.merge(empty),
            Err(MergeError::NoResult { task_id: 6 })
        ));

        let task = TaskDescriptor {
            task_id: 7,
            block: BlockKey::new(1, 0),
            kind: TaskKind::SelfVariance {
                set_min: 0,
                set_max: 0,
            },
            nonrep: None,
            debug: None,
        };
        let failed = TaskResult::failed(
            &task,
            "node",
            TaskError::Panicked("x".to_string()),
            "Processing".to_string(),
        );
        assert!(matches!(acc.merge(failed), Err(MergeError::TaskFailed(_))));
        assert_eq!(acc.tasks_merged(), 1);
    }

    #[test]
    fn finalized_tables_are_sorted_by_key() {
        let mut acc = VarianceAccumulator::new();
        acc.merge(result_with(
            0,
            &[
                (aa_key(9, 1), pv(1.0, 0.0, 0.0)),
                (aa_key(2, 3), pv(2.0, 0.0, 0.0)),
                (aa_key(2, 1), pv(3.0, 0.0, 0.0)),
            ],
        ))
        .unwrap();
        let results = acc.finalize(Duration::ZERO, 1);
        let keys: Vec<(i64, i64)> = results
            .self_variance
            .iter()
            .map(|(k, _)| (k.site, k.source))
            .collect();
        assert_eq!(keys, vec![(2, 1), (2, 3), (9, 1)]);
        assert_eq!(results.summary.processor_utilization, 0.0);
    }
}
