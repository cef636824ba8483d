// ========================================================================================
//                              Debug ray tracing
// ========================================================================================
//
// A debug request names (source, site A, site B) triples whose individual covariance
// contributions should be recorded. Self-variance of a ray is requested with
// site A == site B. Tasks consult the filter once per ray pair and, on a match,
// record every element-pair product with a non-zero covariance that went into the sums.

use crate::types::{BlockKey, Phase, SiteId, SourceId};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

/// One requested triple, as it appears in the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugRayRequest {
    pub source: SourceId,
    pub site_a: SiteId,
    pub site_b: SiteId,
}

/// Lookup of requested triples: source, then site A, then the set of site B.
#[derive(Debug, Clone, Default)]
pub struct DebugRays {
    requests: AHashMap<SourceId, AHashMap<SiteId, AHashSet<SiteId>>>,
}

impl DebugRays {
    pub fn new(requests: &[DebugRayRequest]) -> Self {
        let mut rays = Self::default();
        for request in requests {
            rays.requests
                .entry(request.source)
                .or_default()
                .entry(request.site_a)
                .or_default()
                .insert(request.site_b);
        }
        rays
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[inline]
    pub fn wants(&self, site_a: SiteId, site_b: SiteId, source: SourceId) -> bool {
        self.requests
            .get(&source)
            .and_then(|sites| sites.get(&site_a))
            .is_some_and(|partners| partners.contains(&site_b))
    }
}

/// One element-pair product recorded for a debug ray pair.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEntry {
    /// Positions of the two elements inside their sparse vectors.
    pub row_position: usize,
    pub col_position: usize,
    /// Global matrix columns of the two elements, larger first, with the weight
    /// of each.
    pub row_index: u32,
    pub col_index: u32,
    pub row_weight: f64,
    pub col_weight: f64,
    /// Block-local coordinates used for the covariance lookup.
    pub local_row: usize,
    pub local_col: usize,
    pub covariance: f64,
    /// Contributions recorded for this trace so far, this one included.
    pub count: usize,
}

/// Every recorded contribution of one (phase, site A, site B, source) inside
/// one block task.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugTrace {
    pub task_id: u64,
    pub block: BlockKey,
    pub phase: Phase,
    pub site_a: SiteId,
    pub site_b: SiteId,
    pub source: SourceId,
    pub entries: Vec<DebugEntry>,
}

impl DebugTrace {
    pub fn new(
        task_id: u64,
        block: BlockKey,
        phase: Phase,
        site_a: SiteId,
        site_b: SiteId,
        source: SourceId,
    ) -> Self {
        Self {
            task_id,
            block,
            phase,
            site_a,
            site_b,
            source,
            entries: Vec::new(),
        }
    }
}
