// ========================================================================================
//
//                              STAGING RAY WEIGHTS
//
// ========================================================================================
//
// ### Purpose ###
//
// `prepare` turns traced rays into the files a solve phase reads:
//
//   1. Map every active node of the model to a matrix column or pseudo-column.
//   2. Read each ray's node weights and translate them into column space.
//   3. Build one non-represented variance vector per wave type that has rays.
//   4. Deal the rays into numbered sets under an element limit and write each set
//      split by block row. Optionally write the unpartitioned set used for site pairs.
//   5. Record the layout and set count in `layout.toml`.
//
// ### Ray file ###
//
// Tab-separated with the header `phase site source weights`. The weights column lists
// `active_node:weight` entries separated by `;`. An empty weights column is a ray that
// touches no active node.

use crate::config::{ConfigError, PrepareConfig, StagedLayout};
use crate::nodes::{
    ActiveNodeIndex, ColumnMap, NodeMapError, NonRepresentedStore, NonRepresentedVariance,
    PointMap, layer_variances,
};
use crate::rayweights::{RaySetPartitioner, RayWeightSet, RayWeightStore};
use crate::retry::{IoFailure, WarningTrail};
use crate::types::{Phase, RaySetId, SiteId, SourceId, WaveType};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Nodes(#[from] NodeMapError),
    #[error("Failed to read the ray file: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] IoFailure),
    #[error("Ray on line {line}: {message}")]
    InvalidRay { line: u64, message: String },
    #[error("Ray ({phase}, site {site}, source {source_id}) appears more than once.")]
    DuplicateRay {
        phase: Phase,
        site: SiteId,
        source_id: SourceId,
    },
}

#[derive(Debug, Deserialize)]
struct RayRecord {
    phase: String,
    site: SiteId,
    source: SourceId,
    #[serde(default)]
    weights: String,
}

/// Parses `node:weight;node:weight;...`. Blank entries are skipped.
pub fn parse_node_weights(text: &str) -> Result<Vec<(usize, f64)>, String> {
    let mut weights = Vec::new();
    for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (node, weight) = entry
            .split_once(':')
            .ok_or_else(|| format!("weight entry '{entry}' is not of the form node:weight"))?;
        let node = node
            .trim()
            .parse::<usize>()
            .map_err(|e| format!("bad node index in '{entry}': {e}"))?;
        let weight = weight
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("bad weight in '{entry}': {e}"))?;
        if !weight.is_finite() {
            return Err(format!("weight in '{entry}' is not finite"));
        }
        weights.push((node, weight));
    }
    Ok(weights)
}

/// Reads every ray of `path` into column space.
pub fn read_rays(path: &Path, index: &ActiveNodeIndex) -> Result<RayWeightSet, PrepareError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut rays = RayWeightSet::new();
    for (row, record) in reader.deserialize::<RayRecord>().enumerate() {
        let record = record?;
        // Line 1 is the header.
        let line = row as u64 + 2;
        let invalid = |message: String| PrepareError::InvalidRay { line, message };

        let phase = Phase::new(record.phase).map_err(invalid)?;
        let wave = phase.wave_type().map_err(invalid)?;
        let weights = parse_node_weights(&record.weights).map_err(invalid)?;
        let vector = index.translate(wave, &weights)?;

        if rays
            .insert(phase.clone(), record.site, record.source, vector)
            .is_some()
        {
            return Err(PrepareError::DuplicateRay {
                phase,
                site: record.site,
                source_id: record.source,
            });
        }
    }
    Ok(rays)
}

/// What a `prepare` run staged.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareSummary {
    pub staged: StagedLayout,
    pub rays: usize,
    pub elements: usize,
    pub files_written: usize,
    pub nonrep_waves: Vec<WaveType>,
    pub warnings: WarningTrail,
}

pub fn run_prepare(config: &PrepareConfig) -> Result<PrepareSummary, PrepareError> {
    let started = Instant::now();
    let layout = config.layout()?;

    let points = PointMap::read_tsv(&config.point_map)?;
    let columns = ColumnMap::read(&config.column_map, layout.matrix_size)?;
    let index = ActiveNodeIndex::build(&columns, &points)?;

    let rays = read_rays(&config.rays, &index)?;
    info!(
        "Read {} rays with {} weights in {} (phase, site) groups.",
        rays.ray_count(),
        rays.element_count(),
        rays.group_count()
    );
    if rays.is_empty() {
        warn!("The ray file {} holds no rays.", config.rays.display());
    }

    let mut trail = WarningTrail::new();
    let mut files_written = 0;

    let waves: BTreeSet<WaveType> = rays
        .phases()
        .filter_map(|phase| phase.wave_type().ok())
        .collect();
    let nonrep_store = NonRepresentedStore::new(&config.nonrep_dir, config.retry);
    for &wave in &waves {
        let configured = match wave {
            WaveType::P => &config.layer_std_dev_p,
            WaveType::S => &config.layer_std_dev_s,
        };
        let variance = layer_variances(&points, wave, configured);
        let nonrep = NonRepresentedVariance::build(&index, &points, wave, &variance);
        let path = nonrep_store.write(wave, &nonrep, &mut trail)?;
        files_written += 1;
        info!(
            "Wrote {} ({} pseudo-columns, {} for {wave}).",
            path.display(),
            nonrep.len(),
            index.pseudo_count(wave)
        );
    }

    let ray_store = RayWeightStore::new(&config.ray_weight_dir, config.retry);
    let sets = RaySetPartitioner::new(config.element_limit).partition(&rays);
    for (k, set) in sets.iter().enumerate() {
        files_written += ray_store.write_split(RaySetId::Numbered(k as u32), set, &layout, &mut trail)?;
        info!(
            "Ray weight set {k}: {} rays, {} weights.",
            set.ray_count(),
            set.element_count()
        );
    }
    if config.stage_site_pairs {
        files_written += ray_store.write_split(RaySetId::Unpartitioned, &rays, &layout, &mut trail)?;
        info!("Staged the unpartitioned set for site-pair covariance.");
    }

    let staged = StagedLayout {
        matrix_size: layout.matrix_size,
        block_size: layout.block_size,
        set_count: sets.len() as u32,
        p_pseudo_columns: index.pseudo_count(WaveType::P),
        s_pseudo_columns: index.pseudo_count(WaveType::S),
        site_pair_set: config.stage_site_pairs,
    };
    staged.save(&config.ray_weight_dir)?;

    if !trail.is_empty() {
        warn!("Staging recovered from {} I/O failures:\n{trail}", trail.len());
    }
    info!(
        "Prepared {} ray weight sets in {:.2} s.",
        sets.len(),
        started.elapsed().as_secs_f64()
    );

    Ok(PrepareSummary {
        staged,
        rays: rays.ray_count(),
        elements: rays.element_count(),
        files_written,
        nonrep_waves: waves.into_iter().collect(),
        warnings: trail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_weights_parse_and_skip_blank_entries() {
        let parsed = parse_node_weights(" 3:0.5; ;7:1e-2;").unwrap();
        assert_eq!(parsed, vec![(3, 0.5), (7, 0.01)]);
        assert!(parse_node_weights("").unwrap().is_empty());
    }

    #[test]
    fn malformed_node_weights_are_rejected() {
        assert!(parse_node_weights("3=0.5").is_err());
        assert!(parse_node_weights("x:0.5").is_err());
        assert!(parse_node_weights("3:abc").is_err());
        assert!(parse_node_weights("3:inf").is_err());
    }
}
