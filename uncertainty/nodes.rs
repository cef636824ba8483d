// ========================================================================================
//
//                    ACTIVE NODES AND NON-REPRESENTED VARIANCE
//
// ========================================================================================
//
// ### Purpose ###
//
// Rays are traced through the full tomographic model, but the covariance matrix only
// represents a subset of its active nodes. This module maps every active node of the
// model to a matrix column, per wave type:
//
//   - Represented nodes get the column the covariance matrix assigns them. P nodes take
//     columns `[0, p_represented)`, S nodes take `[p_represented, matrix_size)`.
//   - Every other node gets a pseudo-column at or beyond `matrix_size`. P pseudo-columns
//     come first, S pseudo-columns continue after the last P one, so the two ranges never
//     overlap and one non-represented variance vector can be indexed by
//     `pseudo_column - matrix_size`.
//
// A pseudo-column is treated as an independent node whose variance is the variance of
// its model layer.

use crate::retry::{IoFailure, RetryPolicy, WarningTrail, read_with_retry, write_with_retry};
use crate::types::{SparseRayVector, WaveType};
use ahash::AHashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const NONREP_MAGIC: &[u8; 4] = b"RVNR";

#[derive(Debug, Error)]
pub enum NodeMapError {
    #[error("Failed to read '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse the point map: {0}")]
    Csv(#[from] csv::Error),
    #[error(
        "The column map describes a {found}-column matrix, but the covariance layout has {expected} columns."
    )]
    SizeMismatch { expected: usize, found: usize },
    #[error("The column map claims {p_represented} P columns out of {matrix_size}.")]
    InvalidRepresentedCount {
        p_represented: usize,
        matrix_size: usize,
    },
    #[error("Matrix column {column} refers to point {point}, which is not an active node of the model.")]
    UnknownPoint { column: usize, point: PointIndex },
    #[error("Point {point} appears more than once in the {wave}-wave columns of the column map.")]
    DuplicateColumn { wave: WaveType, point: PointIndex },
    #[error("Point {point} appears more than once in the point map.")]
    DuplicatePoint { point: PointIndex },
    #[error("Active node {node} is outside the {count}-node model.")]
    UnknownNode { node: usize, count: usize },
    #[error(transparent)]
    Retry(#[from] IoFailure),
}

/// Identifies one grid point of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointIndex {
    pub vertex: i32,
    pub layer: i32,
    pub node: i32,
}

impl fmt::Display for PointIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(vertex {}, layer {}, node {})",
            self.vertex, self.layer, self.node
        )
    }
}

// ========================================================================================
//                                   Point map
// ========================================================================================

#[derive(Debug, Deserialize)]
struct PointRecord {
    vertex: i32,
    layer: i32,
    node: i32,
    slowness_p: f64,
    slowness_s: f64,
}

/// The model's active nodes in global order, with their slowness per wave type.
#[derive(Debug, Clone)]
pub struct PointMap {
    points: Vec<PointIndex>,
    slowness_p: Vec<f64>,
    slowness_s: Vec<f64>,
    lookup: AHashMap<PointIndex, usize>,
}

impl PointMap {
    /// Builds the map from `(point, P slowness, S slowness)` in active node order.
    pub fn new(entries: Vec<(PointIndex, f64, f64)>) -> Result<Self, NodeMapError> {
        let mut points = Vec::with_capacity(entries.len());
        let mut slowness_p = Vec::with_capacity(entries.len());
        let mut slowness_s = Vec::with_capacity(entries.len());
        let mut lookup = AHashMap::with_capacity(entries.len());
        for (point, p, s) in entries {
            if lookup.insert(point, points.len()).is_some() {
                return Err(NodeMapError::DuplicatePoint { point });
            }
            points.push(point);
            slowness_p.push(p);
            slowness_s.push(s);
        }
        Ok(Self {
            points,
            slowness_p,
            slowness_s,
            lookup,
        })
    }

    /// Reads a tab-separated point map with the header
    /// `vertex layer node slowness_p slowness_s`.
    pub fn read_tsv(path: &Path) -> Result<Self, NodeMapError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)?;
        let mut entries = Vec::new();
        for record in reader.deserialize::<PointRecord>() {
            let record = record?;
            entries.push((
                PointIndex {
                    vertex: record.vertex,
                    layer: record.layer,
                    node: record.node,
                },
                record.slowness_p,
                record.slowness_s,
            ));
        }
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn position(&self, point: &PointIndex) -> Option<usize> {
        self.lookup.get(point).copied()
    }

    pub fn point(&self, node: usize) -> Option<&PointIndex> {
        self.points.get(node)
    }

    pub fn slowness(&self, wave: WaveType) -> &[f64] {
        match wave {
            WaveType::P => &self.slowness_p,
            WaveType::S => &self.slowness_s,
        }
    }
}

// ========================================================================================
//                                   Column map
// ========================================================================================

/// The covariance matrix's column assignment: which grid point each column
/// represents, and how many leading columns belong to P.
///
/// File layout (little-endian i32): P column count, matrix size, then four
/// values per column (active node index, vertex, layer, node). The active node
/// index is carried for compatibility and not used.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMap {
    p_represented: usize,
    columns: Vec<PointIndex>,
}

fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

impl ColumnMap {
    pub fn new(p_represented: usize, columns: Vec<PointIndex>) -> Result<Self, NodeMapError> {
        if p_represented > columns.len() {
            return Err(NodeMapError::InvalidRepresentedCount {
                p_represented,
                matrix_size: columns.len(),
            });
        }
        Ok(Self {
            p_represented,
            columns,
        })
    }

    pub fn read(path: &Path, expected_size: usize) -> Result<Self, NodeMapError> {
        let io_err = |source: io::Error| NodeMapError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
        let p_represented = read_i32(&mut reader).map_err(io_err)?;
        let size = read_i32(&mut reader).map_err(io_err)?;
        let size = usize::try_from(size).unwrap_or(0);
        if size != expected_size {
            return Err(NodeMapError::SizeMismatch {
                expected: expected_size,
                found: size,
            });
        }
        let p_represented =
            usize::try_from(p_represented).map_err(|_| NodeMapError::InvalidRepresentedCount {
                p_represented: 0,
                matrix_size: size,
            })?;

        let mut columns = Vec::with_capacity(size);
        for _ in 0..size {
            read_i32(&mut reader).map_err(io_err)?;
            let vertex = read_i32(&mut reader).map_err(io_err)?;
            let layer = read_i32(&mut reader).map_err(io_err)?;
            let node = read_i32(&mut reader).map_err(io_err)?;
            columns.push(PointIndex {
                vertex,
                layer,
                node,
            });
        }
        Self::new(p_represented, columns)
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&(self.p_represented as i32).to_le_bytes())?;
        writer.write_all(&(self.columns.len() as i32).to_le_bytes())?;
        for (column, point) in self.columns.iter().enumerate() {
            for value in [column as i32, point.vertex, point.layer, point.node] {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()
    }

    pub fn matrix_size(&self) -> usize {
        self.columns.len()
    }

    pub fn p_represented(&self) -> usize {
        self.p_represented
    }

    fn wave_columns(&self, wave: WaveType) -> std::ops::Range<usize> {
        match wave {
            WaveType::P => 0..self.p_represented,
            WaveType::S => self.p_represented..self.columns.len(),
        }
    }
}

// ========================================================================================
//                                Active node index
// ========================================================================================

/// Global active node to matrix column, for both wave types.
#[derive(Debug, Clone)]
pub struct ActiveNodeIndex {
    matrix_size: usize,
    p_columns: Vec<u32>,
    s_columns: Vec<u32>,
    p_pseudo: usize,
    s_pseudo: usize,
}

impl ActiveNodeIndex {
    pub fn build(columns: &ColumnMap, points: &PointMap) -> Result<Self, NodeMapError> {
        let matrix_size = columns.matrix_size();
        let mut next_pseudo = matrix_size;

        let (p_columns, p_pseudo) = Self::assign(WaveType::P, columns, points, &mut next_pseudo)?;
        let (s_columns, s_pseudo) = Self::assign(WaveType::S, columns, points, &mut next_pseudo)?;

        info!(
            "Active node index: {} nodes, {} P and {} S represented columns, {} P and {} S pseudo-columns.",
            points.len(),
            columns.p_represented(),
            matrix_size - columns.p_represented(),
            p_pseudo,
            s_pseudo
        );

        Ok(Self {
            matrix_size,
            p_columns,
            s_columns,
            p_pseudo,
            s_pseudo,
        })
    }

    fn assign(
        wave: WaveType,
        columns: &ColumnMap,
        points: &PointMap,
        next_pseudo: &mut usize,
    ) -> Result<(Vec<u32>, usize), NodeMapError> {
        let mut assigned: Vec<Option<u32>> = vec![None; points.len()];
        for column in columns.wave_columns(wave) {
            let point = columns.columns[column];
            let node = points
                .position(&point)
                .ok_or(NodeMapError::UnknownPoint { column, point })?;
            if assigned[node].replace(column as u32).is_some() {
                return Err(NodeMapError::DuplicateColumn { wave, point });
            }
        }

        let mut pseudo = 0;
        let resolved = assigned
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let column = *next_pseudo as u32;
                    *next_pseudo += 1;
                    pseudo += 1;
                    column
                })
            })
            .collect();
        debug!("{wave}-wave node assignment produced {pseudo} pseudo-columns.");
        Ok((resolved, pseudo))
    }

    pub fn matrix_size(&self) -> usize {
        self.matrix_size
    }

    pub fn pseudo_count(&self, wave: WaveType) -> usize {
        match wave {
            WaveType::P => self.p_pseudo,
            WaveType::S => self.s_pseudo,
        }
    }

    /// Length of a non-represented variance vector.
    pub fn total_pseudo(&self) -> usize {
        self.p_pseudo + self.s_pseudo
    }

    fn columns(&self, wave: WaveType) -> &[u32] {
        match wave {
            WaveType::P => &self.p_columns,
            WaveType::S => &self.s_columns,
        }
    }

    pub fn column(&self, wave: WaveType, node: usize) -> Result<u32, NodeMapError> {
        let columns = self.columns(wave);
        columns.get(node).copied().ok_or(NodeMapError::UnknownNode {
            node,
            count: columns.len(),
        })
    }

    /// Converts a ray's global-node weights into matrix-column space. Nodes that
    /// land on the same column are summed and the result is sorted by column.
    pub fn translate(
        &self,
        wave: WaveType,
        weights: &[(usize, f64)],
    ) -> Result<SparseRayVector, NodeMapError> {
        let mut merged: BTreeMap<u32, f64> = BTreeMap::new();
        for &(node, weight) in weights {
            *merged.entry(self.column(wave, node)?).or_insert(0.0) += weight;
        }
        let mut vector = SparseRayVector::default();
        for (column, weight) in merged {
            vector.push(column, weight);
        }
        Ok(vector)
    }
}

// ========================================================================================
//                              Layer variance
// ========================================================================================

/// A configured standard deviation of slowness for one model layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerStdDev {
    pub layer: i32,
    pub std_dev: f64,
}

/// Variance per model layer for one wave type. Layers with a configured
/// standard deviation use its square. Every other layer uses the sample
/// variance of its nodes' slowness, or zero when it has fewer than two nodes.
pub fn layer_variances(
    points: &PointMap,
    wave: WaveType,
    configured: &[LayerStdDev],
) -> BTreeMap<i32, f64> {
    let mut by_layer: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
    for (point, slowness) in points.points.iter().zip(points.slowness(wave)) {
        by_layer.entry(point.layer).or_default().push(*slowness);
    }

    let mut variances: BTreeMap<i32, f64> = by_layer
        .into_iter()
        .map(|(layer, values)| (layer, sample_variance(&values)))
        .collect();
    for entry in configured {
        variances.insert(entry.layer, entry.std_dev * entry.std_dev);
    }
    variances
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0)
}

// ========================================================================================
//                         Non-represented variance vectors
// ========================================================================================

/// Diagonal variance of every pseudo-column, indexed by
/// `pseudo_column - matrix_size`.
#[derive(Debug, Clone, PartialEq)]
pub struct NonRepresentedVariance {
    values: Vec<f64>,
}

impl NonRepresentedVariance {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Fills the pseudo-columns of `wave` with the variance of each node's layer.
    /// Entries belonging to the other wave type stay zero.
    pub fn build(
        index: &ActiveNodeIndex,
        points: &PointMap,
        wave: WaveType,
        layer_variance: &BTreeMap<i32, f64>,
    ) -> Self {
        let mut values = vec![0.0; index.total_pseudo()];
        for (node, column) in index.columns(wave).iter().enumerate() {
            let column = *column as usize;
            if column < index.matrix_size {
                continue;
            }
            let layer = points.points[node].layer;
            values[column - index.matrix_size] =
                layer_variance.get(&layer).copied().unwrap_or(0.0);
        }
        Self { values }
    }

    #[inline]
    pub fn get(&self, offset: usize) -> Option<f64> {
        self.values.get(offset).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

pub fn write_nonrep_file(path: &Path, variance: &NonRepresentedVariance) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(NONREP_MAGIC)?;
    writer.write_all(&(variance.values.len() as u64).to_le_bytes())?;
    for value in &variance.values {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()
}

pub fn read_nonrep_file(path: &Path) -> io::Result<NonRepresentedVariance> {
    let bytes = fs::read(path)?;
    if bytes.len() < 12 || &bytes[0..4] != NONREP_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Non-represented variance file has an unrecognized header.",
        ));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[4..12]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if bytes.len() != 12 + len * 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Non-represented variance file declares {len} values but holds {} bytes.",
                bytes.len()
            ),
        ));
    }
    let values = bytes[12..]
        .chunks_exact(8)
        .map(|chunk| {
            let mut value = [0u8; 8];
            value.copy_from_slice(chunk);
            f64::from_le_bytes(value)
        })
        .collect();
    Ok(NonRepresentedVariance { values })
}

/// Directory of per-wave-type non-represented variance vectors.
#[derive(Debug, Clone)]
pub struct NonRepresentedStore {
    dir: PathBuf,
    policy: RetryPolicy,
}

impl NonRepresentedStore {
    pub fn new(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub fn path_for(&self, wave: WaveType) -> PathBuf {
        self.dir.join(format!("nonrep_variance_{wave}.bin"))
    }

    pub fn read(
        &self,
        wave: WaveType,
        trail: &mut WarningTrail,
    ) -> Result<NonRepresentedVariance, IoFailure> {
        read_with_retry(&self.path_for(wave), &self.policy, trail, read_nonrep_file)
    }

    pub fn write(
        &self,
        wave: WaveType,
        variance: &NonRepresentedVariance,
        trail: &mut WarningTrail,
    ) -> Result<PathBuf, IoFailure> {
        let path = self.path_for(wave);
        write_with_retry(&path, &self.policy, trail, |p| {
            write_nonrep_file(p, variance)
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;
    use tempfile::tempdir;

    fn point(vertex: i32, layer: i32) -> PointIndex {
        PointIndex {
            vertex,
            layer,
            node: 0,
        }
    }

    /// Four active nodes, two per layer.
    fn sample_points() -> PointMap {
        PointMap::new(vec![
            (point(0, 0), 1.0, 2.0),
            (point(1, 0), 3.0, 2.0),
            (point(0, 1), 5.0, 4.0),
            (point(1, 1), 9.0, 8.0),
        ])
        .unwrap()
    }

    #[test]
    fn pseudo_ranges_are_disjoint_and_follow_the_matrix() {
        let points = sample_points();
        // P represents nodes 1 and 2, S represents node 3.
        let columns = ColumnMap::new(2, vec![point(1, 0), point(0, 1), point(1, 1)]).unwrap();
        let index = ActiveNodeIndex::build(&columns, &points).unwrap();

        assert_eq!(index.matrix_size(), 3);
        assert_eq!(index.column(WaveType::P, 1).unwrap(), 0);
        assert_eq!(index.column(WaveType::P, 2).unwrap(), 1);
        assert_eq!(index.column(WaveType::P, 0).unwrap(), 3);
        assert_eq!(index.column(WaveType::P, 3).unwrap(), 4);
        assert_eq!(index.column(WaveType::S, 3).unwrap(), 2);
        assert_eq!(index.column(WaveType::S, 0).unwrap(), 5);
        assert_eq!(index.column(WaveType::S, 1).unwrap(), 6);
        assert_eq!(index.column(WaveType::S, 2).unwrap(), 7);
        assert_eq!(index.pseudo_count(WaveType::P), 2);
        assert_eq!(index.pseudo_count(WaveType::S), 3);
        assert_eq!(index.total_pseudo(), 5);
        assert!(index.column(WaveType::S, 4).is_err());
    }

    #[test]
    fn column_map_rejects_unknown_and_duplicate_points() {
        let points = sample_points();
        let unknown = ColumnMap::new(1, vec![point(7, 0)]).unwrap();
        assert!(matches!(
            ActiveNodeIndex::build(&unknown, &points),
            Err(NodeMapError::UnknownPoint { column: 0, .. })
        ));

        let duplicate = ColumnMap::new(2, vec![point(0, 0), point(0, 0)]).unwrap();
        assert!(matches!(
            ActiveNodeIndex::build(&duplicate, &points),
            Err(NodeMapError::DuplicateColumn {
                wave: WaveType::P,
                ..
            })
        ));
        assert!(ColumnMap::new(3, vec![point(0, 0)]).is_err());
    }

    #[test]
    fn column_map_file_checks_the_matrix_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("columns.bin");
        let columns = ColumnMap::new(1, vec![point(1, 0), point(0, 1)]).unwrap();
        columns.write(&path).unwrap();

        assert_eq!(ColumnMap::read(&path, 2).unwrap(), columns);
        assert!(matches!(
            ColumnMap::read(&path, 3),
            Err(NodeMapError::SizeMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn translate_merges_nodes_and_sorts_columns() {
        let points = sample_points();
        let columns = ColumnMap::new(1, vec![point(0, 1), point(1, 1)]).unwrap();
        let index = ActiveNodeIndex::build(&columns, &points).unwrap();

        let vector = index
            .translate(WaveType::P, &[(3, 0.5), (2, 1.0), (3, 0.25)])
            .unwrap();
        assert_eq!(vector.indices(), &[0, 4]);
        assert_eq!(vector.weights(), &[1.0, 0.75]);
        assert!(index.translate(WaveType::P, &[(9, 1.0)]).is_err());
    }

    #[test]
    fn layer_variance_prefers_configured_values() {
        let points = sample_points();
        let derived = layer_variances(&points, WaveType::P, &[]);
        assert_abs_diff_eq!(derived[&0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(derived[&1], 8.0, epsilon = 1e-12);

        let configured = layer_variances(
            &points,
            WaveType::P,
            &[LayerStdDev {
                layer: 1,
                std_dev: 0.5,
            }],
        );
        assert_abs_diff_eq!(configured[&0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(configured[&1], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn nonrep_vector_uses_layer_of_each_pseudo_node() {
        let dir = tempdir().unwrap();
        let points = sample_points();
        let columns = ColumnMap::new(1, vec![point(0, 0), point(1, 1)]).unwrap();
        let index = ActiveNodeIndex::build(&columns, &points).unwrap();
        let variance = layer_variances(&points, WaveType::P, &[]);
        let nonrep = NonRepresentedVariance::build(&index, &points, WaveType::P, &variance);

        // P pseudo nodes are 1 (layer 0), 2 and 3 (layer 1); the S half stays zero.
        assert_eq!(nonrep.len(), index.total_pseudo());
        assert_abs_diff_eq!(nonrep.get(0).unwrap(), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(nonrep.get(1).unwrap(), 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(nonrep.get(2).unwrap(), 8.0, epsilon = 1e-12);
        assert_eq!(nonrep.get(3), Some(0.0));

        let store = NonRepresentedStore::new(dir.path(), RetryPolicy::new(1, Duration::ZERO));
        let mut trail = WarningTrail::new();
        store.write(WaveType::P, &nonrep, &mut trail).unwrap();
        assert_eq!(store.read(WaveType::P, &mut trail).unwrap(), nonrep);
        assert!(store.read(WaveType::S, &mut trail).is_err());
        assert!(
            store
                .path_for(WaveType::S)
                .ends_with("nonrep_variance_S.bin")
        );
    }
}
