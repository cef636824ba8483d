// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Station identifier as carried in the ray weight files.
pub type SiteId = i64;
/// Event identifier as carried in the ray weight files.
pub type SourceId = i64;

/// The wave family a phase travels as. It selects the non-represented variance
/// vector and the half of the active node map used for a ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WaveType {
    P,
    S,
}

impl WaveType {
    pub const ALL: [WaveType; 2] = [WaveType::P, WaveType::S];

    pub fn label(self) -> &'static str {
        match self {
            WaveType::P => "P",
            WaveType::S => "S",
        }
    }
}

impl fmt::Display for WaveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A seismic phase name such as `Pn` or `Sg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Phase(String);

impl Phase {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err("Phase name is empty.".to_string());
        }
        let phase = Phase(trimmed.to_string());
        phase.wave_type()?;
        Ok(phase)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// P-family phases start with `P`. S-family phases start with `S`, and the
    /// crustal `Lg` phase travels as an S wave.
    pub fn wave_type(&self) -> Result<WaveType, String> {
        match self.0.chars().next() {
            Some('P') | Some('p') => Ok(WaveType::P),
            Some('S') | Some('s') | Some('L') | Some('l') => Ok(WaveType::S),
            _ => Err(format!(
                "Phase '{}' does not map to a supported wave type (expected a P, S or Lg family phase).",
                self.0
            )),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinates of one block of the lower-triangular block grid. The pseudo row
/// `(num_blocks, num_blocks)` addresses the non-represented diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub row: usize,
    pub col: usize,
}

impl BlockKey {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    #[inline]
    pub fn is_diagonal(&self) -> bool {
        self.row == self.col
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// The partitioning of the covariance matrix into square blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixLayout {
    pub matrix_size: usize,
    pub block_size: usize,
}

impl MatrixLayout {
    pub fn new(matrix_size: usize, block_size: usize) -> Result<Self, String> {
        let layout = Self {
            matrix_size,
            block_size,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.matrix_size == 0 {
            return Err("Matrix size must be greater than zero.".to_string());
        }
        if self.block_size == 0 {
            return Err("Block size must be greater than zero.".to_string());
        }
        Ok(())
    }

    /// Number of real block rows. The last one may be partially filled.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.matrix_size.div_ceil(self.block_size)
    }

    /// Index of the block row reserved for pseudo-columns.
    #[inline]
    pub fn pseudo_row(&self) -> usize {
        self.num_blocks()
    }

    #[inline]
    pub fn is_pseudo_row(&self, row: usize) -> bool {
        row == self.num_blocks()
    }

    #[inline]
    pub fn block_of_column(&self, column: usize) -> usize {
        if column >= self.matrix_size {
            self.pseudo_row()
        } else {
            column / self.block_size
        }
    }

    /// First global column of a block row or column. The pseudo row starts at
    /// `matrix_size`.
    #[inline]
    pub fn block_start(&self, block: usize) -> usize {
        if self.is_pseudo_row(block) {
            self.matrix_size
        } else {
            block * self.block_size
        }
    }
}

/// Names a ray weight set on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaySetId {
    Numbered(u32),
    /// The single set holding every ray, used for site-pair covariance.
    Unpartitioned,
}

impl fmt::Display for RaySetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaySetId::Numbered(k) => write!(f, "{k}"),
            RaySetId::Unpartitioned => f.write_str("ab"),
        }
    }
}

/// The sparse sensitivity of one ray's travel time to the matrix columns,
/// restricted to whatever block row the vector was read for.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseRayVector {
    indices: Vec<u32>,
    weights: Vec<f64>,
}

impl SparseRayVector {
    pub fn new(indices: Vec<u32>, weights: Vec<f64>) -> Result<Self, String> {
        if indices.len() != weights.len() {
            return Err(format!(
                "Ray vector has {} indices but {} weights.",
                indices.len(),
                weights.len()
            ));
        }
        Ok(Self { indices, weights })
    }

    #[inline]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn push(&mut self, index: u32, weight: f64) {
        self.indices.push(index);
        self.weights.push(weight);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.indices
            .iter()
            .copied()
            .zip(self.weights.iter().copied())
    }
}

/// The three partial sums that make up one ray's variance, or one ray pair's
/// covariance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialVariance {
    pub diagonal: f64,
    pub off_diagonal: f64,
    pub non_represented: f64,
}

impl PartialVariance {
    #[inline]
    pub fn add(&mut self, other: &PartialVariance) {
        self.diagonal += other.diagonal;
        self.off_diagonal += other.off_diagonal;
        self.non_represented += other.non_represented;
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.diagonal + self.off_diagonal + self.non_represented
    }

    /// Share of the total carried by the represented part of the model. Zero
    /// when the total is zero.
    pub fn represented_fraction(&self) -> f64 {
        let total = self.total();
        if total == 0.0 {
            0.0
        } else {
            (self.diagonal + self.off_diagonal) / total
        }
    }
}

/// Key of one self-variance entry: a ray identified by phase, site and source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AaKey {
    pub phase: Phase,
    pub site: SiteId,
    pub source: SourceId,
}

/// Key of one site-pair covariance entry: the rays from one source to two sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbKey {
    pub phase: Phase,
    pub site_a: SiteId,
    pub site_b: SiteId,
    pub source: SourceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wave_type_follows_the_leading_letter() {
        assert_eq!(Phase::new("Pn").unwrap().wave_type().unwrap(), WaveType::P);
        assert_eq!(Phase::new("Pg").unwrap().wave_type().unwrap(), WaveType::P);
        assert_eq!(Phase::new("Sn").unwrap().wave_type().unwrap(), WaveType::S);
        assert_eq!(Phase::new("Lg").unwrap().wave_type().unwrap(), WaveType::S);
        assert!(Phase::new("Rg").is_err());
        assert!(Phase::new("  ").is_err());
    }

    #[test]
    fn layout_places_columns_and_pseudo_columns() {
        let layout = MatrixLayout::new(5, 2).unwrap();
        assert_eq!(layout.num_blocks(), 3);
        assert_eq!(layout.block_of_column(0), 0);
        assert_eq!(layout.block_of_column(3), 1);
        assert_eq!(layout.block_of_column(4), 2);
        assert_eq!(layout.block_of_column(5), 3);
        assert_eq!(layout.block_of_column(99), 3);
        assert_eq!(layout.block_start(2), 4);
        assert_eq!(layout.block_start(3), 5);
        assert!(MatrixLayout::new(0, 2).is_err());
        assert!(MatrixLayout::new(4, 0).is_err());
    }

    #[test]
    fn sparse_vector_rejects_mismatched_lengths() {
        assert!(SparseRayVector::new(vec![1, 2], vec![0.5]).is_err());
        let v = SparseRayVector::new(vec![1, 2], vec![0.5, 0.25]).unwrap();
        assert_eq!(v.iter().collect::<Vec<_>>(), vec![(1, 0.5), (2, 0.25)]);
    }

    #[test]
    fn represented_fraction_is_zero_for_zero_total() {
        let empty = PartialVariance::default();
        assert_eq!(empty.represented_fraction(), 0.0);

        let pv = PartialVariance {
            diagonal: 3.0,
            off_diagonal: 1.0,
            non_represented: 4.0,
        };
        assert_eq!(pv.total(), 8.0);
        assert_eq!(pv.represented_fraction(), 0.5);
    }
}
