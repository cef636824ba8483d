// ========================================================================================
//
//                             RAY WEIGHT SETS
//
// ========================================================================================
//
// A ray weight set groups rays by (phase, site) and, inside a group, by source. Each set
// is stored once per block row: the file for block row `b` holds, for every ray, only
// the entries whose matrix column falls in that block row. Columns at or beyond the
// matrix size (pseudo-columns of non-represented nodes) go to the pseudo row
// `num_blocks`.
//
// ### Ray weight file format (little-endian) ###
//
//   magic        : 4 bytes, "RVRW"
//   group count  : u32
//   per group    : phase name (u16 length + UTF-8), site (i64), record count (u32)
//   per record   : source (i64), element count (u32), indices (i32 each), weights (f64 each)

use crate::retry::{IoFailure, RetryPolicy, WarningTrail, read_with_retry, write_with_retry};
use crate::types::{MatrixLayout, Phase, RaySetId, SiteId, SourceId, SparseRayVector};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const RAY_WEIGHT_MAGIC: &[u8; 4] = b"RVRW";

/// Rays of one (phase, site) group, keyed by source.
pub type RayGroup = BTreeMap<SourceId, SparseRayVector>;

/// One ray weight set, or the slice of it that belongs to a single block row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RayWeightSet {
    phases: BTreeMap<Phase, BTreeMap<SiteId, RayGroup>>,
}

impl RayWeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a ray, returning the vector it replaced if the source was already
    /// present in the group.
    pub fn insert(
        &mut self,
        phase: Phase,
        site: SiteId,
        source: SourceId,
        vector: SparseRayVector,
    ) -> Option<SparseRayVector> {
        self.phases
            .entry(phase)
            .or_default()
            .entry(site)
            .or_default()
            .insert(source, vector)
    }

    pub fn insert_group(&mut self, phase: Phase, site: SiteId, group: RayGroup) {
        let slot = self.phases.entry(phase).or_default().entry(site).or_default();
        slot.extend(group);
    }

    pub fn group(&self, phase: &Phase, site: SiteId) -> Option<&RayGroup> {
        self.phases.get(phase).and_then(|sites| sites.get(&site))
    }

    /// Phases in name order.
    pub fn phases(&self) -> impl Iterator<Item = &Phase> + '_ {
        self.phases.keys()
    }

    /// Every (phase, site, group) in phase then site order.
    pub fn groups(&self) -> impl Iterator<Item = (&Phase, SiteId, &RayGroup)> + '_ {
        self.phases.iter().flat_map(|(phase, sites)| {
            sites.iter().map(move |(site, group)| (phase, *site, group))
        })
    }

    pub fn group_count(&self) -> usize {
        self.phases.values().map(|sites| sites.len()).sum()
    }

    pub fn ray_count(&self) -> usize {
        self.groups().map(|(_, _, group)| group.len()).sum()
    }

    pub fn element_count(&self) -> usize {
        self.groups()
            .flat_map(|(_, _, group)| group.values())
            .map(|vector| vector.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Splits every ray by the block row of its columns. The result has one set
    /// per block row including the pseudo row, and empty pieces are dropped.
    pub fn split_by_block_row(&self, layout: &MatrixLayout) -> Vec<RayWeightSet> {
        let mut rows = vec![RayWeightSet::new(); layout.pseudo_row() + 1];
        for (phase, site, group) in self.groups() {
            for (source, vector) in group {
                let mut pieces: BTreeMap<usize, SparseRayVector> = BTreeMap::new();
                for (index, weight) in vector.iter() {
                    pieces
                        .entry(layout.block_of_column(index as usize))
                        .or_default()
                        .push(index, weight);
                }
                for (row, piece) in pieces {
                    rows[row].insert(phase.clone(), site, *source, piece);
                }
            }
        }
        rows
    }
}

// ========================================================================================
//                                  File codec
// ========================================================================================

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

pub fn write_ray_weight_file(path: &Path, set: &RayWeightSet) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(RAY_WEIGHT_MAGIC)?;
    writer.write_all(&(set.group_count() as u32).to_le_bytes())?;
    for (phase, site, group) in set.groups() {
        let name = phase.as_str().as_bytes();
        writer.write_all(&(name.len() as u16).to_le_bytes())?;
        writer.write_all(name)?;
        writer.write_all(&site.to_le_bytes())?;
        writer.write_all(&(group.len() as u32).to_le_bytes())?;
        for (source, vector) in group {
            writer.write_all(&source.to_le_bytes())?;
            writer.write_all(&(vector.len() as u32).to_le_bytes())?;
            for &index in vector.indices() {
                let stored = i32::try_from(index).map_err(|_| {
                    invalid_data(format!(
                        "Column {index} of source {source} does not fit the file's i32 indices."
                    ))
                })?;
                writer.write_all(&stored.to_le_bytes())?;
            }
            for weight in vector.weights() {
                writer.write_all(&weight.to_le_bytes())?;
            }
        }
    }
    writer.flush()
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

pub fn read_ray_weight_file(path: &Path) -> io::Result<RayWeightSet> {
    let mut reader = BufReader::new(File::open(path)?);
    if &read_array::<4, _>(&mut reader)? != RAY_WEIGHT_MAGIC {
        return Err(invalid_data(
            "Ray weight file has an unrecognized header.".to_string(),
        ));
    }
    let group_count = u32::from_le_bytes(read_array(&mut reader)?);
    let mut set = RayWeightSet::new();
    for _ in 0..group_count {
        let name_len = u16::from_le_bytes(read_array(&mut reader)?) as usize;
        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|e| invalid_data(e.to_string()))?;
        let phase = Phase::new(name).map_err(invalid_data)?;
        let site = i64::from_le_bytes(read_array(&mut reader)?);
        let record_count = u32::from_le_bytes(read_array(&mut reader)?);

        let mut group = RayGroup::new();
        for _ in 0..record_count {
            let source = i64::from_le_bytes(read_array(&mut reader)?);
            let len = u32::from_le_bytes(read_array(&mut reader)?) as usize;
            let mut indices = Vec::with_capacity(len);
            for _ in 0..len {
                let index = i32::from_le_bytes(read_array(&mut reader)?);
                let index = u32::try_from(index).map_err(|_| {
                    invalid_data(format!("Negative matrix column {index} in ray weight file."))
                })?;
                indices.push(index);
            }
            let mut weights = Vec::with_capacity(len);
            for _ in 0..len {
                weights.push(f64::from_le_bytes(read_array(&mut reader)?));
            }
            let vector = SparseRayVector::new(indices, weights).map_err(invalid_data)?;
            group.insert(source, vector);
        }
        set.insert_group(phase, site, group);
    }
    Ok(set)
}

// ========================================================================================
//                                   Store
// ========================================================================================

/// The directory holding every (set, block row) ray weight file.
#[derive(Debug, Clone)]
pub struct RayWeightStore {
    dir: PathBuf,
    policy: RetryPolicy,
}

impl RayWeightStore {
    pub fn new(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, set: RaySetId, block_row: usize) -> PathBuf {
        self.dir
            .join(format!("rayweights_set_{set}_blk_{block_row}.bin"))
    }

    pub fn read(
        &self,
        set: RaySetId,
        block_row: usize,
        trail: &mut WarningTrail,
    ) -> Result<RayWeightSet, IoFailure> {
        let path = self.path_for(set, block_row);
        read_with_retry(&path, &self.policy, trail, read_ray_weight_file)
    }

    pub fn write(
        &self,
        set: RaySetId,
        block_row: usize,
        data: &RayWeightSet,
        trail: &mut WarningTrail,
    ) -> Result<PathBuf, IoFailure> {
        let path = self.path_for(set, block_row);
        write_with_retry(&path, &self.policy, trail, |p| {
            write_ray_weight_file(p, data)
        })?;
        Ok(path)
    }

    /// Writes one file per block row, including the pseudo row and rows with
    /// no rays.
    pub fn write_split(
        &self,
        set: RaySetId,
        data: &RayWeightSet,
        layout: &MatrixLayout,
        trail: &mut WarningTrail,
    ) -> Result<usize, IoFailure> {
        let rows = data.split_by_block_row(layout);
        for (row, piece) in rows.iter().enumerate() {
            self.write(set, row, piece, trail)?;
        }
        Ok(rows.len())
    }
}

// ========================================================================================
//                                 Set partitioning
// ========================================================================================

/// Deals (phase, site) groups into numbered sets so that no set grows far past
/// the element limit. A set locks as soon as its element count exceeds the
/// limit, and the next group opens a new set.
#[derive(Debug, Clone)]
pub struct RaySetPartitioner {
    element_limit: usize,
}

impl RaySetPartitioner {
    pub fn new(element_limit: usize) -> Self {
        Self {
            element_limit: element_limit.max(1),
        }
    }

    pub fn partition(&self, all: &RayWeightSet) -> Vec<RayWeightSet> {
        let mut sets = Vec::new();
        let mut current = RayWeightSet::new();
        let mut current_elements = 0usize;
        for (phase, site, group) in all.groups() {
            if current_elements > self.element_limit {
                sets.push(std::mem::take(&mut current));
                current_elements = 0;
            }
            current_elements += group.values().map(|v| v.len()).sum::<usize>();
            current.insert_group(phase.clone(), site, group.clone());
        }
        if !current.is_empty() {
            sets.push(current);
        }
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn phase(name: &str) -> Phase {
        Phase::new(name).unwrap()
    }

    fn vector(indices: &[u32], weights: &[f64]) -> SparseRayVector {
        SparseRayVector::new(indices.to_vec(), weights.to_vec()).unwrap()
    }

    #[test]
    fn ray_weight_file_preserves_groups_and_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.bin");
        let mut set = RayWeightSet::new();
        set.insert(phase("Sn"), 7, 3, vector(&[4, 9], &[0.5, -1.25]));
        set.insert(phase("Pn"), 7, 1, vector(&[0], &[2.0]));
        set.insert(phase("Pn"), 2, 5, vector(&[], &[]));

        write_ray_weight_file(&path, &set).unwrap();
        let loaded = read_ray_weight_file(&path).unwrap();
        assert_eq!(loaded, set);
        let order: Vec<(String, SiteId)> = loaded
            .groups()
            .map(|(p, s, _)| (p.to_string(), s))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Pn".to_string(), 2),
                ("Pn".to_string(), 7),
                ("Sn".to_string(), 7)
            ]
        );
        assert_eq!(loaded.element_count(), 3);
        assert_eq!(loaded.ray_count(), 3);
    }

    #[test]
    fn column_beyond_i32_range_is_rejected_on_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.bin");
        let mut set = RayWeightSet::new();
        set.insert(phase("Pn"), 7, 3, vector(&[1, u32::MAX], &[1.0, 2.0]));

        let err = write_ray_weight_file(&path, &set).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains(&u32::MAX.to_string()));
    }

    #[test]
    fn split_routes_pseudo_columns_to_the_pseudo_row() {
        let layout = MatrixLayout::new(4, 2).unwrap();
        let mut set = RayWeightSet::new();
        set.insert(phase("Pg"), 1, 10, vector(&[0, 3, 4, 6], &[1.0, 2.0, 3.0, 4.0]));

        let rows = set.split_by_block_row(&layout);
        assert_eq!(rows.len(), 3);
        let p = phase("Pg");
        assert_eq!(rows[0].group(&p, 1).unwrap()[&10], vector(&[0], &[1.0]));
        assert_eq!(rows[1].group(&p, 1).unwrap()[&10], vector(&[3], &[2.0]));
        assert_eq!(rows[2].group(&p, 1).unwrap()[&10], vector(&[4, 6], &[3.0, 4.0]));
    }

    #[test]
    fn store_writes_every_block_row_even_when_empty() {
        let dir = tempdir().unwrap();
        let store = RayWeightStore::new(dir.path(), RetryPolicy::new(1, Duration::ZERO));
        let layout = MatrixLayout::new(4, 2).unwrap();
        let mut set = RayWeightSet::new();
        set.insert(phase("Pg"), 1, 10, vector(&[1], &[1.0]));

        let mut trail = WarningTrail::new();
        let written = store
            .write_split(RaySetId::Numbered(0), &set, &layout, &mut trail)
            .unwrap();
        assert_eq!(written, 3);
        for row in 0..3 {
            assert!(store.path_for(RaySetId::Numbered(0), row).exists());
        }
        assert!(store.read(RaySetId::Numbered(0), 1, &mut trail).unwrap().is_empty());
        assert_eq!(
            store
                .read(RaySetId::Numbered(0), 0, &mut trail)
                .unwrap()
                .ray_count(),
            1
        );
        assert!(
            store
                .path_for(RaySetId::Unpartitioned, 2)
                .ends_with("rayweights_set_ab_blk_2.bin")
        );
    }

    #[test]
    fn partitioner_locks_a_set_once_it_passes_the_limit() {
        let mut all = RayWeightSet::new();
        all.insert(phase("Pn"), 1, 1, vector(&[0, 1, 2], &[1.0, 1.0, 1.0]));
        all.insert(phase("Pn"), 2, 1, vector(&[0, 1], &[1.0, 1.0]));
        all.insert(phase("Pn"), 2, 2, vector(&[3], &[1.0]));
        all.insert(phase("Pn"), 3, 1, vector(&[0], &[1.0]));

        let sets = RaySetPartitioner::new(3).partition(&all);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].group_count(), 2);
        assert_eq!(sets[0].ray_count(), 3);
        assert_eq!(sets[1].group_count(), 1);
        let total: usize = sets.iter().map(|s| s.element_count()).sum();
        assert_eq!(total, all.element_count());
    }
}
