// ========================================================================================
//
//                       THE COVARIANCE BLOCK STORE
//
// ========================================================================================
//
// The model covariance matrix is symmetric and far too large for one node, so only its
// lower-triangular blocks are stored, each as a dense `block_size x block_size` file
// spread over several storage roots. This module owns the on-disk block format, the
// deterministic placement of blocks on storage roots, and the process-wide cache that
// lets many tasks share one loaded block.
//
// ### Block file format ###
//
//   magic  : 4 bytes, "RVCB"
//   size   : u32 little-endian, the block edge length
//   values : size * size f64 little-endian, row-major
//
// A partially filled trailing block is padded with zeros to the full edge length.

use crate::retry::{IoFailure, RetryPolicy, WarningTrail, read_with_retry};
use crate::types::{BlockKey, MatrixLayout};
use dashmap::DashMap;
use memmap2::Mmap;
use ndarray::{Array2, ArrayView2};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const BLOCK_MAGIC: &[u8; 4] = b"RVCB";
const BLOCK_HEADER_LEN: usize = 8;
const BLOCK_FILE_STEM: &str = "ginv";

#[derive(Debug, Clone, Error)]
pub enum BlockError {
    #[error(transparent)]
    Io(#[from] IoFailure),
    #[error("Block file '{}' has edge length {found}, but the layout expects {expected}.", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("Block {key} is outside the stored lower triangle of a {num_blocks}-block matrix.")]
    NotStored { key: BlockKey, num_blocks: usize },
    #[error("No block storage roots were configured.")]
    NoServers,
}

// ========================================================================================
//                                  Block file codec
// ========================================================================================

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Writes one dense block. The array must be square.
pub fn write_block_file(path: &Path, block: &Array2<f64>) -> io::Result<()> {
    let (rows, cols) = block.dim();
    if rows != cols {
        return Err(invalid_data(format!(
            "Covariance blocks must be square, got {rows}x{cols}."
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(BLOCK_MAGIC)?;
    writer.write_all(&(rows as u32).to_le_bytes())?;
    for value in block.iter() {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()
}

/// Memory-maps a block file and copies it into an owned array.
pub fn read_block_file(path: &Path) -> io::Result<Array2<f64>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len < BLOCK_HEADER_LEN {
        return Err(invalid_data(format!(
            "Block file is {len} bytes, shorter than its header."
        )));
    }
    // The file is opened read-only and never mutated while mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    if &mmap[0..4] != BLOCK_MAGIC {
        return Err(invalid_data("Block file has an unrecognized header.".to_string()));
    }
    let size = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]) as usize;
    let expected_len = BLOCK_HEADER_LEN + size * size * 8;
    if len != expected_len {
        return Err(invalid_data(format!(
            "Block file of edge {size} should be {expected_len} bytes but is {len}."
        )));
    }
    let values: Vec<f64> = mmap[BLOCK_HEADER_LEN..]
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect();
    Array2::from_shape_vec((size, size), values).map_err(|e| invalid_data(e.to_string()))
}

// ========================================================================================
//                                 Storage placement
// ========================================================================================

/// The ordered set of storage roots blocks are spread over. Placement is a pure
/// function of the block coordinates, so any process can locate any block.
#[derive(Debug, Clone)]
pub struct BlockServers {
    roots: Vec<PathBuf>,
}

impl BlockServers {
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, BlockError> {
        if roots.is_empty() {
            return Err(BlockError::NoServers);
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Blocks are numbered in lower-triangular row order and dealt round-robin
    /// across the roots.
    pub fn path_for(&self, key: BlockKey) -> PathBuf {
        let linear = key.row * (key.row + 1) / 2 + key.col;
        let root = &self.roots[linear % self.roots.len()];
        root.join(format!("{BLOCK_FILE_STEM}_{}_{}.blk", key.row, key.col))
    }
}

// ========================================================================================
//                                    Block cache
// ========================================================================================

struct CacheSlot {
    block: Mutex<Option<Arc<Array2<f64>>>>,
    readers: AtomicUsize,
}

/// Counts one active reader of a slot for as long as it lives.
struct ReaderToken {
    slot: Arc<CacheSlot>,
}

impl ReaderToken {
    fn new(slot: Arc<CacheSlot>) -> Self {
        slot.readers.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }
}

impl Drop for ReaderToken {
    fn drop(&mut self) {
        self.slot.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A shared read handle on one cached block. The block cannot be evicted while
/// any guard on it is alive.
pub struct BlockGuard {
    key: BlockKey,
    data: Arc<Array2<f64>>,
    token: ReaderToken,
}

impl BlockGuard {
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// Covariance at block-local coordinates.
    #[inline]
    pub fn value(&self, local_row: usize, local_col: usize) -> Option<f64> {
        self.data.get((local_row, local_col)).copied()
    }

    pub fn edge(&self) -> usize {
        self.data.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Active readers on this block, this guard included.
    pub fn readers(&self) -> usize {
        self.token.slot.readers.load(Ordering::Acquire)
    }
}

/// Process-wide cache of loaded blocks, shared by every task on a node.
#[derive(Default)]
pub struct BlockCache {
    slots: DashMap<BlockKey, Arc<CacheSlot>>,
    loads: AtomicU64,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a guard on `key`, running `load` only if the block is not cached.
    /// The boolean is true when this call performed the load.
    pub fn acquire<E, F>(&self, key: BlockKey, load: F) -> Result<(BlockGuard, bool), E>
    where
        F: FnOnce() -> Result<Array2<f64>, E>,
    {
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CacheSlot {
                    block: Mutex::new(None),
                    readers: AtomicUsize::new(0),
                })
            })
            .clone();
        let token = ReaderToken::new(slot);

        let mut cell = token
            .slot
            .block
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (data, loaded) = match cell.as_ref() {
            Some(data) => (Arc::clone(data), false),
            None => {
                let data = Arc::new(load()?);
                *cell = Some(Arc::clone(&data));
                self.loads.fetch_add(1, Ordering::Relaxed);
                (data, true)
            }
        };
        drop(cell);

        Ok((BlockGuard { key, data, token }, loaded))
    }

    /// Drops every cached block that has no active reader. Returns how many
    /// blocks were evicted.
    ///
    /// A slot is also kept while any handle other than the map's own is alive.
    /// `acquire` clones the slot under the shard lock before it registers as a
    /// reader, so that clone pins the slot across the gap.
    pub fn evict_idle(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.readers.load(Ordering::Acquire) > 0
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total number of block loads performed since creation.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

// ========================================================================================
//                                    Block store
// ========================================================================================

/// Read access to the stored lower-triangular blocks through the shared cache
/// and the retry policy.
pub struct CovarianceBlockStore {
    layout: MatrixLayout,
    servers: BlockServers,
    policy: RetryPolicy,
    cache: BlockCache,
}

impl CovarianceBlockStore {
    pub fn new(layout: MatrixLayout, servers: BlockServers, policy: RetryPolicy) -> Self {
        Self {
            layout,
            servers,
            policy,
            cache: BlockCache::new(),
        }
    }

    pub fn layout(&self) -> &MatrixLayout {
        &self.layout
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn path_for(&self, key: BlockKey) -> PathBuf {
        self.servers.path_for(key)
    }

    /// Acquires a read guard on the block, loading it through the retry policy
    /// on a cache miss. The boolean reports whether a load happened.
    pub fn acquire(
        &self,
        key: BlockKey,
        trail: &mut WarningTrail,
    ) -> Result<(BlockGuard, bool), BlockError> {
        let num_blocks = self.layout.num_blocks();
        if key.row >= num_blocks || key.col > key.row {
            return Err(BlockError::NotStored { key, num_blocks });
        }
        let path = self.servers.path_for(key);
        let expected = self.layout.block_size;
        self.cache.acquire(key, || {
            let block = read_with_retry(&path, &self.policy, trail, read_block_file)?;
            if block.nrows() != expected {
                return Err(BlockError::SizeMismatch {
                    path: path.clone(),
                    expected,
                    found: block.nrows(),
                });
            }
            Ok(block)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::time::Duration;
    use tempfile::tempdir;

    fn store_with(dir: &Path, layout: MatrixLayout) -> CovarianceBlockStore {
        let servers = BlockServers::new(vec![dir.join("a"), dir.join("b")]).unwrap();
        CovarianceBlockStore::new(layout, servers, RetryPolicy::new(2, Duration::ZERO))
    }

    #[test]
    fn block_file_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block.blk");
        let block = array![[4.0, 1.0], [1.0, 3.0]];
        write_block_file(&path, &block).unwrap();
        assert_eq!(read_block_file(&path).unwrap(), block);
    }

    #[test]
    fn truncated_block_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block.blk");
        write_block_file(&path, &array![[4.0, 1.0], [1.0, 3.0]]).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
        let err = read_block_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn placement_is_deterministic_across_roots() {
        let servers =
            BlockServers::new(vec![PathBuf::from("/r0"), PathBuf::from("/r1")]).unwrap();
        assert!(servers.path_for(BlockKey::new(0, 0)).starts_with("/r0"));
        assert!(servers.path_for(BlockKey::new(1, 0)).starts_with("/r1"));
        assert!(servers.path_for(BlockKey::new(1, 1)).starts_with("/r0"));
        assert!(servers.path_for(BlockKey::new(2, 0)).starts_with("/r1"));
        assert_eq!(
            servers.path_for(BlockKey::new(2, 1)),
            PathBuf::from("/r0/ginv_2_1.blk")
        );
        assert!(BlockServers::new(Vec::new()).is_err());
    }

    #[test]
    fn cached_block_is_loaded_once_and_evicted_when_idle() {
        let dir = tempdir().unwrap();
        let layout = MatrixLayout::new(4, 2).unwrap();
        let store = store_with(dir.path(), layout);
        let key = BlockKey::new(1, 0);
        write_block_file(&store.path_for(key), &array![[0.5, 0.0], [0.25, 0.0]]).unwrap();

        let mut trail = WarningTrail::new();
        let (first, loaded_first) = store.acquire(key, &mut trail).unwrap();
        let (second, loaded_second) = store.acquire(key, &mut trail).unwrap();
        assert!(loaded_first);
        assert!(!loaded_second);
        assert_eq!(first.readers(), 2);
        assert_eq!(second.value(1, 0), Some(0.25));
        assert_eq!(store.cache().loads(), 1);

        assert_eq!(store.cache().evict_idle(), 0);
        drop(first);
        drop(second);
        assert_eq!(store.cache().evict_idle(), 1);
        assert!(store.cache().is_empty());
        assert!(trail.is_empty());
    }

    #[test]
    fn slot_claimed_before_its_reader_registers_survives_eviction() {
        let cache = BlockCache::new();
        let key = BlockKey::new(0, 0);
        let (guard, loaded) = cache
            .acquire(key, || Ok::<_, BlockError>(array![[1.0, 0.0], [0.5, 2.0]]))
            .unwrap();
        assert!(loaded);
        drop(guard);

        // A concurrent acquire that has cloned the slot but not yet counted itself.
        let claimed = cache.slots.get(&key).map(|slot| Arc::clone(slot.value())).unwrap();
        assert_eq!(claimed.readers.load(Ordering::Acquire), 0);
        assert_eq!(cache.evict_idle(), 0);

        let (guard, loaded) = cache
            .acquire(key, || -> Result<Array2<f64>, BlockError> {
                panic!("resident block was reloaded")
            })
            .unwrap();
        assert!(!loaded);
        assert_eq!(guard.value(1, 0), Some(0.5));
        assert_eq!(cache.loads(), 1);

        drop(guard);
        drop(claimed);
        assert_eq!(cache.evict_idle(), 1);
    }

    #[test]
    fn failed_load_releases_its_reader() {
        let dir = tempdir().unwrap();
        let layout = MatrixLayout::new(4, 2).unwrap();
        let store = store_with(dir.path(), layout);
        let mut trail = WarningTrail::new();

        let err = store.acquire(BlockKey::new(0, 0), &mut trail).err().unwrap();
        assert!(matches!(err, BlockError::Io(ref failure) if failure.attempts == 2));
        assert_eq!(trail.len(), 2);
        assert_eq!(store.cache().evict_idle(), 1);
    }

    #[test]
    fn mismatched_edge_and_upper_triangle_are_structural_errors() {
        let dir = tempdir().unwrap();
        let layout = MatrixLayout::new(4, 2).unwrap();
        let store = store_with(dir.path(), layout);
        let key = BlockKey::new(0, 0);
        write_block_file(&store.path_for(key), &Array2::zeros((3, 3))).unwrap();

        let mut trail = WarningTrail::new();
        assert!(matches!(
            store.acquire(key, &mut trail).err().unwrap(),
            BlockError::SizeMismatch { expected: 2, found: 3, .. }
        ));
        assert!(matches!(
            store.acquire(BlockKey::new(0, 1), &mut trail).err().unwrap(),
            BlockError::NotStored { .. }
        ));
        assert!(matches!(
            store.acquire(BlockKey::new(2, 2), &mut trail).err().unwrap(),
            BlockError::NotStored { .. }
        ));
    }
}
