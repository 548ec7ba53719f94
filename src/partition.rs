//! Stacktraces, deduplicated per partition.
//!
//! A partition groups profiles that share a main binary, so stacktrace ids stay small and
//! tables can be resolved independently. Partitions are created on first use.

use crate::block::BlockFile;
use crate::dedup::{DedupHelper, DedupTable, IdConversionTable, Rewriter};
use crate::error::DbError;
use crate::types::Profile;
use rustc_hash::{FxHashMap, FxHasher};
use std::fs;
use std::hash::Hasher;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Leaf-first global location ids.
pub type Stacktrace = Arc<[u32]>;

pub const SYMBOLS_DIR: &str = "symbols";
const PARTITION_PREFIX: &str = "stacktraces-";
const PARTITION_SUFFIX: &str = ".bin";

pub struct StacktracesHelper;

impl DedupHelper for StacktracesHelper {
    type Value = Stacktrace;
    type Key = Stacktrace;

    fn key(value: &Stacktrace) -> Stacktrace {
        value.clone()
    }
    fn rewrite(_: &Rewriter, _: &mut Stacktrace) {}
    fn set_id(local_pos: usize, _: u32, _: &mut Stacktrace) -> u64 {
        local_pos as u64
    }
    fn size(value: &Stacktrace) -> u64 {
        value.len() as u64 * 4 + 16
    }
    fn add_to_rewriter(_: &mut Rewriter, _: IdConversionTable) {}
}

/// Partition key of a profile: a hash of its first mapping's build id, or of its filename
/// when the build id is empty. Profiles without mappings use partition 0.
pub fn partition_key(p: &Profile) -> u64 {
    let Some(m) = p.mappings.first() else {
        return 0;
    };
    let source = match p.string(m.build_id) {
        "" => p.string(m.filename),
        id => id,
    };
    if source.is_empty() {
        return 0;
    }
    let mut h = FxHasher::default();
    h.write(source.as_bytes());
    h.finish()
}

pub struct StacktracePartition {
    key: u64,
    stacktraces: DedupTable<StacktracesHelper>,
}

impl StacktracePartition {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn len(&self) -> Result<usize, DbError> {
        self.stacktraces.len()
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        self.stacktraces.is_empty()
    }
}

#[derive(Default)]
pub struct StacktracePartitions {
    partitions: RwLock<FxHashMap<u64, Arc<StacktracePartition>>>,
}

impl StacktracePartitions {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, key: u64) -> Result<Arc<StacktracePartition>, DbError> {
        if let Some(p) = self.partitions.read()?.get(&key) {
            return Ok(p.clone());
        }
        let mut partitions = self.partitions.write()?;
        let p = partitions.entry(key).or_insert_with(|| {
            Arc::new(StacktracePartition {
                key,
                stacktraces: DedupTable::new(),
            })
        });
        Ok(p.clone())
    }

    /// Looks up an existing partition without creating it.
    pub fn get(&self, key: u64) -> Result<Option<Arc<StacktracePartition>>, DbError> {
        Ok(self.partitions.read()?.get(&key).cloned())
    }

    /// Stores stacktraces in partition `key`, writing the id of `stacktraces[i]` to `dst[i]`.
    pub fn append_stacktraces(
        &self,
        key: u64,
        dst: &mut [u32],
        stacktraces: Vec<Stacktrace>,
    ) -> Result<(), DbError> {
        self.partition(key)?.stacktraces.append(dst, stacktraces)
    }

    /// Returns the location ids of each stacktrace id, in the order given.
    pub fn resolve_stacktrace_locations(
        &self,
        key: u64,
        ids: &[u32],
    ) -> Result<Vec<Stacktrace>, DbError> {
        let partition = self
            .get(key)?
            .ok_or_else(|| DbError::corruption(format!("unknown stacktrace partition {:016x}", key)))?;
        let view = partition.stacktraces.view()?;
        ids.iter()
            .map(|&id| {
                view.get(id).cloned().ok_or_else(|| {
                    DbError::corruption(format!(
                        "partition {:016x} has no stacktrace {}",
                        key, id
                    ))
                })
            })
            .collect()
    }

    pub fn keys(&self) -> Result<Vec<u64>, DbError> {
        let mut keys: Vec<u64> = self.partitions.read()?.keys().copied().collect();
        keys.sort_unstable();
        Ok(keys)
    }

    pub fn size(&self) -> Result<u64, DbError> {
        Ok(self
            .partitions
            .read()?
            .values()
            .map(|p| p.stacktraces.size())
            .sum())
    }

    pub fn total_stacktraces(&self) -> Result<u64, DbError> {
        let partitions = self.partitions.read()?;
        let mut n = 0u64;
        for p in partitions.values() {
            n += p.len()? as u64;
        }
        Ok(n)
    }

    /// Writes one file per partition under `dir/symbols/`.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<BlockFile>, DbError> {
        let sym_dir = dir.join(SYMBOLS_DIR);
        fs::create_dir_all(&sym_dir)?;
        let partitions: Vec<Arc<StacktracePartition>> =
            self.partitions.read()?.values().cloned().collect();

        let mut files = Vec::with_capacity(partitions.len());
        for p in partitions {
            let name = format!("{}{:016x}{}", PARTITION_PREFIX, p.key, PARTITION_SUFFIX);
            let size = p.stacktraces.write_to(&sym_dir.join(&name))?;
            files.push(BlockFile::table(
                &format!("{}/{}", SYMBOLS_DIR, name),
                size,
                p.len()?,
            ));
        }
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(files)
    }

    pub fn open(dir: &Path) -> Result<Self, DbError> {
        let sym_dir = dir.join(SYMBOLS_DIR);
        let mut partitions = FxHashMap::default();
        if sym_dir.exists() {
            for entry in fs::read_dir(&sym_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(hex) = name
                    .strip_prefix(PARTITION_PREFIX)
                    .and_then(|n| n.strip_suffix(PARTITION_SUFFIX))
                else {
                    continue;
                };
                let key = u64::from_str_radix(hex, 16).map_err(|e| {
                    DbError::corruption(format!("bad partition file name {:?}: {}", name, e))
                })?;
                let stacktraces = DedupTable::open(&entry.path())?;
                partitions.insert(key, Arc::new(StacktracePartition { key, stacktraces }));
            }
        }
        Ok(Self {
            partitions: RwLock::new(partitions),
        })
    }
}
