//! Flushed blocks: the metadata descriptor and the read-only block opened for queries.
//!
//! Block layout:
//!
//! ```text
//! <block>/meta.json              block descriptor (serde_json)
//! <block>/index.bin              series index: symbols, series, time bounds
//! <block>/profiles.seg           profile rows, sorted by (series index, time)
//! <block>/strings.bin ...        one file per symbol table
//! <block>/symbols/stacktraces-<partition>.bin
//! ```

use crate::encoding::{sync_parent_dir, tmp_path_for};
use crate::error::DbError;
use crate::partition::StacktracePartitions;
use crate::profile_store::{SeriesRows, INDEX_FILE, PROFILES_FILE};
use crate::segment::SegmentReader;
use crate::selector::Matcher;
use crate::series_index::IndexReader;
use crate::symbols::SymbolTables;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const META_FILE: &str = "meta.json";
pub const META_VERSION: u32 = 1;

/// One file of a block, relative to the block directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFile {
    pub rel_path: String,
    pub size_bytes: u64,
    /// Elements of a table file, rows of the profiles file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_row_groups: Option<u64>,
}

impl BlockFile {
    pub fn table(rel_path: &str, size_bytes: u64, len: usize) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            size_bytes,
            num_rows: Some(len as u64),
            num_row_groups: None,
        }
    }

    pub fn rows(rel_path: &str, size_bytes: u64, num_rows: u64, num_row_groups: u64) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            size_bytes,
            num_rows: Some(num_rows),
            num_row_groups: Some(num_row_groups),
        }
    }

    pub fn plain(rel_path: &str, size_bytes: u64) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            size_bytes,
            num_rows: None,
            num_row_groups: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub num_series: u64,
    pub num_profiles: u64,
    pub num_samples: u64,
}

/// Block descriptor persisted as `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub version: u32,
    pub id: uuid::Uuid,
    /// Inclusive bounds in nanoseconds.
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub stats: BlockStats,
    pub files: Vec<BlockFile>,
}

impl BlockMeta {
    pub fn new(id: uuid::Uuid) -> Self {
        Self {
            version: META_VERSION,
            id,
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
            stats: BlockStats::default(),
            files: Vec::new(),
        }
    }

    pub fn file(&self, rel_path: &str) -> Option<&BlockFile> {
        self.files.iter().find(|f| f.rel_path == rel_path)
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.min_time <= end && self.max_time >= start
    }

    /// Writes `dir/meta.json` atomically. Returns the file size.
    pub fn write_to(&self, dir: &Path) -> Result<u64, DbError> {
        let path = dir.join(META_FILE);
        let tmp = tmp_path_for(&path);
        let bytes = serde_json::to_vec_pretty(self)?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        sync_parent_dir(&path)?;
        Ok(bytes.len() as u64)
    }

    pub fn read_from(dir: &Path) -> Result<Self, DbError> {
        let bytes = fs::read(dir.join(META_FILE))?;
        let meta: BlockMeta = serde_json::from_slice(&bytes)?;
        if meta.version != META_VERSION {
            return Err(DbError::Corruption {
                details: format!("unsupported block meta version {}", meta.version),
                block: Some(meta.id.to_string()),
                series: None,
            });
        }
        Ok(meta)
    }
}

/// A flushed, immutable block opened for reading.
pub struct Block {
    meta: BlockMeta,
    path: PathBuf,
    symbols: SymbolTables,
    partitions: StacktracePartitions,
    index: IndexReader,
    profiles: SegmentReader,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.meta.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Block {
    pub fn open(path: &Path) -> Result<Arc<Self>, DbError> {
        let meta = BlockMeta::read_from(path)?;
        let with_block = |e: DbError| match e {
            DbError::Corruption { details, series, .. } => DbError::Corruption {
                details,
                block: Some(meta.id.to_string()),
                series,
            },
            other => other,
        };
        let symbols = SymbolTables::open(path).map_err(with_block)?;
        let partitions = StacktracePartitions::open(path).map_err(with_block)?;
        let index = IndexReader::open(&path.join(INDEX_FILE)).map_err(with_block)?;
        let profiles = SegmentReader::open(&path.join(PROFILES_FILE)).map_err(with_block)?;
        Ok(Arc::new(Self {
            meta,
            path: path.to_path_buf(),
            symbols,
            partitions,
            index,
            profiles,
        }))
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbols(&self) -> &SymbolTables {
        &self.symbols
    }

    pub fn partitions(&self) -> &StacktracePartitions {
        &self.partitions
    }

    pub fn index(&self) -> &IndexReader {
        &self.index
    }

    /// Rows of matching series inside `[start, end]`, by series in label order.
    /// Row groups are skipped by time bounds and by the series they hold.
    pub fn select_rows(
        &self,
        matchers: &[Matcher],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<SeriesRows>, DbError> {
        if !self.meta.overlaps(start, end) {
            return Ok(Vec::new());
        }
        let selected = self.index.select(matchers, start, end)?;
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_series: BTreeMap<u32, Vec<Arc<crate::types::ProfileRow>>> = BTreeMap::new();
        for (i, group) in self.profiles.row_groups().iter().enumerate() {
            if group.max_time < start || group.min_time > end {
                continue;
            }
            let wanted: Vec<_> = group
                .series
                .iter()
                .filter(|r| selected.binary_search(&r.series_index).is_ok())
                .collect();
            if wanted.is_empty() {
                continue;
            }
            let rows = self.profiles.read_row_group(i)?;
            for r in wanted {
                let from = r.row_num as usize;
                let to = from + r.length as usize;
                let range = rows.get(from..to).ok_or_else(|| DbError::Corruption {
                    details: format!("series range {}..{} outside row group {}", from, to, i),
                    block: Some(self.meta.id.to_string()),
                    series: None,
                })?;
                by_series.entry(r.series_index).or_default().extend(
                    range
                        .iter()
                        .filter(|p| p.time_nanos >= start && p.time_nanos <= end)
                        .cloned()
                        .map(Arc::new),
                );
            }
        }

        let mut out = Vec::with_capacity(by_series.len());
        for (idx, rows) in by_series {
            if rows.is_empty() {
                continue;
            }
            let series = self.index.series_at(idx).ok_or_else(|| DbError::Corruption {
                details: format!("row references missing series {}", idx),
                block: Some(self.meta.id.to_string()),
                series: None,
            })?;
            out.push(SeriesRows {
                labels: series.labels.clone(),
                fingerprint: series.fingerprint,
                rows,
            });
        }
        Ok(out)
    }
}
