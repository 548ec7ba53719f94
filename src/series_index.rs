//! Series index: label postings plus, for each series, where its rows currently live.
//!
//! The inverted index is sharded by fingerprint prefix. Each shard holds
//! `label name -> label value -> sorted fingerprints`. Because a shard owns a contiguous
//! fingerprint range, concatenating per-shard results in shard order keeps them sorted.

use crate::encoding::{read_framed, write_framed_atomic};
use crate::error::DbError;
use crate::labels::{Fingerprint, LabelPair, Labels};
use crate::segment::RowRangeWithSeriesIndex;
use crate::selector::{matches_all, split_filters_and_matchers, MatchOp, Matcher};
use crate::types::{ProfileRow, Timestamp};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const DEFAULT_INDEX_SHARDS: u32 = 32;
const INDEX_MAGIC: &[u8; 8] = b"PDBIDX01";
const INDEX_VERSION: u32 = 1;

// --- Inverted index ----------------------------------------------------------------------

#[derive(Default)]
struct IndexShard {
    postings: FxHashMap<String, FxHashMap<String, Vec<Fingerprint>>>,
    all: Vec<Fingerprint>,
}

fn insert_sorted(v: &mut Vec<Fingerprint>, fp: Fingerprint) {
    if let Err(pos) = v.binary_search(&fp) {
        v.insert(pos, fp);
    }
}

pub(crate) fn intersect_sorted(a: &[Fingerprint], b: &[Fingerprint]) -> Vec<Fingerprint> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

pub(crate) fn subtract_sorted(a: &[Fingerprint], b: &[Fingerprint]) -> Vec<Fingerprint> {
    let mut out = Vec::with_capacity(a.len());
    let mut j = 0usize;
    for &x in a {
        while j < b.len() && b[j] < x {
            j += 1;
        }
        if j < b.len() && b[j] == x {
            continue;
        }
        out.push(x);
    }
    out
}

fn union_all<'a>(lists: impl Iterator<Item = &'a Vec<Fingerprint>>) -> Vec<Fingerprint> {
    let mut out: Vec<Fingerprint> = lists.flatten().copied().collect();
    out.sort_unstable();
    out.dedup();
    out
}

impl IndexShard {
    fn postings_for(&self, m: &Matcher) -> Vec<Fingerprint> {
        let Some(values) = self.postings.get(&m.name) else {
            return Vec::new();
        };
        match m.op {
            MatchOp::Equal => values.get(&m.value).cloned().unwrap_or_default(),
            MatchOp::Regex => match m.literal_set() {
                Some(set) => union_all(set.into_iter().filter_map(|v| values.get(v))),
                None => union_all(
                    values
                        .iter()
                        .filter(|(v, _)| m.matches(v))
                        .map(|(_, fps)| fps),
                ),
            },
            // Only reached for `!=`/`!~` forms that reject the empty value: every series
            // carrying the label, minus the ones whose value is excluded.
            MatchOp::NotEqual | MatchOp::NotRegex => {
                let with_label = union_all(values.values());
                let excluded = union_all(
                    values
                        .iter()
                        .filter(|(v, _)| !m.matches(v))
                        .map(|(_, fps)| fps),
                );
                subtract_sorted(&with_label, &excluded)
            }
        }
    }

    fn lookup(&self, matchers: &[Matcher]) -> Vec<Fingerprint> {
        let mut iter = matchers.iter();
        let Some(first) = iter.next() else {
            return self.all.clone();
        };
        let mut acc = self.postings_for(first);
        for m in iter {
            if acc.is_empty() {
                break;
            }
            acc = intersect_sorted(&acc, &self.postings_for(m));
        }
        acc
    }
}

pub struct InvertedIndex {
    shards: Vec<RwLock<IndexShard>>,
    bits: u32,
}

impl InvertedIndex {
    /// `total_shards` is rounded up to a power of two.
    pub fn new(total_shards: u32) -> Self {
        let n = total_shards.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| RwLock::new(IndexShard::default())).collect(),
            bits: n.trailing_zeros(),
        }
    }

    fn shard_of(&self, fp: Fingerprint) -> usize {
        if self.bits == 0 {
            0
        } else {
            (fp >> (64 - self.bits)) as usize
        }
    }

    pub fn add(&self, labels: &Labels, fp: Fingerprint) -> Result<(), DbError> {
        let mut shard = self.shards[self.shard_of(fp)].write()?;
        for p in labels.iter() {
            let fps = shard
                .postings
                .entry(p.name.clone())
                .or_default()
                .entry(p.value.clone())
                .or_default();
            insert_sorted(fps, fp);
        }
        insert_sorted(&mut shard.all, fp);
        Ok(())
    }

    /// Sorted fingerprints of series matching every matcher. Matchers that accept the empty
    /// value must be applied separately as filters.
    pub fn lookup(&self, matchers: &[Matcher]) -> Result<Vec<Fingerprint>, DbError> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read()?.lookup(matchers));
        }
        Ok(out)
    }

    pub fn label_names(&self) -> Result<Vec<String>, DbError> {
        let mut names = BTreeSet::new();
        for shard in &self.shards {
            names.extend(shard.read()?.postings.keys().cloned());
        }
        Ok(names.into_iter().collect())
    }

    pub fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        let mut values = BTreeSet::new();
        for shard in &self.shards {
            if let Some(v) = shard.read()?.postings.get(name) {
                values.extend(v.keys().cloned());
            }
        }
        Ok(values.into_iter().collect())
    }
}

/// Fingerprints matching `matchers`, filtered by the label sets `labels_of` returns.
fn matching_fingerprints<'a>(
    ix: &InvertedIndex,
    matchers: &[Matcher],
    labels_of: impl Fn(Fingerprint) -> Option<&'a Labels>,
) -> Result<Vec<Fingerprint>, DbError> {
    let (filters, index_matchers) = split_filters_and_matchers(matchers);
    let mut fps = ix.lookup(&index_matchers)?;
    if !filters.is_empty() {
        fps.retain(|fp| labels_of(*fp).map_or(false, |l| matches_all(&filters, l)));
    }
    Ok(fps)
}

fn collect_names<'a>(labels: impl Iterator<Item = &'a Labels>) -> Vec<String> {
    let mut names = BTreeSet::new();
    for l in labels {
        names.extend(l.iter().map(|p| p.name.clone()));
    }
    names.into_iter().collect()
}

fn collect_values<'a>(labels: impl Iterator<Item = &'a Labels>, name: &str) -> Vec<String> {
    let mut values = BTreeSet::new();
    for l in labels {
        if let Some(v) = l.get(name) {
            values.insert(v.to_string());
        }
    }
    values.into_iter().collect()
}

// --- Head series index -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub row_num: u64,
    pub length: u64,
}

/// Rows of one series inside one on-disk head row group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGroupRange {
    pub row_group: usize,
    pub range: RowRange,
}

struct SeriesEntry {
    labels: Arc<Labels>,
    min_time: Timestamp,
    max_time: Timestamp,
    /// In-memory rows, in ingest order.
    profiles: Vec<Arc<ProfileRow>>,
    on_disk: Vec<RowGroupRange>,
}

/// What a query sees of one series.
#[derive(Debug, Clone)]
pub struct SeriesSelection {
    pub labels: Arc<Labels>,
    pub fingerprint: Fingerprint,
    pub in_memory: Vec<Arc<ProfileRow>>,
    pub on_disk: Vec<RowGroupRange>,
}

/// Result of writing the index file.
#[derive(Debug, Default)]
pub struct IndexWriteResult {
    pub series_index: FxHashMap<Fingerprint, u32>,
    /// Per head row group, the series ranges sorted by row number.
    pub row_group_ranges: Vec<Vec<RowRangeWithSeriesIndex>>,
    pub num_series: u64,
    pub size_bytes: u64,
}

#[derive(Default)]
struct IndexInner {
    series: FxHashMap<Fingerprint, SeriesEntry>,
}

pub struct SeriesIndex {
    ix: InvertedIndex,
    inner: RwLock<IndexInner>,
    total_profiles: AtomicU64,
    total_series: AtomicU64,
}

impl Default for SeriesIndex {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_SHARDS)
    }
}

impl SeriesIndex {
    pub fn new(shards: u32) -> Self {
        Self {
            ix: InvertedIndex::new(shards),
            inner: RwLock::new(IndexInner::default()),
            total_profiles: AtomicU64::new(0),
            total_series: AtomicU64::new(0),
        }
    }

    pub fn total_profiles(&self) -> u64 {
        self.total_profiles.load(Ordering::Relaxed)
    }

    pub fn total_series(&self) -> u64 {
        self.total_series.load(Ordering::Relaxed)
    }

    /// Registers an in-memory row for the series `labels`.
    pub fn add(&self, row: Arc<ProfileRow>, labels: &Labels) -> Result<(), DbError> {
        let fp = row.series_fingerprint;
        let t = row.time_nanos;
        let mut inner = self.inner.write()?;
        match inner.series.get_mut(&fp) {
            Some(entry) => {
                entry.min_time = entry.min_time.min(t);
                entry.max_time = entry.max_time.max(t);
                entry.profiles.push(row);
            }
            None => {
                self.ix.add(labels, fp)?;
                inner.series.insert(
                    fp,
                    SeriesEntry {
                        labels: Arc::new(labels.clone()),
                        min_time: t,
                        max_time: t,
                        profiles: vec![row],
                        on_disk: Vec::new(),
                    },
                );
                self.total_series.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_profiles.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn labels_for(&self, fp: Fingerprint) -> Result<Option<Arc<Labels>>, DbError> {
        Ok(self.inner.read()?.series.get(&fp).map(|e| e.labels.clone()))
    }

    /// Per-series row ranges of a sorted batch about to become a row group. Fails if a
    /// series' rows are not contiguous.
    pub fn row_ranges(rows: &[Arc<ProfileRow>]) -> Result<Vec<(Fingerprint, RowRange)>, DbError> {
        let mut out: Vec<(Fingerprint, RowRange)> = Vec::new();
        let mut seen: FxHashMap<Fingerprint, ()> = FxHashMap::default();
        for (i, row) in rows.iter().enumerate() {
            let fp = row.series_fingerprint;
            match out.last_mut() {
                Some((last, range)) if *last == fp => range.length += 1,
                _ => {
                    if seen.insert(fp, ()).is_some() {
                        return Err(DbError::Corruption {
                            details: format!("rows of series {:016x} are not contiguous at row {}", fp, i),
                            block: None,
                            series: Some(fp),
                        });
                    }
                    out.push((
                        fp,
                        RowRange {
                            row_num: i as u64,
                            length: 1,
                        },
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Moves the first `range.length` in-memory rows of each series to row group
    /// `row_group`. The rows must be the oldest in-memory rows of their series.
    pub fn commit_row_group(
        &self,
        row_group: usize,
        ranges: &[(Fingerprint, RowRange)],
    ) -> Result<(), DbError> {
        let mut inner = self.inner.write()?;
        for (fp, range) in ranges {
            let held = inner.series.get(fp).map_or(0, |e| e.profiles.len() as u64);
            if held < range.length {
                return Err(DbError::Corruption {
                    details: format!(
                        "series {:016x} holds {} in-memory rows, row group {} takes {}",
                        fp, held, row_group, range.length
                    ),
                    block: None,
                    series: Some(*fp),
                });
            }
        }
        for (fp, range) in ranges {
            if let Some(entry) = inner.series.get_mut(fp) {
                entry.profiles.drain(..range.length as usize);
                entry.on_disk.push(RowGroupRange {
                    row_group,
                    range: *range,
                });
            }
        }
        Ok(())
    }

    /// Snapshot of matching series overlapping `[start, end]`. In-memory rows are kept only
    /// if `include_memory` and inside the range; on-disk ranges only for row groups
    /// accepted by `want_row_group`.
    pub fn select(
        &self,
        matchers: &[Matcher],
        start: Timestamp,
        end: Timestamp,
        include_memory: bool,
        want_row_group: impl Fn(usize) -> bool,
    ) -> Result<Vec<SeriesSelection>, DbError> {
        let inner = self.inner.read()?;
        let fps = matching_fingerprints(&self.ix, matchers, |fp| {
            inner.series.get(&fp).map(|e| &*e.labels)
        })?;

        let mut out = Vec::with_capacity(fps.len());
        for fp in fps {
            let Some(entry) = inner.series.get(&fp) else {
                continue;
            };
            if entry.max_time < start || entry.min_time > end {
                continue;
            }
            let in_memory: Vec<Arc<ProfileRow>> = if include_memory {
                entry
                    .profiles
                    .iter()
                    .filter(|r| r.time_nanos >= start && r.time_nanos <= end)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            let on_disk: Vec<RowGroupRange> = entry
                .on_disk
                .iter()
                .filter(|r| want_row_group(r.row_group))
                .copied()
                .collect();
            if in_memory.is_empty() && on_disk.is_empty() {
                continue;
            }
            out.push(SeriesSelection {
                labels: entry.labels.clone(),
                fingerprint: fp,
                in_memory,
                on_disk,
            });
        }
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(out)
    }

    pub fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        if matchers.is_empty() {
            return self.ix.label_names();
        }
        let inner = self.inner.read()?;
        let fps = matching_fingerprints(&self.ix, matchers, |fp| {
            inner.series.get(&fp).map(|e| &*e.labels)
        })?;
        Ok(collect_names(
            fps.iter()
                .filter_map(|fp| inner.series.get(fp).map(|e| &*e.labels)),
        ))
    }

    pub fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        if matchers.is_empty() {
            return self.ix.label_values(name);
        }
        let inner = self.inner.read()?;
        let fps = matching_fingerprints(&self.ix, matchers, |fp| {
            inner.series.get(&fp).map(|e| &*e.labels)
        })?;
        Ok(collect_values(
            fps.iter()
                .filter_map(|fp| inner.series.get(fp).map(|e| &*e.labels)),
            name,
        ))
    }

    /// Label sets of matching series, sorted.
    pub fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError> {
        let inner = self.inner.read()?;
        let fps = matching_fingerprints(&self.ix, matchers, |fp| {
            inner.series.get(&fp).map(|e| &*e.labels)
        })?;
        let mut out: Vec<Labels> = fps
            .iter()
            .filter_map(|fp| inner.series.get(fp).map(|e| (*e.labels).clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    /// Writes the index file: sorted symbols, then every series (sorted by labels) with its
    /// time bounds and series index.
    pub fn write_to(&self, path: &Path, num_row_groups: usize) -> Result<IndexWriteResult, DbError> {
        let inner = self.inner.read()?;
        let mut entries: Vec<(&Fingerprint, &SeriesEntry)> = inner.series.iter().collect();
        entries.sort_by(|a, b| a.1.labels.cmp(&b.1.labels));

        let mut symbols = BTreeSet::new();
        for (_, e) in &entries {
            for p in e.labels.iter() {
                symbols.insert(p.name.as_str());
                symbols.insert(p.value.as_str());
            }
        }
        let symbols: Vec<&str> = symbols.into_iter().collect();
        let sym_id = |s: &str| -> u32 { symbols.binary_search(&s).map_or(0, |i| i as u32) };

        let mut result = IndexWriteResult {
            row_group_ranges: vec![Vec::new(); num_row_groups],
            num_series: entries.len() as u64,
            ..Default::default()
        };
        let mut series = Vec::with_capacity(entries.len());
        for (i, (fp, e)) in entries.iter().enumerate() {
            let idx = i as u32;
            result.series_index.insert(**fp, idx);
            for r in &e.on_disk {
                if let Some(ranges) = result.row_group_ranges.get_mut(r.row_group) {
                    ranges.push(RowRangeWithSeriesIndex {
                        row_num: r.range.row_num,
                        length: r.range.length,
                        series_index: idx,
                    });
                }
            }
            series.push(IndexSeries {
                labels: e
                    .labels
                    .iter()
                    .map(|p| (sym_id(&p.name), sym_id(&p.value)))
                    .collect(),
                fingerprint: **fp,
                chunk: ChunkMeta {
                    min_time: e.min_time,
                    max_time: e.max_time,
                    series_index: idx,
                },
            });
        }
        for ranges in result.row_group_ranges.iter_mut() {
            ranges.sort_by_key(|r| r.row_num);
        }

        let file = IndexFile {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            series,
        };
        result.size_bytes = write_framed_atomic(path, INDEX_MAGIC, INDEX_VERSION, &file)?;
        Ok(result)
    }
}

// --- Persisted index ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkMeta {
    min_time: Timestamp,
    max_time: Timestamp,
    series_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexSeries {
    labels: Vec<(u32, u32)>,
    fingerprint: Fingerprint,
    chunk: ChunkMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    symbols: Vec<String>,
    series: Vec<IndexSeries>,
}

/// A series read back from an index file.
#[derive(Debug, Clone)]
pub struct IndexedSeries {
    pub labels: Arc<Labels>,
    pub fingerprint: Fingerprint,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

/// Read side of a flushed index file.
pub struct IndexReader {
    /// Indexed by series index.
    series: Vec<IndexedSeries>,
    by_fp: FxHashMap<Fingerprint, u32>,
    ix: InvertedIndex,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let file: IndexFile = read_framed(path, INDEX_MAGIC, INDEX_VERSION)?;
        let symbol = |id: u32| -> Result<String, DbError> {
            file.symbols
                .get(id as usize)
                .cloned()
                .ok_or_else(|| DbError::corruption(format!("index symbol {} out of range", id)))
        };

        let ix = InvertedIndex::new(DEFAULT_INDEX_SHARDS);
        let mut series = vec![None; file.series.len()];
        let mut by_fp = FxHashMap::default();
        for s in &file.series {
            let pairs = s
                .labels
                .iter()
                .map(|(n, v)| Ok(LabelPair::new(symbol(*n)?, symbol(*v)?)))
                .collect::<Result<Vec<_>, DbError>>()?;
            let labels = Labels::new(pairs);
            let idx = s.chunk.series_index as usize;
            if idx >= series.len() || series[idx].is_some() {
                return Err(DbError::corruption(format!("bad series index {} in {:?}", idx, path)));
            }
            ix.add(&labels, s.fingerprint)?;
            by_fp.insert(s.fingerprint, s.chunk.series_index);
            series[idx] = Some(IndexedSeries {
                labels: Arc::new(labels),
                fingerprint: s.fingerprint,
                min_time: s.chunk.min_time,
                max_time: s.chunk.max_time,
            });
        }
        let series = series
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| DbError::corruption(format!("missing series in {:?}", path)))?;
        Ok(Self { series, by_fp, ix })
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn series_at(&self, series_index: u32) -> Option<&IndexedSeries> {
        self.series.get(series_index as usize)
    }

    fn labels_of(&self, fp: Fingerprint) -> Option<&Labels> {
        self.by_fp
            .get(&fp)
            .and_then(|i| self.series.get(*i as usize))
            .map(|s| &*s.labels)
    }

    /// Sorted series indexes of matching series overlapping `[start, end]`.
    pub fn select(&self, matchers: &[Matcher], start: Timestamp, end: Timestamp) -> Result<Vec<u32>, DbError> {
        let fps = matching_fingerprints(&self.ix, matchers, |fp| self.labels_of(fp))?;
        let mut out: Vec<u32> = fps
            .iter()
            .filter_map(|fp| self.by_fp.get(fp).copied())
            .filter(|i| {
                let s = &self.series[*i as usize];
                s.max_time >= start && s.min_time <= end
            })
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    pub fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        if matchers.is_empty() {
            return self.ix.label_names();
        }
        let fps = matching_fingerprints(&self.ix, matchers, |fp| self.labels_of(fp))?;
        Ok(collect_names(fps.iter().filter_map(|fp| self.labels_of(*fp))))
    }

    pub fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        if matchers.is_empty() {
            return self.ix.label_values(name);
        }
        let fps = matching_fingerprints(&self.ix, matchers, |fp| self.labels_of(fp))?;
        Ok(collect_values(fps.iter().filter_map(|fp| self.labels_of(*fp)), name))
    }

    pub fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError> {
        let fps = matching_fingerprints(&self.ix, matchers, |fp| self.labels_of(fp))?;
        let mut out: Vec<Labels> = fps
            .iter()
            .filter_map(|fp| self.labels_of(*fp).cloned())
            .collect();
        out.sort();
        Ok(out)
    }
}
