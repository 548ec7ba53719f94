//! Profile row store: the in-memory row buffer of a head and the row groups cut from it.
//!
//! Rows are appended to an in-memory slice. When the slice exceeds its row or byte budget,
//! the current length is handed to a dedicated cutter thread through a one-slot channel.
//! The cutter sorts the oldest rows, writes them as one row-group file and then, in a
//! single critical section, commits the series ranges to the index, publishes the new row
//! group and drops the rows from the slice.
//!
//! Lock order: `rows` before `index` before `slice` for readers and the cutter; ingest
//! takes `slice` then `index` and never touches `rows`.

use crate::error::DbError;
use crate::labels::{Fingerprint, Labels};
use crate::merge::merge_sorted;
use crate::segment::{series_for_row, series_ranges, SegmentReader, SegmentWriter};
use crate::selector::Matcher;
use crate::series_index::{IndexWriteResult, SeriesIndex};
use crate::telemetry::{db_metrics, DbEvent, DbEventListener};
use crate::types::{ProfileRow, Timestamp};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub const PROFILES_FILE: &str = "profiles.seg";
pub const INDEX_FILE: &str = "index.bin";

/// Row store thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileStoreConfig {
    /// Cut a row group once this many rows are buffered.
    pub max_buffer_row_count: usize,
    /// Cut a row group once buffered rows reach this many bytes.
    pub max_row_group_bytes: u64,
    /// Row group size of the final profiles file.
    pub max_rows_per_flushed_row_group: usize,
}

impl Default for ProfileStoreConfig {
    fn default() -> Self {
        Self {
            max_buffer_row_count: 100_000,
            max_row_group_bytes: 128 << 20,
            max_rows_per_flushed_row_group: 10_000,
        }
    }
}

/// One row group cut to disk. Generation `n` is the n-th cut of the head.
#[derive(Debug)]
pub struct RowGroupOnDisk {
    pub generation: usize,
    pub path: PathBuf,
    reader: SegmentReader,
    num_rows: u64,
}

impl RowGroupOnDisk {
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// All rows of this generation, in the order they were written.
    pub fn read_rows(&self) -> Result<Vec<ProfileRow>, DbError> {
        let mut out = Vec::with_capacity(self.num_rows as usize);
        for i in 0..self.reader.row_groups().len() {
            out.extend(self.reader.read_row_group(i)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct RowGroups {
    /// Rows moved out of the in-memory slice so far.
    rows_flushed: u64,
    groups: Vec<Arc<RowGroupOnDisk>>,
}

/// Rows of one series, sorted by time.
#[derive(Debug, Clone)]
pub struct SeriesRows {
    pub labels: Arc<Labels>,
    pub fingerprint: Fingerprint,
    pub rows: Vec<Arc<ProfileRow>>,
}

/// What the final flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFlushStats {
    pub num_rows: u64,
    pub num_row_groups: u64,
    pub num_series: u64,
    pub num_samples: u64,
    pub profiles_size: u64,
    pub index_size: u64,
}

struct StoreShared {
    head: String,
    dir: PathBuf,
    cfg: ProfileStoreConfig,
    index: Arc<SeriesIndex>,
    slice: Mutex<Vec<Arc<ProfileRow>>>,
    /// Bytes currently in the slice.
    size: AtomicU64,
    /// Bytes ever ingested.
    total_size: AtomicU64,
    rows: RwLock<RowGroups>,
    cutting: AtomicBool,
    events: Arc<dyn DbEventListener>,
}

pub struct ProfileStore {
    shared: Arc<StoreShared>,
    cut_tx: Mutex<Option<SyncSender<usize>>>,
    cutter: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("head", &self.shared.head)
            .field("dir", &self.shared.dir)
            .finish()
    }
}

impl ProfileStore {
    /// Creates the store under `dir` and starts its cutter thread.
    pub fn new(
        head: &str,
        dir: &Path,
        cfg: ProfileStoreConfig,
        index: Arc<SeriesIndex>,
        events: Arc<dyn DbEventListener>,
    ) -> Result<Self, DbError> {
        fs::create_dir_all(dir)?;
        let shared = Arc::new(StoreShared {
            head: head.to_string(),
            dir: dir.to_path_buf(),
            cfg,
            index,
            slice: Mutex::new(Vec::new()),
            size: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            rows: RwLock::new(RowGroups::default()),
            cutting: AtomicBool::new(false),
            events,
        });

        let (tx, rx) = mpsc::sync_channel::<usize>(1);
        let worker = shared.clone();
        let cutter = thread::Builder::new()
            .name(format!("profiledb-cutter-{}", head))
            .spawn(move || {
                // ends once the sender is dropped
                for n in rx {
                    if let Err(e) = worker.cut_row_group(n) {
                        worker.events.on_event(DbEvent::RowGroupCutFailed {
                            head: worker.head.clone(),
                            error: e.to_string(),
                        });
                    }
                    worker.cutting.store(false, Ordering::Release);
                }
            })?;

        Ok(Self {
            shared,
            cut_tx: Mutex::new(Some(tx)),
            cutter: Mutex::new(Some(cutter)),
        })
    }

    /// Appends a row of series `labels`. May hand the buffered rows to the cutter.
    pub fn ingest(&self, row: Arc<ProfileRow>, labels: &Labels) -> Result<(), DbError> {
        let shared = &self.shared;
        let row_size = row.size_bytes();
        let handoff = {
            let mut slice = shared.slice.lock()?;
            shared.index.add(row.clone(), labels)?;
            slice.push(row);
            let size = shared.size.fetch_add(row_size, Ordering::AcqRel) + row_size;
            shared.total_size.fetch_add(row_size, Ordering::Relaxed);
            let full = slice.len() >= shared.cfg.max_buffer_row_count
                || size >= shared.cfg.max_row_group_bytes;
            if full
                && shared
                    .cutting
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                Some(slice.len())
            } else {
                None
            }
        };
        if let Some(n) = handoff {
            self.hand_off(n)?;
        }
        Ok(())
    }

    fn hand_off(&self, n: usize) -> Result<(), DbError> {
        let tx = self.cut_tx.lock()?;
        let sent = tx.as_ref().map_or(false, |tx| tx.try_send(n).is_ok());
        if !sent {
            self.shared.cutting.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// True while a handed-off cut has not finished.
    pub fn is_cutting(&self) -> bool {
        self.shared.cutting.load(Ordering::Acquire)
    }

    /// `(rows in memory, rows in row groups)`, observed atomically.
    pub fn row_counts(&self) -> Result<(u64, u64), DbError> {
        let groups = self.shared.rows.read()?;
        let slice = self.shared.slice.lock()?;
        Ok((slice.len() as u64, groups.rows_flushed))
    }

    pub fn num_row_groups(&self) -> Result<usize, DbError> {
        Ok(self.shared.rows.read()?.groups.len())
    }

    /// Bytes currently buffered in memory.
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::Acquire)
    }

    /// Bytes ever ingested into this store.
    pub fn total_size(&self) -> u64 {
        self.shared.total_size.load(Ordering::Relaxed)
    }

    /// Snapshot of the row groups cut so far.
    pub fn row_groups(&self) -> Result<Vec<Arc<RowGroupOnDisk>>, DbError> {
        Ok(self.shared.rows.read()?.groups.clone())
    }

    /// Rows of series matching `matchers` inside `[start, end]`, by series in label order.
    ///
    /// In-memory rows are included when `include_memory`; row groups only when
    /// `want_row_group(generation)` accepts them. The index and the row group list are
    /// read under one lock, so a concurrent cut is seen either fully or not at all.
    pub fn select_rows(
        &self,
        matchers: &[Matcher],
        start: Timestamp,
        end: Timestamp,
        include_memory: bool,
        want_row_group: impl Fn(usize) -> bool,
    ) -> Result<Vec<SeriesRows>, DbError> {
        let (selections, groups) = {
            let rows = self.shared.rows.read()?;
            let sel = self
                .shared
                .index
                .select(matchers, start, end, include_memory, want_row_group)?;
            (sel, rows.groups.clone())
        };

        let mut loaded: FxHashMap<usize, Vec<Arc<ProfileRow>>> = FxHashMap::default();
        let mut out = Vec::with_capacity(selections.len());
        for s in selections {
            let mut rows = Vec::new();
            for r in &s.on_disk {
                if !loaded.contains_key(&r.row_group) {
                    let group = groups.get(r.row_group).ok_or_else(|| DbError::Corruption {
                        details: format!("row group {} is not published", r.row_group),
                        block: Some(self.shared.head.clone()),
                        series: Some(s.fingerprint),
                    })?;
                    let data = group.read_rows()?.into_iter().map(Arc::new).collect();
                    loaded.insert(r.row_group, data);
                }
                let data = &loaded[&r.row_group];
                let from = r.range.row_num as usize;
                let to = from + r.range.length as usize;
                let slice = data.get(from..to).ok_or_else(|| DbError::Corruption {
                    details: format!(
                        "range {}..{} outside row group {} of {} rows",
                        from,
                        to,
                        r.row_group,
                        data.len()
                    ),
                    block: Some(self.shared.head.clone()),
                    series: Some(s.fingerprint),
                })?;
                rows.extend(
                    slice
                        .iter()
                        .filter(|p| p.time_nanos >= start && p.time_nanos <= end)
                        .cloned(),
                );
            }
            rows.extend(s.in_memory);
            if rows.is_empty() {
                continue;
            }
            rows.sort_by(|a, b| a.time_nanos.cmp(&b.time_nanos).then_with(|| a.id.cmp(&b.id)));
            out.push(SeriesRows {
                labels: s.labels,
                fingerprint: s.fingerprint,
                rows,
            });
        }
        Ok(out)
    }

    fn stop_cutter(&self) -> Result<(), DbError> {
        drop(self.cut_tx.lock()?.take());
        let handle = self.cutter.lock()?.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.shared.events.on_event(DbEvent::BackgroundThreadPanicked {
                    name: format!("profiledb-cutter-{}", self.shared.head),
                });
                return Err(DbError::BackgroundTaskError(format!(
                    "row group cutter of head {} panicked",
                    self.shared.head
                )));
            }
        }
        Ok(())
    }

    /// Cuts the remaining rows, writes the index file and merges every row group into the
    /// final profiles file, ordered by (series index, time, id).
    pub fn flush(&self) -> Result<StoreFlushStats, DbError> {
        self.stop_cutter()?;
        let shared = &self.shared;

        let remaining = shared.slice.lock()?.len();
        if remaining > 0 {
            shared.cut_row_group(remaining)?;
        }

        let groups = self.row_groups()?;
        let index: IndexWriteResult = shared
            .index
            .write_to(&shared.dir.join(INDEX_FILE), groups.len())?;

        let mut runs = Vec::with_capacity(groups.len());
        for group in &groups {
            let ranges = index
                .row_group_ranges
                .get(group.generation)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let mut rows = group.read_rows()?;
            for (i, row) in rows.iter_mut().enumerate() {
                row.series_index = series_for_row(ranges, i as u64).ok_or_else(|| {
                    DbError::Corruption {
                        details: format!(
                            "row {} of row group {} belongs to no series",
                            i, group.generation
                        ),
                        block: Some(shared.head.clone()),
                        series: Some(row.series_fingerprint),
                    }
                })?;
            }
            runs.push(rows);
        }
        let merged = merge_sorted(runs, |a, b| {
            (a.series_index, a.time_nanos, a.id) < (b.series_index, b.time_nanos, b.id)
        });

        let path = shared.dir.join(PROFILES_FILE);
        let mut writer = SegmentWriter::create(&path)?;
        let mut num_samples = 0u64;
        for chunk in merged.chunks(shared.cfg.max_rows_per_flushed_row_group.max(1)) {
            num_samples += chunk.iter().map(|r| r.samples.len() as u64).sum::<u64>();
            writer.write_row_group(chunk, series_ranges(chunk))?;
        }
        let seg = writer.finish()?;

        Ok(StoreFlushStats {
            num_rows: seg.num_rows,
            num_row_groups: seg.num_row_groups,
            num_series: index.num_series,
            num_samples,
            profiles_size: seg.size_bytes,
            index_size: index.size_bytes,
        })
    }

    /// Unlinks the per-cut row group files. Open readers keep working.
    pub fn delete_row_groups(&self) -> Result<(), DbError> {
        for group in self.row_groups()? {
            match fs::remove_file(&group.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Stops the cutter without flushing.
    pub fn close(&self) -> Result<(), DbError> {
        self.stop_cutter()
    }
}

impl Drop for ProfileStore {
    fn drop(&mut self) {
        let _ = self.stop_cutter();
    }
}

impl StoreShared {
    fn row_group_path(&self, generation: usize) -> PathBuf {
        self.dir.join(format!("profiles.{}.seg", generation))
    }

    /// Moves the `n` oldest in-memory rows into a new row group.
    fn cut_row_group(&self, n: usize) -> Result<(), DbError> {
        let started = Instant::now();
        let mut rows: Vec<Arc<ProfileRow>> = {
            let slice = self.slice.lock()?;
            slice.iter().take(n).cloned().collect()
        };
        if rows.is_empty() {
            return Ok(());
        }

        let mut labels: FxHashMap<Fingerprint, Arc<Labels>> = FxHashMap::default();
        for r in &rows {
            if !labels.contains_key(&r.series_fingerprint) {
                let l = self.index.labels_for(r.series_fingerprint)?.ok_or_else(|| {
                    DbError::Corruption {
                        details: "buffered row of an unknown series".into(),
                        block: Some(self.head.clone()),
                        series: Some(r.series_fingerprint),
                    }
                })?;
                labels.insert(r.series_fingerprint, l);
            }
        }
        rows.sort_by(|a, b| {
            labels[&a.series_fingerprint]
                .cmp(&labels[&b.series_fingerprint])
                .then_with(|| a.series_fingerprint.cmp(&b.series_fingerprint))
                .then_with(|| a.time_nanos.cmp(&b.time_nanos))
                .then_with(|| a.id.cmp(&b.id))
        });

        // single cutter at a time, so the generation cannot move under us
        let generation = self.rows.read()?.groups.len();
        let path = self.row_group_path(generation);
        let written = (|| {
            let mut w = SegmentWriter::create(&path)?;
            w.write_row_group(&rows, Vec::new())?;
            w.finish()?;
            let ranges = SeriesIndex::row_ranges(&rows)?;
            let reader = SegmentReader::open(&path)?;
            Ok::<_, DbError>((ranges, reader))
        })();
        let (ranges, reader) = match written {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        let cut = rows.len();
        let cut_bytes: u64 = rows.iter().map(|r| r.size_bytes()).sum();
        {
            let mut groups = self.rows.write()?;
            if let Err(e) = self.index.commit_row_group(generation, &ranges) {
                drop(groups);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
            let mut slice = self.slice.lock()?;
            slice.drain(..cut);
            self.size.fetch_sub(cut_bytes, Ordering::AcqRel);
            groups.rows_flushed += cut as u64;
            groups.groups.push(Arc::new(RowGroupOnDisk {
                generation,
                path,
                reader,
                num_rows: cut as u64,
            }));
        }

        let duration = started.elapsed();
        db_metrics::record_row_group_cut(duration, cut as u64);
        self.events.on_event(DbEvent::RowGroupCut {
            head: self.head.clone(),
            row_group: generation,
            rows: cut as u64,
            duration,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::row;
    use crate::telemetry::noop_event_listener;
    use crate::telemetry::testing::CountingRecorder;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &Path, max_rows: usize) -> (ProfileStore, Arc<SeriesIndex>) {
        let index = Arc::new(SeriesIndex::default());
        let cfg = ProfileStoreConfig {
            max_buffer_row_count: max_rows,
            max_rows_per_flushed_row_group: 7,
            ..Default::default()
        };
        let s = ProfileStore::new("test", dir, cfg, index.clone(), noop_event_listener()).unwrap();
        (s, index)
    }

    fn wait_for_cut(s: &ProfileStore) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while s.is_cutting() {
            assert!(Instant::now() < deadline, "cut did not finish");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn ingest(s: &ProfileStore, job: &str, t: i64) {
        let labels = Labels::from_pairs(&[("job", job)]);
        let r = Arc::new(row(labels.fingerprint(), t, 1));
        s.ingest(r, &labels).unwrap();
    }

    #[test]
    fn rows_are_accounted_for_across_cuts() {
        let dir = TempDir::new().unwrap();
        let (s, index) = store(dir.path(), 10);
        for t in 0..25 {
            ingest(&s, if t % 2 == 0 { "a" } else { "b" }, t);
            wait_for_cut(&s);
            let (mem, disk) = s.row_counts().unwrap();
            assert_eq!(mem + disk, t as u64 + 1);
        }
        assert_eq!(s.num_row_groups().unwrap(), 2);
        assert_eq!(s.row_counts().unwrap(), (5, 20));
        assert_eq!(index.total_profiles(), 25);
    }

    #[test]
    fn selection_sees_memory_and_disk_rows() {
        let dir = TempDir::new().unwrap();
        let (s, _) = store(dir.path(), 4);
        for t in 0..6 {
            ingest(&s, "a", t);
            wait_for_cut(&s);
        }
        let all = s.select_rows(&[], 0, 100, true, |_| true).unwrap();
        assert_eq!(all.len(), 1);
        let times: Vec<i64> = all[0].rows.iter().map(|r| r.time_nanos).collect();
        assert_eq!(times, vec![0, 1, 2, 3, 4, 5]);

        let disk_only = s.select_rows(&[], 0, 100, false, |_| true).unwrap();
        assert_eq!(disk_only[0].rows.len(), 4);
        let mem_only = s.select_rows(&[], 0, 100, true, |_| false).unwrap();
        assert_eq!(mem_only[0].rows.len(), 2);
        let ranged = s.select_rows(&[], 2, 4, true, |_| true).unwrap();
        assert_eq!(ranged[0].rows.len(), 3);
    }

    #[test]
    fn flush_merges_row_groups_in_series_order() {
        let dir = TempDir::new().unwrap();
        let (s, _) = store(dir.path(), 5);
        for t in 0..23 {
            ingest(&s, ["c", "a", "b"][t as usize % 3], 100 - t);
            wait_for_cut(&s);
        }
        let stats = s.flush().unwrap();
        assert_eq!(stats.num_rows, 23);
        assert_eq!(stats.num_series, 3);
        assert_eq!(stats.num_row_groups, 4);

        let reader = SegmentReader::open(&dir.path().join(PROFILES_FILE)).unwrap();
        let mut rows = Vec::new();
        for (i, meta) in reader.row_groups().iter().enumerate() {
            let group = reader.read_row_group(i).unwrap();
            for (j, r) in group.iter().enumerate() {
                assert_eq!(meta.series_for_row(j as u64), Some(r.series_index));
            }
            rows.extend(group);
        }
        assert_eq!(rows.len(), 23);
        for w in rows.windows(2) {
            assert!((w[0].series_index, w[0].time_nanos) <= (w[1].series_index, w[1].time_nanos));
        }
        assert_eq!(rows.first().map(|r| r.series_index), Some(0));
        assert_eq!(rows.last().map(|r| r.series_index), Some(2));
    }

    #[test]
    fn deleting_row_groups_keeps_them_readable() {
        let dir = TempDir::new().unwrap();
        let (s, _) = store(dir.path(), 2);
        for t in 0..4 {
            ingest(&s, "a", t);
            wait_for_cut(&s);
        }
        s.flush().unwrap();
        let groups = s.row_groups().unwrap();
        s.delete_row_groups().unwrap();
        assert!(!groups[0].path.exists());
        assert_eq!(groups[0].read_rows().unwrap().len(), 2);
        assert!(dir.path().join(PROFILES_FILE).exists());
    }

    #[test]
    fn row_group_cuts_are_counted_without_a_listener() {
        let dir = TempDir::new().unwrap();
        let (s, _) = store(dir.path(), 100);
        for t in 0..3 {
            ingest(&s, "a", t);
        }
        let recorder = CountingRecorder::default();
        // the final cut runs on the flushing thread
        metrics::with_local_recorder(&recorder, || s.flush()).unwrap();
        assert_eq!(recorder.get(db_metrics::ROW_GROUP_CUTS), 3);
        assert_eq!(recorder.get(db_metrics::ROW_GROUP_CUT_DURATION_SECONDS), 1);
    }

    #[test]
    fn flushing_an_untouched_store_writes_an_empty_file() {
        let dir = TempDir::new().unwrap();
        let (s, _) = store(dir.path(), 2);
        let stats = s.flush().unwrap();
        assert_eq!(stats.num_rows, 0);
        assert_eq!(stats.num_row_groups, 0);
    }
}
