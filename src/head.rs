//! The head: the mutable unit that ingests profiles until it is flushed into a block.
//!
//! A head lives under `<data>/head/<id>` while it ingests and is renamed to
//! `<data>/local/<id>` once flushed. Its lifecycle is `Open -> Flushing -> Flushed -> Moved`;
//! a failed flush leaves it in `Flushing` so the flush can be retried.

use crate::block::{BlockFile, BlockMeta, BlockStats};
use crate::dedup::Rewriter;
use crate::delta::DeltaTracker;
use crate::encoding::sync_parent_dir;
use crate::error::DbError;
use crate::labels::{
    Fingerprint, LabelPair, Labels, ProfileType, LABEL_NAME_METRIC, LABEL_NAME_PERIOD_TYPE,
    LABEL_NAME_PERIOD_UNIT, LABEL_NAME_PROFILE_TYPE, LABEL_NAME_TYPE, LABEL_NAME_UNIT,
};
use crate::limits::Limiter;
use crate::partition::{partition_key, Stacktrace, StacktracePartitions};
use crate::profile_store::{ProfileStore, ProfileStoreConfig, INDEX_FILE, PROFILES_FILE};
use crate::selector::Matcher;
use crate::series_index::{SeriesIndex, DEFAULT_INDEX_SHARDS};
use crate::symbols::{validate_profile, SymbolTables};
use crate::telemetry::{db_metrics, DbEvent, DbEventListener, FlushReason};
use crate::types::{Profile, ProfileId, ProfileRow, Samples, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const HEAD_DIR: &str = "head";
pub const LOCAL_DIR: &str = "local";

/// Sample label carrying the hex-encoded span id of a sample.
pub const SPAN_ID_LABEL: &str = "span_id";

/// Head configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Root data directory; heads live in `head/`, flushed blocks in `local/`.
    pub data_path: PathBuf,
    /// Flush once the head has been open this long.
    pub max_block_duration: Duration,
    /// Flush once the head holds this many bytes.
    pub max_block_bytes: u64,
    /// How often the size trigger is evaluated.
    pub size_check_interval: Duration,
    /// Shards of the series inverted index.
    pub index_shards: u32,
    pub row_store: ProfileStoreConfig,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            max_block_duration: Duration::from_secs(60 * 60),
            max_block_bytes: 1 << 30,
            size_check_interval: Duration::from_secs(5),
            index_shards: DEFAULT_INDEX_SHARDS,
            row_store: ProfileStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadState {
    Open,
    Flushing,
    Flushed,
    Moved,
}

/// One-shot flush request raised by the background triggers.
#[derive(Debug, Default)]
struct FlushSignal {
    fired: AtomicBool,
}

impl FlushSignal {
    /// Returns true only for the call that fired the signal.
    fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

struct Background {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Head {
    id: uuid::Uuid,
    name: String,
    cfg: HeadConfig,
    head_path: PathBuf,
    local_path: PathBuf,
    created: Instant,
    /// Ingest holds the read side for its whole duration, so taking the write side waits
    /// for in-flight ingests to drain.
    state: RwLock<HeadState>,
    symbols: SymbolTables,
    partitions: StacktracePartitions,
    index: Arc<SeriesIndex>,
    store: ProfileStore,
    delta: Arc<DeltaTracker>,
    limiter: Arc<dyn Limiter>,
    time_bounds: Mutex<(Timestamp, Timestamp)>,
    total_samples: AtomicU64,
    flush_signal: FlushSignal,
    meta: Mutex<Option<BlockMeta>>,
    background: Mutex<Option<Background>>,
    events: Arc<dyn DbEventListener>,
}

impl std::fmt::Debug for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Head")
            .field("id", &self.id)
            .field("path", &self.head_path)
            .finish()
    }
}

impl Head {
    /// Creates a head directory under `cfg.data_path` and starts its row-group cutter and
    /// its flush-trigger loop.
    ///
    /// # Arguments
    /// * `cfg` - Thresholds and the data directory.
    /// * `delta` - Cumulative-profile baselines, shared across heads of one database.
    /// * `limiter` - Admission check run for every series before anything is written.
    /// * `events` - Observability hook.
    ///
    /// # Errors
    /// Returns an error if the head directory cannot be created or a thread cannot be spawned.
    pub fn new(
        cfg: HeadConfig,
        delta: Arc<DeltaTracker>,
        limiter: Arc<dyn Limiter>,
        events: Arc<dyn DbEventListener>,
    ) -> Result<Arc<Self>, DbError> {
        let id = uuid::Uuid::new_v4();
        let name = id.to_string();
        let head_path = cfg.data_path.join(HEAD_DIR).join(&name);
        let local_path = cfg.data_path.join(LOCAL_DIR).join(&name);
        fs::create_dir_all(&head_path)?;

        let index = Arc::new(SeriesIndex::new(cfg.index_shards));
        let store = ProfileStore::new(
            &name,
            &head_path,
            cfg.row_store.clone(),
            index.clone(),
            events.clone(),
        )?;

        let head = Arc::new(Self {
            id,
            name,
            cfg,
            head_path,
            local_path,
            created: Instant::now(),
            state: RwLock::new(HeadState::Open),
            symbols: SymbolTables::new(),
            partitions: StacktracePartitions::new(),
            index,
            store,
            delta,
            limiter,
            time_bounds: Mutex::new((Timestamp::MAX, Timestamp::MIN)),
            total_samples: AtomicU64::new(0),
            flush_signal: FlushSignal::default(),
            meta: Mutex::new(None),
            background: Mutex::new(None),
            events,
        });
        head.events.on_event(DbEvent::HeadCreated {
            head: head.name.clone(),
            path: head.head_path.clone(),
        });
        head.start_background()?;
        Ok(head)
    }

    fn start_background(self: &Arc<Self>) -> Result<(), DbError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<Head> = Arc::downgrade(self);
        let name = self.name.clone();
        let events = self.events.clone();
        let check_every = self.cfg.size_check_interval.max(Duration::from_millis(1));
        let handle = thread::Builder::new()
            .name(format!("profiledb-head-{}", name))
            .spawn(move || {
                events.on_event(DbEvent::BackgroundLoopStarted { head: name.clone() });
                loop {
                    let wait = match weak.upgrade() {
                        Some(head) => head.until_deadline().min(check_every),
                        None => break,
                    };
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let Some(head) = weak.upgrade() else {
                                break;
                            };
                            if head.check_flush_triggers() {
                                break;
                            }
                        }
                    }
                }
                events.on_event(DbEvent::BackgroundLoopStopping { head: name });
            })?;
        *self.background.lock()? = Some(Background { stop_tx, handle });
        Ok(())
    }

    fn until_deadline(&self) -> Duration {
        self.cfg
            .max_block_duration
            .saturating_sub(self.created.elapsed())
            .max(Duration::from_millis(1))
    }

    /// Evaluates the duration and size triggers. Returns true once the flush signal has
    /// fired; later checks are not needed.
    fn check_flush_triggers(&self) -> bool {
        if self.flush_signal.is_fired() {
            return true;
        }
        let reason = if self.created.elapsed() >= self.cfg.max_block_duration {
            Some(FlushReason::MaxDuration)
        } else if self.size() >= self.cfg.max_block_bytes {
            Some(FlushReason::MaxSize)
        } else {
            None
        };
        db_metrics::set_head_size(self.size());
        match reason {
            Some(reason) => {
                self.request_flush(reason);
                true
            }
            None => false,
        }
    }

    /// Raises the flush signal. Only the first request has an effect.
    pub fn request_flush(&self, reason: FlushReason) {
        if self.flush_signal.fire() {
            self.events.on_event(DbEvent::FlushSignalled {
                head: self.name.clone(),
                reason,
            });
        }
    }

    pub fn flush_requested(&self) -> bool {
        self.flush_signal.is_fired()
    }

    fn stop_background(&self) -> Result<(), DbError> {
        let bg = self.background.lock()?.take();
        if let Some(bg) = bg {
            let _ = bg.stop_tx.send(());
            // the loop may hold the last strong reference and drop the head itself
            if bg.handle.thread().id() == thread::current().id() {
                return Ok(());
            }
            if bg.handle.join().is_err() {
                self.events.on_event(DbEvent::BackgroundThreadPanicked {
                    name: format!("profiledb-head-{}", self.name),
                });
                return Err(DbError::BackgroundTaskError(format!(
                    "flush trigger loop of head {} panicked",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.head_path
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn state(&self) -> Result<HeadState, DbError> {
        Ok(*self.state.read()?)
    }

    pub fn symbols(&self) -> &SymbolTables {
        &self.symbols
    }

    pub fn partitions(&self) -> &StacktracePartitions {
        &self.partitions
    }

    pub fn index(&self) -> &SeriesIndex {
        &self.index
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub(crate) fn events(&self) -> &Arc<dyn DbEventListener> {
        &self.events
    }

    /// Inclusive time bounds of ingested rows, `None` while empty.
    pub fn bounds(&self) -> Result<Option<(Timestamp, Timestamp)>, DbError> {
        let (min, max) = *self.time_bounds.lock()?;
        Ok((min <= max).then_some((min, max)))
    }

    pub fn in_range(&self, start: Timestamp, end: Timestamp) -> Result<bool, DbError> {
        Ok(self
            .bounds()?
            .map_or(false, |(min, max)| min <= end && max >= start))
    }

    /// Bytes held by the head: symbol tables, stacktraces and every row ingested.
    pub fn size(&self) -> u64 {
        self.symbols.size() + self.partitions.size().unwrap_or(0) + self.store.total_size()
    }

    /// Bytes held in memory right now; rows already cut to disk are not counted.
    pub fn memory_size(&self) -> u64 {
        self.symbols.size() + self.partitions.size().unwrap_or(0) + self.store.size()
    }

    pub fn total_profiles(&self) -> u64 {
        self.index.total_profiles()
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(Ordering::Relaxed)
    }

    /// Ingests one profile. Every sample type becomes its own series and row.
    ///
    /// Rejections (series limit, out of order, malformed input) leave the head untouched
    /// and are reported through a `ProfileDiscarded` event.
    ///
    /// # Errors
    /// Returns [`DbError::HeadClosed`] once a flush has started.
    pub fn ingest(
        &self,
        profile: &Profile,
        id: ProfileId,
        external_labels: &Labels,
        tenant: &str,
    ) -> Result<(), DbError> {
        let res = self.ingest_inner(profile, id, external_labels, tenant);
        if let Err(e) = &res {
            if let Some(reason) = e.discard_reason() {
                db_metrics::record_discarded(reason);
                self.events.on_event(DbEvent::ProfileDiscarded {
                    reason,
                    error: e.to_string(),
                });
            }
        }
        res
    }

    fn ingest_inner(
        &self,
        profile: &Profile,
        id: ProfileId,
        external_labels: &Labels,
        tenant: &str,
    ) -> Result<(), DbError> {
        let state = self.state.read()?;
        if *state != HeadState::Open {
            return Err(DbError::HeadClosed);
        }
        validate_profile(profile)?;

        let series = series_labels(profile, external_labels)?;
        self.limiter
            .allow_profile(tenant, &series, profile.time_nanos)?;
        let partition = partition_key(profile);

        let mut rw = Rewriter::default();
        self.symbols.ingest(profile, &mut rw)?;

        let stacktraces: Vec<Stacktrace> = profile
            .samples
            .iter()
            .map(|s| {
                s.location_ids
                    .iter()
                    .map(|id| rw.locations.rewrite(*id))
                    .collect::<Vec<u32>>()
                    .into()
            })
            .collect();
        let mut stacktrace_ids = vec![0u32; stacktraces.len()];
        self.partitions
            .append_stacktraces(partition, &mut stacktrace_ids, stacktraces)?;

        let span_ids: Vec<u64> = profile.samples.iter().map(|s| span_id(profile, s)).collect();
        let has_spans = span_ids.iter().any(|s| *s != 0);
        let comments: Vec<u32> = profile
            .comments
            .iter()
            .map(|c| rw.strings.rewrite(*c as u64))
            .collect();

        let mut rows = 0u64;
        let mut samples_ingested = 0u64;
        for (i, (labels, fp)) in series.into_iter().enumerate() {
            let mut samples = Samples {
                stacktrace_ids: stacktrace_ids.clone(),
                values: profile.samples.iter().map(|s| s.values[i] as u64).collect(),
                span_ids: if has_spans { span_ids.clone() } else { Vec::new() },
            };
            samples.compact();
            if self.delta.is_cumulative(&labels) {
                samples = self.delta.compute_delta(fp, partition, &samples)?;
                samples.compact();
            }
            if samples.is_empty() {
                tracing::trace!(head = %self.name, series = %labels, "no samples left to store");
                continue;
            }

            samples_ingested += samples.len() as u64;
            let row = ProfileRow {
                id: if i == 0 { id } else { uuid::Uuid::new_v4() },
                series_fingerprint: fp,
                series_index: 0,
                stacktrace_partition: partition,
                total_value: samples.total(),
                samples,
                time_nanos: profile.time_nanos,
                duration_nanos: profile.duration_nanos,
                period: profile.period,
                comments: comments.clone(),
                drop_frames: rw.strings.rewrite(profile.drop_frames as u64),
                keep_frames: rw.strings.rewrite(profile.keep_frames as u64),
                default_sample_type: profile.default_sample_type,
            };
            self.store.ingest(Arc::new(row), &labels)?;
            rows += 1;
        }

        if rows > 0 {
            let mut bounds = self.time_bounds.lock()?;
            bounds.0 = bounds.0.min(profile.time_nanos);
            bounds.1 = bounds.1.max(profile.time_nanos);
        }
        self.total_samples
            .fetch_add(samples_ingested, Ordering::Relaxed);
        db_metrics::record_ingest(rows, samples_ingested);
        drop(state);
        Ok(())
    }

    /// Waits for in-flight ingests, then writes every table, the stacktrace partitions,
    /// the row file, the index and `meta.json` into the head directory.
    ///
    /// A head that never stored a row removes its directory instead. A failed flush leaves
    /// the head in [`HeadState::Flushing`]; calling `flush` again retries.
    pub fn flush(&self) -> Result<(), DbError> {
        let started = Instant::now();
        {
            let mut state = self.state.write()?;
            match *state {
                HeadState::Open | HeadState::Flushing => *state = HeadState::Flushing,
                HeadState::Flushed => return Ok(()),
                HeadState::Moved => {
                    return Err(DbError::Internal(format!(
                        "head {} was already moved",
                        self.name
                    )))
                }
            }
        }
        self.stop_background()?;

        if self.index.total_profiles() == 0 {
            self.store.close()?;
            match fs::remove_dir_all(&self.head_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            *self.state.write()? = HeadState::Flushed;
            self.events.on_event(DbEvent::HeadFlushSkippedEmpty {
                head: self.name.clone(),
            });
            return Ok(());
        }

        match self.write_block() {
            Ok(meta) => {
                let duration = started.elapsed();
                db_metrics::record_head_flush(duration, meta.stats.num_profiles);
                self.events.on_event(DbEvent::HeadFlushed {
                    head: self.name.clone(),
                    profiles: meta.stats.num_profiles,
                    series: meta.stats.num_series,
                    samples: meta.stats.num_samples,
                    duration,
                });
                *self.meta.lock()? = Some(meta);
                *self.state.write()? = HeadState::Flushed;
                Ok(())
            }
            Err(e) => {
                self.events.on_event(DbEvent::HeadFlushFailed {
                    head: self.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn write_block(&self) -> Result<BlockMeta, DbError> {
        let dir = &self.head_path;
        let mut files = self.symbols.write_to(dir)?;
        files.extend(self.partitions.write_to(dir)?);

        let stats = self.store.flush()?;
        files.push(BlockFile::rows(
            PROFILES_FILE,
            stats.profiles_size,
            stats.num_rows,
            stats.num_row_groups,
        ));
        files.push(BlockFile::plain(INDEX_FILE, stats.index_size));
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        let mut meta = BlockMeta::new(self.id);
        if let Some((min, max)) = self.bounds()? {
            meta.min_time = min;
            meta.max_time = max;
        }
        meta.stats = BlockStats {
            num_series: stats.num_series,
            num_profiles: stats.num_rows,
            num_samples: stats.num_samples,
        };
        meta.files = files;
        meta.write_to(dir)?;
        Ok(meta)
    }

    /// Descriptor written by the last successful flush.
    pub fn meta(&self) -> Result<Option<BlockMeta>, DbError> {
        Ok(self.meta.lock()?.clone())
    }

    /// Deletes the per-cut row group files and renames the flushed head directory into the
    /// block namespace. Returns the block path, or `None` for a head that stored nothing.
    /// The head must not be queried afterwards.
    pub fn move_to_local(&self) -> Result<Option<PathBuf>, DbError> {
        let mut state = self.state.write()?;
        match *state {
            HeadState::Flushed => {}
            HeadState::Moved => return Ok(None),
            other => {
                return Err(DbError::Internal(format!(
                    "head {} cannot be moved while {:?}",
                    self.name, other
                )))
            }
        }
        if self.meta.lock()?.is_none() {
            *state = HeadState::Moved;
            return Ok(None);
        }

        self.store.delete_row_groups()?;
        if let Some(parent) = self.local_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.head_path, &self.local_path)?;
        sync_parent_dir(&self.local_path)?;
        *state = HeadState::Moved;
        self.events.on_event(DbEvent::HeadMoved {
            head: self.name.clone(),
            path: self.local_path.clone(),
        });
        Ok(Some(self.local_path.clone()))
    }

    /// Stops the background threads without flushing.
    pub fn close(&self) -> Result<(), DbError> {
        self.stop_background()?;
        self.store.close()
    }

    pub fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.index.label_names(matchers)
    }

    pub fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.index.label_values(name, matchers)
    }

    pub fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError> {
        self.index.series(matchers)
    }
}

impl Drop for Head {
    fn drop(&mut self) {
        let _ = self.stop_background();
    }
}

/// Series labels of each sample type: the external labels plus the profile-type labels.
fn series_labels(
    profile: &Profile,
    external: &Labels,
) -> Result<Vec<(Labels, Fingerprint)>, DbError> {
    let name = external
        .get(LABEL_NAME_METRIC)
        .ok_or_else(|| DbError::MalformedProfile(format!("missing {} label", LABEL_NAME_METRIC)))?;
    let (period_type, period_unit) = profile
        .period_type
        .map(|pt| (profile.string(pt.r#type), profile.string(pt.unit)))
        .unwrap_or(("", ""));

    Ok(profile
        .sample_types
        .iter()
        .map(|st| {
            let pt = ProfileType {
                name: name.to_string(),
                sample_type: profile.string(st.r#type).to_string(),
                sample_unit: profile.string(st.unit).to_string(),
                period_type: period_type.to_string(),
                period_unit: period_unit.to_string(),
            };
            let mut pairs: Vec<LabelPair> = external.iter().cloned().collect();
            pairs.push(LabelPair::new(LABEL_NAME_TYPE, pt.sample_type.clone()));
            pairs.push(LabelPair::new(LABEL_NAME_UNIT, pt.sample_unit.clone()));
            pairs.push(LabelPair::new(LABEL_NAME_PERIOD_TYPE, pt.period_type.clone()));
            pairs.push(LabelPair::new(LABEL_NAME_PERIOD_UNIT, pt.period_unit.clone()));
            pairs.push(LabelPair::new(LABEL_NAME_PROFILE_TYPE, pt.id()));
            let labels = Labels::new(pairs);
            let fp = labels.fingerprint();
            (labels, fp)
        })
        .collect())
}

/// Span id from the `span_id` sample label, 0 when absent or not hex.
fn span_id(profile: &Profile, sample: &crate::types::Sample) -> u64 {
    sample
        .labels
        .iter()
        .find(|l| profile.string(l.key) == SPAN_ID_LABEL)
        .and_then(|l| u64::from_str_radix(profile.string(l.str), 16).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::delta::DeltaConfig;
    use crate::limits::{LimitsConfig, NoLimits, SeriesLimiter, DEFAULT_TENANT};
    use crate::symbols::tests::cpu_profile;
    use crate::telemetry::noop_event_listener;
    use crate::telemetry::testing::CountingRecorder;
    use crate::types::{SampleLabel, ValueType};
    use tempfile::TempDir;

    fn config(dir: &Path) -> HeadConfig {
        HeadConfig {
            data_path: dir.to_path_buf(),
            row_store: ProfileStoreConfig {
                max_buffer_row_count: 4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn head_with(cfg: HeadConfig, limiter: Arc<dyn Limiter>) -> Arc<Head> {
        let delta = Arc::new(DeltaTracker::new(&DeltaConfig::default()));
        Head::new(cfg, delta, limiter, noop_event_listener()).unwrap()
    }

    fn head(dir: &Path) -> Arc<Head> {
        head_with(config(dir), Arc::new(NoLimits))
    }

    fn labels(job: &str) -> Labels {
        Labels::from_pairs(&[("__name__", "process_cpu"), ("job", job)])
    }

    #[test]
    fn profile_type_labels_are_derived_per_sample_type() {
        let mut p = cpu_profile(&[(&["b", "a"], 1)], 5);
        p.string_table.push("samples".into());
        p.string_table.push("count".into());
        let n = p.string_table.len() as i64;
        p.sample_types.push(ValueType { r#type: n - 2, unit: n - 1 });
        p.samples[0].values.push(2);

        let series = series_labels(&p, &labels("a")).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(
            series[0].0.get(LABEL_NAME_PROFILE_TYPE),
            Some("process_cpu:cpu:nanoseconds:cpu:nanoseconds")
        );
        assert_eq!(
            series[1].0.get(LABEL_NAME_PROFILE_TYPE),
            Some("process_cpu:samples:count:cpu:nanoseconds")
        );
        assert_ne!(series[0].1, series[1].1);

        let dir = TempDir::new().unwrap();
        let h = head(dir.path());
        h.ingest(&p, uuid::Uuid::new_v4(), &labels("a"), DEFAULT_TENANT)
            .unwrap();
        assert_eq!(h.total_profiles(), 2);
        assert_eq!(h.index().total_series(), 2);
    }

    #[test]
    fn ingest_requires_a_name_label() {
        let dir = TempDir::new().unwrap();
        let h = head(dir.path());
        let p = cpu_profile(&[(&["a"], 1)], 1);
        let err = h
            .ingest(&p, uuid::Uuid::new_v4(), &Labels::from_pairs(&[("job", "a")]), DEFAULT_TENANT)
            .unwrap_err();
        assert!(matches!(err, DbError::MalformedProfile(_)));
        assert_eq!(h.total_profiles(), 0);
    }

    #[test]
    fn rejected_profiles_write_nothing() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(SeriesLimiter::new(LimitsConfig {
            max_series_per_tenant: Some(1),
            ..Default::default()
        }));
        let h = head_with(config(dir.path()), limiter);
        let p = cpu_profile(&[(&["a"], 1)], 1);
        h.ingest(&p, uuid::Uuid::new_v4(), &labels("a"), "t").unwrap();
        let strings_before = h.symbols().strings.len().unwrap();

        let other = cpu_profile(&[(&["unseen"], 1)], 2);
        let err = h
            .ingest(&other, uuid::Uuid::new_v4(), &labels("b"), "t")
            .unwrap_err();
        assert!(matches!(err, DbError::SeriesLimitExceeded { .. }));
        assert_eq!(h.symbols().strings.len().unwrap(), strings_before);
        assert_eq!(h.total_profiles(), 1);
    }

    #[test]
    fn a_profile_whose_second_series_is_over_the_limit_is_rejected_whole() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(SeriesLimiter::new(LimitsConfig {
            max_series_per_tenant: Some(2),
            ..Default::default()
        }));
        let h = head_with(config(dir.path()), limiter.clone());
        h.ingest(&cpu_profile(&[(&["a"], 1)], 1), uuid::Uuid::new_v4(), &labels("a"), "t")
            .unwrap();

        let mut p = cpu_profile(&[(&["b", "a"], 1)], 2);
        p.string_table.push("samples".into());
        p.string_table.push("count".into());
        let n = p.string_table.len() as i64;
        p.sample_types.push(ValueType { r#type: n - 2, unit: n - 1 });
        p.samples[0].values.push(2);

        let err = h
            .ingest(&p, uuid::Uuid::new_v4(), &labels("b"), "t")
            .unwrap_err();
        assert!(matches!(err, DbError::SeriesLimitExceeded { current: 1, limit: 2, .. }));
        assert_eq!(limiter.series_count("t").unwrap(), 1);
        assert_eq!(h.index().total_series(), 1);

        // the tenant still has room for one more single-series profile
        h.ingest(&cpu_profile(&[(&["c"], 1)], 3), uuid::Uuid::new_v4(), &labels("c"), "t")
            .unwrap();
        assert_eq!(limiter.series_count("t").unwrap(), 2);
    }

    #[test]
    fn discards_and_flushes_are_counted_with_a_noop_listener() {
        let dir = TempDir::new().unwrap();
        let h = head(dir.path());
        let recorder = CountingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            let p = cpu_profile(&[(&["a"], 1)], 1);
            let unnamed = Labels::from_pairs(&[("job", "a")]);
            assert!(h.ingest(&p, uuid::Uuid::new_v4(), &unnamed, DEFAULT_TENANT).is_err());
            h.ingest(&p, uuid::Uuid::new_v4(), &labels("a"), DEFAULT_TENANT)
                .unwrap();
            h.flush().unwrap();
        });
        assert_eq!(
            recorder.get("profiledb_discarded_profiles{reason=malformed_profile}"),
            1
        );
        assert_eq!(recorder.get(db_metrics::HEAD_FLUSHED_PROFILES), 1);
        assert_eq!(recorder.get(db_metrics::HEAD_FLUSH_DURATION_SECONDS), 1);
    }

    #[test]
    fn cumulative_profiles_store_deltas_only() {
        let dir = TempDir::new().unwrap();
        let h = head(dir.path());
        let heap = Labels::from_pairs(&[("__name__", "memory"), ("job", "a")]);
        let alloc = |v: i64, t: i64| {
            let mut p = cpu_profile(&[(&["alloc", "main"], v)], t);
            p.string_table[1] = "alloc_space".into();
            p.string_table[2] = "bytes".into();
            p
        };
        for (t, v) in [(1, 100), (2, 150), (3, 170)] {
            h.ingest(&alloc(v, t), uuid::Uuid::new_v4(), &heap, DEFAULT_TENANT)
                .unwrap();
        }
        // the first observation only seeds the baseline
        assert_eq!(h.total_profiles(), 2);
        let rows = h.store().select_rows(&[], 0, 10, true, |_| true).unwrap();
        let totals: Vec<u64> = rows[0].rows.iter().map(|r| r.total_value).collect();
        assert_eq!(totals, vec![50, 20]);
    }

    #[test]
    fn span_ids_are_read_from_sample_labels() {
        let mut p = cpu_profile(&[(&["a"], 1), (&["b"], 2)], 1);
        p.string_table.push(SPAN_ID_LABEL.into());
        p.string_table.push("00000000000000ff".into());
        let n = p.string_table.len() as i64;
        p.samples[1].labels.push(SampleLabel {
            key: n - 2,
            str: n - 1,
            ..Default::default()
        });
        assert_eq!(span_id(&p, &p.samples[0]), 0);
        assert_eq!(span_id(&p, &p.samples[1]), 255);
    }

    #[test]
    fn size_trigger_signals_flush_once() {
        let dir = TempDir::new().unwrap();
        let h = head_with(
            HeadConfig {
                max_block_bytes: 1,
                size_check_interval: Duration::from_millis(5),
                ..config(dir.path())
            },
            Arc::new(NoLimits),
        );
        let p = cpu_profile(&[(&["a"], 1)], 1);
        h.ingest(&p, uuid::Uuid::new_v4(), &labels("a"), DEFAULT_TENANT)
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !h.flush_requested() {
            assert!(Instant::now() < deadline, "size trigger did not fire");
            thread::sleep(Duration::from_millis(2));
        }
        h.request_flush(FlushReason::MaxDuration);
        assert!(h.flush_requested());
    }

    #[test]
    fn flush_then_move_produces_an_openable_block() {
        let dir = TempDir::new().unwrap();
        let h = head(dir.path());
        for t in 0..10 {
            let p = cpu_profile(&[(&["baz", "bar", "foo"], 1)], t);
            h.ingest(&p, uuid::Uuid::new_v4(), &labels(["a", "b"][t as usize % 2]), DEFAULT_TENANT)
                .unwrap();
        }
        let names_before = h.label_names(&[]).unwrap();
        let jobs_before = h.label_values("job", &[]).unwrap();

        h.flush().unwrap();
        assert_eq!(h.state().unwrap(), HeadState::Flushed);
        let p = cpu_profile(&[(&["a"], 1)], 99);
        assert!(matches!(
            h.ingest(&p, uuid::Uuid::new_v4(), &labels("a"), DEFAULT_TENANT),
            Err(DbError::HeadClosed)
        ));
        let meta = h.meta().unwrap().unwrap();
        assert_eq!(meta.stats.num_profiles, 10);
        assert_eq!(meta.stats.num_series, 2);
        assert_eq!((meta.min_time, meta.max_time), (0, 9));

        let path = h.move_to_local().unwrap().unwrap();
        assert!(!h.path().exists());
        assert!(!path.join("profiles.0.seg").exists());
        let block = Block::open(&path).unwrap();
        assert_eq!(block.meta(), &meta);
        assert_eq!(block.index().label_names(&[]).unwrap(), names_before);
        assert_eq!(block.index().label_values("job", &[]).unwrap(), jobs_before);
    }

    #[test]
    fn flushing_an_empty_head_removes_its_directory() {
        let dir = TempDir::new().unwrap();
        let h = head(dir.path());
        assert!(h.path().exists());
        h.flush().unwrap();
        assert!(!h.path().exists());
        assert!(h.meta().unwrap().is_none());
        assert_eq!(h.move_to_local().unwrap(), None);
    }
}
