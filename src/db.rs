//! Database orchestration: the current head, heads being flushed, and flushed blocks.
//!
//! A background thread watches the head's flush signal. When it fires, the head is swapped
//! for a fresh one, flushed, moved into `local/` and replaced by the block opened from it.
//! The move and the swap happen under the state write lock, so a query sees either the
//! head or its block, never both and never neither.

use crate::block::{Block, META_FILE};
use crate::delta::{DeltaConfig, DeltaTracker};
use crate::engine::{self, MergeHints};
use crate::error::DbError;
use crate::head::{Head, HeadConfig, HEAD_DIR, LOCAL_DIR};
use crate::labels::{Labels, ProfileType};
use crate::limits::{LimitsConfig, Limiter, SeriesLimiter};
use crate::merge::QueryContext;
use crate::querier::{head_queriers, BlockQuerier, ProfileEntry, Querier, SelectParams, Series};
use crate::selector::parse_selector;
use crate::telemetry::{noop_event_listener, DbEvent, DbEventListener};
use crate::tree::Tree;
use crate::types::{Profile, ProfileId, Timestamp};
use std::fs;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Commands sent to the rotation thread.
enum DbCommand {
    Rotate { ack: mpsc::Sender<Result<(), DbError>> },
    Shutdown,
}

/// Configuration options for [`ProfileDb`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub head: HeadConfig,
    pub delta: DeltaConfig,
    pub limits: LimitsConfig,
    /// Query worker threads; 0 lets rayon decide.
    pub query_concurrency: usize,
    /// How often the rotation thread looks at the head's flush signal.
    pub rotation_check_interval: Duration,
    /// Hints used by queries that do not carry their own.
    pub merge_hints: MergeHints,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            head: HeadConfig::default(),
            delta: DeltaConfig::default(),
            limits: LimitsConfig::default(),
            query_concurrency: 0,
            rotation_check_interval: Duration::from_secs(1),
            merge_hints: MergeHints::default(),
            event_listener: noop_event_listener(),
        }
    }
}

/// A query over a time range and a label selector.
#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    /// Label selector such as `{job="api"}`; empty selects everything.
    pub selector: String,
    pub profile_type: Option<ProfileType>,
    /// Inclusive bounds in nanoseconds.
    pub start: Timestamp,
    pub end: Timestamp,
    /// Overrides [`DbConfig::merge_hints`].
    pub hints: Option<MergeHints>,
    pub context: QueryContext,
}

impl SelectRequest {
    pub fn new(selector: impl Into<String>, start: Timestamp, end: Timestamp) -> Self {
        Self {
            selector: selector.into(),
            start,
            end,
            ..Default::default()
        }
    }

    pub fn with_profile_type(mut self, profile_type: ProfileType) -> Self {
        self.profile_type = Some(profile_type);
        self
    }

    pub fn with_hints(mut self, hints: MergeHints) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_context(mut self, context: QueryContext) -> Self {
        self.context = context;
        self
    }

    fn params(&self) -> Result<SelectParams, DbError> {
        let params = SelectParams {
            matchers: parse_selector(&self.selector)?,
            start: self.start,
            end: self.end,
        };
        Ok(match &self.profile_type {
            Some(pt) => engine::with_profile_type(&params, pt),
            None => params,
        })
    }
}

struct DbState {
    /// `None` once the database is closed.
    head: Option<Arc<Head>>,
    /// Heads swapped out but not yet replaced by their block.
    flushing: Vec<Arc<Head>>,
    blocks: Vec<Arc<Block>>,
}

struct DbShared {
    cfg: DbConfig,
    state: RwLock<DbState>,
    delta: Arc<DeltaTracker>,
    limiter: Arc<dyn Limiter>,
    /// Serializes rotations.
    rotation: Mutex<()>,
}

/// Single-node profile store.
pub struct ProfileDb {
    shared: Arc<DbShared>,
    pool: rayon::ThreadPool,
    cmd_tx: mpsc::Sender<DbCommand>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProfileDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileDb")
            .field("data_path", &self.shared.cfg.head.data_path)
            .finish()
    }
}

impl ProfileDb {
    /// Opens the database under `cfg.head.data_path`.
    ///
    /// Blocks found in `local/` are opened for querying; a block that fails to open is
    /// reported and skipped. A head directory left behind with a complete `meta.json` is
    /// moved into `local/` first. A fresh head is created for ingestion and the rotation
    /// thread is started.
    ///
    /// # Errors
    /// Returns an error if the data directories, the head or a thread cannot be created.
    pub fn open(cfg: DbConfig) -> Result<Self, DbError> {
        let events = cfg.event_listener.clone();
        let data = cfg.head.data_path.clone();
        fs::create_dir_all(data.join(HEAD_DIR))?;
        fs::create_dir_all(data.join(LOCAL_DIR))?;

        recover_flushed_heads(&data, &events)?;
        let blocks = open_blocks(&data.join(LOCAL_DIR), &events)?;

        let delta = Arc::new(DeltaTracker::new(&cfg.delta));
        let limiter: Arc<dyn Limiter> = Arc::new(SeriesLimiter::new(cfg.limits.clone()));
        let head = Head::new(cfg.head.clone(), delta.clone(), limiter.clone(), events.clone())?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.query_concurrency)
            .thread_name(|i| format!("profiledb-query-{}", i))
            .build()
            .map_err(|e| DbError::Internal(format!("query pool: {}", e)))?;

        let shared = Arc::new(DbShared {
            cfg,
            state: RwLock::new(DbState {
                head: Some(head),
                flushing: Vec::new(),
                blocks,
            }),
            delta,
            limiter,
            rotation: Mutex::new(()),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel::<DbCommand>();
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("profiledb-rotation".into())
            .spawn(move || {
                let interval = worker.cfg.rotation_check_interval;
                loop {
                    match cmd_rx.recv_timeout(interval) {
                        Ok(DbCommand::Rotate { ack }) => {
                            let _ = ack.send(worker.rotate(true));
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if worker.flush_requested() {
                                if let Err(error) = worker.rotate(true) {
                                    tracing::error!(%error, "head rotation failed");
                                }
                            }
                        }
                        Ok(DbCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            shared,
            pool,
            cmd_tx,
            handle: Some(handle),
        })
    }

    /// Ingests one profile into the current head.
    ///
    /// # Arguments
    /// * `profile` - The pprof-shaped profile; every sample type becomes its own series.
    /// * `id` - Identifier of the profile's first row.
    /// * `tenant` - Tenant the series limits are counted against.
    /// * `labels` - External labels; `__name__` is required.
    pub fn ingest(
        &self,
        profile: &Profile,
        id: ProfileId,
        tenant: &str,
        labels: &Labels,
    ) -> Result<(), DbError> {
        // a rotation may close the head between the lookup and the ingest
        for _ in 0..3 {
            let head = self.shared.current_head()?;
            match head.ingest(profile, id, labels, tenant) {
                Err(DbError::HeadClosed) => {
                    if let Some(current) = self.shared.state.read()?.head.as_ref() {
                        if !Arc::ptr_eq(current, &head) {
                            continue;
                        }
                    }
                    return Err(DbError::HeadClosed);
                }
                other => return other,
            }
        }
        Err(DbError::HeadClosed)
    }

    /// Flushes the current head into a block and starts a new head. Blocks until done.
    pub fn flush(&self) -> Result<(), DbError> {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(DbCommand::Rotate { ack: tx })
            .map_err(|e| DbError::BackgroundTaskError(format!("Failed to send rotate command: {}", e)))?;
        rx.recv()
            .map_err(|e| DbError::BackgroundTaskError(format!("Failed to receive rotate ack: {}", e)))?
    }

    /// Stops the rotation thread and flushes the last head. Ingest fails afterwards.
    pub fn close(&mut self) -> Result<(), DbError> {
        self.stop_rotation();
        self.shared.rotate(false)
    }

    fn stop_rotation(&mut self) {
        let _ = self.cmd_tx.send(DbCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                self.shared.cfg.event_listener.on_event(DbEvent::BackgroundThreadPanicked {
                    name: "profiledb-rotation".into(),
                });
            }
        }
    }

    pub fn head(&self) -> Result<Arc<Head>, DbError> {
        self.shared.current_head()
    }

    pub fn blocks(&self) -> Result<Vec<Arc<Block>>, DbError> {
        Ok(self.shared.state.read()?.blocks.clone())
    }

    pub fn delta_tracker(&self) -> &DeltaTracker {
        &self.shared.delta
    }

    /// Bytes held by heads that are not yet blocks.
    pub fn head_size(&self) -> Result<u64, DbError> {
        let state = self.shared.state.read()?;
        Ok(state
            .head
            .iter()
            .chain(state.flushing.iter())
            .map(|h| h.size())
            .sum())
    }

    /// Queriers for every source overlapping `[start, end]`, taken under one lock.
    pub fn queriers(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Arc<dyn Querier>>, DbError> {
        let state = self.shared.state.read()?;
        let events = &self.shared.cfg.event_listener;
        let mut out: Vec<Arc<dyn Querier>> = Vec::new();
        for block in &state.blocks {
            if block.meta().overlaps(start, end) {
                out.push(Arc::new(BlockQuerier::new(block.clone(), events.clone())));
            }
        }
        for head in state.flushing.iter().chain(state.head.iter()) {
            out.extend(head_queriers(head)?);
        }
        Ok(out)
    }

    fn hints(&self, req: &SelectRequest) -> MergeHints {
        req.hints.unwrap_or(self.shared.cfg.merge_hints)
    }

    pub fn select_matching_profiles(&self, req: &SelectRequest) -> Result<Vec<ProfileEntry>, DbError> {
        let params = req.params()?;
        let qs = self.queriers(req.start, req.end)?;
        let hints = self.hints(req);
        self.pool.install(|| {
            engine::select_matching_profiles(&qs, &params, &hints, &req.context)
        })
    }

    pub fn merge_by_stacktraces(&self, req: &SelectRequest) -> Result<Tree, DbError> {
        let params = req.params()?;
        let qs = self.queriers(req.start, req.end)?;
        let hints = self.hints(req);
        self.pool
            .install(|| engine::merge_by_stacktraces(&qs, &params, &hints, &req.context))
    }

    pub fn merge_by_labels(&self, req: &SelectRequest, by: &[&str]) -> Result<Vec<Series>, DbError> {
        let params = req.params()?;
        let by: Vec<String> = by.iter().map(|s| s.to_string()).collect();
        let qs = self.queriers(req.start, req.end)?;
        let hints = self.hints(req);
        self.pool.install(|| {
            engine::merge_by_labels(&qs, &params, &by, &hints, &req.context)
        })
    }

    /// Merged pprof profile; the request must name a profile type.
    pub fn merge_pprof(&self, req: &SelectRequest) -> Result<Profile, DbError> {
        let profile_type = req
            .profile_type
            .clone()
            .ok_or_else(|| DbError::InvalidSelector("pprof merge needs a profile type".into()))?;
        let params = SelectParams {
            matchers: parse_selector(&req.selector)?,
            start: req.start,
            end: req.end,
        };
        let qs = self.queriers(req.start, req.end)?;
        let hints = self.hints(req);
        self.pool.install(|| {
            engine::merge_pprof(&qs, &params, &profile_type, &hints, &req.context)
        })
    }

    pub fn merge_by_spans(&self, req: &SelectRequest, spans: &[u64]) -> Result<Tree, DbError> {
        let params = req.params()?;
        let qs = self.queriers(req.start, req.end)?;
        let hints = self.hints(req);
        self.pool.install(|| {
            engine::merge_by_spans(&qs, &params, spans, &hints, &req.context)
        })
    }

    pub fn label_names(&self, selector: &str) -> Result<Vec<String>, DbError> {
        let matchers = parse_selector(selector)?;
        let qs = self.queriers(Timestamp::MIN, Timestamp::MAX)?;
        self.pool
            .install(|| engine::label_names(&qs, &matchers, &QueryContext::new()))
    }

    pub fn label_values(&self, name: &str, selector: &str) -> Result<Vec<String>, DbError> {
        let matchers = parse_selector(selector)?;
        let qs = self.queriers(Timestamp::MIN, Timestamp::MAX)?;
        self.pool
            .install(|| engine::label_values(&qs, name, &matchers, &QueryContext::new()))
    }

    pub fn profile_types(&self) -> Result<Vec<ProfileType>, DbError> {
        let qs = self.queriers(Timestamp::MIN, Timestamp::MAX)?;
        self.pool
            .install(|| engine::profile_types(&qs, &QueryContext::new()))
    }

    /// Label sets matching any of `selectors`.
    pub fn series(&self, selectors: &[&str]) -> Result<Vec<Labels>, DbError> {
        let parsed = selectors
            .iter()
            .map(|s| parse_selector(s))
            .collect::<Result<Vec<_>, _>>()?;
        let qs = self.queriers(Timestamp::MIN, Timestamp::MAX)?;
        self.pool
            .install(|| engine::series(&qs, &parsed, &QueryContext::new()))
    }
}

impl Drop for ProfileDb {
    fn drop(&mut self) {
        self.stop_rotation();
    }
}

impl DbShared {
    fn current_head(&self) -> Result<Arc<Head>, DbError> {
        self.state.read()?.head.clone().ok_or(DbError::HeadClosed)
    }

    fn flush_requested(&self) -> bool {
        self.current_head().map_or(false, |h| h.flush_requested())
    }

    /// Swaps out the current head (for a fresh one when `replace`), then flushes every
    /// swapped-out head and replaces it with its block.
    fn rotate(&self, replace: bool) -> Result<(), DbError> {
        let _rotation = self.rotation.lock()?;
        let events = &self.cfg.event_listener;

        let fresh = if replace {
            Some(Head::new(
                self.cfg.head.clone(),
                self.delta.clone(),
                self.limiter.clone(),
                events.clone(),
            )?)
        } else {
            None
        };
        let pending = {
            let mut state = self.state.write()?;
            if let Some(old) = std::mem::replace(&mut state.head, fresh) {
                state.flushing.push(old);
            }
            state.flushing.clone()
        };

        // older failures are retried first
        for head in pending {
            head.flush()?;
            let mut state = self.state.write()?;
            let moved = head.move_to_local()?;
            state.flushing.retain(|h| !Arc::ptr_eq(h, &head));
            if let Some(path) = moved {
                match Block::open(&path) {
                    Ok(block) => {
                        events.on_event(DbEvent::BlockOpened {
                            block: block.meta().id.to_string(),
                            path,
                        });
                        state.blocks.push(block);
                    }
                    Err(e) => {
                        events.on_event(DbEvent::BlockOpenFailed {
                            path,
                            error: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
            drop(state);
            head.close()?;
        }
        Ok(())
    }
}

/// Moves head directories that were flushed but not moved before a restart.
fn recover_flushed_heads(data: &Path, events: &Arc<dyn DbEventListener>) -> Result<(), DbError> {
    for entry in fs::read_dir(data.join(HEAD_DIR))? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        if path.join(META_FILE).exists() {
            let target = data.join(LOCAL_DIR).join(name);
            fs::rename(&path, &target)?;
            events.on_event(DbEvent::HeadMoved {
                head: name.to_string_lossy().into_owned(),
                path: target,
            });
        } else {
            tracing::warn!(path = %path.display(), "ignoring head directory without block metadata");
        }
    }
    Ok(())
}

fn open_blocks(local: &Path, events: &Arc<dyn DbEventListener>) -> Result<Vec<Arc<Block>>, DbError> {
    let mut blocks = Vec::new();
    for entry in fs::read_dir(local)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match Block::open(&path) {
            Ok(block) => {
                events.on_event(DbEvent::BlockOpened {
                    block: block.meta().id.to_string(),
                    path,
                });
                blocks.push(block);
            }
            Err(e) => events.on_event(DbEvent::BlockOpenFailed {
                path,
                error: e.to_string(),
            }),
        }
    }
    blocks.sort_by_key(|b| (b.meta().min_time, b.meta().id));
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DEFAULT_TENANT;
    use crate::symbols::tests::cpu_profile;
    use std::time::Instant;
    use tempfile::TempDir;

    fn config(dir: &Path) -> DbConfig {
        DbConfig {
            head: HeadConfig {
                data_path: dir.to_path_buf(),
                ..Default::default()
            },
            rotation_check_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn ingest(db: &ProfileDb, t: i64) {
        let labels = Labels::from_pairs(&[("__name__", "process_cpu"), ("job", "a")]);
        db.ingest(&cpu_profile(&[(&["b", "a"], 1)], t), uuid::Uuid::new_v4(), DEFAULT_TENANT, &labels)
            .unwrap();
    }

    #[test]
    fn flush_rotates_the_head_into_a_block() {
        let dir = TempDir::new().unwrap();
        let db = ProfileDb::open(config(dir.path())).unwrap();
        let first = db.head().unwrap();
        ingest(&db, 1);
        db.flush().unwrap();

        assert!(!Arc::ptr_eq(&first, &db.head().unwrap()));
        assert_eq!(db.blocks().unwrap().len(), 1);
        ingest(&db, 2);
        let tree = db.merge_by_stacktraces(&SelectRequest::new("", 0, 10)).unwrap();
        assert_eq!(tree.total(), 2);
    }

    #[test]
    fn duration_trigger_rotates_in_the_background() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.head.max_block_duration = Duration::from_millis(20);
        cfg.head.size_check_interval = Duration::from_millis(5);
        let db = ProfileDb::open(cfg).unwrap();
        ingest(&db, 1);

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.blocks().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "head was not rotated");
            thread::sleep(Duration::from_millis(5));
        }
        let tree = db.merge_by_stacktraces(&SelectRequest::new("", 0, 10)).unwrap();
        assert_eq!(tree.total(), 1);
    }

    #[test]
    fn blocks_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut db = ProfileDb::open(config(dir.path())).unwrap();
            ingest(&db, 5);
            db.close().unwrap();
            let labels = Labels::from_pairs(&[("__name__", "process_cpu")]);
            assert!(db
                .ingest(&cpu_profile(&[(&["a"], 1)], 6), uuid::Uuid::new_v4(), DEFAULT_TENANT, &labels)
                .is_err());
        }
        let db = ProfileDb::open(config(dir.path())).unwrap();
        assert_eq!(db.blocks().unwrap().len(), 1);
        assert_eq!(db.label_values("job", "").unwrap(), vec!["a"]);
        assert_eq!(db.profile_types().unwrap().len(), 1);
    }
}
