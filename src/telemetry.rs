use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// The engine never prints. Callers choose where events go: [`TracingEventListener`]
/// forwards them to `tracing`, [`NoopEventListener`] drops them.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Why a head asked to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    MaxDuration,
    MaxSize,
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum DbEvent {
    BackgroundLoopStarted { head: String },
    BackgroundLoopStopping { head: String },
    BackgroundThreadPanicked { name: String },

    HeadCreated { head: String, path: PathBuf },
    ProfileDiscarded { reason: &'static str, error: String },
    FlushSignalled { head: String, reason: FlushReason },

    RowGroupCut { head: String, row_group: usize, rows: u64, duration: Duration },
    RowGroupCutFailed { head: String, error: String },

    HeadFlushed {
        head: String,
        profiles: u64,
        series: u64,
        samples: u64,
        duration: Duration,
    },
    HeadFlushSkippedEmpty { head: String },
    HeadFlushFailed { head: String, error: String },
    HeadMoved { head: String, path: PathBuf },

    BlockOpened { block: String, path: PathBuf },
    BlockOpenFailed { path: PathBuf, error: String },

    PartitionResolveFailed { partition: u64, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl DbEventListener for TracingEventListener {
    fn on_event(&self, event: DbEvent) {
        match event {
            DbEvent::BackgroundLoopStarted { head } => {
                tracing::debug!(%head, "head background loop started")
            }
            DbEvent::BackgroundLoopStopping { head } => {
                tracing::debug!(%head, "head background loop stopping")
            }
            DbEvent::BackgroundThreadPanicked { name } => {
                tracing::error!(%name, "background thread panicked")
            }
            DbEvent::HeadCreated { head, path } => {
                tracing::info!(%head, path = %path.display(), "head created")
            }
            DbEvent::ProfileDiscarded { reason, error } => {
                tracing::debug!(reason, %error, "profile discarded")
            }
            DbEvent::FlushSignalled { head, reason } => {
                tracing::info!(%head, ?reason, "head flush signalled")
            }
            DbEvent::RowGroupCut {
                head,
                row_group,
                rows,
                duration,
            } => {
                tracing::debug!(%head, row_group, rows, ?duration, "row group cut")
            }
            DbEvent::RowGroupCutFailed { head, error } => {
                tracing::error!(%head, %error, "row group cut failed")
            }
            DbEvent::HeadFlushed {
                head,
                profiles,
                series,
                samples,
                duration,
            } => {
                tracing::info!(%head, profiles, series, samples, ?duration, "head flushed")
            }
            DbEvent::HeadFlushSkippedEmpty { head } => {
                tracing::info!(%head, "head empty, nothing to flush")
            }
            DbEvent::HeadFlushFailed { head, error } => {
                tracing::error!(%head, %error, "head flush failed")
            }
            DbEvent::HeadMoved { head, path } => {
                tracing::info!(%head, path = %path.display(), "head moved to local blocks")
            }
            DbEvent::BlockOpened { block, path } => {
                tracing::debug!(%block, path = %path.display(), "block opened")
            }
            DbEvent::BlockOpenFailed { path, error } => {
                tracing::warn!(path = %path.display(), %error, "block could not be opened")
            }
            DbEvent::PartitionResolveFailed { partition, error } => {
                tracing::warn!(partition, %error, "skipping stacktrace partition")
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics instrumentation, recorded where the measured work happens and independent of
/// the configured event listener.
///
/// Emitting is a no-op until the embedding process installs a `metrics` recorder.
pub mod db_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    // Counters are exposed as `<name>_total` by Prometheus exporters.
    pub const INGESTED_PROFILES: &str = "profiledb_head_ingested_profiles";
    pub const INGESTED_SAMPLES: &str = "profiledb_head_ingested_samples";
    pub const DISCARDED_PROFILES: &str = "profiledb_discarded_profiles";
    pub const ROW_GROUP_CUTS: &str = "profiledb_row_group_cut_rows";
    pub const ROW_GROUP_CUT_DURATION_SECONDS: &str = "profiledb_row_group_cut_duration_seconds";
    pub const HEAD_FLUSH_DURATION_SECONDS: &str = "profiledb_head_flush_duration_seconds";
    pub const HEAD_FLUSHED_PROFILES: &str = "profiledb_head_flushed_profiles";
    pub const HEAD_SIZE_BYTES: &str = "profiledb_head_size_bytes";
    pub const QUERY_DURATION_SECONDS: &str = "profiledb_query_duration_seconds";

    #[inline]
    pub fn record_ingest(profiles: u64, samples: u64) {
        if profiles > 0 {
            ::metrics::counter!(INGESTED_PROFILES).increment(profiles);
        }
        if samples > 0 {
            ::metrics::counter!(INGESTED_SAMPLES).increment(samples);
        }
    }

    #[inline]
    pub fn record_discarded(reason: &'static str) {
        ::metrics::counter!(DISCARDED_PROFILES, "reason" => reason).increment(1);
    }

    #[inline]
    pub fn record_row_group_cut(duration: Duration, rows: u64) {
        ::metrics::histogram!(ROW_GROUP_CUT_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::counter!(ROW_GROUP_CUTS).increment(rows);
    }

    #[inline]
    pub fn record_head_flush(duration: Duration, profiles: u64) {
        ::metrics::histogram!(HEAD_FLUSH_DURATION_SECONDS).record(duration.as_secs_f64());
        if profiles > 0 {
            ::metrics::counter!(HEAD_FLUSHED_PROFILES).increment(profiles);
        }
    }

    #[inline]
    pub fn set_head_size(bytes: u64) {
        ::metrics::gauge!(HEAD_SIZE_BYTES).set(bytes as f64);
    }

    #[inline]
    pub fn record_query(kind: &'static str, duration: Duration) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS, "kind" => kind).record(duration.as_secs_f64());
    }

    /// Registers descriptions with the installed recorder.
    pub fn describe_all() {
        describe_counter!(INGESTED_PROFILES, Unit::Count, "Profile rows ingested into the head.");
        describe_counter!(INGESTED_SAMPLES, Unit::Count, "Samples ingested into the head.");
        describe_counter!(
            DISCARDED_PROFILES,
            Unit::Count,
            "Profiles rejected at ingest, labelled by reason."
        );
        describe_counter!(ROW_GROUP_CUTS, Unit::Count, "Rows moved from memory to row groups.");

        describe_histogram!(
            ROW_GROUP_CUT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to sort and write one row group."
        );
        describe_histogram!(
            HEAD_FLUSH_DURATION_SECONDS,
            Unit::Seconds,
            "Time to flush a head into a block."
        );
        describe_counter!(HEAD_FLUSHED_PROFILES, Unit::Count, "Profile rows written by head flushes.");
        describe_histogram!(QUERY_DURATION_SECONDS, Unit::Seconds, "Query latency by kind.");

        describe_gauge!(HEAD_SIZE_BYTES, Unit::Bytes, "Estimated size of the active head.");
    }
}


/// A `metrics` recorder for tests that sums counters and counts histogram records.
#[cfg(test)]
pub(crate) mod testing {
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
        SharedString, Unit,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Cell(AtomicU64);

    impl CounterFn for Cell {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::Relaxed);
        }
        fn absolute(&self, value: u64) {
            self.0.fetch_max(value, Ordering::Relaxed);
        }
    }

    impl HistogramFn for Cell {
        fn record(&self, _value: f64) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Metrics are keyed as `name` or `name{k=v,...}`.
    #[derive(Debug, Default)]
    pub(crate) struct CountingRecorder {
        cells: Mutex<HashMap<String, Arc<Cell>>>,
    }

    impl CountingRecorder {
        fn cell(&self, key: &Key) -> Arc<Cell> {
            let labels: Vec<String> = key
                .labels()
                .map(|l| format!("{}={}", l.key(), l.value()))
                .collect();
            let name = if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            };
            self.cells.lock().unwrap().entry(name).or_default().clone()
        }

        pub(crate) fn get(&self, name: &str) -> u64 {
            self.cells
                .lock()
                .unwrap()
                .get(name)
                .map_or(0, |c| c.0.load(Ordering::Relaxed))
        }
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.cell(key))
        }
        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }
        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::from_arc(self.cell(key))
        }
    }
}
