//! Delta tracker: turns cumulative sample values into per-interval increments.
//!
//! For each series the tracker remembers the last cumulative value per stacktrace. The
//! first observation of a series only establishes the baseline. A decrease of any value is
//! a counter reset: the baseline is replaced and nothing is emitted for that generation.
//! Tracked series are bounded; the least recently updated series is evicted first and
//! starts over from a fresh baseline when it shows up again.

use crate::error::DbError;
use crate::labels::{Fingerprint, Labels, LABEL_NAME_DELTA, LABEL_NAME_METRIC, LABEL_NAME_TYPE};
use crate::types::Samples;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Sample types of the `memory` profile that are reported as running totals.
const CUMULATIVE_MEMORY_TYPES: [&str; 2] = ["alloc_objects", "alloc_space"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Upper bound on tracked series.
    pub max_series: usize,
    /// Extra `__type__` values treated as cumulative for any profile name.
    pub cumulative_types: Vec<String>,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            max_series: 100_000,
            cumulative_types: Vec::new(),
        }
    }
}

impl DeltaConfig {
    /// Whether rows of the series `labels` carry cumulative values.
    pub fn is_cumulative(&self, labels: &Labels) -> bool {
        if labels.get(LABEL_NAME_DELTA) == Some("false") {
            return false;
        }
        let Some(sample_type) = labels.get(LABEL_NAME_TYPE) else {
            return false;
        };
        if self.cumulative_types.iter().any(|t| t == sample_type) {
            return true;
        }
        labels.get(LABEL_NAME_METRIC) == Some("memory")
            && CUMULATIVE_MEMORY_TYPES.contains(&sample_type)
    }
}

struct SeriesState {
    partition: u64,
    last: FxHashMap<u32, u64>,
    stamp: u64,
}

#[derive(Default)]
struct DeltaInner {
    series: FxHashMap<Fingerprint, SeriesState>,
    /// Update stamp -> series, oldest first.
    recency: BTreeMap<u64, Fingerprint>,
    clock: u64,
    evicted: u64,
}

impl DeltaInner {
    fn seed(&mut self, fp: Fingerprint, partition: u64, values: FxHashMap<u32, u64>, max_series: usize) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(old) = self.series.insert(
            fp,
            SeriesState {
                partition,
                last: values,
                stamp,
            },
        ) {
            self.recency.remove(&old.stamp);
        }
        self.recency.insert(stamp, fp);

        while self.series.len() > max_series.max(1) {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.series.remove(&victim);
            self.evicted += 1;
        }
    }

    fn touch(&mut self, fp: Fingerprint) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(state) = self.series.get_mut(&fp) {
            self.recency.remove(&state.stamp);
            state.stamp = stamp;
            self.recency.insert(stamp, fp);
        }
    }
}

pub struct DeltaTracker {
    cfg: DeltaConfig,
    inner: Mutex<DeltaInner>,
}

impl DeltaTracker {
    pub fn new(cfg: &DeltaConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            inner: Mutex::new(DeltaInner::default()),
        }
    }

    pub fn is_cumulative(&self, labels: &Labels) -> bool {
        self.cfg.is_cumulative(labels)
    }

    /// Converts a cumulative sample set of series `fp` into increments since its previous
    /// observation. Returns an empty set for a first observation or a counter reset. Span
    /// ids are not kept: values are tracked per stacktrace.
    pub fn compute_delta(
        &self,
        fp: Fingerprint,
        partition: u64,
        samples: &Samples,
    ) -> Result<Samples, DbError> {
        let mut current: FxHashMap<u32, u64> = FxHashMap::default();
        let mut order: Vec<u32> = Vec::with_capacity(samples.len());
        for (st, v) in samples.stacktrace_ids.iter().zip(&samples.values) {
            let slot = current.entry(*st).or_insert_with(|| {
                order.push(*st);
                0
            });
            *slot = slot.saturating_add(*v);
        }

        let mut inner = self.inner.lock()?;
        let reset = match inner.series.get(&fp) {
            None => true,
            Some(state) if state.partition != partition => true,
            Some(state) => current
                .iter()
                .any(|(st, v)| state.last.get(st).map_or(false, |last| v < last)),
        };
        if reset {
            inner.seed(fp, partition, current, self.cfg.max_series);
            return Ok(Samples::default());
        }

        let mut out = Samples::default();
        if let Some(state) = inner.series.get_mut(&fp) {
            for st in order {
                let v = current[&st];
                let last = state.last.insert(st, v).unwrap_or(0);
                out.stacktrace_ids.push(st);
                out.values.push(v - last);
            }
        }
        inner.touch(fp);
        Ok(out)
    }

    pub fn tracked_series(&self) -> Result<usize, DbError> {
        Ok(self.inner.lock()?.series.len())
    }

    /// Series dropped to honour the size bound.
    pub fn evicted_series(&self) -> Result<u64, DbError> {
        Ok(self.inner.lock()?.evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(pairs: &[(u32, u64)]) -> Samples {
        Samples {
            stacktrace_ids: pairs.iter().map(|p| p.0).collect(),
            values: pairs.iter().map(|p| p.1).collect(),
            span_ids: vec![],
        }
    }

    #[test]
    fn reset_reseeds_and_emits_nothing() {
        let t = DeltaTracker::new(&DeltaConfig::default());
        let emitted: Vec<Vec<u64>> = [5u64, 8, 8, 3, 10]
            .iter()
            .map(|v| t.compute_delta(1, 0, &samples(&[(7, *v)])).unwrap().values)
            .collect();
        // 3 < 8 resets and re-seeds the baseline at 3, so 10 deltas against 3
        assert_eq!(emitted, vec![vec![], vec![3], vec![0], vec![], vec![7]]);
    }

    #[test]
    fn new_stacktraces_count_from_zero() {
        let t = DeltaTracker::new(&DeltaConfig::default());
        t.compute_delta(1, 0, &samples(&[(1, 10)])).unwrap();
        let d = t.compute_delta(1, 0, &samples(&[(1, 12), (2, 4)])).unwrap();
        assert_eq!(d.stacktrace_ids, vec![1, 2]);
        assert_eq!(d.values, vec![2, 4]);
    }

    #[test]
    fn series_are_independent_and_partition_changes_reseed() {
        let t = DeltaTracker::new(&DeltaConfig::default());
        t.compute_delta(1, 0, &samples(&[(1, 10)])).unwrap();
        assert!(t.compute_delta(2, 0, &samples(&[(1, 50)])).unwrap().is_empty());
        assert_eq!(t.compute_delta(1, 0, &samples(&[(1, 11)])).unwrap().values, vec![1]);
        assert!(t.compute_delta(1, 9, &samples(&[(1, 20)])).unwrap().is_empty());
        assert_eq!(t.compute_delta(1, 9, &samples(&[(1, 25)])).unwrap().values, vec![5]);
    }

    #[test]
    fn least_recently_updated_series_is_evicted() {
        let t = DeltaTracker::new(&DeltaConfig {
            max_series: 2,
            ..Default::default()
        });
        t.compute_delta(1, 0, &samples(&[(1, 1)])).unwrap();
        t.compute_delta(2, 0, &samples(&[(1, 1)])).unwrap();
        t.compute_delta(1, 0, &samples(&[(1, 2)])).unwrap();
        t.compute_delta(3, 0, &samples(&[(1, 1)])).unwrap();
        assert_eq!(t.tracked_series().unwrap(), 2);
        assert_eq!(t.evicted_series().unwrap(), 1);
        // series 2 was evicted and starts over
        assert!(t.compute_delta(2, 0, &samples(&[(1, 5)])).unwrap().is_empty());
        assert_eq!(t.compute_delta(3, 0, &samples(&[(1, 4)])).unwrap().values, vec![3]);
    }

    #[test]
    fn cumulative_detection() {
        let cfg = DeltaConfig::default();
        let heap = Labels::from_pairs(&[("__name__", "memory"), ("__type__", "alloc_space")]);
        assert!(cfg.is_cumulative(&heap));
        assert!(!cfg.is_cumulative(&heap.with("__delta__", "false")));
        let inuse = Labels::from_pairs(&[("__name__", "memory"), ("__type__", "inuse_space")]);
        assert!(!cfg.is_cumulative(&inuse));

        let custom = DeltaConfig {
            cumulative_types: vec!["contentions".into()],
            ..Default::default()
        };
        let mutex = Labels::from_pairs(&[("__name__", "mutex"), ("__type__", "contentions")]);
        assert!(custom.is_cumulative(&mutex));
        assert!(!cfg.is_cumulative(&mutex));
    }
}
