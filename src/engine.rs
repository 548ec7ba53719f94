//! Multi-source query execution.
//!
//! Sources are selected in parallel (rayon), each producing entries sorted by series label
//! order and time. With deduplication enabled the per-source streams go through one
//! k-way merge that keeps, for every (series, timestamp), the rows of a single source;
//! the surviving rows are then merged by the source that produced them. Without it every
//! source merges its own rows and the partial results are summed, so replicas of the same
//! data are counted once per copy.

use crate::error::DbError;
use crate::labels::{Fingerprint, Labels, ProfileType};
use crate::merge::{LoserTree, QueryContext};
use crate::querier::{Point, ProfileEntry, Querier, SelectParams, Series};
use crate::selector::{profile_type_matcher, Matcher};
use crate::telemetry::db_metrics;
use crate::tree::Tree;
use crate::types::{Profile, Timestamp};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeHints {
    /// Drop rows of a (series, timestamp) already seen from another source.
    pub deduplicate: bool,
}

impl Default for MergeHints {
    fn default() -> Self {
        Self { deduplicate: true }
    }
}

fn series_order(a: &ProfileEntry, b: &ProfileEntry) -> Ordering {
    a.labels
        .cmp(&b.labels)
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.row.id.cmp(&b.row.id))
}

fn check_range(params: &SelectParams) -> Result<(), DbError> {
    if params.start > params.end {
        return Err(DbError::InvalidTimeRange {
            start: params.start,
            end: params.end,
        });
    }
    Ok(())
}

/// Adds the profile-type matcher to `params`.
pub fn with_profile_type(params: &SelectParams, profile_type: &ProfileType) -> SelectParams {
    let mut out = params.clone();
    out.matchers.push(profile_type_matcher(profile_type));
    out
}

/// Entries of every source, each list sorted in series order and tagged with its source.
fn select_per_source(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    ctx: &QueryContext,
) -> Result<Vec<Vec<ProfileEntry>>, DbError> {
    check_range(params)?;
    ctx.check()?;
    queriers
        .par_iter()
        .enumerate()
        .map(|(source, q)| -> Result<Vec<ProfileEntry>, DbError> {
            ctx.check()?;
            if !q.in_range(params.start, params.end)? {
                return Ok(Vec::new());
            }
            let mut entries = q.select_matching_profiles(params)?;
            for e in entries.iter_mut() {
                e.source = source;
            }
            entries.sort_by(series_order);
            Ok(entries)
        })
        .collect()
}

/// Merges per-source entries into one series-ordered stream, keeping the rows of one
/// source per (series, timestamp) when `deduplicate` is set.
fn merge_sources(
    per_source: Vec<Vec<ProfileEntry>>,
    deduplicate: bool,
    ctx: &QueryContext,
) -> Result<Vec<ProfileEntry>, DbError> {
    let total = per_source.iter().map(Vec::len).sum();
    let sources: Vec<_> = per_source
        .into_iter()
        .map(|v| v.into_iter().map(Ok::<ProfileEntry, DbError>))
        .collect();
    let merged = LoserTree::new(sources, |a: &ProfileEntry, b: &ProfileEntry| {
        series_order(a, b) == Ordering::Less
    })
    .with_context(ctx.clone());

    let mut out = Vec::with_capacity(total);
    let mut kept: Option<(Fingerprint, Timestamp, usize)> = None;
    for e in merged {
        let e = e?;
        if deduplicate {
            match kept {
                Some((fp, ts, source)) if fp == e.fingerprint && ts == e.timestamp => {
                    if source != e.source {
                        continue;
                    }
                }
                _ => kept = Some((e.fingerprint, e.timestamp, e.source)),
            }
        }
        out.push(e);
    }
    Ok(out)
}

/// Entries each source should merge itself, after cross-source deduplication if requested.
fn entries_by_source(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    hints: &MergeHints,
    ctx: &QueryContext,
) -> Result<Vec<Vec<ProfileEntry>>, DbError> {
    let per_source = select_per_source(queriers, params, ctx)?;
    if !hints.deduplicate {
        return Ok(per_source);
    }
    let mut out: Vec<Vec<ProfileEntry>> = vec![Vec::new(); queriers.len()];
    for e in merge_sources(per_source, true, ctx)? {
        let source = e.source;
        out[source].push(e);
    }
    Ok(out)
}

/// Runs `f` on every source with entries, in parallel.
fn merge_each_source<R: Send>(
    queriers: &[Arc<dyn Querier>],
    entries: Vec<Vec<ProfileEntry>>,
    ctx: &QueryContext,
    f: impl Fn(&dyn Querier, &[ProfileEntry]) -> Result<R, DbError> + Sync + Send,
) -> Result<Vec<R>, DbError> {
    queriers
        .par_iter()
        .zip(entries.into_par_iter())
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(q, mut entries)| -> Result<R, DbError> {
            ctx.check()?;
            q.sort(&mut entries);
            f(q.as_ref(), &entries)
        })
        .collect()
}

/// Every matching row, in series order then time.
pub fn select_matching_profiles(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    hints: &MergeHints,
    ctx: &QueryContext,
) -> Result<Vec<ProfileEntry>, DbError> {
    let started = Instant::now();
    let per_source = select_per_source(queriers, params, ctx)?;
    let out = merge_sources(per_source, hints.deduplicate, ctx)?;
    db_metrics::record_query("select", started.elapsed());
    Ok(out)
}

pub fn merge_by_stacktraces(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    hints: &MergeHints,
    ctx: &QueryContext,
) -> Result<Tree, DbError> {
    let started = Instant::now();
    let entries = entries_by_source(queriers, params, hints, ctx)?;
    let trees = merge_each_source(queriers, entries, ctx, |q, e| q.merge_by_stacktraces(e))?;
    let mut out = Tree::new();
    for t in &trees {
        out.merge(t);
    }
    db_metrics::record_query("merge_by_stacktraces", started.elapsed());
    Ok(out)
}

/// Values per label subset `by`, summed per timestamp across sources.
pub fn merge_by_labels(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    by: &[String],
    hints: &MergeHints,
    ctx: &QueryContext,
) -> Result<Vec<Series>, DbError> {
    let started = Instant::now();
    let entries = entries_by_source(queriers, params, hints, ctx)?;
    let partial = merge_each_source(queriers, entries, ctx, |q, e| q.merge_by_labels(e, by))?;

    let mut acc: BTreeMap<Labels, BTreeMap<Timestamp, u64>> = BTreeMap::new();
    for series in partial.into_iter().flatten() {
        let points = acc.entry(series.labels).or_default();
        for p in series.points {
            let slot = points.entry(p.timestamp).or_insert(0);
            *slot = slot.saturating_add(p.value);
        }
    }
    db_metrics::record_query("merge_by_labels", started.elapsed());
    Ok(acc
        .into_iter()
        .map(|(labels, points)| Series {
            labels,
            points: points
                .into_iter()
                .map(|(timestamp, value)| Point { timestamp, value })
                .collect(),
        })
        .collect())
}

/// A single pprof profile of `profile_type` merged from every matching row.
pub fn merge_pprof(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    profile_type: &ProfileType,
    hints: &MergeHints,
    ctx: &QueryContext,
) -> Result<Profile, DbError> {
    let started = Instant::now();
    let params = with_profile_type(params, profile_type);
    let entries = entries_by_source(queriers, &params, hints, ctx)?;
    let builders = merge_each_source(queriers, entries, ctx, |q, e| q.merge_pprof(e, profile_type))?;
    let mut out = crate::pprof::PprofBuilder::new(profile_type.clone());
    for b in &builders {
        out.merge(b);
    }
    db_metrics::record_query("merge_pprof", started.elapsed());
    Ok(out.build())
}

/// Tree of the samples attributed to one of `spans`.
pub fn merge_by_spans(
    queriers: &[Arc<dyn Querier>],
    params: &SelectParams,
    spans: &[u64],
    hints: &MergeHints,
    ctx: &QueryContext,
) -> Result<Tree, DbError> {
    let started = Instant::now();
    let entries = entries_by_source(queriers, params, hints, ctx)?;
    let trees = merge_each_source(queriers, entries, ctx, |q, e| q.merge_by_spans(e, spans))?;
    let mut out = Tree::new();
    for t in &trees {
        out.merge(t);
    }
    db_metrics::record_query("merge_by_spans", started.elapsed());
    Ok(out)
}

/// Sorted union of a per-source string list.
fn union(
    queriers: &[Arc<dyn Querier>],
    ctx: &QueryContext,
    f: impl Fn(&dyn Querier) -> Result<Vec<String>, DbError> + Sync + Send,
) -> Result<Vec<String>, DbError> {
    ctx.check()?;
    let lists: Vec<Vec<String>> = queriers
        .par_iter()
        .map(|q| f(q.as_ref()))
        .collect::<Result<_, _>>()?;
    let set: BTreeSet<String> = lists.into_iter().flatten().collect();
    Ok(set.into_iter().collect())
}

pub fn label_names(
    queriers: &[Arc<dyn Querier>],
    matchers: &[Matcher],
    ctx: &QueryContext,
) -> Result<Vec<String>, DbError> {
    union(queriers, ctx, |q| q.label_names(matchers))
}

pub fn label_values(
    queriers: &[Arc<dyn Querier>],
    name: &str,
    matchers: &[Matcher],
    ctx: &QueryContext,
) -> Result<Vec<String>, DbError> {
    union(queriers, ctx, |q| q.label_values(name, matchers))
}

pub fn profile_types(
    queriers: &[Arc<dyn Querier>],
    ctx: &QueryContext,
) -> Result<Vec<ProfileType>, DbError> {
    ctx.check()?;
    let lists: Vec<Vec<ProfileType>> = queriers
        .par_iter()
        .map(|q| q.profile_types())
        .collect::<Result<_, _>>()?;
    let set: BTreeSet<ProfileType> = lists.into_iter().flatten().collect();
    Ok(set.into_iter().collect())
}

/// Unique label sets matching any of `selectors`, sorted.
pub fn series(
    queriers: &[Arc<dyn Querier>],
    selectors: &[Vec<Matcher>],
    ctx: &QueryContext,
) -> Result<Vec<Labels>, DbError> {
    ctx.check()?;
    let all: Vec<Vec<Matcher>> = if selectors.is_empty() {
        vec![Vec::new()]
    } else {
        selectors.to_vec()
    };
    let lists: Vec<Vec<Labels>> = queriers
        .par_iter()
        .map(|q| -> Result<Vec<Labels>, DbError> {
            let mut out = Vec::new();
            for matchers in &all {
                out.extend(q.series(matchers)?);
            }
            Ok(out)
        })
        .collect::<Result<_, _>>()?;
    let set: BTreeSet<Labels> = lists.into_iter().flatten().collect();
    Ok(set.into_iter().collect())
}
