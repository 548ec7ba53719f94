//! Query sources.
//!
//! Every place rows can live is a [`Querier`]: the in-memory rows of a head, one on-disk row
//! group of a head, or a flushed block. All of them select rows the same way and share the
//! merge implementations, which only need the source's symbols through a [`Symbolizer`].

use crate::block::Block;
use crate::error::DbError;
use crate::head::{Head, HeadState};
use crate::labels::{Fingerprint, Labels, ProfileType, LABEL_NAME_PROFILE_TYPE};
use crate::partition::StacktracePartitions;
use crate::pprof::{PprofBuilder, ResolvedFunction, ResolvedLocation, ResolvedMapping};
use crate::profile_store::SeriesRows;
use crate::selector::Matcher;
use crate::symbols::{SymbolTables, SymbolsView, NO_MAPPING};
use crate::telemetry::{DbEvent, DbEventListener};
use crate::tree::Tree;
use crate::types::{ProfileRow, Timestamp};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One selected row and the series it belongs to.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub labels: Arc<Labels>,
    pub fingerprint: Fingerprint,
    pub timestamp: Timestamp,
    pub row: Arc<ProfileRow>,
    /// Position of the querier that produced the entry.
    pub source: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SelectParams {
    pub matchers: Vec<Matcher>,
    /// Inclusive bounds in nanoseconds.
    pub start: Timestamp,
    pub end: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: u64,
}

/// Values of one label subset over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub labels: Labels,
    pub points: Vec<Point>,
}

/// stacktrace partition -> stacktrace id -> summed value
type PartitionTotals = BTreeMap<u64, FxHashMap<u32, u64>>;

fn partition_totals<'e>(
    entries: impl IntoIterator<Item = &'e ProfileEntry>,
    keep_span: impl Fn(u64) -> bool,
) -> PartitionTotals {
    let mut out = PartitionTotals::new();
    for e in entries {
        let s = &e.row.samples;
        let totals = out.entry(e.row.stacktrace_partition).or_default();
        for i in 0..s.len() {
            if !keep_span(s.span_ids.get(i).copied().unwrap_or(0)) {
                continue;
            }
            let slot = totals.entry(s.stacktrace_ids[i]).or_insert(0);
            *slot = slot.saturating_add(s.values[i]);
        }
    }
    out
}

/// Resolves stacktrace ids of one source into function names or pprof locations.
///
/// Partitions are resolved in parallel. A partition that fails to resolve is reported
/// through a `PartitionResolveFailed` event and left out of the result.
pub struct Symbolizer<'a> {
    pub symbols: &'a SymbolTables,
    pub partitions: &'a StacktracePartitions,
    pub events: &'a Arc<dyn DbEventListener>,
}

impl Symbolizer<'_> {
    fn skip_partition(&self, partition: u64, error: &DbError) {
        tracing::warn!(partition, %error, "stacktrace partition left out of merge");
        self.events.on_event(DbEvent::PartitionResolveFailed {
            partition,
            error: error.to_string(),
        });
    }

    fn partition_tree(
        &self,
        view: &SymbolsView<'_>,
        partition: u64,
        totals: &FxHashMap<u32, u64>,
    ) -> Result<Tree, DbError> {
        let mut ids: Vec<u32> = totals.keys().copied().collect();
        ids.sort_unstable();
        let stacks = self.partitions.resolve_stacktrace_locations(partition, &ids)?;
        let mut tree = Tree::new();
        for (id, stack) in ids.iter().zip(stacks) {
            tree.insert_stack(&view.frames(&stack)?, totals[id]);
        }
        Ok(tree)
    }

    fn tree(&self, totals: &PartitionTotals) -> Result<Tree, DbError> {
        let view = self.symbols.view()?;
        let trees: Vec<Tree> = totals
            .par_iter()
            .filter_map(|(partition, st)| match self.partition_tree(&view, *partition, st) {
                Ok(t) => Some(t),
                Err(e) => {
                    self.skip_partition(*partition, &e);
                    None
                }
            })
            .collect();
        let mut out = Tree::new();
        for t in &trees {
            out.merge(t);
        }
        Ok(out)
    }

    fn location(&self, view: &SymbolsView<'_>, id: u32) -> Result<ResolvedLocation, DbError> {
        let loc = view
            .location(id)
            .ok_or_else(|| DbError::corruption(format!("unknown location {}", id)))?;
        let mapping = if loc.mapping_id == NO_MAPPING {
            None
        } else {
            let m = view.mapping(loc.mapping_id).ok_or_else(|| {
                DbError::corruption(format!("location {} references unknown mapping {}", id, loc.mapping_id))
            })?;
            Some(ResolvedMapping {
                memory_start: m.memory_start,
                memory_limit: m.memory_limit,
                file_offset: m.file_offset,
                filename: view.string(m.filename).to_string(),
                build_id: view.string(m.build_id).to_string(),
                has_functions: m.has_functions,
                has_filenames: m.has_filenames,
                has_line_numbers: m.has_line_numbers,
                has_inline_frames: m.has_inline_frames,
            })
        };
        let mut lines = Vec::with_capacity(loc.lines.len());
        for line in &loc.lines {
            let f = view.function(line.function_id).ok_or_else(|| {
                DbError::corruption(format!("location {} references unknown function {}", id, line.function_id))
            })?;
            lines.push((
                ResolvedFunction {
                    name: view.string(f.name).to_string(),
                    system_name: view.string(f.system_name).to_string(),
                    filename: view.string(f.filename).to_string(),
                    start_line: f.start_line as i64,
                },
                line.line as i64,
            ));
        }
        Ok(ResolvedLocation {
            address: loc.address,
            mapping,
            lines,
            is_folded: loc.is_folded,
        })
    }

    fn partition_pprof(
        &self,
        view: &SymbolsView<'_>,
        partition: u64,
        totals: &FxHashMap<u32, u64>,
        profile_type: &ProfileType,
    ) -> Result<PprofBuilder, DbError> {
        let mut ids: Vec<u32> = totals.keys().copied().collect();
        ids.sort_unstable();
        let stacks = self.partitions.resolve_stacktrace_locations(partition, &ids)?;
        let mut cache: FxHashMap<u32, ResolvedLocation> = FxHashMap::default();
        let mut builder = PprofBuilder::new(profile_type.clone());
        for (id, stack) in ids.iter().zip(stacks) {
            let mut locations = Vec::with_capacity(stack.len());
            for loc_id in stack.iter() {
                if !cache.contains_key(loc_id) {
                    cache.insert(*loc_id, self.location(view, *loc_id)?);
                }
                locations.push(cache[loc_id].clone());
            }
            let value = i64::try_from(totals[id]).unwrap_or(i64::MAX);
            builder.add_sample(&locations, value);
        }
        Ok(builder)
    }

    fn pprof(
        &self,
        totals: &PartitionTotals,
        profile_type: &ProfileType,
    ) -> Result<PprofBuilder, DbError> {
        let view = self.symbols.view()?;
        let builders: Vec<PprofBuilder> = totals
            .par_iter()
            .filter_map(|(partition, st)| {
                match self.partition_pprof(&view, *partition, st, profile_type) {
                    Ok(b) => Some(b),
                    Err(e) => {
                        self.skip_partition(*partition, &e);
                        None
                    }
                }
            })
            .collect();
        let mut out = PprofBuilder::new(profile_type.clone());
        for b in &builders {
            out.merge(b);
        }
        Ok(out)
    }
}

fn entries_from(rows: Vec<SeriesRows>) -> Vec<ProfileEntry> {
    let mut out = Vec::with_capacity(rows.iter().map(|s| s.rows.len()).sum());
    for s in rows {
        for row in s.rows {
            out.push(ProfileEntry {
                labels: s.labels.clone(),
                fingerprint: s.fingerprint,
                timestamp: row.time_nanos,
                row,
                source: 0,
            });
        }
    }
    out
}

/// Capabilities shared by every query source.
pub trait Querier: Send + Sync {
    fn name(&self) -> String;

    /// Inclusive time bounds of the source, `None` while it holds no rows.
    fn bounds(&self) -> Result<Option<(Timestamp, Timestamp)>, DbError>;

    fn in_range(&self, start: Timestamp, end: Timestamp) -> Result<bool, DbError> {
        Ok(self
            .bounds()?
            .map_or(false, |(min, max)| min <= end && max >= start))
    }

    /// Rows of matching series inside the range, by series in label order then by time.
    fn select_matching_profiles(&self, params: &SelectParams) -> Result<Vec<ProfileEntry>, DbError>;

    fn symbolizer(&self) -> Symbolizer<'_>;

    fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError>;

    fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError>;

    fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError>;

    fn profile_types(&self) -> Result<Vec<ProfileType>, DbError> {
        let mut out = Vec::new();
        for id in self.label_values(LABEL_NAME_PROFILE_TYPE, &[])? {
            match ProfileType::parse(&id) {
                Ok(pt) => out.push(pt),
                Err(error) => tracing::debug!(%id, %error, "ignoring unparsable profile type"),
            }
        }
        Ok(out)
    }

    /// Orders entries for symbol locality: by partition, then series, then time.
    fn sort(&self, entries: &mut [ProfileEntry]) {
        entries.sort_by(|a, b| {
            a.row
                .stacktrace_partition
                .cmp(&b.row.stacktrace_partition)
                .then_with(|| a.labels.cmp(&b.labels))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
    }

    fn merge_by_stacktraces(&self, entries: &[ProfileEntry]) -> Result<Tree, DbError> {
        self.symbolizer().tree(&partition_totals(entries, |_| true))
    }

    /// Sums total values per label subset `by` and timestamp.
    fn merge_by_labels(&self, entries: &[ProfileEntry], by: &[String]) -> Result<Vec<Series>, DbError> {
        let mut acc: BTreeMap<Labels, BTreeMap<Timestamp, u64>> = BTreeMap::new();
        for e in entries {
            let slot = acc
                .entry(e.labels.subset(by))
                .or_default()
                .entry(e.timestamp)
                .or_insert(0);
            *slot = slot.saturating_add(e.row.total_value);
        }
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

    fn merge_pprof(
        &self,
        entries: &[ProfileEntry],
        profile_type: &ProfileType,
    ) -> Result<PprofBuilder, DbError> {
        let mut builder = self
            .symbolizer()
            .pprof(&partition_totals(entries, |_| true), profile_type)?;
        for e in entries {
            builder.observe(e.timestamp, e.row.period);
        }
        Ok(builder)
    }

    /// Tree of the samples whose span id is in `spans`.
    fn merge_by_spans(&self, entries: &[ProfileEntry], spans: &[u64]) -> Result<Tree, DbError> {
        let wanted: FxHashSet<u64> = spans.iter().copied().filter(|s| *s != 0).collect();
        if wanted.is_empty() {
            return Ok(Tree::new());
        }
        self.symbolizer()
            .tree(&partition_totals(entries, |span| wanted.contains(&span)))
    }
}

/// In-memory rows of a head plus every row group cut at or after `first_generation`.
///
/// Row groups cut while a query runs are picked up here, so a concurrent cut never hides
/// or duplicates rows.
pub struct HeadInMemoryQuerier {
    head: Arc<Head>,
    first_generation: usize,
}

impl Querier for HeadInMemoryQuerier {
    fn name(&self) -> String {
        format!("head/{}/memory", self.head.name())
    }

    fn bounds(&self) -> Result<Option<(Timestamp, Timestamp)>, DbError> {
        self.head.bounds()
    }

    fn select_matching_profiles(&self, params: &SelectParams) -> Result<Vec<ProfileEntry>, DbError> {
        let first = self.first_generation;
        let rows = self.head.store().select_rows(
            &params.matchers,
            params.start,
            params.end,
            true,
            |g| g >= first,
        )?;
        Ok(entries_from(rows))
    }

    fn symbolizer(&self) -> Symbolizer<'_> {
        Symbolizer {
            symbols: self.head.symbols(),
            partitions: self.head.partitions(),
            events: self.head.events(),
        }
    }

    fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.head.label_names(matchers)
    }

    fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.head.label_values(name, matchers)
    }

    fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError> {
        self.head.series(matchers)
    }
}

/// One row group a head has cut to disk.
pub struct HeadOnDiskQuerier {
    head: Arc<Head>,
    generation: usize,
}

impl Querier for HeadOnDiskQuerier {
    fn name(&self) -> String {
        format!("head/{}/row-group/{}", self.head.name(), self.generation)
    }

    fn bounds(&self) -> Result<Option<(Timestamp, Timestamp)>, DbError> {
        self.head.bounds()
    }

    fn select_matching_profiles(&self, params: &SelectParams) -> Result<Vec<ProfileEntry>, DbError> {
        let generation = self.generation;
        let rows = self.head.store().select_rows(
            &params.matchers,
            params.start,
            params.end,
            false,
            |g| g == generation,
        )?;
        Ok(entries_from(rows))
    }

    fn symbolizer(&self) -> Symbolizer<'_> {
        Symbolizer {
            symbols: self.head.symbols(),
            partitions: self.head.partitions(),
            events: self.head.events(),
        }
    }

    fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.head.label_names(matchers)
    }

    fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.head.label_values(name, matchers)
    }

    fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError> {
        self.head.series(matchers)
    }
}

/// A flushed block.
pub struct BlockQuerier {
    block: Arc<Block>,
    events: Arc<dyn DbEventListener>,
}

impl BlockQuerier {
    pub fn new(block: Arc<Block>, events: Arc<dyn DbEventListener>) -> Self {
        Self { block, events }
    }
}

impl Querier for BlockQuerier {
    fn name(&self) -> String {
        format!("block/{}", self.block.meta().id)
    }

    fn bounds(&self) -> Result<Option<(Timestamp, Timestamp)>, DbError> {
        let meta = self.block.meta();
        Ok((meta.min_time <= meta.max_time).then_some((meta.min_time, meta.max_time)))
    }

    fn select_matching_profiles(&self, params: &SelectParams) -> Result<Vec<ProfileEntry>, DbError> {
        let rows = self
            .block
            .select_rows(&params.matchers, params.start, params.end)?;
        Ok(entries_from(rows))
    }

    fn symbolizer(&self) -> Symbolizer<'_> {
        Symbolizer {
            symbols: self.block.symbols(),
            partitions: self.block.partitions(),
            events: &self.events,
        }
    }

    fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.block.index().label_names(matchers)
    }

    fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>, DbError> {
        self.block.index().label_values(name, matchers)
    }

    fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, DbError> {
        self.block.index().series(matchers)
    }
}

/// Queriers covering everything a head holds: one per row group cut so far plus one for
/// the in-memory rows and any later cuts. A moved head yields none.
pub fn head_queriers(head: &Arc<Head>) -> Result<Vec<Arc<dyn Querier>>, DbError> {
    if head.state()? == HeadState::Moved {
        return Ok(Vec::new());
    }
    let generations = head.store().num_row_groups()?;
    let mut out: Vec<Arc<dyn Querier>> = Vec::with_capacity(generations + 1);
    for generation in 0..generations {
        out.push(Arc::new(HeadOnDiskQuerier {
            head: head.clone(),
            generation,
        }));
    }
    out.push(Arc::new(HeadInMemoryQuerier {
        head: head.clone(),
        first_generation: generations,
    }));
    Ok(out)
}
