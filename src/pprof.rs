//! Assembles merged pprof profiles from symbolized stacks.
//!
//! Sources resolve their own symbol ids into [`ResolvedLocation`]s, so builders from
//! different heads and blocks can be merged by content. The output renumbers mappings,
//! functions and locations `1..=n` in first-seen order.

use crate::labels::ProfileType;
use crate::types::{Function, Line, Location, Mapping, Profile, Sample, Timestamp, ValueType};
use indexmap::IndexSet;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

type FxIndexSet<K> = IndexSet<K, BuildHasherDefault<FxHasher>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedFunction {
    pub name: String,
    pub system_name: String,
    pub filename: String,
    pub start_line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedMapping {
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: String,
    pub build_id: String,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedLocation {
    pub address: u64,
    pub mapping: Option<ResolvedMapping>,
    /// Innermost frame first.
    pub lines: Vec<(ResolvedFunction, i64)>,
    pub is_folded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LocationKey {
    address: u64,
    mapping: Option<usize>,
    lines: Vec<(usize, i64)>,
    is_folded: bool,
}

#[derive(Debug, Clone)]
pub struct PprofBuilder {
    profile_type: ProfileType,
    mappings: FxIndexSet<ResolvedMapping>,
    functions: FxIndexSet<ResolvedFunction>,
    locations: FxIndexSet<LocationKey>,
    /// Leaf-first location indexes and their summed value, in first-seen order.
    stacks: FxIndexSet<Vec<usize>>,
    values: Vec<i64>,
    period: i64,
    min_time: Timestamp,
    max_time: Timestamp,
}

impl PprofBuilder {
    pub fn new(profile_type: ProfileType) -> Self {
        Self {
            profile_type,
            mappings: FxIndexSet::default(),
            functions: FxIndexSet::default(),
            locations: FxIndexSet::default(),
            stacks: FxIndexSet::default(),
            values: Vec::new(),
            period: 0,
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
        }
    }

    /// Widens the time span covered by the profile and records its sampling period.
    pub fn observe(&mut self, time_nanos: Timestamp, period: i64) {
        self.min_time = self.min_time.min(time_nanos);
        self.max_time = self.max_time.max(time_nanos);
        if self.period == 0 {
            self.period = period;
        }
    }

    fn intern_location(&mut self, loc: &ResolvedLocation) -> usize {
        let mapping = loc
            .mapping
            .as_ref()
            .map(|m| self.mappings.insert_full(m.clone()).0);
        let lines = loc
            .lines
            .iter()
            .map(|(f, line)| (self.functions.insert_full(f.clone()).0, *line))
            .collect();
        self.locations
            .insert_full(LocationKey {
                address: loc.address,
                mapping,
                lines,
                is_folded: loc.is_folded,
            })
            .0
    }

    fn add_indexed(&mut self, stack: Vec<usize>, value: i64) {
        let (i, new) = self.stacks.insert_full(stack);
        if new {
            self.values.push(value);
        } else {
            self.values[i] = self.values[i].saturating_add(value);
        }
    }

    /// Adds `value` to the leaf-first stack `locations`.
    pub fn add_sample(&mut self, locations: &[ResolvedLocation], value: i64) {
        if value == 0 {
            return;
        }
        let stack = locations.iter().map(|l| self.intern_location(l)).collect();
        self.add_indexed(stack, value);
    }

    fn resolved_location(&self, i: usize) -> Option<ResolvedLocation> {
        let key = self.locations.get_index(i)?;
        Some(ResolvedLocation {
            address: key.address,
            mapping: key.mapping.and_then(|m| self.mappings.get_index(m).cloned()),
            lines: key
                .lines
                .iter()
                .filter_map(|(f, line)| self.functions.get_index(*f).map(|f| (f.clone(), *line)))
                .collect(),
            is_folded: key.is_folded,
        })
    }

    pub fn merge(&mut self, other: &PprofBuilder) {
        let remap: Vec<usize> = (0..other.locations.len())
            .filter_map(|i| other.resolved_location(i))
            .map(|l| self.intern_location(&l))
            .collect();
        for (stack, value) in other.stacks.iter().zip(&other.values) {
            let stack = stack.iter().filter_map(|i| remap.get(*i).copied()).collect();
            self.add_indexed(stack, *value);
        }
        if other.min_time <= other.max_time {
            self.observe(other.min_time, other.period);
            self.observe(other.max_time, other.period);
        }
    }

    pub fn num_samples(&self) -> usize {
        self.values.len()
    }

    pub fn build(self) -> Profile {
        let mut strings: FxIndexSet<String> = FxIndexSet::default();
        strings.insert(String::new());
        let mut s = |v: &str| -> i64 { strings.insert_full(v.to_string()).0 as i64 };

        let pt = &self.profile_type;
        let sample_types = vec![ValueType {
            r#type: s(&pt.sample_type),
            unit: s(&pt.sample_unit),
        }];
        let period_type = Some(ValueType {
            r#type: s(&pt.period_type),
            unit: s(&pt.period_unit),
        });

        let mappings: Vec<Mapping> = self
            .mappings
            .iter()
            .enumerate()
            .map(|(i, m)| Mapping {
                id: i as u64 + 1,
                memory_start: m.memory_start,
                memory_limit: m.memory_limit,
                file_offset: m.file_offset,
                filename: s(&m.filename),
                build_id: s(&m.build_id),
                has_functions: m.has_functions,
                has_filenames: m.has_filenames,
                has_line_numbers: m.has_line_numbers,
                has_inline_frames: m.has_inline_frames,
            })
            .collect();
        let functions: Vec<Function> = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| Function {
                id: i as u64 + 1,
                name: s(&f.name),
                system_name: s(&f.system_name),
                filename: s(&f.filename),
                start_line: f.start_line,
            })
            .collect();
        let locations: Vec<Location> = self
            .locations
            .iter()
            .enumerate()
            .map(|(i, l)| Location {
                id: i as u64 + 1,
                mapping_id: l.mapping.map_or(0, |m| m as u64 + 1),
                address: l.address,
                lines: l
                    .lines
                    .iter()
                    .map(|(f, line)| Line {
                        function_id: *f as u64 + 1,
                        line: *line,
                    })
                    .collect(),
                is_folded: l.is_folded,
            })
            .collect();
        let samples: Vec<Sample> = self
            .stacks
            .iter()
            .zip(&self.values)
            .map(|(stack, v)| Sample {
                location_ids: stack.iter().map(|i| *i as u64 + 1).collect(),
                values: vec![*v],
                labels: Vec::new(),
            })
            .collect();

        let (time_nanos, duration_nanos) = if self.min_time <= self.max_time {
            (self.min_time, self.max_time - self.min_time)
        } else {
            (0, 0)
        };
        Profile {
            sample_types,
            samples,
            mappings,
            locations,
            functions,
            string_table: strings.into_iter().collect(),
            drop_frames: 0,
            keep_frames: 0,
            time_nanos,
            duration_nanos,
            period_type,
            period: self.period,
            comments: Vec::new(),
            default_sample_type: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str) -> ResolvedFunction {
        ResolvedFunction {
            name: name.into(),
            system_name: name.into(),
            filename: "main.go".into(),
            start_line: 1,
        }
    }

    fn loc(name: &str, address: u64) -> ResolvedLocation {
        ResolvedLocation {
            address,
            mapping: Some(ResolvedMapping {
                memory_start: 0,
                memory_limit: 0x1000,
                file_offset: 0,
                filename: "app".into(),
                build_id: "abc".into(),
                has_functions: true,
                has_filenames: false,
                has_line_numbers: false,
                has_inline_frames: false,
            }),
            lines: vec![(func(name), 10)],
            is_folded: false,
        }
    }

    fn cpu() -> ProfileType {
        ProfileType::parse("process_cpu:cpu:nanoseconds:cpu:nanoseconds").unwrap()
    }

    #[test]
    fn identical_stacks_are_summed_and_ids_renumbered() {
        let mut b = PprofBuilder::new(cpu());
        b.observe(100, 10);
        b.add_sample(&[loc("leaf", 2), loc("main", 1)], 3);
        b.add_sample(&[loc("leaf", 2), loc("main", 1)], 4);
        b.add_sample(&[loc("main", 1)], 1);
        let p = b.build();

        assert_eq!(p.samples.len(), 2);
        assert_eq!(p.samples[0].values, vec![7]);
        assert_eq!(p.samples[0].location_ids, vec![1, 2]);
        assert_eq!(p.locations.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(p.functions.len(), 2);
        assert_eq!(p.mappings.len(), 1);
        assert_eq!(p.string_table[0], "");
        assert_eq!(p.string(p.sample_types[0].r#type), "cpu");
        assert_eq!(p.string(p.functions[0].name), "leaf");
        assert_eq!((p.time_nanos, p.period), (100, 10));
    }

    #[test]
    fn merging_builders_matches_by_content() {
        let mut a = PprofBuilder::new(cpu());
        a.add_sample(&[loc("x", 7)], 1);
        let mut b = PprofBuilder::new(cpu());
        b.add_sample(&[loc("y", 9)], 2);
        b.add_sample(&[loc("x", 7)], 5);
        b.observe(50, 10);
        b.observe(80, 10);
        a.merge(&b);
        assert_eq!(a.num_samples(), 2);
        let p = a.build();
        assert_eq!(p.samples[0].values, vec![6]);
        assert_eq!(p.samples[1].values, vec![2]);
        assert_eq!((p.time_nanos, p.duration_nanos), (50, 30));
    }
}
