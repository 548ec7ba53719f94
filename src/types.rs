use crate::labels::Fingerprint;
use serde::{Deserialize, Serialize};

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = i64;

/// Identifier of a single ingested profile.
pub type ProfileId = uuid::Uuid;

// --- Ingest model: a pprof-shaped profile -----------------------------------------------
//
// Mappings, locations and functions carry profile-local ids (referenced by samples and
// lines). Strings are referenced by their index into `string_table`, whose entry 0 is "".

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType {
    pub r#type: i64,
    pub unit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleLabel {
    pub key: i64,
    pub str: i64,
    pub num: i64,
    pub num_unit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Leaf first.
    pub location_ids: Vec<u64>,
    pub values: Vec<i64>,
    pub labels: Vec<SampleLabel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: u64,
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: i64,
    pub build_id: i64,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub function_id: u64,
    pub line: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: u64,
    /// 0 when the location has no mapping.
    pub mapping_id: u64,
    pub address: u64,
    /// Innermost (inlined) frame first.
    pub lines: Vec<Line>,
    pub is_folded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: u64,
    pub name: i64,
    pub system_name: i64,
    pub filename: i64,
    pub start_line: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub sample_types: Vec<ValueType>,
    pub samples: Vec<Sample>,
    pub mappings: Vec<Mapping>,
    pub locations: Vec<Location>,
    pub functions: Vec<Function>,
    pub string_table: Vec<String>,
    pub drop_frames: i64,
    pub keep_frames: i64,
    pub time_nanos: i64,
    pub duration_nanos: i64,
    pub period_type: Option<ValueType>,
    pub period: i64,
    pub comments: Vec<i64>,
    pub default_sample_type: i64,
}

impl Profile {
    /// Looks up a string table entry; out-of-range indices resolve to "".
    pub fn string(&self, idx: i64) -> &str {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

// --- Stored model ------------------------------------------------------------------------

/// Per-profile samples after symbol rewriting: stacktrace ids are partition-scoped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Samples {
    pub stacktrace_ids: Vec<u32>,
    pub values: Vec<u64>,
    /// Either empty or parallel to `stacktrace_ids`; 0 means "no span".
    pub span_ids: Vec<u64>,
}

impl Samples {
    pub fn len(&self) -> usize {
        self.stacktrace_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacktrace_ids.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.values.iter().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    fn span(&self, i: usize) -> u64 {
        self.span_ids.get(i).copied().unwrap_or(0)
    }

    /// Sorts by stacktrace id (descending), drops zero values and sums duplicates.
    pub fn compact(&mut self) {
        let has_spans = !self.span_ids.is_empty();
        let mut order: Vec<usize> = (0..self.len()).filter(|&i| self.values[i] != 0).collect();
        order.sort_by(|&a, &b| {
            self.stacktrace_ids[b]
                .cmp(&self.stacktrace_ids[a])
                .then_with(|| self.span(a).cmp(&self.span(b)))
        });

        let mut out = Samples::default();
        for i in order {
            let (st, v, span) = (self.stacktrace_ids[i], self.values[i], self.span(i));
            let same_as_last = out.stacktrace_ids.last() == Some(&st)
                && (!has_spans || out.span_ids.last() == Some(&span));
            if same_as_last {
                if let Some(last) = out.values.last_mut() {
                    *last = last.saturating_add(v);
                }
                continue;
            }
            out.stacktrace_ids.push(st);
            out.values.push(v);
            if has_spans {
                out.span_ids.push(span);
            }
        }
        *self = out;
    }
}

/// One stored row: a single sample type of a single ingested profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: ProfileId,
    pub series_fingerprint: Fingerprint,
    /// Position of the series in the flushed index; assigned at flush time.
    pub series_index: u32,
    pub stacktrace_partition: u64,
    pub total_value: u64,
    pub samples: Samples,
    pub time_nanos: Timestamp,
    pub duration_nanos: i64,
    pub period: i64,
    pub comments: Vec<u32>,
    pub drop_frames: u32,
    pub keep_frames: u32,
    pub default_sample_type: i64,
}

impl ProfileRow {
    /// Approximate in-memory footprint in bytes.
    pub fn size_bytes(&self) -> u64 {
        let samples = self.samples.stacktrace_ids.len() * 4
            + self.samples.values.len() * 8
            + self.samples.span_ids.len() * 8;
        (std::mem::size_of::<ProfileRow>() + samples + self.comments.len() * 4) as u64
    }
}
