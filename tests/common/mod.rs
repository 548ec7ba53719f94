#![allow(dead_code)]

use profiledb::telemetry::{DbEvent, DbEventListener};
use profiledb::types::{Function, Line, Location, Mapping, Sample, SampleLabel, ValueType};
use profiledb::{DbConfig, HeadConfig, Labels, Profile, ProfileDb};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Builds pprof-shaped profiles from root-first frame lists.
pub struct ProfileBuilder {
    profile: Profile,
    strings: HashMap<String, i64>,
    functions: HashMap<String, u64>,
}

impl ProfileBuilder {
    fn with_types(time_nanos: i64, types: &[(&str, &str)], period: (&str, &str)) -> Self {
        let mut b = Self {
            profile: Profile {
                string_table: vec![String::new()],
                time_nanos,
                duration_nanos: 10_000_000_000,
                period: 10_000_000,
                ..Default::default()
            },
            strings: HashMap::new(),
            functions: HashMap::new(),
        };
        for (ty, unit) in types {
            let vt = ValueType {
                r#type: b.string(ty),
                unit: b.string(unit),
            };
            b.profile.sample_types.push(vt);
        }
        b.profile.period_type = Some(ValueType {
            r#type: b.string(period.0),
            unit: b.string(period.1),
        });
        let filename = b.string("app");
        b.profile.mappings.push(Mapping {
            id: 1,
            filename,
            has_functions: true,
            ..Default::default()
        });
        b
    }

    pub fn cpu(time_nanos: i64) -> Self {
        Self::with_types(time_nanos, &[("cpu", "nanoseconds")], ("cpu", "nanoseconds"))
    }

    pub fn memory(time_nanos: i64) -> Self {
        Self::with_types(
            time_nanos,
            &[("alloc_objects", "count"), ("alloc_space", "bytes")],
            ("space", "bytes"),
        )
    }

    fn string(&mut self, s: &str) -> i64 {
        if s.is_empty() {
            return 0;
        }
        if let Some(idx) = self.strings.get(s) {
            return *idx;
        }
        self.profile.string_table.push(s.to_string());
        let idx = self.profile.string_table.len() as i64 - 1;
        self.strings.insert(s.to_string(), idx);
        idx
    }

    fn location(&mut self, name: &str) -> u64 {
        if let Some(id) = self.functions.get(name) {
            return *id;
        }
        let id = self.functions.len() as u64 + 1;
        let name_idx = self.string(name);
        self.profile.functions.push(Function {
            id,
            name: name_idx,
            system_name: name_idx,
            ..Default::default()
        });
        self.profile.locations.push(Location {
            id,
            mapping_id: 1,
            address: 0x4000 + id * 0x10,
            lines: vec![Line {
                function_id: id,
                line: id as i64,
            }],
            is_folded: false,
        });
        self.functions.insert(name.to_string(), id);
        id
    }

    /// Adds a sample for `frames` (root first) with one value per sample type.
    pub fn stack(mut self, frames: &[&str], values: &[i64]) -> Self {
        let location_ids = frames.iter().rev().map(|f| self.location(f)).collect();
        self.profile.samples.push(Sample {
            location_ids,
            values: values.to_vec(),
            labels: vec![],
        });
        self
    }

    pub fn stack_with_span(mut self, frames: &[&str], values: &[i64], span: u64) -> Self {
        self = self.stack(frames, values);
        let key = self.string("span_id");
        let str = self.string(&format!("{:016x}", span));
        if let Some(sample) = self.profile.samples.last_mut() {
            sample.labels.push(SampleLabel {
                key,
                str,
                ..Default::default()
            });
        }
        self
    }

    pub fn build(self) -> Profile {
        self.profile
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    Labels::from_pairs(pairs)
}

pub fn cpu_labels(job: &str) -> Labels {
    labels(&[("__name__", "process_cpu"), ("job", job)])
}

pub fn config(dir: &Path) -> DbConfig {
    DbConfig {
        head: HeadConfig {
            data_path: dir.to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn open_db(dir: &Path, configure: impl FnOnce(&mut DbConfig)) -> ProfileDb {
    let mut cfg = config(dir);
    configure(&mut cfg);
    ProfileDb::open(cfg).unwrap()
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<DbEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, pred: impl Fn(&DbEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl DbEventListener for RecordingListener {
    fn on_event(&self, event: DbEvent) {
        self.events.lock().unwrap().push(event);
    }
}
