use profiledb::types::{Function, Line, Location, Mapping, Sample, ValueType};
use profiledb::{Labels, Profile};

pub const FUNCTIONS: [&str; 12] = [
    "main", "runtime.main", "http.serve", "http.handle", "json.decode", "json.encode",
    "db.query", "db.scan", "gc.mark", "gc.sweep", "alloc", "syscall.read",
];

#[derive(Clone, Debug)]
pub struct IngestOp {
    pub profile: Profile,
    pub labels: Labels,
}

/// Deterministic CPU profiles: `jobs` series, `stacks` samples each, stacks drawn from
/// [`FUNCTIONS`] by index arithmetic.
pub fn generate_profiles(profiles: usize, jobs: usize, stacks: usize) -> Vec<IngestOp> {
    assert!(jobs > 0);
    (0..profiles)
        .map(|i| {
            let job = format!("job_{}", i % jobs);
            IngestOp {
                profile: cpu_profile(i as i64 + 1, i, stacks),
                labels: Labels::from_pairs(&[("__name__", "process_cpu"), ("job", &job)]),
            }
        })
        .collect()
}

fn cpu_profile(time_nanos: i64, seed: usize, stacks: usize) -> Profile {
    let mut string_table: Vec<String> = vec!["".into(), "cpu".into(), "nanoseconds".into(), "app".into()];
    let base = string_table.len() as i64;
    string_table.extend(FUNCTIONS.iter().map(|f| f.to_string()));

    let functions: Vec<Function> = (0..FUNCTIONS.len())
        .map(|i| Function {
            id: i as u64 + 1,
            name: base + i as i64,
            system_name: base + i as i64,
            ..Default::default()
        })
        .collect();
    let locations: Vec<Location> = (0..FUNCTIONS.len())
        .map(|i| Location {
            id: i as u64 + 1,
            mapping_id: 1,
            address: 0x4000 + i as u64 * 0x10,
            lines: vec![Line {
                function_id: i as u64 + 1,
                line: 10,
            }],
            is_folded: false,
        })
        .collect();

    let samples = (0..stacks)
        .map(|s| {
            let depth = 2 + (seed + s) % 5;
            // leaf first, always rooted at main
            let mut location_ids: Vec<u64> = (1..depth)
                .map(|d| ((seed * 7 + s * 13 + d * 3) % (FUNCTIONS.len() - 1)) as u64 + 2)
                .collect();
            location_ids.push(1);
            Sample {
                location_ids,
                values: vec![((seed + s) % 97) as i64 + 1],
                labels: vec![],
            }
        })
        .collect();

    Profile {
        sample_types: vec![ValueType { r#type: 1, unit: 2 }],
        period_type: Some(ValueType { r#type: 1, unit: 2 }),
        period: 10_000_000,
        time_nanos,
        duration_nanos: 10_000_000_000,
        mappings: vec![Mapping {
            id: 1,
            filename: 3,
            has_functions: true,
            ..Default::default()
        }],
        locations,
        functions,
        samples,
        string_table,
        ..Default::default()
    }
}
