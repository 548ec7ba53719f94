//! Head-global symbol tables: strings, mappings, functions and locations.

use crate::block::BlockFile;
use crate::dedup::{DedupHelper, DedupTable, IdConversionTable, Rewriter, TableView};
use crate::error::DbError;
use crate::types::Profile;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// `mapping_id` of a location without a mapping.
pub const NO_MAPPING: u32 = u32::MAX;

pub const STRINGS_FILE: &str = "strings.bin";
pub const MAPPINGS_FILE: &str = "mappings.bin";
pub const FUNCTIONS_FILE: &str = "functions.bin";
pub const LOCATIONS_FILE: &str = "locations.bin";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryMapping {
    pub id: u64,
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: u32,
    pub build_id: u32,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryFunction {
    pub id: u64,
    pub name: u32,
    pub system_name: u32,
    pub filename: u32,
    pub start_line: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InMemoryLine {
    pub function_id: u32,
    pub line: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryLocation {
    pub id: u64,
    pub address: u64,
    pub mapping_id: u32,
    pub is_folded: bool,
    pub lines: Vec<InMemoryLine>,
}

pub struct StringsHelper;

impl DedupHelper for StringsHelper {
    type Value = Arc<str>;
    type Key = Arc<str>;

    fn key(value: &Arc<str>) -> Arc<str> {
        value.clone()
    }
    fn rewrite(_: &Rewriter, _: &mut Arc<str>) {}
    fn set_id(local_pos: usize, _: u32, _: &mut Arc<str>) -> u64 {
        local_pos as u64
    }
    fn size(value: &Arc<str>) -> u64 {
        value.len() as u64 + 16
    }
    fn add_to_rewriter(rewriter: &mut Rewriter, table: IdConversionTable) {
        rewriter.strings = table;
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    memory_start: u64,
    memory_limit: u64,
    file_offset: u64,
    filename: u32,
    build_id: u32,
    flags: [bool; 4],
}

pub struct MappingsHelper;

impl DedupHelper for MappingsHelper {
    type Value = InMemoryMapping;
    type Key = MappingKey;

    fn key(m: &InMemoryMapping) -> MappingKey {
        MappingKey {
            memory_start: m.memory_start,
            memory_limit: m.memory_limit,
            file_offset: m.file_offset,
            filename: m.filename,
            build_id: m.build_id,
            flags: [
                m.has_functions,
                m.has_filenames,
                m.has_line_numbers,
                m.has_inline_frames,
            ],
        }
    }
    fn rewrite(r: &Rewriter, m: &mut InMemoryMapping) {
        m.filename = r.strings.rewrite(m.filename as u64);
        m.build_id = r.strings.rewrite(m.build_id as u64);
    }
    fn set_id(_: usize, global_id: u32, m: &mut InMemoryMapping) -> u64 {
        std::mem::replace(&mut m.id, global_id as u64)
    }
    fn size(_: &InMemoryMapping) -> u64 {
        std::mem::size_of::<InMemoryMapping>() as u64
    }
    fn add_to_rewriter(rewriter: &mut Rewriter, table: IdConversionTable) {
        rewriter.mappings = table;
    }
}

pub struct FunctionsHelper;

impl DedupHelper for FunctionsHelper {
    type Value = InMemoryFunction;
    type Key = (u32, u32, u32, u32);

    fn key(f: &InMemoryFunction) -> Self::Key {
        (f.name, f.system_name, f.filename, f.start_line)
    }
    fn rewrite(r: &Rewriter, f: &mut InMemoryFunction) {
        f.name = r.strings.rewrite(f.name as u64);
        f.system_name = r.strings.rewrite(f.system_name as u64);
        f.filename = r.strings.rewrite(f.filename as u64);
    }
    fn set_id(_: usize, global_id: u32, f: &mut InMemoryFunction) -> u64 {
        std::mem::replace(&mut f.id, global_id as u64)
    }
    fn size(_: &InMemoryFunction) -> u64 {
        std::mem::size_of::<InMemoryFunction>() as u64
    }
    fn add_to_rewriter(rewriter: &mut Rewriter, table: IdConversionTable) {
        rewriter.functions = table;
    }
}

pub struct LocationsHelper;

impl DedupHelper for LocationsHelper {
    type Value = InMemoryLocation;
    type Key = (u64, u32, bool, Vec<InMemoryLine>);

    fn key(l: &InMemoryLocation) -> Self::Key {
        (l.address, l.mapping_id, l.is_folded, l.lines.clone())
    }
    /// References are already global when the location is built.
    fn rewrite(_: &Rewriter, _: &mut InMemoryLocation) {}
    fn set_id(_: usize, global_id: u32, l: &mut InMemoryLocation) -> u64 {
        std::mem::replace(&mut l.id, global_id as u64)
    }
    fn size(l: &InMemoryLocation) -> u64 {
        (std::mem::size_of::<InMemoryLocation>() + l.lines.len() * 8) as u64
    }
    fn add_to_rewriter(rewriter: &mut Rewriter, table: IdConversionTable) {
        rewriter.locations = table;
    }
}

/// The four head-global tables. String id 0 is always "".
pub struct SymbolTables {
    pub strings: DedupTable<StringsHelper>,
    pub mappings: DedupTable<MappingsHelper>,
    pub functions: DedupTable<FunctionsHelper>,
    pub locations: DedupTable<LocationsHelper>,
}

impl Default for SymbolTables {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTables {
    pub fn new() -> Self {
        Self {
            strings: DedupTable::seeded([Arc::<str>::from("")]),
            mappings: DedupTable::new(),
            functions: DedupTable::new(),
            locations: DedupTable::new(),
        }
    }

    /// Ingests a validated profile's symbols in dependency order.
    pub fn ingest(&self, p: &Profile, rewriter: &mut Rewriter) -> Result<(), DbError> {
        let strings: Vec<Arc<str>> = p.string_table.iter().map(|s| Arc::from(s.as_str())).collect();
        self.strings.ingest(strings, rewriter)?;

        let mappings = p
            .mappings
            .iter()
            .map(|m| InMemoryMapping {
                id: m.id,
                memory_start: m.memory_start,
                memory_limit: m.memory_limit,
                file_offset: m.file_offset,
                filename: m.filename as u32,
                build_id: m.build_id as u32,
                has_functions: m.has_functions,
                has_filenames: m.has_filenames,
                has_line_numbers: m.has_line_numbers,
                has_inline_frames: m.has_inline_frames,
            })
            .collect();
        self.mappings.ingest(mappings, rewriter)?;

        let functions = p
            .functions
            .iter()
            .map(|f| InMemoryFunction {
                id: f.id,
                name: f.name as u32,
                system_name: f.system_name as u32,
                filename: f.filename as u32,
                start_line: f.start_line.clamp(0, u32::MAX as i64) as u32,
            })
            .collect();
        self.functions.ingest(functions, rewriter)?;

        // mapping and function references are resolved from the profile's u64 ids here,
        // since the stored location only has room for global ids
        let locations = p
            .locations
            .iter()
            .map(|l| InMemoryLocation {
                id: l.id,
                address: l.address,
                mapping_id: if l.mapping_id == 0 {
                    NO_MAPPING
                } else {
                    rewriter.mappings.rewrite(l.mapping_id)
                },
                is_folded: l.is_folded,
                lines: l
                    .lines
                    .iter()
                    .map(|line| InMemoryLine {
                        function_id: rewriter.functions.rewrite(line.function_id),
                        line: line.line.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
                    })
                    .collect(),
            })
            .collect();
        self.locations.ingest(locations, rewriter)
    }

    pub fn size(&self) -> u64 {
        self.strings.size() + self.mappings.size() + self.functions.size() + self.locations.size()
    }

    pub fn view(&self) -> Result<SymbolsView<'_>, DbError> {
        Ok(SymbolsView {
            strings: self.strings.view()?,
            mappings: self.mappings.view()?,
            functions: self.functions.view()?,
            locations: self.locations.view()?,
        })
    }

    pub fn write_to(&self, dir: &Path) -> Result<Vec<BlockFile>, DbError> {
        let mut files = Vec::with_capacity(4);
        files.push(BlockFile::table(STRINGS_FILE, self.strings.write_to(&dir.join(STRINGS_FILE))?, self.strings.len()?));
        files.push(BlockFile::table(MAPPINGS_FILE, self.mappings.write_to(&dir.join(MAPPINGS_FILE))?, self.mappings.len()?));
        files.push(BlockFile::table(FUNCTIONS_FILE, self.functions.write_to(&dir.join(FUNCTIONS_FILE))?, self.functions.len()?));
        files.push(BlockFile::table(LOCATIONS_FILE, self.locations.write_to(&dir.join(LOCATIONS_FILE))?, self.locations.len()?));
        Ok(files)
    }

    pub fn open(dir: &Path) -> Result<Self, DbError> {
        Ok(Self {
            strings: DedupTable::open(&dir.join(STRINGS_FILE))?,
            mappings: DedupTable::open(&dir.join(MAPPINGS_FILE))?,
            functions: DedupTable::open(&dir.join(FUNCTIONS_FILE))?,
            locations: DedupTable::open(&dir.join(LOCATIONS_FILE))?,
        })
    }
}

/// Consistent read access to all four tables.
pub struct SymbolsView<'a> {
    strings: TableView<'a, StringsHelper>,
    mappings: TableView<'a, MappingsHelper>,
    functions: TableView<'a, FunctionsHelper>,
    locations: TableView<'a, LocationsHelper>,
}

impl SymbolsView<'_> {
    pub fn string(&self, id: u32) -> &str {
        self.strings.get(id).map(|s| &**s).unwrap_or("")
    }

    pub fn mapping(&self, id: u32) -> Option<&InMemoryMapping> {
        self.mappings.get(id)
    }

    pub fn function(&self, id: u32) -> Option<&InMemoryFunction> {
        self.functions.get(id)
    }

    pub fn location(&self, id: u32) -> Option<&InMemoryLocation> {
        self.locations.get(id)
    }

    /// Function names of a leaf-first stacktrace, root first. Inlined frames of one
    /// location expand outermost first.
    pub fn frames(&self, location_ids: &[u32]) -> Result<Vec<&str>, DbError> {
        let mut out = Vec::with_capacity(location_ids.len());
        for &loc_id in location_ids.iter().rev() {
            let loc = self.location(loc_id).ok_or_else(|| {
                DbError::corruption(format!("stacktrace references unknown location {}", loc_id))
            })?;
            for line in loc.lines.iter().rev() {
                let name = self
                    .function(line.function_id)
                    .map(|f| self.string(f.name))
                    .unwrap_or("");
                out.push(name);
            }
        }
        Ok(out)
    }
}

/// Rejects profiles whose references cannot be resolved. Runs before anything is written.
pub fn validate_profile(p: &Profile) -> Result<(), DbError> {
    let malformed = |msg: String| Err(DbError::MalformedProfile(msg));

    if p.string_table.first().map(String::as_str) != Some("") {
        return malformed("string table must start with the empty string".into());
    }
    if p.sample_types.is_empty() {
        return malformed("profile has no sample types".into());
    }
    let n_strings = p.string_table.len() as i64;
    let check_str = |idx: i64, what: &str| -> Result<(), DbError> {
        if idx < 0 || idx >= n_strings || idx > u32::MAX as i64 {
            return Err(DbError::MalformedProfile(format!(
                "{} references string {} outside the string table",
                what, idx
            )));
        }
        Ok(())
    };

    for vt in &p.sample_types {
        check_str(vt.r#type, "sample type")?;
        check_str(vt.unit, "sample unit")?;
    }
    if let Some(pt) = &p.period_type {
        check_str(pt.r#type, "period type")?;
        check_str(pt.unit, "period unit")?;
    }
    for c in &p.comments {
        check_str(*c, "comment")?;
    }
    check_str(p.drop_frames, "drop_frames")?;
    check_str(p.keep_frames, "keep_frames")?;

    let mut mapping_ids = FxHashSet::default();
    for m in &p.mappings {
        check_str(m.filename, "mapping filename")?;
        check_str(m.build_id, "mapping build id")?;
        if m.id == 0 || !mapping_ids.insert(m.id) {
            return malformed(format!("mapping id {} is zero or duplicated", m.id));
        }
    }
    let mut function_ids = FxHashSet::default();
    for f in &p.functions {
        check_str(f.name, "function name")?;
        check_str(f.system_name, "function system name")?;
        check_str(f.filename, "function filename")?;
        if f.id == 0 || !function_ids.insert(f.id) {
            return malformed(format!("function id {} is zero or duplicated", f.id));
        }
    }
    let mut location_ids = FxHashSet::default();
    for l in &p.locations {
        if l.id == 0 || !location_ids.insert(l.id) {
            return malformed(format!("location id {} is zero or duplicated", l.id));
        }
        if l.mapping_id != 0 && !mapping_ids.contains(&l.mapping_id) {
            return malformed(format!(
                "location {} references unknown mapping {}",
                l.id, l.mapping_id
            ));
        }
        if let Some(line) = l.lines.iter().find(|line| !function_ids.contains(&line.function_id)) {
            return malformed(format!(
                "location {} references unknown function {}",
                l.id, line.function_id
            ));
        }
    }
    for s in &p.samples {
        if s.values.len() != p.sample_types.len() {
            return malformed(format!(
                "sample has {} values for {} sample types",
                s.values.len(),
                p.sample_types.len()
            ));
        }
        if s.values.iter().any(|v| *v < 0) {
            return malformed("sample values must not be negative".into());
        }
        if let Some(id) = s.location_ids.iter().find(|id| !location_ids.contains(*id)) {
            return malformed(format!("sample references unknown location {}", id));
        }
        for l in &s.labels {
            check_str(l.key, "sample label key")?;
            check_str(l.str, "sample label value")?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{Function, Line, Location, Mapping, Sample, ValueType};

    /// A cpu profile with one sample per stack; each stack is leaf first.
    pub(crate) fn cpu_profile(stacks: &[(&[&str], i64)], time_nanos: i64) -> Profile {
        let mut p = Profile {
            string_table: vec![
                "".into(),
                "cpu".into(),
                "nanoseconds".into(),
                "app".into(),
            ],
            sample_types: vec![ValueType { r#type: 1, unit: 2 }],
            period_type: Some(ValueType { r#type: 1, unit: 2 }),
            period: 10_000_000,
            time_nanos,
            mappings: vec![Mapping {
                id: 1,
                filename: 3,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut fn_ids = std::collections::HashMap::new();
        for (stack, value) in stacks {
            let mut loc_ids = Vec::new();
            for name in stack.iter() {
                let next = fn_ids.len() as u64 + 1;
                let id = *fn_ids.entry(name.to_string()).or_insert_with(|| {
                    p.string_table.push(name.to_string());
                    let name_idx = p.string_table.len() as i64 - 1;
                    p.functions.push(Function {
                        id: next,
                        name: name_idx,
                        ..Default::default()
                    });
                    p.locations.push(Location {
                        id: next,
                        mapping_id: 1,
                        address: 0x1000 + next,
                        lines: vec![Line {
                            function_id: next,
                            line: 1,
                        }],
                        is_folded: false,
                    });
                    next
                });
                loc_ids.push(id);
            }
            p.samples.push(Sample {
                location_ids: loc_ids,
                values: vec![*value],
                labels: vec![],
            });
        }
        p
    }

    #[test]
    fn identical_functions_share_ids_across_profiles() {
        let tables = SymbolTables::new();
        let a = cpu_profile(&[(&["baz", "bar", "foo"], 1)], 1);
        let b = cpu_profile(&[(&["qux", "foo"], 1)], 2);
        let mut rw_a = Rewriter::default();
        tables.ingest(&a, &mut rw_a).unwrap();
        let mut rw_b = Rewriter::default();
        tables.ingest(&b, &mut rw_b).unwrap();

        // "foo" is function 3 in a and function 2 in b
        assert_eq!(rw_a.functions.rewrite(3), rw_b.functions.rewrite(2));
        assert_eq!(tables.functions.len().unwrap(), 4);
        let view = tables.view().unwrap();
        assert_eq!(view.string(0), "");
    }

    #[test]
    fn frames_are_returned_root_first() {
        let tables = SymbolTables::new();
        let p = cpu_profile(&[(&["baz", "bar", "foo"], 1)], 1);
        let mut rw = Rewriter::default();
        tables.ingest(&p, &mut rw).unwrap();
        let locs: Vec<u32> = p.samples[0]
            .location_ids
            .iter()
            .map(|id| rw.locations.rewrite(*id))
            .collect();
        let view = tables.view().unwrap();
        assert_eq!(view.frames(&locs).unwrap(), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn validation_rejects_dangling_references() {
        let mut p = cpu_profile(&[(&["main"], 1)], 1);
        assert!(validate_profile(&p).is_ok());

        p.samples[0].location_ids.push(99);
        assert!(matches!(validate_profile(&p), Err(DbError::MalformedProfile(_))));

        let mut p = cpu_profile(&[(&["main"], 1)], 1);
        p.functions[0].name = 1000;
        assert!(validate_profile(&p).is_err());

        let mut p = cpu_profile(&[(&["main"], 1)], 1);
        p.samples[0].values = vec![1, 2];
        assert!(validate_profile(&p).is_err());

        let mut p = cpu_profile(&[(&["main"], 1)], 1);
        p.string_table[0] = "x".into();
        assert!(validate_profile(&p).is_err());
    }

    #[test]
    fn tables_round_trip_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let tables = SymbolTables::new();
        let p = cpu_profile(&[(&["b", "a"], 1)], 1);
        tables.ingest(&p, &mut Rewriter::default()).unwrap();
        let files = tables.write_to(dir.path()).unwrap();
        assert_eq!(files.len(), 4);

        let back = SymbolTables::open(dir.path()).unwrap();
        assert_eq!(back.functions.len().unwrap(), 2);
        assert_eq!(back.strings.len().unwrap(), tables.strings.len().unwrap());
    }
}
