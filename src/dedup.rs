//! Content-addressed, append-only tables.
//!
//! A [`DedupTable`] assigns each distinct element (by [`DedupHelper::key`]) a dense id in
//! insertion order. Ids are never reused or reordered while the table lives. Ingesting a
//! batch of profile-local elements returns an [`IdConversionTable`] that maps the ids the
//! profile used to the table's global ids; later element kinds are rewritten through the
//! conversion tables of the kinds they reference before their own keys are computed.

use crate::error::DbError;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{de::DeserializeOwned, Serialize};
use std::hash::{BuildHasherDefault, Hash};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

pub(crate) type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

const TABLE_MAGIC: &[u8; 8] = b"PDBTBL01";
const TABLE_VERSION: u32 = 1;

/// Describes one element kind stored in a [`DedupTable`].
pub trait DedupHelper {
    type Value: Clone + Send + Sync + Serialize + DeserializeOwned;
    type Key: Eq + Hash + Clone + Send + Sync;

    /// Identity of an element, excluding any id field.
    fn key(value: &Self::Value) -> Self::Key;

    /// Rewrites the ids this element references to global ids.
    fn rewrite(rewriter: &Rewriter, value: &mut Self::Value);

    /// Stores `global_id` on the element and returns the id the profile used for it.
    /// `local_pos` is the element's position in the ingested batch.
    fn set_id(local_pos: usize, global_id: u32, value: &mut Self::Value) -> u64;

    /// Approximate heap footprint in bytes.
    fn size(value: &Self::Value) -> u64;

    /// Installs the conversion table for this kind into the rewriter.
    fn add_to_rewriter(rewriter: &mut Rewriter, table: IdConversionTable);
}

/// Maps profile-local ids of one element kind to global table ids.
#[derive(Debug, Default, Clone)]
pub struct IdConversionTable(FxHashMap<u64, u32>);

impl IdConversionTable {
    pub fn insert(&mut self, local: u64, global: u32) {
        self.0.insert(local, global);
    }

    /// Looks up the global id for `local`.
    ///
    /// # Panics
    ///
    /// Panics if `local` was never ingested. Profiles are validated before symbols are
    /// written, so a miss here means the table and the rewriter are out of sync.
    pub fn rewrite(&self, local: u64) -> u32 {
        match self.0.get(&local) {
            Some(id) => *id,
            None => panic!("id conversion table has no entry for id {}", local),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Conversion tables accumulated while ingesting one profile's symbols.
#[derive(Debug, Default)]
pub struct Rewriter {
    pub strings: IdConversionTable,
    pub mappings: IdConversionTable,
    pub functions: IdConversionTable,
    pub locations: IdConversionTable,
}

struct TableInner<H: DedupHelper> {
    entries: FxIndexMap<H::Key, H::Value>,
}

pub struct DedupTable<H: DedupHelper> {
    inner: RwLock<TableInner<H>>,
    size: AtomicU64,
}

impl<H: DedupHelper> Default for DedupTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: DedupHelper> DedupTable<H> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                entries: FxIndexMap::default(),
            }),
            size: AtomicU64::new(0),
        }
    }

    /// Ingests profile-local elements, deduplicating by key, and installs the resulting
    /// local-to-global id mapping into `rewriter`.
    pub fn ingest(&self, mut elems: Vec<H::Value>, rewriter: &mut Rewriter) -> Result<(), DbError> {
        let mut conversion = IdConversionTable::default();
        for e in elems.iter_mut() {
            H::rewrite(rewriter, e);
        }
        let keys: Vec<H::Key> = elems.iter().map(H::key).collect();

        let mut missing = Vec::new();
        {
            let inner = self.inner.read()?;
            for (pos, (elem, key)) in elems.iter_mut().zip(&keys).enumerate() {
                match inner.entries.get_index_of(key) {
                    Some(id) => {
                        let local = H::set_id(pos, id as u32, elem);
                        conversion.insert(local, id as u32);
                    }
                    None => missing.push(pos),
                }
            }
        }

        if !missing.is_empty() {
            let mut inner = self.inner.write()?;
            let mut added = 0u64;
            for pos in missing {
                let key = &keys[pos];
                // another writer may have inserted it between the two locks
                let id = match inner.entries.get_index_of(key) {
                    Some(id) => id as u32,
                    None => {
                        let id = inner.entries.len() as u32;
                        let mut value = elems[pos].clone();
                        H::set_id(pos, id, &mut value);
                        added += H::size(&value);
                        inner.entries.insert(key.clone(), value);
                        id
                    }
                };
                let local = H::set_id(pos, id, &mut elems[pos]);
                conversion.insert(local, id);
            }
            self.size.fetch_add(added, Ordering::Relaxed);
        }

        H::add_to_rewriter(rewriter, conversion);
        Ok(())
    }

    /// Appends elements and writes the global id of `elems[i]` to `dst[i]`.
    ///
    /// Known elements are resolved under the read lock; the write lock is taken only when
    /// the batch holds new elements.
    pub fn append(&self, dst: &mut [u32], elems: Vec<H::Value>) -> Result<(), DbError> {
        if dst.len() != elems.len() {
            return Err(DbError::Internal(format!(
                "append destination holds {} ids for {} elements",
                dst.len(),
                elems.len()
            )));
        }
        let mut missing = Vec::new();
        {
            let inner = self.inner.read()?;
            for (pos, elem) in elems.into_iter().enumerate() {
                let key = H::key(&elem);
                match inner.entries.get_index_of(&key) {
                    Some(id) => dst[pos] = id as u32,
                    None => missing.push((pos, key, elem)),
                }
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write()?;
        let mut added = 0u64;
        for (pos, key, mut elem) in missing {
            dst[pos] = match inner.entries.get_index_of(&key) {
                Some(id) => id as u32,
                None => {
                    let id = inner.entries.len() as u32;
                    H::set_id(pos, id, &mut elem);
                    added += H::size(&elem);
                    inner.entries.insert(key, elem);
                    id
                }
            };
        }
        self.size.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, DbError> {
        Ok(self.inner.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Read access to the elements by id.
    pub fn view(&self) -> Result<TableView<'_, H>, DbError> {
        Ok(TableView {
            guard: self.inner.read()?,
        })
    }

    /// Persists all elements in id order.
    pub fn write_to(&self, path: &Path) -> Result<u64, DbError> {
        let inner = self.inner.read()?;
        let values: Vec<&H::Value> = inner.entries.values().collect();
        crate::encoding::write_framed_atomic(path, TABLE_MAGIC, TABLE_VERSION, &values)
    }

    /// Loads a table persisted by [`DedupTable::write_to`]. Ids are preserved.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let values: Vec<H::Value> = crate::encoding::read_framed(path, TABLE_MAGIC, TABLE_VERSION)?;
        Self::from_values(values)
    }

    /// A table whose first ids are taken by `values`; duplicates keep their first id.
    pub fn seeded(values: impl IntoIterator<Item = H::Value>) -> Self {
        let table = Self::new();
        if let Ok(mut inner) = table.inner.write() {
            let mut size = 0u64;
            for mut v in values {
                let key = H::key(&v);
                if !inner.entries.contains_key(&key) {
                    let id = inner.entries.len();
                    H::set_id(id, id as u32, &mut v);
                    size += H::size(&v);
                    inner.entries.insert(key, v);
                }
            }
            table.size.store(size, Ordering::Relaxed);
        }
        table
    }

    pub(crate) fn from_values(values: Vec<H::Value>) -> Result<Self, DbError> {
        let mut entries = FxIndexMap::default();
        entries.reserve(values.len());
        let mut size = 0u64;
        for v in values {
            size += H::size(&v);
            if entries.insert(H::key(&v), v).is_some() {
                return Err(DbError::corruption("duplicate element in persisted table"));
            }
        }
        Ok(Self {
            inner: RwLock::new(TableInner { entries }),
            size: AtomicU64::new(size),
        })
    }
}

pub struct TableView<'a, H: DedupHelper> {
    guard: RwLockReadGuard<'a, TableInner<H>>,
}

impl<H: DedupHelper> TableView<'_, H> {
    pub fn get(&self, id: u32) -> Option<&H::Value> {
        self.guard.entries.get_index(id as usize).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.guard.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &H::Value> {
        self.guard.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u64,
        name: String,
    }

    struct ItemHelper;

    impl DedupHelper for ItemHelper {
        type Value = Item;
        type Key = String;

        fn key(value: &Item) -> String {
            value.name.clone()
        }
        fn rewrite(_: &Rewriter, _: &mut Item) {}
        fn set_id(_: usize, global_id: u32, value: &mut Item) -> u64 {
            let old = value.id;
            value.id = global_id as u64;
            old
        }
        fn size(value: &Item) -> u64 {
            value.name.len() as u64 + 8
        }
        fn add_to_rewriter(rewriter: &mut Rewriter, table: IdConversionTable) {
            rewriter.functions = table;
        }
    }

    fn item(id: u64, name: &str) -> Item {
        Item {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn ingest_deduplicates_and_maps_local_ids() {
        let table: DedupTable<ItemHelper> = DedupTable::new();
        let mut rw = Rewriter::default();
        table
            .ingest(vec![item(7, "main"), item(9, "foo")], &mut rw)
            .unwrap();
        assert_eq!(rw.functions.rewrite(7), 0);
        assert_eq!(rw.functions.rewrite(9), 1);

        let mut rw = Rewriter::default();
        table
            .ingest(vec![item(1, "foo"), item(2, "bar")], &mut rw)
            .unwrap();
        assert_eq!(rw.functions.rewrite(1), 1);
        assert_eq!(rw.functions.rewrite(2), 2);
        assert_eq!(table.len().unwrap(), 3);

        let view = table.view().unwrap();
        assert_eq!(view.get(2).map(|i| i.name.as_str()), Some("bar"));
        assert_eq!(view.get(2).map(|i| i.id), Some(2));
    }

    #[test]
    #[should_panic(expected = "no entry for id 42")]
    fn rewriting_an_unknown_id_panics() {
        IdConversionTable::default().rewrite(42);
    }

    #[test]
    fn size_counts_only_new_elements() {
        let table: DedupTable<ItemHelper> = DedupTable::new();
        let mut rw = Rewriter::default();
        table.ingest(vec![item(1, "abcd")], &mut rw).unwrap();
        table.ingest(vec![item(1, "abcd")], &mut rw).unwrap();
        assert_eq!(table.size(), 12);
    }

    #[test]
    fn concurrent_ingest_of_identical_elements_stores_one_copy() {
        let table: Arc<DedupTable<ItemHelper>> = Arc::new(DedupTable::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let mut rw = Rewriter::default();
                    table
                        .ingest(vec![item(t, "shared"), item(100 + t, "other")], &mut rw)
                        .unwrap();
                    (rw.functions.rewrite(t), rw.functions.rewrite(100 + t))
                })
            })
            .collect();
        let ids: Vec<(u32, u32)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(table.len().unwrap(), 2);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn append_writes_ids_in_order() {
        let table: DedupTable<ItemHelper> = DedupTable::new();
        let mut dst = vec![0u32; 3];
        table
            .append(&mut dst, vec![item(0, "a"), item(0, "b"), item(0, "a")])
            .unwrap();
        assert_eq!(dst, vec![0, 1, 0]);
    }

    #[test]
    fn append_of_known_elements_does_not_take_the_write_lock() {
        let table: DedupTable<ItemHelper> = DedupTable::new();
        let mut dst = vec![0u32; 2];
        table.append(&mut dst, vec![item(0, "a"), item(0, "b")]).unwrap();

        // a held read guard would deadlock a writer on this thread
        let view = table.view().unwrap();
        let mut again = vec![9u32; 3];
        table
            .append(&mut again, vec![item(0, "b"), item(0, "a"), item(0, "b")])
            .unwrap();
        assert_eq!(again, vec![1, 0, 1]);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn concurrent_append_assigns_one_id_per_element() {
        let table: Arc<DedupTable<ItemHelper>> = Arc::new(DedupTable::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let mut dst = vec![0u32; 3];
                    let own = format!("own-{}", t);
                    table
                        .append(&mut dst, vec![item(0, "a"), item(0, &own), item(0, "b")])
                        .unwrap();
                    (dst[0], dst[2])
                })
            })
            .collect();
        let shared: Vec<(u32, u32)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(shared.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.len().unwrap(), 10);
    }

    #[test]
    fn persisted_table_keeps_ids() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("items.bin");
        let table: DedupTable<ItemHelper> = DedupTable::new();
        let mut rw = Rewriter::default();
        table
            .ingest(vec![item(5, "x"), item(6, "y")], &mut rw)
            .unwrap();
        table.write_to(&path).unwrap();

        let back: DedupTable<ItemHelper> = DedupTable::open(&path).unwrap();
        let view = back.view().unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1), Some(&item(1, "y")));
        assert_eq!(back.size(), table.size());
    }
}
