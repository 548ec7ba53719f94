//! Row-group files holding profile rows.
//!
//! Layout:
//!
//! ```text
//! magic "PDBROWS1" | version u32
//! row group 0 | row group 1 | ...            (bincode Vec<ProfileRow>, crc32 each)
//! index                                      (bincode Vec<RowGroupMeta>)
//! footer magic "PDBRFOOT" | index_offset u64 | index_len u64 | crc32(index) u32
//! ```
//!
//! Files are written to a `.tmp` sibling and renamed into place on [`SegmentWriter::finish`].
//! A [`SegmentReader`] keeps its file handle open, so a reader stays usable after the file
//! is renamed or unlinked.

use crate::encoding::{crc32, read_header, read_u32, read_u64, sync_parent_dir, tmp_path_for};
use crate::error::DbError;
use crate::types::{ProfileRow, Timestamp};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SEG_MAGIC: &[u8; 8] = b"PDBROWS1";
const SEG_FOOTER_MAGIC: &[u8; 8] = b"PDBRFOOT";
const SEG_VERSION: u32 = 1;
const FOOTER_LEN: u64 = 8 + 8 + 8 + 4;

/// Contiguous rows of one series inside a row group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRangeWithSeriesIndex {
    pub row_num: u64,
    pub length: u64,
    pub series_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGroupMeta {
    pub offset: u64,
    pub len: u64,
    pub num_rows: u64,
    pub crc32: u32,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    /// Sorted by `row_num`; empty for row groups written before series indexes exist.
    pub series: Vec<RowRangeWithSeriesIndex>,
}

/// Series index owning `row` in ranges sorted by `row_num`.
pub fn series_for_row(ranges: &[RowRangeWithSeriesIndex], row: u64) -> Option<u32> {
    let i = ranges.partition_point(|r| r.row_num + r.length <= row);
    ranges
        .get(i)
        .filter(|r| r.row_num <= row)
        .map(|r| r.series_index)
}

/// Collapses consecutive rows of equal series index into ranges.
pub fn series_ranges(rows: &[ProfileRow]) -> Vec<RowRangeWithSeriesIndex> {
    let mut out: Vec<RowRangeWithSeriesIndex> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        match out.last_mut() {
            Some(r) if r.series_index == row.series_index => r.length += 1,
            _ => out.push(RowRangeWithSeriesIndex {
                row_num: i as u64,
                length: 1,
                series_index: row.series_index,
            }),
        }
    }
    out
}

impl RowGroupMeta {
    /// Series index owning row `row` (relative to the row group).
    pub fn series_for_row(&self, row: u64) -> Option<u32> {
        series_for_row(&self.series, row)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub num_rows: u64,
    pub num_row_groups: u64,
    pub size_bytes: u64,
}

pub struct SegmentWriter {
    w: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    offset: u64,
    row_groups: Vec<RowGroupMeta>,
}

impl SegmentWriter {
    pub fn create(path: &Path) -> Result<Self, DbError> {
        let tmp_path = tmp_path_for(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SEG_MAGIC)?;
        w.write_all(&SEG_VERSION.to_le_bytes())?;
        Ok(Self {
            w,
            tmp_path,
            final_path: path.to_path_buf(),
            offset: SEG_MAGIC.len() as u64 + 4,
            row_groups: Vec::new(),
        })
    }

    /// Appends one row group. `rows` may be owned rows or shared (`Arc`) rows.
    pub fn write_row_group<R>(
        &mut self,
        rows: &[R],
        series: Vec<RowRangeWithSeriesIndex>,
    ) -> Result<(), DbError>
    where
        R: Borrow<ProfileRow> + Serialize,
    {
        if rows.is_empty() {
            return Ok(());
        }
        let bytes = bincode::serialize(rows)?;
        self.w.write_all(&bytes)?;
        let times = || rows.iter().map(|r| r.borrow().time_nanos);
        let min_time = times().min().unwrap_or(0);
        let max_time = times().max().unwrap_or(0);
        self.row_groups.push(RowGroupMeta {
            offset: self.offset,
            len: bytes.len() as u64,
            num_rows: rows.len() as u64,
            crc32: crc32(&bytes),
            min_time,
            max_time,
            series,
        });
        self.offset += bytes.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<SegmentStats, DbError> {
        let index = bincode::serialize(&self.row_groups)?;
        self.w.write_all(&index)?;
        self.w.write_all(SEG_FOOTER_MAGIC)?;
        self.w.write_all(&self.offset.to_le_bytes())?;
        self.w.write_all(&(index.len() as u64).to_le_bytes())?;
        self.w.write_all(&crc32(&index).to_le_bytes())?;
        self.w.flush()?;
        self.w.get_ref().sync_data()?;
        drop(self.w);

        fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;

        Ok(SegmentStats {
            num_rows: self.row_groups.iter().map(|g| g.num_rows).sum(),
            num_row_groups: self.row_groups.len() as u64,
            size_bytes: fs::metadata(&self.final_path)?.len(),
        })
    }
}

pub struct SegmentReader {
    path: PathBuf,
    file: Mutex<File>,
    row_groups: Vec<RowGroupMeta>,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("path", &self.path)
            .field("row_groups", &self.row_groups.len())
            .finish()
    }
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let mut f = File::open(path)?;
        read_header(&mut f, SEG_MAGIC, SEG_VERSION, path)?;

        let file_len = f.metadata()?.len();
        if file_len < SEG_MAGIC.len() as u64 + 4 + FOOTER_LEN {
            return Err(DbError::corruption(format!("Truncated row file {:?}", path)));
        }
        f.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer_magic = [0u8; 8];
        f.read_exact(&mut footer_magic)?;
        if &footer_magic != SEG_FOOTER_MAGIC {
            return Err(DbError::corruption(format!(
                "Bad row file footer magic in {:?}",
                path
            )));
        }
        let index_offset = read_u64(&mut f)?;
        let index_len = read_u64(&mut f)?;
        let index_crc = read_u32(&mut f)?;
        let data_start = SEG_MAGIC.len() as u64 + 4;
        let index_end = index_offset
            .checked_add(index_len)
            .and_then(|end| end.checked_add(FOOTER_LEN));
        if index_end != Some(file_len) || index_offset < data_start {
            return Err(DbError::corruption(format!(
                "Row file index out of bounds in {:?}",
                path
            )));
        }

        f.seek(SeekFrom::Start(index_offset))?;
        let mut index_bytes = vec![0u8; index_len as usize];
        f.read_exact(&mut index_bytes)?;
        if crc32(&index_bytes) != index_crc {
            return Err(DbError::corruption(format!(
                "Row file index CRC mismatch in {:?}",
                path
            )));
        }
        let row_groups: Vec<RowGroupMeta> = bincode::deserialize(&index_bytes)?;
        for (i, g) in row_groups.iter().enumerate() {
            let in_bounds = g.offset >= data_start
                && g.offset.checked_add(g.len).map_or(false, |end| end <= index_offset);
            if !in_bounds {
                return Err(DbError::corruption(format!(
                    "Row group {} out of bounds in {:?}",
                    i, path
                )));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(f),
            row_groups,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_groups(&self) -> &[RowGroupMeta] {
        &self.row_groups
    }

    pub fn num_rows(&self) -> u64 {
        self.row_groups.iter().map(|g| g.num_rows).sum()
    }

    pub fn read_row_group(&self, i: usize) -> Result<Vec<ProfileRow>, DbError> {
        let meta = self.row_groups.get(i).ok_or_else(|| {
            DbError::Internal(format!("row group {} out of range in {:?}", i, self.path))
        })?;
        let mut block = vec![0u8; meta.len as usize];
        {
            let mut f = self.file.lock()?;
            f.seek(SeekFrom::Start(meta.offset))?;
            f.read_exact(&mut block)?;
        }
        if crc32(&block) != meta.crc32 {
            return Err(DbError::corruption(format!(
                "Row group {} CRC mismatch in {:?}",
                i, self.path
            )));
        }
        let rows: Vec<ProfileRow> = bincode::deserialize(&block)?;
        if rows.len() as u64 != meta.num_rows {
            return Err(DbError::corruption(format!(
                "Row group {} holds {} rows, index says {}",
                i,
                rows.len(),
                meta.num_rows
            )));
        }
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Samples;
    use tempfile::TempDir;

    pub(crate) fn row(fp: u64, t: i64, value: u64) -> ProfileRow {
        ProfileRow {
            id: uuid::Uuid::new_v4(),
            series_fingerprint: fp,
            series_index: 0,
            stacktrace_partition: 0,
            total_value: value,
            samples: Samples {
                stacktrace_ids: vec![0],
                values: vec![value],
                span_ids: vec![],
            },
            time_nanos: t,
            duration_nanos: 0,
            period: 0,
            comments: vec![],
            drop_frames: 0,
            keep_frames: 0,
            default_sample_type: 0,
        }
    }

    #[test]
    fn row_groups_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiles.seg");
        let mut w = SegmentWriter::create(&path).unwrap();
        let g0: Vec<ProfileRow> = (0..3).map(|i| row(1, i, 10)).collect();
        let g1: Vec<ProfileRow> = (3..5).map(|i| row(2, i, 20)).collect();
        w.write_row_group(&g0, vec![]).unwrap();
        w.write_row_group(&g1, vec![]).unwrap();
        let stats = w.finish().unwrap();
        assert_eq!(stats.num_rows, 5);
        assert_eq!(stats.num_row_groups, 2);

        let r = SegmentReader::open(&path).unwrap();
        assert_eq!(r.num_rows(), 5);
        assert_eq!(r.read_row_group(1).unwrap(), g1);
        assert_eq!(r.row_groups()[0].min_time, 0);
        assert_eq!(r.row_groups()[0].max_time, 2);
        assert!(r.read_row_group(2).is_err());
    }

    #[test]
    fn corrupt_footer_offsets_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.seg");
        let mut w = SegmentWriter::create(&path).unwrap();
        w.write_row_group(&[row(1, 1, 1)], vec![]).unwrap();
        w.finish().unwrap();
        let good = fs::read(&path).unwrap();
        let footer = good.len() - FOOTER_LEN as usize;

        // index_len so large that offset + len wraps
        let mut bytes = good.clone();
        bytes[footer + 16..footer + 24].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        let err = SegmentReader::open(&path).unwrap_err();
        assert!(matches!(err, DbError::Corruption { .. }));

        let mut bytes = good;
        bytes[footer + 8..footer + 16].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        let err = SegmentReader::open(&path).unwrap_err();
        assert!(matches!(err, DbError::Corruption { .. }));
    }

    #[test]
    fn reader_survives_unlink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.seg");
        let mut w = SegmentWriter::create(&path).unwrap();
        w.write_row_group(&[row(1, 1, 1)], vec![]).unwrap();
        w.finish().unwrap();
        let r = SegmentReader::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(r.read_row_group(0).unwrap().len(), 1);
    }

    #[test]
    fn series_ranges_are_binary_searchable() {
        let meta = RowGroupMeta {
            offset: 0,
            len: 0,
            num_rows: 6,
            crc32: 0,
            min_time: 0,
            max_time: 0,
            series: vec![
                RowRangeWithSeriesIndex { row_num: 0, length: 2, series_index: 4 },
                RowRangeWithSeriesIndex { row_num: 2, length: 3, series_index: 7 },
                RowRangeWithSeriesIndex { row_num: 5, length: 1, series_index: 9 },
            ],
        };
        assert_eq!(meta.series_for_row(0), Some(4));
        assert_eq!(meta.series_for_row(1), Some(4));
        assert_eq!(meta.series_for_row(2), Some(7));
        assert_eq!(meta.series_for_row(5), Some(9));
        assert_eq!(meta.series_for_row(6), None);
    }

    #[test]
    fn consecutive_series_collapse_into_ranges() {
        let mut rows: Vec<ProfileRow> = (0..5).map(|i| row(1, i, 1)).collect();
        for (r, idx) in rows.iter_mut().zip([0u32, 0, 2, 2, 3]) {
            r.series_index = idx;
        }
        let ranges = series_ranges(&rows);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1], RowRangeWithSeriesIndex { row_num: 2, length: 2, series_index: 2 });
        assert_eq!(series_for_row(&ranges, 4), Some(3));
    }

    #[test]
    fn shared_rows_encode_like_owned_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arc.seg");
        let rows = vec![std::sync::Arc::new(row(1, 5, 2)), std::sync::Arc::new(row(1, 6, 3))];
        let mut w = SegmentWriter::create(&path).unwrap();
        w.write_row_group(&rows, vec![]).unwrap();
        w.finish().unwrap();
        let back = SegmentReader::open(&path).unwrap().read_row_group(0).unwrap();
        assert_eq!(back[1], *rows[1]);
        assert_eq!(back[0].time_nanos, 5);
    }

    #[test]
    fn corrupt_row_group_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.seg");
        let mut w = SegmentWriter::create(&path).unwrap();
        w.write_row_group(&[row(1, 1, 1), row(1, 2, 1)], vec![]).unwrap();
        w.finish().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[14] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        let r = SegmentReader::open(&path).unwrap();
        assert!(matches!(r.read_row_group(0), Err(DbError::Corruption { .. })));
    }
}
