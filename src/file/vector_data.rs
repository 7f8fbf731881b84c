// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    data::{decode_entry_into, encode_entry, DataFile},
    paged::PagedFile,
    MAGIC_BYTES,
};
use crate::arena::{entry_size, EntryBatch};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

const COUNT_OFFSET: usize = 4;

/// Dense ROWID-keyed vector storage ("master" data file)
///
/// Page 0 is the header; every data page carries a slot-present bitmap
/// followed by fixed-size entry records. The page and slot of a rowid
/// are pure functions of the rowid, so lookups are O(1) page fixes.
pub(crate) struct VectorDataFile {
    paged: PagedFile,
    dimension: usize,
    entry_size: usize,
    per_page: usize,
    bitmap_bytes: usize,
}

impl VectorDataFile {
    pub fn open(path: &Path, dimension: usize, page_size: usize) -> crate::Result<Self> {
        let record = entry_size(dimension);

        // fit n records plus an n-bit bitmap (rounded to 8 bytes)
        let mut per_page = page_size * 8 / (record * 8 + 1);
        while per_page > 1 && bitmap_bytes(per_page) + per_page * record > page_size {
            per_page -= 1;
        }
        assert!(
            per_page >= 1 && bitmap_bytes(per_page) + record <= page_size,
            "page size too small for one vector record"
        );

        let paged = PagedFile::open(path, page_size)?;

        if paged.committed_pages() == 0 {
            let mut header = vec![0u8; page_size];
            #[allow(clippy::indexing_slicing)]
            header[..4].copy_from_slice(&MAGIC_BYTES);
            paged.update(0, header);
            paged.flush(None)?;
        } else {
            let header = paged.fix(0)?;
            if header.get(..4) != Some(&MAGIC_BYTES) {
                return Err(crate::Error::InvalidHeader("vector data file"));
            }
        }

        Ok(Self {
            paged,
            dimension,
            entry_size: record,
            per_page,
            bitmap_bytes: bitmap_bytes(per_page),
        })
    }

    fn location(&self, rowid: u32) -> (u32, usize) {
        #[allow(clippy::cast_possible_truncation)]
        let page = 1 + rowid / self.per_page as u32;
        let slot = rowid as usize % self.per_page;
        (page, slot)
    }

    fn slot_offset(&self, slot: usize) -> usize {
        self.bitmap_bytes + slot * self.entry_size
    }

    /// Inserts a row; the slot for its rowid must be empty.
    pub fn insert(&self, rowid: u32, values: &[f32]) -> crate::Result<()> {
        debug_assert_eq!(self.dimension, values.len());

        let (page_id, slot) = self.location(rowid);
        let offset = self.slot_offset(slot);

        self.paged.modify(page_id, |page| {
            #[allow(clippy::indexing_slicing)]
            {
                page[slot / 8] |= 1 << (slot % 8);
            }
            #[allow(clippy::cast_possible_truncation)]
            encode_entry(page, offset, rowid, self.dimension as u32, values);
        })?;

        self.bump_count(1)
    }

    /// Clears the slot of `rowid`; it must be present.
    pub fn expunge(&self, rowid: u32) -> crate::Result<()> {
        let (page_id, slot) = self.location(rowid);

        self.paged.modify(page_id, |page| {
            #[allow(clippy::indexing_slicing)]
            {
                page[slot / 8] &= !(1 << (slot % 8));
            }
        })?;

        self.bump_count(-1)
    }

    /// Whether the slot of `rowid` holds a row.
    #[allow(clippy::indexing_slicing)]
    pub fn test(&self, rowid: u32) -> crate::Result<bool> {
        let (page_id, slot) = self.location(rowid);

        let Some(page) = self.paged.try_fix(page_id)? else {
            return Ok(false);
        };

        Ok(page[slot / 8] & (1 << (slot % 8)) != 0)
    }

    pub fn get(&self, rowid: u32) -> crate::Result<Option<Vec<f32>>> {
        if !self.test(rowid)? {
            return Ok(None);
        }

        let (page_id, slot) = self.location(rowid);
        let page = self.paged.fix(page_id)?;

        let mut batch = EntryBatch::default();
        decode_entry_into(&page, self.slot_offset(slot), self.dimension, &mut batch);
        Ok(Some(batch.values))
    }

    fn bump_count(&self, delta: i64) -> crate::Result<()> {
        self.paged.modify(0, |page| {
            #[allow(clippy::indexing_slicing)]
            let slot = &mut page[COUNT_OFFSET..COUNT_OFFSET + 4];
            let count = i64::from(LittleEndian::read_u32(slot)) + delta;
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            LittleEndian::write_u32(slot, count.max(0) as u32);
        })
    }

    pub fn flush(&self) -> crate::Result<()> {
        self.paged.flush(None)
    }

    pub fn recover(&self) {
        self.paged.recover();
    }

    /// Re-counts the presence bitmaps and compares against the header.
    pub fn verify(&self) -> crate::Result<()> {
        let mut live = 0u32;
        let mut page_id = None;

        while let Some(id) = DataFile::next_page_id(self, page_id)? {
            let Some(page) = self.paged.try_fix(id)? else {
                page_id = Some(id);
                continue;
            };
            for slot in 0..self.per_page {
                #[allow(clippy::indexing_slicing)]
                if page[slot / 8] & (1 << (slot % 8)) != 0 {
                    live += 1;
                }
            }
            page_id = Some(id);
        }

        if live == self.count()? {
            Ok(())
        } else {
            Err(crate::Error::InvalidHeader(
                "vector data count diverges from bitmaps",
            ))
        }
    }
}

impl DataFile for VectorDataFile {
    #[allow(clippy::indexing_slicing)]
    fn count(&self) -> crate::Result<u32> {
        let header = self.paged.fix(0)?;
        Ok(LittleEndian::read_u32(
            &header[COUNT_OFFSET..COUNT_OFFSET + 4],
        ))
    }

    fn count_per_page(&self) -> usize {
        self.per_page
    }

    fn next_page_id(&self, current: Option<u32>) -> crate::Result<Option<u32>> {
        let next = current.map_or(1, |c| c + 1);
        Ok((next < self.paged.page_count()).then_some(next))
    }

    fn read_page(&self, page_id: u32, out: &mut EntryBatch) -> crate::Result<()> {
        // never-written pages inside the address range are empty
        let Some(page) = self.paged.try_fix(page_id)? else {
            return Ok(());
        };

        for slot in 0..self.per_page {
            #[allow(clippy::indexing_slicing)]
            let present = page[slot / 8] & (1 << (slot % 8)) != 0;
            if present {
                decode_entry_into(&page, self.slot_offset(slot), self.dimension, out);
            }
        }

        Ok(())
    }
}

fn bitmap_bytes(per_page: usize) -> usize {
    per_page.div_ceil(8).div_ceil(8) * 8
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use super::*;
    use test_log::test;

    #[test]
    fn insert_test_get_expunge() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = VectorDataFile::open(&dir.path().join("master"), 2, 4096)?;

        assert_eq!(0, file.count()?);
        assert!(!file.test(7)?);

        file.insert(7, &[1.0, 2.0])?;
        file.insert(9_000, &[3.0, 4.0])?;
        file.flush()?;

        assert_eq!(2, file.count()?);
        assert!(file.test(7)?);
        assert_eq!(Some(vec![1.0, 2.0]), file.get(7)?);
        assert_eq!(Some(vec![3.0, 4.0]), file.get(9_000)?);

        file.expunge(7)?;
        file.flush()?;
        assert!(!file.test(7)?);
        assert_eq!(1, file.count()?);

        file.verify()
    }

    #[test]
    fn page_enumeration_sees_all_rows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = VectorDataFile::open(&dir.path().join("master"), 2, 512)?;

        for rowid in 0..300u32 {
            #[allow(clippy::cast_precision_loss)]
            file.insert(rowid, &[rowid as f32, 0.0])?;
        }
        file.flush()?;

        let mut batch = EntryBatch::default();
        let mut page = None;
        while let Some(id) = file.next_page_id(page)? {
            file.read_page(id, &mut batch)?;
            page = Some(id);
        }

        assert_eq!(300, batch.len());
        let mut rowids = batch.rowids.clone();
        rowids.sort_unstable();
        assert_eq!((0..300u32).collect::<Vec<_>>(), rowids);

        Ok(())
    }

    #[test]
    fn reopen_preserves_count() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("master");

        {
            let file = VectorDataFile::open(&path, 2, 512)?;
            file.insert(1, &[0.5, 0.5])?;
            file.flush()?;
        }

        let file = VectorDataFile::open(&path, 2, 512)?;
        assert_eq!(1, file.count()?);
        assert_eq!(Some(vec![0.5, 0.5]), file.get(1)?);

        Ok(())
    }
}
