// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    data::{decode_entry_into, decode_rowid, encode_entry, DataFile},
    paged::PagedFile,
    MAGIC_BYTES,
};
use crate::{
    arena::{entry_size, EntryBatch},
    bitset::RowIdSet,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

const COUNT_OFFSET: usize = 4;
const PAGE_HEADER: usize = 8;
const WORDS_OFFSET: usize = 4;

/// Small-file backing store: rowid-ordered leaf pages plus a companion
/// tombstone bitset file
///
/// Rows living in this file are expunged physically; deletions of rows
/// that live elsewhere (in the master file) go into the tombstone set.
/// An in-memory page directory, rebuilt on open, routes lookups.
pub(crate) struct BtreeDataFile {
    paged: PagedFile,
    tomb: PagedFile,
    dimension: usize,
    entry_size: usize,
    per_page: usize,
    state: Mutex<BtreeState>,
}

#[derive(Default)]
struct BtreeState {
    /// `(min rowid, page id)` per non-empty leaf, ascending by min
    directory: Vec<(u32, u32)>,

    expunged: RowIdSet,
    tomb_dirty: bool,
}

impl BtreeDataFile {
    pub fn open(
        path: &Path,
        tomb_path: &Path,
        dimension: usize,
        page_size: usize,
    ) -> crate::Result<Self> {
        let record = entry_size(dimension);
        let per_page = (page_size - PAGE_HEADER) / record;
        assert!(per_page >= 2, "page size too small for two records");

        let paged = PagedFile::open(path, page_size)?;
        let tomb = PagedFile::open(tomb_path, page_size)?;

        for file in [&paged, &tomb] {
            if file.committed_pages() == 0 {
                let mut header = vec![0u8; page_size];
                #[allow(clippy::indexing_slicing)]
                header[..4].copy_from_slice(&MAGIC_BYTES);
                file.update(0, header);
                file.flush(None)?;
            } else {
                let header = file.fix(0)?;
                if header.get(..4) != Some(&MAGIC_BYTES) {
                    return Err(crate::Error::InvalidHeader("small data file"));
                }
            }
        }

        let file = Self {
            paged,
            tomb,
            dimension,
            entry_size: record,
            per_page,
            state: Mutex::new(BtreeState::default()),
        };

        {
            #[allow(clippy::expect_used)]
            let mut state = file.state.lock().expect("lock is poisoned");
            file.reload(&mut state)?;
        }

        Ok(file)
    }

    /// Rebuilds the page directory and tombstone set from committed
    /// state.
    fn reload(&self, state: &mut BtreeState) -> crate::Result<()> {
        state.directory.clear();

        for page_id in 1..self.paged.page_count() {
            let Some(page) = self.paged.try_fix(page_id)? else {
                continue;
            };
            if page_used(&page) > 0 {
                state.directory.push((decode_rowid(&page, PAGE_HEADER), page_id));
            }
        }
        state.directory.sort_unstable();

        state.expunged.clear();
        state.tomb_dirty = false;

        let header = self.tomb.fix(0)?;
        #[allow(clippy::indexing_slicing)]
        let word_count = LittleEndian::read_u32(&header[WORDS_OFFSET..WORDS_OFFSET + 4]) as usize;

        let words_per_page = self.tomb.page_size() / 8;
        for i in 0..word_count {
            #[allow(clippy::cast_possible_truncation)]
            let page_id = 1 + (i / words_per_page) as u32;
            let offset = (i % words_per_page) * 8;

            let page = self.tomb.fix(page_id)?;
            #[allow(clippy::indexing_slicing)]
            let word = LittleEndian::read_u64(&page[offset..offset + 8]);

            for bit in 0u32..64 {
                if word & (1u64 << bit) != 0 {
                    #[allow(clippy::cast_possible_truncation)]
                    state.expunged.set((i * 64) as u32 + bit);
                }
            }
        }

        Ok(())
    }

    /// Directory slot of the leaf that should hold `rowid`.
    fn route(directory: &[(u32, u32)], rowid: u32) -> Option<usize> {
        if directory.is_empty() {
            return None;
        }

        match directory.binary_search_by_key(&rowid, |(min, _)| *min) {
            Ok(i) => Some(i),
            // below the smallest min the first page takes it
            Err(0) => Some(0),
            Err(i) => Some(i - 1),
        }
    }

    pub fn insert(&self, rowid: u32, values: &[f32]) -> crate::Result<()> {
        debug_assert_eq!(self.dimension, values.len());

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let page_id = if state.directory.is_empty() {
            let id = self.paged.page_count().max(1);
            self.paged.update(id, vec![0u8; self.paged.page_size()]);
            state.directory.push((rowid, id));
            id
        } else {
            #[allow(clippy::expect_used)]
            let slot = Self::route(&state.directory, rowid).expect("directory is not empty");
            #[allow(clippy::indexing_slicing)]
            let (_, id) = state.directory[slot];
            id
        };

        let page_id = self.insert_into_page(&mut state, page_id, rowid, values)?;

        // keep the routing min accurate
        if let Some(slot) = state.directory.iter_mut().find(|(_, id)| *id == page_id) {
            if rowid < slot.0 {
                slot.0 = rowid;
                state.directory.sort_unstable();
            }
        }

        self.bump_count(1)
    }

    fn insert_into_page(
        &self,
        state: &mut MutexGuard<'_, BtreeState>,
        page_id: u32,
        rowid: u32,
        values: &[f32],
    ) -> crate::Result<u32> {
        let page = self.paged.fix(page_id)?;
        let used = page_used(&page);

        if used == self.per_page {
            // split: the upper half moves to a fresh page
            let keep = used / 2;
            let moved = used - keep;

            let new_id = self.paged.page_count();
            let mut fresh = vec![0u8; self.paged.page_size()];

            #[allow(clippy::indexing_slicing)]
            {
                let src = PAGE_HEADER + keep * self.entry_size;
                let len = moved * self.entry_size;
                fresh[PAGE_HEADER..PAGE_HEADER + len].copy_from_slice(&page[src..src + len]);
            }
            set_page_used(&mut fresh, moved);
            let new_min = decode_rowid(&fresh, PAGE_HEADER);

            let mut old = page.to_vec();
            set_page_used(&mut old, keep);
            #[allow(clippy::indexing_slicing)]
            {
                let tail = PAGE_HEADER + keep * self.entry_size;
                old[tail..].fill(0);
            }

            self.paged.update(page_id, old);
            self.paged.update(new_id, fresh);

            state.directory.push((new_min, new_id));
            state.directory.sort_unstable();

            let target = if rowid >= new_min { new_id } else { page_id };
            return self.insert_into_page(state, target, rowid, values);
        }

        let mut buf = page.to_vec();

        // records stay sorted by rowid within the page
        let mut pos = 0;
        while pos < used && decode_rowid(&buf, PAGE_HEADER + pos * self.entry_size) < rowid {
            pos += 1;
        }

        #[allow(clippy::indexing_slicing)]
        {
            let start = PAGE_HEADER + pos * self.entry_size;
            let end = PAGE_HEADER + used * self.entry_size;
            buf.copy_within(start..end, start + self.entry_size);
        }

        #[allow(clippy::cast_possible_truncation)]
        encode_entry(
            &mut buf,
            PAGE_HEADER + pos * self.entry_size,
            rowid,
            self.dimension as u32,
            values,
        );
        set_page_used(&mut buf, used + 1);

        self.paged.update(page_id, buf);
        Ok(page_id)
    }

    /// Deletes `rowid`: physically when it lives in this file, as a
    /// tombstone bit otherwise.
    pub fn expunge(&self, rowid: u32) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        if let Some((slot, page_id, pos, used)) = self.locate(&state, rowid)? {
            let page = self.paged.fix(page_id)?;
            let mut buf = page.to_vec();

            #[allow(clippy::indexing_slicing)]
            {
                let start = PAGE_HEADER + (pos + 1) * self.entry_size;
                let end = PAGE_HEADER + used * self.entry_size;
                buf.copy_within(start..end, start - self.entry_size);
                let tail = PAGE_HEADER + (used - 1) * self.entry_size;
                buf[tail..tail + self.entry_size].fill(0);
            }
            set_page_used(&mut buf, used - 1);
            self.paged.update(page_id, buf);

            if used - 1 == 0 {
                state.directory.remove(slot);
            } else if pos == 0 {
                let page = self.paged.fix(page_id)?;
                #[allow(clippy::indexing_slicing)]
                {
                    state.directory[slot].0 = decode_rowid(&page, PAGE_HEADER);
                }
            }

            self.bump_count(-1)?;
        } else {
            state.expunged.set(rowid);
            state.tomb_dirty = true;
        }

        Ok(())
    }

    /// Withdraws a tombstone (used when a deleted row is re-inserted).
    pub fn undo_expunge(&self, rowid: u32) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        if state.expunged.unset(rowid) {
            state.tomb_dirty = true;
        }
    }

    fn locate(
        &self,
        state: &BtreeState,
        rowid: u32,
    ) -> crate::Result<Option<(usize, u32, usize, usize)>> {
        let Some(slot) = Self::route(&state.directory, rowid) else {
            return Ok(None);
        };

        #[allow(clippy::indexing_slicing)]
        let (_, page_id) = state.directory[slot];
        let page = self.paged.fix(page_id)?;
        let used = page_used(&page);

        for pos in 0..used {
            let r = decode_rowid(&page, PAGE_HEADER + pos * self.entry_size);
            if r == rowid {
                return Ok(Some((slot, page_id, pos, used)));
            }
            if r > rowid {
                break;
            }
        }

        Ok(None)
    }

    pub fn get(&self, rowid: u32) -> crate::Result<Option<Vec<f32>>> {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");

        let Some((_, page_id, pos, _)) = self.locate(&state, rowid)? else {
            return Ok(None);
        };

        let page = self.paged.fix(page_id)?;
        let mut batch = EntryBatch::default();
        decode_entry_into(&page, PAGE_HEADER + pos * self.entry_size, self.dimension, &mut batch);
        Ok(Some(batch.values))
    }

    #[allow(clippy::expect_used)]
    pub fn expunged_count(&self) -> u32 {
        self.state.lock().expect("lock is poisoned").expunged.len()
    }

    #[allow(clippy::expect_used)]
    pub fn expunged_set(&self) -> RowIdSet {
        self.state.lock().expect("lock is poisoned").expunged.clone()
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

    /// Persists buffered leaf writes and, if touched, the tombstone
    /// set.
    pub fn flush(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        if state.tomb_dirty {
            self.save_tombstones(&state)?;
            state.tomb_dirty = false;
        }

        self.paged.flush(None)?;
        self.tomb.flush(None)
    }

    fn save_tombstones(&self, state: &BtreeState) -> crate::Result<()> {
        let words: Vec<u64> = collect_words(&state.expunged);
        let words_per_page = self.tomb.page_size() / 8;

        self.tomb.modify(0, |header| {
            #[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
            LittleEndian::write_u32(
                &mut header[WORDS_OFFSET..WORDS_OFFSET + 4],
                words.len() as u32,
            );
        })?;

        for (page_index, chunk) in words.chunks(words_per_page).enumerate() {
            let mut page = vec![0u8; self.tomb.page_size()];
            for (i, word) in chunk.iter().enumerate() {
                #[allow(clippy::indexing_slicing)]
                LittleEndian::write_u64(&mut page[i * 8..i * 8 + 8], *word);
            }
            #[allow(clippy::cast_possible_truncation)]
            self.tomb.update(1 + page_index as u32, page);
        }

        Ok(())
    }

    /// Rolls back to the last flush, including the in-memory directory
    /// and tombstone set.
    pub fn recover(&self) -> crate::Result<()> {
        self.paged.recover();
        self.tomb.recover();

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        self.reload(&mut state)
    }

    /// Empties the file and its tombstones.
    pub fn clear(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        for file in [&self.paged, &self.tomb] {
            let mut header = vec![0u8; file.page_size()];
            #[allow(clippy::indexing_slicing)]
            header[..4].copy_from_slice(&MAGIC_BYTES);
            file.update(0, header);
        }

        state.directory.clear();
        state.expunged.clear();
        state.tomb_dirty = false;
        Ok(())
    }

    /// Commits a [`Self::clear`], truncating both files.
    pub fn flush_cleared(&self) -> crate::Result<()> {
        self.paged.flush(Some(1))?;
        self.tomb.flush(Some(1))
    }

    /// Walks the leaves checking record order and the header count.
    pub fn verify(&self) -> crate::Result<()> {
        let mut live = 0usize;
        let mut page_id = None;

        while let Some(id) = DataFile::next_page_id(self, page_id)? {
            let page = self.paged.fix(id)?;
            let used = page_used(&page);
            live += used;

            for pos in 1..used {
                let prev = decode_rowid(&page, PAGE_HEADER + (pos - 1) * self.entry_size);
                let here = decode_rowid(&page, PAGE_HEADER + pos * self.entry_size);
                if prev >= here {
                    return Err(crate::Error::InvalidHeader(
                        "small data leaf out of order",
                    ));
                }
            }

            page_id = Some(id);
        }

        if live == self.count()? as usize {
            Ok(())
        } else {
            Err(crate::Error::InvalidHeader(
                "small data count diverges from leaves",
            ))
        }
    }
}

impl DataFile for BtreeDataFile {
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
        let mut next = current.map_or(1, |c| c + 1);

        while next < self.paged.page_count() {
            if let Some(page) = self.paged.try_fix(next)? {
                if page_used(&page) > 0 {
                    return Ok(Some(next));
                }
            }
            next += 1;
        }

        Ok(None)
    }

    fn read_page(&self, page_id: u32, out: &mut EntryBatch) -> crate::Result<()> {
        let page = self.paged.fix(page_id)?;
        let used = page_used(&page);

        for pos in 0..used {
            decode_entry_into(&page, PAGE_HEADER + pos * self.entry_size, self.dimension, out);
        }

        Ok(())
    }
}

#[allow(clippy::indexing_slicing)]
fn page_used(page: &[u8]) -> usize {
    LittleEndian::read_u16(&page[..2]) as usize
}

fn set_page_used(page: &mut [u8], used: usize) {
    #[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
    LittleEndian::write_u16(&mut page[..2], used as u16);
}

fn collect_words(set: &RowIdSet) -> Vec<u64> {
    let mut words = Vec::new();
    for rowid in set.iter() {
        let index = (rowid / 64) as usize;
        if index >= words.len() {
            words.resize(index + 1, 0);
        }
        #[allow(clippy::indexing_slicing)]
        {
            words[index] |= 1u64 << (rowid % 64);
        }
    }
    words
}
