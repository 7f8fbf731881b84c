// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use quick_cache::{sync::Cache as QuickCache, UnitWeighter};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const CACHE_PAGES: usize = 256;

/// One fixed-size page
pub(crate) type Page = Arc<[u8]>;

struct State {
    /// Buffered (discardable) writes, not yet on disk
    dirty: BTreeMap<u32, Page>,

    /// Pages persisted on disk
    committed: u32,
}

/// Fixed-size-page file with discardable buffered writes
///
/// Writes go through [`PagedFile::update`] into an in-memory buffer;
/// [`PagedFile::flush`] persists them, [`PagedFile::recover`] rolls the
/// file back to its last flushed state. This is the slice of the
/// host's versioned page layer the KD-tree core consumes.
pub(crate) struct PagedFile {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    state: Mutex<State>,
    cache: QuickCache<u32, Page, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl PagedFile {
    pub fn open(path: &Path, page_size: usize) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        #[allow(clippy::cast_possible_truncation)]
        let committed = (len / page_size as u64) as u32;

        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::default_trait_access)]
        let cache = QuickCache::with(
            CACHE_PAGES,
            CACHE_PAGES as u64,
            UnitWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_size,
            state: Mutex::new(State {
                dirty: BTreeMap::new(),
                committed,
            }),
            cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of addressable pages, buffered writes included.
    pub fn page_count(&self) -> u32 {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        let dirty_end = state.dirty.last_key_value().map_or(0, |(k, _)| k + 1);
        state.committed.max(dirty_end)
    }

    /// Number of pages persisted on disk.
    #[allow(clippy::expect_used)]
    pub fn committed_pages(&self) -> u32 {
        self.state.lock().expect("lock is poisoned").committed
    }

    /// Fixes a page, or returns `None` past the end of the file.
    pub fn try_fix(&self, id: u32) -> crate::Result<Option<Page>> {
        {
            #[allow(clippy::expect_used)]
            let state = self.state.lock().expect("lock is poisoned");

            if let Some(page) = state.dirty.get(&id) {
                return Ok(Some(page.clone()));
            }

            if id >= state.committed {
                return Ok(None);
            }
        }

        if let Some(page) = self.cache.get(&id) {
            return Ok(Some(page));
        }

        let mut buf = vec![0u8; self.page_size];
        {
            #[allow(clippy::expect_used)]
            let file = self.file.lock().expect("lock is poisoned");
            read_exact_at(&file, &mut buf, id as u64 * self.page_size as u64)?;
        }

        let page: Page = Arc::from(buf.into_boxed_slice());
        self.cache.insert(id, page.clone());
        Ok(Some(page))
    }

    /// Fixes a page that must exist.
    pub fn fix(&self, id: u32) -> crate::Result<Page> {
        self.try_fix(id)?.ok_or(crate::Error::IndexFileCorrupted(
            "page read past end of file",
        ))
    }

    /// Buffers a full-page write; discardable until [`Self::flush`].
    pub fn update(&self, id: u32, page: Vec<u8>) {
        debug_assert_eq!(self.page_size, page.len());

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        state.dirty.insert(id, Arc::from(page.into_boxed_slice()));
    }

    /// Copies the current content of `id` (zeroed when absent), applies
    /// `f` and buffers the result.
    pub fn modify<F: FnOnce(&mut [u8])>(&self, id: u32, f: F) -> crate::Result<()> {
        let mut buf = match self.try_fix(id)? {
            Some(page) => page.to_vec(),
            None => vec![0u8; self.page_size],
        };
        f(&mut buf);
        self.update(id, buf);
        Ok(())
    }

    /// Persists all buffered writes; with `truncate_to`, the file is
    /// cut to exactly that many pages (stale tail pages of a wholesale
    /// rewrite disappear).
    pub fn flush(&self, truncate_to: Option<u32>) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        if state.dirty.is_empty() && truncate_to.is_none() {
            return Ok(());
        }

        #[allow(clippy::expect_used)]
        let file = self.file.lock().expect("lock is poisoned");

        for (id, page) in &state.dirty {
            write_all_at(&file, page, u64::from(*id) * self.page_size as u64)?;
        }

        let dirty_end = state.dirty.last_key_value().map_or(0, |(k, _)| k + 1);
        let mut committed = state.committed.max(dirty_end);

        if let Some(pages) = truncate_to {
            file.set_len(u64::from(pages) * self.page_size as u64)?;
            committed = pages;

            // drop cached pages that may lie beyond the new length
            self.cache.clear();

            // wholesale rewrites are commit points
            file.sync_data()?;
        }

        for (id, page) in std::mem::take(&mut state.dirty) {
            if id < committed {
                self.cache.insert(id, page);
            }
        }

        state.committed = committed;
        Ok(())
    }

    /// Discards all buffered writes, rolling back to the last flush.
    pub fn recover(&self) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        state.dirty.clear();
    }

}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
