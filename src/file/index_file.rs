// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{archiver::Archiver, paged::PagedFile};
use std::path::Path;

/// The serialized KD-tree dump
///
/// Rewritten wholesale on every main rebuild. All writes stay buffered
/// until the dump completed, so an aborted dump rolls back to the last
/// committed tree.
pub(crate) struct IndexFile {
    paged: PagedFile,
}

impl IndexFile {
    pub fn open(path: &Path, page_size: usize) -> crate::Result<Self> {
        Ok(Self {
            paged: PagedFile::open(path, page_size)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.paged.path()
    }

    /// `true` once a dump was committed.
    pub fn is_mounted(&self) -> bool {
        self.paged.committed_pages() > 0
    }

    pub fn archiver_write(&self) -> Archiver<'_> {
        Archiver::new_writer(&self.paged)
    }

    pub fn archiver_read(&self) -> crate::Result<Archiver<'_>> {
        Archiver::new_reader(&self.paged)
    }

    /// Commits a finished dump of `pages` pages, truncating any stale
    /// tail of the previous dump.
    pub fn flush_dump(&self, pages: u32) -> crate::Result<()> {
        self.paged.flush(Some(pages))
    }

    pub fn flush(&self) -> crate::Result<()> {
        self.paged.flush(None)
    }

    pub fn recover(&self) {
        self.paged.recover();
    }

    /// Re-reads the whole dump, verifying page checksums.
    pub fn verify(&self, dimension: usize, allocate_unit_size: usize) -> crate::Result<()> {
        if !self.is_mounted() {
            return Ok(());
        }

        let mut index = crate::index::KdTreeIndex::new(dimension, allocate_unit_size);
        index.load(self)
    }
}
