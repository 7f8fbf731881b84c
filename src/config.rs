// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Engine, KdTreeFile};
use std::path::{Path, PathBuf};

/// Default mmap-equivalent slab size of the entry/node arenas (8 MiB)
pub const DEFAULT_ALLOCATE_UNIT_SIZE: usize = 8 * 1_024 * 1_024;

/// Default small-file row count that triggers a merge
pub const DEFAULT_MERGE_COUNT_THRESHOLD: u32 = 100_000;

/// Default deletions applied per latched batch during a merge
pub const DEFAULT_UNIT_MERGE_EXPUNGE_COUNT: usize = 1_000;

/// Default merge-side pages drained per latched batch during a merge
pub const DEFAULT_UNIT_MERGE_INSERT_PAGE_COUNT: usize = 5;

/// Default sub-file page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 4_096;

/// KD-tree store configuration
///
/// # Examples
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use kd_index::{Config, Engine};
///
/// let engine = Engine::new();
/// let file = Config::new(folder.path(), 128).open(&engine)?;
/// # Ok::<(), kd_index::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) dimension: usize,
    pub(crate) allocate_unit_size: usize,
    pub(crate) merge_count_threshold: u32,
    pub(crate) unit_merge_expunge_count: usize,
    pub(crate) unit_merge_insert_page_count: usize,
    pub(crate) page_size: usize,
    pub(crate) thread_count: usize,
}

impl Config {
    /// Creates a configuration for a store at `path` indexing vectors
    /// of `dimension` components.
    ///
    /// # Panics
    ///
    /// Panics if the dimension is 0 or exceeds 16 bits (the flags word
    /// reserves its low 16 bits for it).
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P, dimension: usize) -> Self {
        assert!(
            dimension >= 1 && dimension <= 0xFFFF,
            "dimension must fit the low 16 bits of the flags word"
        );

        Self {
            path: path.as_ref().to_path_buf(),
            dimension,
            allocate_unit_size: DEFAULT_ALLOCATE_UNIT_SIZE,
            merge_count_threshold: DEFAULT_MERGE_COUNT_THRESHOLD,
            unit_merge_expunge_count: DEFAULT_UNIT_MERGE_EXPUNGE_COUNT,
            unit_merge_insert_page_count: DEFAULT_UNIT_MERGE_INSERT_PAGE_COUNT,
            page_size: DEFAULT_PAGE_SIZE,
            thread_count: crate::parallel::default_threads(),
        }
    }

    /// Sets the slab size of the entry/node arenas.
    #[must_use]
    pub fn allocate_unit_size(mut self, bytes: usize) -> Self {
        self.allocate_unit_size = bytes.max(1);
        self
    }

    /// Sets the small-file row count that triggers a background merge.
    #[must_use]
    pub fn merge_count_threshold(mut self, count: u32) -> Self {
        self.merge_count_threshold = count.max(1);
        self
    }

    /// Sets how many deletions one latched merge batch applies.
    #[must_use]
    pub fn unit_merge_expunge_count(mut self, count: usize) -> Self {
        self.unit_merge_expunge_count = count.max(1);
        self
    }

    /// Sets how many merge-side pages one latched merge batch drains.
    #[must_use]
    pub fn unit_merge_insert_page_count(mut self, pages: usize) -> Self {
        self.unit_merge_insert_page_count = pages.max(1);
        self
    }

    /// Sets the sub-file page size.
    #[must_use]
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Pins the worker pool width for builds and batched searches.
    #[must_use]
    pub fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads.max(1);
        self
    }

    /// Opens (creating if necessary) the store.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open(self, engine: &Engine) -> crate::Result<KdTreeFile> {
        KdTreeFile::open(engine, self)
    }
}
