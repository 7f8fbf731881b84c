// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The store façade and its five sub-files.

pub(crate) mod archiver;
pub(crate) mod btree_data;
pub(crate) mod data;
pub(crate) mod index_file;
pub(crate) mod info;
pub(crate) mod paged;
pub(crate) mod vector_data;

pub(crate) use archiver::Archiver;
pub(crate) use btree_data::BtreeDataFile;
pub(crate) use data::DataFile;
pub(crate) use index_file::IndexFile;
pub(crate) use info::InfoFile;
pub use info::SmallRole;
pub(crate) use vector_data::VectorDataFile;

use crate::{
    abort::AbortSignal,
    arena::EXPUNGED_BIT,
    arena::EntryBatch,
    engine::EngineInner,
    index::KdTreeIndex,
    index_set::KdTreeIndexSet,
    merge_reserve::JobType,
    parallel::{self, DoSearch},
    search::QueryResult,
    tx::Transaction,
    Config, Engine, TraceType,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

/// Magic bytes opening every sub-file header
pub const MAGIC_BYTES: [u8; 4] = [b'K', b'D', b'T', 1];

const INFO_FILE: &str = "info";
const MASTER_FILE: &str = "master";
const INDEX_FILE: &str = "index";
const SMALL1_FILE: &str = "log1";
const SMALL1_TOMB_FILE: &str = "log1.tomb";
const SMALL2_FILE: &str = "log2";
const SMALL2_TOMB_FILE: &str = "log2.tomb";

/// Outcome of a consistency check
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerifyReport {
    /// Number of sub-files walked
    pub sub_files_checked: usize,
}

/// One KD-tree store
///
/// Owns the five sub-files (info, master vector data, index dump and
/// the two small B-tree files) and routes inserts, deletions and
/// queries between the main index and the write-absorbing small
/// indices. Cloning shares the store.
#[derive(Clone)]
pub struct KdTreeFile {
    inner: Arc<FileInner>,
}

pub(crate) struct FileInner {
    config: Config,
    path: PathBuf,
    engine: Arc<EngineInner>,

    /// Store latch; held over any sub-file mutation so writes to a
    /// small index and its backing file appear atomic to readers
    latch: Mutex<()>,

    info: InfoFile,
    data: VectorDataFile,
    index_file: IndexFile,
    small1: BtreeDataFile,
    small2: BtreeDataFile,

    batch: AtomicBool,
}

impl KdTreeFile {
    pub(crate) fn open(engine: &Engine, config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let path = config.path.clone();
        let page_size = config.page_size;
        let dimension = config.dimension;

        let inner = Arc::new(FileInner {
            info: InfoFile::open(&path.join(INFO_FILE), page_size)?,
            data: VectorDataFile::open(&path.join(MASTER_FILE), dimension, page_size)?,
            index_file: IndexFile::open(&path.join(INDEX_FILE), page_size)?,
            small1: BtreeDataFile::open(
                &path.join(SMALL1_FILE),
                &path.join(SMALL1_TOMB_FILE),
                dimension,
                page_size,
            )?,
            small2: BtreeDataFile::open(
                &path.join(SMALL2_FILE),
                &path.join(SMALL2_TOMB_FILE),
                dimension,
                page_size,
            )?,
            engine: engine.inner().clone(),
            latch: Mutex::new(()),
            batch: AtomicBool::new(false),
            config,
            path,
        });

        inner.engine.register_file(&inner.path, &inner);
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<FileInner>) -> Self {
        Self { inner }
    }

    /// Path of the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Switches to batch mode: inserts go straight to the master data
    /// file and one full index build happens on [`Self::close`].
    pub fn set_batch_mode(&self) {
        self.inner.batch.store(true, Relaxed);
        log::info!("start kd-tree batch insert ({:?})", self.inner.path);
    }

    /// Inserts a vector under `rowid`.
    ///
    /// Vectors shorter than the configured dimension are zero-extended,
    /// longer ones truncated.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn insert(&self, tx: &Transaction, rowid: u32, values: &[f32]) -> crate::Result<()> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();

        let values = inner.pad(values);
        let result = inner.insert_inner(tx, rowid, &values);
        inner.finish_pages(result)
    }

    /// Deletes `rowid`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn expunge(&self, tx: &Transaction, rowid: u32) -> crate::Result<()> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();

        let result = inner.expunge_inner(tx, rowid);
        inner.finish_pages(result)
    }

    /// Nearest-neighbour search for a batch of queries.
    ///
    /// Returns one result per query with up to `k` hits ascending by
    /// `(squared distance, rowid)`. A zero budget (or `k == 0`)
    /// computes no distances and returns empty results.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn nnsearch(
        &self,
        tx: &Transaction,
        queries: &[Vec<f32>],
        trace: TraceType,
        budget: u64,
        k: usize,
    ) -> crate::Result<Vec<QueryResult>> {
        let inner = &self.inner;
        let set = inner.index_set()?;

        let padded: Vec<Vec<f32>> = queries.iter().map(|q| inner.pad(q)).collect();

        // attach the snapshot-correct versions and the deletion masks
        // under the latch, search without it
        let (main, small1, small2, main_mask, small1_mask) = {
            let _latch = inner.lock_latch();

            let role = inner.info.executor_role()?;
            let proceeding = inner.info.is_proceeding()?;

            let main = set.attach_main(tx);
            let exec = set.attach_small(role, tx);

            let mut main_mask = None;
            let mut small1_mask = None;

            if main.is_some() {
                let file = if proceeding {
                    inner.small(role.other())
                } else {
                    inner.small(role)
                };
                main_mask = Some(file.expunged_set());
            }

            // during a merge the older (merge-side) index is searched
            // as small1 with the executor-side tombstones masking it
            let (small1, small2) = if proceeding {
                let exec_tombs = inner.small(role).expunged_set();
                if let Some(mask) = &mut main_mask {
                    mask.union_with(&exec_tombs);
                }
                small1_mask = Some(exec_tombs);

                (set.attach_small(role.other(), tx), exec)
            } else {
                (exec, None)
            };

            (main, small1, small2, main_mask, small1_mask)
        };

        if budget == 0 || k == 0 || padded.is_empty() {
            return Ok(vec![QueryResult::default(); padded.len()]);
        }

        #[allow(clippy::expect_used)]
        let main_guard = main.as_ref().map(|a| a.read().expect("lock is poisoned"));
        #[allow(clippy::expect_used)]
        let small1_guard = small1.as_ref().map(|a| a.read().expect("lock is poisoned"));
        #[allow(clippy::expect_used)]
        let small2_guard = small2.as_ref().map(|a| a.read().expect("lock is poisoned"));

        let mut kernel = DoSearch::new(
            main_guard.as_deref(),
            small1_guard.as_deref(),
            small2_guard.as_deref(),
            main_mask.as_ref(),
            small1_mask.as_ref(),
            &padded,
            trace,
            budget,
            k,
        );

        let threads = inner.config.thread_count.min(padded.len());
        parallel::run(&mut kernel, threads)?;

        Ok(kernel.into_results())
    }

    /// Finishes a batch load: builds the main index from the master
    /// data file, dumps it and leaves batch mode. A no-op otherwise.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn close(&self, tx: &Transaction) -> crate::Result<()> {
        let inner = &self.inner;

        if inner.batch.swap(false, Relaxed) {
            inner.flush_all()?;
            log::info!("kd-tree batch insert done, building index ({:?})", inner.path);

            let result = inner.rebuild_main(tx, &AbortSignal::default());
            inner.finish_pages(result)?;

            log::info!("end kd-tree batch insert ({:?})", inner.path);
        } else {
            inner.flush_all()?;
        }

        Ok(())
    }

    /// Flips the small-file roles and marks the merge as in progress.
    ///
    /// A merge that is already marked in progress (a cancelled earlier
    /// run) is resumed on the same merge side instead of flipping
    /// again.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open_for_merge(&self) -> crate::Result<()> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();

        let result = (|| {
            if !inner.info.is_proceeding()? {
                inner.info.flip()?;
            }
            inner.info.flush()
        })();

        if result.is_err() {
            inner.info.recover();
        }
        result
    }

    /// Clears the merge-in-progress flag.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn close_for_merge(&self) -> crate::Result<()> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();

        let result = inner.info.merge_done().and_then(|()| inner.info.flush());
        if result.is_err() {
            inner.info.recover();
        }
        result
    }

    /// Drains the merge side into the master data file, rebuilds and
    /// dumps the main index and clears the merge side.
    ///
    /// Pages are flushed and the abort signal polled between batches.
    ///
    /// # Errors
    ///
    /// Will return `Err` if cancelled or if an IO error occurs.
    pub fn merge(&self, tx: &Transaction, signal: &AbortSignal) -> crate::Result<()> {
        let inner = &self.inner;

        inner.reflect_expunged(signal)?;
        inner.reflect_inserted(signal)?;
        inner.rebuild_main(tx, signal)?;
        inner.clear_merge_side(tx)
    }

    /// Checks that every sub-file is readable and internally
    /// consistent.
    ///
    /// # Errors
    ///
    /// Will return `Err` describing the first inconsistency found.
    pub fn verify(&self, _tx: &Transaction) -> crate::Result<VerifyReport> {
        let inner = &self.inner;

        inner.info.verify()?;
        inner.data.verify()?;
        inner
            .index_file
            .verify(inner.config.dimension, inner.config.allocate_unit_size)?;
        inner.small1.verify()?;
        inner.small2.verify()?;

        Ok(VerifyReport {
            sub_files_checked: 5,
        })
    }

    /// Rows in the master data file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn master_count(&self) -> crate::Result<u32> {
        self.inner.data.count()
    }

    /// Rows in the executor-side small file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn executor_count(&self) -> crate::Result<u32> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();
        inner.small(inner.info.executor_role()?).count()
    }

    /// Rows in the merge-side small file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn merge_side_count(&self) -> crate::Result<u32> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();
        inner.small(inner.info.executor_role()?.other()).count()
    }

    /// Tombstones in the executor-side small file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn executor_expunged_count(&self) -> crate::Result<u32> {
        let inner = &self.inner;
        let _latch = inner.lock_latch();
        Ok(inner.small(inner.info.executor_role()?).expunged_count())
    }

    /// Blocks until the store accepts a merge, or times out.
    pub(crate) fn wait_ready_for_merge(&self, timeout: Duration) -> crate::Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if !self.inner.batch.load(Relaxed) {
                if let Ok(guard) = self.inner.latch.try_lock() {
                    drop(guard);
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(crate::Error::LockTimeout);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl FileInner {
    #[allow(clippy::expect_used)]
    fn lock_latch(&self) -> MutexGuard<'_, ()> {
        self.latch.lock().expect("lock is poisoned")
    }

    /// Zero-extends or truncates to the configured dimension.
    fn pad(&self, values: &[f32]) -> Vec<f32> {
        let mut padded = vec![0.0f32; self.config.dimension];
        let n = values.len().min(self.config.dimension);
        #[allow(clippy::indexing_slicing)]
        padded[..n].copy_from_slice(&values[..n]);
        padded
    }

    fn small(&self, role: SmallRole) -> &BtreeDataFile {
        match role {
            SmallRole::Primary => &self.small1,
            SmallRole::Secondary => &self.small2,
        }
    }

    /// Attaches (and on first access loads) the in-memory index set.
    fn index_set(&self) -> crate::Result<Arc<KdTreeIndexSet>> {
        let set = self.engine.index_sets.attach(&self.path);

        set.ensure_loaded(
            &self.engine.tx,
            self.config.dimension,
            self.config.allocate_unit_size,
            self.config.thread_count,
            &self.index_file,
            &self.small1,
            &self.small2,
        )?;

        Ok(set)
    }

    fn flush_all(&self) -> crate::Result<()> {
        self.info.flush()?;
        self.data.flush()?;
        self.index_file.flush()?;
        self.small1.flush()?;
        self.small2.flush()
    }

    fn recover_all(&self) {
        self.info.recover();
        self.data.recover();
        self.index_file.recover();

        for small in [&self.small1, &self.small2] {
            if let Err(e) = small.recover() {
                log::error!("kd-tree ({:?}): small file recovery failed: {e}", self.path);
            }
        }
    }

    /// Flushes all pages on success, rolls them back on error.
    fn finish_pages<T>(&self, result: crate::Result<T>) -> crate::Result<T> {
        match result {
            Ok(value) => {
                self.flush_all()?;
                Ok(value)
            }
            Err(e) => {
                self.recover_all();
                Err(e)
            }
        }
    }

    fn insert_inner(&self, tx: &Transaction, rowid: u32, values: &[f32]) -> crate::Result<()> {
        if self.batch.load(Relaxed) {
            // batch mode: straight to the master file, one index build
            // on close
            return self.data.insert(rowid, values);
        }

        let set = self.index_set()?;
        let role = self.info.executor_role()?;
        let small = self.small(role);

        small.insert(rowid, values)?;

        let version = set.allocate_small(role, tx);
        {
            #[allow(clippy::expect_used)]
            let mut index = version.write().expect("lock is poisoned");

            if index.is_empty() {
                // first write into this version rebuilds it from the
                // backing file (which already carries the new row)
                index.create(
                    small as &dyn DataFile,
                    self.config.thread_count,
                    &AbortSignal::default(),
                    true,
                )?;
            } else {
                index.insert(rowid, values);
            }
        }

        if small.count()? >= self.config.merge_count_threshold
            && self
                .engine
                .reserve
                .push_back(self.path.clone(), JobType::Merge)
        {
            log::debug!("kd-tree ({:?}): merge queued", self.path);
        }

        Ok(())
    }

    fn expunge_inner(&self, tx: &Transaction, rowid: u32) -> crate::Result<()> {
        let set = self.index_set()?;
        let role = self.info.executor_role()?;
        let small = self.small(role);

        // physical when the row lives in the small file, a tombstone
        // bit otherwise
        small.expunge(rowid)?;

        let version = set.allocate_small(role, tx);
        {
            #[allow(clippy::expect_used)]
            let mut index = version.write().expect("lock is poisoned");

            if index.is_empty() {
                index.create(
                    small as &dyn DataFile,
                    self.config.thread_count,
                    &AbortSignal::default(),
                    true,
                )?;
            } else {
                index.expunge(rowid);
            }
        }

        if small.expunged_count() >= self.config.merge_count_threshold
            && self
                .engine
                .reserve
                .push_back(self.path.clone(), JobType::Merge)
        {
            log::debug!("kd-tree ({:?}): merge queued", self.path);
        }

        Ok(())
    }

    /// Merge step (a): applies the merge-side tombstones to the master
    /// file in latched batches.
    fn reflect_expunged(&self, signal: &AbortSignal) -> crate::Result<()> {
        let (role, tombs) = {
            let _latch = self.lock_latch();
            let role = self.info.executor_role()?.other();
            (role, self.small(role).expunged_set())
        };

        let rowids: Vec<u32> = tombs.iter().collect();

        for chunk in rowids.chunks(self.config.unit_merge_expunge_count.max(1)) {
            let _latch = self.lock_latch();

            let step = || -> crate::Result<()> {
                for &rowid in chunk {
                    // an interrupted earlier merge may have applied
                    // this deletion already
                    if self.data.test(rowid)? {
                        self.data.expunge(rowid)?;
                    }
                }
                Ok(())
            };

            let result = step();
            if result.is_ok() && signal.is_aborted() {
                self.recover_all();
                return Err(crate::Error::Cancelled);
            }
            self.finish_pages(result)?;
        }

        Ok(())
    }

    /// Merge step (b): copies the merge side's live rows into the
    /// master file, a few pages per latched batch.
    fn reflect_inserted(&self, signal: &AbortSignal) -> crate::Result<()> {
        let role = {
            let _latch = self.lock_latch();
            self.info.executor_role()?.other()
        };
        let small = self.small(role);
        let dimension = self.config.dimension;

        let mut page = None;
        let mut done = false;

        while !done {
            let _latch = self.lock_latch();

            let mut batch = EntryBatch::default();
            let mut step = || -> crate::Result<()> {
                for _ in 0..self.config.unit_merge_insert_page_count.max(1) {
                    let Some(id) = small.next_page_id(page)? else {
                        done = true;
                        break;
                    };
                    page = Some(id);

                    batch.clear();
                    small.read_page(id, &mut batch)?;

                    #[allow(clippy::indexing_slicing)]
                    for i in 0..batch.len() {
                        let rowid = batch.rowids[i];
                        if batch.flags[i] & EXPUNGED_BIT != 0 {
                            continue;
                        }

                        // re-check: an interrupted earlier merge may
                        // have copied this row already
                        if !self.data.test(rowid)? {
                            self.data
                                .insert(rowid, &batch.values[i * dimension..(i + 1) * dimension])?;
                        }
                    }
                }
                Ok(())
            };

            let result = step();
            if result.is_ok() && signal.is_aborted() {
                self.recover_all();
                return Err(crate::Error::Cancelled);
            }
            self.finish_pages(result)?;
        }

        Ok(())
    }

    /// Merge step (c): rebuilds the main index from the master file
    /// and publishes it (dump first, then the in-memory head).
    fn rebuild_main(&self, tx: &Transaction, signal: &AbortSignal) -> crate::Result<()> {
        let set = self.index_set()?;

        let mut index = KdTreeIndex::new(self.config.dimension, self.config.allocate_unit_size);
        index.create(
            &self.data as &dyn DataFile,
            self.config.thread_count,
            signal,
            false,
        )?;

        log::info!(
            "kd-tree ({:?}) size: {} MiB",
            self.path,
            index.byte_size() >> 20
        );

        let pages = match index.dump(&self.index_file) {
            Ok(pages) => pages,
            Err(e) => {
                self.index_file.recover();
                return Err(e);
            }
        };
        self.index_file.flush_dump(pages)?;

        set.push_main(index, self.engine.tx.assign(), tx.id());
        Ok(())
    }

    /// Merge step (d): empties the merge-side file and seals its index
    /// chain with an empty head, so the next role flip cannot surface
    /// rows that now live in the main index.
    fn clear_merge_side(&self, tx: &Transaction) -> crate::Result<()> {
        let _latch = self.lock_latch();
        let role = self.info.executor_role()?.other();

        let result = self.small(role).clear();
        match result {
            Ok(()) => {
                self.small(role).flush_cleared()?;

                let set = self.index_set()?;
                set.seal_small_cleared(role, self.engine.tx.assign(), tx.id());
                Ok(())
            }
            Err(e) => {
                self.recover_all();
                Err(e)
            }
        }
    }
}
