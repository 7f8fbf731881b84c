// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    abort::AbortSignal,
    file::FileInner,
    index_set::IndexSetRegistry,
    merge_daemon::{self, MergeDaemon},
    merge_reserve::MergeReserve,
    tx::{Transaction, TransactionManager, TxMode},
    KdTreeFile,
};
use rustc_hash::FxHashMap;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
};

/// Record appended to the engine's logical log
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    /// Marks that a merge rewrote the main index of a store
    KdTreeMerge {
        /// Path of the store
        store: PathBuf,
    },
}

/// Process-wide runtime the stores share
///
/// Owns the transaction manager, the in-memory index registry, the
/// merge queue, the open-file table and the merge daemon, with an
/// explicit init/shutdown lifecycle. Cloning shares the runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) tx: Arc<TransactionManager>,
    pub(crate) index_sets: IndexSetRegistry,
    pub(crate) reserve: MergeReserve,
    files: Mutex<FxHashMap<PathBuf, Weak<FileInner>>>,
    logical_log: Mutex<Vec<LogRecord>>,
    daemon: Mutex<Option<MergeDaemon>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates a fresh runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tx: Arc::new(TransactionManager::new()),
                index_sets: IndexSetRegistry::default(),
                reserve: MergeReserve::default(),
                files: Mutex::new(FxHashMap::default()),
                logical_log: Mutex::new(Vec::new()),
                daemon: Mutex::new(None),
            }),
        }
    }

    /// Begins a writing transaction.
    #[must_use]
    pub fn begin_read_write(&self) -> Transaction {
        self.inner.tx.begin(TxMode::ReadWrite)
    }

    /// Begins a snapshot-reading transaction pinned to its birth
    /// timestamp.
    #[must_use]
    pub fn begin_versioning(&self) -> Transaction {
        self.inner.tx.begin(TxMode::Versioning)
    }

    /// Begins a reading transaction that always sees the latest
    /// version.
    #[must_use]
    pub fn begin_no_version(&self) -> Transaction {
        self.inner.tx.begin(TxMode::NoVersion)
    }

    /// Starts the background merge daemon (idempotent).
    pub fn start_merge_daemon(&self) {
        #[allow(clippy::expect_used)]
        let mut daemon = self.inner.daemon.lock().expect("lock is poisoned");

        if daemon.is_none() {
            *daemon = Some(MergeDaemon::spawn(Arc::downgrade(&self.inner)));
        }
    }

    /// Drains the merge queue on the calling thread; deterministic
    /// alternative to the daemon. Returns the number of jobs handled.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn run_pending_jobs(&self) -> crate::Result<usize> {
        let signal = AbortSignal::default();
        let mut handled = 0;

        // a discard can re-enqueue itself; bound the drain
        let budget = self.inner.reserve.len() * 2 + 4;

        for _ in 0..budget {
            let Some(job) = self.inner.reserve.front() else {
                break;
            };

            let result = merge_daemon::run_job(&self.inner, &job, &signal);
            self.inner.reserve.erase(&job);

            match result {
                Ok(()) => handled += 1,
                Err(crate::Error::LockTimeout) => {
                    log::debug!("kd-tree merge of {:?} skipped: lock timeout", job.store);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(handled)
    }

    /// Number of queued merge/discard jobs.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.inner.reserve.len()
    }

    /// Copy of the logical log.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn logical_log(&self) -> Vec<LogRecord> {
        self.inner.logical_log.lock().expect("lock is poisoned").clone()
    }

    /// Drops a store's in-memory indices (e.g. after dropping its
    /// files).
    pub fn drop_store<P: AsRef<Path>>(&self, path: P) {
        self.inner.index_sets.drop_set(path.as_ref());
    }

    /// Stops the daemon and drops all in-memory state.
    pub fn shutdown(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut daemon = self.inner.daemon.lock().expect("lock is poisoned");
            if let Some(mut daemon) = daemon.take() {
                daemon.stop();
            }
        }
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        let mut daemon = self.daemon.lock().expect("lock is poisoned");
        if let Some(mut daemon) = daemon.take() {
            daemon.stop();
        }
    }
}

impl EngineInner {
    pub(crate) fn register_file(&self, path: &Path, file: &Arc<FileInner>) {
        #[allow(clippy::expect_used)]
        let mut files = self.files.lock().expect("lock is poisoned");
        files.insert(path.to_path_buf(), Arc::downgrade(file));
    }

    pub(crate) fn get_file(&self, path: &Path) -> Option<KdTreeFile> {
        #[allow(clippy::expect_used)]
        let files = self.files.lock().expect("lock is poisoned");
        files
            .get(path)
            .and_then(Weak::upgrade)
            .map(KdTreeFile::from_inner)
    }

    pub(crate) fn push_log(&self, record: LogRecord) {
        #[allow(clippy::expect_used)]
        self.logical_log.lock().expect("lock is poisoned").push(record);
    }
}
