// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicU64, Ordering::SeqCst},
    Arc, Mutex,
};

/// Monotonically increasing logical clock value; 0 is the illegal
/// timestamp.
pub type TimeStamp = u64;

/// The illegal (never assigned) timestamp
pub const ILLEGAL_TIMESTAMP: TimeStamp = 0;

/// Transaction identifier
pub type TxId = u64;

/// How a transaction reads versioned state
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxMode {
    /// Writer; always sees and modifies the latest version
    ReadWrite,

    /// Snapshot reader pinned to its birth timestamp
    Versioning,

    /// Reader without a snapshot; always sees the latest version
    NoVersion,
}

struct VersioningTx {
    id: TxId,
    birth: TimeStamp,
    starting: Arc<Vec<TxId>>,
}

#[derive(Default)]
struct Inner {
    /// Read-write transactions in progress, ascending by start
    read_write: Vec<TxId>,

    /// Versioning transactions in progress, ascending by birth
    versioning: Vec<VersioningTx>,
}

/// Hands out timestamps and tracks in-progress transactions
///
/// This is the thin slice of the host's transaction manager the KD-tree
/// core consumes: birth timestamps, writer overlap checks and the birth
/// of the oldest running snapshot reader.
pub struct TransactionManager {
    clock: AtomicU64,
    system_initialized: TimeStamp,
    inner: Mutex<Inner>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Creates a manager; the first assigned timestamp is remembered as
    /// the system-init timestamp.
    #[must_use]
    pub fn new() -> Self {
        let manager = Self {
            clock: AtomicU64::new(ILLEGAL_TIMESTAMP),
            system_initialized: ILLEGAL_TIMESTAMP,
            inner: Mutex::new(Inner::default()),
        };
        let init = manager.assign();

        Self {
            system_initialized: init,
            ..manager
        }
    }

    /// Assigns the next timestamp.
    pub fn assign(&self) -> TimeStamp {
        self.clock.fetch_add(1, SeqCst) + 1
    }

    /// Timestamp assigned when this manager came up; versions loaded
    /// from disk on first access carry it.
    #[must_use]
    pub fn system_initialized(&self) -> TimeStamp {
        self.system_initialized
    }

    /// Begins a transaction.
    pub fn begin(self: &Arc<Self>, mode: TxMode) -> Transaction {
        let birth = self.assign();
        let id = birth;

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let starting = match mode {
            TxMode::ReadWrite => {
                inner.read_write.push(id);
                Arc::new(Vec::new())
            }
            TxMode::Versioning => {
                let starting = Arc::new(inner.read_write.clone());
                inner.versioning.push(VersioningTx {
                    id,
                    birth,
                    starting: starting.clone(),
                });
                starting
            }
            TxMode::NoVersion => Arc::new(Vec::new()),
        };

        Transaction {
            id,
            birth,
            mode,
            starting,
            manager: self.clone(),
        }
    }

    fn end(&self, id: TxId, mode: TxMode) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        match mode {
            TxMode::ReadWrite => inner.read_write.retain(|t| *t != id),
            TxMode::Versioning => inner.versioning.retain(|t| t.id != id),
            TxMode::NoVersion => {}
        }
    }

    /// Returns `true` if any of `ids` is a running read-write
    /// transaction.
    #[must_use]
    pub fn is_in_progress(&self, ids: &[TxId]) -> bool {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.read_write.iter().any(|t| ids.contains(t))
    }

    /// Scans the running versioning transactions born after `t` for one
    /// that started while any of the writers `ids` was still running.
    ///
    /// Returns `(overlapped, start)`: when overlapped, `start` is one
    /// past the birth of the last such reader (the caller seals the
    /// head version at `start - 1`); otherwise `start` is the birth of
    /// the first reader that began after all writers ended.
    #[must_use]
    pub fn overlap_scan(&self, t: TimeStamp, ids: &[TxId]) -> (bool, TimeStamp) {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");

        let mut overlapped = false;
        let mut start = ILLEGAL_TIMESTAMP;

        for tx in &inner.versioning {
            if t < tx.birth {
                if tx.starting.iter().any(|s| ids.contains(s)) {
                    overlapped = true;
                    start = tx.birth + 1;
                } else {
                    start = tx.birth;
                    break;
                }
            }
        }

        (overlapped, start)
    }

    /// Birth timestamp of the oldest running versioning transaction, or
    /// [`ILLEGAL_TIMESTAMP`] if none is running.
    #[must_use]
    pub fn beginning_timestamp(&self) -> TimeStamp {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.versioning.first().map_or(ILLEGAL_TIMESTAMP, |t| t.birth)
    }
}

/// One transaction handle; ends (and unregisters itself) on drop
pub struct Transaction {
    id: TxId,
    birth: TimeStamp,
    mode: TxMode,
    starting: Arc<Vec<TxId>>,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    /// Transaction identifier.
    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Birth (snapshot) timestamp.
    #[must_use]
    pub fn birth(&self) -> TimeStamp {
        self.birth
    }

    /// How this transaction reads versioned state.
    #[must_use]
    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// `true` for transactions that always read the latest version.
    #[must_use]
    pub fn is_no_version(&self) -> bool {
        self.mode != TxMode::Versioning
    }

    /// Returns `true` if any of `ids` was still running when this
    /// transaction started.
    #[must_use]
    pub fn is_overlapped(&self, ids: &[TxId]) -> bool {
        self.starting.iter().any(|s| ids.contains(s))
    }

    /// Commits the transaction. Writes are applied eagerly, so this
    /// merely ends the transaction's in-progress registration.
    pub fn commit(self) {}

    pub(crate) fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.manager.end(self.id, self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let manager = Arc::new(TransactionManager::new());
        let a = manager.assign();
        let b = manager.assign();
        assert!(manager.system_initialized() < a);
        assert!(a < b);
    }

    #[test]
    fn versioning_records_running_writers() {
        let manager = Arc::new(TransactionManager::new());

        let writer = manager.begin(TxMode::ReadWrite);
        let reader = manager.begin(TxMode::Versioning);

        assert!(reader.is_overlapped(&[writer.id()]));
        assert!(manager.is_in_progress(&[writer.id()]));

        writer.commit();
        assert!(!manager.is_in_progress(&[reader.id()]));

        let late_reader = manager.begin(TxMode::Versioning);
        assert!(!late_reader.is_overlapped(&[reader.id()]));
    }

    #[test]
    fn overlap_scan_seals_behind_last_overlapped_reader() {
        let manager = Arc::new(TransactionManager::new());

        let writer = manager.begin(TxMode::ReadWrite);
        let writer_id = writer.id();
        let t = manager.assign();
        let overlapped_reader = manager.begin(TxMode::Versioning);
        writer.commit();
        let clean_reader = manager.begin(TxMode::Versioning);

        let (overlapped, start) = manager.overlap_scan(t, &[writer_id]);
        assert!(overlapped);
        assert_eq!(overlapped_reader.birth() + 1, start);

        drop(overlapped_reader);

        let (overlapped, start) = manager.overlap_scan(t, &[writer_id]);
        assert!(!overlapped);
        assert_eq!(clean_reader.birth(), start);
    }

    #[test]
    fn beginning_timestamp_tracks_oldest_reader() {
        let manager = Arc::new(TransactionManager::new());
        assert_eq!(ILLEGAL_TIMESTAMP, manager.beginning_timestamp());

        let first = manager.begin(TxMode::Versioning);
        let _second = manager.begin(TxMode::Versioning);
        assert_eq!(first.birth(), manager.beginning_timestamp());
    }
}
