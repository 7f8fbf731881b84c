// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    abort::AbortSignal,
    file::{BtreeDataFile, DataFile, IndexFile, SmallRole},
    index::{IndexStatus, KdTreeIndex},
    tx::{TimeStamp, Transaction, TransactionManager, TxId, ILLEGAL_TIMESTAMP},
};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

/// Shared handle to one index version
pub(crate) type SharedIndex = Arc<RwLock<KdTreeIndex>>;

struct Version {
    /// Last-modification timestamp; strictly decreasing head to tail
    timestamp: TimeStamp,

    /// Transactions that modified this version
    modifiers: Vec<TxId>,

    index: SharedIndex,
}

/// One MVCC version list, head first
///
/// Centralizes the version selection rule shared by readers and
/// writers; the caller holds the index-set latch.
#[derive(Default)]
struct VersionChain {
    versions: VecDeque<Version>,
}

impl VersionChain {
    /// Selects the version a reading transaction may observe.
    ///
    /// Non-versioning transactions always see the head. A versioning
    /// transaction sees the head only if the head was finalized before
    /// the transaction started and none of the head's writers was still
    /// running at that point; otherwise the first older version below
    /// its birth timestamp.
    fn attach_for_read(&self, tx: &Transaction) -> Option<SharedIndex> {
        let head = self.versions.front()?;

        if tx.is_no_version() {
            return Some(head.index.clone());
        }

        if tx.birth() > head.timestamp && !tx.is_overlapped(&head.modifiers) {
            return Some(head.index.clone());
        }

        self.versions
            .iter()
            .skip(1)
            .find(|v| v.timestamp < tx.birth())
            .map(|v| v.index.clone())
    }

    /// Returns the version a writing transaction may modify, creating a
    /// new head when running snapshot readers still need the current
    /// one.
    fn allocate_for_write(
        &mut self,
        tx: &Transaction,
        manager: &TransactionManager,
        dimension: usize,
        allocate_unit_size: usize,
    ) -> SharedIndex {
        if self.versions.is_empty() {
            let index = Arc::new(RwLock::new(KdTreeIndex::new(dimension, allocate_unit_size)));
            self.versions.push_front(Version {
                timestamp: manager.assign(),
                modifiers: vec![tx.id()],
                index: index.clone(),
            });
            return index;
        }

        #[allow(clippy::expect_used)]
        let head = self.versions.front_mut().expect("chain is not empty");

        {
            #[allow(clippy::expect_used)]
            let guard = head.index.read().expect("lock is poisoned");
            if guard.status() == IndexStatus::Copy {
                // the previous version still carries the same image, so
                // no new head is needed
                return head.index.clone();
            }
        }

        let mut overlapped = false;
        let mut start = ILLEGAL_TIMESTAMP;

        if !head.modifiers.is_empty() {
            if manager.is_in_progress(&head.modifiers) {
                return head.index.clone();
            }

            (overlapped, start) = manager.overlap_scan(head.timestamp, &head.modifiers);
        }

        // from here on a new head is needed

        if overlapped {
            // keep the current head visible to the snapshot readers
            // that started before its writers all ended
            head.timestamp = start - 1;
        }
        head.modifiers.clear();

        self.discard_versions(manager.beginning_timestamp(), manager);

        let index = Arc::new(RwLock::new(KdTreeIndex::new(dimension, allocate_unit_size)));
        self.versions.push_front(Version {
            timestamp: manager.assign(),
            modifiers: vec![tx.id()],
            index: index.clone(),
        });
        index
    }

    fn push_head(&mut self, index: KdTreeIndex, timestamp: TimeStamp, modifier: Option<TxId>) {
        self.versions.push_front(Version {
            timestamp,
            modifiers: modifier.into_iter().collect(),
            index: Arc::new(RwLock::new(index)),
        });
    }

    /// Unlinks versions no running snapshot reader can observe.
    /// Returns `true` once at most one version remains.
    fn discard_versions(&mut self, oldest: TimeStamp, manager: &TransactionManager) -> bool {
        if self.versions.len() <= 1 {
            return true;
        }

        let mut i = 0;

        #[allow(clippy::expect_used)]
        let head = self.versions.front_mut().expect("chain is not empty");
        if !head.modifiers.is_empty() {
            if manager.is_in_progress(&head.modifiers) {
                i = 1;
            } else {
                head.modifiers.clear();
            }
        }

        // keep everything up to the first version the oldest snapshot
        // reader can see; drop the rest
        let mut boundary = self.versions.len();
        while i < self.versions.len() {
            #[allow(clippy::indexing_slicing)]
            let version = &self.versions[i];
            if oldest == ILLEGAL_TIMESTAMP || version.timestamp < oldest {
                boundary = i + 1;
                break;
            }
            i += 1;
        }

        self.versions.truncate(boundary);
        self.versions.len() <= 1
    }

    fn len(&self) -> usize {
        self.versions.len()
    }
}

#[derive(Default)]
struct SetState {
    loaded: bool,
    dimension: usize,
    allocate_unit_size: usize,
    main: VersionChain,
    small1: VersionChain,
    small2: VersionChain,
}

impl SetState {
    fn small(&self, role: SmallRole) -> &VersionChain {
        match role {
            SmallRole::Primary => &self.small1,
            SmallRole::Secondary => &self.small2,
        }
    }

    fn small_mut(&mut self, role: SmallRole) -> &mut VersionChain {
        match role {
            SmallRole::Primary => &mut self.small1,
            SmallRole::Secondary => &mut self.small2,
        }
    }
}

/// Per-store registry of the three version chains (main + two small)
pub(crate) struct KdTreeIndexSet {
    state: Mutex<SetState>,
}

impl KdTreeIndexSet {
    fn new() -> Self {
        Self {
            state: Mutex::new(SetState::default()),
        }
    }

    /// Loads the persistent state on first access: the main index from
    /// its dump (if mounted), the small indices rebuilt from their
    /// backing B-tree files. Versions loaded here are stamped with the
    /// system-init timestamp, because a first access implies no update
    /// happened since startup.
    pub fn ensure_loaded(
        &self,
        manager: &TransactionManager,
        dimension: usize,
        allocate_unit_size: usize,
        threads: usize,
        index_file: &IndexFile,
        small1: &BtreeDataFile,
        small2: &BtreeDataFile,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        if state.loaded {
            return Ok(());
        }

        state.dimension = dimension;
        state.allocate_unit_size = allocate_unit_size;

        if index_file.is_mounted() {
            let mut index = KdTreeIndex::new(dimension, allocate_unit_size);
            index.load(index_file)?;

            log::info!(
                "kd-tree ({:?}) loaded, size: {} MiB",
                index_file.path(),
                index.byte_size() >> 20
            );

            state
                .main
                .push_head(index, manager.system_initialized(), None);
        }

        for (file, role) in [(small1, SmallRole::Primary), (small2, SmallRole::Secondary)] {
            if file.count()? != 0 {
                let mut index = KdTreeIndex::new(dimension, allocate_unit_size);
                index.create(file as &dyn DataFile, threads, &AbortSignal::default(), true)?;

                state.small_mut(role).push_head(
                    index,
                    manager.system_initialized(),
                    None,
                );
            }
        }

        state.loaded = true;
        Ok(())
    }

    pub fn attach_main(&self, tx: &Transaction) -> Option<SharedIndex> {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        Self::non_empty(state.main.attach_for_read(tx))
    }

    pub fn attach_small(&self, role: SmallRole, tx: &Transaction) -> Option<SharedIndex> {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        Self::non_empty(state.small(role).attach_for_read(tx))
    }

    fn non_empty(index: Option<SharedIndex>) -> Option<SharedIndex> {
        index.filter(|i| {
            #[allow(clippy::expect_used)]
            let guard = i.read().expect("lock is poisoned");
            !guard.is_empty()
        })
    }

    pub fn allocate_small(&self, role: SmallRole, tx: &Transaction) -> SharedIndex {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let dimension = state.dimension;
        let unit = state.allocate_unit_size;
        state
            .small_mut(role)
            .allocate_for_write(tx, tx.manager(), dimension, unit)
    }

    /// Publishes a freshly built main index as the new head.
    pub fn push_main(&self, index: KdTreeIndex, timestamp: TimeStamp, modifier: TxId) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        state.main.push_head(index, timestamp, Some(modifier));
        state.loaded = true;
    }

    /// Seals a merged-and-cleared small chain with an empty fixed head
    /// so a later role flip cannot surface rows that moved into the
    /// main index; snapshot readers older than `timestamp` still reach
    /// the previous version.
    pub fn seal_small_cleared(&self, role: SmallRole, timestamp: TimeStamp, modifier: TxId) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let dimension = state.dimension;
        let unit = state.allocate_unit_size;

        let chain = state.small_mut(role);
        if chain.len() > 0 {
            chain.push_head(
                KdTreeIndex::empty_fixed(dimension, unit),
                timestamp,
                Some(modifier),
            );
        }
    }

    /// Drops versions no running snapshot reader can observe across all
    /// three chains. Returns `true` once every chain is down to at most
    /// one version.
    pub fn discard(&self, manager: &TransactionManager) -> bool {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let oldest = manager.beginning_timestamp();

        let mut done = state.small1.discard_versions(oldest, manager);
        done &= state.small2.discard_versions(oldest, manager);
        done &= state.main.discard_versions(oldest, manager);
        done
    }

    #[cfg(test)]
    fn version_counts(&self) -> (usize, usize, usize) {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        (state.main.len(), state.small1.len(), state.small2.len())
    }
}

/// Process-wide map from store path to its index set, owned by the
/// engine (explicit init/shutdown instead of static destructors)
#[derive(Default)]
pub(crate) struct IndexSetRegistry {
    map: Mutex<FxHashMap<PathBuf, Arc<KdTreeIndexSet>>>,
}

impl IndexSetRegistry {
    /// Returns the set for `path`, creating an unloaded one if needed.
    pub fn attach(&self, path: &Path) -> Arc<KdTreeIndexSet> {
        #[allow(clippy::expect_used)]
        let mut map = self.map.lock().expect("lock is poisoned");
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(KdTreeIndexSet::new()))
            .clone()
    }

    /// Returns the set for `path` if one was attached before.
    pub fn get(&self, path: &Path) -> Option<Arc<KdTreeIndexSet>> {
        #[allow(clippy::expect_used)]
        let map = self.map.lock().expect("lock is poisoned");
        map.get(path).cloned()
    }

    /// Drops the in-memory indices of `path`.
    pub fn drop_set(&self, path: &Path) {
        #[allow(clippy::expect_used)]
        let mut map = self.map.lock().expect("lock is poisoned");
        map.remove(path);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

    use super::*;
    use crate::tx::TxMode;
    use test_log::test;

    const UNIT: usize = 1 << 20;

    fn fixed_index(dimension: usize) -> KdTreeIndex {
        let mut index = KdTreeIndex::new(dimension, UNIT);
        index.insert(1, &[1.0, 1.0]);
        index
    }

    #[test]
    fn no_version_reader_sees_head() {
        let manager = Arc::new(TransactionManager::new());
        let set = KdTreeIndexSet::new();

        set.push_main(fixed_index(2), manager.assign(), 1);

        let tx = manager.begin(TxMode::NoVersion);
        assert!(set.attach_main(&tx).is_some());
    }

    #[test]
    fn snapshot_reader_selection_across_versions() {
        let manager = Arc::new(TransactionManager::new());
        let set = KdTreeIndexSet::new();

        // v0 exists, then tr1 starts
        let writer0 = manager.begin(TxMode::ReadWrite);
        set.push_main(fixed_index(2), manager.assign(), writer0.id());
        writer0.commit();

        let tr1 = manager.begin(TxMode::Versioning);
        let v0 = set.attach_main(&tr1).unwrap();

        // a writer finalizes v1, then tr2 starts
        let writer = manager.begin(TxMode::ReadWrite);
        set.push_main(fixed_index(2), manager.assign(), writer.id());
        writer.commit();

        let tr2 = manager.begin(TxMode::Versioning);
        let v1 = set.attach_main(&tr2).unwrap();

        // tr1 keeps v0, tr2 sees v1
        assert!(!Arc::ptr_eq(&v0, &v1));
        assert!(Arc::ptr_eq(&v0, &set.attach_main(&tr1).unwrap()));

        // after both end, discard removes v0
        drop(tr1);
        drop(tr2);
        assert!(set.discard(&manager));
        assert_eq!(1, set.version_counts().0);
    }

    #[test]
    fn reader_born_before_any_version_sees_nothing() {
        let manager = Arc::new(TransactionManager::new());
        let set = KdTreeIndexSet::new();

        let early = manager.begin(TxMode::Versioning);

        let writer = manager.begin(TxMode::ReadWrite);
        set.push_main(fixed_index(2), manager.assign(), writer.id());
        writer.commit();

        assert!(set.attach_main(&early).is_none());
    }

    fn loaded_set() -> KdTreeIndexSet {
        let set = KdTreeIndexSet::new();
        {
            let mut state = set.state.lock().unwrap();
            state.dimension = 2;
            state.allocate_unit_size = UNIT;
            state.loaded = true;
        }
        set
    }

    #[test]
    fn allocate_returns_copy_head_unchanged() {
        let manager = Arc::new(TransactionManager::new());
        let set = loaded_set();

        let writer = manager.begin(TxMode::ReadWrite);
        let first = set.allocate_small(SmallRole::Primary, &writer);

        // the head is still a Copy placeholder (the caller has not
        // created it yet), so a second allocation hands it back
        let second = set.allocate_small(SmallRole::Primary, &writer);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, set.version_counts().1);
    }

    #[test]
    fn allocate_reuses_head_while_its_writer_runs() {
        let manager = Arc::new(TransactionManager::new());
        let set = loaded_set();

        let writer1 = manager.begin(TxMode::ReadWrite);
        let head = set.allocate_small(SmallRole::Primary, &writer1);
        head.write().unwrap().force_fix();

        // writer 1 still runs; another writer keeps extending the head
        let writer2 = manager.begin(TxMode::ReadWrite);
        let again = set.allocate_small(SmallRole::Primary, &writer2);
        assert!(Arc::ptr_eq(&head, &again));
        assert_eq!(1, set.version_counts().1);
    }

    #[test]
    fn allocate_seals_head_for_overlapped_reader() {
        let manager = Arc::new(TransactionManager::new());
        let set = loaded_set();

        // writer 1 creates and fixes the head version
        let writer1 = manager.begin(TxMode::ReadWrite);
        let head = set.allocate_small(SmallRole::Primary, &writer1);
        head.write().unwrap().force_fix();

        // snapshot reader starts while writer 1 is still running
        let reader = manager.begin(TxMode::Versioning);
        writer1.commit();

        // a later writer needs a new head; the old one stays behind,
        // sealed so the overlapped reader keeps seeing it
        let writer2 = manager.begin(TxMode::ReadWrite);
        let fresh = set.allocate_small(SmallRole::Primary, &writer2);
        assert!(!Arc::ptr_eq(&head, &fresh));
        assert_eq!(2, set.version_counts().1);

        {
            let state = set.state.lock().unwrap();
            let sealed = &state.small1.versions[1];
            assert!(sealed.timestamp < reader.birth());
            assert!(sealed.modifiers.is_empty());
        }

        drop(reader);
    }

    #[test]
    fn allocate_replaces_head_when_no_reader_needs_it() {
        let manager = Arc::new(TransactionManager::new());
        let set = loaded_set();

        let writer1 = manager.begin(TxMode::ReadWrite);
        let head = set.allocate_small(SmallRole::Primary, &writer1);
        head.write().unwrap().force_fix();
        writer1.commit();

        let writer2 = manager.begin(TxMode::ReadWrite);
        let fresh = set.allocate_small(SmallRole::Primary, &writer2);
        assert!(!Arc::ptr_eq(&head, &fresh));

        // once the new head's writer ends, a discard pass drops the
        // superseded version (no snapshot reader is running)
        writer2.commit();
        assert!(set.discard(&manager));
        assert_eq!(1, set.version_counts().1);
    }
}
