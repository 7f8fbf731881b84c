// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rustc_hash::FxHashSet;
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::Mutex,
};

/// What a queued job does
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum JobType {
    /// Drain one small file into the main index
    Merge,

    /// Drop index versions no snapshot reader can observe
    Discard,
}

/// One queued job; identified by `(store, kind)`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    /// Path of the store the job targets (its lock name)
    pub store: PathBuf,

    /// What to do
    pub kind: JobType,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Job>,
    pending: FxHashSet<(PathBuf, JobType)>,
}

/// Engine-owned FIFO of merge/discard jobs, de-duplicated by
/// `(store, kind)`
///
/// A job stays visible (and keeps suppressing duplicates) while the
/// daemon works on it; it is erased once handled.
#[derive(Default)]
pub(crate) struct MergeReserve {
    inner: Mutex<Inner>,
}

impl MergeReserve {
    /// Enqueues a job unless an identical one is already pending.
    /// Returns whether it was enqueued.
    pub fn push_back(&self, store: PathBuf, kind: JobType) -> bool {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if !inner.pending.insert((store.clone(), kind)) {
            return false;
        }

        inner.queue.push_back(Job { store, kind });
        true
    }

    /// Peeks the oldest job without removing it.
    pub fn front(&self) -> Option<Job> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.queue.front().cloned()
    }

    /// Removes a handled job.
    pub fn erase(&self, job: &Job) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        inner.queue.retain(|j| j != job);
        inner.pending.remove(&(job.store.clone(), job.kind));
    }

    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
