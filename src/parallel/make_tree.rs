// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Kernel;
use crate::{
    abort::AbortSignal,
    arena::{EntryArena, EntryId, NodeId, NIL},
    node::{make_subtree, Node},
};
use std::sync::Mutex;

/// Which child slot of the parent a finished subtree hangs off.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Side {
    Right,
    Left,
}

/// A child range left over once the sequential build phase has burnt
/// its fan-out budget.
pub(crate) struct SubtreeTask {
    pub parent: NodeId,
    pub side: Side,
    pub entries: Vec<EntryId>,
}

/// A subtree built by a worker, waiting to be grafted under its parent.
pub(crate) struct Graft {
    pub parent: NodeId,
    pub side: Side,
    pub nodes: Vec<Node>,
    pub root: NodeId,
}

/// Worker pool for the second build phase: workers pop child ranges and
/// build their subtrees single-threaded.
pub(crate) struct MakeTreeRecursive<'a> {
    entries: &'a EntryArena,
    signal: &'a AbortSignal,
    tasks: Mutex<Vec<SubtreeTask>>,
    grafts: Mutex<Vec<Graft>>,
}

impl<'a> MakeTreeRecursive<'a> {
    pub fn new(entries: &'a EntryArena, tasks: Vec<SubtreeTask>, signal: &'a AbortSignal) -> Self {
        Self {
            entries,
            signal,
            tasks: Mutex::new(tasks),
            grafts: Mutex::new(Vec::new()),
        }
    }

    #[allow(clippy::expect_used)]
    fn pop(&self) -> Option<SubtreeTask> {
        self.tasks.lock().expect("lock is poisoned").pop()
    }

    #[allow(clippy::expect_used)]
    pub fn into_grafts(self) -> Vec<Graft> {
        self.grafts.into_inner().expect("lock is poisoned")
    }
}

impl Kernel for MakeTreeRecursive<'_> {
    fn parallel(&self, _worker: usize, _workers: usize) -> crate::Result<()> {
        while let Some(mut task) = self.pop() {
            self.signal.check()?;

            let mut nodes = Vec::with_capacity(task.entries.len());
            let root = make_subtree(self.entries, &mut task.entries, &mut nodes);

            if root == NIL {
                continue;
            }

            #[allow(clippy::expect_used)]
            self.grafts.lock().expect("lock is poisoned").push(Graft {
                parent: task.parent,
                side: task.side,
                nodes,
                root,
            });
        }

        Ok(())
    }
}
