// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    abort::AbortSignal,
    arena::{Allocator, EntryId, NodeId, NIL},
    file::{DataFile, IndexFile},
    node,
    parallel::{self, CalcVariance, LoadEntry, MakeTreeRecursive, Side, SortEntry, SubtreeTask},
    search::SearchStatus,
    TraceType,
};
use std::collections::BTreeMap;

/// Lifecycle state of one index version
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum IndexStatus {
    /// Header placeholder; the previous version still carries the body
    Copy,

    /// Immutable body built or loaded
    Fix,
}

/// One version of an in-memory KD-tree
///
/// Owns its allocator exclusively; every entry and node reachable from
/// the root lives there and is freed wholesale with this version.
pub(crate) struct KdTreeIndex {
    dimension: usize,
    allocator: Allocator,
    root: NodeId,

    /// rowid → entry, one-to-one with the non-expunged entries of the
    /// tree; only maintained for small indices
    rowid_map: BTreeMap<u32, EntryId>,

    status: IndexStatus,
}

impl KdTreeIndex {
    pub fn new(dimension: usize, allocate_unit_size: usize) -> Self {
        Self {
            dimension,
            allocator: Allocator::new(dimension, allocate_unit_size),
            root: NIL,
            rowid_map: BTreeMap::new(),
            status: IndexStatus::Copy,
        }
    }

    pub fn status(&self) -> IndexStatus {
        self.status
    }

    #[cfg(test)]
    pub fn force_fix(&mut self) {
        self.status = IndexStatus::Fix;
    }

    /// An empty, already-fixed version (used to seal a cleared small
    /// chain).
    pub fn empty_fixed(dimension: usize, allocate_unit_size: usize) -> Self {
        Self {
            status: IndexStatus::Fix,
            ..Self::new(dimension, allocate_unit_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    pub fn byte_size(&self) -> u64 {
        self.allocator.byte_size()
    }

    /// Rebuilds this version from a data file.
    ///
    /// Two-phase parallel build: while there is plenty of data, each
    /// step (variance, sort) fans out over the pool; once the budget is
    /// halved away, whole child ranges go to the subtree worker pool.
    pub fn create(
        &mut self,
        data: &dyn DataFile,
        threads: usize,
        signal: &AbortSignal,
        is_small: bool,
    ) -> crate::Result<()> {
        self.root = NIL;
        self.allocator.clear();
        self.rowid_map.clear();

        if data.count()? != 0 {
            let mut load = LoadEntry::new(data);
            parallel::run(&mut load, threads)?;

            signal.check()?;

            let mut ids: Vec<EntryId> = Vec::new();
            for batch in load.into_batches() {
                ids.extend(self.allocator.entries.append_batch(&batch));
            }

            if is_small {
                for id in &ids {
                    self.rowid_map.insert(self.allocator.entries.rowid(*id), *id);
                }
            }

            let parallel_count = threads << 1;
            let mut tasks: Vec<SubtreeTask> = Vec::new();

            let Allocator { entries, nodes } = &mut self.allocator;

            let root = hybrid_make_tree(
                entries,
                nodes,
                &mut ids,
                parallel_count,
                &mut tasks,
                signal,
                threads,
            )?;

            // leftover ranges are built single-threaded per subtree
            let mut pool = MakeTreeRecursive::new(entries, tasks, signal);
            parallel::run(&mut pool, threads)?;

            for graft in pool.into_grafts() {
                let base = nodes.graft(&graft.nodes);
                let child = base + graft.root;
                match graft.side {
                    Side::Right => nodes.get_mut(graft.parent).right = child,
                    Side::Left => nodes.get_mut(graft.parent).left = child,
                }
            }

            self.root = root;
        }

        self.status = IndexStatus::Fix;
        Ok(())
    }

    /// Copies the vector into the arena and hangs it into the tree.
    /// Small indices only.
    pub fn insert(&mut self, rowid: u32, values: &[f32]) {
        let id = self.allocator.entries.allocate(rowid, values);
        self.rowid_map.insert(rowid, id);

        if self.root == NIL {
            let root = self.allocator.nodes.allocate();
            self.allocator.nodes.get_mut(root).value = id;
            self.root = root;
        } else {
            let Allocator { entries, nodes } = &mut self.allocator;
            node::insert(entries, nodes, self.root, id);
        }
    }

    /// Flags the entry as expunged in place and drops it from the rowid
    /// map; the entry stays tree-reachable but is filtered by searches.
    /// Returns whether the rowid was present.
    pub fn expunge(&mut self, rowid: u32) -> bool {
        if let Some(id) = self.rowid_map.remove(&rowid) {
            self.allocator.entries.expunge(id);
            true
        } else {
            false
        }
    }

    pub fn nnsearch(&self, query: &[f32], status: &mut SearchStatus<'_>) {
        if self.root == NIL {
            return;
        }

        // a zero budget means no distance computations at all
        if status.initial_budget() == 0 {
            return;
        }

        let entries = &self.allocator.entries;
        let nodes = &self.allocator.nodes;

        match status.trace() {
            TraceType::Normal => {
                node::normal_search(nodes, entries, self.root, query, status);
            }
            TraceType::BestFirst => {
                node::best_first_search(nodes, entries, self.root, query, status);
            }
            TraceType::Serial => {
                node::serial_search(nodes, entries, self.root, query, status);
            }
        }
    }

    /// Serializes the tree pre-order into the dump file; returns the
    /// number of pages written (still unflushed).
    pub fn dump(&self, file: &IndexFile) -> crate::Result<u32> {
        let mut archiver = file.archiver_write();

        if self.root == NIL {
            // the sentinel that load() reads as "no tree"
            archiver.write_i32(-1)?;
        } else {
            node::dump(
                &self.allocator.nodes,
                &self.allocator.entries,
                self.root,
                &mut archiver,
            )?;
        }

        archiver.finish()
    }

    /// Loads the tree from the dump file.
    pub fn load(&mut self, file: &IndexFile) -> crate::Result<()> {
        self.root = NIL;
        self.allocator.clear();
        self.rowid_map.clear();

        let mut archiver = file.archiver_read()?;

        let split_dim = archiver.read_i32()?;
        if split_dim != -1 {
            self.root = node::load(&mut self.allocator, split_dim, &mut archiver)?;
        }

        self.status = IndexStatus::Fix;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn hybrid_make_tree(
    entries: &crate::arena::EntryArena,
    nodes: &mut crate::arena::NodeArena,
    range: &mut [EntryId],
    parallel_count: usize,
    tasks: &mut Vec<SubtreeTask>,
    signal: &AbortSignal,
    threads: usize,
) -> crate::Result<NodeId> {
    let count = range.len();
    if count == 0 {
        return Ok(NIL);
    }

    let id = nodes.allocate();

    if count == 1 {
        #[allow(clippy::indexing_slicing)]
        {
            nodes.get_mut(id).value = range[0];
        }
        return Ok(id);
    }

    let dim = {
        let mut kernel = CalcVariance::new(entries, range);
        parallel::run(&mut kernel, threads)?;
        kernel.max_dimension()
    };

    signal.check()?;

    {
        let mut kernel = SortEntry::new(entries, dim, range, threads);
        parallel::run(&mut kernel, threads)?;
        range.copy_from_slice(&kernel.into_sorted());
    }

    signal.check()?;

    let median = count / 2;
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    {
        let node = nodes.get_mut(id);
        node.split_dim = dim as i32;
        #[allow(clippy::indexing_slicing)]
        {
            node.value = range[median];
        }
    }

    let (lower, upper) = range.split_at_mut(median);
    #[allow(clippy::indexing_slicing)]
    let rest = &mut upper[1..];

    let next = parallel_count >> 1;
    if next > 0 {
        let right = hybrid_make_tree(entries, nodes, lower, next, tasks, signal, threads)?;
        nodes.get_mut(id).right = right;

        let left = hybrid_make_tree(entries, nodes, rest, next, tasks, signal, threads)?;
        nodes.get_mut(id).left = left;
    } else {
        tasks.push(SubtreeTask {
            parent: id,
            side: Side::Right,
            entries: lower.to_vec(),
        });
        tasks.push(SubtreeTask {
            parent: id,
            side: Side::Left,
            entries: rest.to_vec(),
        });
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use super::*;
    use crate::search::SearchStatus;
    use test_log::test;

    const UNIT: usize = 1 << 20;

    #[test]
    fn insert_expunge_search() {
        let mut index = KdTreeIndex::new(2, UNIT);

        index.insert(1, &[0.0, 0.0]);
        index.insert(2, &[1.0, 0.0]);
        index.insert(3, &[0.0, 1.0]);

        assert!(index.expunge(2));
        assert!(!index.expunge(2));

        let mut status = SearchStatus::new(TraceType::Normal, 100, 2, None);
        index.nnsearch(&[0.1, 0.1], &mut status);
        assert!(!status.exhausted());

        let hits = status.into_hits();
        assert_eq!(2, hits.len());

        assert_eq!(1, hits[0].rowid);
        assert!((hits[0].distance_sq - 0.02).abs() < 1e-6);

        assert_eq!(3, hits[1].rowid);
        assert!((hits[1].distance_sq - 0.82).abs() < 1e-6);
    }

    #[test]
    fn budget_zero_returns_nothing() {
        let mut index = KdTreeIndex::new(2, UNIT);
        for i in 0..10 {
            #[allow(clippy::cast_precision_loss)]
            index.insert(i, &[i as f32, 0.0]);
        }

        for trace in [TraceType::Normal, TraceType::BestFirst, TraceType::Serial] {
            let mut status = SearchStatus::new(trace, 0, 5, None);
            index.nnsearch(&[1.0, 0.0], &mut status);
            assert!(status.into_hits().is_empty());
        }
    }

    #[test]
    fn k_larger_than_tree_returns_everything() {
        let mut index = KdTreeIndex::new(2, UNIT);
        for i in 0..5 {
            #[allow(clippy::cast_precision_loss)]
            index.insert(i, &[i as f32, 0.0]);
        }

        let mut status = SearchStatus::new(TraceType::Serial, 1_000, 100, None);
        index.nnsearch(&[0.0, 0.0], &mut status);
        let hits = status.into_hits();

        assert_eq!(5, hits.len());
        for pair in hits.windows(2) {
            assert!(pair[0].distance_sq <= pair[1].distance_sq);
        }
    }

    #[test]
    fn tiny_budget_reports_exhaustion() {
        let mut index = KdTreeIndex::new(2, UNIT);
        for i in 0..1_000u32 {
            #[allow(clippy::cast_precision_loss)]
            index.insert(i, &[(i % 97) as f32, (i % 89) as f32]);
        }

        let query = [50.0f32, 50.0];

        let mut bounded = SearchStatus::new(TraceType::Normal, 4, 1, None);
        index.nnsearch(&query, &mut bounded);
        assert!(bounded.exhausted());
        let bounded_hits = bounded.into_hits();

        let mut exact = SearchStatus::new(TraceType::Serial, 4, 1, None);
        index.nnsearch(&query, &mut exact);
        let exact_hits = exact.into_hits();

        // the bounded answer can never beat ground truth
        if let (Some(b), Some(e)) = (bounded_hits.first(), exact_hits.first()) {
            assert!(b.distance_sq >= e.distance_sq);
        }
    }
}
