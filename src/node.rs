// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    arena::{entry_size, Allocator, EntryArena, EntryId, NodeArena, NodeId, NIL},
    file::Archiver,
    search::SearchStatus,
};

/// One KD-tree node
///
/// `value` references the median entry along `split_dim`: entries
/// strictly less go right, otherwise left. A childless leaf carries
/// `split_dim = -1` until it becomes an internal node on insertion.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Node {
    pub split_dim: i32,
    pub value: EntryId,
    pub right: NodeId,
    pub left: NodeId,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            split_dim: -1,
            value: NIL,
            right: NIL,
            left: NIL,
        }
    }
}

/// Dimension with the largest variance over `ids`, computed as
/// E[x²] − E[x]²; ties resolve to the lowest index.
pub(crate) fn variance_dimension(entries: &EntryArena, ids: &[EntryId]) -> usize {
    let dim = entries.dimension();
    let mut sums = vec![(0.0f64, 0.0f64); dim];

    for id in ids {
        for (d, slot) in sums.iter_mut().enumerate() {
            let v = f64::from(entries.value(*id, d));
            slot.0 += v * v;
            slot.1 += v;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let count = ids.len() as f64;
    let mut max = 0.0f64;
    let mut max_dim = 0;

    for (d, (sq, sum)) in sums.iter().enumerate() {
        let a1 = sq / count;
        let a2 = sum / count;
        let s = a1 - a2 * a2;

        if s > max {
            max = s;
            max_dim = d;
        }
    }

    max_dim
}

pub(crate) fn sort_by_dimension(entries: &EntryArena, ids: &mut [EntryId], dim: usize) {
    ids.sort_unstable_by(|a, b| entries.value(*a, dim).total_cmp(&entries.value(*b, dim)));
}

/// Builds a subtree over `range` into `out`, returning its local root
/// id (or [`NIL`] for an empty range). Child links are local to `out`
/// and must be remapped when the block is grafted into an arena.
pub(crate) fn make_subtree(entries: &EntryArena, range: &mut [EntryId], out: &mut Vec<Node>) -> NodeId {
    let count = range.len();
    if count == 0 {
        return NIL;
    }

    #[allow(clippy::cast_possible_truncation)]
    let id = out.len() as NodeId;
    out.push(Node::default());

    if count == 1 {
        #[allow(clippy::indexing_slicing)]
        {
            out[id as usize].value = range[0];
        }
        return id;
    }

    // The split is the median of the dimension with the largest
    // variance under this node; smaller values go right, the rest left.
    let dim = variance_dimension(entries, range);
    sort_by_dimension(entries, range, dim);

    let median = count / 2;
    #[allow(clippy::indexing_slicing)]
    {
        out[id as usize].split_dim = dim as i32;
        out[id as usize].value = range[median];
    }

    let (lower, upper) = range.split_at_mut(median);
    let right = make_subtree(entries, lower, out);
    #[allow(clippy::indexing_slicing)]
    let left = make_subtree(entries, &mut upper[1..], out);

    #[allow(clippy::indexing_slicing)]
    {
        out[id as usize].right = right;
        out[id as usize].left = left;
    }

    id
}

/// Inserts an already-allocated entry below `root`.
///
/// A childless leaf first receives its split dimension, chosen as the
/// dimension of largest squared difference between the incumbent value
/// and the incoming entry.
pub(crate) fn insert(entries: &EntryArena, nodes: &mut NodeArena, root: NodeId, entry: EntryId) {
    let mut current = root;

    loop {
        let node = nodes.get(current);

        if node.right == NIL && node.left == NIL {
            let dim = entries.max_difference_dimension(node.value, entries.values(entry));
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            {
                nodes.get_mut(current).split_dim = dim as i32;
            }
        }

        let node = nodes.get(current);
        #[allow(clippy::cast_sign_loss)]
        let dim = node.split_dim as usize;

        if entries.value(entry, dim) < entries.value(node.value, dim) {
            if node.right == NIL {
                let leaf = nodes.allocate();
                nodes.get_mut(leaf).value = entry;
                nodes.get_mut(current).right = leaf;
                return;
            }
            current = node.right;
        } else {
            if node.left == NIL {
                let leaf = nodes.allocate();
                nodes.get_mut(leaf).value = entry;
                nodes.get_mut(current).left = leaf;
                return;
            }
            current = node.left;
        }
    }
}

/// Classic KD descent with back-tracking; returns the best squared
/// distance found below `id` (f64::MAX if nothing was measurable).
pub(crate) fn normal_search(
    nodes: &NodeArena,
    entries: &EntryArena,
    id: NodeId,
    query: &[f32],
    status: &mut SearchStatus<'_>,
) -> f64 {
    let node = nodes.get(id);

    if node.right == NIL && node.left == NIL {
        if !status.is_expunged(entries, node.value) && status.register_leaf_calc() {
            let d = entries.distance_sq(node.value, query);
            status.push(entries.rowid(node.value), d);
            return d;
        }
        return f64::MAX;
    }

    #[allow(clippy::cast_sign_loss)]
    let dim = node.split_dim as usize;
    #[allow(clippy::indexing_slicing)]
    let cv = f64::from(query[dim]);
    let nv = f64::from(entries.value(node.value, dim));

    let descend_right = (cv < nv && node.right != NIL) || node.left == NIL;

    let mut best = if descend_right {
        normal_search(nodes, entries, node.right, query, status)
    } else {
        normal_search(nodes, entries, node.left, query, status)
    };

    // The other side can only matter if the splitting hyperplane cuts
    // the candidate ball.
    if status.is_continue()
        && node.right != NIL
        && node.left != NIL
        && best > (cv - nv) * (cv - nv)
    {
        let other = if cv < nv { node.left } else { node.right };
        let d = normal_search(nodes, entries, other, query, status);
        if d < best {
            best = d;
        }
    }

    if !status.is_expunged(entries, node.value) {
        // Internal node values are always measured to improve the bound.
        status.register_node_calc();

        let d = entries.distance_sq(node.value, query);
        status.push(entries.rowid(node.value), d);
        if d < best {
            best = d;
        }
    }

    best
}

/// Depth-first probe of one queued subtree; the far side of each split
/// is enqueued whenever it may still undercut the current best.
fn df_search(
    nodes: &NodeArena,
    entries: &EntryArena,
    id: NodeId,
    query: &[f32],
    best: &mut f64,
    status: &mut SearchStatus<'_>,
    queue: &mut Vec<NodeId>,
) {
    let node = nodes.get(id);

    if node.right == NIL && node.left == NIL {
        if !status.is_expunged(entries, node.value) && status.register_leaf_calc() {
            let d = entries.distance_sq(node.value, query);
            status.push(entries.rowid(node.value), d);
            if d < *best {
                *best = d;
            }
        }
        return;
    }

    #[allow(clippy::cast_sign_loss)]
    let dim = node.split_dim as usize;
    #[allow(clippy::indexing_slicing)]
    let cv = f64::from(query[dim]);
    let nv = f64::from(entries.value(node.value, dim));

    if (cv < nv && node.right != NIL) || node.left == NIL {
        if node.left != NIL && (cv - nv) * (cv - nv) < *best {
            queue.push(node.left);
        }
        df_search(nodes, entries, node.right, query, best, status, queue);
    } else {
        if node.right != NIL && (cv - nv) * (cv - nv) < *best {
            queue.push(node.right);
        }
        df_search(nodes, entries, node.left, query, best, status, queue);
    }

    if !status.is_expunged(entries, node.value) {
        status.register_node_calc();

        let d = entries.distance_sq(node.value, query);
        status.push(entries.rowid(node.value), d);
        if d < *best {
            *best = d;
        }
    }
}

/// Best-first search over a FIFO queue of candidate subtrees seeded
/// with the root; terminates when the queue drains or the budget runs
/// out.
pub(crate) fn best_first_search(
    nodes: &NodeArena,
    entries: &EntryArena,
    root: NodeId,
    query: &[f32],
    status: &mut SearchStatus<'_>,
) {
    let mut best = f64::MAX;

    let mut queue =
        Vec::with_capacity((usize::try_from(status.initial_budget()).unwrap_or(usize::MAX) / 2).saturating_mul(3).min(1 << 16));
    queue.push(root);

    let mut i = 0;
    while status.is_continue() && i < queue.len() {
        #[allow(clippy::indexing_slicing)]
        let id = queue[i];
        df_search(nodes, entries, id, query, &mut best, status, &mut queue);
        i += 1;
    }
}

/// Exhaustive scan; always finds the exact nearest neighbours.
pub(crate) fn serial_search(
    nodes: &NodeArena,
    entries: &EntryArena,
    id: NodeId,
    query: &[f32],
    status: &mut SearchStatus<'_>,
) -> f64 {
    let node = nodes.get(id);

    if node.right == NIL && node.left == NIL {
        if !status.is_expunged(entries, node.value) {
            let d = entries.distance_sq(node.value, query);
            status.push(entries.rowid(node.value), d);
            return d;
        }
        return f64::MAX;
    }

    let mut best = f64::MAX;

    if node.right != NIL {
        best = serial_search(nodes, entries, node.right, query, status);
    }

    if node.left != NIL {
        let d = serial_search(nodes, entries, node.left, query, status);
        if node.right == NIL || d < best {
            best = d;
        }
    }

    if !status.is_expunged(entries, node.value) {
        let d = entries.distance_sq(node.value, query);
        status.push(entries.rowid(node.value), d);
        if d < best {
            best = d;
        }
    }

    best
}

/// Pre-order dump of the subtree below `id`.
///
/// A childless leaf is written with split dimension 0. Its split
/// dimension is never consulted before an insertion assigns it, and
/// the value -1 is reserved for the empty-tree sentinel at the root.
pub(crate) fn dump(
    nodes: &NodeArena,
    entries: &EntryArena,
    id: NodeId,
    archiver: &mut Archiver<'_>,
) -> crate::Result<()> {
    let node = nodes.get(id);

    archiver.write_i32(node.split_dim.max(0))?;
    dump_entry(entries, node.value, archiver)?;

    if node.right == NIL {
        archiver.write_i32(0)?;
    } else {
        archiver.write_i32(1)?;
        dump(nodes, entries, node.right, archiver)?;
    }

    if node.left == NIL {
        archiver.write_i32(0)?;
    } else {
        archiver.write_i32(1)?;
        dump(nodes, entries, node.left, archiver)?;
    }

    Ok(())
}

fn dump_entry(
    entries: &EntryArena,
    id: EntryId,
    archiver: &mut Archiver<'_>,
) -> crate::Result<()> {
    archiver.write_u32(entries.rowid(id))?;
    archiver.write_u32(entries.flags(id))?;

    for v in entries.values(id) {
        archiver.write_f32(*v)?;
    }

    let padding = entry_size(entries.dimension()) - 8 - 4 * entries.dimension();
    for _ in 0..padding {
        archiver.write_u8(0)?;
    }

    Ok(())
}

/// Loads a pre-order dump; `split_dim` was already consumed by the
/// caller.
pub(crate) fn load(
    alloc: &mut Allocator,
    split_dim: i32,
    archiver: &mut Archiver<'_>,
) -> crate::Result<NodeId> {
    let value = load_entry(&mut alloc.entries, archiver)?;

    let id = alloc.nodes.allocate();
    {
        let node = alloc.nodes.get_mut(id);
        node.split_dim = split_dim;
        node.value = value;
    }

    if archiver.read_i32()? == 1 {
        let dim = archiver.read_i32()?;
        let right = load(alloc, dim, archiver)?;
        alloc.nodes.get_mut(id).right = right;
    }

    if archiver.read_i32()? == 1 {
        let dim = archiver.read_i32()?;
        let left = load(alloc, dim, archiver)?;
        alloc.nodes.get_mut(id).left = left;
    }

    Ok(id)
}

fn load_entry(entries: &mut EntryArena, archiver: &mut Archiver<'_>) -> crate::Result<EntryId> {
    let rowid = archiver.read_u32()?;
    let flags = archiver.read_u32()?;

    if (flags & 0xFFFF) as usize != entries.dimension() {
        return Err(crate::Error::IndexFileCorrupted(
            "entry record carries a foreign dimension",
        ));
    }

    let dim = entries.dimension();
    let mut values = Vec::with_capacity(dim);
    for _ in 0..dim {
        values.push(archiver.read_f32()?);
    }

    let padding = entry_size(dim) - 8 - 4 * dim;
    for _ in 0..padding {
        let _ = archiver.read_u8()?;
    }

    Ok(entries.allocate_raw(rowid, flags, &values))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::cast_precision_loss)]

    use super::*;
    use crate::search::TraceType;
    use test_log::test;

    fn arena_with(points: &[(u32, [f32; 2])]) -> (Allocator, Vec<EntryId>) {
        let mut alloc = Allocator::new(2, 1 << 20);
        let ids = points
            .iter()
            .map(|(rowid, v)| alloc.entries.allocate(*rowid, v))
            .collect();
        (alloc, ids)
    }

    fn build(alloc: &mut Allocator, ids: &mut [EntryId]) -> NodeId {
        let mut out = Vec::new();
        let root = make_subtree(&alloc.entries, ids, &mut out);
        if root == NIL {
            return NIL;
        }
        let base = alloc.nodes.graft(&out);
        base + root
    }

    #[test]
    fn make_subtree_empty_and_single() {
        let (mut alloc, mut ids) = arena_with(&[(1, [0.0, 0.0])]);

        let mut none: Vec<EntryId> = Vec::new();
        assert_eq!(NIL, build(&mut alloc, &mut none));

        let root = build(&mut alloc, &mut ids);
        let node = alloc.nodes.get(root);
        assert_eq!(-1, node.split_dim);
        assert_eq!(NIL, node.right);
        assert_eq!(NIL, node.left);
    }

    #[test]
    fn split_goes_to_max_variance_dimension() {
        // variance along dimension 1 dominates
        let (mut alloc, mut ids) = arena_with(&[
            (1, [0.0, 0.0]),
            (2, [1.0, 10.0]),
            (3, [2.0, 20.0]),
            (4, [3.0, 30.0]),
        ]);

        let root = build(&mut alloc, &mut ids);
        assert_eq!(1, alloc.nodes.get(root).split_dim);
    }

    #[test]
    fn partition_invariant() {
        let points: Vec<(u32, [f32; 2])> = (0..64)
            .map(|i| (i, [(i * 37 % 64) as f32, (i * 11 % 64) as f32]))
            .collect();
        let (mut alloc, mut ids) = arena_with(&points);
        let root = build(&mut alloc, &mut ids);

        fn check(alloc: &Allocator, id: NodeId) {
            let node = alloc.nodes.get(id);
            if node.right == NIL && node.left == NIL {
                return;
            }

            let dim = node.split_dim as usize;
            let pivot = alloc.entries.value(node.value, dim);

            fn collect(alloc: &Allocator, id: NodeId, out: &mut Vec<EntryId>) {
                if id == NIL {
                    return;
                }
                let n = alloc.nodes.get(id);
                out.push(n.value);
                collect(alloc, n.right, out);
                collect(alloc, n.left, out);
            }

            let mut right = Vec::new();
            collect(alloc, node.right, &mut right);
            for e in right {
                assert!(alloc.entries.value(e, dim) < pivot);
            }

            let mut left = Vec::new();
            collect(alloc, node.left, &mut left);
            for e in left {
                assert!(alloc.entries.value(e, dim) >= pivot);
            }

            if node.right != NIL {
                check(alloc, node.right);
            }
            if node.left != NIL {
                check(alloc, node.left);
            }
        }

        check(&alloc, root);
    }

    #[test]
    fn insert_assigns_leaf_dimension() {
        let (mut alloc, mut ids) = arena_with(&[(1, [5.0, 5.0])]);
        let root = build(&mut alloc, &mut ids);
        assert_eq!(-1, alloc.nodes.get(root).split_dim);

        // dimension 1 differs most
        let e = alloc.entries.allocate(2, &[5.5, 9.0]);
        insert(&alloc.entries, &mut alloc.nodes, root, e);

        let node = alloc.nodes.get(root);
        assert_eq!(1, node.split_dim);
        // 9.0 >= 5.0 goes left
        assert_eq!(NIL, node.right);
        assert_ne!(NIL, node.left);
    }

    #[test]
    fn serial_matches_brute_force() {
        let points: Vec<(u32, [f32; 2])> = (0..50)
            .map(|i| (i, [(i * 13 % 50) as f32, (i * 29 % 50) as f32]))
            .collect();
        let (mut alloc, mut ids) = arena_with(&points);
        let root = build(&mut alloc, &mut ids);

        let query = [7.3f32, 21.9];

        let mut expected: Vec<(f64, u32)> = points
            .iter()
            .map(|(rowid, v)| {
                let dx = f64::from(v[0]) - f64::from(query[0]);
                let dy = f64::from(v[1]) - f64::from(query[1]);
                (dx * dx + dy * dy, *rowid)
            })
            .collect();
        expected.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut status = SearchStatus::new(TraceType::Serial, 0, 5, None);
        serial_search(&alloc.nodes, &alloc.entries, root, &query, &mut status);
        let hits = status.into_hits();

        assert_eq!(5, hits.len());
        for (hit, (d, rowid)) in hits.iter().zip(expected.iter()) {
            assert_eq!(*rowid, hit.rowid);
            assert!((hit.distance_sq - d).abs() < 1e-9);
        }
    }

    #[test]
    fn normal_search_finds_nearest() {
        let points: Vec<(u32, [f32; 2])> = (0..100)
            .map(|i| (i, [(i % 10) as f32, (i / 10) as f32]))
            .collect();
        let (mut alloc, mut ids) = arena_with(&points);
        let root = build(&mut alloc, &mut ids);

        let query = [3.2f32, 6.9];
        let mut status = SearchStatus::new(TraceType::Normal, 10_000, 1, None);
        normal_search(&alloc.nodes, &alloc.entries, root, &query, &mut status);
        assert!(!status.exhausted());
        let hits = status.into_hits();

        // nearest grid point is (3, 7) -> rowid 73
        assert_eq!(73, hits.first().map(|h| h.rowid).unwrap_or_default());
    }

    #[test]
    fn best_first_matches_serial_with_ample_budget() {
        let points: Vec<(u32, [f32; 2])> = (0..200)
            .map(|i| (i, [(i * 7 % 101) as f32, (i * 3 % 97) as f32]))
            .collect();
        let (mut alloc, mut ids) = arena_with(&points);
        let root = build(&mut alloc, &mut ids);

        let query = [40.0f32, 40.0];

        let mut serial = SearchStatus::new(TraceType::Serial, 0, 3, None);
        serial_search(&alloc.nodes, &alloc.entries, root, &query, &mut serial);
        let expected = serial.into_hits();

        let mut bf = SearchStatus::new(TraceType::BestFirst, 1_000_000, 3, None);
        best_first_search(&alloc.nodes, &alloc.entries, root, &query, &mut bf);
        let got = bf.into_hits();

        assert_eq!(expected, got);
    }

    #[test]
    fn expunged_entries_are_filtered() {
        let (mut alloc, mut ids) = arena_with(&[(1, [0.0, 0.0]), (2, [1.0, 0.0]), (3, [0.0, 1.0])]);
        let root = build(&mut alloc, &mut ids);

        // rowid 2 is flagged in place
        let expunged = ids
            .iter()
            .copied()
            .find(|id| alloc.entries.rowid(*id) == 2)
            .unwrap();
        alloc.entries.expunge(expunged);

        let mut status = SearchStatus::new(TraceType::Serial, 0, 3, None);
        serial_search(&alloc.nodes, &alloc.entries, root, &[1.0, 0.1], &mut status);
        let hits = status.into_hits();

        assert_eq!(2, hits.len());
        assert!(hits.iter().all(|h| h.rowid != 2));
    }
}
