// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{chunk_range, Kernel};
use crate::arena::{EntryArena, EntryId};
use std::sync::Mutex;

/// Parallel sort by one dimension: workers sort disjoint chunks,
/// `dispose` merges the sorted runs.
pub(crate) struct SortEntry<'a> {
    entries: &'a EntryArena,
    dim: usize,
    chunks: Vec<Mutex<Vec<EntryId>>>,
    merged: Vec<EntryId>,
}

impl<'a> SortEntry<'a> {
    pub fn new(entries: &'a EntryArena, dim: usize, ids: &[EntryId], workers: usize) -> Self {
        let workers = workers.max(1);

        let chunks = (0..workers)
            .map(|w| chunk_range(ids.len(), w, workers))
            .filter(|r| !r.is_empty())
            .map(|r| {
                #[allow(clippy::indexing_slicing)]
                let chunk = ids[r].to_vec();
                Mutex::new(chunk)
            })
            .collect();

        Self {
            entries,
            dim,
            chunks,
            merged: Vec::new(),
        }
    }

    pub fn into_sorted(self) -> Vec<EntryId> {
        self.merged
    }

    fn merge_two(&self, a: Vec<EntryId>, b: Vec<EntryId>) -> Vec<EntryId> {
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);

        while i < a.len() && j < b.len() {
            #[allow(clippy::indexing_slicing)]
            let (x, y) = (a[i], b[j]);
            if self
                .entries
                .value(x, self.dim)
                .total_cmp(&self.entries.value(y, self.dim))
                .is_le()
            {
                out.push(x);
                i += 1;
            } else {
                out.push(y);
                j += 1;
            }
        }

        #[allow(clippy::indexing_slicing)]
        out.extend_from_slice(&a[i..]);
        #[allow(clippy::indexing_slicing)]
        out.extend_from_slice(&b[j..]);
        out
    }
}

impl Kernel for SortEntry<'_> {
    fn parallel(&self, worker: usize, workers: usize) -> crate::Result<()> {
        for index in (worker..self.chunks.len()).step_by(workers) {
            #[allow(clippy::indexing_slicing, clippy::expect_used)]
            let mut chunk = self.chunks[index].lock().expect("lock is poisoned");

            chunk.sort_unstable_by(|a, b| {
                self.entries
                    .value(*a, self.dim)
                    .total_cmp(&self.entries.value(*b, self.dim))
            });
        }

        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn dispose(&mut self) -> crate::Result<()> {
        let chunks: Vec<Vec<EntryId>> = std::mem::take(&mut self.chunks)
            .into_iter()
            .map(|m| m.into_inner().expect("lock is poisoned"))
            .collect();

        let mut merged = Vec::new();
        for chunk in chunks {
            merged = if merged.is_empty() {
                chunk
            } else {
                self.merge_two(merged, chunk)
            };
        }

        self.merged = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing, clippy::cast_precision_loss)]

    use super::*;
    use test_log::test;

    #[test]
    fn parallel_sort_is_a_sort() -> crate::Result<()> {
        let mut arena = EntryArena::new(2, 1 << 20);
        let ids: Vec<EntryId> = (0..301)
            .map(|i| arena.allocate(i, &[(i * 7919 % 1000) as f32, 0.0]))
            .collect();

        let mut kernel = SortEntry::new(&arena, 0, &ids, 4);
        super::super::run(&mut kernel, 4)?;
        let sorted = kernel.into_sorted();

        assert_eq!(ids.len(), sorted.len());
        for pair in sorted.windows(2) {
            assert!(arena.value(pair[0], 0) <= arena.value(pair[1], 0));
        }

        Ok(())
    }
}
