// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{chunk_range, Kernel};
use crate::arena::{EntryArena, EntryId};
use std::sync::Mutex;

/// Parallel per-dimension variance: workers accumulate Σx² and Σx over
/// disjoint chunks, `dispose` picks the argmax of E[x²] − E[x]².
pub(crate) struct CalcVariance<'a> {
    entries: &'a EntryArena,
    ids: &'a [EntryId],
    sums: Mutex<Vec<(f64, f64)>>,
    max_dimension: usize,
}

impl<'a> CalcVariance<'a> {
    pub fn new(entries: &'a EntryArena, ids: &'a [EntryId]) -> Self {
        Self {
            entries,
            ids,
            sums: Mutex::new(Vec::new()),
            max_dimension: 0,
        }
    }

    pub fn max_dimension(&self) -> usize {
        self.max_dimension
    }
}

impl Kernel for CalcVariance<'_> {
    fn prepare(&mut self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut sums = self.sums.lock().expect("lock is poisoned");
        sums.clear();
        sums.resize(self.entries.dimension(), (0.0, 0.0));
        Ok(())
    }

    fn parallel(&self, worker: usize, workers: usize) -> crate::Result<()> {
        let range = chunk_range(self.ids.len(), worker, workers);
        if range.is_empty() {
            return Ok(());
        }

        let mut local = vec![(0.0f64, 0.0f64); self.entries.dimension()];

        #[allow(clippy::indexing_slicing)]
        for id in &self.ids[range] {
            for (d, slot) in local.iter_mut().enumerate() {
                let v = f64::from(self.entries.value(*id, d));
                slot.0 += v * v;
                slot.1 += v;
            }
        }

        #[allow(clippy::expect_used)]
        let mut sums = self.sums.lock().expect("lock is poisoned");
        for (slot, partial) in sums.iter_mut().zip(local.iter()) {
            slot.0 += partial.0;
            slot.1 += partial.1;
        }

        Ok(())
    }

    fn dispose(&mut self) -> crate::Result<()> {
        #[allow(clippy::cast_precision_loss)]
        let count = self.ids.len() as f64;

        #[allow(clippy::expect_used)]
        let sums = self.sums.lock().expect("lock is poisoned");

        let mut max = 0.0f64;
        self.max_dimension = 0;

        for (d, (sq, sum)) in sums.iter().enumerate() {
            let a1 = sq / count;
            let a2 = sum / count;
            let s = a1 - a2 * a2;

            if s > max {
                max = s;
                self.max_dimension = d;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::cast_precision_loss)]

    use super::*;
    use crate::node::variance_dimension;
    use test_log::test;

    #[test]
    fn matches_serial_variance() -> crate::Result<()> {
        let mut arena = EntryArena::new(3, 1 << 20);
        let ids: Vec<EntryId> = (0..500)
            .map(|i| arena.allocate(i, &[(i % 7) as f32, (i % 83) as f32, (i % 3) as f32]))
            .collect();

        let mut kernel = CalcVariance::new(&arena, &ids);
        super::super::run(&mut kernel, 4)?;

        assert_eq!(variance_dimension(&arena, &ids), kernel.max_dimension());
        assert_eq!(1, kernel.max_dimension());

        Ok(())
    }
}
