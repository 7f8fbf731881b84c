// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Kernel;
use crate::{
    bitset::RowIdSet,
    index::KdTreeIndex,
    search::{merge_hits, QueryResult, SearchStatus, TraceType},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

/// Parallel batch search over the main and the two small indices.
///
/// Workers pull query indices from a shared cursor. Most hits come from
/// the main index, so the small indices run on half the distance
/// budget, which keeps a miss there from dominating the query cost.
pub(crate) struct DoSearch<'a> {
    main: Option<&'a KdTreeIndex>,
    small1: Option<&'a KdTreeIndex>,
    small2: Option<&'a KdTreeIndex>,
    main_mask: Option<&'a RowIdSet>,
    small1_mask: Option<&'a RowIdSet>,
    queries: &'a [Vec<f32>],
    trace: TraceType,
    budget: u64,
    limit: usize,
    cursor: AtomicUsize,
    results: Mutex<Vec<QueryResult>>,
}

impl<'a> DoSearch<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main: Option<&'a KdTreeIndex>,
        small1: Option<&'a KdTreeIndex>,
        small2: Option<&'a KdTreeIndex>,
        main_mask: Option<&'a RowIdSet>,
        small1_mask: Option<&'a RowIdSet>,
        queries: &'a [Vec<f32>],
        trace: TraceType,
        budget: u64,
        limit: usize,
    ) -> Self {
        Self {
            main,
            small1,
            small2,
            main_mask,
            small1_mask,
            queries,
            trace,
            budget,
            limit,
            cursor: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
        }
    }

    #[allow(clippy::expect_used)]
    pub fn into_results(self) -> Vec<QueryResult> {
        self.results.into_inner().expect("lock is poisoned")
    }
}

impl Kernel for DoSearch<'_> {
    fn prepare(&mut self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut results = self.results.lock().expect("lock is poisoned");
        results.clear();
        results.resize(self.queries.len(), QueryResult::default());
        Ok(())
    }

    fn parallel(&self, _worker: usize, _workers: usize) -> crate::Result<()> {
        loop {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(query) = self.queries.get(i) else {
                return Ok(());
            };

            let mut hits = Vec::new();
            let mut exhausted = false;

            let lanes: [(Option<&KdTreeIndex>, Option<&RowIdSet>, u64); 3] = [
                (self.main, self.main_mask, self.budget),
                (self.small1, self.small1_mask, self.budget / 2),
                (self.small2, None, self.budget / 2),
            ];

            for (index, mask, budget) in lanes {
                let Some(index) = index else { continue };

                let mut status = SearchStatus::new(self.trace, budget, self.limit, mask);
                index.nnsearch(query, &mut status);

                exhausted |= status.exhausted();
                hits.append(&mut status.into_hits());
            }

            let merged = merge_hits(hits, self.limit);

            #[allow(clippy::expect_used, clippy::indexing_slicing)]
            {
                let mut results = self.results.lock().expect("lock is poisoned");
                results[i] = QueryResult {
                    hits: merged,
                    exhausted,
                };
            }
        }
    }
}
