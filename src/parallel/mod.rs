// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bounded worker pool with a uniform prepare/parallel/dispose
//! lifecycle, used by the build and search kernels.

pub(crate) mod calc_variance;
pub(crate) mod do_search;
pub(crate) mod load_entry;
pub(crate) mod make_tree;
pub(crate) mod sort_entry;

pub(crate) use calc_variance::CalcVariance;
pub(crate) use do_search::DoSearch;
pub(crate) use load_entry::LoadEntry;
pub(crate) use make_tree::{MakeTreeRecursive, Side, SubtreeTask};
pub(crate) use sort_entry::SortEntry;

/// A parallel kernel: `prepare` runs once up front, `parallel` on every
/// worker, `dispose` once after all workers joined.
pub(crate) trait Kernel: Sync {
    fn prepare(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn parallel(&self, worker: usize, workers: usize) -> crate::Result<()>;

    fn dispose(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Runs a kernel on `threads` workers, propagating the first error.
#[allow(clippy::expect_used)]
pub(crate) fn run<K: Kernel>(kernel: &mut K, threads: usize) -> crate::Result<()> {
    let threads = threads.max(1);

    kernel.prepare()?;

    if threads == 1 {
        kernel.parallel(0, 1)?;
    } else {
        let shared = &*kernel;

        let results: Vec<crate::Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|worker| scope.spawn(move || shared.parallel(worker, threads)))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker thread panicked"))
                .collect()
        });

        for result in results {
            result?;
        }
    }

    kernel.dispose()
}

/// Number of workers used when the configuration does not pin one.
pub(crate) fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Splits `len` items into per-worker ranges of at least 10 items, the
/// last worker absorbing the remainder cut-off.
pub(crate) fn chunk_range(len: usize, worker: usize, workers: usize) -> std::ops::Range<usize> {
    let per = len.div_ceil(workers).max(10);
    let start = (worker * per).min(len);
    let end = ((worker + 1) * per).min(len);
    start..end
}
