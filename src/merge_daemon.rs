// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    abort::AbortSignal,
    engine::{EngineInner, LogRecord},
    merge_reserve::{Job, JobType},
    tx::TxMode,
};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};

const IDLE_POLL: Duration = Duration::from_millis(500);
const MERGE_LOCK_WAIT: Duration = Duration::from_millis(1_000);

/// One background thread transforming queued merge/discard jobs into
/// committed main-index rebuilds
///
/// Every job's error is contained so one bad store does not take the
/// daemon down; only a cancel stops it.
pub(crate) struct MergeDaemon {
    signal: AbortSignal,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MergeDaemon {
    pub fn spawn(engine: Weak<EngineInner>) -> Self {
        let signal = AbortSignal::default();
        let thread_signal = signal.clone();

        #[allow(clippy::expect_used)]
        let handle = std::thread::Builder::new()
            .name("kd-merge".into())
            .spawn(move || daemon_loop(&engine, &thread_signal))
            .expect("failed to spawn merge daemon");

        Self {
            signal,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.signal.send();

        if let Some(handle) = self.handle.take() {
            // the engine may drop from within the daemon's own
            // transient handle; never join ourselves
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for MergeDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_loop(engine: &Weak<EngineInner>, signal: &AbortSignal) {
    loop {
        if signal.is_aborted() {
            return;
        }

        let Some(engine) = engine.upgrade() else {
            return;
        };

        let Some(job) = engine.reserve.front() else {
            drop(engine);
            std::thread::sleep(IDLE_POLL);
            continue;
        };

        let result = run_job(&engine, &job, signal);
        engine.reserve.erase(&job);

        match result {
            Ok(()) => {}
            Err(crate::Error::Cancelled) => return,
            Err(crate::Error::LockTimeout) => {
                log::debug!("kd-tree merge of {:?} skipped: lock timeout", job.store);
            }
            Err(e) => {
                log::error!("kd-tree merge daemon: {:?} job for {:?} failed: {e}", job.kind, job.store);
            }
        }
    }
}

/// Runs one queued job; shared by the daemon and the synchronous
/// drain.
pub(crate) fn run_job(
    engine: &Arc<EngineInner>,
    job: &Job,
    signal: &AbortSignal,
) -> crate::Result<()> {
    match job.kind {
        JobType::Merge => run_merge(engine, job, signal),
        JobType::Discard => run_discard(engine, job),
    }
}

fn run_merge(engine: &Arc<EngineInner>, job: &Job, signal: &AbortSignal) -> crate::Result<()> {
    let Some(file) = engine.get_file(&job.store) else {
        log::info!("kd-tree store {:?} is gone, dropping merge job", job.store);
        return Ok(());
    };

    // batch loads own the store; a bounded wait, then skip this round
    file.wait_ready_for_merge(MERGE_LOCK_WAIT)?;

    let tx = engine.tx.begin(TxMode::ReadWrite);

    engine.push_log(LogRecord::KdTreeMerge {
        store: job.store.clone(),
    });

    log::info!("start kd-tree index merge ({:?})", job.store);

    file.open_for_merge()?;

    if let Err(e) = file.merge(&tx, signal) {
        // the merge-in-progress flag stays set: queries keep searching
        // the half-drained merge side and the next cycle resumes it
        tx.commit();
        log::info!("cancel kd-tree index merge ({:?})", job.store);
        return Err(e);
    }

    file.close_for_merge()?;
    tx.commit();

    log::info!("end kd-tree index merge ({:?})", job.store);

    // a new main version exists now; queue the cleanup of old ones
    engine
        .reserve
        .push_back(job.store.clone(), JobType::Discard);

    Ok(())
}

fn run_discard(engine: &Arc<EngineInner>, job: &Job) -> crate::Result<()> {
    let Some(set) = engine.index_sets.get(&job.store) else {
        return Ok(());
    };

    if !set.discard(&engine.tx) {
        // versions are still pinned by running snapshot readers
        engine
            .reserve
            .push_back(job.store.clone(), JobType::Discard);
    }

    Ok(())
}
