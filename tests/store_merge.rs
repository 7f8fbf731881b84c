use kd_index::{Config, Engine, LogRecord, TraceType};
use test_log::test;

#[test]
fn threshold_triggers_merge_cycle() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Engine::new();

    let file = Config::new(folder.path(), 2)
        .merge_count_threshold(1_000)
        .open(&engine)?;

    let tx = engine.begin_read_write();
    for i in 0..1_000u32 {
        file.insert(&tx, i, &[(i * 31 % 501) as f32, (i * 17 % 499) as f32])?;
    }
    tx.commit();

    // before the merge: everything sits in the executor-side file
    assert_eq!(0, file.master_count()?);
    assert_eq!(1_000, file.executor_count()?);
    assert!(engine.pending_jobs() > 0);

    // one cycle: the merge runs, then the discard it enqueued
    let handled = engine.run_pending_jobs()?;
    assert!(handled >= 2, "merge and discard should both run");
    assert_eq!(0, engine.pending_jobs());

    assert_eq!(1_000, file.master_count()?);
    assert_eq!(0, file.merge_side_count()?);

    assert!(engine
        .logical_log()
        .iter()
        .any(|r| matches!(r, LogRecord::KdTreeMerge { .. })));

    // everything is still findable
    let tx = engine.begin_no_version();
    let results = file.nnsearch(
        &tx,
        &[vec![(500 * 31 % 501) as f32, (500 * 17 % 499) as f32]],
        TraceType::Serial,
        1_000_000,
        1,
    )?;
    assert_eq!(500, results[0].hits[0].rowid);

    Ok(())
}

#[test]
fn merge_applies_inserts_and_deletes() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Engine::new();

    let file = Config::new(folder.path(), 2)
        .merge_count_threshold(100)
        .unit_merge_expunge_count(3)
        .unit_merge_insert_page_count(1)
        .open(&engine)?;

    // main data via batch load
    {
        let file = file.clone();
        file.set_batch_mode();
        let tx = engine.begin_read_write();
        for i in 0..200u32 {
            file.insert(&tx, i, &[i as f32, 0.0])?;
        }
        file.close(&tx)?;
        tx.commit();
    }
    assert_eq!(200, file.master_count()?);

    // live writes: delete 10 main rows, add 100 new ones
    let tx = engine.begin_read_write();
    for i in 0..10u32 {
        file.expunge(&tx, i * 3)?;
    }
    for i in 200..300u32 {
        file.insert(&tx, i, &[i as f32, 1.0])?;
    }
    tx.commit();

    let before = file.master_count()?;
    assert_eq!(200, before);

    assert!(engine.pending_jobs() > 0, "threshold crossed");
    engine.run_pending_jobs()?;

    // count(main_after) = count(main_before) + inserts - deletes
    assert_eq!(200 + 100 - 10, file.master_count()?);
    assert_eq!(0, file.merge_side_count()?);
    assert_eq!(0, file.executor_count()?);

    // deleted rows are gone, merged rows findable
    let tx = engine.begin_no_version();

    let results = file.nnsearch(&tx, &[vec![3.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_ne!(3, results[0].hits[0].rowid, "rowid 3 was deleted");

    let results = file.nnsearch(&tx, &[vec![250.0, 1.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_eq!(250, results[0].hits[0].rowid);

    Ok(())
}

#[test]
fn searches_stay_consistent_during_a_merge() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Engine::new();

    let file = Config::new(folder.path(), 2)
        .merge_count_threshold(1_000_000)
        .open(&engine)?;

    let tx = engine.begin_read_write();
    for i in 0..50u32 {
        file.insert(&tx, i, &[i as f32, 0.0])?;
    }
    tx.commit();

    // drive the merge by hand, searching between the steps
    file.open_for_merge()?;

    let read = engine.begin_no_version();
    let results = file.nnsearch(&read, &[vec![25.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_eq!(25, results[0].hits[0].rowid, "merge side still searchable");

    // writes during the merge land on the fresh executor side
    let tx = engine.begin_read_write();
    file.insert(&tx, 100, &[100.0, 0.0])?;
    tx.commit();

    let results = file.nnsearch(&read, &[vec![100.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_eq!(100, results[0].hits[0].rowid);

    let merge_tx = engine.begin_read_write();
    file.merge(&merge_tx, &kd_index::AbortSignal::default())?;
    file.close_for_merge()?;
    merge_tx.commit();

    assert_eq!(50, file.master_count()?);
    assert_eq!(1, file.executor_count()?, "live write survived the merge");

    // post-merge: merged rows come from main, the live write from the
    // executor side, and nothing is duplicated
    let results = file.nnsearch(&read, &[vec![25.0, 0.0]], TraceType::Serial, 1_000_000, 3)?;
    assert_eq!(25, results[0].hits[0].rowid);

    let all = file.nnsearch(&read, &[vec![0.0, 0.0]], TraceType::Serial, 1_000_000, 200)?;
    let mut rowids: Vec<u32> = all[0].hits.iter().map(|h| h.rowid).collect();
    let total = rowids.len();
    rowids.dedup();
    assert_eq!(total, rowids.len(), "no duplicate rowids");
    assert_eq!(51, total);

    Ok(())
}

#[test]
fn deletions_during_merge_mask_the_merge_side() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Engine::new();

    let file = Config::new(folder.path(), 2)
        .merge_count_threshold(1_000_000)
        .open(&engine)?;

    let tx = engine.begin_read_write();
    for i in 0..20u32 {
        file.insert(&tx, i, &[i as f32, 0.0])?;
    }
    tx.commit();

    file.open_for_merge()?;

    // the row lives on the merge side; the deletion lands as an
    // executor-side tombstone and must mask it immediately
    let tx = engine.begin_read_write();
    file.expunge(&tx, 7)?;
    tx.commit();

    let read = engine.begin_no_version();
    let results = file.nnsearch(&read, &[vec![7.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_ne!(7, results[0].hits[0].rowid);

    let merge_tx = engine.begin_read_write();
    file.merge(&merge_tx, &kd_index::AbortSignal::default())?;
    file.close_for_merge()?;
    merge_tx.commit();

    // after the merge the tombstone still applies to the main index
    let results = file.nnsearch(&read, &[vec![7.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_ne!(7, results[0].hits[0].rowid);

    Ok(())
}

#[test]
fn cancelled_merge_leaves_the_store_consistent() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Engine::new();

    let file = Config::new(folder.path(), 2)
        .merge_count_threshold(1_000_000)
        .open(&engine)?;

    let tx = engine.begin_read_write();
    for i in 0..30u32 {
        file.insert(&tx, i, &[i as f32, 0.0])?;
    }
    tx.commit();

    file.open_for_merge()?;

    let signal = kd_index::AbortSignal::default();
    signal.send();

    let merge_tx = engine.begin_read_write();
    let result = file.merge(&merge_tx, &signal);
    assert!(matches!(result, Err(kd_index::Error::Cancelled)));
    merge_tx.commit();

    // the merge-in-progress flag stays set, so the merge side is still
    // searched: nothing was merged, nothing was lost
    let read = engine.begin_no_version();
    let results = file.nnsearch(&read, &[vec![15.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_eq!(15, results[0].hits[0].rowid);

    let tx = engine.begin_no_version();
    file.verify(&tx)?;

    // re-opening resumes the same merge side and completes
    file.open_for_merge()?;
    let merge_tx = engine.begin_read_write();
    file.merge(&merge_tx, &kd_index::AbortSignal::default())?;
    file.close_for_merge()?;
    merge_tx.commit();

    assert_eq!(30, file.master_count()?);
    assert_eq!(0, file.merge_side_count()?);

    let results = file.nnsearch(&read, &[vec![15.0, 0.0]], TraceType::Serial, 1_000_000, 1)?;
    assert_eq!(15, results[0].hits[0].rowid);

    Ok(())
}

#[test]
fn daemon_starts_and_stops_cleanly() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Engine::new();

    let _file = Config::new(folder.path(), 2).open(&engine)?;

    engine.start_merge_daemon();
    engine.start_merge_daemon(); // idempotent
    engine.shutdown();

    Ok(())
}
