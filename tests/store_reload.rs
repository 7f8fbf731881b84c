use kd_index::{Config, Engine, TraceType};
use test_log::test;

#[test]
fn batch_build_dump_reload_serial_search() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Engine::new();
        let file = Config::new(folder.path(), 2).open(&engine)?;
        file.set_batch_mode();

        let tx = engine.begin_read_write();
        file.insert(&tx, 1, &[0.0, 0.0])?;
        file.insert(&tx, 2, &[10.0, 0.0])?;
        file.insert(&tx, 3, &[0.0, 10.0])?;
        file.insert(&tx, 4, &[10.0, 10.0])?;
        file.close(&tx)?;
        tx.commit();

        assert_eq!(4, file.master_count()?);
        assert_eq!(0, file.executor_count()?);
    }

    // a fresh engine loads the main index from its dump
    let engine = Engine::new();
    let file = Config::new(folder.path(), 2).open(&engine)?;

    let tx = engine.begin_no_version();
    let results = file.nnsearch(&tx, &[vec![5.0, 5.0]], TraceType::Serial, 1_000, 1)?;

    // all four corners are tied at 50; the lowest rowid wins
    assert_eq!(1, results[0].hits[0].rowid);
    assert!((results[0].hits[0].distance_sq - 50.0).abs() < 1e-9);

    Ok(())
}

#[test]
fn reload_preserves_search_results() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;

    let queries: Vec<Vec<f32>> = (0..8).map(|i| vec![i as f32 * 3.0, 17.0 - i as f32]).collect();

    let before = {
        let engine = Engine::new();
        let file = Config::new(folder.path(), 2).open(&engine)?;
        file.set_batch_mode();

        let tx = engine.begin_read_write();
        for i in 0..300u32 {
            file.insert(&tx, i, &[(i * 13 % 101) as f32, (i * 7 % 89) as f32])?;
        }
        file.close(&tx)?;
        tx.commit();

        let tx = engine.begin_no_version();
        file.nnsearch(&tx, &queries, TraceType::Serial, 1_000_000, 5)?
    };

    let engine = Engine::new();
    let file = Config::new(folder.path(), 2).open(&engine)?;

    let tx = engine.begin_no_version();
    let after = file.nnsearch(&tx, &queries, TraceType::Serial, 1_000_000, 5)?;

    assert_eq!(before, after);
    Ok(())
}

#[test]
fn empty_store_reloads_to_empty() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Engine::new();
        let file = Config::new(folder.path(), 2).open(&engine)?;
        let tx = engine.begin_read_write();
        file.close(&tx)?;
    }

    let engine = Engine::new();
    let file = Config::new(folder.path(), 2).open(&engine)?;

    let tx = engine.begin_no_version();
    let results = file.nnsearch(&tx, &[vec![0.0, 0.0]], TraceType::Serial, 100, 5)?;
    assert!(results[0].hits.is_empty());

    Ok(())
}

#[test]
fn small_indices_are_rebuilt_from_their_files() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Engine::new();
        let file = Config::new(folder.path(), 2).open(&engine)?;

        let tx = engine.begin_read_write();
        for i in 0..20u32 {
            file.insert(&tx, i, &[i as f32, 0.0])?;
        }
        tx.commit();

        // never merged: the rows only live in the small file
        assert_eq!(0, file.master_count()?);
        assert_eq!(20, file.executor_count()?);
    }

    let engine = Engine::new();
    let file = Config::new(folder.path(), 2).open(&engine)?;

    let tx = engine.begin_no_version();
    let results = file.nnsearch(&tx, &[vec![7.2, 0.0]], TraceType::Serial, 10_000, 1)?;
    assert_eq!(7, results[0].hits[0].rowid);

    Ok(())
}

#[test]
fn truncated_dump_fails_with_corruption_error() -> kd_index::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Engine::new();
        let file = Config::new(folder.path(), 2).open(&engine)?;
        file.set_batch_mode();

        let tx = engine.begin_read_write();
        for i in 0..2_000u32 {
            file.insert(&tx, i, &[i as f32, (i % 13) as f32])?;
        }
        file.close(&tx)?;
    }

    // cut the last page off the dump
    let dump_path = folder.path().join("index");
    let len = std::fs::metadata(&dump_path)?.len();
    assert!(len > 4_096);
    let handle = std::fs::OpenOptions::new().write(true).open(&dump_path)?;
    handle.set_len(len - 4_096)?;
    drop(handle);

    let engine = Engine::new();
    let file = Config::new(folder.path(), 2).open(&engine)?;

    let tx = engine.begin_no_version();
    let result = file.nnsearch(&tx, &[vec![0.0, 0.0]], TraceType::Serial, 100, 1);

    match result {
        Err(e) => assert!(e.is_corruption(), "unexpected error: {e}"),
        Ok(_) => panic!("a truncated dump must not load"),
    }

    Ok(())
}
