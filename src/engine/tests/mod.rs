use super::*;
use tempfile::TempDir;

fn open(tmp: &TempDir, budget: usize) -> Engine {
    Engine::open(
        tmp.path(),
        EngineOptions {
            memtable_byte_budget: budget,
            wal_enabled: true,
        },
    )
    .unwrap()
}

#[test]
fn put_then_get_round_trips() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 1024 * 1024);

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"missing").unwrap(), None);
}

#[test]
fn last_writer_wins_within_memtable() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 1024 * 1024);

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn flush_boundary_creates_a_segment_and_stays_readable() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 64);

    for i in 0..10 {
        let key = format!("k{i:02}").into_bytes();
        let value = format!("v{i:02}").into_bytes();
        engine.put(key, value).unwrap();
    }
    engine.flush().unwrap();

    let sst_count = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            let name = name.to_string_lossy();
            name.starts_with("sstable_") && name.ends_with(".sst")
        })
        .count();
    assert!(sst_count >= 1);
    assert_eq!(engine.get(b"k07").unwrap(), Some(b"v07".to_vec()));
}

#[test]
fn durability_across_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open(&tmp, 1024 * 1024);
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        engine.close().unwrap();
    }

    let engine = open(&tmp, 1024 * 1024);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn reopen_after_flush_reads_from_segment_not_wal() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open(&tmp, 32);
        for i in 0..20 {
            engine
                .put(format!("k{i:02}").into_bytes(), format!("v{i:02}").into_bytes())
                .unwrap();
        }
        engine.close().unwrap();
    }

    let engine = open(&tmp, 1024 * 1024);
    for i in 0..20 {
        assert_eq!(
            engine.get(format!("k{i:02}").as_bytes()).unwrap(),
            Some(format!("v{i:02}").into_bytes())
        );
    }
}

#[test]
fn compaction_merges_shadows_and_leaves_one_segment() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 16);

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.put(b"a".to_vec(), b"3".to_vec()).unwrap();
    engine.flush().unwrap();

    let count_sst = || {
        std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                let name = e.as_ref().unwrap().file_name();
                let name = name.to_string_lossy();
                name.starts_with("sstable_") && name.ends_with(".sst")
            })
            .count()
    };
    assert!(count_sst() >= 2);

    engine.compact().unwrap();
    assert_eq!(count_sst(), 1);

    assert_eq!(engine.get(b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));

    let reopened = open(&tmp, 1024 * 1024);
    assert_eq!(reopened.get(b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(reopened.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn compact_foreground_flushes_unflushed_puts_before_merging() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 16);

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.put(b"a".to_vec(), b"3".to_vec()).unwrap();
    engine.flush().unwrap();

    // Unlike the test above, this key never goes through an explicit
    // `flush()` call — only `compact()` should pick it up.
    engine.put(b"c".to_vec(), b"4".to_vec()).unwrap();

    engine.compact().unwrap();

    let stats = engine.stats().unwrap();
    assert_eq!(stats.segment_count, 1);
    assert_eq!(stats.active_memtable_bytes, 0);

    assert_eq!(engine.get(b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(b"c").unwrap(), Some(b"4".to_vec()));

    let reopened = open(&tmp, 1024 * 1024);
    assert_eq!(reopened.get(b"c").unwrap(), Some(b"4".to_vec()));
}

#[test]
fn opening_with_a_zero_memtable_budget_is_a_bad_argument() {
    let tmp = TempDir::new().unwrap();
    let err = Engine::open(
        tmp.path(),
        EngineOptions {
            memtable_byte_budget: 0,
            wal_enabled: true,
        },
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::BadArgument(_)));
}

#[test]
fn compact_with_fewer_than_two_segments_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 1024 * 1024);
    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.compact().unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn empty_directory_opens_cleanly() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 1024 * 1024);
    assert_eq!(engine.get(b"anything").unwrap(), None);
}

#[test]
fn corrupt_segment_is_skipped_at_open_not_fatal() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open(&tmp, 1024 * 1024);
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.flush().unwrap();
    }

    // Plant a bogus segment file alongside the real one.
    std::fs::write(tmp.path().join("sstable_00000000_000000_000_999999.sst"), b"not a segment").unwrap();

    let engine = open(&tmp, 1024 * 1024);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn wal_disabled_loses_unflushed_data_on_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(
            tmp.path(),
            EngineOptions { memtable_byte_budget: 1024 * 1024, wal_enabled: false },
        )
        .unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        // Dropped without flush: no WAL, no segment — data is gone.
    }

    let engine = Engine::open(
        tmp.path(),
        EngineOptions { memtable_byte_budget: 1024 * 1024, wal_enabled: false },
    )
    .unwrap();
    assert_eq!(engine.get(b"a").unwrap(), None);
}

#[test]
fn stats_reflect_segments_and_active_memtable() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 1024 * 1024);
    let initial = engine.stats().unwrap();
    assert_eq!(initial.segment_count, 0);
    assert_eq!(initial.active_memtable_bytes, 0);

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    let after_put = engine.stats().unwrap();
    assert!(after_put.active_memtable_bytes > 0);

    engine.flush().unwrap();
    let after_flush = engine.stats().unwrap();
    assert_eq!(after_flush.segment_count, 1);
    assert_eq!(after_flush.active_memtable_bytes, 0);
    assert!(after_flush.total_segment_bytes > 0);
}

#[test]
fn concurrent_puts_from_multiple_threads_are_all_durable() {
    let tmp = TempDir::new().unwrap();
    let engine = open(&tmp, 4096);

    std::thread::scope(|scope| {
        for t in 0..4 {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..50 {
                    let key = format!("t{t}-k{i:03}").into_bytes();
                    let value = format!("t{t}-v{i:03}").into_bytes();
                    engine.put(key, value).unwrap();
                }
            });
        }
    });

    engine.flush().unwrap();
    for t in 0..4 {
        for i in 0..50 {
            let key = format!("t{t}-k{i:03}");
            let value = format!("t{t}-v{i:03}").into_bytes();
            assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(value));
        }
    }
}
