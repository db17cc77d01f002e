#![allow(missing_docs)]

use std::{
    fs::OpenOptions,
    io::Write,
    sync::mpsc,
    thread,
    time::Duration,
};

use obsarchive_core::{
    AcceptAll, Archive, ArchiveConfig, ArchiveError, Array, Compression, Container, GroupSchema,
    ReadPlan, SliceRequest, Values, lock_path,
};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn fast_config() -> ArchiveConfig {
    ArchiveConfig::default()
        .with_lock_timeout(Duration::from_millis(100))
        .with_lock_poll_interval(Duration::from_millis(5))
        .with_sync_on_close(false)
}

fn schema(compression: Compression) -> GroupSchema {
    GroupSchema::new()
        .column("a", [3])
        .column("b", [2])
        .column("c", Vec::new())
        .compression(compression)
}

fn row(v: f32) -> Values {
    let mut values = Values::new();
    values.insert("a".to_string(), Array::vector(vec![v, v + 0.1, v + 0.2]));
    values.insert("b".to_string(), Array::vector(vec![-v, v]));
    values.insert("c".to_string(), Array::scalar(v * 10.0));
    values
}

fn seed(path: &std::path::Path, compression: Compression, times: &[i64]) -> TestResult {
    let mut c = Container::create(path, true, &fast_config())?;
    c.build("/g", &schema(compression))?;
    for &t in times {
        c.append("/g", t, &row(t as f32), &AcceptAll)?;
    }
    c.close()?;
    Ok(())
}

#[test]
fn torn_tail_is_ignored_by_readers_and_truncated_by_writers() -> TestResult {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("a.oba");
    seed(&path, Compression::None, &[10, 20, 30])?;
    let clean_len = std::fs::metadata(&path)?.len();

    // A row header promising more payload than was written.
    let mut file = OpenOptions::new().append(true).open(&path)?;
    file.write_all(&[2, 200, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0, 40])?;
    drop(file);

    {
        let c = Container::open_read(&path, &fast_config())?;
        assert_eq!(c.dump_time("/g")?, vec![10, 20, 30]);
    }
    assert!(std::fs::metadata(&path)?.len() > clean_len);

    {
        let mut c = Container::open_write(&path, &fast_config())?;
        c.append("/g", 40, &row(40.0), &AcceptAll)?;
    }
    let mut c = Container::open_read(&path, &fast_config())?;
    assert_eq!(c.dump_time("/g")?, vec![10, 20, 30, 40]);
    let slice = c.slice("/g", &SliceRequest::new(["c"]).interval(40, 40))?;
    assert_eq!(slice.column("c").ok_or("c missing")?.values(), &[400.0]);
    Ok(())
}

#[test]
fn final_frame_with_bad_checksum_is_dropped() -> TestResult {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("a.oba");
    seed(&path, Compression::None, &[10, 20])?;

    let mut bytes = std::fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, &bytes)?;

    let c = Container::open_read(&path, &fast_config())?;
    assert_eq!(c.dump_time("/g")?, vec![10]);
    Ok(())
}

#[test]
fn read_plans_agree() -> TestResult {
    for compression in [Compression::None, Compression::Zstd { level: 1 }] {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("a.oba");
        // Rows 1 and 3 fall outside the window, so matches are scattered.
        seed(&path, compression, &[100, 900, 110, 950, 120, 130])?;
        let mut c = Container::open_read(&path, &fast_config())?;

        let window = |cols: &[&str]| SliceRequest::new(cols.to_vec()).interval(100, 130);
        let all = c.slice("/g", &window(&["a", "b", "c"]))?;
        assert_eq!(all.times, vec![100, 110, 120, 130]);
        assert!(matches!(
            ReadPlan::choose(3, &[0, 2, 4, 5]),
            ReadPlan::Gathered(_)
        ));

        for name in ["a", "b", "c"] {
            let single = c.slice("/g", &window(&[name]))?;
            assert_eq!(single.column(name), all.column(name), "{name} ({compression:?})");
        }

        let contiguous = c.slice("/g", &SliceRequest::new(["a", "b", "c"]).interval(120, 130))?;
        assert_eq!(
            contiguous.column("c").ok_or("c missing")?.values(),
            &[1200.0, 1300.0]
        );
    }
    Ok(())
}

fn expected(times: &[i64], name: &str) -> Vec<f32> {
    times
        .iter()
        .flat_map(|&t| row(t as f32)[name].values().to_vec())
        .collect()
}

#[test]
fn damaged_row_is_corrupt_under_every_plan() -> TestResult {
    for compression in [Compression::None, Compression::Zstd { level: 1 }] {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("a.oba");
        seed(&path, compression, &[10])?;

        let mut ends = Vec::new();
        for t in [20, 30] {
            let mut c = Container::open_write(&path, &fast_config())?;
            c.append("/g", t, &row(t as f32), &AcceptAll)?;
            c.close()?;
            ends.push(std::fs::metadata(&path)?.len());
        }

        // Last byte of the row written at t=20, which is not the final frame.
        let mut bytes = std::fs::read(&path)?;
        let target = ends[0] as usize - 1;
        bytes[target] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        let mut c = Container::open_read(&path, &fast_config())?;
        assert_eq!(c.dump_time("/g")?, vec![10, 20, 30]);
        for cols in [&["c"][..], &["a", "b"][..], &["a", "b", "c"][..]] {
            let result = c.slice("/g", &SliceRequest::new(cols.to_vec()).interval(10, 30));
            assert!(
                matches!(result, Err(ArchiveError::Corrupt { .. })),
                "{cols:?} ({compression:?}): {result:?}"
            );
        }
        assert!(matches!(
            c.dump("/g", "c"),
            Err(ArchiveError::Corrupt { .. })
        ));

        // The row after it still reads.
        let after = c.slice("/g", &SliceRequest::new(["c"]).interval(30, 30))?;
        assert_eq!(after.column("c").ok_or("c missing")?.values(), &[300.0]);
    }
    Ok(())
}

#[test]
fn interleaved_groups_read_back_under_every_plan() -> TestResult {
    for compression in [Compression::None, Compression::Zstd { level: 1 }] {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("a.oba");
        {
            let mut c = Container::create(&path, true, &fast_config())?;
            c.build("/a", &schema(compression).aux("h", [2]))?;
            c.build("/b", &schema(compression))?;
            c.append("/a", 100, &row(100.0), &AcceptAll)?;
            c.append("/b", 100, &row(100.0), &AcceptAll)?;
            c.write_aux("/a", "h", &Array::vector(vec![1.5, 2.5]))?;
            for (group, t) in [
                ("/a", 110),
                ("/b", 110),
                ("/a", 900),
                ("/b", 120),
                ("/a", 120),
                ("/b", 125),
                ("/a", 130),
            ] {
                c.append(group, t, &row(t as f32), &AcceptAll)?;
            }
            c.close()?;
        }

        let mut c = Container::open_read(&path, &fast_config())?;
        let all = ["a", "b", "c"];

        // Row ids 0, 1, 3, 4 of /a: scattered.
        let gathered = c.slice("/a", &SliceRequest::new(all).interval(100, 130))?;
        assert!(matches!(
            ReadPlan::choose(3, &[0, 1, 3, 4]),
            ReadPlan::Gathered(_)
        ));
        assert_eq!(gathered.times, vec![100, 110, 120, 130]);
        for name in all {
            assert_eq!(
                gathered.column(name).ok_or("column missing")?.values(),
                expected(&[100, 110, 120, 130], name).as_slice(),
                "{name} ({compression:?})"
            );
        }

        // Row ids 3 and 4 of /a are consecutive but a /b row sits between them.
        let contiguous = c.slice("/a", &SliceRequest::new(all).interval(120, 130))?;
        assert!(matches!(
            ReadPlan::choose(3, &[3, 4]),
            ReadPlan::Contiguous { first: 3, last: 4 }
        ));
        for name in all {
            assert_eq!(
                contiguous.column(name).ok_or("column missing")?.values(),
                expected(&[120, 130], name).as_slice()
            );
        }

        assert_eq!(
            c.dump("/a", "c")?.values(),
            &[1000.0, 1100.0, 9000.0, 1200.0, 1300.0]
        );
        let b_times = [100, 110, 120, 125];
        assert_eq!(c.dump_time("/b")?, b_times);
        for name in all {
            assert_eq!(c.dump("/b", name)?.values(), expected(&b_times, name).as_slice());
        }
        assert_eq!(c.dump("/a", "h")?.values(), &[1.5, 2.5]);
    }
    Ok(())
}

#[cfg(unix)]
#[test]
fn concurrent_write_opens_never_both_succeed() -> TestResult {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("a.oba");
    seed(&path, Compression::None, &[1])?;

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let writer_path = path.clone();
    let holder = thread::spawn(move || -> Result<(), ArchiveError> {
        let mut c = Container::open_write(&writer_path, &fast_config())?;
        held_tx.send(()).ok();
        release_rx.recv().ok();
        c.append("/g", 2, &Values::new(), &AcceptAll)?;
        c.close()
    });

    held_rx.recv()?;
    let err = Container::open_write(&path, &fast_config()).expect_err("lock is held");
    assert!(matches!(err, ArchiveError::LockTimeout { .. }));
    assert!(err.is_retryable());

    let err = Container::open_read(&path, &fast_config()).expect_err("shared lock blocked");
    assert!(matches!(err, ArchiveError::LockTimeout { .. }));

    let unlocked = fast_config().with_shared_read_lock(false);
    let peek = Container::open_read(&path, &unlocked)?;
    assert!(!peek.holds_lock());
    drop(peek);

    release_tx.send(())?;
    holder.join().map_err(|_| "writer thread panicked")??;

    let archive = Archive::with_config(&path, fast_config());
    assert_eq!(archive.dump_time("/g")?, vec![1, 2]);
    assert!(lock_path(&path).exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn readers_share_the_lock() -> TestResult {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("a.oba");
    seed(&path, Compression::None, &[1])?;

    let first = Container::open_read(&path, &fast_config())?;
    let second = Container::open_read(&path, &fast_config())?;
    assert!(first.holds_lock() && second.holds_lock());
    assert!(matches!(
        Container::open_write(&path, &fast_config()),
        Err(ArchiveError::LockTimeout { .. })
    ));
    Ok(())
}
