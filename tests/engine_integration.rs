//! Whole-file integration scenarios that need a real `Engine` over a real
//! temp file, rather than the per-module unit tests in `src/*.rs` (spec.md 8
//! "Concurrent readers, one writer" and "Eviction under pressure").

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pmt::{Engine, EngineConfig, NodeKind};
use tempfile::NamedTempFile;

fn temp_config() -> EngineConfig {
    let f = NamedTempFile::new().unwrap();
    let path = f.path().to_path_buf();
    drop(f);
    std::fs::remove_file(&path).ok();
    EngineConfig::new(path)
}

/// Eight reader threads repeatedly resolve a stable set of already-flushed
/// children while one writer thread appends new siblings and flushes. No
/// reader should ever see a torn or missing record for a name it already
/// knows exists, and newly appended names must become visible once a flush
/// for them has completed.
#[test]
fn concurrent_readers_with_one_writer_see_consistent_state() {
    let cfg = temp_config();
    let path = cfg.file_path.clone();
    let engine = Arc::new(Engine::open(cfg).unwrap());
    let root = engine.root();

    for i in 0..20 {
        engine
            .append_child(root, format!("stable-{i:03}"), NodeKind::Device, vec![])
            .unwrap();
    }
    engine.flush().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader_errors = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let stop = stop.clone();
            let reader_errors = reader_errors.clone();
            thread::spawn(move || {
                let mut iterations = 0;
                while !stop.load(Ordering::Relaxed) && iterations < 2000 {
                    for i in 0..20 {
                        let name = format!("stable-{i:03}");
                        match engine.get_child(root, &name) {
                            Ok(Some(_)) => {}
                            Ok(None) => reader_errors.fetch_add(1, Ordering::Relaxed),
                            Err(_) => reader_errors.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                    iterations += 1;
                }
            })
        })
        .collect();

    let writer_engine = engine.clone();
    let writer = thread::spawn(move || {
        for i in 0..30 {
            writer_engine
                .append_child(root, format!("new-{i:03}"), NodeKind::Device, vec![])
                .unwrap();
            writer_engine.flush().unwrap();
        }
    });

    writer.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(
        reader_errors.load(Ordering::Relaxed),
        0,
        "a reader failed to resolve an already-stable child while the writer ran"
    );

    for i in 0..30 {
        let name = format!("new-{i:03}");
        assert!(
            engine.get_child(root, &name).unwrap().is_some(),
            "{name} should be visible after the writer's flush completed"
        );
    }

    let _ = std::fs::remove_file(&path);
}

/// With a small node cache capacity and a tree much larger than it, randomly
/// touching nodes must never push resident_count over capacity, and every
/// node just touched must be resolvable at that instant (it wouldn't be if
/// eviction had raced it out from under the read that just materialized it).
#[test]
fn eviction_keeps_resident_count_bounded_under_random_access() {
    let cfg = temp_config().with_node_cache_capacity(50);
    let path = cfg.file_path.clone();
    let engine = Engine::open(cfg).unwrap();
    let root = engine.root();

    const TOTAL: usize = 600;
    for i in 0..TOTAL {
        engine
            .append_child(root, format!("node-{i:04}"), NodeKind::Device, vec![])
            .unwrap();
    }
    engine.flush().unwrap();

    // A cheap deterministic "random" walk over the id space, good enough to
    // exercise scattered access without pulling in a dependency.
    let mut cursor: usize = 7;
    for _ in 0..1000 {
        cursor = (cursor * 2654435761 + 1) % TOTAL;
        let name = format!("node-{cursor:04}");
        let found = engine.get_child(root, &name).unwrap();
        assert!(found.is_some(), "{name} must resolve at its access instant");
        assert!(
            engine.resident_count() <= 50 + 1,
            "resident_count {} exceeded capacity",
            engine.resident_count()
        );
    }

    let _ = std::fs::remove_file(&path);
}
