//! End-to-end flows through the library: walk, live events, queries,
//! and a persistence round trip with reconciliation.

use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ffind_index::query::QueryRequest;
use ffind_index::{indexer, run_query, EntryStore, EventLoop, PersistentStore, RootSet, Watcher};

fn query_lines(store: &Mutex<EntryStore>, roots: &RootSet, request: &QueryRequest) -> Vec<String> {
    let mut out = Vec::new();
    run_query(request, store, roots, &mut out);
    let mut lines: Vec<String> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    lines.sort();
    lines
}

#[test]
fn index_query_by_name_and_content() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("hello.txt"), b"hello world\n").unwrap();

    let roots = RootSet::resolve(&[tmp.path().to_path_buf()]).unwrap();
    let store = Mutex::new(EntryStore::new());
    indexer::walk_roots(&mut store.lock().unwrap(), None, &roots, false);

    let root = roots.as_slice()[0].clone();
    let by_name = QueryRequest {
        name_pat: "hello.*".to_string(),
        ..QueryRequest::default()
    };
    assert_eq!(
        query_lines(&store, &roots, &by_name),
        vec![format!("{root}hello.txt")]
    );

    let by_content = QueryRequest {
        content_pat: "hello".to_string(),
        ..QueryRequest::default()
    };
    assert_eq!(
        query_lines(&store, &roots, &by_content),
        vec![format!("{root}hello.txt:1:hello world")]
    );
}

#[test]
fn content_context_produces_two_separated_ranges() {
    let tmp = tempfile::tempdir().unwrap();
    let body = "needle one\npad\npad\npad\npad\npad\nneedle two\n";
    fs::write(tmp.path().join("doc.txt"), body).unwrap();

    let roots = RootSet::resolve(&[tmp.path().to_path_buf()]).unwrap();
    let store = Mutex::new(EntryStore::new());
    indexer::walk_roots(&mut store.lock().unwrap(), None, &roots, false);

    let request = QueryRequest {
        content_pat: "needle".to_string(),
        before_ctx: 1,
        after_ctx: 1,
        ..QueryRequest::default()
    };
    let mut out = Vec::new();
    run_query(&request, &store, &roots, &mut out);
    let text = String::from_utf8(out).unwrap();

    let root = &roots.as_slice()[0];
    let path = format!("{root}doc.txt");
    let expected = format!(
        "{path}:1:needle one\n{path}:2-pad\n--\n{path}:6-pad\n{path}:7:needle two\n"
    );
    assert_eq!(text, expected);
}

#[test]
fn rename_observed_live_then_queried_through_the_new_path() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("sub")).unwrap();
    fs::write(tmp.path().join("sub/x.txt"), b"x").unwrap();

    let roots = Arc::new(RootSet::resolve(&[tmp.path().to_path_buf()]).unwrap());
    let store = Arc::new(Mutex::new(EntryStore::new()));
    let mut watcher = Watcher::new().expect("inotify available");
    indexer::walk_roots(
        &mut store.lock().unwrap(),
        Some(&mut watcher),
        &roots,
        false,
    );

    let mut event_loop = EventLoop::new(
        Arc::clone(&store),
        Arc::clone(&roots),
        watcher,
        None,
        Arc::new(AtomicBool::new(false)),
    );

    fs::rename(tmp.path().join("sub"), tmp.path().join("sub2")).unwrap();

    let root = roots.as_slice()[0].clone();
    let moved = format!("{root}sub2/x.txt");
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let _ = event_loop.poll_once(Duration::from_millis(50));
        if store.lock().unwrap().contains(&moved) || Instant::now() > deadline {
            break;
        }
    }

    let request = QueryRequest {
        path_pat: "sub2/*".to_string(),
        ..QueryRequest::default()
    };
    assert_eq!(query_lines(&store, &roots, &request), vec![moved]);
}

#[test]
fn snapshot_restart_reconciles_offline_deletions() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..50 {
        fs::write(tmp.path().join(format!("f{i:03}.txt")), b"data").unwrap();
    }
    // The database lives outside the watched tree so its sidecar files
    // never show up in the index.
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("ffind.db");
    let roots = RootSet::resolve(&[tmp.path().to_path_buf()]).unwrap();

    // First run: index and flush.
    {
        let db = PersistentStore::open(&db_path).unwrap();
        db.save_roots(&roots);
        let store = Mutex::new(EntryStore::new());
        indexer::walk_roots(&mut store.lock().unwrap(), None, &roots, false);
        db.flush(&store);
    }

    // Offline: delete a tenth of the files while "the daemon is down".
    for i in 0..5 {
        fs::remove_file(tmp.path().join(format!("f{i:03}.txt"))).unwrap();
    }

    // Second run: load the snapshot, skip the walk, reconcile.
    let db = PersistentStore::open(&db_path).unwrap();
    let prior = db.load_roots();
    assert!(roots.matches(&prior), "roots must match to reuse snapshot");

    let store = Mutex::new(EntryStore::new());
    let loaded = db.load_entries(&mut store.lock().unwrap());
    assert_eq!(loaded, 50);

    let stats = indexer::reconcile(&mut store.lock().unwrap(), None, &roots);
    assert_eq!(stats.removed, 5);

    let request = QueryRequest {
        name_pat: "f*.txt".to_string(),
        ..QueryRequest::default()
    };
    assert_eq!(query_lines(&store, &roots, &request).len(), 45);
}

#[test]
fn overlapping_roots_do_not_duplicate_results() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("inner")).unwrap();
    fs::write(tmp.path().join("inner/x.txt"), b"x").unwrap();

    let roots =
        RootSet::resolve(&[tmp.path().to_path_buf(), tmp.path().join("inner")]).unwrap();
    let store = Mutex::new(EntryStore::new());
    indexer::walk_roots(&mut store.lock().unwrap(), None, &roots, false);

    let request = QueryRequest {
        name_pat: "x.txt".to_string(),
        ..QueryRequest::default()
    };
    let lines = query_lines(&store, &roots, &request);
    assert_eq!(lines.len(), 1, "one entry per path, not per root");
}
