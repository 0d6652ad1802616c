//! End-to-end tests for the database surface

use bytes::Bytes;
use futures::future::join_all;
use futures::StreamExt;
use ouroboros_level::{
    BatchOp, Database, DbState, IteratorOptions, LevelError, OpenOptions, Payload, ReadOptions,
    Status, WriteBatch, WriteOptions,
};
use tempfile::TempDir;

async fn open_db(dir: &TempDir) -> Database {
    let db = Database::new(dir.path().join("db")).unwrap();
    db.open(OpenOptions::default()).await.unwrap();
    db
}

fn text(payload: &Payload) -> String {
    payload.to_string()
}

async fn collect_keys(db: &Database, options: IteratorOptions) -> Vec<String> {
    let mut iter = db.iterator(options).unwrap();
    let mut keys = Vec::new();
    while let Some((key, _)) = iter.next().await.unwrap() {
        keys.push(text(&key));
    }
    iter.end().unwrap();
    keys
}

#[tokio::test]
async fn test_put_then_get() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.put("k", "v", WriteOptions::default()).await.unwrap();
    let value = db.get("k", ReadOptions::default()).await.unwrap();
    assert_eq!(value, Payload::Buffer(Bytes::from_static(b"v")));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_del_then_get_is_not_found() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.put("k", "v", WriteOptions::default()).await.unwrap();
    db.del("k", WriteOptions::sync()).await.unwrap();

    let result = db.get("k", ReadOptions::default()).await;
    assert_eq!(result, Err(LevelError::NotFound));
    assert_eq!(Status::of(&result).code(), 1);
    assert!(!db.exists("k").await.unwrap());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_put_then_del_leaves_key_absent() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.batch(
        vec![BatchOp::put("a", "1"), BatchOp::delete("a"), BatchOp::put("b", "2")],
        WriteOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(db.get("a", ReadOptions::default()).await, Err(LevelError::NotFound));
    assert_eq!(db.get_buffer_sync("b").unwrap(), Bytes::from_static(b"2"));

    let mut chained = WriteBatch::new();
    chained.put("c", "3").del("b");
    db.write(chained, WriteOptions::sync()).await.unwrap();
    assert!(!db.is_exists_sync("b").unwrap());
    assert!(db.is_exists_sync("c").unwrap());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_puts_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    const N: usize = 200;

    let puts: Vec<_> = (0..N)
        .map(|i| db.put(format!("key{:04}", i), format!("value{}", i), WriteOptions::default()))
        .collect();
    for result in join_all(puts).await {
        result.unwrap();
    }

    let gets: Vec<_> = (0..N)
        .map(|i| db.get(format!("key{:04}", i), ReadOptions::as_text()))
        .collect();
    for (i, result) in join_all(gets).await.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Payload::Text(format!("value{}", i)));
    }

    assert_eq!(db.get_property("ouroboros.num-entries"), N.to_string());
    assert_eq!(db.pinned_buffers(), 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_multi_get_reports_per_key() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    db.put("c", "3", WriteOptions::default()).await.unwrap();

    let results = db
        .multi_get(["a", "b", "c"], ReadOptions::as_text())
        .await
        .unwrap();
    assert_eq!(
        results,
        vec![
            Ok(Some(Payload::Text("1".to_string()))),
            Ok(None),
            Ok(Some(Payload::Text("3".to_string()))),
        ]
    );

    let sync_results = db.multi_get_sync(vec!["c"], ReadOptions::default()).unwrap();
    assert_eq!(sync_results, vec![Ok(Some(Payload::Buffer(Bytes::from_static(b"3"))))]);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_half_open_range_forward_and_reverse() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    for i in 0..7 {
        db.put(format!("k{}", i), format!("v{}", i), WriteOptions::default())
            .await
            .unwrap();
    }

    let forward = collect_keys(&db, IteratorOptions::new().gte("k2").lt("k5")).await;
    assert_eq!(forward, ["k2", "k3", "k4"]);

    let reverse = collect_keys(&db, IteratorOptions::new().gte("k2").lt("k5").reverse(true)).await;
    assert_eq!(reverse, ["k4", "k3", "k2"]);

    let limited = collect_keys(&db, IteratorOptions::new().gt("k0").limit(2)).await;
    assert_eq!(limited, ["k1", "k2"]);

    let empty = collect_keys(&db, IteratorOptions::new().gt("k3").lt("k3")).await;
    assert!(empty.is_empty());

    assert_eq!(db.live_iterators(), 0);
    assert_eq!(db.live_snapshots(), 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_iterator_values_and_seek() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    for key in ["a", "b", "c", "d"] {
        db.put(key, key.to_uppercase(), WriteOptions::default()).await.unwrap();
    }

    let mut iter = db.iterator(IteratorOptions::new().lte("c").as_text()).unwrap();
    let (key, value) = iter.next().await.unwrap().unwrap();
    assert_eq!(key, Payload::Text("a".to_string()));
    assert_eq!(value, Payload::Text("A".to_string()));

    iter.seek("c");
    let (key, _) = iter.next().await.unwrap().unwrap();
    assert_eq!(text(&key), "c");
    assert_eq!(iter.next().await.unwrap(), None);
    assert!(!iter.is_valid());

    // Ended iterators stay ended
    iter.seek("a");
    assert_eq!(iter.next().await.unwrap(), None);
    iter.end().unwrap();
    iter.end().unwrap();

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_iterator_stream() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    for i in 0..5 {
        db.put(format!("s{}", i), "x", WriteOptions::default()).await.unwrap();
    }

    let entries: Vec<_> = db
        .iterator(IteratorOptions::new().gte("s1"))
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(Result::is_ok));

    assert_eq!(db.live_iterators(), 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_iterator_sees_its_snapshot() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    let mut iter = db.iterator(IteratorOptions::new()).unwrap();
    db.put("b", "2", WriteOptions::default()).await.unwrap();
    db.del("a", WriteOptions::default()).await.unwrap();

    let (key, _) = iter.next().await.unwrap().unwrap();
    assert_eq!(text(&key), "a");
    assert_eq!(iter.next().await.unwrap(), None);
    drop(iter);

    assert_eq!(collect_keys(&db, IteratorOptions::new()).await, ["b"]);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_close_with_pending_next() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    for i in 0..100 {
        db.put(format!("k{:03}", i), "v", WriteOptions::default()).await.unwrap();
    }

    let mut iter = db.iterator(IteratorOptions::new()).unwrap();
    let (pending, closed) = tokio::join!(iter.next(), db.close());
    closed.unwrap();
    // The in-flight read either finished or observed the close
    assert!(pending.is_ok());

    assert_eq!(db.state(), DbState::Closed);
    assert_eq!(iter.next().await.unwrap(), None);
    assert_eq!(iter.next().await.unwrap(), None);
    assert!(!iter.is_valid());
    iter.end().unwrap();

    assert_eq!(db.live_iterators(), 0);
    assert_eq!(db.live_snapshots(), 0);
}

#[tokio::test]
async fn test_operations_after_close_are_not_opened() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.close().await.unwrap();

    assert_eq!(db.put("k", "v", WriteOptions::default()).await, Err(LevelError::NotOpened));
    assert_eq!(db.approximate_size("a", "z").await, Err(LevelError::NotOpened));
    assert_eq!(db.release_snapshot(ouroboros_level::SnapshotId(1)), Err(LevelError::NotOpened));
    assert_eq!(db.get_property("ouroboros.stats"), "");
    assert_eq!(LevelError::NotOpened.status().code(), 6);
}

#[tokio::test]
async fn test_approximate_size_is_monotone() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    assert_eq!(db.approximate_size("a", "a").await.unwrap(), 0);
    assert_eq!(db.approximate_size("a", "z").await.unwrap(), 0);

    let mut last = 0;
    for i in 0..50 {
        db.put(format!("m{:02}", i), vec![b'x'; 32], WriteOptions::default())
            .await
            .unwrap();
        let size = db.approximate_size("m", "n").await.unwrap();
        assert!(size >= last, "size shrank from {} to {}", last, size);
        last = size;
    }
    assert!(last > 0);
    assert_eq!(db.approximate_size_sync("n", "z").unwrap(), 0);

    let err = db.approximate_size("z", "a").await.unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_double_snapshot_release() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    let snapshot = db.snapshot().unwrap();
    db.put("a", "2", WriteOptions::default()).await.unwrap();

    let old = db.get("a", ReadOptions::at(snapshot)).await.unwrap();
    assert_eq!(old.as_bytes(), b"1");
    let new = db.get("a", ReadOptions::default()).await.unwrap();
    assert_eq!(new.as_bytes(), b"2");

    db.release_snapshot(snapshot).unwrap();
    let err = db.release_snapshot(snapshot).unwrap_err();
    assert!(matches!(err, LevelError::InvalidArgument(_)));

    assert_eq!(db.live_snapshots(), 0);
    assert_eq!(db.get_property("ouroboros.snapshots"), "0");
    assert!(matches!(
        db.get("a", ReadOptions::at(snapshot)).await,
        Err(LevelError::InvalidArgument(_))
    ));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_read_survives_release_before_it_runs() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.put("a", "old", WriteOptions::default()).await.unwrap();

    for round in 0..50 {
        let snapshot = db.snapshot().unwrap();
        db.put("a", format!("new-{}", round), WriteOptions::default()).await.unwrap();

        let read = db.get("a", ReadOptions::at(snapshot));
        let many = db.multi_get(["a", "missing"], ReadOptions::at(snapshot));
        db.release_snapshot(snapshot).unwrap();

        let expected = if round == 0 { "old".to_string() } else { format!("new-{}", round - 1) };
        assert_eq!(text(&read.await.unwrap()), expected);
        let many = many.await.unwrap();
        assert_eq!(text(many[0].as_ref().unwrap().as_ref().unwrap()), expected);
        assert_eq!(many[1], Ok(None));

        // The caller's hold is gone even though the reads had not finished
        assert!(matches!(
            db.get("a", ReadOptions::at(snapshot)).await,
            Err(LevelError::InvalidArgument(_))
        ));
    }

    assert_eq!(db.live_snapshots(), 0);
    assert_eq!(db.get_property("ouroboros.snapshots"), "0");

    let snapshot = db.snapshot().unwrap();
    assert_eq!(text(&db.get_sync("a", ReadOptions::at(snapshot)).unwrap()), "new-49");
    db.release_snapshot(snapshot).unwrap();
    assert_eq!(db.live_snapshots(), 0);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_shared_snapshot_outlives_release() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    let snapshot = db.snapshot().unwrap();
    let mut first = db.iterator(IteratorOptions::new().snapshot(snapshot)).unwrap();
    let mut second = db.iterator(IteratorOptions::new().snapshot(snapshot)).unwrap();
    assert_eq!(first.snapshot(), second.snapshot());
    db.put("a", "2", WriteOptions::default()).await.unwrap();

    db.release_snapshot(snapshot).unwrap();
    assert_eq!(db.live_snapshots(), 1);

    let (_, value) = first.next().await.unwrap().unwrap();
    assert_eq!(value.as_bytes(), b"1");
    first.end().unwrap();
    assert_eq!(db.live_snapshots(), 1);

    let (_, value) = second.next().await.unwrap().unwrap();
    assert_eq!(value.as_bytes(), b"1");
    second.end().unwrap();
    assert_eq!(db.live_snapshots(), 0);
    assert_eq!(db.get_property("ouroboros.snapshots"), "0");

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_release_unknown_iterator() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let iter = db.iterator(IteratorOptions::new()).unwrap();
    let id = iter.id();
    db.release_iterator(id).unwrap();
    assert!(matches!(db.release_iterator(id), Err(LevelError::InvalidArgument(_))));

    // The handle notices the release was already done
    drop(iter);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.put("persist", "me", WriteOptions::sync()).await.unwrap();
    db.close().await.unwrap();

    db.open(OpenOptions::default().with_create_if_missing(false))
        .await
        .unwrap();
    assert_eq!(db.get_buffer_sync("persist").unwrap(), Bytes::from_static(b"me"));
    db.close().await.unwrap();

    let err = db
        .open(OpenOptions::default().with_error_if_exists(true))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);
    assert_eq!(db.state(), DbState::Unopened);
}

#[tokio::test]
async fn test_second_handle_on_same_location() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let other = Database::new(dir.path().join("db")).unwrap();
    let err = other.open(OpenOptions::default()).await.unwrap_err();
    assert_eq!(err.status(), Status::IOError);

    db.close().await.unwrap();
    other.open(OpenOptions::default()).await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn test_open_from_json_options() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path().join("db")).unwrap();
    let options = OpenOptions::from_json(r#"{"compression": false, "write_buffer_size": 1024}"#).unwrap();
    db.open(options).await.unwrap();

    for i in 0..100 {
        db.put(format!("k{:03}", i), vec![b'v'; 64], WriteOptions::default())
            .await
            .unwrap();
    }
    let options_json = db.get_property("ouroboros.options");
    assert!(options_json.contains("\"write_buffer_size\":1024"));
    assert_eq!(db.get_property("no.such.property"), "");

    db.close().await.unwrap();
}
