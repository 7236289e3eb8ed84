use cfmap::codec::Codec;
use cfmap::config::{AppConfig, MapOptions, MemoryStoreConfig};
use cfmap::error::CfmError;
use cfmap::map::{CollisionFreeMap, Combiner, SummingCombiner, Update, UpdateObserver};
use cfmap::registry::PluginRegistry;
use cfmap::storage::memory::MemoryStore;
use cfmap::storage::{SnapshotReader, Span, Transaction};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
struct RecordingObserver {
    updates: Mutex<Vec<Update<String, i64>>>,
    calls: Mutex<usize>,
}

impl UpdateObserver<String, i64> for RecordingObserver {
    fn updating_values(
        &self,
        _tx: &mut dyn Transaction,
        updates: Vec<Update<String, i64>>,
    ) -> Result<(), CfmError> {
        *self.calls.lock() += 1;
        self.updates.lock().extend(updates);
        Ok(())
    }
}

fn word_counts(
    store: &MemoryStore,
    buckets: i64,
    buffer_size: Option<u64>,
    observer: Option<Arc<RecordingObserver>>,
) -> Arc<CollisionFreeMap<String, i64>> {
    let mut options = MapOptions::new::<String, i64>("wc", "sum", buckets).expect("options");
    if let Some(size) = buffer_size {
        options = options.with_buffer_size(size).expect("buffer size");
    }
    let observer = observer.map(|o| o as Arc<dyn UpdateObserver<String, i64>>);
    let map = Arc::new(
        CollisionFreeMap::new(options, Arc::new(SummingCombiner), observer).expect("map"),
    );
    map.register(store);
    map
}

fn add(store: &MemoryStore, map: &CollisionFreeMap<String, i64>, key: &str, value: i64) {
    let key = key.to_string();
    store
        .run_in_transaction(|tx| map.update(tx, [(&key, &value)]))
        .expect("update");
}

fn get(store: &MemoryStore, map: &CollisionFreeMap<String, i64>, key: &str) -> Option<i64> {
    map.get(&store.begin(), &key.to_string()).expect("get")
}

fn pending_cells(store: &MemoryStore) -> usize {
    store.cells_with_row_prefix(b"wc:u:").len()
}

#[test]
fn two_transactions_summing_into_one_key() {
    let store = MemoryStore::new(MemoryStoreConfig::no_retry());
    let map = word_counts(&store, 4, None, None);

    let key = "a".to_string();
    let mut t1 = store.begin();
    let mut t2 = store.begin();
    map.update(&mut t1, [(&key, &1)]).expect("t1");
    map.update(&mut t2, [(&key, &2)]).expect("t2");
    store.commit(t1).expect("t1 commits");
    store.commit(t2).expect("t2 commits without conflict");

    assert_eq!(get(&store, &map, "a"), Some(3));
    store.process_notifications().expect("drain");
    assert_eq!(get(&store, &map, "a"), Some(3));
    assert_eq!(pending_cells(&store), 0);
    assert_eq!(store.pending_notifications(), 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Tally {
    Add(i64),
    Remove,
}

struct TallyCombiner;

impl Combiner<String, Tally> for TallyCombiner {
    fn combine(&self, _key: &String, values: Vec<Tally>) -> Result<Option<Tally>, CfmError> {
        let mut total = 0;
        for value in values {
            match value {
                Tally::Add(n) => total += n,
                Tally::Remove => return Ok(None),
            }
        }
        Ok(Some(Tally::Add(total)))
    }
}

#[test]
fn deletion_update_removes_the_key_after_the_next_drain() {
    let store = MemoryStore::default();
    let options = MapOptions::new::<String, Tally>("tally", "tally", 4).expect("options");
    let map = Arc::new(
        CollisionFreeMap::<String, Tally>::new(options, Arc::new(TallyCombiner), None).expect("map"),
    );
    map.register(&store);
    let key = "a".to_string();

    for value in [Tally::Add(1), Tally::Add(2)] {
        store
            .run_in_transaction(|tx| map.update(tx, [(&key, &value)]))
            .expect("add");
    }
    store.process_notifications().expect("drain");
    assert_eq!(map.get(&store.begin(), &key).expect("get"), Some(Tally::Add(3)));

    store
        .run_in_transaction(|tx| map.update(tx, [(&key, &Tally::Remove)]))
        .expect("remove");
    assert_eq!(map.get(&store.begin(), &key).expect("get"), None);
    store.process_notifications().expect("drain");
    assert_eq!(map.get(&store.begin(), &key).expect("get"), None);
    assert!(store.cells_with_row_prefix(b"tally:").is_empty());
}

fn tally_map(store: &MemoryStore, buffer_size: u64) -> Arc<CollisionFreeMap<String, Tally>> {
    let options = MapOptions::new::<String, Tally>("tally", "tally", 1)
        .expect("options")
        .with_buffer_size(buffer_size)
        .expect("buffer size");
    let map = Arc::new(
        CollisionFreeMap::<String, Tally>::new(options, Arc::new(TallyCombiner), None).expect("map"),
    );
    map.register(store);
    map
}

fn bounded_store() -> MemoryStore {
    MemoryStore::new(MemoryStoreConfig {
        max_notification_rounds: 50,
        ..MemoryStoreConfig::default()
    })
}

#[test]
fn repeated_deletions_drain_with_a_one_byte_buffer() {
    let store = bounded_store();
    let map = tally_map(&store, 1);
    let key = "a".to_string();
    for _ in 0..3 {
        store
            .run_in_transaction(|tx| map.update(tx, [(&key, &Tally::Remove)]))
            .expect("remove");
    }

    store.process_notifications().expect("drain terminates");
    assert!(store.cells_with_row_prefix(b"tally:").is_empty());
    assert_eq!(store.pending_notifications(), 0);
    assert_eq!(map.get(&store.begin(), &key).expect("get"), None);
}

#[test]
fn deletion_combiner_converges_with_a_small_buffer() {
    let store = bounded_store();
    let map = tally_map(&store, 2);
    let keys: Vec<String> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
    for round in 0..6i64 {
        for key in &keys {
            store
                .run_in_transaction(|tx| map.update(tx, [(key, &Tally::Add(round))]))
                .expect("add");
        }
    }
    for _ in 0..4 {
        store
            .run_in_transaction(|tx| map.update(tx, [(&keys[1], &Tally::Remove)]))
            .expect("remove");
    }

    store.process_notifications().expect("drain terminates");
    assert!(store.cells_with_row_prefix(b"tally:u:").is_empty());
    assert_eq!(store.pending_notifications(), 0);
    let snapshot = store.begin();
    assert_eq!(map.get(&snapshot, &keys[0]).expect("get"), Some(Tally::Add(15)));
    assert_eq!(map.get(&snapshot, &keys[2]).expect("get"), Some(Tally::Add(15)));
}

#[test]
fn tombstoned_key_leaves_no_authoritative_entry() {
    let store = MemoryStore::default();
    let observer = Arc::new(RecordingObserver::default());
    let map = word_counts(&store, 2, None, Some(observer.clone()));
    add(&store, &map, "x", 5);
    add(&store, &map, "x", -5);
    store.process_notifications().expect("drain");

    assert_eq!(get(&store, &map, "x"), None);
    assert!(store.cells_with_row_prefix(b"wc:").is_empty());
    assert_eq!(*observer.calls.lock(), 0);
}

#[test]
fn draining_an_empty_bucket_changes_nothing() {
    let store = MemoryStore::default();
    let observer = Arc::new(RecordingObserver::default());
    let map = word_counts(&store, 1, None, Some(observer.clone()));
    add(&store, &map, "k", 1);
    store.process_notifications().expect("drain");
    let cells = store.cells_with_row_prefix(b"wc:");

    let mut tx = store.begin();
    let summary = map.process_bucket(&mut tx, 0).expect("pass");
    assert_eq!(summary.cells_read, 0);
    assert!(tx.is_read_only());
    store.commit(tx).expect("commit");
    assert_eq!(store.cells_with_row_prefix(b"wc:"), cells);
    assert_eq!(*observer.calls.lock(), 1);
}

#[test]
fn reads_agree_before_and_after_processing() {
    let store = MemoryStore::default();
    let map = word_counts(&store, 3, None, None);
    for (key, value) in [("a", 1), ("b", 2), ("a", 3), ("c", -1), ("b", 4)] {
        add(&store, &map, key, value);
    }
    let before: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|k| get(&store, &map, k))
        .collect();
    store.process_notifications().expect("drain");
    let after: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|k| get(&store, &map, k))
        .collect();
    assert_eq!(before, vec![Some(4), Some(6), Some(-1), None]);
    assert_eq!(before, after);
}

#[test]
fn small_buffer_never_exposes_a_partial_merge() {
    let store = MemoryStore::default();
    let observer = Arc::new(RecordingObserver::default());
    let map = word_counts(&store, 1, Some(8), Some(observer.clone()));
    for _ in 0..40 {
        add(&store, &map, "k", 1);
    }

    let stats = store.process_notifications().expect("drain");
    assert!(stats.delivered > 1, "one pass cannot hold 40 updates");
    assert_eq!(get(&store, &map, "k"), Some(40));
    assert_eq!(pending_cells(&store), 0);

    let updates = observer.updates.lock();
    assert_eq!(
        *updates,
        vec![Update {
            key: "k".to_string(),
            old_value: None,
            new_value: Some(40),
        }]
    );
}

#[test]
fn multi_key_bucket_with_small_buffer_converges() {
    let store = MemoryStore::default();
    let map = word_counts(&store, 2, Some(16), None);
    let mut expected: BTreeMap<String, i64> = BTreeMap::new();
    for i in 0..200i64 {
        let key = format!("w{}", i % 13);
        add(&store, &map, &key, i);
        *expected.entry(key).or_default() += i;
    }
    store.process_notifications().expect("drain");
    assert_eq!(pending_cells(&store), 0);
    for (key, total) in &expected {
        assert_eq!(get(&store, &map, key), Some(*total), "key {key}");
    }
}

#[test]
fn get_scans_only_the_requested_key() {
    let store = MemoryStore::default();
    let map = word_counts(&store, 1, None, None);
    add(&store, &map, "ab", 1);
    add(&store, &map, "a", 10);
    add(&store, &map, "abc", 100);
    assert_eq!(get(&store, &map, "a"), Some(10));

    let snapshot = store.begin();
    let all_pending = snapshot
        .scan(&Span::family_prefix(map.rows().update_row(0), b"upd:".to_vec()))
        .expect("scan")
        .count();
    assert_eq!(all_pending, 3);
}

#[test]
fn json_codec_map_survives_a_restart() {
    let store = MemoryStore::default();
    let options = MapOptions::new::<String, i64>("js", "sum", 5)
        .expect("options")
        .with_codecs(Codec::Json, Codec::Json);
    store
        .update_app_config(|app| CollisionFreeMap::<String, i64>::configure(&options, app))
        .expect("configure");

    let registry = PluginRegistry::<String, i64>::new().with_combiner("sum", || SummingCombiner);
    let app: AppConfig = store.app_config();
    let map = Arc::new(
        CollisionFreeMap::<String, i64>::from_app_config("js", &app, &registry).expect("load"),
    );
    map.register(&store);
    let key = "user:1".to_string();
    store
        .run_in_transaction(|tx| map.update(tx, [(&key, &7)]))
        .expect("update");
    store.process_notifications().expect("drain");

    let reloaded =
        CollisionFreeMap::<String, i64>::from_app_config("js", &store.app_config(), &registry)
            .expect("reload");
    assert_eq!(reloaded.get(&store.begin(), &key).expect("get"), Some(7));
    let bucket = reloaded.bucket_of(&key).expect("bucket");
    let row = format!("js:d:{bucket}:\"user:1\"").into_bytes();
    assert_eq!(store.cells_with_row_prefix(&row).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_never_conflict() {
    let store = Arc::new(MemoryStore::new(MemoryStoreConfig::no_retry()));
    let map = word_counts(&store, 4, Some(64), None);

    let mut tasks = tokio::task::JoinSet::new();
    for producer in 0..8i64 {
        let store = Arc::clone(&store);
        let map = Arc::clone(&map);
        tasks.spawn_blocking(move || {
            for i in 0..50i64 {
                let key = format!("hot{}", i % 3);
                let value = producer * 1000 + i;
                let mut tx = store.begin();
                map.update(&mut tx, [(&key, &value)]).expect("update");
                store.commit(tx).expect("producers never conflict");
            }
        });
    }
    let processor = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            for _ in 0..20 {
                store.process_notification_round().expect("round");
            }
        })
    };
    while let Some(joined) = tasks.join_next().await {
        joined.expect("producer task");
    }
    processor.await.expect("processor task");
    store.process_notifications().expect("final drain");

    let mut expected = [0i64; 3];
    for producer in 0..8i64 {
        for i in 0..50i64 {
            expected[(i % 3) as usize] += producer * 1000 + i;
        }
    }
    for (slot, total) in expected.iter().enumerate() {
        assert_eq!(get(&store, &map, &format!("hot{slot}")), Some(*total));
    }
    assert_eq!(pending_cells(&store), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn no_updates_are_lost(
        updates in proptest::collection::vec((0u8..6, -50i64..50), 0..60),
        buckets in 1i64..5,
        buffer_size in 1u64..40,
    ) {
        let store = MemoryStore::default();
        let map = word_counts(&store, buckets, Some(buffer_size), None);
        let mut expected: BTreeMap<String, i64> = BTreeMap::new();
        for chunk in updates.chunks(4) {
            let batch: Vec<(String, i64)> =
                chunk.iter().map(|(k, v)| (format!("k{k}"), *v)).collect();
            store
                .run_in_transaction(|tx| map.update(tx, batch.iter().map(|(k, v)| (k, v))))
                .expect("update");
            for (k, v) in batch {
                *expected.entry(k).or_default() += v;
            }
        }
        store.process_notifications().expect("drain");
        prop_assert_eq!(pending_cells(&store), 0);
        for (key, total) in &expected {
            let want = if *total == 0 { None } else { Some(*total) };
            prop_assert_eq!(get(&store, &map, key), want);
        }
    }
}
