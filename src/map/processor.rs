use crate::error::CfmError;
use crate::map::observer::Update;
use crate::map::rows::{MapRows, UPDATE_FAMILY_PREFIX, data_column};
use crate::map::CollisionFreeMap;
use crate::storage::{Column, Observer, Span, Transaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const MIN_CELLS_PER_PASS: usize = 2;

/// What one processing pass over a bucket did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub bucket: u32,
    pub cells_read: usize,
    pub bytes_read: u64,
    pub keys_merged: usize,
    pub values_changed: usize,
    /// The last key read had more pending cells than the buffer allowed.
    pub partially_read: bool,
    /// Pending cells were left behind and the bucket notified itself.
    pub renotified: bool,
}

impl<K, V> CollisionFreeMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Drains pending updates of `bucket` into authoritative values.
    ///
    /// Reads pending cells, deleting each one, until `buffer_size` serialized
    /// bytes have been read (never fewer than two cells). Keys whose pending
    /// cells were all read are merged with their current value and written
    /// back; a key cut off by the buffer limit is re-queued as a single
    /// combined update instead, so no authoritative value ever reflects part of
    /// a key's queue. When cells remain the bucket re-arms its own
    /// notification.
    pub fn process_bucket(
        &self,
        tx: &mut dyn Transaction,
        bucket: u32,
    ) -> Result<PassSummary, CfmError> {
        let update_row = self.rows.update_row(bucket);
        let budget = self.options.buffer_size();
        let mut summary = PassSummary {
            bucket,
            ..PassSummary::default()
        };

        let mut pending: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        let mut cells = tx.scan(&Span::family_prefix(update_row.clone(), UPDATE_FAMILY_PREFIX))?;
        // at least two cells, so re-queueing a cut-off key always shrinks its queue
        while summary.bytes_read < budget || summary.cells_read < MIN_CELLS_PER_PASS {
            let Some(cell) = cells.next() else {
                break;
            };
            let cell = cell?;
            let key = MapRows::key_from_update_column(&cell.column)?.to_vec();
            tx.delete(cell.row, cell.column)?;

            if !pending.contains_key(&key) {
                summary.bytes_read += key.len() as u64;
            }
            summary.bytes_read += cell.value.len() as u64;
            summary.cells_read += 1;
            pending.entry(key.clone()).or_default().push(cell.value);
            last_key = Some(key);
        }

        let mut partially_read = None;
        if let Some(next) = cells.next() {
            let next = next?;
            if last_key.as_deref() == Some(MapRows::key_from_update_column(&next.column)?) {
                partially_read = last_key;
            }
            tx.set_weak_notification(update_row, self.rows.notify_column())?;
            summary.renotified = true;
        }
        drop(cells);

        if let Some(key_bytes) = partially_read
            && let Some(raw) = pending.remove(&key_bytes)
        {
            summary.partially_read = true;
            self.requeue_partial(tx, bucket, &key_bytes, raw)?;
        }

        let data_column = data_column();
        let data_rows: BTreeSet<Vec<u8>> = pending
            .keys()
            .map(|key| self.rows.data_row(bucket, key))
            .collect();
        let mut current_values = tx.get_rows(&data_rows, &data_column)?;

        let mut changed = Vec::new();
        for (key_bytes, raw_values) in pending {
            let data_row = self.rows.data_row(bucket, &key_bytes);
            let current = current_values.remove(&data_row);
            let key = self.decode_key(&key_bytes)?;

            let mut values = raw_values
                .iter()
                .map(|bytes| self.decode_value(bytes))
                .collect::<Result<Vec<V>, CfmError>>()?;
            if let Some(bytes) = &current {
                values.push(self.decode_value(bytes)?);
            }
            let merged = self.combiner.combine(&key, values)?;
            let merged_bytes = merged
                .as_ref()
                .map(|value| self.encode_value(value))
                .transpose()?;
            summary.keys_merged += 1;

            if merged_bytes == current {
                continue;
            }
            match merged_bytes {
                Some(bytes) => tx.set(data_row, data_column.clone(), bytes)?,
                None => tx.delete(data_row, data_column.clone())?,
            }
            let old_value = current
                .as_deref()
                .map(|bytes| self.decode_value(bytes))
                .transpose()?;
            changed.push(Update {
                key,
                old_value,
                new_value: merged,
            });
        }

        summary.values_changed = changed.len();
        if !changed.is_empty() {
            self.update_observer.updating_values(tx, changed)?;
        }

        debug!(
            map_id = %self.options.map_id,
            bucket,
            cells_read = summary.cells_read,
            bytes_read = summary.bytes_read,
            keys_merged = summary.keys_merged,
            values_changed = summary.values_changed,
            partially_read = summary.partially_read,
            renotified = summary.renotified,
            "processed map bucket"
        );
        Ok(summary)
    }

    /// Puts the combined partial result of a cut-off key back in the queue.
    /// A partial merge that yields no value queues nothing, so every pass
    /// shrinks the key's queue. The caller has already re-armed the bucket.
    fn requeue_partial(
        &self,
        tx: &mut dyn Transaction,
        bucket: u32,
        key_bytes: &[u8],
        raw: Vec<Vec<u8>>,
    ) -> Result<(), CfmError> {
        let key = self.decode_key(key_bytes)?;
        let values = raw
            .iter()
            .map(|bytes| self.decode_value(bytes))
            .collect::<Result<Vec<V>, CfmError>>()?;
        match self.combiner.combine(&key, values)? {
            Some(partial) => {
                let bytes = self.encode_value(&partial)?;
                self.write_pending(tx, bucket, key_bytes, bytes)
            }
            None => {
                debug!(
                    map_id = %self.options.map_id,
                    bucket,
                    values = raw.len(),
                    "partial merge yielded no value, nothing re-queued"
                );
                Ok(())
            }
        }
    }
}

impl<K, V> Observer for CollisionFreeMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn process(
        &self,
        tx: &mut dyn Transaction,
        row: &[u8],
        _column: &Column,
    ) -> Result<(), CfmError> {
        let bucket = self.rows.bucket_of_update_row(row)?;
        self.process_bucket(tx, bucket).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MapOptions;
    use crate::error::{CfmError, CfmErrorCode};
    use crate::map::{
        CollisionFreeMap, Combiner, SummingCombiner, Update, UpdateObserver, data_column,
    };
    use crate::storage::memory::MemoryStore;
    use crate::storage::{SnapshotReader, Transaction};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<Update<String, i64>>>>,
    }

    impl UpdateObserver<String, i64> for Recorder {
        fn updating_values(
            &self,
            _tx: &mut dyn Transaction,
            updates: Vec<Update<String, i64>>,
        ) -> Result<(), CfmError> {
            self.batches.lock().push(updates);
            Ok(())
        }
    }

    struct Failing;

    impl Combiner<String, i64> for Failing {
        fn combine(&self, _key: &String, _values: Vec<i64>) -> Result<Option<i64>, CfmError> {
            Err(CfmError::Combiner("refusing".into()))
        }
    }

    fn map_with(
        buckets: i64,
        buffer_size: Option<u64>,
        recorder: Arc<Recorder>,
    ) -> CollisionFreeMap<String, i64> {
        let mut options = MapOptions::new::<String, i64>("wc", "sum", buckets).expect("options");
        if let Some(size) = buffer_size {
            options = options.with_buffer_size(size).expect("buffer");
        }
        let observer: Arc<dyn UpdateObserver<String, i64>> = recorder;
        CollisionFreeMap::new(options, Arc::new(SummingCombiner), Some(observer)).expect("map")
    }

    fn queue(store: &MemoryStore, map: &CollisionFreeMap<String, i64>, key: &str, value: i64) {
        let key = key.to_string();
        store
            .run_in_transaction(|tx| map.update(tx, [(&key, &value)]))
            .expect("update");
    }

    #[test]
    fn empty_bucket_pass_is_a_no_op() {
        let store = MemoryStore::default();
        let recorder = Arc::new(Recorder::default());
        let map = map_with(1, None, recorder.clone());
        let mut tx = store.begin();
        let summary = map.process_bucket(&mut tx, 0).expect("process");
        assert_eq!(summary.cells_read, 0);
        assert!(!summary.renotified);
        assert!(tx.is_read_only());
        assert!(recorder.batches.lock().is_empty());
    }

    #[test]
    fn pass_merges_and_reports_changes_once() {
        let store = MemoryStore::default();
        let recorder = Arc::new(Recorder::default());
        let map = map_with(1, None, recorder.clone());
        queue(&store, &map, "a", 1);
        queue(&store, &map, "a", 2);
        queue(&store, &map, "b", 5);

        let mut tx = store.begin();
        let summary = map.process_bucket(&mut tx, 0).expect("process");
        store.commit(tx).expect("commit");
        assert_eq!(summary.cells_read, 3);
        assert_eq!(summary.keys_merged, 2);
        assert_eq!(summary.values_changed, 2);

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                Update {
                    key: "a".to_string(),
                    old_value: None,
                    new_value: Some(3),
                },
                Update {
                    key: "b".to_string(),
                    old_value: None,
                    new_value: Some(5),
                },
            ]
        );
        drop(batches);
        assert!(store.cells_with_row_prefix(b"wc:u:").is_empty());
        assert_eq!(store.cells_with_row_prefix(b"wc:d:").len(), 2);
    }

    #[test]
    fn unchanged_merge_writes_nothing_and_reports_nothing() {
        let store = MemoryStore::default();
        let recorder = Arc::new(Recorder::default());
        let map = map_with(1, None, recorder.clone());
        queue(&store, &map, "a", 4);
        store.process_notifications().expect("nothing registered yet");
        let mut tx = store.begin();
        map.process_bucket(&mut tx, 0).expect("first");
        store.commit(tx).expect("commit");

        queue(&store, &map, "a", 3);
        queue(&store, &map, "a", -3);
        let mut tx = store.begin();
        let summary = map.process_bucket(&mut tx, 0).expect("second");
        store.commit(tx).expect("commit");
        assert_eq!(summary.keys_merged, 1);
        assert_eq!(summary.values_changed, 0);
        assert_eq!(recorder.batches.lock().len(), 1);
    }

    #[test]
    fn zero_sum_deletes_the_authoritative_value() {
        let store = MemoryStore::default();
        let recorder = Arc::new(Recorder::default());
        let map = map_with(1, None, recorder.clone());
        queue(&store, &map, "a", 7);
        let mut tx = store.begin();
        map.process_bucket(&mut tx, 0).expect("first");
        store.commit(tx).expect("commit");

        queue(&store, &map, "a", -7);
        let mut tx = store.begin();
        map.process_bucket(&mut tx, 0).expect("second");
        store.commit(tx).expect("commit");

        let snapshot = store.begin();
        assert_eq!(map.get(&snapshot, &"a".to_string()).expect("get"), None);
        assert!(store.cells_with_row_prefix(b"wc:d:").is_empty());
        let last = recorder.batches.lock().last().cloned().expect("batch");
        assert_eq!(last[0].old_value, Some(7));
        assert_eq!(last[0].new_value, None);
    }

    #[test]
    fn buffer_limit_cuts_off_a_key_and_requeues_its_partial_sum() {
        let store = MemoryStore::default();
        let recorder = Arc::new(Recorder::default());
        // msgpack "a" is 2 bytes and small ints 1 byte: room for two cells
        let map = map_with(1, Some(4), recorder.clone());
        for v in [1, 2, 3, 4] {
            queue(&store, &map, "a", v);
        }

        let mut tx = store.begin();
        let summary = map.process_bucket(&mut tx, 0).expect("process");
        assert_eq!(summary.cells_read, 2);
        assert!(summary.partially_read);
        assert!(summary.renotified);
        assert_eq!(summary.keys_merged, 0);
        store.commit(tx).expect("commit");

        // nothing merged yet, one combined cell plus two untouched cells queued
        let data = data_column();
        let snapshot = store.begin();
        let key_bytes = map.encode_key(&"a".to_string()).expect("key");
        assert_eq!(
            snapshot
                .get(&map.rows().data_row(0, &key_bytes), &data)
                .expect("get"),
            None
        );
        assert_eq!(store.cells_with_row_prefix(b"wc:u:0").len(), 3);
        assert_eq!(map.get(&snapshot, &"a".to_string()).expect("get"), Some(10));
        assert!(recorder.batches.lock().is_empty());
    }

    struct Vanishing;

    impl Combiner<String, i64> for Vanishing {
        fn combine(&self, _key: &String, _values: Vec<i64>) -> Result<Option<i64>, CfmError> {
            Ok(None)
        }
    }

    #[test]
    fn cut_off_key_whose_partial_merge_vanishes_shrinks_its_queue() {
        let store = MemoryStore::default();
        let options = MapOptions::new::<String, i64>("wc", "vanishing", 1)
            .expect("options")
            .with_buffer_size(1)
            .expect("buffer");
        let map =
            CollisionFreeMap::<String, i64>::new(options, Arc::new(Vanishing), None).expect("map");
        for v in [1, 2, 3] {
            queue(&store, &map, "a", v);
        }

        let mut tx = store.begin();
        let summary = map.process_bucket(&mut tx, 0).expect("process");
        store.commit(tx).expect("commit");
        assert_eq!(summary.cells_read, 2);
        assert!(summary.partially_read);
        assert!(summary.renotified);
        assert_eq!(store.cells_with_row_prefix(b"wc:u:0").len(), 1);

        let mut tx = store.begin();
        let summary = map.process_bucket(&mut tx, 0).expect("process");
        store.commit(tx).expect("commit");
        assert_eq!(summary.cells_read, 1);
        assert!(!summary.renotified);
        assert!(store.cells_with_row_prefix(b"wc:").is_empty());
    }

    #[test]
    fn combiner_failure_aborts_the_pass() {
        let store = MemoryStore::default();
        let options = MapOptions::new::<String, i64>("wc", "failing", 1).expect("options");
        let map =
            CollisionFreeMap::<String, i64>::new(options, Arc::new(Failing), None).expect("map");
        queue(&store, &map, "a", 1);
        let mut tx = store.begin();
        let err = map.process_bucket(&mut tx, 0).expect_err("combiner fails");
        assert_eq!(err.code(), CfmErrorCode::Combiner);
        drop(tx);
        assert_eq!(store.cells_with_row_prefix(b"wc:u:0").len(), 1);
    }
}
