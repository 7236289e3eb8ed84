//! Collision-free map.
//!
//! Producers queue updates with [`CollisionFreeMap::update`]; every update is
//! written to its own cell, so concurrent producers never write the same cell
//! and never conflict. A notification per touched bucket later runs the bucket
//! processor, which folds queued values into the key's authoritative value
//! with the map's [`Combiner`]. [`CollisionFreeMap::get`] merges whatever is
//! still queued at read time, so reads do not depend on the processor having
//! run.

pub mod combiner;
pub mod initializer;
pub mod observer;
pub mod processor;
pub mod rows;

pub use combiner::{Combiner, SummingCombiner};
pub use initializer::Initializer;
pub use observer::{NullUpdateObserver, Update, UpdateObserver};
pub use processor::PassSummary;
pub use rows::{MapRows, data_column};

use crate::bucket::{bucket_for, validate_bucket_count};
use crate::config::{AppConfig, MapOptions};
use crate::error::CfmError;
use crate::registry::PluginRegistry;
use crate::storage::{Column, ObserverRegistry, SnapshotReader, Span, Transaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct CollisionFreeMap<K, V> {
    options: MapOptions,
    rows: MapRows,
    combiner: Arc<dyn Combiner<K, V>>,
    update_observer: Arc<dyn UpdateObserver<K, V>>,
}

impl<K, V> CollisionFreeMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        options: MapOptions,
        combiner: Arc<dyn Combiner<K, V>>,
        update_observer: Option<Arc<dyn UpdateObserver<K, V>>>,
    ) -> Result<Self, CfmError> {
        validate_bucket_count(i64::from(options.buckets))?;
        options.check_types::<K, V>()?;
        let rows = MapRows::new(options.map_id.clone());
        Ok(Self {
            options,
            rows,
            combiner,
            update_observer: update_observer.unwrap_or_else(|| Arc::new(NullUpdateObserver)),
        })
    }

    /// Builds a map whose combiner and observer are looked up by name.
    pub fn from_options(
        options: MapOptions,
        registry: &PluginRegistry<K, V>,
    ) -> Result<Self, CfmError> {
        let combiner = registry.combiner(&options.combiner)?;
        let update_observer = options
            .update_observer
            .as_deref()
            .map(|name| registry.update_observer(name))
            .transpose()?;
        Self::new(options, combiner, update_observer)
    }

    /// Rebuilds a map previously saved with [`CollisionFreeMap::configure`].
    pub fn from_app_config(
        map_id: &str,
        app_config: &AppConfig,
        registry: &PluginRegistry<K, V>,
    ) -> Result<Self, CfmError> {
        Self::from_options(MapOptions::load(map_id, app_config)?, registry)
    }

    /// Validates `options` and records them in `app_config`. Call once, before
    /// the map is first used; the bucket count cannot change afterwards.
    pub fn configure(options: &MapOptions, app_config: &mut AppConfig) -> Result<(), CfmError> {
        validate_bucket_count(i64::from(options.buckets))?;
        options.check_types::<K, V>()?;
        options.save(app_config);
        Ok(())
    }

    /// Registers the bucket processor for this map's notifications.
    pub fn register(self: &Arc<Self>, registry: &dyn ObserverRegistry) {
        registry.register_observer(self.notify_column(), self.clone());
    }

    pub fn id(&self) -> &str {
        &self.options.map_id
    }

    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    pub fn rows(&self) -> &MapRows {
        &self.rows
    }

    pub fn notify_column(&self) -> Column {
        self.rows.notify_column()
    }

    pub fn initializer(&self) -> Initializer<K, V> {
        Initializer::from_options(&self.options)
    }

    pub fn bucket_of(&self, key: &K) -> Result<u32, CfmError> {
        bucket_for(&self.encode_key(key)?, self.options.buckets)
    }

    /// Queues `updates` in `tx`. Each (key, value) becomes one pending cell
    /// under a fresh random token, and each touched bucket's notification is
    /// armed once.
    pub fn update<'a, T>(
        &self,
        tx: &mut T,
        updates: impl IntoIterator<Item = (&'a K, &'a V)>,
    ) -> Result<(), CfmError>
    where
        T: Transaction + ?Sized,
        K: 'a,
        V: 'a,
    {
        let mut buckets = BTreeSet::new();
        for (key, value) in updates {
            let key_bytes = self.encode_key(key)?;
            let value_bytes = self.encode_value(value)?;
            let bucket = bucket_for(&key_bytes, self.options.buckets)?;
            self.write_pending(tx, bucket, &key_bytes, value_bytes)?;
            buckets.insert(bucket);
        }
        for bucket in buckets {
            self.arm(tx, bucket)?;
        }
        Ok(())
    }

    /// Current value of `key` as seen by `snapshot`, with every update still
    /// queued for it merged in. Writes nothing.
    pub fn get<S>(&self, snapshot: &S, key: &K) -> Result<Option<V>, CfmError>
    where
        S: SnapshotReader + ?Sized,
    {
        let key_bytes = self.encode_key(key)?;
        let bucket = bucket_for(&key_bytes, self.options.buckets)?;

        let span = Span::exact_family(
            self.rows.update_row(bucket),
            MapRows::update_family(&key_bytes),
        );
        let mut values = Vec::new();
        for cell in snapshot.scan(&span)? {
            values.push(self.decode_value(&cell?.value)?);
        }

        let current = snapshot.get(&self.rows.data_row(bucket, &key_bytes), &data_column())?;
        if values.is_empty() {
            return current
                .as_deref()
                .map(|bytes| self.decode_value(bytes))
                .transpose();
        }
        if let Some(bytes) = current {
            values.push(self.decode_value(&bytes)?);
        }
        self.combiner.combine(key, values)
    }

    pub(crate) fn write_pending<T>(
        &self,
        tx: &mut T,
        bucket: u32,
        key_bytes: &[u8],
        value_bytes: Vec<u8>,
    ) -> Result<(), CfmError>
    where
        T: Transaction + ?Sized,
    {
        // token collisions are not checked, 122 random bits per cell
        let column = MapRows::update_column(key_bytes, Uuid::new_v4());
        tx.set(self.rows.update_row(bucket), column, value_bytes)
    }

    pub(crate) fn arm<T>(&self, tx: &mut T, bucket: u32) -> Result<(), CfmError>
    where
        T: Transaction + ?Sized,
    {
        tx.set_weak_notification(self.rows.update_row(bucket), self.rows.notify_column())
    }

    pub(crate) fn encode_key(&self, key: &K) -> Result<Vec<u8>, CfmError> {
        self.options.key_codec.serialize(key)
    }

    pub(crate) fn decode_key(&self, bytes: &[u8]) -> Result<K, CfmError> {
        self.options.key_codec.deserialize(bytes)
    }

    pub(crate) fn encode_value(&self, value: &V) -> Result<Vec<u8>, CfmError> {
        self.options.value_codec.serialize(value)
    }

    pub(crate) fn decode_value(&self, bytes: &[u8]) -> Result<V, CfmError> {
        self.options.value_codec.deserialize(bytes)
    }
}
