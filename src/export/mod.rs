//! Export queue.
//!
//! Transactions queue (key, value) exports with [`ExportQueue::add`]; each
//! bucket's notification later drains the queued exports in sequence order and
//! hands them to the queue's [`Exporter`] in one batch.

pub mod bucket;
pub mod exporter;

pub use bucket::QueueRows;
pub use exporter::{Exporter, SequencedExport};

use crate::bucket::{bucket_for, validate_bucket_count};
use crate::config::{AppConfig, QueueOptions};
use crate::error::CfmError;
use crate::registry::PluginRegistry;
use crate::storage::{Column, Observer, ObserverRegistry, Span, Transaction};
use self::bucket::EXPORT_FAMILY_PREFIX;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// What one drain of an export bucket did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub bucket: u32,
    pub exported: usize,
    pub bytes_read: u64,
    pub renotified: bool,
}

pub struct ExportQueue<K, V> {
    options: QueueOptions,
    rows: QueueRows,
    exporter: Arc<dyn Exporter<K, V>>,
}

impl<K, V> ExportQueue<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(options: QueueOptions, exporter: Arc<dyn Exporter<K, V>>) -> Result<Self, CfmError> {
        validate_bucket_count(i64::from(options.buckets))?;
        options.check_types::<K, V>()?;
        let rows = QueueRows::new(options.queue_id.clone());
        Ok(Self {
            options,
            rows,
            exporter,
        })
    }

    pub fn from_options(
        options: QueueOptions,
        registry: &PluginRegistry<K, V>,
    ) -> Result<Self, CfmError> {
        let exporter = registry.exporter(&options.exporter)?;
        Self::new(options, exporter)
    }

    pub fn from_app_config(
        queue_id: &str,
        app_config: &AppConfig,
        registry: &PluginRegistry<K, V>,
    ) -> Result<Self, CfmError> {
        Self::from_options(QueueOptions::load(queue_id, app_config)?, registry)
    }

    pub fn configure(options: &QueueOptions, app_config: &mut AppConfig) -> Result<(), CfmError> {
        validate_bucket_count(i64::from(options.buckets))?;
        options.check_types::<K, V>()?;
        options.save(app_config);
        Ok(())
    }

    pub fn register(self: &Arc<Self>, registry: &dyn ObserverRegistry) {
        registry.register_observer(self.rows.notify_column(), self.clone());
    }

    pub fn id(&self) -> &str {
        &self.options.queue_id
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn rows(&self) -> &QueueRows {
        &self.rows
    }

    pub fn add<T>(&self, tx: &mut T, key: &K, value: &V) -> Result<(), CfmError>
    where
        T: Transaction + ?Sized,
    {
        self.add_all(tx, [(key, value)])
    }

    /// Queues every export under the transaction's start timestamp. Exporting
    /// a key twice in one transaction keeps only the last value.
    pub fn add_all<'a, T>(
        &self,
        tx: &mut T,
        exports: impl IntoIterator<Item = (&'a K, &'a V)>,
    ) -> Result<(), CfmError>
    where
        T: Transaction + ?Sized,
        K: 'a,
        V: 'a,
    {
        let sequence = tx.start_ts();
        let mut buckets = BTreeSet::new();
        for (key, value) in exports {
            let key_bytes = self.options.key_codec.serialize(key)?;
            let value_bytes = self.options.value_codec.serialize(value)?;
            let bucket = bucket_for(&key_bytes, self.options.buckets)?;
            tx.set(
                self.rows.bucket_row(bucket),
                QueueRows::export_column(sequence, &key_bytes),
                value_bytes,
            )?;
            buckets.insert(bucket);
        }
        for bucket in buckets {
            tx.set_weak_notification(self.rows.bucket_row(bucket), self.rows.notify_column())?;
        }
        Ok(())
    }

    /// Drains up to `buffer_size` bytes of keys and values from `bucket` and
    /// delivers them to the exporter, re-arming the bucket if exports remain.
    pub fn process_bucket(
        &self,
        tx: &mut dyn Transaction,
        bucket: u32,
    ) -> Result<DrainSummary, CfmError> {
        let row = self.rows.bucket_row(bucket);
        let budget = self.options.buffer_size();
        let mut summary = DrainSummary {
            bucket,
            ..DrainSummary::default()
        };

        let mut batch = Vec::new();
        let mut cells = tx.scan(&Span::family_prefix(row.clone(), EXPORT_FAMILY_PREFIX))?;
        while summary.bytes_read < budget {
            let Some(cell) = cells.next() else {
                break;
            };
            let cell = cell?;
            let (sequence, key_bytes) = QueueRows::parse_export_column(&cell.column)?;
            summary.bytes_read += (key_bytes.len() + cell.value.len()) as u64;
            batch.push(SequencedExport {
                key: self.options.key_codec.deserialize(key_bytes)?,
                value: self.options.value_codec.deserialize(&cell.value)?,
                sequence,
            });
            tx.delete(cell.row, cell.column)?;
        }
        if cells.next().is_some() {
            tx.set_weak_notification(row, self.rows.notify_column())?;
            summary.renotified = true;
        }
        drop(cells);

        summary.exported = batch.len();
        if !batch.is_empty() {
            self.exporter.export(tx, batch)?;
        }
        debug!(
            queue_id = %self.options.queue_id,
            bucket,
            exported = summary.exported,
            bytes_read = summary.bytes_read,
            renotified = summary.renotified,
            "drained export bucket"
        );
        Ok(summary)
    }
}

impl<K, V> Observer for ExportQueue<K, V>
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
        let bucket = self.rows.bucket_of_row(row)?;
        self.process_bucket(tx, bucket).map(|_| ())
    }
}
