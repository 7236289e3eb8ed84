use crate::error::CfmError;
use crate::storage::Transaction;

/// One exported pair with the start timestamp of the transaction that queued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedExport<K, V> {
    pub key: K,
    pub value: V,
    pub sequence: u64,
}

/// Receives the exports drained from one bucket, inside the draining
/// transaction. Delivery is at least once; `sequence` orders exports of a key.
pub trait Exporter<K, V>: Send + Sync {
    fn export(
        &self,
        tx: &mut dyn Transaction,
        exports: Vec<SequencedExport<K, V>>,
    ) -> Result<(), CfmError>;
}
