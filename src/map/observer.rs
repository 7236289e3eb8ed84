use crate::error::CfmError;
use crate::storage::Transaction;

/// A change to the authoritative value of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update<K, V> {
    pub key: K,
    pub old_value: Option<V>,
    pub new_value: Option<V>,
}

/// Told about every changed key, once per processing pass, inside the
/// processing transaction.
pub trait UpdateObserver<K, V>: Send + Sync {
    fn updating_values(
        &self,
        tx: &mut dyn Transaction,
        updates: Vec<Update<K, V>>,
    ) -> Result<(), CfmError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullUpdateObserver;

impl<K, V> UpdateObserver<K, V> for NullUpdateObserver {
    fn updating_values(
        &self,
        _tx: &mut dyn Transaction,
        _updates: Vec<Update<K, V>>,
    ) -> Result<(), CfmError> {
        Ok(())
    }
}
