//! Interface to the transactional sorted key-value store the map is layered on.
//!
//! Cells are addressed by `(row, family, qualifier)` and sorted in that order.
//! Everything in this crate talks to the store through [`SnapshotReader`],
//! [`Transaction`], [`Observer`] and [`ObserverRegistry`]; [`memory`] provides
//! an in-process implementation.

pub mod memory;

use crate::error::CfmError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Column {
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
}

impl Column {
    pub fn new(family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowColumn {
    pub row: Vec<u8>,
    pub column: Column,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowColumnValue {
    pub row: Vec<u8>,
    pub column: Column,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyMatch {
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
}

impl FamilyMatch {
    pub fn matches(&self, family: &[u8]) -> bool {
        match self {
            FamilyMatch::Exact(f) => family == f.as_slice(),
            FamilyMatch::Prefix(p) => family.starts_with(p),
        }
    }

    /// Smallest family that can match.
    pub fn lower_bound(&self) -> &[u8] {
        match self {
            FamilyMatch::Exact(f) | FamilyMatch::Prefix(f) => f,
        }
    }
}

/// Cells of one row whose column family matches, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub row: Vec<u8>,
    pub family: FamilyMatch,
}

impl Span {
    pub fn family_prefix(row: impl Into<Vec<u8>>, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            family: FamilyMatch::Prefix(prefix.into()),
        }
    }

    pub fn exact_family(row: impl Into<Vec<u8>>, family: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            family: FamilyMatch::Exact(family.into()),
        }
    }

    pub fn contains(&self, row: &[u8], column: &Column) -> bool {
        row == self.row.as_slice() && self.family.matches(&column.family)
    }
}

pub type CellIter = Box<dyn Iterator<Item = Result<RowColumnValue, CfmError>> + Send>;

/// Read access to a consistent snapshot of the store.
pub trait SnapshotReader {
    fn start_ts(&self) -> u64;

    fn get(&self, row: &[u8], column: &Column) -> Result<Option<Vec<u8>>, CfmError>;

    /// Point lookups of one column across many rows; absent rows are omitted.
    fn get_rows(
        &self,
        rows: &BTreeSet<Vec<u8>>,
        column: &Column,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, CfmError> {
        let mut out = BTreeMap::new();
        for row in rows {
            if let Some(value) = self.get(row, column)? {
                out.insert(row.clone(), value);
            }
        }
        Ok(out)
    }

    /// Lazily iterates the cells selected by `span` in column order.
    fn scan(&self, span: &Span) -> Result<CellIter, CfmError>;
}

/// A snapshot-isolated read-write transaction.
pub trait Transaction: SnapshotReader {
    fn set(&mut self, row: Vec<u8>, column: Column, value: Vec<u8>) -> Result<(), CfmError>;

    fn delete(&mut self, row: Vec<u8>, column: Column) -> Result<(), CfmError>;

    /// Arms an at-least-once, coalesced notification for `(row, column)`.
    /// Arming the same marker repeatedly before delivery schedules one callback.
    fn set_weak_notification(&mut self, row: Vec<u8>, column: Column) -> Result<(), CfmError>;
}

/// Callback run by the store, in a fresh transaction, for a delivered notification.
pub trait Observer: Send + Sync {
    fn process(&self, tx: &mut dyn Transaction, row: &[u8], column: &Column)
    -> Result<(), CfmError>;
}

pub trait ObserverRegistry {
    fn register_observer(&self, column: Column, observer: Arc<dyn Observer>);
}
