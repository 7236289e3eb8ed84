//! In-process implementation of the store traits.
//!
//! Snapshots are persistent `im::OrdMap`s, so `begin` is O(1). Every `begin`
//! draws a fresh timestamp from the store clock. Commits use
//! first-committer-wins conflict detection on written cells. Weak
//! notifications are coalesced per marker and cleared by the delivering
//! transaction only if nobody re-armed them in the meantime.

use crate::config::{AppConfig, MemoryStoreConfig};
use crate::error::CfmError;
use crate::storage::{
    CellIter, Column, Observer, ObserverRegistry, RowColumn, RowColumnValue, SnapshotReader, Span,
    Transaction,
};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct StoreState {
    cells: OrdMap<RowColumn, Vec<u8>>,
    last_commit: HashMap<RowColumn, u64>,
    /// Armed markers and the commit timestamp of their latest arming.
    notifications: BTreeMap<RowColumn, u64>,
    clock: u64,
    app_config: AppConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationStats {
    pub rounds: u64,
    pub delivered: u64,
    pub conflicts: u64,
}

impl NotificationStats {
    fn absorb(&mut self, other: NotificationStats) {
        self.rounds += other.rounds;
        self.delivered += other.delivered;
        self.conflicts += other.conflicts;
    }
}

pub struct MemoryStore {
    config: MemoryStoreConfig,
    state: Mutex<StoreState>,
    observers: RwLock<HashMap<Column, Arc<dyn Observer>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StoreState::default()),
            observers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_app_config(config: MemoryStoreConfig, app_config: AppConfig) -> Self {
        let store = Self::new(config);
        store.state.lock().app_config = app_config;
        store
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    pub fn app_config(&self) -> AppConfig {
        self.state.lock().app_config.clone()
    }

    pub fn update_app_config<R>(
        &self,
        f: impl FnOnce(&mut AppConfig) -> Result<R, CfmError>,
    ) -> Result<R, CfmError> {
        let mut state = self.state.lock();
        let mut next = state.app_config.clone();
        let out = f(&mut next)?;
        state.app_config = next;
        Ok(out)
    }

    pub fn begin(&self) -> MemoryTransaction {
        let mut state = self.state.lock();
        state.clock += 1;
        MemoryTransaction {
            start_ts: state.clock,
            snapshot: state.cells.clone(),
            writes: OrdMap::new(),
            notifications: BTreeSet::new(),
        }
    }

    pub fn commit(&self, tx: MemoryTransaction) -> Result<u64, CfmError> {
        self.commit_inner(tx, None)
    }

    fn commit_inner(
        &self,
        tx: MemoryTransaction,
        delivered: Option<(&RowColumn, u64)>,
    ) -> Result<u64, CfmError> {
        let mut state = self.state.lock();
        for key in tx.writes.keys() {
            if let Some(&committed) = state.last_commit.get(key)
                && committed > tx.start_ts
            {
                return Err(CfmError::Conflict(format!(
                    "row '{}' family '{}' written at {committed} after start {}",
                    String::from_utf8_lossy(&key.row),
                    String::from_utf8_lossy(&key.column.family),
                    tx.start_ts
                )));
            }
        }
        if tx.writes.is_empty() && tx.notifications.is_empty() && delivered.is_none() {
            return Ok(tx.start_ts);
        }

        state.clock += 1;
        let commit_ts = state.clock;
        for (key, write) in tx.writes {
            match write {
                Some(value) => {
                    state.cells.insert(key.clone(), value);
                }
                None => {
                    state.cells.remove(&key);
                }
            }
            state.last_commit.insert(key, commit_ts);
        }
        for marker in tx.notifications {
            state.notifications.insert(marker, commit_ts);
        }
        if let Some((marker, armed_ts)) = delivered
            && state.notifications.get(marker) == Some(&armed_ts)
        {
            state.notifications.remove(marker);
        }
        Ok(commit_ts)
    }

    /// Runs `f` in a fresh transaction and commits it, re-running on conflict.
    pub fn run_in_transaction<R>(
        &self,
        mut f: impl FnMut(&mut MemoryTransaction) -> Result<R, CfmError>,
    ) -> Result<R, CfmError> {
        let mut attempt = 0usize;
        loop {
            let mut tx = self.begin();
            let out = f(&mut tx)?;
            match self.commit(tx) {
                Ok(_) => return Ok(out),
                Err(err) if err.is_retryable() && attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "transaction conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn pending_notifications(&self) -> usize {
        self.state.lock().notifications.len()
    }

    /// Delivers every currently armed notification that has an observer once.
    /// Notifications armed while the round runs wait for the next round.
    pub fn process_notification_round(&self) -> Result<NotificationStats, CfmError> {
        let pending = self.observed_notifications();
        let mut stats = NotificationStats::default();
        if pending.is_empty() {
            return Ok(stats);
        }
        stats.rounds = 1;
        for (marker, armed_ts) in pending {
            self.deliver(&marker, armed_ts, &mut stats)?;
        }
        Ok(stats)
    }

    /// Delivers notifications until none with a registered observer remain.
    pub fn process_notifications(&self) -> Result<NotificationStats, CfmError> {
        let mut stats = NotificationStats::default();
        loop {
            let round = self.process_notification_round()?;
            if round.rounds == 0 {
                return Ok(stats);
            }
            stats.absorb(round);
            if stats.rounds >= self.config.max_notification_rounds as u64 {
                return Err(CfmError::Unavailable {
                    message: format!("notifications still armed after {} rounds", stats.rounds),
                });
            }
        }
    }

    fn observed_notifications(&self) -> Vec<(RowColumn, u64)> {
        let observers = self.observers.read();
        let state = self.state.lock();
        let mut skipped = 0usize;
        let pending = state
            .notifications
            .iter()
            .filter(|(marker, _)| {
                let observed = observers.contains_key(&marker.column);
                skipped += usize::from(!observed);
                observed
            })
            .map(|(marker, ts)| (marker.clone(), *ts))
            .collect();
        if skipped > 0 {
            debug!(skipped, "notifications without a registered observer left armed");
        }
        pending
    }

    fn deliver(
        &self,
        marker: &RowColumn,
        armed_ts: u64,
        stats: &mut NotificationStats,
    ) -> Result<(), CfmError> {
        let Some(observer) = self.observers.read().get(&marker.column).cloned() else {
            return Ok(());
        };
        let mut attempt = 0usize;
        loop {
            let mut tx = self.begin();
            observer.process(&mut tx, &marker.row, &marker.column)?;
            match self.commit_inner(tx, Some((marker, armed_ts))) {
                Ok(_) => {
                    stats.delivered += 1;
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    stats.conflicts += 1;
                    warn!(
                        attempt,
                        row = %String::from_utf8_lossy(&marker.row),
                        error = %err,
                        "notification transaction conflict, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Committed cells whose row starts with `prefix`, in store order.
    pub fn cells_with_row_prefix(&self, prefix: &[u8]) -> Vec<RowColumnValue> {
        let state = self.state.lock();
        let start = RowColumn {
            row: prefix.to_vec(),
            column: Column::default(),
        };
        state
            .cells
            .range(start..)
            .take_while(|(key, _)| key.row.starts_with(prefix))
            .map(|(key, value)| RowColumnValue {
                row: key.row.clone(),
                column: key.column.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub fn cell_count(&self) -> usize {
        self.state.lock().cells.len()
    }
}

impl ObserverRegistry for MemoryStore {
    fn register_observer(&self, column: Column, observer: Arc<dyn Observer>) {
        self.observers.write().insert(column, observer);
    }
}

/// Transaction against a [`MemoryStore`] snapshot; commit with
/// [`MemoryStore::commit`]. Dropping it aborts.
#[derive(Debug, Clone)]
pub struct MemoryTransaction {
    start_ts: u64,
    snapshot: OrdMap<RowColumn, Vec<u8>>,
    writes: OrdMap<RowColumn, Option<Vec<u8>>>,
    notifications: BTreeSet<RowColumn>,
}

impl MemoryTransaction {
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.notifications.is_empty()
    }
}

impl SnapshotReader for MemoryTransaction {
    fn start_ts(&self) -> u64 {
        self.start_ts
    }

    fn get(&self, row: &[u8], column: &Column) -> Result<Option<Vec<u8>>, CfmError> {
        let key = RowColumn {
            row: row.to_vec(),
            column: column.clone(),
        };
        if let Some(buffered) = self.writes.get(&key) {
            return Ok(buffered.clone());
        }
        Ok(self.snapshot.get(&key).cloned())
    }

    fn scan(&self, span: &Span) -> Result<CellIter, CfmError> {
        let start = Bound::Included(RowColumn {
            row: span.row.clone(),
            column: Column {
                family: span.family.lower_bound().to_vec(),
                qualifier: Vec::new(),
            },
        });
        let committed = first_in_span(&self.snapshot, start.clone(), span);
        let buffered = first_in_span(&self.writes, start, span);
        Ok(Box::new(ScanCursor {
            span: span.clone(),
            snapshot: self.snapshot.clone(),
            writes: self.writes.clone(),
            committed,
            buffered,
        }))
    }
}

fn first_in_span<V: Clone>(
    cells: &OrdMap<RowColumn, V>,
    from: Bound<RowColumn>,
    span: &Span,
) -> Option<(RowColumn, V)> {
    cells
        .range((from, Bound::Unbounded))
        .next()
        .filter(|(key, _)| span.contains(&key.row, &key.column))
        .map(|(key, value)| (key.clone(), value.clone()))
}

/// Walks the committed snapshot and the transaction's buffered writes in
/// step, as they were when the scan started. Holds one cell of each at a time.
struct ScanCursor {
    span: Span,
    snapshot: OrdMap<RowColumn, Vec<u8>>,
    writes: OrdMap<RowColumn, Option<Vec<u8>>>,
    committed: Option<(RowColumn, Vec<u8>)>,
    buffered: Option<(RowColumn, Option<Vec<u8>>)>,
}

impl ScanCursor {
    fn advance_committed(&mut self) -> Option<(RowColumn, Vec<u8>)> {
        let current = self.committed.take()?;
        self.committed = first_in_span(
            &self.snapshot,
            Bound::Excluded(current.0.clone()),
            &self.span,
        );
        Some(current)
    }

    fn advance_buffered(&mut self) -> Option<(RowColumn, Option<Vec<u8>>)> {
        let current = self.buffered.take()?;
        self.buffered = first_in_span(
            &self.writes,
            Bound::Excluded(current.0.clone()),
            &self.span,
        );
        Some(current)
    }
}

impl Iterator for ScanCursor {
    type Item = Result<RowColumnValue, CfmError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let order = match (&self.committed, &self.buffered) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((committed, _)), Some((buffered, _))) => committed.cmp(buffered),
            };
            let (key, value) = match order {
                Ordering::Less => {
                    let (key, value) = self.advance_committed()?;
                    (key, Some(value))
                }
                Ordering::Equal => {
                    self.advance_committed();
                    self.advance_buffered()?
                }
                Ordering::Greater => self.advance_buffered()?,
            };
            // a buffered delete hides the committed cell
            if let Some(value) = value {
                return Some(Ok(RowColumnValue {
                    row: key.row,
                    column: key.column,
                    value,
                }));
            }
        }
    }
}

impl Transaction for MemoryTransaction {
    fn set(&mut self, row: Vec<u8>, column: Column, value: Vec<u8>) -> Result<(), CfmError> {
        self.writes.insert(RowColumn { row, column }, Some(value));
        Ok(())
    }

    fn delete(&mut self, row: Vec<u8>, column: Column) -> Result<(), CfmError> {
        self.writes.insert(RowColumn { row, column }, None);
        Ok(())
    }

    fn set_weak_notification(&mut self, row: Vec<u8>, column: Column) -> Result<(), CfmError> {
        self.notifications.insert(RowColumn { row, column });
        Ok(())
    }
}
