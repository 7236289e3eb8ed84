use crate::config::MapOptions;
use crate::error::CfmError;
use crate::map::Initializer;
use crate::storage::{RowColumnValue, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const BULK_FORMAT_VERSION: u32 = 1;

/// Authoritative rows of one map, prepared offline for bulk loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkLoadEnvelope {
    pub version: u32,
    pub map_id: String,
    pub buckets: u32,
    pub created_at_micros: u64,
    pub entries: Vec<RowColumnValue>,
    pub checksum_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkLoadReport {
    pub map_id: String,
    pub buckets: u32,
    pub entries: u64,
    pub checksum_hex: String,
}

/// Converts `pairs` into data rows and writes them to `out_path`.
pub fn write_bulk_file<'a, K, V>(
    initializer: &Initializer<K, V>,
    pairs: impl IntoIterator<Item = (&'a K, &'a V)>,
    out_path: &Path,
) -> Result<BulkLoadReport, CfmError>
where
    K: Serialize + 'a,
    V: Serialize + 'a,
{
    let entries = pairs
        .into_iter()
        .map(|(key, value)| initializer.convert(key, value))
        .collect::<Result<Vec<_>, CfmError>>()?;
    let checksum_hex = checksum_entries(initializer.map_id(), initializer.buckets(), &entries)?;
    let envelope = BulkLoadEnvelope {
        version: BULK_FORMAT_VERSION,
        map_id: initializer.map_id().to_string(),
        buckets: initializer.buckets(),
        created_at_micros: now_micros(),
        entries,
        checksum_hex,
    };
    let bytes = rmp_serde::to_vec(&envelope).map_err(|e| CfmError::Encode(e.to_string()))?;
    fs::write(out_path, bytes)?;
    info!(
        map_id = %envelope.map_id,
        entries = envelope.entries.len(),
        path = %out_path.display(),
        "wrote bulk load file"
    );
    Ok(report(&envelope))
}

/// Reads a bulk file, rejecting unknown versions and checksum mismatches.
pub fn read_bulk_file(path: &Path) -> Result<BulkLoadEnvelope, CfmError> {
    let bytes = fs::read(path)?;
    let envelope: BulkLoadEnvelope =
        rmp_serde::from_slice(&bytes).map_err(|e| CfmError::Decode(e.to_string()))?;
    if envelope.version != BULK_FORMAT_VERSION {
        return Err(CfmError::corrupt(format!(
            "unsupported bulk file version: {}",
            envelope.version
        )));
    }
    let expected = checksum_entries(&envelope.map_id, envelope.buckets, &envelope.entries)?;
    if expected != envelope.checksum_hex {
        return Err(CfmError::corrupt("bulk file checksum mismatch"));
    }
    Ok(envelope)
}

pub fn verify_bulk_file(path: &Path) -> Result<BulkLoadReport, CfmError> {
    read_bulk_file(path).map(|envelope| report(&envelope))
}

/// Writes the rows of `envelope` in `tx`. The file must have been produced for
/// the same map id and bucket count as `options`, since rows encode the bucket.
pub fn apply_bulk_file<T>(
    tx: &mut T,
    envelope: &BulkLoadEnvelope,
    options: &MapOptions,
) -> Result<BulkLoadReport, CfmError>
where
    T: Transaction + ?Sized,
{
    if envelope.map_id != options.map_id || envelope.buckets != options.buckets {
        return Err(CfmError::invalid_config(format!(
            "bulk file is for map '{}' with {} buckets, target is '{}' with {}",
            envelope.map_id, envelope.buckets, options.map_id, options.buckets
        )));
    }
    for entry in &envelope.entries {
        tx.set(entry.row.clone(), entry.column.clone(), entry.value.clone())?;
    }
    info!(
        map_id = %envelope.map_id,
        entries = envelope.entries.len(),
        "applied bulk load file"
    );
    Ok(report(envelope))
}

fn report(envelope: &BulkLoadEnvelope) -> BulkLoadReport {
    BulkLoadReport {
        map_id: envelope.map_id.clone(),
        buckets: envelope.buckets,
        entries: envelope.entries.len() as u64,
        checksum_hex: envelope.checksum_hex.clone(),
    }
}

fn checksum_entries(
    map_id: &str,
    buckets: u32,
    entries: &[RowColumnValue],
) -> Result<String, CfmError> {
    let bytes =
        rmp_serde::to_vec(&(map_id, buckets, entries)).map_err(|e| CfmError::Encode(e.to_string()))?;
    let mut h = Sha256::new();
    h.update(&bytes);
    Ok(hex::encode(h.finalize()))
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
