use crate::error::CfmError;
use crate::map::rows::NOTIFY_FAMILY;
use crate::storage::Column;

pub(crate) const EXPORT_FAMILY_PREFIX: &[u8] = b"exp:";

/// Row and column layout of one export queue.
///
/// Exports live in `<id>:q:<bucket>` under family
/// `exp:<start_ts as 8 big-endian bytes><key>` with an empty qualifier, so a
/// bucket scans in (sequence, key) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRows {
    queue_id: String,
}

impl QueueRows {
    pub fn new(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
        }
    }

    pub fn bucket_row(&self, bucket: u32) -> Vec<u8> {
        format!("{}:q:{bucket}", self.queue_id).into_bytes()
    }

    pub fn bucket_prefix(&self) -> Vec<u8> {
        format!("{}:q:", self.queue_id).into_bytes()
    }

    pub fn notify_column(&self) -> Column {
        Column::new(NOTIFY_FAMILY.to_vec(), format!("eq:{}", self.queue_id).into_bytes())
    }

    pub fn bucket_of_row(&self, row: &[u8]) -> Result<u32, CfmError> {
        let prefix = self.bucket_prefix();
        let digits = row
            .strip_prefix(prefix.as_slice())
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .ok_or_else(|| {
                CfmError::corrupt(format!(
                    "row '{}' is not a bucket of export queue '{}'",
                    String::from_utf8_lossy(row),
                    self.queue_id
                ))
            })?;
        digits
            .parse::<u32>()
            .map_err(|e| CfmError::corrupt(format!("bad bucket in export row '{digits}': {e}")))
    }

    pub fn export_column(sequence: u64, key: &[u8]) -> Column {
        let mut family = Vec::with_capacity(EXPORT_FAMILY_PREFIX.len() + 8 + key.len());
        family.extend_from_slice(EXPORT_FAMILY_PREFIX);
        family.extend_from_slice(&sequence.to_be_bytes());
        family.extend_from_slice(key);
        Column::new(family, Vec::new())
    }

    /// Splits an export column into its sequence and serialized key.
    pub fn parse_export_column(column: &Column) -> Result<(u64, &[u8]), CfmError> {
        let rest = column
            .family
            .strip_prefix(EXPORT_FAMILY_PREFIX)
            .filter(|rest| rest.len() >= 8)
            .ok_or_else(|| {
                CfmError::corrupt(format!(
                    "column family '{}' is not an export",
                    String::from_utf8_lossy(&column.family)
                ))
            })?;
        let (sequence, key) = rest.split_at(8);
        let mut be = [0u8; 8];
        be.copy_from_slice(sequence);
        Ok((u64::from_be_bytes(be), key))
    }
}
