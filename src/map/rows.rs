use crate::error::CfmError;
use crate::storage::Column;
use uuid::Uuid;

pub(crate) const UPDATE_FAMILY_PREFIX: &[u8] = b"upd:";
pub(crate) const NOTIFY_FAMILY: &[u8] = b"recipes";

/// Column holding the authoritative value in a data row.
pub fn data_column() -> Column {
    Column::new(b"data".to_vec(), b"current".to_vec())
}

/// Row and column layout of one map.
///
/// Pending updates live in `<id>:u:<bucket>` with family `upd:<key>` and a
/// random 16-byte qualifier; authoritative values live in
/// `<id>:d:<bucket>:<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRows {
    map_id: String,
}

impl MapRows {
    pub fn new(map_id: impl Into<String>) -> Self {
        Self {
            map_id: map_id.into(),
        }
    }

    pub fn update_row(&self, bucket: u32) -> Vec<u8> {
        format!("{}:u:{bucket}", self.map_id).into_bytes()
    }

    pub fn data_row(&self, bucket: u32, key: &[u8]) -> Vec<u8> {
        let mut row = format!("{}:d:{bucket}:", self.map_id).into_bytes();
        row.extend_from_slice(key);
        row
    }

    /// Prefix shared by every data row of the map.
    pub fn data_prefix(&self) -> Vec<u8> {
        format!("{}:d:", self.map_id).into_bytes()
    }

    /// Prefix shared by every update row of the map.
    pub fn update_prefix(&self) -> Vec<u8> {
        format!("{}:u:", self.map_id).into_bytes()
    }

    pub fn notify_column(&self) -> Column {
        Column::new(NOTIFY_FAMILY.to_vec(), format!("cfm:{}", self.map_id).into_bytes())
    }

    pub fn bucket_of_update_row(&self, row: &[u8]) -> Result<u32, CfmError> {
        let prefix = self.update_prefix();
        let digits = row
            .strip_prefix(prefix.as_slice())
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .ok_or_else(|| {
                CfmError::corrupt(format!(
                    "row '{}' is not an update row of map '{}'",
                    String::from_utf8_lossy(row),
                    self.map_id
                ))
            })?;
        digits.parse::<u32>().map_err(|e| {
            CfmError::corrupt(format!("bad bucket in update row '{digits}': {e}"))
        })
    }

    pub fn update_family(key: &[u8]) -> Vec<u8> {
        let mut family = Vec::with_capacity(UPDATE_FAMILY_PREFIX.len() + key.len());
        family.extend_from_slice(UPDATE_FAMILY_PREFIX);
        family.extend_from_slice(key);
        family
    }

    pub fn update_column(key: &[u8], token: Uuid) -> Column {
        Column {
            family: Self::update_family(key),
            qualifier: token.as_bytes().to_vec(),
        }
    }

    pub fn key_from_update_column(column: &Column) -> Result<&[u8], CfmError> {
        column
            .family
            .strip_prefix(UPDATE_FAMILY_PREFIX)
            .ok_or_else(|| {
                CfmError::corrupt(format!(
                    "column family '{}' is not a pending update",
                    String::from_utf8_lossy(&column.family)
                ))
            })
    }
}
