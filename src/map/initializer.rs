use crate::bucket::{bucket_for, validate_bucket_count};
use crate::codec::Codec;
use crate::config::MapOptions;
use crate::error::CfmError;
use crate::map::rows::{MapRows, data_column};
use crate::storage::RowColumnValue;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts raw key/value pairs into authoritative rows of a map, for loading
/// a map in bulk without going through the update queue.
#[derive(Debug, Clone)]
pub struct Initializer<K, V> {
    rows: MapRows,
    map_id: String,
    buckets: u32,
    key_codec: Codec,
    value_codec: Codec,
    _types: PhantomData<fn(&K, &V)>,
}

impl<K: Serialize, V: Serialize> Initializer<K, V> {
    pub fn new(
        map_id: impl Into<String>,
        buckets: i64,
        key_codec: Codec,
        value_codec: Codec,
    ) -> Result<Self, CfmError> {
        let map_id = map_id.into();
        if map_id.is_empty() || map_id.contains(':') {
            return Err(CfmError::invalid_config(format!(
                "map id must be non-empty and must not contain ':', got '{map_id}'"
            )));
        }
        Ok(Self {
            rows: MapRows::new(map_id.clone()),
            map_id,
            buckets: validate_bucket_count(buckets)?,
            key_codec,
            value_codec,
            _types: PhantomData,
        })
    }

    pub fn from_options(options: &MapOptions) -> Self {
        Self {
            rows: MapRows::new(options.map_id.clone()),
            map_id: options.map_id.clone(),
            buckets: options.buckets,
            key_codec: options.key_codec,
            value_codec: options.value_codec,
            _types: PhantomData,
        }
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    /// The cell holding `value` as the current value of `key`.
    pub fn convert(&self, key: &K, value: &V) -> Result<RowColumnValue, CfmError> {
        let key_bytes = self.key_codec.serialize(key)?;
        let bucket = bucket_for(&key_bytes, self.buckets)?;
        Ok(RowColumnValue {
            row: self.rows.data_row(bucket, &key_bytes),
            column: data_column(),
            value: self.value_codec.serialize(value)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Initializer;
    use crate::bucket::bucket_for;
    use crate::codec::Codec;
    use crate::error::CfmErrorCode;

    #[test]
    fn convert_builds_the_data_row_of_the_key() {
        let init = Initializer::<String, i64>::new("wc", 4, Codec::Json, Codec::Json).expect("init");
        let cell = init.convert(&"hello".to_string(), &9).expect("convert");
        let bucket = bucket_for(b"\"hello\"", 4).expect("bucket");
        assert_eq!(cell.row, format!("wc:d:{bucket}:\"hello\"").into_bytes());
        assert_eq!(cell.column.family, b"data");
        assert_eq!(cell.column.qualifier, b"current");
        assert_eq!(cell.value, b"9");
    }

    #[test]
    fn invalid_layout_is_rejected() {
        let err = Initializer::<u8, u8>::new("wc", 0, Codec::MsgPack, Codec::MsgPack)
            .expect_err("zero buckets");
        assert_eq!(err.code(), CfmErrorCode::InvalidConfig);
        assert!(Initializer::<u8, u8>::new("", 1, Codec::MsgPack, Codec::MsgPack).is_err());
    }
}
