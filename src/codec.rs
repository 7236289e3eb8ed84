use crate::error::CfmError;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub const MSGPACK_CODEC_ID: &str = "msgpack";
pub const JSON_CODEC_ID: &str = "json";

/// Named serialization formats for keys and values stored in the table.
///
/// Keys are routed by the hash of their serialized bytes, so a map's codecs are
/// part of its persisted identity and must not change after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    MsgPack,
    Json,
}

impl Codec {
    pub fn from_id(id: &str) -> Result<Self, CfmError> {
        match id {
            MSGPACK_CODEC_ID => Ok(Codec::MsgPack),
            JSON_CODEC_ID => Ok(Codec::Json),
            other => Err(CfmError::UnknownCodec(other.to_string())),
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Codec::MsgPack => MSGPACK_CODEC_ID,
            Codec::Json => JSON_CODEC_ID,
        }
    }

    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CfmError> {
        match self {
            Codec::MsgPack => rmp_serde::to_vec(value).map_err(|e| CfmError::Encode(e.to_string())),
            Codec::Json => serde_json::to_vec(value).map_err(|e| CfmError::Encode(e.to_string())),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CfmError> {
        match self {
            Codec::MsgPack => {
                rmp_serde::from_slice(bytes).map_err(|e| CfmError::Decode(e.to_string()))
            }
            Codec::Json => serde_json::from_slice(bytes).map_err(|e| CfmError::Decode(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Codec;
    use crate::error::CfmErrorCode;

    #[test]
    fn codec_ids_resolve() {
        assert_eq!(Codec::from_id("msgpack").expect("msgpack"), Codec::MsgPack);
        assert_eq!(Codec::from_id("json").expect("json"), Codec::Json);
        let err = Codec::from_id("avro").expect_err("unknown codec");
        assert_eq!(err.code(), CfmErrorCode::UnknownCodec);
    }

    #[test]
    fn json_keys_are_human_readable() {
        let bytes = Codec::Json.serialize("user:1").expect("encode");
        assert_eq!(bytes, b"\"user:1\"");
    }

    #[test]
    fn decode_failure_is_reported() {
        let err = Codec::MsgPack
            .deserialize::<i64>(&[0xc1])
            .expect_err("0xc1 is never valid msgpack");
        assert_eq!(err.code(), CfmErrorCode::Decode);
    }
}
