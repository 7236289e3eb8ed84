//! Hash routing of serialized keys onto a fixed number of buckets.
//!
//! Producers, the bucket processor, readers and the initializer must all agree
//! on the bucket of a key, so the hash is fixed: 32-bit MurmurHash3 (x86
//! variant, seed 0), read as a signed integer, remainder, then absolute value.

use crate::error::CfmError;
use std::io::Cursor;

/// MurmurHash3 x86 32-bit of `data`.
pub fn murmur3_32(data: &[u8], seed: u32) -> Result<u32, CfmError> {
    Ok(murmur3::murmur3_32(&mut Cursor::new(data), seed)?)
}

/// Checks a configured bucket count and returns it in routing form.
pub fn validate_bucket_count(buckets: i64) -> Result<u32, CfmError> {
    if buckets <= 0 || buckets > i64::from(i32::MAX) {
        return Err(CfmError::invalid_config(format!(
            "bucket count must be in 1..={}, got {buckets}",
            i32::MAX
        )));
    }
    Ok(buckets as u32)
}

/// Bucket of `serialized_key` among `num_buckets`.
///
/// `num_buckets` must already be validated; a zero count is a programming error
/// upstream and is rejected by every constructor in this crate.
pub fn bucket_for(serialized_key: &[u8], num_buckets: u32) -> Result<u32, CfmError> {
    debug_assert!(num_buckets > 0 && num_buckets <= i32::MAX as u32);
    let hash = murmur3_32(serialized_key, 0)? as i32;
    Ok((hash % num_buckets as i32).unsigned_abs())
}
