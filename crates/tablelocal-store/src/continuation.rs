//! Continuation tokens.
//!
//! A continuation names the first key the next page starts at. On the wire
//! each component travels as `1!<len>!<base64>`, which keeps arbitrary key
//! text header-safe and lets the format change later without breaking
//! tokens already handed out.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tablelocal_common::{EntityKey, Error, Result};

const VERSION: &str = "1";

/// Resume point of an entity scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    /// First key of the next page (inclusive)
    pub next: EntityKey,
}

impl ContinuationToken {
    #[must_use]
    pub const fn new(next: EntityKey) -> Self {
        Self { next }
    }

    /// Header values for `x-ms-continuation-NextPartitionKey` and `-NextRowKey`
    #[must_use]
    pub fn encode(&self) -> (String, String) {
        (
            encode_segment(&self.next.partition_key),
            encode_segment(&self.next.row_key),
        )
    }

    /// Rebuild a token from the query parameters a client echoes back.
    /// A missing row key resumes at the start of the partition.
    pub fn decode(next_partition_key: &str, next_row_key: Option<&str>) -> Result<Self> {
        let partition_key = decode_segment(next_partition_key)?;
        let row_key = next_row_key.map(decode_segment).transpose()?.unwrap_or_default();
        Ok(Self {
            next: EntityKey::new(partition_key, row_key)?,
        })
    }
}

/// Encode one continuation component
#[must_use]
pub fn encode_segment(value: &str) -> String {
    let encoded = BASE64.encode(value.as_bytes());
    format!("{VERSION}!{}!{encoded}", encoded.len())
}

/// Decode one continuation component
pub fn decode_segment(token: &str) -> Result<String> {
    let invalid = || Error::invalid_input(format!("malformed continuation token: {token}"));

    let mut parts = token.splitn(3, '!');
    let (Some(VERSION), Some(len), Some(body)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    if len.parse::<usize>().ok() != Some(body.len()) {
        return Err(invalid());
    }
    let bytes = BASE64.decode(body).map_err(|_| invalid())?;
    String::from_utf8(bytes).map_err(|_| invalid())
}
