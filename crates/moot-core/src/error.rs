//! Error types for moot-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// moot-core error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Key blob cannot be parsed into a usable key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Input ended before the announced structure was complete
    #[error("truncated input at offset {0}")]
    Truncated(usize),

    /// Unknown encoding tag byte
    #[error("unknown tag byte 0x{0:02x} at offset {1}")]
    UnknownTag(u8, usize),

    /// A declared length exceeds the decoder limit
    #[error("oversize length {0}")]
    OversizeLength(u64),

    /// A map carries the same key twice
    #[error("duplicate map key")]
    DuplicateKey,

    /// Text element is not valid UTF-8
    #[error("invalid utf-8 in text element")]
    InvalidText,

    /// Bloom filter holds more items than its configured capacity
    #[error("bloom filter saturated: {count} items exceed capacity {capacity}")]
    Saturated { count: usize, capacity: usize },

    /// Serialized Bloom filter is malformed
    #[error("malformed bloom filter: {0}")]
    MalformedFilter(String),
}
