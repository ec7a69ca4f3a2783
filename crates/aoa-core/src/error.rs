//! Caller-facing error type.

use thiserror::Error;

use crate::identity::IdentityField;
use crate::platform::PlatformError;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Range out of bounds: offset={offset} count={count} len={len}")]
    OutOfRange {
        offset: usize,
        count: usize,
        len: usize,
    },

    #[error("Connection is closed")]
    Closed,

    #[error("Accessory {0} must not be empty")]
    EmptyIdentityField(IdentityField),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Resolve `data[offset..offset + count]` or fail without touching anything.
pub(crate) fn checked_range(
    data: &[u8],
    offset: usize,
    count: usize,
) -> Result<&[u8], ConnectionError> {
    let out_of_range = ConnectionError::OutOfRange {
        offset,
        count,
        len: data.len(),
    };
    match offset.checked_add(count) {
        Some(end) if end <= data.len() => Ok(&data[offset..end]),
        _ => Err(out_of_range),
    }
}
