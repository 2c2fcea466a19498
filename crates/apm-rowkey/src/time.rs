// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::RowKeyError;

/// Maps `timestamp` so that ascending byte order is descending time.
pub fn invert(timestamp: i64) -> Result<i64, RowKeyError> {
    if timestamp < 0 {
        return Err(RowKeyError::NegativeTimestamp(timestamp));
    }
    Ok(i64::MAX - timestamp)
}

/// Inverse of [`invert`].
pub fn restore(inverted: i64) -> Result<i64, RowKeyError> {
    if inverted < 0 {
        return Err(RowKeyError::NegativeTimestamp(inverted));
    }
    Ok(i64::MAX - inverted)
}

/// Big-endian bytes of the inverted timestamp, ready to append to a key.
pub fn inverted_bytes(timestamp: i64) -> Result<[u8; 8], RowKeyError> {
    Ok(invert(timestamp)?.to_be_bytes())
}
