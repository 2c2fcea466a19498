// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_codec::{DecodeError, EncodeError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowKeyError {
    /// Inverting a negative timestamp would break descending scan order.
    #[error("timestamp {0} is negative")]
    NegativeTimestamp(i64),
    #[error("bucket count must be between 1 and 256, got {0}")]
    InvalidBucketCount(usize),
    #[error("row key has {actual} bytes, expected {expected}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
