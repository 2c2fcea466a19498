// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_codec::message::MessageKind;
use apm_codec::DecodeError;
use apm_rowkey::RowKeyError;

/// Failure of a store write. Stores are external, so the cause is carried as text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store write failed: {0}")]
pub struct StoreError(pub String);

/// Why one frame could not be ingested. The connection it came from stays open.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    RowKey(#[from] RowKeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} frames are not accepted on this connection")]
    UnexpectedKind(MessageKind),
}

impl CollectorError {
    /// The frame itself was bad, as opposed to the collector failing to store it.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, CollectorError::Decode(_) | CollectorError::UnexpectedKind(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be between 1 and 256, got {value}")]
    InvalidBucketCount { name: &'static str, value: String },
    #[error("{name} must be a positive number of millis, got {value}")]
    InvalidTimespan { name: &'static str, value: String },
}
