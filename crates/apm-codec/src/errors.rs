// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while decoding a single record.
///
/// A decode error is fatal for the record being decoded only. Callers are expected to log and
/// count it, then move on to the next record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The buffer ended before the value could be read.
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },
    /// The leading format version byte is not one this decoder understands.
    #[error("unknown format version {0}")]
    UnknownVersion(u8),
    /// The payload is structurally invalid.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// A type tag or enum code is not recognized.
    #[error("invalid type: {0}")]
    InvalidType(String),
    /// The payload contains non-utf8 strings.
    #[error("failed to read utf8 value: {0}")]
    Utf8Error(String),
}

/// Contract violations detected while encoding.
///
/// These indicate a programming error in the caller and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{0} must not be empty")]
    EmptyBatch(&'static str),
    #[error("mixed agent ids in batch: expected {expected}, found {found}")]
    MixedAgentIds { expected: String, found: String },
    #[error("timestamps must be non-decreasing: {previous} followed by {current}")]
    NonMonotonicTimestamp { previous: i64, current: i64 },
    #[error("value of {len} bytes exceeds fixed width {width}")]
    PadOverflow { len: usize, width: usize },
    #[error("value of {len} bytes exceeds the length prefix limit of {max}")]
    TooLong { len: usize, max: usize },
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
