// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-byte salt prefixes that spread sequential keys over storage regions.
//!
//! The bucket count is part of the stored key layout. Readers enumerate every bucket with
//! [`RowKeyDistributor::all_distributed_keys`] and merge the per-bucket scans, so changing the
//! count after data has been written orphans the existing rows.

use std::hash::Hasher;
use std::ops::Range;

use fnv::FnvHasher;

use crate::errors::RowKeyError;

pub const MAX_BUCKETS: usize = 256;

fn fnv_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

fn check_bucket_count(bucket_count: usize) -> Result<u16, RowKeyError> {
    if bucket_count == 0 || bucket_count > MAX_BUCKETS {
        return Err(RowKeyError::InvalidBucketCount(bucket_count));
    }
    // Bounded by MAX_BUCKETS above.
    Ok(bucket_count as u16)
}

/// Derives the prefix byte for a key.
pub trait PrefixHash: Send + Sync {
    fn prefix(&self, original_key: &[u8]) -> u8;

    fn bucket_count(&self) -> usize;
}

/// Hashes the whole key.
#[derive(Debug, Clone, Copy)]
pub struct OneByteSimpleHash {
    bucket_count: u16,
}

impl OneByteSimpleHash {
    pub fn new(bucket_count: usize) -> Result<Self, RowKeyError> {
        Ok(OneByteSimpleHash {
            bucket_count: check_bucket_count(bucket_count)?,
        })
    }
}

impl PrefixHash for OneByteSimpleHash {
    fn prefix(&self, original_key: &[u8]) -> u8 {
        (fnv_hash(original_key) % u64::from(self.bucket_count)) as u8
    }

    fn bucket_count(&self) -> usize {
        usize::from(self.bucket_count)
    }
}

/// Hashes only `range` of the key, so keys sharing those bytes land in the same bucket.
///
/// The range is clamped to the key length.
#[derive(Debug, Clone)]
pub struct RangeOneByteSimpleHash {
    range: Range<usize>,
    bucket_count: u16,
}

impl RangeOneByteSimpleHash {
    pub fn new(range: Range<usize>, bucket_count: usize) -> Result<Self, RowKeyError> {
        Ok(RangeOneByteSimpleHash {
            range,
            bucket_count: check_bucket_count(bucket_count)?,
        })
    }
}

impl PrefixHash for RangeOneByteSimpleHash {
    fn prefix(&self, original_key: &[u8]) -> u8 {
        let end = self.range.end.min(original_key.len());
        let start = self.range.start.min(end);
        (fnv_hash(&original_key[start..end]) % u64::from(self.bucket_count)) as u8
    }

    fn bucket_count(&self) -> usize {
        usize::from(self.bucket_count)
    }
}

pub trait RowKeyDistributor: Send + Sync {
    /// Prepends the distribution prefix.
    fn distributed_key(&self, original_key: &[u8]) -> Vec<u8>;

    /// Strips the distribution prefix.
    fn original_key<'a>(&self, distributed_key: &'a [u8]) -> &'a [u8];

    /// `original_key` under every prefix, for scans that must visit all buckets.
    fn all_distributed_keys(&self, original_key: &[u8]) -> Vec<Vec<u8>>;

    fn bucket_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RowKeyDistributorByHashPrefix<H> {
    hash: H,
}

impl<H: PrefixHash> RowKeyDistributorByHashPrefix<H> {
    pub fn new(hash: H) -> Self {
        RowKeyDistributorByHashPrefix { hash }
    }

    fn with_prefix(prefix: u8, original_key: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(original_key.len() + 1);
        key.push(prefix);
        key.extend_from_slice(original_key);
        key
    }
}

impl<H: PrefixHash> RowKeyDistributor for RowKeyDistributorByHashPrefix<H> {
    fn distributed_key(&self, original_key: &[u8]) -> Vec<u8> {
        Self::with_prefix(self.hash.prefix(original_key), original_key)
    }

    fn original_key<'a>(&self, distributed_key: &'a [u8]) -> &'a [u8] {
        distributed_key.get(1..).unwrap_or_default()
    }

    fn all_distributed_keys(&self, original_key: &[u8]) -> Vec<Vec<u8>> {
        (0..self.hash.bucket_count())
            .map(|prefix| Self::with_prefix(prefix as u8, original_key))
            .collect()
    }

    fn bucket_count(&self) -> usize {
        self.hash.bucket_count()
    }
}
