// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ops::RangeInclusive;
use std::sync::Arc;

use apm_codec::span::{Span, TransactionId};
use apm_codec::stat::{AgentStatDecodingContext, AgentStatType};
use apm_codec::{ReadBuffer, WriteBuffer};
use tracing::debug;

use crate::agent_id::{AGENT_ID_MAX_LEN, APPLICATION_NAME_MAX_LEN};
use crate::distributor::{RangeOneByteSimpleHash, RowKeyDistributor, RowKeyDistributorByHashPrefix};
use crate::errors::RowKeyError;
use crate::fuzzy::{FuzzyRowKeyFactory, OneByteFuzzyRowKeyFactory};
use crate::time;

/// Derives the storage key of a value.
///
/// Implementations are pure: the key depends only on `value`, so a retried write lands on the
/// same row.
pub trait RowKeyEncoder<T: ?Sized> {
    fn encode_row_key(&self, value: &T) -> Result<Vec<u8>, RowKeyError>;
}

pub const TRANSACTION_ID_KEY_LEN: usize = AGENT_ID_MAX_LEN + 8 + 8;

/// Keys trace rows by transaction id.
///
/// The prefix is hashed from the sequence bytes only: one agent produces consecutive sequences,
/// which would otherwise all sort into the same region.
pub struct TransactionIdRowKeyEncoder {
    distributor: Arc<dyn RowKeyDistributor>,
}

impl TransactionIdRowKeyEncoder {
    pub fn new(distributor: Arc<dyn RowKeyDistributor>) -> Self {
        TransactionIdRowKeyEncoder { distributor }
    }

    /// Distributor hashing the sequence bytes of a transaction id key into `bucket_count`
    /// buckets.
    pub fn sequence_distributor(bucket_count: usize) -> Result<Arc<dyn RowKeyDistributor>, RowKeyError> {
        let hash = RangeOneByteSimpleHash::new(
            AGENT_ID_MAX_LEN + 8..TRANSACTION_ID_KEY_LEN,
            bucket_count,
        )?;
        Ok(Arc::new(RowKeyDistributorByHashPrefix::new(hash)))
    }

    pub fn decode_row_key(&self, key: &[u8]) -> Result<TransactionId, RowKeyError> {
        let original = self.distributor.original_key(key);
        if original.len() != TRANSACTION_ID_KEY_LEN {
            return Err(RowKeyError::InvalidKeyLength {
                expected: TRANSACTION_ID_KEY_LEN,
                actual: original.len(),
            });
        }
        let mut buf = ReadBuffer::new(original);
        Ok(TransactionId {
            agent_id: buf.read_pad_string_and_right_trim(AGENT_ID_MAX_LEN)?,
            agent_start_time: buf.read_i64()?,
            sequence: buf.read_i64()?,
        })
    }
}

impl RowKeyEncoder<TransactionId> for TransactionIdRowKeyEncoder {
    fn encode_row_key(&self, value: &TransactionId) -> Result<Vec<u8>, RowKeyError> {
        let mut buf = WriteBuffer::with_capacity(TRANSACTION_ID_KEY_LEN);
        buf.put_pad_string(&value.agent_id, AGENT_ID_MAX_LEN)?;
        buf.put_i64(value.agent_start_time);
        buf.put_i64(value.sequence);
        Ok(self.distributor.distributed_key(buf.as_slice()))
    }
}

/// Keys the per-application trace index, most recent first, with the elapsed slot last so
/// readers can restrict a scan to slow traces.
pub struct ApplicationTraceIndexRowKeyEncoder {
    distributor: Arc<dyn RowKeyDistributor>,
    fuzzy: OneByteFuzzyRowKeyFactory,
}

pub const TRACE_INDEX_KEY_LEN: usize = APPLICATION_NAME_MAX_LEN + 8 + 1;

/// Natural key of a trace index row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIndexRowKey {
    pub application_name: String,
    pub accepted_time: i64,
    pub elapsed_slot: u8,
}

impl ApplicationTraceIndexRowKeyEncoder {
    pub fn new(distributor: Arc<dyn RowKeyDistributor>) -> Self {
        ApplicationTraceIndexRowKeyEncoder {
            distributor,
            fuzzy: OneByteFuzzyRowKeyFactory,
        }
    }

    /// Scan prefixes covering every trace of `application_name`, one per bucket. Each bucket
    /// scans most recent first; readers merge the buckets on the original key.
    pub fn scan_prefixes(&self, application_name: &str) -> Result<Vec<Vec<u8>>, RowKeyError> {
        let mut buf = WriteBuffer::with_capacity(APPLICATION_NAME_MAX_LEN);
        buf.put_pad_string(application_name, APPLICATION_NAME_MAX_LEN)?;
        Ok(self.distributor.all_distributed_keys(buf.as_slice()))
    }

    /// Elapsed slots a trace taking `min..=max` millis can be indexed under.
    pub fn elapsed_slots(&self, min: i64, max: i64) -> RangeInclusive<u8> {
        self.fuzzy.keys_in_range(min, max)
    }

    /// The key without its distribution prefix, which orders rows across buckets.
    pub fn original_key<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        self.distributor.original_key(key)
    }

    pub fn decode_row_key(&self, key: &[u8]) -> Result<TraceIndexRowKey, RowKeyError> {
        let original = self.distributor.original_key(key);
        if original.len() != TRACE_INDEX_KEY_LEN {
            return Err(RowKeyError::InvalidKeyLength {
                expected: TRACE_INDEX_KEY_LEN,
                actual: original.len(),
            });
        }
        let mut buf = ReadBuffer::new(original);
        Ok(TraceIndexRowKey {
            application_name: buf.read_pad_string_and_right_trim(APPLICATION_NAME_MAX_LEN)?,
            accepted_time: time::restore(buf.read_i64()?)?,
            elapsed_slot: buf.read_u8()?,
        })
    }

    pub fn new_row_key(
        &self,
        application_name: &str,
        accepted_time: i64,
        fuzzy_key: u8,
    ) -> Result<Vec<u8>, RowKeyError> {
        let mut buf = WriteBuffer::with_capacity(TRACE_INDEX_KEY_LEN);
        buf.put_pad_string(application_name, APPLICATION_NAME_MAX_LEN)?;
        buf.put_bytes(&time::inverted_bytes(accepted_time)?);
        buf.put_u8(fuzzy_key);
        Ok(buf.into_vec())
    }
}

impl RowKeyEncoder<Span> for ApplicationTraceIndexRowKeyEncoder {
    fn encode_row_key(&self, span: &Span) -> Result<Vec<u8>, RowKeyError> {
        let fuzzy_key = self.fuzzy.key(i64::from(span.elapsed));
        debug!("Fuzzy slot {} for elapsed {}", fuzzy_key, span.elapsed);
        let key = self.new_row_key(&span.application_name, span.collector_accept_time, fuzzy_key)?;
        Ok(self.distributor.distributed_key(&key))
    }
}

/// Natural key of an agent stat row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatRowKey {
    pub agent_id: String,
    pub stat_type: AgentStatType,
    /// Row base timestamp, aligned to the stat timespan.
    pub base_timestamp: i64,
}

impl AgentStatRowKey {
    pub fn from_context(stat_type: AgentStatType, ctx: &AgentStatDecodingContext) -> Self {
        AgentStatRowKey {
            agent_id: ctx.agent_id.clone(),
            stat_type,
            base_timestamp: ctx.base_timestamp,
        }
    }
}

pub const AGENT_STAT_KEY_LEN: usize = AGENT_ID_MAX_LEN + 1 + 8;

/// Keys agent stat rows as `agent id | stat type | inverted base timestamp`.
pub struct AgentStatRowKeyEncoder {
    distributor: Arc<dyn RowKeyDistributor>,
}

impl AgentStatRowKeyEncoder {
    pub fn new(distributor: Arc<dyn RowKeyDistributor>) -> Self {
        AgentStatRowKeyEncoder { distributor }
    }

    pub fn decode_row_key(&self, key: &[u8]) -> Result<AgentStatRowKey, RowKeyError> {
        let original = self.distributor.original_key(key);
        if original.len() != AGENT_STAT_KEY_LEN {
            return Err(RowKeyError::InvalidKeyLength {
                expected: AGENT_STAT_KEY_LEN,
                actual: original.len(),
            });
        }
        let mut buf = ReadBuffer::new(original);
        let agent_id = buf.read_pad_string_and_right_trim(AGENT_ID_MAX_LEN)?;
        let stat_type = AgentStatType::from_code(buf.read_u8()?)?;
        let base_timestamp = time::restore(buf.read_i64()?)?;
        Ok(AgentStatRowKey {
            agent_id,
            stat_type,
            base_timestamp,
        })
    }

    /// Decoding context for a cell of the row at `key` whose first point is `timestamp_delta`
    /// millis after the row base.
    pub fn decoding_context(
        &self,
        key: &[u8],
        timestamp_delta: i64,
    ) -> Result<AgentStatDecodingContext, RowKeyError> {
        let row_key = self.decode_row_key(key)?;
        Ok(AgentStatDecodingContext {
            agent_id: row_key.agent_id,
            base_timestamp: row_key.base_timestamp,
            timestamp_delta,
        })
    }
}

impl RowKeyEncoder<AgentStatRowKey> for AgentStatRowKeyEncoder {
    fn encode_row_key(&self, value: &AgentStatRowKey) -> Result<Vec<u8>, RowKeyError> {
        let mut buf = WriteBuffer::with_capacity(AGENT_STAT_KEY_LEN);
        buf.put_pad_string(&value.agent_id, AGENT_ID_MAX_LEN)?;
        buf.put_u8(value.stat_type.code());
        buf.put_bytes(&time::inverted_bytes(value.base_timestamp)?);
        Ok(self.distributor.distributed_key(buf.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::OneByteSimpleHash;

    fn distributor(buckets: usize) -> Arc<dyn RowKeyDistributor> {
        Arc::new(RowKeyDistributorByHashPrefix::new(
            OneByteSimpleHash::new(buckets).unwrap(),
        ))
    }

    #[test]
    fn test_transaction_id_key_round_trip() {
        let encoder =
            TransactionIdRowKeyEncoder::new(TransactionIdRowKeyEncoder::sequence_distributor(64).unwrap());
        let id = TransactionId::new("agent-1", 1_700_000_000_000, 42);
        let key = encoder.encode_row_key(&id).unwrap();
        assert_eq!(key.len(), TRANSACTION_ID_KEY_LEN + 1);
        assert!(key[0] < 64);
        assert_eq!(encoder.decode_row_key(&key).unwrap(), id);
    }

    #[test]
    fn test_trace_index_key_layout() {
        let encoder = ApplicationTraceIndexRowKeyEncoder::new(distributor(1));
        let span = Span {
            application_name: "checkout".into(),
            collector_accept_time: 1_700_000_000_000,
            elapsed: 1_500,
            ..Default::default()
        };
        let key = encoder.encode_row_key(&span).unwrap();
        assert_eq!(key[0], 0);
        assert_eq!(key.len(), 1 + APPLICATION_NAME_MAX_LEN + 8 + 1);
        assert_eq!(key[key.len() - 1], OneByteFuzzyRowKeyFactory.key(1_500));
    }

    #[test]
    fn test_trace_index_scan_prefixes_cover_every_bucket() {
        let encoder = ApplicationTraceIndexRowKeyEncoder::new(distributor(8));
        let span = Span {
            application_name: "checkout".into(),
            collector_accept_time: 1_700_000_000_000,
            elapsed: 250,
            ..Default::default()
        };
        let key = encoder.encode_row_key(&span).unwrap();
        let prefixes = encoder.scan_prefixes("checkout").unwrap();
        assert_eq!(prefixes.len(), 8);
        assert_eq!(prefixes.iter().filter(|p| key.starts_with(p)).count(), 1);
        assert!(!prefixes
            .iter()
            .any(|p| encoder.encode_row_key(&Span {
                application_name: "checkout-v2".into(),
                ..span.clone()
            })
            .unwrap()
            .starts_with(p)));

        let decoded = encoder.decode_row_key(&key).unwrap();
        assert_eq!(
            decoded,
            TraceIndexRowKey {
                application_name: "checkout".into(),
                accepted_time: 1_700_000_000_000,
                elapsed_slot: OneByteFuzzyRowKeyFactory.key(250),
            }
        );
        assert!(encoder.elapsed_slots(200, 300).contains(&decoded.elapsed_slot));
        assert!(!encoder.elapsed_slots(1_000, 5_000).contains(&decoded.elapsed_slot));
    }

    #[test]
    fn test_trace_index_rejects_negative_accept_time() {
        let encoder = ApplicationTraceIndexRowKeyEncoder::new(distributor(4));
        let span = Span {
            application_name: "checkout".into(),
            collector_accept_time: -1,
            ..Default::default()
        };
        assert_eq!(
            encoder.encode_row_key(&span),
            Err(RowKeyError::NegativeTimestamp(-1))
        );
    }

    #[test]
    fn test_agent_stat_key_decodes_to_context() {
        let encoder = AgentStatRowKeyEncoder::new(distributor(32));
        let row_key = AgentStatRowKey {
            agent_id: "agent-1".into(),
            stat_type: AgentStatType::JvmGc,
            base_timestamp: 1_700_000_040_000,
        };
        let key = encoder.encode_row_key(&row_key).unwrap();
        assert_eq!(encoder.decode_row_key(&key).unwrap(), row_key);

        let ctx = encoder.decoding_context(&key, 25_000).unwrap();
        assert_eq!(ctx.agent_id, "agent-1");
        assert_eq!(ctx.initial_timestamp(), 1_700_000_065_000);
    }
}
