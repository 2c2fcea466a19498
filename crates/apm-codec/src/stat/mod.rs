// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent runtime statistics and their batch encoding.
//!
//! A batch holds points of a single kind from a single agent. The encoded value never carries
//! the agent id or the first timestamp: both live in the row key and come back through
//! [`AgentStatDecodingContext`].
//!
//! ```text
//! [version=2][vint count]
//! [start timestamps, repeat-count column]
//! [count-1 vlong timestamp deltas]
//! [prefixed strategy header][field columns...]
//! ```

mod kinds;
mod strategy;

use std::fmt::Debug;
use std::marker::PhantomData;

use derive_more::Display;
use tracing::debug;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::errors::{DecodeError, EncodeError};

pub use kinds::{
    CpuLoad, DataSource, FileDescriptor, JvmGc, JvmGcType, LoadedClass, TotalThreadCount,
    UNCOLLECTED,
};
pub use strategy::{
    EncodingStrategy, FieldDecoder, FieldEncoder, HeaderDecoder, HeaderEncoder,
    SignedLongCodec, StrategyAnalyzer, StringCodec, UnsignedLongCodec, ValueCodec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[repr(u8)]
pub enum AgentStatType {
    #[display("jvm_gc")]
    JvmGc = 1,
    #[display("cpu_load")]
    CpuLoad = 2,
    #[display("total_thread_count")]
    TotalThreadCount = 3,
    #[display("file_descriptor")]
    FileDescriptor = 4,
    #[display("loaded_class")]
    LoadedClass = 5,
    #[display("data_source")]
    DataSource = 6,
}

impl AgentStatType {
    pub const ALL: [AgentStatType; 6] = [
        AgentStatType::JvmGc,
        AgentStatType::CpuLoad,
        AgentStatType::TotalThreadCount,
        AgentStatType::FileDescriptor,
        AgentStatType::LoadedClass,
        AgentStatType::DataSource,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Self::ALL
            .into_iter()
            .find(|stat_type| stat_type.code() == code)
            .ok_or_else(|| DecodeError::InvalidType(format!("agent stat type {code}")))
    }
}

/// One sample of kind `T` taken by one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct StatPoint<T> {
    pub agent_id: String,
    /// Start time of the agent process that took the sample.
    pub start_timestamp: i64,
    pub timestamp: i64,
    pub value: T,
}

impl<T> StatPoint<T> {
    pub fn new(agent_id: impl Into<String>, start_timestamp: i64, timestamp: i64, value: T) -> Self {
        StatPoint {
            agent_id: agent_id.into(),
            start_timestamp,
            timestamp,
            value,
        }
    }
}

/// Values the decoder cannot find in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatDecodingContext {
    pub agent_id: String,
    /// Row base timestamp.
    pub base_timestamp: i64,
    /// Offset of the first point from `base_timestamp`.
    pub timestamp_delta: i64,
}

impl AgentStatDecodingContext {
    /// Context for a batch whose first point is at `first_timestamp`, with the base aligned down
    /// to a multiple of `timespan` millis.
    pub fn aligned(
        agent_id: impl Into<String>,
        first_timestamp: i64,
        timespan: i64,
    ) -> Result<Self, EncodeError> {
        if timespan <= 0 {
            return Err(EncodeError::InvalidValue(format!(
                "timespan must be positive, got {timespan}"
            )));
        }
        let base_timestamp = first_timestamp - first_timestamp.rem_euclid(timespan);
        Ok(AgentStatDecodingContext {
            agent_id: agent_id.into(),
            base_timestamp,
            timestamp_delta: first_timestamp - base_timestamp,
        })
    }

    #[must_use]
    pub fn initial_timestamp(&self) -> i64 {
        self.base_timestamp.wrapping_add(self.timestamp_delta)
    }
}

/// A stat kind that can be written column by column.
pub trait AgentStatValue: Clone + Debug + PartialEq + Sized {
    const STAT_TYPE: AgentStatType;

    /// Writes one column per field, in a fixed order.
    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError>;

    /// Reads the columns back in the order `encode_fields` wrote them.
    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError>;
}

/// Batch codec for points of kind `T`.
#[derive(Debug)]
pub struct AgentStatCodec<T>(PhantomData<T>);

impl<T> Default for AgentStatCodec<T> {
    fn default() -> Self {
        AgentStatCodec(PhantomData)
    }
}

impl<T: AgentStatValue> AgentStatCodec<T> {
    pub const VERSION: u8 = 2;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_values(
        &self,
        buf: &mut WriteBuffer,
        points: &[StatPoint<T>],
    ) -> Result<(), EncodeError> {
        let Some(first) = points.first() else {
            return Err(EncodeError::EmptyBatch("stat data points"));
        };
        let mut deltas = Vec::with_capacity(points.len().saturating_sub(1));
        for pair in points.windows(2) {
            let (previous, current) = (pair[0].timestamp, pair[1].timestamp);
            if current < previous {
                return Err(EncodeError::NonMonotonicTimestamp { previous, current });
            }
            let delta = current.checked_sub(previous).ok_or_else(|| {
                EncodeError::InvalidValue(format!(
                    "timestamp delta from {previous} to {current} overflows"
                ))
            })?;
            deltas.push(delta);
        }
        if let Some(other) = points.iter().find(|p| p.agent_id != first.agent_id) {
            return Err(EncodeError::MixedAgentIds {
                expected: first.agent_id.clone(),
                found: other.agent_id.clone(),
            });
        }

        let start_timestamps: Vec<i64> = points.iter().map(|p| p.start_timestamp).collect();
        let values: Vec<&T> = points.iter().map(|p| &p.value).collect();
        let mut fields = FieldEncoder::new();
        T::encode_fields(&values, &mut fields)?;

        buf.put_u8(Self::VERSION);
        buf.put_vint(points.len() as u32);
        EncodingStrategy::RepeatCount.encode::<UnsignedLongCodec>(buf, &start_timestamps)?;
        for delta in deltas {
            buf.put_vlong(delta as u64);
        }
        fields.finish(buf)?;

        debug!(
            "Encoded {} {} points for agent {}",
            points.len(),
            T::STAT_TYPE,
            first.agent_id
        );
        Ok(())
    }

    pub fn decode_values(
        &self,
        buf: &mut ReadBuffer<'_>,
        ctx: &AgentStatDecodingContext,
    ) -> Result<Vec<StatPoint<T>>, DecodeError> {
        let version = buf.read_u8()?;
        if version != Self::VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        let count = buf.read_vint()? as usize;
        // n points carry at least n-1 timestamp delta bytes.
        if count == 0 || count - 1 > buf.remaining() {
            return Err(DecodeError::InvalidFormat(format!(
                "stat point count {count} with {} bytes remaining",
                buf.remaining()
            )));
        }

        let start_timestamps = EncodingStrategy::RepeatCount.decode::<UnsignedLongCodec>(buf, count)?;
        let mut timestamps = Vec::with_capacity(count);
        let mut timestamp = ctx.initial_timestamp();
        timestamps.push(timestamp);
        for _ in 1..count {
            timestamp = timestamp.wrapping_add(buf.read_vlong()? as i64);
            timestamps.push(timestamp);
        }

        let header = buf
            .read_prefixed_bytes()?
            .ok_or_else(|| DecodeError::InvalidFormat("missing stat header".into()))?;
        let mut fields = FieldDecoder::new(header, buf, count);
        let values = T::decode_fields(&mut fields)?;

        Ok(start_timestamps
            .into_iter()
            .zip(timestamps)
            .zip(values)
            .map(|((start_timestamp, timestamp), value)| StatPoint {
                agent_id: ctx.agent_id.clone(),
                start_timestamp,
                timestamp,
                value,
            })
            .collect())
    }
}

/// A homogeneous batch of any stat kind.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStatBatch {
    JvmGc(Vec<StatPoint<JvmGc>>),
    CpuLoad(Vec<StatPoint<CpuLoad>>),
    TotalThreadCount(Vec<StatPoint<TotalThreadCount>>),
    FileDescriptor(Vec<StatPoint<FileDescriptor>>),
    LoadedClass(Vec<StatPoint<LoadedClass>>),
    DataSource(Vec<StatPoint<DataSource>>),
}

fn first_point<T>(points: &[StatPoint<T>]) -> Option<(&str, i64)> {
    points.first().map(|p| (p.agent_id.as_str(), p.timestamp))
}

impl AgentStatBatch {
    #[must_use]
    pub fn stat_type(&self) -> AgentStatType {
        match self {
            AgentStatBatch::JvmGc(_) => AgentStatType::JvmGc,
            AgentStatBatch::CpuLoad(_) => AgentStatType::CpuLoad,
            AgentStatBatch::TotalThreadCount(_) => AgentStatType::TotalThreadCount,
            AgentStatBatch::FileDescriptor(_) => AgentStatType::FileDescriptor,
            AgentStatBatch::LoadedClass(_) => AgentStatType::LoadedClass,
            AgentStatBatch::DataSource(_) => AgentStatType::DataSource,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            AgentStatBatch::JvmGc(points) => points.len(),
            AgentStatBatch::CpuLoad(points) => points.len(),
            AgentStatBatch::TotalThreadCount(points) => points.len(),
            AgentStatBatch::FileDescriptor(points) => points.len(),
            AgentStatBatch::LoadedClass(points) => points.len(),
            AgentStatBatch::DataSource(points) => points.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agent id and timestamp of the first point, `None` for an empty batch.
    #[must_use]
    pub fn first(&self) -> Option<(&str, i64)> {
        match self {
            AgentStatBatch::JvmGc(points) => first_point(points),
            AgentStatBatch::CpuLoad(points) => first_point(points),
            AgentStatBatch::TotalThreadCount(points) => first_point(points),
            AgentStatBatch::FileDescriptor(points) => first_point(points),
            AgentStatBatch::LoadedClass(points) => first_point(points),
            AgentStatBatch::DataSource(points) => first_point(points),
        }
    }

    pub fn encode_values(&self, buf: &mut WriteBuffer) -> Result<(), EncodeError> {
        match self {
            AgentStatBatch::JvmGc(points) => AgentStatCodec::new().encode_values(buf, points),
            AgentStatBatch::CpuLoad(points) => AgentStatCodec::new().encode_values(buf, points),
            AgentStatBatch::TotalThreadCount(points) => {
                AgentStatCodec::new().encode_values(buf, points)
            }
            AgentStatBatch::FileDescriptor(points) => {
                AgentStatCodec::new().encode_values(buf, points)
            }
            AgentStatBatch::LoadedClass(points) => AgentStatCodec::new().encode_values(buf, points),
            AgentStatBatch::DataSource(points) => AgentStatCodec::new().encode_values(buf, points),
        }
    }

    pub fn decode_values(
        stat_type: AgentStatType,
        buf: &mut ReadBuffer<'_>,
        ctx: &AgentStatDecodingContext,
    ) -> Result<Self, DecodeError> {
        Ok(match stat_type {
            AgentStatType::JvmGc => AgentStatBatch::JvmGc(AgentStatCodec::new().decode_values(buf, ctx)?),
            AgentStatType::CpuLoad => {
                AgentStatBatch::CpuLoad(AgentStatCodec::new().decode_values(buf, ctx)?)
            }
            AgentStatType::TotalThreadCount => {
                AgentStatBatch::TotalThreadCount(AgentStatCodec::new().decode_values(buf, ctx)?)
            }
            AgentStatType::FileDescriptor => {
                AgentStatBatch::FileDescriptor(AgentStatCodec::new().decode_values(buf, ctx)?)
            }
            AgentStatType::LoadedClass => {
                AgentStatBatch::LoadedClass(AgentStatCodec::new().decode_values(buf, ctx)?)
            }
            AgentStatType::DataSource => {
                AgentStatBatch::DataSource(AgentStatCodec::new().decode_values(buf, ctx)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const AGENT: &str = "agent-1";
    const START: i64 = 1_700_000_000_000;

    fn round_trip<T: AgentStatValue>(points: &[StatPoint<T>]) -> Vec<StatPoint<T>> {
        let codec = AgentStatCodec::<T>::new();
        let mut buf = WriteBuffer::new();
        codec.encode_values(&mut buf, points).unwrap();
        let bytes = buf.freeze();
        let ctx = AgentStatDecodingContext::aligned(AGENT, points[0].timestamp, 60_000).unwrap();
        let mut reader = ReadBuffer::new(&bytes);
        let decoded = codec.decode_values(&mut reader, &ctx).unwrap();
        assert!(!reader.has_remaining());
        decoded
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let mut buf = WriteBuffer::new();
        assert_eq!(
            AgentStatCodec::<TotalThreadCount>::new().encode_values(&mut buf, &[]),
            Err(EncodeError::EmptyBatch("stat data points"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mixed_agent_ids_are_rejected() {
        let points = vec![
            StatPoint::new(AGENT, START, START + 5_000, TotalThreadCount::default()),
            StatPoint::new("agent-2", START, START + 10_000, TotalThreadCount::default()),
        ];
        let mut buf = WriteBuffer::new();
        assert!(matches!(
            AgentStatCodec::new().encode_values(&mut buf, &points),
            Err(EncodeError::MixedAgentIds { .. })
        ));
    }

    #[test]
    fn test_decreasing_timestamps_are_rejected() {
        let points = vec![
            StatPoint::new(AGENT, START, START + 10_000, TotalThreadCount::default()),
            StatPoint::new(AGENT, START, START + 5_000, TotalThreadCount::default()),
        ];
        let mut buf = WriteBuffer::new();
        assert_eq!(
            AgentStatCodec::new().encode_values(&mut buf, &points),
            Err(EncodeError::NonMonotonicTimestamp {
                previous: START + 10_000,
                current: START + 5_000
            })
        );
    }

    #[test]
    fn test_overflowing_timestamp_delta_is_rejected() {
        let points = vec![
            StatPoint::new(AGENT, START, i64::MIN, TotalThreadCount::default()),
            StatPoint::new(AGENT, START, i64::MAX, TotalThreadCount::default()),
        ];
        let mut buf = WriteBuffer::new();
        assert!(matches!(
            AgentStatCodec::new().encode_values(&mut buf, &points),
            Err(EncodeError::InvalidValue(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_jvm_gc_round_trip() {
        let points: Vec<_> = (0..6)
            .map(|i| {
                StatPoint::new(
                    AGENT,
                    START,
                    START + 5_000 * i,
                    JvmGc {
                        gc_type: JvmGcType::G1,
                        heap_used: 1_000 + i,
                        heap_max: 4_096,
                        non_heap_used: UNCOLLECTED,
                        non_heap_max: UNCOLLECTED,
                        gc_old_count: i / 2,
                        gc_old_time: 10 * (i / 2),
                    },
                )
            })
            .collect();
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn test_cpu_load_round_trip_with_uncollected() {
        let points = vec![
            StatPoint::new(AGENT, START, START + 1_000, CpuLoad {
                jvm_cpu_load: 0.25,
                system_cpu_load: -1.0,
            }),
            StatPoint::new(AGENT, START, START + 6_000, CpuLoad {
                jvm_cpu_load: 0.5,
                system_cpu_load: 0.875,
            }),
        ];
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn test_data_source_round_trip() {
        let points = vec![
            StatPoint::new(AGENT, START, START + 1_000, DataSource {
                id: 1,
                service_type_code: 6050,
                database_name: Some("orders".into()),
                jdbc_url: Some("jdbc:mysql://db:3306/orders".into()),
                active_connection_size: 3,
                max_connection_size: 10,
            }),
            StatPoint::new(AGENT, START, START + 6_000, DataSource {
                id: 1,
                service_type_code: 6050,
                database_name: None,
                jdbc_url: None,
                active_connection_size: -1,
                max_connection_size: 10,
            }),
        ];
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn test_all_equal_timestamps() {
        let points: Vec<_> = (0..4)
            .map(|i| {
                StatPoint::new(AGENT, START, START + 5_000, LoadedClass {
                    loaded_class_count: 100 + i,
                    unloaded_class_count: 0,
                })
            })
            .collect();
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let points = vec![StatPoint::new(AGENT, START, START, FileDescriptor::default())];
        let mut buf = WriteBuffer::new();
        AgentStatCodec::new().encode_values(&mut buf, &points).unwrap();
        let mut bytes = buf.into_vec();
        bytes[0] = 1;
        let ctx = AgentStatDecodingContext::aligned(AGENT, START, 60_000).unwrap();
        assert_eq!(
            AgentStatCodec::<FileDescriptor>::new().decode_values(&mut ReadBuffer::new(&bytes), &ctx),
            Err(DecodeError::UnknownVersion(1))
        );
    }

    #[test]
    fn test_absurd_count_is_rejected() {
        let mut buf = WriteBuffer::new();
        buf.put_u8(2);
        buf.put_vint(1_000_000);
        let bytes = buf.freeze();
        let ctx = AgentStatDecodingContext::aligned(AGENT, START, 60_000).unwrap();
        assert!(matches!(
            AgentStatCodec::<FileDescriptor>::new().decode_values(&mut ReadBuffer::new(&bytes), &ctx),
            Err(DecodeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_aligned_context() {
        let ctx = AgentStatDecodingContext::aligned(AGENT, 1_700_000_123_456, 60_000).unwrap();
        assert_eq!(ctx.base_timestamp, 1_700_000_100_000);
        assert_eq!(ctx.timestamp_delta, 23_456);
        assert_eq!(ctx.initial_timestamp(), 1_700_000_123_456);
        assert!(AgentStatDecodingContext::aligned(AGENT, 0, 0).is_err());
    }

    #[test]
    fn test_stat_type_codes() {
        for stat_type in AgentStatType::ALL {
            assert_eq!(AgentStatType::from_code(stat_type.code()).unwrap(), stat_type);
        }
        assert!(AgentStatType::from_code(0).is_err());
        assert_eq!(AgentStatType::CpuLoad.to_string(), "cpu_load");
    }

    proptest! {
        #[test]
        fn prop_timestamps_survive_delta_encoding(
            first in 0i64..4_000_000_000_000,
            deltas in prop::collection::vec(0i64..100_000, 0..50),
        ) {
            let mut timestamp = first;
            let mut points = vec![StatPoint::new(AGENT, START, first, TotalThreadCount { total_thread_count: 1 })];
            for (i, delta) in deltas.iter().enumerate() {
                timestamp += delta;
                points.push(StatPoint::new(AGENT, START, timestamp, TotalThreadCount {
                    total_thread_count: i as i64,
                }));
            }
            prop_assert_eq!(round_trip(&points), points);
        }
    }
}
