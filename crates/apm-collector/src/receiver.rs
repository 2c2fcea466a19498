// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use apm_codec::message::{
    Ack, AgentInfo, ApiMetaData, MessageKind, SpanEnvelope, SqlMetaData, StatEnvelope,
    StringMetaData,
};
use apm_codec::span::SpanRecord;
use apm_codec::DecodeError;
use apm_rowkey::agent_id::AgentIdRowKey;
use apm_rowkey::{
    AgentStatRowKey, AgentStatRowKeyEncoder, ApplicationTraceIndexRowKeyEncoder, OneByteSimpleHash,
    RowKeyEncoder, RowKeyError, RowKeyDistributorByHashPrefix, TransactionIdRowKeyEncoder,
};
use apm_transport::Frame;
use tracing::{debug, warn};

use crate::config::CollectorConfig;
use crate::errors::CollectorError;
use crate::store::{AgentStatStore, MetadataStore, TraceStore};

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[derive(Debug, Default)]
pub struct ReceiverCounters {
    received: AtomicU64,
    decode_errors: AtomicU64,
    store_errors: AtomicU64,
}

impl ReceiverCounters {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }
}

/// Turns frames into store writes.
///
/// Span records are stamped with the collector clock on arrival; their row keys, and the index
/// key of root spans, are derived from the decoded record. Stat batches are keyed by the row
/// their first point falls in. Agent registrations are indexed under the configured service uid.
pub struct CollectorReceiver {
    traces: Arc<dyn TraceStore>,
    agent_stats: Arc<dyn AgentStatStore>,
    metadata: Arc<dyn MetadataStore>,
    transaction_keys: TransactionIdRowKeyEncoder,
    trace_index_keys: ApplicationTraceIndexRowKeyEncoder,
    agent_stat_keys: AgentStatRowKeyEncoder,
    stat_timespan_ms: i64,
    service_uid: i32,
    clock: Clock,
    counters: ReceiverCounters,
}

impl CollectorReceiver {
    pub fn new(
        config: &CollectorConfig,
        traces: Arc<dyn TraceStore>,
        agent_stats: Arc<dyn AgentStatStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self, RowKeyError> {
        let hash_prefix = |buckets| -> Result<_, RowKeyError> {
            Ok(Arc::new(RowKeyDistributorByHashPrefix::new(OneByteSimpleHash::new(buckets)?)))
        };
        Ok(CollectorReceiver {
            traces,
            agent_stats,
            metadata,
            transaction_keys: TransactionIdRowKeyEncoder::new(
                TransactionIdRowKeyEncoder::sequence_distributor(config.trace_buckets)?,
            ),
            trace_index_keys: ApplicationTraceIndexRowKeyEncoder::new(hash_prefix(
                config.index_buckets,
            )?),
            agent_stat_keys: AgentStatRowKeyEncoder::new(hash_prefix(config.stat_buckets)?),
            stat_timespan_ms: config.stat_timespan_ms,
            service_uid: config.service_uid,
            clock: Arc::new(system_clock),
            counters: ReceiverCounters::default(),
        })
    }

    /// Replaces the wall clock used to stamp accept times.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn counters(&self) -> &ReceiverCounters {
        &self.counters
    }

    pub fn transaction_keys(&self) -> &TransactionIdRowKeyEncoder {
        &self.transaction_keys
    }

    pub fn agent_stat_keys(&self) -> &AgentStatRowKeyEncoder {
        &self.agent_stat_keys
    }

    /// Ingests one streamed frame. Errors are counted and logged here, callers only decide
    /// whether to keep reading.
    pub async fn handle(&self, frame: Frame) -> Result<(), CollectorError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let kind = frame.kind;
        let result = match kind {
            MessageKind::Span | MessageKind::SpanChunk => self.handle_span(&frame.payload).await,
            MessageKind::AgentStatBatch => self.handle_agent_stat(&frame.payload).await,
            other => Err(CollectorError::UnexpectedKind(other)),
        };
        if let Err(e) = &result {
            self.record_error(kind, e);
        }
        result
    }

    /// Ingests one metadata request and builds the answer for the agent.
    pub async fn handle_request(&self, request_id: u64, frame: Frame) -> Ack {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let result = self.handle_metadata(&frame).await;
        if let Err(e) = &result {
            self.record_error(frame.kind, e);
        }
        Ack {
            request_id,
            success: result.is_ok(),
        }
    }

    /// Counts a frame too broken to tell what it carries.
    pub fn record_unreadable(&self, peer: SocketAddr, e: &DecodeError) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping unreadable frame from {}: {}", peer, e);
    }

    fn record_error(&self, kind: MessageKind, e: &CollectorError) {
        if e.is_decode_error() {
            self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping undecodable {} frame: {}", kind, e);
        } else {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to store {} frame: {}", kind, e);
        }
    }

    async fn handle_span(&self, payload: &[u8]) -> Result<(), CollectorError> {
        let envelope = SpanEnvelope::decode(payload)?;
        let mut record = envelope.decode_record()?;
        let accept_time = (self.clock)();
        let index = match &mut record {
            SpanRecord::Span(span) => {
                span.collector_accept_time = accept_time;
                if span.is_root() {
                    Some((
                        self.trace_index_keys.encode_row_key(span)?,
                        span.transaction_id.clone(),
                        span.elapsed,
                    ))
                } else {
                    None
                }
            }
            SpanRecord::SpanChunk(chunk) => {
                chunk.collector_accept_time = accept_time;
                None
            }
        };

        let row_key = self.transaction_keys.encode_row_key(record.transaction_id())?;
        debug!("Received span cell for {}", record.transaction_id());
        self.traces.put_trace(row_key, record).await?;
        if let Some((index_key, transaction_id, elapsed)) = index {
            self.traces
                .put_trace_index(index_key, transaction_id, elapsed)
                .await?;
        }
        Ok(())
    }

    async fn handle_agent_stat(&self, payload: &[u8]) -> Result<(), CollectorError> {
        let envelope = StatEnvelope::decode(payload)?;
        let (ctx, batch) = envelope.decode_batch(self.stat_timespan_ms)?;
        let row_key = self
            .agent_stat_keys
            .encode_row_key(&AgentStatRowKey::from_context(envelope.stat_type, &ctx))?;
        debug!(
            "Received {} {} points from {}",
            batch.len(),
            envelope.stat_type,
            ctx.agent_id
        );
        self.agent_stats.put_agent_stat(row_key, batch).await?;
        Ok(())
    }

    async fn handle_metadata(&self, frame: &Frame) -> Result<(), CollectorError> {
        match frame.kind {
            MessageKind::ApiMetaData => {
                let meta = ApiMetaData::decode(&frame.payload)?;
                self.metadata.put_api_meta(meta).await?;
            }
            MessageKind::SqlMetaData => {
                let meta = SqlMetaData::decode(&frame.payload)?;
                self.metadata.put_sql_meta(meta).await?;
            }
            MessageKind::StringMetaData => {
                let meta = StringMetaData::decode(&frame.payload)?;
                self.metadata.put_string_meta(meta).await?;
            }
            MessageKind::AgentInfo => {
                let info = AgentInfo::decode(&frame.payload)?;
                let row_key = AgentIdRowKey::from_agent_info(self.service_uid, &info).encode()?;
                debug!(
                    "Agent {} of {} started at {}",
                    info.agent_id, info.application_name, info.agent_start_time
                );
                self.metadata.put_agent_info(row_key, info).await?;
            }
            other => return Err(CollectorError::UnexpectedKind(other)),
        }
        Ok(())
    }
}
