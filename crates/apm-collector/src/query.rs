// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read path over the indexes the receiver writes.
//!
//! Trace index rows are spread over every bucket of their distributor, so a query scans each
//! bucket and merges the results on the key without its prefix. Agent index keys are not
//! distributed and are scanned directly.

use std::sync::Arc;

use apm_codec::message::AgentInfo;
use apm_codec::span::TransactionId;
use apm_rowkey::agent_id::{agent_prefix, application_prefix, service_type_prefix};
use apm_rowkey::{
    ApplicationTraceIndexRowKeyEncoder, OneByteSimpleHash, RowKeyDistributorByHashPrefix,
    RowKeyError,
};
use tracing::debug;

use crate::config::CollectorConfig;
use crate::errors::CollectorError;
use crate::store::IndexScanner;

/// One trace of an application, as found in the trace index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHit {
    pub transaction_id: TransactionId,
    pub accepted_time: i64,
    pub elapsed: i32,
}

pub struct CollectorQuery {
    index: Arc<dyn IndexScanner>,
    trace_index_keys: ApplicationTraceIndexRowKeyEncoder,
    service_uid: i32,
}

impl CollectorQuery {
    /// Bucket counts must match the receiver that wrote the rows.
    pub fn new(config: &CollectorConfig, index: Arc<dyn IndexScanner>) -> Result<Self, RowKeyError> {
        let distributor = RowKeyDistributorByHashPrefix::new(OneByteSimpleHash::new(
            config.index_buckets,
        )?);
        Ok(CollectorQuery {
            index,
            trace_index_keys: ApplicationTraceIndexRowKeyEncoder::new(Arc::new(distributor)),
            service_uid: config.service_uid,
        })
    }

    /// Most recent traces of `application_name` that took between `min_elapsed` and
    /// `max_elapsed` millis, newest first.
    pub async fn recent_traces(
        &self,
        application_name: &str,
        min_elapsed: i32,
        max_elapsed: i32,
        limit: usize,
    ) -> Result<Vec<TraceHit>, CollectorError> {
        let slots = self
            .trace_index_keys
            .elapsed_slots(i64::from(min_elapsed), i64::from(max_elapsed));
        let elapsed = min_elapsed.min(max_elapsed)..=min_elapsed.max(max_elapsed);

        let mut hits = Vec::new();
        for prefix in self.trace_index_keys.scan_prefixes(application_name)? {
            for (key, entries) in self.index.scan_trace_index(&prefix).await? {
                let row = self.trace_index_keys.decode_row_key(&key)?;
                if !slots.contains(&row.elapsed_slot) {
                    continue;
                }
                let original = self.trace_index_keys.original_key(&key).to_vec();
                hits.extend(
                    entries
                        .into_iter()
                        .filter(|entry| elapsed.contains(&entry.elapsed))
                        .map(|entry| {
                            (
                                original.clone(),
                                TraceHit {
                                    transaction_id: entry.transaction_id,
                                    accepted_time: row.accepted_time,
                                    elapsed: entry.elapsed,
                                },
                            )
                        }),
                );
            }
        }
        // Original keys carry the inverted accept time, so ascending order is newest first.
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(
            "Found {} traces of {} in {:?} ms",
            hits.len(),
            application_name,
            elapsed
        );
        Ok(hits.into_iter().take(limit).map(|(_, hit)| hit).collect())
    }

    /// Every registered start of every agent of `application_name`.
    pub async fn application_agents(
        &self,
        application_name: &str,
    ) -> Result<Vec<AgentInfo>, CollectorError> {
        let prefix = application_prefix(self.service_uid, application_name)?;
        self.agents(&prefix).await
    }

    /// Agents of `application_name` running as `service_type_code`.
    pub async fn service_type_agents(
        &self,
        application_name: &str,
        service_type_code: i16,
    ) -> Result<Vec<AgentInfo>, CollectorError> {
        let prefix = service_type_prefix(
            self.service_uid,
            application_name,
            i32::from(service_type_code),
        )?;
        self.agents(&prefix).await
    }

    /// Start times of one agent, most recent first.
    pub async fn agent_starts(
        &self,
        application_name: &str,
        service_type_code: i16,
        agent_id: &str,
    ) -> Result<Vec<i64>, CollectorError> {
        let prefix = agent_prefix(
            self.service_uid,
            application_name,
            i32::from(service_type_code),
            agent_id,
        )?;
        Ok(self
            .agents(&prefix)
            .await?
            .into_iter()
            .map(|info| info.agent_start_time)
            .collect())
    }

    async fn agents(&self, prefix: &[u8]) -> Result<Vec<AgentInfo>, CollectorError> {
        Ok(self
            .index
            .scan_agents(prefix)
            .await?
            .into_iter()
            .map(|(_, info)| info)
            .collect())
    }
}
