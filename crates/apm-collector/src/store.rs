// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage boundary. The collector only decides what goes where; executing the writes belongs to
//! a wide-column store client behind these traits.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use apm_codec::message::{AgentInfo, ApiMetaData, SqlMetaData, StringMetaData};
use apm_codec::span::{SpanRecord, TransactionId};
use apm_codec::stat::AgentStatBatch;
use async_trait::async_trait;
use tracing::debug;

use crate::errors::StoreError;

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Adds a span or span chunk cell to the trace row at `row_key`.
    async fn put_trace(&self, row_key: Vec<u8>, record: SpanRecord) -> Result<(), StoreError>;

    /// Adds a root span to the application trace index.
    async fn put_trace_index(
        &self,
        index_key: Vec<u8>,
        transaction_id: TransactionId,
        elapsed: i32,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AgentStatStore: Send + Sync {
    async fn put_agent_stat(&self, row_key: Vec<u8>, batch: AgentStatBatch) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put_api_meta(&self, meta: ApiMetaData) -> Result<(), StoreError>;
    async fn put_sql_meta(&self, meta: SqlMetaData) -> Result<(), StoreError>;
    async fn put_string_meta(&self, meta: StringMetaData) -> Result<(), StoreError>;

    /// Registers one agent start in the application/agent index.
    async fn put_agent_info(&self, row_key: Vec<u8>, info: AgentInfo) -> Result<(), StoreError>;
}

/// Prefix scans over the indexes, in ascending row key order.
#[async_trait]
pub trait IndexScanner: Send + Sync {
    async fn scan_trace_index(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<TraceIndexEntry>)>, StoreError>;

    async fn scan_agents(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, AgentInfo)>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceIndexEntry {
    pub transaction_id: TransactionId,
    pub elapsed: i32,
}

#[derive(Debug, Default)]
struct Tables {
    traces: BTreeMap<Vec<u8>, Vec<SpanRecord>>,
    trace_index: BTreeMap<Vec<u8>, Vec<TraceIndexEntry>>,
    agent_stats: BTreeMap<Vec<u8>, Vec<AgentStatBatch>>,
    api_meta: Vec<ApiMetaData>,
    sql_meta: Vec<SqlMetaData>,
    string_meta: Vec<StringMetaData>,
    agents: BTreeMap<Vec<u8>, AgentInfo>,
}

fn scan_prefix<V: Clone>(table: &BTreeMap<Vec<u8>, V>, prefix: &[u8]) -> Vec<(Vec<u8>, V)> {
    table
        .range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Sorted in-memory tables, scanned in row key order like the real store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn trace_rows(&self) -> Vec<(Vec<u8>, Vec<SpanRecord>)> {
        self.tables()
            .traces
            .iter()
            .map(|(key, cells)| (key.clone(), cells.clone()))
            .collect()
    }

    pub fn trace_index_rows(&self) -> Vec<(Vec<u8>, Vec<TraceIndexEntry>)> {
        self.tables()
            .trace_index
            .iter()
            .map(|(key, cells)| (key.clone(), cells.clone()))
            .collect()
    }

    pub fn agent_stat_rows(&self) -> Vec<(Vec<u8>, Vec<AgentStatBatch>)> {
        self.tables()
            .agent_stats
            .iter()
            .map(|(key, cells)| (key.clone(), cells.clone()))
            .collect()
    }

    pub fn sql_meta(&self) -> Vec<SqlMetaData> {
        self.tables().sql_meta.clone()
    }

    pub fn api_meta(&self) -> Vec<ApiMetaData> {
        self.tables().api_meta.clone()
    }

    pub fn string_meta(&self) -> Vec<StringMetaData> {
        self.tables().string_meta.clone()
    }

    pub fn agent_rows(&self) -> Vec<(Vec<u8>, AgentInfo)> {
        self.tables()
            .agents
            .iter()
            .map(|(key, info)| (key.clone(), info.clone()))
            .collect()
    }
}

#[async_trait]
impl TraceStore for MemoryStore {
    async fn put_trace(&self, row_key: Vec<u8>, record: SpanRecord) -> Result<(), StoreError> {
        debug!("Storing trace cell for {}", record.transaction_id());
        self.tables().traces.entry(row_key).or_default().push(record);
        Ok(())
    }

    async fn put_trace_index(
        &self,
        index_key: Vec<u8>,
        transaction_id: TransactionId,
        elapsed: i32,
    ) -> Result<(), StoreError> {
        self.tables()
            .trace_index
            .entry(index_key)
            .or_default()
            .push(TraceIndexEntry {
                transaction_id,
                elapsed,
            });
        Ok(())
    }
}

#[async_trait]
impl AgentStatStore for MemoryStore {
    async fn put_agent_stat(&self, row_key: Vec<u8>, batch: AgentStatBatch) -> Result<(), StoreError> {
        debug!("Storing {} {} points", batch.len(), batch.stat_type());
        self.tables().agent_stats.entry(row_key).or_default().push(batch);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn put_api_meta(&self, meta: ApiMetaData) -> Result<(), StoreError> {
        self.tables().api_meta.push(meta);
        Ok(())
    }

    async fn put_sql_meta(&self, meta: SqlMetaData) -> Result<(), StoreError> {
        self.tables().sql_meta.push(meta);
        Ok(())
    }

    async fn put_string_meta(&self, meta: StringMetaData) -> Result<(), StoreError> {
        self.tables().string_meta.push(meta);
        Ok(())
    }

    async fn put_agent_info(&self, row_key: Vec<u8>, info: AgentInfo) -> Result<(), StoreError> {
        debug!("Indexing agent {} of {}", info.agent_id, info.application_name);
        // A repeated registration of the same start overwrites the row.
        self.tables().agents.insert(row_key, info);
        Ok(())
    }
}

#[async_trait]
impl IndexScanner for MemoryStore {
    async fn scan_trace_index(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<TraceIndexEntry>)>, StoreError> {
        Ok(scan_prefix(&self.tables().trace_index, prefix))
    }

    async fn scan_agents(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, AgentInfo)>, StoreError> {
        Ok(scan_prefix(&self.tables().agents, prefix))
    }
}
