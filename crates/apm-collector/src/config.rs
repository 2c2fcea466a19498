// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;

use anyhow::Context;
use apm_rowkey::distributor::MAX_BUCKETS;
use apm_transport::config::{DEFAULT_METADATA_PORT, DEFAULT_SPAN_PORT, DEFAULT_STAT_PORT};
use apm_transport::tcp::DEFAULT_MAX_FRAME_LENGTH;

use crate::errors::ConfigError;

pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_TRACE_BUCKETS: usize = 64;
pub const DEFAULT_INDEX_BUCKETS: usize = 16;
pub const DEFAULT_STAT_BUCKETS: usize = 64;
/// Service uid of the agent index when the deployment does not set one.
pub const DEFAULT_SERVICE_UID: i32 = 0;
/// Agent stat rows hold one minute of points each.
pub const DEFAULT_STAT_TIMESPAN_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub bind_host: String,
    pub span_port: u16,
    pub stat_port: u16,
    pub metadata_port: u16,
    pub trace_buckets: usize,
    pub index_buckets: usize,
    pub stat_buckets: usize,
    pub stat_timespan_ms: i64,
    pub max_frame_length: usize,
    pub service_uid: i32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            span_port: DEFAULT_SPAN_PORT,
            stat_port: DEFAULT_STAT_PORT,
            metadata_port: DEFAULT_METADATA_PORT,
            trace_buckets: DEFAULT_TRACE_BUCKETS,
            index_buckets: DEFAULT_INDEX_BUCKETS,
            stat_buckets: DEFAULT_STAT_BUCKETS,
            stat_timespan_ms: DEFAULT_STAT_TIMESPAN_MS,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            service_uid: DEFAULT_SERVICE_UID,
        }
    }
}

fn port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(default)
}

/// Bucket counts decide where rows land, so a bad value is an error rather than a silent default.
fn bucket_count(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let Ok(value) = env::var(name) else {
        return Ok(default);
    };
    match value.trim().parse::<usize>() {
        Ok(count) if (1..=MAX_BUCKETS).contains(&count) => Ok(count),
        _ => Err(ConfigError::InvalidBucketCount { name, value }),
    }
}

impl CollectorConfig {
    pub fn new() -> anyhow::Result<CollectorConfig> {
        let defaults = CollectorConfig::default();

        let stat_timespan_ms = match env::var("APM_STAT_TIMESPAN_MS") {
            Ok(value) => match value.trim().parse::<i64>() {
                Ok(millis) if millis > 0 => millis,
                _ => {
                    return Err(ConfigError::InvalidTimespan {
                        name: "APM_STAT_TIMESPAN_MS",
                        value,
                    })
                    .context("invalid agent stat row configuration")
                }
            },
            Err(_) => defaults.stat_timespan_ms,
        };

        Ok(CollectorConfig {
            bind_host: env::var("APM_COLLECTOR_BIND_HOST").unwrap_or(defaults.bind_host),
            span_port: port("APM_COLLECTOR_SPAN_PORT", defaults.span_port),
            stat_port: port("APM_COLLECTOR_STAT_PORT", defaults.stat_port),
            metadata_port: port("APM_COLLECTOR_METADATA_PORT", defaults.metadata_port),
            trace_buckets: bucket_count("APM_TRACE_BUCKETS", defaults.trace_buckets)
                .context("invalid trace row key distribution")?,
            index_buckets: bucket_count("APM_INDEX_BUCKETS", defaults.index_buckets)
                .context("invalid trace index row key distribution")?,
            stat_buckets: bucket_count("APM_STAT_BUCKETS", defaults.stat_buckets)
                .context("invalid agent stat row key distribution")?,
            stat_timespan_ms,
            max_frame_length: env::var("APM_MAX_FRAME_LENGTH")
                .ok()
                .and_then(|len| len.parse::<usize>().ok())
                .unwrap_or(defaults.max_frame_length),
            service_uid: env::var("APM_SERVICE_UID")
                .ok()
                .and_then(|uid| uid.trim().parse::<i32>().ok())
                .unwrap_or(defaults.service_uid),
        })
    }

    pub fn span_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.span_port)
    }

    pub fn stat_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.stat_port)
    }

    pub fn metadata_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.metadata_port)
    }
}
