// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::tcp::DEFAULT_MAX_FRAME_LENGTH;
use crate::timer::{DEFAULT_MAX_PENDING_TIMEOUTS, DEFAULT_TICK, DEFAULT_WHEEL_SIZE};

pub const DEFAULT_COLLECTOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_SPAN_PORT: u16 = 9993;
pub const DEFAULT_STAT_PORT: u16 = 9992;
pub const DEFAULT_METADATA_PORT: u16 = 9991;
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_METADATA_RETRY_MAX_COUNT: u32 = 3;
pub const DEFAULT_METADATA_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub collector_host: String,
    pub span_port: u16,
    pub stat_port: u16,
    pub metadata_port: u16,
    pub span_queue_size: usize,
    pub stat_queue_size: usize,
    pub metadata_queue_size: usize,
    /// Retries after the first attempt, so a request is sent at most `retry_max_count + 1` times.
    pub metadata_retry_max_count: u32,
    pub metadata_retry_delay: Duration,
    pub metadata_request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub timer_tick: Duration,
    pub timer_wheel_size: usize,
    pub timer_max_pending_timeouts: usize,
    pub max_frame_length: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            collector_host: DEFAULT_COLLECTOR_HOST.to_string(),
            span_port: DEFAULT_SPAN_PORT,
            stat_port: DEFAULT_STAT_PORT,
            metadata_port: DEFAULT_METADATA_PORT,
            span_queue_size: DEFAULT_QUEUE_SIZE,
            stat_queue_size: DEFAULT_QUEUE_SIZE,
            metadata_queue_size: DEFAULT_QUEUE_SIZE,
            metadata_retry_max_count: DEFAULT_METADATA_RETRY_MAX_COUNT,
            metadata_retry_delay: Duration::from_millis(DEFAULT_METADATA_RETRY_DELAY_MS),
            metadata_request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            reconnect_max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            timer_tick: DEFAULT_TICK,
            timer_wheel_size: DEFAULT_WHEEL_SIZE,
            timer_max_pending_timeouts: DEFAULT_MAX_PENDING_TIMEOUTS,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn millis_env(name: &str, default: u64) -> Duration {
    Duration::from_millis(parse_env(name, default))
}

impl TransportConfig {
    /// Reads `APM_*` environment variables. Unset or unparsable values keep their default.
    pub fn from_env() -> Self {
        let defaults = TransportConfig::default();
        TransportConfig {
            collector_host: env::var("APM_COLLECTOR_HOST")
                .ok()
                .filter(|host| !host.trim().is_empty())
                .unwrap_or(defaults.collector_host),
            span_port: parse_env("APM_COLLECTOR_SPAN_PORT", defaults.span_port),
            stat_port: parse_env("APM_COLLECTOR_STAT_PORT", defaults.stat_port),
            metadata_port: parse_env("APM_COLLECTOR_METADATA_PORT", defaults.metadata_port),
            span_queue_size: parse_env("APM_SPAN_QUEUE_SIZE", defaults.span_queue_size),
            stat_queue_size: parse_env("APM_STAT_QUEUE_SIZE", defaults.stat_queue_size),
            metadata_queue_size: parse_env("APM_METADATA_QUEUE_SIZE", defaults.metadata_queue_size),
            metadata_retry_max_count: parse_env(
                "APM_METADATA_RETRY_MAX_COUNT",
                defaults.metadata_retry_max_count,
            ),
            metadata_retry_delay: millis_env(
                "APM_METADATA_RETRY_DELAY_MS",
                DEFAULT_METADATA_RETRY_DELAY_MS,
            ),
            metadata_request_timeout: millis_env(
                "APM_METADATA_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            ),
            reconnect_delay: millis_env("APM_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS),
            reconnect_max_delay: millis_env(
                "APM_RECONNECT_MAX_DELAY_MS",
                DEFAULT_RECONNECT_MAX_DELAY_MS,
            ),
            max_frame_length: parse_env("APM_MAX_FRAME_LENGTH", defaults.max_frame_length),
            ..defaults
        }
    }

    pub fn span_address(&self) -> String {
        format!("{}:{}", self.collector_host, self.span_port)
    }

    pub fn stat_address(&self) -> String {
        format!("{}:{}", self.collector_host, self.stat_port)
    }

    pub fn metadata_address(&self) -> String {
        format!("{}:{}", self.collector_host, self.metadata_port)
    }
}
