// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod query;
pub mod receiver;
pub mod server;
pub mod store;

pub use config::CollectorConfig;
pub use errors::{CollectorError, ConfigError, StoreError};
pub use query::{CollectorQuery, TraceHit};
pub use receiver::{CollectorReceiver, ReceiverCounters};
pub use server::CollectorServer;
pub use store::{AgentStatStore, IndexScanner, MemoryStore, MetadataStore, TraceStore};
