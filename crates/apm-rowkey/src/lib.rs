// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent_id;
pub mod distributor;
pub mod encoder;
pub mod errors;
pub mod fuzzy;
pub mod time;

pub use distributor::{
    OneByteSimpleHash, PrefixHash, RangeOneByteSimpleHash, RowKeyDistributor,
    RowKeyDistributorByHashPrefix,
};
pub use encoder::{
    AgentStatRowKey, AgentStatRowKeyEncoder, ApplicationTraceIndexRowKeyEncoder, RowKeyEncoder,
    TraceIndexRowKey, TransactionIdRowKeyEncoder,
};
pub use errors::RowKeyError;
pub use fuzzy::{FuzzyRowKeyFactory, OneByteFuzzyRowKeyFactory};
