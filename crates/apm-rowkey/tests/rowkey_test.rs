// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use apm_codec::span::{Span, TransactionId};
use apm_codec::stat::AgentStatType;
use apm_rowkey::agent_id::AgentIdRowKey;
use apm_rowkey::{
    AgentStatRowKey, AgentStatRowKeyEncoder, ApplicationTraceIndexRowKeyEncoder,
    OneByteSimpleHash, RowKeyDistributor, RowKeyDistributorByHashPrefix, RowKeyEncoder,
    TransactionIdRowKeyEncoder,
};
use proptest::prelude::*;

fn distributor(buckets: usize) -> Arc<dyn RowKeyDistributor> {
    Arc::new(RowKeyDistributorByHashPrefix::new(
        OneByteSimpleHash::new(buckets).unwrap(),
    ))
}

fn index_span(application_name: &str, accept_time: i64, elapsed: i32) -> Span {
    Span {
        application_name: application_name.to_string(),
        collector_accept_time: accept_time,
        elapsed,
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn prop_transaction_key_is_idempotent_and_bucketed(
        agent_id in "[a-z0-9-]{1,24}",
        start in 0i64..i64::MAX,
        sequence in any::<i64>(),
        buckets in 1usize..=256,
    ) {
        let encoder = TransactionIdRowKeyEncoder::new(
            TransactionIdRowKeyEncoder::sequence_distributor(buckets).unwrap(),
        );
        let id = TransactionId::new(agent_id, start, sequence);
        let first = encoder.encode_row_key(&id).unwrap();
        let second = encoder.encode_row_key(&id).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!((first[0] as usize) < buckets);
        prop_assert_eq!(encoder.decode_row_key(&first).unwrap(), id);
    }

    #[test]
    fn prop_trace_index_sorts_newest_first(
        application in "[a-z]{1,30}",
        t1 in 0i64..4_000_000_000_000,
        gap in 1i64..1_000_000,
        elapsed in 0i32..100_000,
    ) {
        // A single bucket keeps the prefix constant so only the time decides the order.
        let encoder = ApplicationTraceIndexRowKeyEncoder::new(distributor(1));
        let earlier = encoder.encode_row_key(&index_span(&application, t1, elapsed)).unwrap();
        let later = encoder.encode_row_key(&index_span(&application, t1 + gap, elapsed)).unwrap();
        prop_assert!(earlier > later);
    }

    #[test]
    fn prop_agent_stat_original_keys_sort_newest_first(
        t1 in 0i64..4_000_000_000_000,
        gap in 1i64..1_000_000,
    ) {
        let distributor = distributor(16);
        let encoder = AgentStatRowKeyEncoder::new(distributor.clone());
        let key = |base_timestamp| AgentStatRowKey {
            agent_id: "agent-1".into(),
            stat_type: AgentStatType::CpuLoad,
            base_timestamp,
        };
        let earlier = encoder.encode_row_key(&key(t1)).unwrap();
        let later = encoder.encode_row_key(&key(t1 + gap)).unwrap();
        prop_assert!(distributor.original_key(&earlier) > distributor.original_key(&later));
    }
}

#[test]
fn test_agent_id_index_key_round_trip() {
    let key = AgentIdRowKey {
        service_uid: 7,
        application_name: "checkout".into(),
        service_type_code: 1010,
        agent_id: "agent-1".into(),
        agent_start_time: 1_700_000_000_000,
    };
    let bytes = key.encode().unwrap();
    assert_eq!(bytes, key.encode().unwrap());
    assert_eq!(AgentIdRowKey::decode(&bytes).unwrap(), key);
}

#[test]
fn test_keys_spread_over_buckets() {
    let encoder = TransactionIdRowKeyEncoder::new(
        TransactionIdRowKeyEncoder::sequence_distributor(16).unwrap(),
    );
    let mut used = [false; 16];
    for sequence in 0..1_000 {
        let key = encoder
            .encode_row_key(&TransactionId::new("agent-1", 1_700_000_000_000, sequence))
            .unwrap();
        used[key[0] as usize] = true;
    }
    assert!(used.iter().filter(|used| **used).count() > 8);
}

#[test]
fn test_oversized_application_name_is_rejected() {
    let encoder = ApplicationTraceIndexRowKeyEncoder::new(distributor(4));
    let span = index_span(&"x".repeat(255), 1_700_000_000_000, 10);
    assert!(encoder.encode_row_key(&span).is_err());
}
