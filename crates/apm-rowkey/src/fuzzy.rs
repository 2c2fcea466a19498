// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ops::RangeInclusive;

/// Maps a payload attribute to a key slot so reads can filter by it without decoding values.
pub trait FuzzyRowKeyFactory<K> {
    fn key(&self, value: i64) -> K;

    /// Every slot a value in `min..=max` can map to.
    fn keys_in_range(&self, min: i64, max: i64) -> RangeInclusive<K>;
}

/// Upper bounds (exclusive, millis) of every elapsed-time slot but the last.
const ELAPSED_SLOT_BOUNDS: [i64; 15] = [
    100, 200, 300, 500, 1_000, 2_000, 3_000, 5_000, 8_000, 10_000, 20_000, 30_000, 60_000,
    120_000, 300_000,
];

/// Buckets elapsed millis into one of 16 slots, slow traces in higher slots.
#[derive(Debug, Default, Clone, Copy)]
pub struct OneByteFuzzyRowKeyFactory;

impl FuzzyRowKeyFactory<u8> for OneByteFuzzyRowKeyFactory {
    fn key(&self, value: i64) -> u8 {
        ELAPSED_SLOT_BOUNDS
            .iter()
            .position(|bound| value < *bound)
            .unwrap_or(ELAPSED_SLOT_BOUNDS.len()) as u8
    }

    fn keys_in_range(&self, min: i64, max: i64) -> RangeInclusive<u8> {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.key(min)..=self.key(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;

    #[duplicate_item(
        test_name               elapsed     expected;
        [test_negative_slot]    [-1]        [0];
        [test_fast_slot]        [99]        [0];
        [test_boundary_slot]    [100]       [1];
        [test_second_slot]      [150]       [1];
        [test_one_second_slot]  [1_000]     [5];
        [test_slowest_slot]     [3_600_000] [15];
    )]
    #[test]
    fn test_name() {
        assert_eq!(OneByteFuzzyRowKeyFactory.key(elapsed), expected);
    }

    #[test]
    fn test_keys_in_range() {
        assert_eq!(OneByteFuzzyRowKeyFactory.keys_in_range(150, 1_200), 1..=5);
        assert_eq!(OneByteFuzzyRowKeyFactory.keys_in_range(1_200, 150), 1..=5);
    }
}
