//! Range and hash partitioning.

use std::ops::Range;

use xxhash_rust::xxh64::Xxh64;

use crate::types::{Row, Value};

/// Seed of the partition hash. Build and probe sides of a join must use the
/// same function, so it lives in exactly one place.
const PARTITION_SEED: u64 = 0x6c61_6b65_666c_6f77;

/// Splits `len` positions into at most `parts` contiguous, near-equal
/// ranges. Always returns at least one range.
pub fn range_partitions(len: u64, parts: usize) -> Vec<Range<u64>> {
    let parts = (parts.max(1) as u64).min(len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + u64::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Partition owning `key` among `parts` partitions.
pub fn partition_of(key: &[Value], parts: usize) -> usize {
    let mut hasher = Xxh64::new(PARTITION_SEED);
    for value in key {
        value.hash_into(&mut hasher);
    }
    (hasher.digest() % parts.max(1) as u64) as usize
}

/// Routes every row to the partition owning the values of `columns`.
/// Missing columns hash as null. Relative order is kept within a partition.
pub fn hash_partition(rows: Vec<Row>, columns: &[String], parts: usize) -> Vec<Vec<Row>> {
    let parts = parts.max(1);
    let mut out: Vec<Vec<Row>> = (0..parts).map(|_| Vec::new()).collect();
    let mut key = Vec::with_capacity(columns.len());
    for row in rows {
        key.clear();
        key.extend(
            columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null)),
        );
        out[partition_of(&key, parts)].push(row);
    }
    out
}
