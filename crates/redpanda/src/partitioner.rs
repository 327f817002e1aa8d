//! Partition routing for keyed messages.
//!
//! Uses the murmur2 variant of the Java Kafka client's default partitioner,
//! so routing is stable across builds and matches other Kafka producers
//! writing the same keys.

const SEED: u32 = 0x9747_b28c;
const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

/// Kafka's murmur2 over raw key bytes.
pub fn murmur2(data: &[u8]) -> u32 {
    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if let Some(&first) = tail.first() {
        h ^= u32::from(first);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Computes a partition for a key.
///
/// Duplicates of the same unit of work (one project, one table) share a key
/// and therefore a partition.
pub fn partition_hash(key: &str, num_partitions: i32) -> i32 {
    if num_partitions <= 1 {
        return 0;
    }
    let positive = murmur2(key.as_bytes()) & 0x7fff_ffff;
    (positive % num_partitions as u32) as i32
}
