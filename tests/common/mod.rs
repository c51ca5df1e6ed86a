#![allow(dead_code)]

use bytes::Bytes;
use libos_queue::SgArray;
use rand::Rng;
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output through the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}

/// Builds an array with up to `max_segments` random segments of up to `max_len` bytes each.
pub fn random_sga(rng: &mut impl Rng, max_segments: usize, max_len: usize) -> SgArray {
    let count = rng.gen_range(0..=max_segments);
    SgArray::from_segments((0..count).map(|_| {
        let len = rng.gen_range(0..=max_len);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        Bytes::from(data)
    }))
}
