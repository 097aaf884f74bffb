//! Hybrid 12-byte nonces for AES-256-GCM.
//!
//!   nonce[0..4]  = random bytes
//!   nonce[4..12] = process-wide counter (big-endian)
//!
//! The counter alone makes nonces unique within a process; the random prefix
//! separates processes that share a key.

use std::sync::atomic::{AtomicU64, Ordering};

pub const NONCE_SIZE: usize = 12;
pub const NONCE_RANDOM_SIZE: usize = 4;

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produce the next nonce. Safe to call from any thread.
pub fn next_nonce() -> [u8; NONCE_SIZE] {
    let counter = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let prefix: [u8; NONCE_RANDOM_SIZE] = rand::random();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_RANDOM_SIZE].copy_from_slice(&prefix);
    nonce[NONCE_RANDOM_SIZE..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
