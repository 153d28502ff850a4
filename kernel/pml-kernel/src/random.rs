//! Kernel entropy pool.
//!
//! The pool is one SHA-256 digest. Adding entropy rehashes the pool with
//! the new bytes; reading hashes the pool into output-sized chunks,
//! folding each chunk back in so consecutive reads never repeat.

use pml_core::sync::SpinLock;
use sha2::{Digest, Sha256};

/// Size of the entropy pool (one SHA-256 digest).
pub const POOL_SIZE: usize = 32;

static ENTROPY_POOL: SpinLock<[u8; POOL_SIZE]> = SpinLock::new([0u8; POOL_SIZE]);

fn mix(pool: &mut [u8; POOL_SIZE], data: &[u8]) {
    let mut hasher = Sha256::new();
    hasher.update(&pool[..]);
    hasher.update(data);
    pool.copy_from_slice(&hasher.finalize());
}

/// Stirs `data` into the pool.
pub fn add_entropy(data: &[u8]) {
    let mut pool = ENTROPY_POOL.lock();
    mix(&mut pool, data);
}

/// Fills `out` with bytes derived from the pool.
pub fn get_entropy(out: &mut [u8]) {
    let mut pool = ENTROPY_POOL.lock();
    let mut done = 0;
    while done < out.len() {
        let digest = Sha256::digest(&pool[..]);
        mix(&mut pool, &digest);
        let take = (out.len() - done).min(POOL_SIZE);
        out[done..done + take].copy_from_slice(&digest[..take]);
        done += take;
    }
}

/// Seeds the pool from the boot clock.
pub fn random_init(ticks: u64) {
    let mut pool = ENTROPY_POOL.lock();
    let digest = Sha256::digest(ticks.to_le_bytes());
    pool.copy_from_slice(&digest);
}

/// `getrandom(2)`: drains the pool into a user buffer.
pub fn sys_getrandom(buf: &mut [u8], _flags: u32) -> isize {
    get_entropy(buf);
    buf.len() as isize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_differ_and_sizes_hold() {
        random_init(0x1234_5678);
        let mut a = [0u8; 48];
        let mut b = [0u8; 48];
        get_entropy(&mut a);
        get_entropy(&mut b);
        assert_ne!(a, b);
        assert!(a.iter().any(|&x| x != 0));
    }

    #[test]
    fn entropy_affects_output() {
        random_init(1);
        let mut before = [0u8; 16];
        get_entropy(&mut before);
        add_entropy(b"interrupt timing");
        let mut after = [0u8; 16];
        get_entropy(&mut after);
        assert_ne!(before, after);
    }
}
