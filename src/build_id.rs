use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

const BUILD_ID_LEN: usize = 10;
static BUILD_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a short, opaque build identifier.
///
/// Mixes wall-clock nanoseconds, the pid and a process-local counter. Ids are
/// not guaranteed globally unique; [`crate::state::StateStore::create`]
/// refuses duplicates and callers retry with a fresh id.
pub fn generate_build_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating build id")?
        .as_nanos() as u64;
    let pid = u64::from(std::process::id());
    let seq = BUILD_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let entropy = splitmix64(nanos ^ pid.rotate_left(32) ^ seq.wrapping_mul(0x9E37_79B9));
    Ok(base62_fixed(entropy, BUILD_ID_LEN))
}

/// Whether `id` has the shape of an identifier this crate hands out.
///
/// Also used to reject ids that would escape the state directory.
pub fn is_valid_build_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn base62_fixed(mut value: u64, len: usize) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    out
}
