//! Composite key layout for queued items.
//!
//! Keys are built so that byte order equals delivery order inside a queue:
//!
//! ```text
//! fjall item:   <base36(queue_id)> '.' <ready_at_ms: u64 BE> <uniquifier: 4 bytes>
//! redb item:                           <ready_at_ms: u64 BE> <uniquifier: 4 bytes>
//! registry:     "queue_name." <base36(queue_id)>  ->  queue name
//! ```
//!
//! The ready time is always fixed-width big-endian, so lexicographic and
//! chronological order agree for every timestamp. The scope separator `.`
//! is not a base-36 digit, which keeps `1.` from being a prefix of `10.`.

use super::error::StoreError;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Width of the encoded ready time.
pub const TIMESTAMP_LEN: usize = 8;

/// Width of the uniquifier suffix.
pub const UNIQUIFIER_LEN: usize = 4;

/// Width of `<ready_at><uniquifier>`, the part of every item key after its scope.
pub const ITEM_SUFFIX_LEN: usize = TIMESTAMP_LEN + UNIQUIFIER_LEN;

/// Separates the base-36 queue identifier from the item suffix.
pub const SCOPE_SEPARATOR: u8 = b'.';

/// Prefix of every registry key.
pub const REGISTRY_PREFIX: &[u8] = b"queue_name.";

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

static SEQUENTIAL_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Strategy for the bytes that break ties between items with equal ready times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Uniquifier {
    /// Four random bytes. Collisions are possible but negligible.
    #[default]
    Random,
    /// Process-wide wrapping counter. Unique within a millisecond and
    /// orders equal ready times by push order.
    ///
    /// The counter wraps after 2^32 pushes; items pushed across a wrap
    /// within the same millisecond pop in wrapped order, not push order.
    Sequential,
}

impl Uniquifier {
    /// Produce the next uniquifier.
    pub fn next(self) -> [u8; UNIQUIFIER_LEN] {
        match self {
            Self::Random => rand::random::<u32>().to_be_bytes(),
            Self::Sequential => SEQUENTIAL_COUNTER
                .fetch_add(1, Ordering::Relaxed)
                .to_be_bytes(),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Ready time for an item pushed at `now_ms` with `delay`.
pub fn ready_at(now_ms: u64, delay: Duration) -> u64 {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_add(delay_ms)
}

/// Encode `<ready_at><uniquifier>`.
pub fn item_suffix(ready_at_ms: u64, uniquifier: [u8; UNIQUIFIER_LEN]) -> [u8; ITEM_SUFFIX_LEN] {
    let mut suffix = [0u8; ITEM_SUFFIX_LEN];
    suffix[..TIMESTAMP_LEN].copy_from_slice(&ready_at_ms.to_be_bytes());
    suffix[TIMESTAMP_LEN..].copy_from_slice(&uniquifier);
    suffix
}

/// Decode the ready time from an item suffix.
///
/// # Errors
///
/// Returns [`StoreError::MalformedKey`] if `suffix` is not exactly
/// [`ITEM_SUFFIX_LEN`] bytes.
pub fn parse_suffix(suffix: &[u8]) -> Result<u64, StoreError> {
    if suffix.len() != ITEM_SUFFIX_LEN {
        return Err(StoreError::malformed(suffix, "unexpected item key length"));
    }
    let mut ts = [0u8; TIMESTAMP_LEN];
    ts.copy_from_slice(&suffix[..TIMESTAMP_LEN]);
    Ok(u64::from_be_bytes(ts))
}

/// Prefix shared by every item of the queue with identifier `queue_id`.
pub fn scope_prefix(queue_id: u64) -> Vec<u8> {
    let mut prefix = to_base36(queue_id).into_bytes();
    prefix.push(SCOPE_SEPARATOR);
    prefix
}

/// Full item key for a queue scoped by numeric identifier.
pub fn scoped_item_key(
    queue_id: u64,
    ready_at_ms: u64,
    uniquifier: [u8; UNIQUIFIER_LEN],
) -> Vec<u8> {
    let mut key = scope_prefix(queue_id);
    key.extend_from_slice(&item_suffix(ready_at_ms, uniquifier));
    key
}

/// Decode the ready time of a scoped item key whose prefix is `prefix_len` bytes.
///
/// # Errors
///
/// Returns [`StoreError::MalformedKey`] if the key is shorter than its
/// prefix or the remainder is not an item suffix.
pub fn parse_scoped(key: &[u8], prefix_len: usize) -> Result<u64, StoreError> {
    match key.get(prefix_len..) {
        Some(suffix) => parse_suffix(suffix).map_err(|_| {
            StoreError::malformed(key, "item suffix has unexpected length")
        }),
        None => Err(StoreError::malformed(key, "key shorter than queue prefix")),
    }
}

/// Registry key recording the name of queue `queue_id`.
pub fn registry_key(queue_id: u64) -> Vec<u8> {
    let mut key = REGISTRY_PREFIX.to_vec();
    key.extend_from_slice(to_base36(queue_id).as_bytes());
    key
}

/// Decode the queue identifier from a registry key.
///
/// # Errors
///
/// Returns [`StoreError::MalformedKey`] if the key lacks the registry
/// prefix or the identifier is not valid base-36.
pub fn parse_registry_key(key: &[u8]) -> Result<u64, StoreError> {
    let digits = key
        .strip_prefix(REGISTRY_PREFIX)
        .ok_or_else(|| StoreError::malformed(key, "missing registry prefix"))?;
    from_base36(digits).ok_or_else(|| StoreError::malformed(key, "invalid base-36 identifier"))
}

/// Lowercase base-36 rendering of `value`.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(13);
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    // Every byte comes from BASE36_DIGITS.
    digits.into_iter().map(char::from).collect()
}

/// Parse lowercase base-36 digits. Returns `None` on empty input,
/// foreign characters or overflow.
pub fn from_base36(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'z' => b - b'a' + 10,
            _ => return None,
        };
        acc.checked_mul(36)?.checked_add(u64::from(digit))
    })
}
