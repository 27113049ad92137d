//! Deterministic user bucketing.
//!
//! Bucket values are derived from MurmurHash3 (x86, 32-bit) with a fixed seed, so that every SDK
//! implementation assigns a given user to the same bucket.

/// Seed passed to MurmurHash3.
const SEED: u32 = 1;

/// Upper bound for campaign traffic buckets.
pub(crate) const MAX_CAMPAIGN_VALUE: u32 = 100;

/// Upper bound for variation buckets.
pub(crate) const MAX_TRAFFIC_VALUE: u32 = 10_000;

pub(crate) fn murmur_hash_32(key: impl AsRef<[u8]>) -> u32 {
    let mut bytes = key.as_ref();
    // Reading from an in-memory slice cannot fail.
    murmur3::murmur3_32(&mut bytes, SEED).unwrap_or_default()
}

/// Map `hash` into `[1, max]` (scaled by `multiplier`).
///
/// A multiplier of zero maps every hash to bucket `0`, which no range contains.
pub(crate) fn bucket_value(hash: u32, max: u32, multiplier: u32) -> u32 {
    let ratio = f64::from(hash) / 2f64.powi(32);
    ((f64::from(max) * ratio + 1.0) * f64::from(multiplier)).floor() as u32
}

/// Bucket `key` into `[1, 100]`. Returns `0` for an empty key.
pub(crate) fn bucket_for_user(key: &str) -> u32 {
    if key.is_empty() {
        return 0;
    }
    bucket_value(murmur_hash_32(key), MAX_CAMPAIGN_VALUE, 1)
}

/// Bucket `key` into `[1, 10000]`.
pub(crate) fn bucket_for_string(key: &str) -> u32 {
    bucket_value(murmur_hash_32(key), MAX_TRAFFIC_VALUE, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur_matches_reference_values() {
        assert_eq!(murmur_hash_32(""), 1364076727);
        assert_eq!(murmur_hash_32("a"), 1485495528);
        assert_eq!(murmur_hash_32("hello"), 3142237357);
        assert_eq!(murmur_hash_32("Ashley"), 2141232222);
    }

    #[test]
    fn bucket_for_user_values() {
        assert_eq!(bucket_for_user("Ashley"), 50);
        assert_eq!(bucket_for_user("1_Ashley"), 46);
        assert_eq!(bucket_for_user("u42"), 27);
        assert_eq!(bucket_for_user(""), 0);
    }

    #[test]
    fn bucket_for_string_values() {
        assert_eq!(bucket_for_string("Ashley"), 4986);
        assert_eq!(bucket_for_string("u42"), 2695);
        assert_eq!(bucket_for_string("user1"), 220);
    }

    #[test]
    fn bucket_bounds() {
        assert_eq!(bucket_value(0, 100, 1), 1);
        assert_eq!(bucket_value(u32::MAX, 100, 1), 100);
        assert_eq!(bucket_value(u32::MAX, 10_000, 1), 10_000);
        assert_eq!(bucket_value(u32::MAX, 10_000, 0), 0);

        for i in 0..1000 {
            let key = format!("user-{i}");
            assert!((1..=100).contains(&bucket_for_user(&key)));
            assert!((1..=10_000).contains(&bucket_for_string(&key)));
        }
    }
}
