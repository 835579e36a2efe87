//! Code digests: a short string that lets an external deployer compare
//! "what's on disk" against "what a Dest has recorded" without either side
//! re-parsing migration file contents.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

const SEED_A: (u64, u64) = (0x5be_c174b_6e1f_bb89, 0x8b0d_5f0e_9f4a_21c3);
const SEED_B: (u64, u64) = (0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344);

/// Hex content hash over the newline-joined, sorted version names. Uses two
/// independently-seeded `SipHash-1-3` passes concatenated together, since a
/// single 64-bit hash only yields 16 hex characters and the "full" digest
/// calls for 32.
pub(crate) fn hash_content(joined: &str) -> String {
    let mut h1 = SipHasher13::new_with_keys(SEED_A.0, SEED_A.1);
    h1.write(joined.as_bytes());
    let mut h2 = SipHasher13::new_with_keys(SEED_B.0, SEED_B.1);
    h2.write(joined.as_bytes());
    format!("{:016x}{:016x}", h1.finish(), h2.finish())
}

/// `"<order>.<hash>"`, the code digest for a sorted list of version names.
/// `order` is the numeric timestamp prefix of the last name, or `0` if the
/// list is empty. Pass `short` to truncate the hash to 16 hex chars.
pub fn compute(sorted_names: &[String], short: bool) -> String {
    let order = sorted_names
        .last()
        .and_then(|n| n.split('.').next())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let joined = sorted_names.join("\n");
    let mut hash = hash_content(&joined);
    if short {
        hash.truncate(16);
    }
    format!("{order}.{hash}")
}

/// A reset digest written before/after an undo, standing in for "the
/// database is below any code digest until it re-settles".
pub fn reset_label(label: &str) -> String {
    format!("0.{label}")
}

fn is_reset(digest: &str) -> bool {
    match digest.split_once('.') {
        Some((_, rest)) => rest.contains('-') || rest.is_empty(),
        None => true,
    }
}

fn reset_suffix(digest: &str) -> &str {
    digest.split_once('.').map(|(_, rest)| rest).unwrap_or(digest)
}

/// Picks the digest that best represents "how far along" a fleet is, per a
/// batch of digests read off individual Dests. Real digests (order.hash)
/// always win over reset labels, and among real digests the lexicographically
/// greatest sorts highest since higher `order` values sort later as strings
/// of equal width and `saveDigests` always writes equal-order digests.
pub fn choose_best(digests: &[String]) -> String {
    let (real, reset): (Vec<&String>, Vec<&String>) = digests.iter().partition(|d| !is_reset(d));

    if let Some(best) = real.iter().max() {
        return (*best).clone();
    }

    if let Some(best) = reset.iter().min_by_key(|d| reset_suffix(d)) {
        return reset_label(reset_suffix(best));
    }

    "0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_digests_to_zero() {
        assert_eq!(compute(&[], false), "0.".to_string() + &hash_content(""));
    }

    #[test]
    fn short_truncates_to_sixteen_hex_chars() {
        let names = vec!["20240101000000.add_cars.sh".to_string()];
        let full = compute(&names, false);
        let short = compute(&names, true);
        let (_, hash) = full.split_once('.').unwrap();
        let (_, short_hash) = short.split_once('.').unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(short_hash.len(), 16);
        assert_eq!(&hash[..16], short_hash);
    }

    #[test]
    fn order_is_last_names_timestamp() {
        let names = vec![
            "20230101000000.a.sh".to_string(),
            "20240101000000.b.sh".to_string(),
        ];
        let d = compute(&names, false);
        assert!(d.starts_with("20240101000000."));
    }

    #[test]
    fn choose_best_empty_is_zero() {
        assert_eq!(choose_best(&[]), "0");
    }

    #[test]
    fn choose_best_picks_greatest_real() {
        let digests = vec!["1.deadbeef".to_string(), "2.deadbeef".to_string()];
        assert_eq!(choose_best(&digests), "2.deadbeef");
    }

    #[test]
    fn choose_best_prefers_real_over_reset() {
        let digests = vec![
            "before-undo".to_string(),
            "2.deadbeef".to_string(),
            "after-undo".to_string(),
        ];
        assert_eq!(choose_best(&digests), "2.deadbeef");
    }

    #[test]
    fn choose_best_picks_smallest_reset_label() {
        let digests = vec!["before-undo".to_string(), "after-undo".to_string()];
        assert_eq!(choose_best(&digests), "0.after-undo");
    }

    #[test]
    fn choose_best_is_order_independent() {
        let a = vec!["1.deadbeef".to_string(), "before-undo".to_string(), "2.deadbeef".to_string()];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(choose_best(&a), choose_best(&b));
    }
}
