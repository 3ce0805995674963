//! Transaction ID arithmetic
//!
//! IDs are a 64-bit counter that may wrap during the lifetime of a store.
//! Ordering is therefore defined on the signed distance between two IDs.

use std::cmp::Ordering;

/// `a <= b` in wraparound-safe order.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn is_less_or_equal(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) <= 0
}

/// Total order over IDs that lie within half the ID space of each other.
#[must_use]
pub fn compare(a: u64, b: u64) -> Ordering {
    if a == b {
        Ordering::Equal
    } else if is_less_or_equal(a, b) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// The ID following `id`
#[must_use]
pub const fn next(id: u64) -> u64 {
    id.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ordering() {
        assert!(is_less_or_equal(1, 2));
        assert!(is_less_or_equal(2, 2));
        assert!(!is_less_or_equal(3, 2));
    }

    #[test]
    fn test_ordering_across_wraparound() {
        let last = u64::MAX;
        assert_eq!(next(last), 0);
        assert!(is_less_or_equal(last, 0));
        assert!(is_less_or_equal(u64::MAX - 10, 5));
        assert!(!is_less_or_equal(5, u64::MAX - 10));
        assert_eq!(compare(u64::MAX, 0), Ordering::Less);
        assert_eq!(compare(0, u64::MAX), Ordering::Greater);
    }

    #[test]
    fn test_max_by_wraparound_order() {
        let ids = [u64::MAX - 1, u64::MAX, 0, 1];
        let newest = ids.iter().copied().max_by(|a, b| compare(*a, *b));
        assert_eq!(newest, Some(1));
    }
}
