//! Sequence number comparisons on the 2^32 cycle (RFC 793 S3.3).
//!
//! Sequence numbers wrap, so `a < b` means "b lies less than 2^31 ahead of a",
//! computed from the signed 32-bit difference. Plain `<` on `u32` is wrong as
//! soon as a connection crosses zero.

#[inline]
fn delta(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[inline]
pub fn lt(a: u32, b: u32) -> bool {
    delta(a, b) < 0
}

#[inline]
pub fn le(a: u32, b: u32) -> bool {
    delta(a, b) <= 0
}

#[inline]
pub fn gt(a: u32, b: u32) -> bool {
    delta(a, b) > 0
}

#[inline]
pub fn ge(a: u32, b: u32) -> bool {
    delta(a, b) >= 0
}

/// `start <= x < start + len` on the cycle. Empty for `len == 0`.
#[inline]
pub fn in_window(x: u32, start: u32, len: u32) -> bool {
    le(start, x) && lt(x, start.wrapping_add(len))
}

/// Whether `[a, a + a_len)` and `[b, b + b_len)` share at least one sequence number.
pub fn overlaps(a: u32, a_len: u32, b: u32, b_len: u32) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    in_window(a, b, b_len)
        || in_window(a.wrapping_add(a_len - 1), b, b_len)
        || in_window(b, a, a_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wraps_at_zero() {
        assert!(lt(u32::MAX, 0));
        assert!(lt(0xFFFF_FFF0, 0x10));
        assert!(gt(0x10, 0xFFFF_FFF0));
        assert!(!lt(0x10, 0xFFFF_FFF0));
    }

    #[test]
    fn window_across_zero() {
        assert!(in_window(2, u32::MAX - 1, 10));
        assert!(in_window(u32::MAX - 1, u32::MAX - 1, 10));
        assert!(!in_window(8, u32::MAX - 1, 10));
        assert!(!in_window(u32::MAX - 2, u32::MAX - 1, 10));
    }

    #[test]
    fn overlap() {
        // segment covering the whole window
        assert!(overlaps(90, 100, 100, 10));
        // tail inside
        assert!(overlaps(95, 10, 100, 10));
        // ends right before
        assert!(!overlaps(90, 10, 100, 10));
        assert!(!overlaps(110, 5, 100, 10));
        assert!(!overlaps(100, 0, 100, 10));
    }

    proptest! {
        #[test]
        fn irreflexive(a in any::<u32>()) {
            prop_assert!(!lt(a, a));
            prop_assert!(le(a, a));
            prop_assert!(!gt(a, a));
            prop_assert!(ge(a, a));
        }

        #[test]
        fn successor_is_greater(a in any::<u32>()) {
            prop_assert!(lt(a, a.wrapping_add(1)));
            prop_assert!(gt(a.wrapping_add(1), a));
        }

        #[test]
        fn empty_window(x in any::<u32>(), start in any::<u32>()) {
            prop_assert!(!in_window(x, start, 0));
        }

        #[test]
        fn window_membership(start in any::<u32>(), len in 1u32..=65535, off in 0u32..70000) {
            let x = start.wrapping_add(off);
            prop_assert_eq!(in_window(x, start, len), off < len);
        }

        #[test]
        fn antisymmetric(a in any::<u32>(), d in 1u32..(1 << 31)) {
            let b = a.wrapping_add(d);
            prop_assert!(lt(a, b));
            prop_assert!(!lt(b, a));
        }
    }
}
