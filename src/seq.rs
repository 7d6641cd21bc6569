//! Modulo-32 sequence number arithmetic.
//!
//! TCP sequence numbers live on a 2^32 circle, so plain integer comparison
//! breaks once a connection transfers ~4 GB. All comparisons therefore go
//! through the wraparound-safe signed difference below: `a` is "less than"
//! `b` when the distance from `b` back to `a` is more than half the space.

/// Wraparound-safe signed difference `lhs - rhs` on the sequence circle.
#[inline]
pub fn seq_diff(lhs: u32, rhs: u32) -> i32 {
    lhs.wrapping_sub(rhs) as i32
}

/// Returns `true` if `lhs < rhs` modulo 2^32.
#[inline]
pub fn seq_lt(lhs: u32, rhs: u32) -> bool {
    seq_diff(lhs, rhs) < 0
}

/// Returns `true` if `lhs <= rhs` modulo 2^32.
#[inline]
pub fn seq_leq(lhs: u32, rhs: u32) -> bool {
    seq_diff(lhs, rhs) <= 0
}

/// Returns `true` if `lhs > rhs` modulo 2^32.
#[inline]
pub fn seq_gt(lhs: u32, rhs: u32) -> bool {
    seq_diff(lhs, rhs) > 0
}

/// Returns `true` if `lhs >= rhs` modulo 2^32.
#[inline]
pub fn seq_geq(lhs: u32, rhs: u32) -> bool {
    seq_diff(lhs, rhs) >= 0
}

/// RFC 793: `true` if `x` is in the half-open window `(start, end]` modulo
/// 2^32.
#[inline]
pub fn seq_between(start: u32, x: u32, end: u32) -> bool {
    seq_lt(start, x) && seq_leq(x, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_without_wraparound() {
        assert!(seq_lt(1, 2));
        assert!(seq_leq(2, 2));
        assert!(seq_gt(3, 2));
        assert!(seq_geq(3, 3));
        assert_eq!(seq_diff(10, 4), 6);
    }

    #[test]
    fn ordering_across_wraparound() {
        // 5 comes "after" u32::MAX - 5 on the circle.
        assert!(seq_lt(u32::MAX - 5, 5));
        assert!(seq_gt(5, u32::MAX - 5));
        assert_eq!(seq_diff(5, u32::MAX - 5), 11);
        assert_eq!(seq_diff(u32::MAX - 5, 5), -11);
    }

    #[test]
    fn between_half_open_window() {
        assert!(seq_between(10, 11, 20));
        assert!(seq_between(10, 20, 20));
        assert!(!seq_between(10, 10, 20));
        assert!(!seq_between(10, 21, 20));
        // Window straddling the wrap point.
        assert!(seq_between(u32::MAX - 2, 1, 4));
        assert!(!seq_between(u32::MAX - 2, 5, 4));
    }
}
