//! 16-bit modular sequence arithmetic shared by the dispatcher, coordinator
//! and histogram task.

/// Number of frames lost between `prev` and `cur`, assuming `cur` is meant to
/// immediately follow `prev`. `gap(a, a.wrapping_add(1)) == 0` (no loss);
/// `gap(a, a.wrapping_add(1 + k)) == k` for `k` missing frames in between.
pub fn gap(prev: u16, cur: u16) -> u16 {
    cur.wrapping_sub(prev).wrapping_sub(1)
}

/// Modular distance from `a` to `b`, i.e. how many wrapping increments of `a`
/// reach `b`.
pub fn distance(a: u16, b: u16) -> u16 {
    b.wrapping_sub(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_is_zero_for_immediate_successor() {
        assert_eq!(gap(41, 42), 0);
        assert_eq!(gap(65535, 0), 0);
    }

    #[test]
    fn gap_counts_missing_frames() {
        assert_eq!(gap(10, 13), 2);
        assert_eq!(gap(65534, 1), 2);
    }

    #[test]
    fn gap_wraps_across_full_range() {
        for k in 0u32..=65535 {
            let cur = (43u32).wrapping_add(k) as u16;
            assert_eq!(gap(42, cur), k as u16);
        }
    }

    #[test]
    fn distance_matches_anchor_plus_k_for_every_k() {
        for k in 0u32..=65535 {
            let b = (42u32).wrapping_add(k) as u16;
            assert_eq!(distance(42, b), k as u16);
        }
        assert_eq!(distance(42, 42), 0);
    }

    #[test]
    fn distance_and_gap_agree_on_random_pairs() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let prev: u16 = rng.gen();
            let k: u16 = rng.gen();
            let cur = prev.wrapping_add(k).wrapping_add(1);
            assert_eq!(gap(prev, cur), k);
            assert_eq!(distance(prev, cur), k.wrapping_add(1));
        }
    }
}
