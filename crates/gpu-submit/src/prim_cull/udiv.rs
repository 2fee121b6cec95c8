//! Division by a runtime-invariant divisor as multiply-high and shifts.
//!
//! `n / d == (((n >> pre_shift) + increment) * multiplier) >> 32 >> post_shift`
//! for every `n` representable in `num_bits`. The culling kernel divides
//! primitive ids by the per-instance primitive count this way.

/// Reciprocal terms for one divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastUdivInfo {
    pub multiplier: u32,
    pub pre_shift: u32,
    pub post_shift: u32,
    /// 0 or 1.
    pub increment: u32,
}

const UINT_BITS: u32 = 32;

/// Bit length of `d`, i.e. `floor(log2(d)) + 1`.
fn bit_len(d: u64) -> u32 {
    64 - d.leading_zeros()
}

impl FastUdivInfo {
    /// Terms for dividing numerators of at most `num_bits` bits by `d`.
    ///
    /// # Panics
    ///
    /// If `d` is zero or `num_bits` is not in `1..=32`.
    pub fn new(d: u32, num_bits: u32) -> Self {
        assert!(d != 0, "division by zero");
        assert!((1..=UINT_BITS).contains(&num_bits));

        if d.is_power_of_two() {
            if d == 1 {
                // The multiply-high by 2^32 - 1 needs the increment to land on n.
                return Self {
                    multiplier: u32::MAX,
                    pre_shift: 0,
                    post_shift: 0,
                    increment: 1,
                };
            }
            return Self {
                multiplier: 1 << (UINT_BITS - d.trailing_zeros()),
                pre_shift: 0,
                post_shift: 0,
                increment: 0,
            };
        }

        let d64 = d as u64;
        let extra_shift = UINT_BITS - num_bits;
        let initial_power_of_2 = 1u64 << (UINT_BITS - 1);
        let ceil_log_2_d = bit_len(d64);

        let mut quotient = initial_power_of_2 / d64;
        let mut remainder = initial_power_of_2 % d64;
        let mut down: Option<(u64, u32)> = None;

        let mut exponent = 0;
        loop {
            if remainder >= d64 - remainder {
                quotient = quotient * 2 + 1;
                remainder = remainder * 2 - d64;
            } else {
                quotient *= 2;
                remainder *= 2;
            }

            let shift = exponent + extra_shift;
            if shift >= ceil_log_2_d || d64 - remainder <= 1u64 << shift {
                break;
            }
            if down.is_none() && remainder <= 1u64 << shift {
                down = Some((quotient, exponent));
            }
            exponent += 1;
        }

        if exponent < ceil_log_2_d {
            // Rounding the reciprocal up is exact for every n in range.
            return Self {
                multiplier: (quotient + 1) as u32,
                pre_shift: 0,
                post_shift: exponent,
                increment: 0,
            };
        }

        if d & 1 == 1 {
            let (q, e) = down.unwrap_or((quotient, exponent));
            return Self {
                multiplier: q as u32,
                pre_shift: 0,
                post_shift: e,
                increment: 1,
            };
        }

        // Even divisor: shift the numerator first and retry on what is left.
        let pre_shift = d.trailing_zeros();
        let mut info = Self::new(d >> pre_shift, num_bits - pre_shift);
        info.pre_shift = pre_shift;
        info
    }

    /// Exact for every `n`.
    pub fn eval(&self, n: u32) -> u32 {
        let n = (n >> self.pre_shift) as u64 + self.increment as u64;
        ((n * self.multiplier as u64) >> 32 >> self.post_shift) as u32
    }

    /// The increment is added in 32 bits, so `n == u32::MAX` wraps when an
    /// increment is present and the result is wrong. Callers that can see
    /// `u32::MAX` (an instance id fetched from memory) use [`Self::eval`].
    pub fn eval_nuw(&self, n: u32) -> u32 {
        let n = (n >> self.pre_shift).wrapping_add(self.increment) as u64;
        ((n * self.multiplier as u64) >> 32 >> self.post_shift) as u32
    }

    /// Whether [`Self::eval_nuw`] is exact for `n`.
    pub fn nuw_safe(&self, n: u32) -> bool {
        self.increment == 0 || (n >> self.pre_shift) != u32::MAX
    }

    /// The kernel's form: `n < 2^31`, divisor not one, so no pre-shift and
    /// no increment.
    pub fn eval_u31_d_not_one(multiplier: u32, post_shift: u32, n: u32) -> u32 {
        ((n as u64 * multiplier as u64) >> 32 >> post_shift) as u32
    }
}

/// Second culling SGPR: `post_shift | prims_per_instance << 5`.
pub fn packed_terms(post_shift: u32, prims_per_instance: u32) -> u32 {
    debug_assert!(post_shift < 32);
    debug_assert!(prims_per_instance < 1 << 27);
    post_shift | (prims_per_instance << 5)
}

pub fn unpack_terms(terms: u32) -> (u32, u32) {
    (terms & 0x1f, terms >> 5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn powers_of_two_are_plain_shifts() {
        let info = FastUdivInfo::new(16, 32);
        assert_eq!(info.multiplier, 1 << 28);
        assert_eq!((info.pre_shift, info.post_shift, info.increment), (0, 0, 0));
        assert_eq!(info.eval(u32::MAX), u32::MAX / 16);
    }

    #[test]
    fn one_uses_the_increment() {
        let info = FastUdivInfo::new(1, 32);
        assert_eq!(info.increment, 1);
        for n in [0, 1, 7, 1 << 31, u32::MAX] {
            assert_eq!(info.eval(n), n);
        }
    }

    #[test]
    fn seven_rounds_down() {
        let info = FastUdivInfo::new(7, 32);
        assert_eq!(info.multiplier, 1_227_133_513);
        assert_eq!((info.post_shift, info.increment), (1, 1));
        assert_eq!(info.eval(6), 0);
        assert_eq!(info.eval(7), 1);
        assert_eq!(info.eval(u32::MAX), u32::MAX / 7);
    }

    #[test]
    fn nuw_wraps_at_max() {
        let info = FastUdivInfo::new(7, 32);
        assert!(!info.nuw_safe(u32::MAX));
        assert_eq!(info.eval_nuw(u32::MAX), 0);
        assert_eq!(info.eval_nuw(u32::MAX - 1), (u32::MAX - 1) / 7);
    }

    #[test]
    fn max_divisor() {
        let info = FastUdivInfo::new(u32::MAX, 32);
        assert_eq!(info.eval(u32::MAX), 1);
        assert_eq!(info.eval(u32::MAX - 1), 0);
    }

    #[test]
    fn even_divisors_pre_shift() {
        for d in [6u32, 14, 28, 100, 1_000_000] {
            let info = FastUdivInfo::new(d, 32);
            for n in [0, 1, d - 1, d, d + 1, 12345, u32::MAX / 3, u32::MAX] {
                assert_eq!(info.eval(n), n / d, "{n} / {d}");
            }
        }
    }

    #[test]
    fn u31_needs_no_increment() {
        for d in [3u32, 5, 6, 7, 255, 1 << 20 | 1, (1 << 27) - 1] {
            let info = FastUdivInfo::new(d, 31);
            assert_eq!((info.pre_shift, info.increment), (0, 0), "d = {d}");
            for n in [0, d - 1, d, 3 * d + 1, (1 << 31) - 1] {
                assert_eq!(
                    FastUdivInfo::eval_u31_d_not_one(info.multiplier, info.post_shift, n),
                    n / d,
                    "{n} / {d}"
                );
            }
        }
    }

    #[test]
    fn packing() {
        let terms = packed_terms(3, 1000);
        assert_eq!(terms, 3 | 1000 << 5);
        assert_eq!(unpack_terms(terms), (3, 1000));
    }
}
