use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits. All resource
/// quantities, buffers and capacities use this type so that flow results
/// are bit-identical on every platform.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in the tick loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in the tick loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// `value * num / den`, truncated toward zero. Returns `None` when the
/// quotient does not fit or the denominator is not positive.
///
/// The product is formed on the raw bits in `i128`, so only the final
/// result has to fit in `Fixed64`. Used for proportional splits, where the
/// truncated remainder is handed out separately in a stable order.
#[inline]
pub fn mul_div(value: Fixed64, num: Fixed64, den: Fixed64) -> Option<Fixed64> {
    if den <= Fixed64::ZERO {
        return None;
    }
    let product = i128::from(value.to_bits()) * i128::from(num.to_bits());
    let bits = product / i128::from(den.to_bits());
    i64::try_from(bits).ok().map(Fixed64::from_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_basic_arithmetic() {
        let a = f64_to_fixed64(1.5);
        let b = f64_to_fixed64(2.0);
        assert_eq!(fixed64_to_f64(a + b), 3.5);
    }

    #[test]
    fn mul_div_splits_proportionally() {
        let ten = Fixed64::from_num(10);
        let share = mul_div(ten, Fixed64::from_num(1), Fixed64::from_num(4)).unwrap();
        assert_eq!(share, Fixed64::from_num(2.5));
    }

    #[test]
    fn mul_div_rejects_zero_denominator() {
        let ten = Fixed64::from_num(10);
        assert!(mul_div(ten, ten, Fixed64::ZERO).is_none());
    }

    #[test]
    fn mul_div_overflow_is_none() {
        assert!(mul_div(Fixed64::MAX, Fixed64::from_num(2), Fixed64::from_num(1)).is_none());
    }

    #[test]
    fn mul_div_survives_large_intermediate_product() {
        // 60000 * 60000 is far past the integer range, the quotient is not.
        let big = Fixed64::from_num(60_000);
        let half = mul_div(big, big, Fixed64::from_num(120_000)).unwrap();
        assert_eq!(half, Fixed64::from_num(30_000));
        let max = mul_div(Fixed64::MAX, Fixed64::MAX, Fixed64::MAX).unwrap();
        assert_eq!(max, Fixed64::MAX);
    }

    #[test]
    fn mul_div_truncates_toward_zero() {
        let seven = Fixed64::from_num(7);
        let third = mul_div(Fixed64::DELTA, seven, Fixed64::from_num(3)).unwrap();
        assert_eq!(third, Fixed64::from_bits(2));
    }

    #[test]
    fn thirds_never_exceed_whole() {
        let one = Fixed64::from_num(1);
        let three = Fixed64::from_num(3);
        let third = mul_div(one, one, three).unwrap();
        assert!(third * three <= one);
    }
}
