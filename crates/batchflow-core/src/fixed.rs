use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
pub type Fixed64 = I32F32;

/// Material quantities. Fixed-point so incremental transfer math is
/// bit-identical on every platform.
pub type Quantity = Fixed64;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to a Quantity. Use only for scenario input, never in the
/// event loop.
#[inline]
pub fn f64_to_quantity(v: f64) -> Quantity {
    Quantity::from_num(v)
}

/// Convert a Quantity to f64. Use only for display.
#[inline]
pub fn quantity_to_f64(v: Quantity) -> f64 {
    v.to_num::<f64>()
}

/// Whole-unit quantity.
#[inline]
pub fn units(v: u32) -> Quantity {
    Quantity::from_num(v)
}

/// `total * part / whole`, computed without intermediate overflow for the
/// tick ranges the kernel produces. Returns `total` when `whole` is zero.
pub fn prorate(total: Quantity, part: Ticks, whole: Ticks) -> Quantity {
    if whole == 0 || part >= whole {
        return total;
    }
    let bits = (total.to_bits() as i128 * part as i128) / whole as i128;
    Quantity::from_bits(bits as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_basic_arithmetic() {
        let a = f64_to_quantity(1.5);
        let b = f64_to_quantity(2.0);
        assert_eq!(quantity_to_f64(a + b), 3.5);
    }

    #[test]
    fn units_are_whole() {
        assert_eq!(units(40) + units(60), units(100));
    }

    #[test]
    fn prorate_linear() {
        assert_eq!(prorate(units(100), 25, 100), units(25));
        assert_eq!(prorate(units(100), 100, 100), units(100));
        assert_eq!(prorate(units(100), 0, 100), units(0));
    }

    #[test]
    fn prorate_zero_whole_returns_total() {
        assert_eq!(prorate(units(7), 0, 0), units(7));
    }

    #[test]
    fn prorate_is_deterministic() {
        let a = prorate(units(10), 1, 3);
        let b = prorate(units(10), 1, 3);
        assert_eq!(a, b);
        assert!(a < units(4) && a > units(3));
    }
}
