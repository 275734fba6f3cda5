//! Inverse-variance helpers.
//!
//! Conversions between variance and inverse variance go through
//! [`guarded_div`], so a zero weight always maps to zero instead of an
//! infinity or a NaN.

/// `x / y`, or 0 when `y == 0`.
#[inline]
pub fn guarded_div(x: f64, y: f64) -> f64 {
    if y != 0.0 { x / y } else { 0.0 }
}

/// Inverse variance from a variance, with non-positive variances mapped to 0.
#[inline]
pub fn ivar_from_var(var: f64) -> f64 {
    guarded_div(1.0, var.max(0.0))
}

/// Variance from an inverse variance, with zero weights mapped to 1.
///
/// The unit placeholder keeps masked pixels finite in expressions that are
/// later multiplied by a zero weight anyway.
#[inline]
pub fn var_from_ivar(ivar: f64) -> f64 {
    if ivar > 0.0 { 1.0 / ivar } else { 1.0 }
}

/// Combine two independent inverse variances.
///
/// A zero (or negative) ivar carries no information, so the other operand is
/// returned unchanged. The law is symmetric in its arguments.
#[inline]
pub fn combine_ivar(a: f64, b: f64) -> f64 {
    match (a > 0.0, b > 0.0) {
        (true, true) => 1.0 / (1.0 / a + 1.0 / b),
        (true, false) => a,
        (false, true) => b,
        (false, false) => 0.0,
    }
}

/// Median of a slice (sorted in place). Returns `None` for an empty slice.
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// `numpy.allclose` semantics: `|a - b| <= atol + rtol * |b|` element-wise.
pub fn all_close(a: &[f64], b: &[f64], rtol: f64, atol: f64) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(&x, &y)| (x - y).abs() <= atol + rtol * y.abs())
}

/// Mean of the centred gradient of `x` (one-sided at the ends).
pub fn mean_gradient(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 2 {
        return 0.0;
    }
    let mut sum = (x[1] - x[0]) + (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        sum += (x[i + 1] - x[i - 1]) / 2.0;
    }
    sum / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_with_zero_is_identity() {
        for &a in &[0.0, 0.5, 3.0, 1e6] {
            assert_eq!(combine_ivar(a, 0.0), a);
        }
    }

    #[test]
    fn combine_commutes() {
        let pairs = [(1.0, 2.0), (0.25, 9.0), (0.0, 4.0), (7.0, 7.0)];
        for (a, b) in pairs {
            assert_eq!(combine_ivar(a, b), combine_ivar(b, a));
        }
        // 1/(1/2 + 1/2) = 1
        assert!((combine_ivar(2.0, 2.0) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn guarded_division_never_blows_up() {
        assert_eq!(guarded_div(3.0, 0.0), 0.0);
        assert_eq!(guarded_div(3.0, 2.0), 1.5);
        assert_eq!(ivar_from_var(0.0), 0.0);
        assert_eq!(ivar_from_var(-2.0), 0.0);
        assert_eq!(ivar_from_var(0.5), 2.0);
        assert_eq!(var_from_ivar(0.0), 1.0);
        assert_eq!(var_from_ivar(4.0), 0.25);
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median_mut(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median_mut(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median_mut(&mut []), None);
    }

    #[test]
    fn all_close_matches_numpy_tolerance() {
        let a = [3600.0, 3600.5, 3601.0];
        let b = [3600.0 + 1e-6, 3600.5, 3601.0];
        assert!(all_close(&a, &b, 1e-5, 1e-8));
        let c = [3600.0, 3600.6, 3601.0];
        assert!(!all_close(&a, &c, 1e-5, 1e-8));
        assert!(!all_close(&a, &a[..2], 1e-5, 1e-8));
    }

    #[test]
    fn mean_gradient_of_uniform_grid_is_step() {
        let wave: Vec<f64> = (0..50).map(|i| 5000.0 + 0.8 * i as f64).collect();
        assert!((mean_gradient(&wave) - 0.8).abs() < 1e-12);
    }
}
