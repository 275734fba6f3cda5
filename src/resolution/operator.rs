//! Band-diagonal resolution operator.
//!
//! Coefficients are stored the way spectrograph reductions store them
//! (scipy's DIA layout): `ndiag` rows of length `nwave`, row `k` holding the
//! diagonal with offset `h - k` where `h = ndiag / 2`:
//!
//! ```text
//! R[i, j] = data[k, j]    with  j - i = h - k
//! ```
//!
//! So the main diagonal is row `h`, and coefficients are indexed by the
//! *column* (true-spectrum pixel) they multiply.

use nalgebra::DMatrix;

use crate::error::SkyError;
use crate::math::BandedSymmetric;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    ndiag: usize,
    nwave: usize,
    data: Vec<f64>,
}

impl Resolution {
    /// Build from row-major `[ndiag][nwave]` coefficients.
    pub fn new(ndiag: usize, nwave: usize, data: Vec<f64>) -> Result<Self, SkyError> {
        if ndiag % 2 == 0 {
            return Err(SkyError::shape("resolution ndiag", "an odd number", ndiag));
        }
        if data.len() != ndiag * nwave {
            return Err(SkyError::shape(
                "resolution data",
                format!("{ndiag}x{nwave}"),
                format!("{} values", data.len()),
            ));
        }
        Ok(Self { ndiag, nwave, data })
    }

    /// The identity operator (a perfectly resolved instrument).
    pub fn identity(nwave: usize) -> Self {
        Self {
            ndiag: 1,
            nwave,
            data: vec![1.0; nwave],
        }
    }

    pub fn ndiag(&self) -> usize {
        self.ndiag
    }

    pub fn nwave(&self) -> usize {
        self.nwave
    }

    pub fn half_width(&self) -> usize {
        self.ndiag / 2
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Non-zero pattern of row `i` as `(column, coefficient)` pairs.
    fn row_entries(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let h = self.half_width();
        let lo = i.saturating_sub(h);
        let hi = (i + h).min(self.nwave - 1);
        (lo..=hi).map(move |j| {
            // offset = j - i = h - k
            let k = h + i - j;
            (j, self.data[k * self.nwave + j])
        })
    }

    /// `R[i, j]` (0 outside the band).
    pub fn coefficient(&self, i: usize, j: usize) -> f64 {
        let h = self.half_width();
        if i >= self.nwave || j >= self.nwave || i.abs_diff(j) > h {
            return 0.0;
        }
        self.data[(h + i - j) * self.nwave + j]
    }

    /// Forward convolution: true spectrum -> observed spectrum.
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.nwave);
        (0..self.nwave)
            .map(|i| self.row_entries(i).map(|(j, r)| r * x[j]).sum())
            .collect()
    }

    /// `Rᵗ y`.
    pub fn apply_transpose(&self, y: &[f64]) -> Vec<f64> {
        debug_assert_eq!(y.len(), self.nwave);
        let mut out = vec![0.0; self.nwave];
        for (i, &yi) in y.iter().enumerate() {
            if yi == 0.0 {
                continue;
            }
            for (j, r) in self.row_entries(i) {
                out[j] += r * yi;
            }
        }
        out
    }

    /// Row-scaled copy `diag(sqrtw) · R`.
    pub fn weighted(&self, sqrtw: &[f64]) -> Resolution {
        debug_assert_eq!(sqrtw.len(), self.nwave);
        let h = self.half_width();
        let mut data = self.data.clone();
        for k in 0..self.ndiag {
            for j in 0..self.nwave {
                // Row index of this coefficient: i = j - (h - k).
                let i = (j + k) as isize - h as isize;
                let idx = k * self.nwave + j;
                if i >= 0 && (i as usize) < self.nwave {
                    data[idx] *= sqrtw[i as usize];
                } else {
                    data[idx] = 0.0;
                }
            }
        }
        Resolution {
            ndiag: self.ndiag,
            nwave: self.nwave,
            data,
        }
    }

    /// `(Rᵗ R, Rᵗ y)` for an operator that already carries the row weights.
    pub fn normal_equation_contribution(&self, sqrtwflux: &[f64]) -> (BandedSymmetric, Vec<f64>) {
        let mut a = BandedSymmetric::zeros(self.nwave, 2 * self.half_width());
        let mut entries: Vec<(usize, f64)> = Vec::with_capacity(self.ndiag);
        for i in 0..self.nwave {
            entries.clear();
            entries.extend(self.row_entries(i).filter(|&(_, r)| r != 0.0));
            for (p, &(jp, rp)) in entries.iter().enumerate() {
                for &(jq, rq) in &entries[..=p] {
                    a.add_at(jp, jq, rp * rq);
                }
            }
        }
        (a, self.apply_transpose(sqrtwflux))
    }

    /// `R · C · Rᵗ`, used to propagate a deconvolved covariance to a fiber.
    pub fn sandwich(&self, covariance: &DMatrix<f64>) -> DMatrix<f64> {
        let n = self.nwave;
        debug_assert_eq!(covariance.shape(), (n, n));

        let mut rc = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            for (j, r) in self.row_entries(i) {
                for m in 0..n {
                    rc[(i, m)] += r * covariance[(j, m)];
                }
            }
        }

        let mut out = DMatrix::<f64>::zeros(n, n);
        for l in 0..n {
            for (j, r) in self.row_entries(l) {
                for i in 0..n {
                    out[(i, l)] += rc[(i, j)] * r;
                }
            }
        }
        out
    }

    /// Diagonal of [`Resolution::sandwich`] without forming the full product.
    pub fn sandwich_diagonal(&self, covariance: &DMatrix<f64>) -> Vec<f64> {
        (0..self.nwave)
            .map(|i| {
                let row: Vec<(usize, f64)> = self.row_entries(i).collect();
                let mut acc = 0.0;
                for &(j, rj) in &row {
                    for &(l, rl) in &row {
                        acc += rj * rl * covariance[(j, l)];
                    }
                }
                acc
            })
            .collect()
    }

    /// Sum of two operators on the same grid (the narrower band is zero-padded).
    pub fn add(&self, other: &Resolution) -> Result<Resolution, SkyError> {
        if self.nwave != other.nwave {
            return Err(SkyError::shape("resolution nwave", self.nwave, other.nwave));
        }
        let ndiag = self.ndiag.max(other.ndiag);
        let h = ndiag / 2;
        let mut data = vec![0.0; ndiag * self.nwave];
        for op in [self, other] {
            let shift = h - op.half_width();
            for k in 0..op.ndiag {
                let dst = (k + shift) * self.nwave;
                let src = k * op.nwave;
                for j in 0..self.nwave {
                    data[dst + j] += op.data[src + j];
                }
            }
        }
        Resolution::new(ndiag, self.nwave, data)
    }

    /// Operator whose coefficients are the mean over all fibers' coefficients.
    pub fn mean(operators: &[Resolution]) -> Result<Resolution, SkyError> {
        let Some(first) = operators.first() else {
            return Err(SkyError::shape("resolution list", "at least one fiber", 0));
        };
        let mut data = vec![0.0; first.data.len()];
        for op in operators {
            if op.ndiag != first.ndiag || op.nwave != first.nwave {
                return Err(SkyError::shape(
                    "resolution data",
                    format!("{}x{}", first.ndiag, first.nwave),
                    format!("{}x{}", op.ndiag, op.nwave),
                ));
            }
            for (acc, v) in data.iter_mut().zip(op.data.iter()) {
                *acc += v;
            }
        }
        let n = operators.len() as f64;
        data.iter_mut().for_each(|v| *v /= n);
        Resolution::new(first.ndiag, first.nwave, data)
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut out = DMatrix::<f64>::zeros(self.nwave, self.nwave);
        for i in 0..self.nwave {
            for (j, r) in self.row_entries(i) {
                out[(i, j)] = r;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn tridiagonal(nwave: usize) -> Resolution {
        // Rows: offset +1, 0, -1. Vary coefficients with j so layout mistakes show up.
        let mut data = Vec::with_capacity(3 * nwave);
        for k in 0..3 {
            for j in 0..nwave {
                data.push(match k {
                    1 => 0.6 + 0.01 * j as f64,
                    _ => 0.2 - 0.005 * k as f64,
                });
            }
        }
        Resolution::new(3, nwave, data).unwrap()
    }

    #[test]
    fn rejects_even_ndiag_and_bad_length() {
        assert!(Resolution::new(2, 4, vec![0.0; 8]).is_err());
        assert!(Resolution::new(3, 4, vec![0.0; 11]).is_err());
    }

    #[test]
    fn dia_layout_places_offsets_on_columns() {
        let r = tridiagonal(5);
        // Row 0 is offset +1: R[i, i+1] = data[0, i+1].
        assert_eq!(r.coefficient(1, 2), r.data()[2]);
        // Row 2 is offset -1: R[i, i-1] = data[2, i-1].
        assert_eq!(r.coefficient(3, 2), r.data()[2 * 5 + 2]);
        assert_eq!(r.coefficient(0, 3), 0.0);
    }

    #[test]
    fn apply_matches_dense_product() {
        let r = tridiagonal(6);
        let x: Vec<f64> = (0..6).map(|i| (i as f64).sin() + 2.0).collect();
        let dense = r.to_dense() * DVector::from_column_slice(&x);
        let banded = r.apply(&x);
        for (a, b) in dense.iter().zip(banded.iter()) {
            assert!((a - b).abs() < 1e-14);
        }
        let t = r.to_dense().transpose() * DVector::from_column_slice(&x);
        for (a, b) in t.iter().zip(r.apply_transpose(&x).iter()) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn weighted_scales_rows() {
        let r = tridiagonal(5);
        let sqrtw = [1.0, 2.0, 0.0, 0.5, 3.0];
        let w = r.weighted(&sqrtw);
        for i in 0..5 {
            for j in 0..5 {
                assert!((w.coefficient(i, j) - sqrtw[i] * r.coefficient(i, j)).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn normal_contribution_matches_dense() {
        let r = tridiagonal(7);
        let sqrtw: Vec<f64> = (0..7).map(|i| 1.0 + 0.1 * i as f64).collect();
        let y: Vec<f64> = (0..7).map(|i| 3.0 - 0.2 * i as f64).collect();
        let sw = r.weighted(&sqrtw);
        let (a, b) = sw.normal_equation_contribution(&y);

        let d = sw.to_dense();
        let expected_a = d.transpose() * &d;
        let expected_b = d.transpose() * DVector::from_column_slice(&y);
        assert!((a.to_dense() - expected_a).abs().max() < 1e-12);
        for (x, e) in b.iter().zip(expected_b.iter()) {
            assert!((x - e).abs() < 1e-12);
        }
    }

    #[test]
    fn sandwich_matches_dense() {
        let r = tridiagonal(5);
        let c = DMatrix::from_fn(5, 5, |i, j| 1.0 / (1.0 + i.abs_diff(j) as f64));
        let expected = r.to_dense() * &c * r.to_dense().transpose();
        let got = r.sandwich(&c);
        assert!((got - &expected).abs().max() < 1e-12);
        let diag = r.sandwich_diagonal(&c);
        for i in 0..5 {
            assert!((diag[i] - expected[(i, i)]).abs() < 1e-12);
        }
    }

    #[test]
    fn operators_compose_additively() {
        let r = tridiagonal(4);
        let sum = r.add(&Resolution::identity(4)).unwrap();
        let expected = r.to_dense() + DMatrix::<f64>::identity(4, 4);
        assert!((sum.to_dense() - expected).abs().max() < 1e-15);
    }

    #[test]
    fn mean_averages_coefficients() {
        let a = Resolution::identity(3);
        let b = Resolution::new(1, 3, vec![3.0; 3]).unwrap();
        let m = Resolution::mean(&[a, b]).unwrap();
        assert_eq!(m.data(), &[2.0, 2.0, 2.0]);
        assert!(Resolution::mean(&[]).is_err());
    }
}
