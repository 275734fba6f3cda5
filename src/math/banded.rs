//! Symmetric band matrix storage for the normal equations.
//!
//! `RᵗWR` for a band-diagonal `R` of half-width `h` is itself banded with
//! half-width `2h`. We only keep the lower band:
//!
//! ```text
//! data[d * n + i] = A[i, i - d]    for d in 0..=bandwidth, i >= d
//! ```
//!
//! Contributions are summed with [`BandedSymmetric::add`] and only densified
//! when the solver needs a dense factorization.

use nalgebra::DMatrix;

#[derive(Debug, Clone, PartialEq)]
pub struct BandedSymmetric {
    n: usize,
    bandwidth: usize,
    data: Vec<f64>,
}

impl BandedSymmetric {
    pub fn zeros(n: usize, bandwidth: usize) -> Self {
        Self {
            n,
            bandwidth,
            data: vec![0.0; (bandwidth + 1) * n],
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn bandwidth(&self) -> usize {
        self.bandwidth
    }

    /// `A[i, j]` (0 outside the band).
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (hi, lo) = if i >= j { (i, j) } else { (j, i) };
        let d = hi - lo;
        if d > self.bandwidth || hi >= self.n {
            return 0.0;
        }
        self.data[d * self.n + hi]
    }

    /// Accumulate `value` into `A[i, j]` (and thereby `A[j, i]`).
    ///
    /// # Panics
    /// Panics if `|i - j|` exceeds the bandwidth.
    pub fn add_at(&mut self, i: usize, j: usize, value: f64) {
        let (hi, lo) = if i >= j { (i, j) } else { (j, i) };
        let d = hi - lo;
        assert!(d <= self.bandwidth, "entry ({i}, {j}) outside band {}", self.bandwidth);
        self.data[d * self.n + hi] += value;
    }

    pub fn diagonal(&self) -> Vec<f64> {
        self.data[..self.n].to_vec()
    }

    /// Sum of two matrices over the same grid; the result keeps the wider band.
    pub fn add(mut self, other: &BandedSymmetric) -> BandedSymmetric {
        debug_assert_eq!(self.n, other.n);
        if other.bandwidth > self.bandwidth {
            let mut widened = BandedSymmetric::zeros(self.n, other.bandwidth);
            widened.data[..self.data.len()].copy_from_slice(&self.data);
            self = widened;
        }
        let len = other.data.len();
        for (a, b) in self.data[..len].iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        self
    }

    /// Dense copy restricted to the given (sorted) index subset.
    pub fn to_dense_subset(&self, indices: &[usize]) -> DMatrix<f64> {
        let m = indices.len();
        let mut out = DMatrix::<f64>::zeros(m, m);
        for (a, &i) in indices.iter().enumerate() {
            for (b, &j) in indices.iter().enumerate().take(a + 1) {
                let v = self.get(i, j);
                out[(a, b)] = v;
                out[(b, a)] = v;
            }
        }
        out
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut out = DMatrix::<f64>::zeros(self.n, self.n);
        for d in 0..=self.bandwidth.min(self.n.saturating_sub(1)) {
            for i in d..self.n {
                let v = self.data[d * self.n + i];
                out[(i, i - d)] = v;
                out[(i - d, i)] = v;
            }
        }
        out
    }
}
