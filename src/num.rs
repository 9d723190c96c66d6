//! Utilities for numerics.

use std::cmp::Ordering;

/// An `f32` that implements [`Ord`] according to the IEEE 754 totalOrder predicate.
#[derive(Clone, Copy)]
pub struct TotalF32(pub f32);

impl PartialEq for TotalF32 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// The logistic function, mapping any real number into `(0, 1)`.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable in-place softmax.
///
/// Does nothing when `xs` is empty.
pub fn softmax(xs: &mut [f32]) {
    let Some(max) = xs.iter().copied().max_by(|a, b| a.total_cmp(b)) else {
        return;
    };
    let mut sum = 0.0;
    for x in xs.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in xs.iter_mut() {
        *x /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_f32_sorts_nan_last() {
        let mut v = [TotalF32(0.5), TotalF32(f32::NAN), TotalF32(-1.0)];
        v.sort_unstable();
        assert_eq!(v[0].0, -1.0);
        assert_eq!(v[1].0, 0.5);
        assert!(v[2].0.is_nan());
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut xs = [1.0, 2.0, 3.0];
        softmax(&mut xs);
        let sum: f32 = xs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(xs[2] > xs[1] && xs[1] > xs[0]);
    }

    #[test]
    fn softmax_handles_large_inputs() {
        let mut xs = [1000.0, 1001.0];
        softmax(&mut xs);
        assert!(xs.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn sigmoid_range() {
        assert!(sigmoid(-20.0) < 0.001);
        assert!(sigmoid(20.0) > 0.999);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    }
}
