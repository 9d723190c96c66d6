//! Float tensors and transient memory accounting.
//!
//! All gradient work happens on 3-channel `f32` tensors in `[-1, 1]` value
//! range, laid out as `(channel, height, width)`. Every tensor allocation is
//! charged against a shared [`TensorTracker`] and released again when the
//! tensor is dropped, so the engine always knows how much transient memory a
//! run is holding.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use ndarray::Array3;

use crate::{
    image::{Image, ImageTag},
    CloakError, Result,
};

/// Absolute budget for live transient tensor memory.
pub const MEMORY_BUDGET_BYTES: usize = 800 * 1024 * 1024;

/// Live bytes may grow to this multiple of the session baseline recorded by
/// [`TensorTracker::rebase`] before a charge counts as exhaustion. A run
/// holds the reference, the adversarial copy and one gradient at a time, so
/// anything past four baselines means tensors are leaking.
const GROWTH_LIMIT: usize = 4;

/// Tracks live transient tensor bytes across a processing session.
///
/// Clones share the same counters. The tracker never allocates anything
/// itself; it only keeps the books.
#[derive(Debug, Clone, Default)]
pub struct TensorTracker {
    live: Arc<AtomicUsize>,
    baseline: Arc<AtomicUsize>,
}

impl TensorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live transient tensor bytes right now.
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Live bytes as a fraction of [`MEMORY_BUDGET_BYTES`].
    pub fn pressure(&self) -> f32 {
        self.live_bytes() as f32 / MEMORY_BUDGET_BYTES as f32
    }

    /// Records the current live bytes as the session baseline for the
    /// relative-growth check. Until this is called (or when live bytes are
    /// zero at the time), only the absolute budget applies.
    pub fn rebase(&self) {
        self.baseline.store(self.live_bytes(), Ordering::Relaxed);
    }

    fn over_growth(&self, total: usize) -> bool {
        let baseline = self.baseline.load(Ordering::Relaxed);
        baseline > 0 && total > baseline * GROWTH_LIMIT
    }

    /// Charges `bytes` against the budget, returning a guard that refunds
    /// them on drop.
    ///
    /// Fails with [`CloakError::ResourceExhausted`] when the charge would
    /// push live memory over the absolute budget, or past [`GROWTH_LIMIT`]
    /// times the session baseline. Superseded buffers are refunded the
    /// moment their guard drops, so there is nothing left to reclaim by the
    /// time a charge fails; the failure is final.
    pub fn charge(&self, bytes: usize) -> Result<Charge> {
        let prev = self.live.fetch_add(bytes, Ordering::Relaxed);
        let total = prev + bytes;
        if total > MEMORY_BUDGET_BYTES || self.over_growth(total) {
            self.live.fetch_sub(bytes, Ordering::Relaxed);
            return Err(CloakError::ResourceExhausted {
                live: prev,
                budget: MEMORY_BUDGET_BYTES,
            });
        }
        Ok(Charge {
            live: self.live.clone(),
            bytes,
        })
    }
}

/// RAII guard for a tracked allocation. Refunds its bytes when dropped.
#[derive(Debug)]
pub struct Charge {
    live: Arc<AtomicUsize>,
    bytes: usize,
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.live.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// Maps an 8-bit color value into the `[-1, 1]` tensor range.
#[inline]
pub(crate) fn map_color(v: u8) -> f32 {
    (f32::from(v) / 255.0 - 0.5) * 2.0
}

/// Maps a tensor value back to 8 bits, rounding and clamping.
#[inline]
pub(crate) fn unmap_color(v: f32) -> u8 {
    ((v / 2.0 + 0.5) * 255.0).round().clamp(0.0, 255.0) as u8
}

/// A 3-channel `f32` image tensor in `(channel, height, width)` layout.
///
/// Values are nominally in `[-1, 1]`; operations that can leave the range
/// (gradient steps) are followed by an explicit projection.
#[derive(Debug)]
pub struct Tensor {
    data: Array3<f32>,
    _charge: Charge,
}

impl Tensor {
    /// Converts an image into a tensor, dropping the alpha channel.
    pub fn from_image(image: &Image, tracker: &TensorTracker) -> Result<Self> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let charge = tracker.charge(3 * w * h * std::mem::size_of::<f32>())?;
        let mut data = Array3::zeros((3, h, w));
        for y in 0..h {
            for x in 0..w {
                let [r, g, b, _] = image.get(x as u32, y as u32);
                data[(0, y, x)] = map_color(r);
                data[(1, y, x)] = map_color(g);
                data[(2, y, x)] = map_color(b);
            }
        }
        Ok(Self {
            data,
            _charge: charge,
        })
    }

    /// Allocates a zeroed tensor with the same shape as `like`.
    pub fn zeros_like(like: &Tensor, tracker: &TensorTracker) -> Result<Self> {
        let charge = tracker.charge(like.byte_len())?;
        Ok(Self {
            data: Array3::zeros(like.data.raw_dim()),
            _charge: charge,
        })
    }

    /// Clones the tensor, charging the copy against `tracker`.
    pub fn duplicate(&self, tracker: &TensorTracker) -> Result<Self> {
        let charge = tracker.charge(self.byte_len())?;
        Ok(Self {
            data: self.data.clone(),
            _charge: charge,
        })
    }

    /// Converts the tensor back to an image, restoring per-pixel alpha from
    /// `alpha_from` (which must have the same dimensions).
    pub fn to_image(&self, alpha_from: &Image) -> Image {
        let (w, h) = (self.width(), self.height());
        debug_assert_eq!((alpha_from.width(), alpha_from.height()), (w, h));
        let mut out = Image::from_pixel_fn(w, h, |x, y| {
            let (xu, yu) = (x as usize, y as usize);
            let a = alpha_from.get(x, y)[3];
            [
                unmap_color(self.data[(0, yu, xu)]),
                unmap_color(self.data[(1, yu, xu)]),
                unmap_color(self.data[(2, yu, xu)]),
                a,
            ]
        });
        if alpha_from.tag() == ImageTag::Processed {
            out = out.into_processed();
        }
        out
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.data.shape()[2] as u32
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.data.shape()[1] as u32
    }

    /// Size of the backing buffer, in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c, y, x)]
    }

    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, v: f32) {
        self.data[(c, y, x)] = v;
    }

    /// Borrows the backing array.
    pub fn view(&self) -> &Array3<f32> {
        &self.data
    }

    /// Mutably borrows the backing array.
    pub fn view_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    /// Adds `step * direction.signum()` to every element.
    pub fn add_signed_step(&mut self, direction: &Tensor, step: f32) {
        ndarray::Zip::from(&mut self.data)
            .and(&direction.data)
            .for_each(|v, &d| *v += step * d.signum());
    }

    /// Projects the tensor into the intersection of the `radius`-ball around
    /// `center` (per element, L-inf) and the valid `[-1, 1]` value range.
    pub fn project(&mut self, center: &Tensor, radius: f32) {
        ndarray::Zip::from(&mut self.data)
            .and(&center.data)
            .for_each(|v, &c| {
                *v = v.clamp(c - radius, c + radius).clamp(-1.0, 1.0);
            });
    }

    /// Largest absolute element difference against `other`.
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        ndarray::Zip::from(&self.data)
            .and(&other.data)
            .fold(0.0f32, |acc, &a, &b| acc.max((a - b).abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_mapping_roundtrips() {
        for v in [0u8, 1, 127, 128, 254, 255] {
            assert_eq!(unmap_color(map_color(v)), v);
        }
        assert_eq!(map_color(0), -1.0);
        assert_eq!(map_color(255), 1.0);
    }

    #[test]
    fn image_roundtrip_is_lossless() {
        let img = Image::from_pixel_fn(7, 5, |x, y| [(x * 30) as u8, (y * 50) as u8, 200, 77]);
        let tracker = TensorTracker::new();
        let tensor = Tensor::from_image(&img, &tracker).unwrap();
        let back = tensor.to_image(&img);
        for y in 0..5 {
            for x in 0..7 {
                assert_eq!(back.get(x, y), img.get(x, y));
            }
        }
    }

    #[test]
    fn tracker_refunds_on_drop() {
        let tracker = TensorTracker::new();
        let img = Image::new(16, 16);
        let tensor = Tensor::from_image(&img, &tracker).unwrap();
        assert_eq!(tracker.live_bytes(), tensor.byte_len());
        drop(tensor);
        assert_eq!(tracker.live_bytes(), 0);
    }

    #[test]
    fn tracker_rejects_over_budget_charges() {
        let tracker = TensorTracker::new();
        let err = tracker.charge(MEMORY_BUDGET_BYTES + 1).unwrap_err();
        assert!(matches!(err, CloakError::ResourceExhausted { .. }));
        // A failed charge must not leak into the counter.
        assert_eq!(tracker.live_bytes(), 0);
    }

    #[test]
    fn growth_past_the_baseline_is_exhaustion() {
        let tracker = TensorTracker::new();
        let _base = tracker.charge(1024).unwrap();
        tracker.rebase();

        // Well under the absolute budget, but more than four baselines.
        let err = tracker.charge(5 * 1024).unwrap_err();
        assert!(matches!(err, CloakError::ResourceExhausted { .. }));
        assert_eq!(tracker.live_bytes(), 1024);

        // Growth within the limit is still fine.
        let _ok = tracker.charge(2 * 1024).unwrap();
        assert_eq!(tracker.live_bytes(), 3 * 1024);
    }

    #[test]
    fn projection_stays_in_ball_and_range() {
        let tracker = TensorTracker::new();
        let img = Image::new(4, 4);
        let center = Tensor::from_image(&img, &tracker).unwrap();
        let mut t = center.duplicate(&tracker).unwrap();
        t.set(0, 0, 0, 5.0);
        t.set(1, 1, 1, -5.0);
        t.project(&center, 0.1);
        assert!(t.max_abs_diff(&center) <= 0.1 + 1e-6);
        assert!(t.view().iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
