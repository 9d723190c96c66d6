//! Face region detection.
//!
//! The engine only needs *rough* face rectangles to scope perturbations, so
//! the built-in [`HeuristicDetector`] trades accuracy for zero model weight:
//! it scores sliding windows over an integral luminance image against a small
//! set of facial contrast bands (eyes dark, nose bridge bright, mouth dark)
//! and deduplicates candidates with greedy non-maximum suppression.
//!
//! Anything smarter can be plugged in through the [`FaceDetector`] trait.
//! Detection itself never fails; an image without faces yields an empty list
//! and it is the caller's business whether that is an error.

use itertools::Itertools;

use crate::{image::Image, num::TotalF32};

/// Score a window must reach to count as a face candidate.
const SCORE_THRESHOLD: f32 = 0.6;

/// Candidates overlapping a kept region by at least this much are suppressed.
const IOU_THRESHOLD: f32 = 0.4;

/// At most this many regions are reported per image.
const MAX_REGIONS: usize = 4;

/// Gain applied to normalized band contrast before clamping to `[0, 1]`.
const CONTRAST_GAIN: f32 = 6.0;

/// Windows with a luminance standard deviation below this are skipped; flat
/// areas produce meaningless contrast scores.
const MIN_WINDOW_STDDEV: f32 = 10.0;

/// An axis-aligned face rectangle in pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    /// Facial landmark points in pixel coordinates, when the detector
    /// produces them. The heuristic detector leaves this empty.
    pub keypoints: Vec<(f32, f32)>,
}

impl FaceRegion {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Whether the pixel at `(x, y)` lies inside this region.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Intersection over union with another region.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let inter = u64::from(x1 - x0) * u64::from(y1 - y0);
        let union = self.area() + other.area() - inter;
        inter as f32 / union as f32
    }
}

/// Locates face regions in an image.
pub trait FaceDetector: Send {
    /// Returns up to a handful of face rectangles, best first.
    ///
    /// An empty result means "no faces", not failure.
    fn detect(&self, image: &Image) -> Vec<FaceRegion>;
}

/// Weight-free sliding-window detector based on facial contrast bands.
#[derive(Debug, Clone)]
pub struct HeuristicDetector {
    /// Smallest window edge that will be considered, in pixels.
    pub min_face_size: u32,
    /// Most regions returned from a single detection, on top of the
    /// built-in [`MAX_REGIONS`] ceiling.
    pub max_faces: usize,
}

impl Default for HeuristicDetector {
    fn default() -> Self {
        Self {
            min_face_size: 24,
            max_faces: MAX_REGIONS,
        }
    }
}

impl FaceDetector for HeuristicDetector {
    fn detect(&self, image: &Image) -> Vec<FaceRegion> {
        let (w, h) = (image.width(), image.height());
        if w < self.min_face_size || h < self.min_face_size {
            return Vec::new();
        }

        let integral = IntegralLuma::new(image);
        let mut candidates = Vec::new();

        // Coarse-to-fine window pyramid, shrinking by 3/4 per level.
        let mut window = w.min(h);
        while window >= self.min_face_size {
            let stride = (window / 4).max(1);
            for y in (0..=h - window).step_by(stride as usize) {
                for x in (0..=w - window).step_by(stride as usize) {
                    if let Some(confidence) = score_window(&integral, x, y, window) {
                        candidates.push(FaceRegion {
                            x,
                            y,
                            width: window,
                            height: window,
                            confidence,
                            keypoints: Vec::new(),
                        });
                    }
                }
            }
            window = window * 3 / 4;
        }

        let kept = suppress(candidates, self.max_faces);
        log::debug!("detected {} face region(s) in {w}x{h} image", kept.len());
        kept
    }
}

/// Greedy non-maximum suppression, best-first, keeping at most
/// `max_regions` survivors (never more than [`MAX_REGIONS`]).
fn suppress(candidates: Vec<FaceRegion>, max_regions: usize) -> Vec<FaceRegion> {
    let cap = max_regions.min(MAX_REGIONS);
    let sorted = candidates
        .into_iter()
        .sorted_unstable_by_key(|r| std::cmp::Reverse(TotalF32(r.confidence)));

    let mut kept: Vec<FaceRegion> = Vec::new();
    for candidate in sorted {
        if kept.len() == cap {
            break;
        }
        if kept.iter().all(|k| k.iou(&candidate) < IOU_THRESHOLD) {
            kept.push(candidate);
        }
    }
    kept
}

/// Scores a square window, or `None` when it is too flat to judge.
fn score_window(integral: &IntegralLuma, x: u32, y: u32, size: u32) -> Option<f32> {
    let (window_mean, stddev) = integral.stats(x, y, size, size);
    if stddev < MIN_WINDOW_STDDEV {
        return None;
    }

    let band = |fx0: f32, fy0: f32, fx1: f32, fy1: f32| {
        let s = size as f32;
        let bx = x + (fx0 * s) as u32;
        let by = y + (fy0 * s) as u32;
        let bw = (((fx1 - fx0) * s) as u32).max(1);
        let bh = (((fy1 - fy0) * s) as u32).max(1);
        integral.mean(bx, by, bw, bh)
    };

    let eyes = band(0.15, 0.20, 0.85, 0.45);
    let nose = band(0.35, 0.40, 0.65, 0.70);
    let mouth = band(0.25, 0.65, 0.75, 0.90);

    let dark = |m: f32| (((window_mean - m) / 255.0) * CONTRAST_GAIN).clamp(0.0, 1.0);
    let bright = |m: f32| (((m - window_mean) / 255.0) * CONTRAST_GAIN).clamp(0.0, 1.0);

    let score = 0.4 * dark(eyes) + 0.25 * bright(nose) + 0.35 * dark(mouth);
    (score >= SCORE_THRESHOLD).then_some(score)
}

/// Summed-area tables over 8-bit luminance, enabling O(1) window statistics.
struct IntegralLuma {
    width: usize,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
}

impl IntegralLuma {
    fn new(image: &Image) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sum_sq = vec![0u64; stride * (h + 1)];
        for y in 0..h {
            for x in 0..w {
                let [r, g, b, _] = image.get(x as u32, y as u32);
                // BT.709 luma, integer approximation.
                let luma = (2126 * u64::from(r) + 7152 * u64::from(g) + 722 * u64::from(b)) / 10000;
                let i = (y + 1) * stride + (x + 1);
                sum[i] = luma + sum[i - 1] + sum[i - stride] - sum[i - stride - 1];
                sum_sq[i] =
                    luma * luma + sum_sq[i - 1] + sum_sq[i - stride] - sum_sq[i - stride - 1];
            }
        }
        Self {
            width: w,
            sum,
            sum_sq,
        }
    }

    fn rect_sums(&self, x: u32, y: u32, w: u32, h: u32) -> (u64, u64) {
        let stride = self.width + 1;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let corner = |table: &[u64]| {
            table[y1 * stride + x1] + table[y0 * stride + x0]
                - table[y0 * stride + x1]
                - table[y1 * stride + x0]
        };
        (corner(&self.sum), corner(&self.sum_sq))
    }

    /// Mean luminance of a rectangle.
    fn mean(&self, x: u32, y: u32, w: u32, h: u32) -> f32 {
        let (s, _) = self.rect_sums(x, y, w, h);
        s as f32 / (w * h) as f32
    }

    /// Mean and standard deviation of a rectangle.
    fn stats(&self, x: u32, y: u32, w: u32, h: u32) -> (f32, f32) {
        let (s, sq) = self.rect_sums(x, y, w, h);
        let n = (w * h) as f32;
        let mean = s as f32 / n;
        let variance = (sq as f32 / n - mean * mean).max(0.0);
        (mean, variance.sqrt())
    }
}
