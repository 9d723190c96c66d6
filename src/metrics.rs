//! Image fidelity metrics.
//!
//! Metrics are informational only. They never fail the surrounding pipeline:
//! when anything goes numerically wrong (a NaN sneaking in, degenerate
//! dimensions), the whole report is marked unavailable and delivery of the
//! processed image continues.

use crate::image::Image;

// Standard SSIM stabilization constants for 8-bit dynamic range.
const C1: f32 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f32 = (0.03 * 255.0) * (0.03 * 255.0);

/// Fidelity of a processed image relative to its original.
///
/// `None` means the value could not be computed. All fields become
/// unavailable together; a partially-trustworthy report is worse than none.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    /// Peak signal-to-noise ratio in dB. `f32::INFINITY` for identical
    /// images.
    pub psnr: Option<f32>,
    /// Simplified single-window luminance SSIM, roughly in `[0, 1]`.
    pub ssim: Option<f32>,
    /// Mean squared RGB error.
    pub mse: Option<f32>,
    /// Root-mean-square error normalized by the 8-bit dynamic range, in
    /// `[0, 1]`.
    pub nrmse: Option<f32>,
    /// Mean per-pixel Euclidean RGB distance.
    pub perceptual: Option<f32>,
}

impl QualityReport {
    /// A report with every field unavailable.
    pub fn unavailable() -> Self {
        Self {
            psnr: None,
            ssim: None,
            mse: None,
            nrmse: None,
            perceptual: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.psnr.is_some()
    }
}

/// Compares a processed image against the original it came from.
///
/// When dimensions differ (the engine may downscale internally), the
/// original is resampled to the processed dimensions first.
pub fn compare(original: &Image, processed: &Image) -> QualityReport {
    let resampled;
    let original = if (original.width(), original.height())
        != (processed.width(), processed.height())
    {
        resampled = original.resize(processed.width(), processed.height());
        &resampled
    } else {
        original
    };

    let (w, h) = (processed.width(), processed.height());
    if w == 0 || h == 0 {
        return QualityReport::unavailable();
    }
    let pixels = (w as f64 * h as f64) as f32;

    let mut sq_err_sum = 0.0f64;
    let mut dist_sum = 0.0f64;
    let mut luma = LumaStats::default();

    for y in 0..h {
        for x in 0..w {
            let a = original.get(x, y);
            let b = processed.get(x, y);
            let dr = f32::from(a[0]) - f32::from(b[0]);
            let dg = f32::from(a[1]) - f32::from(b[1]);
            let db = f32::from(a[2]) - f32::from(b[2]);
            let sq = dr * dr + dg * dg + db * db;
            sq_err_sum += f64::from(sq);
            dist_sum += f64::from(sq.sqrt());
            luma.accumulate(luminance(a), luminance(b));
        }
    }

    let mse = (sq_err_sum / f64::from(pixels * 3.0)) as f32;
    let nrmse = mse.sqrt() / 255.0;
    let perceptual = (dist_sum / f64::from(pixels)) as f32;
    let psnr = if mse == 0.0 {
        f32::INFINITY
    } else {
        10.0 * (255.0f32 * 255.0 / mse).log10()
    };
    let ssim = luma.ssim(pixels);

    if mse.is_nan() || nrmse.is_nan() || perceptual.is_nan() || psnr.is_nan() || ssim.is_nan() {
        log::warn!("quality metrics produced NaN, reporting unavailable");
        return QualityReport::unavailable();
    }

    QualityReport {
        psnr: Some(psnr),
        ssim: Some(ssim),
        mse: Some(mse),
        nrmse: Some(nrmse),
        perceptual: Some(perceptual),
    }
}

fn luminance(rgba: [u8; 4]) -> f32 {
    0.2126 * f32::from(rgba[0]) + 0.7152 * f32::from(rgba[1]) + 0.0722 * f32::from(rgba[2])
}

/// Accumulates the moments needed for single-window SSIM over luminance.
#[derive(Default)]
struct LumaStats {
    sum_a: f64,
    sum_b: f64,
    sum_aa: f64,
    sum_bb: f64,
    sum_ab: f64,
}

impl LumaStats {
    fn accumulate(&mut self, a: f32, b: f32) {
        let (a, b) = (f64::from(a), f64::from(b));
        self.sum_a += a;
        self.sum_b += b;
        self.sum_aa += a * a;
        self.sum_bb += b * b;
        self.sum_ab += a * b;
    }

    fn ssim(&self, pixels: f32) -> f32 {
        let n = f64::from(pixels);
        let mean_a = self.sum_a / n;
        let mean_b = self.sum_b / n;
        let var_a = (self.sum_aa / n - mean_a * mean_a).max(0.0);
        let var_b = (self.sum_bb / n - mean_b * mean_b).max(0.0);
        let cov = self.sum_ab / n - mean_a * mean_b;

        let (c1, c2) = (f64::from(C1), f64::from(C2));
        let numerator = (2.0 * mean_a * mean_b + c1) * (2.0 * cov + c2);
        let denominator = (mean_a * mean_a + mean_b * mean_b + c1) * (var_a + var_b + c2);
        (numerator / denominator) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gradient_image(size: u32) -> Image {
        Image::from_pixel_fn(size, size, |x, y| {
            [(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8, 255]
        })
    }

    #[test]
    fn identical_images_are_perfect() {
        let img = gradient_image(32);
        let report = compare(&img, &img);
        assert_eq!(report.psnr, Some(f32::INFINITY));
        assert_eq!(report.mse, Some(0.0));
        assert_eq!(report.nrmse, Some(0.0));
        assert_eq!(report.perceptual, Some(0.0));
        assert_relative_eq!(report.ssim.unwrap(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn constant_offset_has_known_mse_and_psnr() {
        let a = Image::from_pixel_fn(16, 16, |_, _| [100, 100, 100, 255]);
        let b = Image::from_pixel_fn(16, 16, |_, _| [110, 110, 110, 255]);
        let report = compare(&a, &b);
        assert_relative_eq!(report.mse.unwrap(), 100.0, epsilon = 1e-3);
        // sqrt(100) / 255
        assert_relative_eq!(report.nrmse.unwrap(), 10.0 / 255.0, epsilon = 1e-4);
        // 10 * log10(255^2 / 100)
        assert_relative_eq!(report.psnr.unwrap(), 28.13, epsilon = 0.01);
        // Euclidean distance of (10,10,10) per pixel.
        assert_relative_eq!(
            report.perceptual.unwrap(),
            (300.0f32).sqrt(),
            epsilon = 1e-3
        );
    }

    #[test]
    fn mismatched_dimensions_resample_instead_of_failing() {
        let original = gradient_image(64);
        let processed = original.resize(32, 32);
        let report = compare(&original, &processed);
        assert!(report.is_available());
        // Lanczos resampling of the same content should stay close.
        assert!(report.psnr.unwrap() > 20.0);
    }

    #[test]
    fn small_perturbations_score_high_ssim() {
        let a = gradient_image(32);
        let b = Image::from_pixel_fn(32, 32, |x, y| {
            let [r, g, bl, al] = a.get(x, y);
            [r.saturating_add(2), g, bl, al]
        });
        let report = compare(&a, &b);
        assert!(report.ssim.unwrap() > 0.99);
        assert!(report.psnr.unwrap() > 35.0);
    }

    #[test]
    fn unavailable_report_has_no_fields() {
        let r = QualityReport::unavailable();
        assert!(!r.is_available());
        assert_eq!(r, QualityReport {
            psnr: None,
            ssim: None,
            mse: None,
            nrmse: None,
            perceptual: None,
        });
    }
}
