//! The processing facade.
//!
//! [`Processor`] is the entry point the presentation layer talks to: it
//! prefers a background [`CloakWorker`] and transparently falls back to
//! running the identical pipeline on the calling thread when the worker
//! cannot be spawned or has been poisoned by a fault.
//!
//! The pipeline itself (decode, detect, attack, assemble) lives in
//! [`run_pipeline`] so both execution contexts share one implementation.

use std::time::Instant;

use crate::{
    attack::{AttackConfig, AttackEngine, AttackMethod, Progress},
    cancel::CancelToken,
    detect::{FaceDetector, HeuristicDetector},
    drop::defer,
    image::{EncodedImage, Image},
    metrics::{self, QualityReport},
    surrogate::{ModelTier, SurrogateFactory},
    tensor::TensorTracker,
    throttle::{Priority, SchedulerThrottle},
    worker::CloakWorker,
    Result,
};

/// Inputs above this pixel count are downscaled (preserving aspect ratio)
/// before the attack. Output dimensions then differ from the input, which
/// the metrics stage compensates for by resampling.
const MAX_ATTACK_PIXELS: u64 = 4096 * 4096;

/// Everything a finished run hands back to the caller.
#[derive(Debug)]
pub struct ProcessOutput {
    /// The perturbed image, compressed toward the output envelope.
    pub image: EncodedImage,
    /// Fidelity of the perturbed image relative to the original. May be
    /// unavailable; never the reason a run fails.
    pub metrics: QualityReport,
    pub metadata: Metadata,
}

/// Run metadata reported alongside the image.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub faces_detected: usize,
    /// The epsilon that was enforced.
    pub epsilon: f32,
    /// Gradient steps actually executed.
    pub iterations: u32,
    pub elapsed_ms: u64,
    /// The surrogate tier the run finished on.
    pub tier: ModelTier,
}

/// Runs cloaking tasks, preferring an isolated worker thread.
pub struct Processor {
    worker: Option<CloakWorker>,
    priority: Priority,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    /// Creates a processor with [`Priority::Normal`].
    pub fn new() -> Self {
        Self::with_priority(Priority::Normal)
    }

    /// Creates a processor that always runs on the calling thread, relying
    /// purely on cooperative yielding. Progress and cancellation are then
    /// synchronous with the attack loop.
    pub fn same_thread() -> Self {
        Self {
            worker: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(priority: Priority) -> Self {
        let worker = match CloakWorker::spawn() {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::warn!("could not spawn background worker ({e}), using calling thread");
                None
            }
        };
        Self { worker, priority }
    }

    /// Whether tasks currently run on the background worker.
    pub fn uses_worker(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_poisoned())
    }

    /// Processes an image with a fresh cancellation token and no progress
    /// reporting.
    pub fn process_image(&mut self, data: &[u8], config: &AttackConfig) -> Result<ProcessOutput> {
        self.process_image_cancellable(data, config, CancelToken::new(), &mut |_| {})
    }

    /// Processes an image. Clone `cancel` beforehand to request cancellation
    /// from another thread; `progress` receives 0-100 percent reports with a
    /// short status string.
    pub fn process_image_cancellable(
        &mut self,
        data: &[u8],
        config: &AttackConfig,
        cancel: CancelToken,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<ProcessOutput> {
        if let Some(worker) = &mut self.worker {
            if !worker.is_poisoned() {
                let result = worker.submit(
                    data.to_vec(),
                    config.clone(),
                    cancel,
                    self.priority,
                    progress,
                );
                if worker.is_poisoned() {
                    // The in-flight task already came back as cancelled;
                    // subsequent work goes to the calling thread.
                    self.worker = None;
                }
                return result;
            }
        }
        run_pipeline(data, config, cancel, self.priority, progress)
    }
}

/// The full pipeline, shared by the worker and the same-thread fallback.
pub(crate) fn run_pipeline(
    data: &[u8],
    config: &AttackConfig,
    cancel: CancelToken,
    priority: Priority,
    progress: &mut dyn FnMut(Progress),
) -> Result<ProcessOutput> {
    let started = Instant::now();
    config.validate()?;
    cancel.bail_if_cancelled()?;

    let original = Image::decode(data)?;
    let working = downscale_for_attack(&original);

    let tracker = TensorTracker::new();
    let leak_check = {
        let tracker = tracker.clone();
        defer(move || {
            // RAII should have returned everything by now, even on the
            // cancellation and error paths.
            if tracker.live_bytes() != 0 {
                log::warn!(
                    "{} bytes of transient tensors still live after run",
                    tracker.live_bytes()
                );
            }
        })
    };

    // Global runs never look at faces; everything else detects once, up
    // front, and threads the regions through all phases.
    let regions = if config.method == AttackMethod::Global {
        Vec::new()
    } else {
        HeuristicDetector::default().detect(&working)
    };

    let factory = SurrogateFactory;
    let mut throttle = SchedulerThrottle::new(tracker.clone(), priority);
    let mut engine = AttackEngine::new(&factory, &mut throttle, tracker.clone(), cancel);
    let outcome = engine.run(&working, &regions, config, progress)?;

    let metrics = metrics::compare(&original, &outcome.image);
    let encoded = outcome.image.encode_to_envelope()?;
    drop(leak_check);

    let metadata = Metadata {
        faces_detected: regions.len(),
        epsilon: config.epsilon,
        iterations: outcome.iterations_run,
        elapsed_ms: started.elapsed().as_millis() as u64,
        tier: outcome.tier,
    };
    log::info!(
        "processed {}x{} image in {}ms ({} face(s), {} iteration(s), {:?} tier)",
        encoded.width,
        encoded.height,
        metadata.elapsed_ms,
        metadata.faces_detected,
        metadata.iterations,
        metadata.tier,
    );

    Ok(ProcessOutput {
        image: encoded,
        metrics,
        metadata,
    })
}

/// Downscales oversized inputs so the attack works on a bounded pixel count.
fn downscale_for_attack(original: &Image) -> Image {
    let pixels = original.pixel_count();
    if pixels <= MAX_ATTACK_PIXELS {
        return original.clone();
    }
    let scale = (MAX_ATTACK_PIXELS as f64 / pixels as f64).sqrt();
    let w = ((f64::from(original.width()) * scale) as u32).max(1);
    let h = ((f64::from(original.height()) * scale) as u32).max(1);
    log::debug!(
        "downscaling {}x{} input to {w}x{h} for the attack",
        original.width(),
        original.height()
    );
    original.resize(w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::ProtectionLevel;

    fn png_bytes(width: u32, height: u32, f: impl FnMut(u32, u32) -> [u8; 4]) -> Vec<u8> {
        let img = Image::from_pixel_fn(width, height, f);
        let mut raw = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                raw.extend_from_slice(&img.get(x, y));
            }
        }
        let mut data = Vec::new();
        use image::ImageEncoder;
        image::codecs::png::PngEncoder::new(&mut data)
            .write_image(&raw, width, height, image::ColorType::Rgba8)
            .unwrap();
        data
    }

    fn textured_png(size: u32) -> Vec<u8> {
        png_bytes(size, size, |x, y| {
            [
                ((x * 5 + y * 3) % 256) as u8,
                ((x * 2 + 40) % 256) as u8,
                ((y * 7 + 90) % 256) as u8,
                255,
            ]
        })
    }

    #[test]
    fn same_thread_pipeline_produces_consistent_output() {
        let data = textured_png(64);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.05,
            iterations: 4,
            region_weights: Vec::new(),
        };
        let out = run_pipeline(
            &data,
            &config,
            CancelToken::new(),
            Priority::High,
            &mut |_| {},
        )
        .unwrap();
        assert_eq!((out.image.width, out.image.height), (64, 64));
        assert_eq!(out.metadata.faces_detected, 0);
        assert_eq!(out.metadata.epsilon, 0.05);
        assert_eq!(out.metadata.iterations, 4);
        assert!(out.metrics.is_available());
    }

    #[test]
    fn pipeline_rejects_invalid_config_before_decoding() {
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 9.0,
            iterations: 4,
            region_weights: Vec::new(),
        };
        let result = run_pipeline(
            b"not an image",
            &config,
            CancelToken::new(),
            Priority::Normal,
            &mut |_| {},
        );
        assert!(matches!(result, Err(crate::CloakError::Validation(_))));
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let data = textured_png(32);
        let config = AttackConfig::preset(AttackMethod::Global, ProtectionLevel::Low);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_pipeline(&data, &config, cancel, Priority::Normal, &mut |_| {});
        assert!(matches!(result, Err(crate::CloakError::Cancelled)));
    }

    #[test]
    fn processor_runs_on_the_worker() {
        let data = textured_png(48);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.03,
            iterations: 2,
            region_weights: Vec::new(),
        };
        let mut processor = Processor::with_priority(Priority::High);
        assert!(processor.uses_worker());
        let mut percents = Vec::new();
        let out = processor
            .process_image_cancellable(&data, &config, CancelToken::new(), &mut |p| {
                percents.push(p.percent)
            })
            .unwrap();
        assert_eq!((out.image.width, out.image.height), (48, 48));
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn downscale_preserves_aspect_ratio() {
        let img = Image::new(8192, 4096);
        let small = downscale_for_attack(&img);
        assert!(small.pixel_count() <= MAX_ATTACK_PIXELS);
        let ratio = f64::from(small.width()) / f64::from(small.height());
        assert!((ratio - 2.0).abs() < 0.01);
    }
}
