//! The adversarial perturbation engine.
//!
//! Three attack methods are supported:
//!
//! - **Global**: FGSM or I-FGSM over the whole image. Single-step when
//!   `iterations == 1`, iterative otherwise.
//! - **Face-scoped**: the same gradient attack, masked to the detected face
//!   regions (and weighted per region). Fails with
//!   [`CloakError::NoFaceDetected`] when there are no regions.
//! - **Combined**: a face-scoped pass of fixed sinusoidal noise patterns
//!   first, then a global iterative pass. Progress is split evenly between
//!   the phases, and the second phase reuses the first phase's detections.
//!
//! Whatever the method, the cumulative perturbation is projected back into
//! the epsilon-ball around the original after every change, so the bound
//! holds unconditionally. Gradients come from a fresh [`SurrogateModel`]
//! (via [`ModelFactory`]); when the gradient evaluation faults, the engine
//! downgrades to a coarser model tier, halves the remaining iterations and
//! resumes from the current adversarial state instead of aborting.
//!
//! [`SurrogateModel`]: crate::surrogate::SurrogateModel

use std::f32::consts::TAU;

use ndarray::{Array2, Axis, Zip};

use crate::{
    cancel::CancelToken,
    detect::FaceRegion,
    image::Image,
    surrogate::{ModelFactory, ModelTier},
    tensor::{Tensor, TensorTracker},
    throttle::SchedulerThrottle,
    CloakError, Result,
};

/// Where the perturbation is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackMethod {
    /// Perturb only the detected face regions.
    FaceScoped,
    /// Perturb the whole image.
    Global,
    /// Face-scoped pattern pass, then a global gradient pass.
    Combined,
}

/// Named strength presets mapping to `(epsilon, iterations)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    Low,
    Medium,
    High,
    Maximum,
}

impl ProtectionLevel {
    fn parameters(self) -> (f32, u32) {
        match self {
            ProtectionLevel::Low => (0.02, 10),
            ProtectionLevel::Medium => (0.05, 20),
            ProtectionLevel::High => (0.08, 35),
            ProtectionLevel::Maximum => (0.12, 50),
        }
    }
}

/// Full parameterization of one attack run.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    pub method: AttackMethod,
    /// Perturbation bound per channel, on the `[0, 1]` pixel scale.
    pub epsilon: f32,
    /// Gradient steps for the iterative methods.
    pub iterations: u32,
    /// Strength weight per detected region, best-first. Regions beyond the
    /// end of this list get weight 1.
    pub region_weights: Vec<f32>,
}

/// Largest accepted epsilon. Anything stronger is plainly visible.
pub const MAX_EPSILON: f32 = 0.12;

/// Most gradient steps a single run may take.
pub const MAX_ITERATIONS: u32 = 50;

impl AttackConfig {
    /// Builds a config from a named protection level.
    pub fn preset(method: AttackMethod, level: ProtectionLevel) -> Self {
        let (epsilon, iterations) = level.parameters();
        Self {
            method,
            epsilon,
            iterations,
            region_weights: Vec::new(),
        }
    }

    /// Checks parameter ranges. Called once at the start of every run.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=MAX_EPSILON).contains(&self.epsilon) {
            return Err(CloakError::Validation(format!(
                "epsilon {} out of range [0, {MAX_EPSILON}]",
                self.epsilon
            )));
        }
        if !(1..=MAX_ITERATIONS).contains(&self.iterations) {
            return Err(CloakError::Validation(format!(
                "iterations {} out of range [1, {MAX_ITERATIONS}]",
                self.iterations
            )));
        }
        if self
            .region_weights
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(CloakError::Validation(
                "region weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }

    fn weight(&self, region_index: usize) -> f32 {
        self.region_weights.get(region_index).copied().unwrap_or(1.0)
    }
}

/// A progress report delivered between steps.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Completion in percent, `0..=100`.
    pub percent: u8,
    /// Short human-readable status.
    pub status: String,
}

/// What an attack run produced.
#[derive(Debug)]
pub struct AttackOutcome {
    /// The perturbed image, tagged processed, same dimensions as the input.
    pub image: Image,
    /// Gradient steps actually executed (may be fewer than configured after
    /// a backend fallback).
    pub iterations_run: u32,
    /// The model tier the run finished on.
    pub tier: ModelTier,
}

/// Drives a single attack run over an image.
///
/// The engine owns no image state; everything transient lives for one call
/// to [`AttackEngine::run`] and is accounted in the shared tracker.
pub struct AttackEngine<'a> {
    factory: &'a dyn ModelFactory,
    throttle: &'a mut SchedulerThrottle,
    tracker: TensorTracker,
    cancel: CancelToken,
}

impl<'a> AttackEngine<'a> {
    pub fn new(
        factory: &'a dyn ModelFactory,
        throttle: &'a mut SchedulerThrottle,
        tracker: TensorTracker,
        cancel: CancelToken,
    ) -> Self {
        Self {
            factory,
            throttle,
            tracker,
            cancel,
        }
    }

    /// Runs the configured attack on `original`, using the face `regions`
    /// located by the caller.
    pub fn run(
        &mut self,
        original: &Image,
        regions: &[FaceRegion],
        config: &AttackConfig,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<AttackOutcome> {
        config.validate()?;
        if config.method == AttackMethod::FaceScoped && regions.is_empty() {
            return Err(CloakError::NoFaceDetected);
        }

        self.throttle.begin_session();
        // Clears any baseline left over from a previous run on this tracker.
        self.tracker.rebase();
        self.cancel.bail_if_cancelled()?;
        progress(Progress {
            percent: 0,
            status: "preparing".into(),
        });

        let tier = ModelTier::for_pixel_count(original.pixel_count());
        // Tensor range is [-1, 1], twice as wide as the pixel scale epsilon
        // is quoted on.
        let radius = config.epsilon * 2.0;

        let reference = Tensor::from_image(original, &self.tracker)?;
        // The reference tensor sizes the session: everything the run holds
        // at once (adversarial copy, one gradient) is a small multiple of
        // it, and the tracker flags growth beyond that as a leak.
        self.tracker.rebase();
        let mut adv = reference.duplicate(&self.tracker)?;
        let mut iterations_run = 0;

        let final_tier = match config.method {
            AttackMethod::Global => self.gradient_pass(
                &reference,
                &mut adv,
                None,
                config,
                tier,
                radius,
                (0, 95),
                &mut iterations_run,
                progress,
            )?,
            AttackMethod::FaceScoped => {
                let mask = region_mask(original, regions, config);
                self.gradient_pass(
                    &reference,
                    &mut adv,
                    Some(&mask),
                    config,
                    tier,
                    radius,
                    (0, 95),
                    &mut iterations_run,
                    progress,
                )?
            }
            AttackMethod::Combined => {
                // Regions are located once, before phase one, and carried
                // into the global phase untouched.
                self.pattern_pass(&reference, &mut adv, regions, config, radius, progress)?;
                self.gradient_pass(
                    &reference,
                    &mut adv,
                    None,
                    config,
                    tier,
                    radius,
                    (50, 95),
                    &mut iterations_run,
                    progress,
                )?
            }
        };

        self.cancel.bail_if_cancelled()?;
        progress(Progress {
            percent: 95,
            status: "finalizing".into(),
        });

        debug_assert!(adv.max_abs_diff(&reference) <= radius + 1e-5);
        let image = adv.to_image(original).into_processed();
        progress(Progress {
            percent: 100,
            status: "complete".into(),
        });

        Ok(AttackOutcome {
            image,
            iterations_run,
            tier: final_tier,
        })
    }

    /// The I-FGSM loop (single-step FGSM when only one iteration remains).
    ///
    /// Each step evaluates the gradient at the *current* adversarial image,
    /// moves in its sign direction, and projects back into the epsilon-ball.
    /// Backend faults downgrade the tier and halve the remaining steps.
    #[allow(clippy::too_many_arguments)]
    fn gradient_pass(
        &mut self,
        reference: &Tensor,
        adv: &mut Tensor,
        mask: Option<&Array2<f32>>,
        config: &AttackConfig,
        mut tier: ModelTier,
        radius: f32,
        progress_span: (u8, u8),
        iterations_run: &mut u32,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<ModelTier> {
        let seed = fastrand::u64(..);
        let mut model = self.factory.build(tier, seed)?;
        let total = config.iterations;
        let step = radius / total as f32;
        let mut remaining = total;
        let mut done = 0u32;

        while remaining > 0 {
            self.cancel.bail_if_cancelled()?;

            let grad = match model.input_gradient(adv, &self.tracker) {
                Ok(grad) => grad,
                Err(fault) if fault.is_recoverable() => {
                    let Some(coarser) = tier.downgrade() else {
                        return Err(fault);
                    };
                    log::warn!(
                        "gradient evaluation faulted on {tier:?} tier ({fault}), \
                         retrying on {coarser:?}"
                    );
                    tier = coarser;
                    model = self.factory.build(tier, seed)?;
                    remaining = (remaining / 2).max(1);
                    continue;
                }
                Err(other) => return Err(other),
            };

            match mask {
                Some(mask) => add_masked_step(adv, &grad, step, mask),
                None => adv.add_signed_step(&grad, step),
            }
            adv.project(reference, radius);
            drop(grad);

            done += 1;
            remaining -= 1;
            *iterations_run += 1;

            let (lo, hi) = progress_span;
            let frac = done as f32 / (done + remaining) as f32;
            progress(Progress {
                percent: lo + ((hi - lo) as f32 * frac) as u8,
                status: format!("perturbing (step {done})"),
            });
            self.throttle.checkpoint();
        }

        Ok(tier)
    }

    /// Combined-mode phase one: fixed sinusoidal noise over the facial
    /// feature bands of each region. No model involved; the patterns only
    /// have to be high-frequency and spatially structured.
    fn pattern_pass(
        &mut self,
        reference: &Tensor,
        adv: &mut Tensor,
        regions: &[FaceRegion],
        config: &AttackConfig,
        radius: f32,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<()> {
        if regions.is_empty() {
            // Nothing to scope to; the global phase still runs.
            log::debug!("combined attack without face regions, skipping pattern phase");
            progress(Progress {
                percent: 50,
                status: "no faces, skipping pattern pass".into(),
            });
            return Ok(());
        }

        for (index, region) in regions.iter().enumerate() {
            self.cancel.bail_if_cancelled()?;
            let strength = radius * config.weight(index);
            apply_feature_patterns(adv, region, strength);
            adv.project(reference, radius);

            let frac = (index + 1) as f32 / regions.len() as f32;
            progress(Progress {
                percent: (50.0 * frac) as u8,
                status: format!("cloaking face {} of {}", index + 1, regions.len()),
            });
            self.throttle.checkpoint();
        }
        Ok(())
    }
}

/// Rasterizes face regions into a per-pixel weight mask.
fn region_mask(image: &Image, regions: &[FaceRegion], config: &AttackConfig) -> Array2<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut mask: Array2<f32> = Array2::zeros((h, w));
    for (index, region) in regions.iter().enumerate() {
        let weight = config.weight(index);
        let x1 = (region.x + region.width).min(image.width());
        let y1 = (region.y + region.height).min(image.height());
        for y in region.y..y1 {
            for x in region.x..x1 {
                let cell = &mut mask[(y as usize, x as usize)];
                *cell = cell.max(weight);
            }
        }
    }
    mask
}

/// `adv += step * mask * sign(grad)`, channel by channel.
fn add_masked_step(adv: &mut Tensor, grad: &Tensor, step: f32, mask: &Array2<f32>) {
    for c in 0..3 {
        Zip::from(adv.view_mut().index_axis_mut(Axis(0), c))
            .and(grad.view().index_axis(Axis(0), c))
            .and(mask)
            .for_each(|v, &g, &m| *v += step * m * g.signum());
    }
}

/// The fixed geometric patterns of combined-mode phase one: sinusoidal
/// gratings over the eye, nose and mouth bands of a region, phase-shifted
/// per channel so the noise is chromatic.
fn apply_feature_patterns(adv: &mut Tensor, region: &FaceRegion, strength: f32) {
    // (x0, y0, x1, y1) as fractions of the region, plus a spatial frequency.
    const BANDS: [(f32, f32, f32, f32, f32); 3] = [
        (0.15, 0.20, 0.85, 0.45, 9.0),  // eyes
        (0.35, 0.40, 0.65, 0.70, 7.0),  // nose
        (0.25, 0.65, 0.75, 0.90, 11.0), // mouth
    ];

    let (iw, ih) = (adv.width(), adv.height());
    for &(fx0, fy0, fx1, fy1, freq) in &BANDS {
        let rw = region.width as f32;
        let rh = region.height as f32;
        let x0 = region.x + (fx0 * rw) as u32;
        let y0 = region.y + (fy0 * rh) as u32;
        let x1 = (region.x + (fx1 * rw) as u32).min(iw);
        let y1 = (region.y + (fy1 * rh) as u32).min(ih);

        for y in y0..y1 {
            for x in x0..x1 {
                let u = (x - region.x) as f32 / rw;
                let v = (y - region.y) as f32 / rh;
                let wave = (TAU * freq * u).sin() * (TAU * freq * v).cos();
                for c in 0..3 {
                    let shifted = (wave + c as f32 / 3.0).sin();
                    let cur = adv.get(c, y as usize, x as usize);
                    adv.set(c, y as usize, x as usize, cur + strength * shifted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        surrogate::SurrogateFactory,
        throttle::Priority,
    };

    fn engine_parts() -> (TensorTracker, SchedulerThrottle, CancelToken) {
        let tracker = TensorTracker::new();
        let throttle = SchedulerThrottle::new(tracker.clone(), Priority::High);
        (tracker, throttle, CancelToken::new())
    }

    fn textured(size: u32) -> Image {
        Image::from_pixel_fn(size, size, |x, y| {
            [
                ((x * 5 + y * 3) % 256) as u8,
                ((x * 2 + 40) % 256) as u8,
                ((y * 7 + 90) % 256) as u8,
                255,
            ]
        })
    }

    fn run(
        image: &Image,
        regions: &[FaceRegion],
        config: &AttackConfig,
    ) -> Result<AttackOutcome> {
        let factory = SurrogateFactory;
        let (tracker, mut throttle, cancel) = engine_parts();
        let mut engine = AttackEngine::new(&factory, &mut throttle, tracker, cancel);
        engine.run(image, regions, config, &mut |_| {})
    }

    fn assert_epsilon_bound(original: &Image, processed: &Image, epsilon: f32) {
        // Quantization adds at most one step of rounding error per side.
        let bound = epsilon * 255.0 + 1.5;
        for y in 0..original.height() {
            for x in 0..original.width() {
                let a = original.get(x, y);
                let b = processed.get(x, y);
                for c in 0..3 {
                    let diff = (f32::from(a[c]) - f32::from(b[c])).abs();
                    assert!(diff <= bound, "pixel ({x},{y}) channel {c}: {diff} > {bound}");
                }
            }
        }
    }

    #[test]
    fn global_attack_stays_in_epsilon_ball() {
        let image = textured(48);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.05,
            iterations: 5,
            region_weights: Vec::new(),
        };
        let outcome = run(&image, &[], &config).unwrap();
        assert_eq!((outcome.image.width(), outcome.image.height()), (48, 48));
        assert_eq!(outcome.iterations_run, 5);
        assert_epsilon_bound(&image, &outcome.image, config.epsilon);
    }

    #[test]
    fn zero_epsilon_single_step_is_identity_within_quantization() {
        let image = textured(32);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.0,
            iterations: 1,
            region_weights: Vec::new(),
        };
        let outcome = run(&image, &[], &config).unwrap();
        assert_epsilon_bound(&image, &outcome.image, 0.0);
    }

    #[test]
    fn face_scoped_without_faces_is_an_error() {
        let image = textured(32);
        let config = AttackConfig {
            method: AttackMethod::FaceScoped,
            epsilon: 0.05,
            iterations: 3,
            region_weights: Vec::new(),
        };
        assert!(matches!(
            run(&image, &[], &config),
            Err(CloakError::NoFaceDetected)
        ));
    }

    #[test]
    fn face_scoped_leaves_background_untouched() {
        let image = textured(64);
        let region = FaceRegion {
            x: 16,
            y: 16,
            width: 24,
            height: 24,
            confidence: 0.9,
            keypoints: Vec::new(),
        };
        let config = AttackConfig {
            method: AttackMethod::FaceScoped,
            epsilon: 0.08,
            iterations: 4,
            region_weights: Vec::new(),
        };
        let outcome = run(&image, std::slice::from_ref(&region), &config).unwrap();
        assert_epsilon_bound(&image, &outcome.image, config.epsilon);
        for y in 0..64 {
            for x in 0..64 {
                if !region.contains(x, y) {
                    assert_eq!(image.get(x, y), outcome.image.get(x, y));
                }
            }
        }
    }

    #[test]
    fn combined_without_faces_still_perturbs_globally() {
        let image = textured(40);
        let config = AttackConfig {
            method: AttackMethod::Combined,
            epsilon: 0.05,
            iterations: 4,
            region_weights: Vec::new(),
        };
        let outcome = run(&image, &[], &config).unwrap();
        assert_eq!(outcome.iterations_run, 4);
        assert_epsilon_bound(&image, &outcome.image, config.epsilon);
    }

    #[test]
    fn combined_with_region_respects_the_bound() {
        let image = textured(64);
        let region = FaceRegion {
            x: 8,
            y: 8,
            width: 40,
            height: 40,
            confidence: 0.8,
            keypoints: Vec::new(),
        };
        let config = AttackConfig {
            method: AttackMethod::Combined,
            epsilon: 0.06,
            iterations: 3,
            region_weights: vec![1.0],
        };
        let outcome = run(&image, &[region], &config).unwrap();
        assert_epsilon_bound(&image, &outcome.image, config.epsilon);
    }

    #[test]
    fn cancellation_before_start_short_circuits() {
        let image = textured(32);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.05,
            iterations: 10,
            region_weights: Vec::new(),
        };
        let factory = SurrogateFactory;
        let (tracker, mut throttle, cancel) = engine_parts();
        cancel.cancel();
        let mut engine = AttackEngine::new(&factory, &mut throttle, tracker.clone(), cancel);
        let result = engine.run(&image, &[], &config, &mut |_| {});
        assert!(matches!(result, Err(CloakError::Cancelled)));
        drop(engine);
        // Transient tensors must not outlive the run.
        assert_eq!(tracker.live_bytes(), 0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        for config in [
            AttackConfig {
                method: AttackMethod::Global,
                epsilon: 0.5,
                iterations: 5,
                region_weights: Vec::new(),
            },
            AttackConfig {
                method: AttackMethod::Global,
                epsilon: 0.05,
                iterations: 0,
                region_weights: Vec::new(),
            },
            AttackConfig {
                method: AttackMethod::Global,
                epsilon: 0.05,
                iterations: 99,
                region_weights: Vec::new(),
            },
            AttackConfig {
                method: AttackMethod::Global,
                epsilon: 0.05,
                iterations: 5,
                region_weights: vec![-1.0],
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(CloakError::Validation(_))
            ));
        }
    }

    #[test]
    fn backend_faults_downgrade_and_resume() {
        use crate::surrogate::GradientSource;
        use std::sync::atomic::{AtomicU32, Ordering};

        /// Faults on the Full tier, works on anything coarser.
        struct FlakyFactory {
            builds: AtomicU32,
        }

        struct FlakySource {
            tier: ModelTier,
        }

        impl GradientSource for FlakySource {
            fn tier(&self) -> ModelTier {
                self.tier
            }

            fn input_gradient(
                &self,
                input: &Tensor,
                tracker: &TensorTracker,
            ) -> Result<Tensor> {
                if self.tier == ModelTier::Full {
                    return Err(CloakError::Backend("simulated device loss".into()));
                }
                let mut grad = Tensor::zeros_like(input, tracker)?;
                grad.view_mut().fill(1.0);
                Ok(grad)
            }
        }

        impl ModelFactory for FlakyFactory {
            fn build(&self, tier: ModelTier, _seed: u64) -> Result<Box<dyn GradientSource>> {
                self.builds.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(FlakySource { tier }))
            }
        }

        let image = textured(32);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.05,
            iterations: 8,
            region_weights: Vec::new(),
        };
        let factory = FlakyFactory {
            builds: AtomicU32::new(0),
        };
        let (tracker, mut throttle, cancel) = engine_parts();
        let mut engine = AttackEngine::new(&factory, &mut throttle, tracker, cancel);
        let outcome = engine.run(&image, &[], &config, &mut |_| {}).unwrap();

        assert_eq!(outcome.tier, ModelTier::Medium);
        // Half the budget survives the downgrade.
        assert_eq!(outcome.iterations_run, 4);
        assert_eq!(factory.builds.load(Ordering::Relaxed), 2);
        assert_epsilon_bound(&image, &outcome.image, config.epsilon);
    }

    #[test]
    fn progress_reaches_one_hundred() {
        let image = textured(32);
        let config = AttackConfig {
            method: AttackMethod::Global,
            epsilon: 0.03,
            iterations: 3,
            region_weights: Vec::new(),
        };
        let factory = SurrogateFactory;
        let (tracker, mut throttle, cancel) = engine_parts();
        let mut engine = AttackEngine::new(&factory, &mut throttle, tracker, cancel);
        let mut reports = Vec::new();
        engine
            .run(&image, &[], &config, &mut |p| reports.push(p))
            .unwrap();
        assert_eq!(reports.first().unwrap().percent, 0);
        assert_eq!(reports.last().unwrap().percent, 100);
        assert!(reports.windows(2).all(|w| w[0].percent <= w[1].percent));
    }
}
