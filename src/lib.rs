//! Hide in plain sight.
//!
//! Kasumi turns an input photo into a visually identical copy whose pixel
//! values have been adversarially perturbed, with the goal of degrading the
//! accuracy of downstream recognition models. The perturbation is bounded by
//! an epsilon-ball around the original image, so the result stays
//! imperceptible to humans while quality metrics (PSNR/SSIM/MSE) quantify how
//! close it remains.
//!
//! The usual entry point is [`process::Processor`], which runs the attack on
//! a background worker when available and falls back to the calling thread
//! otherwise:
//!
//! ```no_run
//! use kasumi::attack::{AttackConfig, AttackMethod, ProtectionLevel};
//! use kasumi::process::Processor;
//!
//! let bytes = std::fs::read("photo.jpg").unwrap();
//! let config = AttackConfig::preset(AttackMethod::Global, ProtectionLevel::Medium);
//! let mut processor = Processor::new();
//! let output = processor.process_image(&bytes, &config).unwrap();
//! println!("PSNR: {:?} dB", output.metrics.psnr);
//! ```

use log::LevelFilter;

pub mod attack;
pub mod cancel;
pub mod detect;
pub mod error;
pub mod image;
pub mod metrics;
pub mod num;
pub mod process;
pub mod surrogate;
pub mod tensor;
pub mod throttle;
pub mod worker;

mod drop;

pub use error::{CloakError, Result};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and kasumi will log at *debug* level; everything else
/// follows `RUST_LOG`. If a global logger is already registered, this macro
/// does nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
