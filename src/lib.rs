//! Batch processing for wearable Holter captures: binary frame decoding,
//! accelerometer motion segmentation, ECG conditioning, motion-adaptive
//! wavelet denoising and per-lead heart-rate estimation.
pub mod capture;
pub mod config;
pub mod signal;

pub use config::PipelineConfig;
pub use signal::{HolterError, Pipeline, PipelineResult};
