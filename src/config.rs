use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::signal::wavelet::Wavelet;
use crate::signal::HolterError;

/// "ECGD", written by the current firmware.
pub const ECGD_MAGIC: u32 = 0x4543_4744;

/// Everything the pipeline needs to know about one device generation.
///
/// Every section falls back to its defaults, so a JSON file only has to name
/// the values it changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub device: DeviceProfile,
    pub motion: MotionConfig,
    pub conditioning: ConditioningConfig,
    pub denoise: DenoiseConfig,
    pub heart_rate: HeartRateConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub expected_magic: u32,
    /// ECG counts per millivolt.
    pub ecg_scale: f64,
    /// Accelerometer g per count.
    pub accel_scale: f64,
    pub fallback_ecg_rate_hz: f64,
    pub fallback_accel_rate_hz: f64,
    /// Ignore the rates declared in the header and always use the fallbacks.
    pub force_fallback_rates: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            expected_magic: ECGD_MAGIC,
            ecg_scale: 6553.6,
            // ±16 g full scale over a signed 16-bit range.
            accel_scale: 16.0 / 32768.0,
            fallback_ecg_rate_hz: 250.0,
            fallback_accel_rate_hz: 50.0,
            force_fallback_rates: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Moving-average window, in accelerometer samples.
    pub window: usize,
    pub threshold_g: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            window: 50,
            threshold_g: 0.3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditioningConfig {
    pub highpass_hz: f64,
    pub lowpass_ceiling_hz: f64,
    pub lowpass_nyquist_fraction: f64,
    /// Normalized cutoff used when the computed low-pass cutoff is unusable.
    pub lowpass_fallback_normalized: f64,
    pub notch_hz: f64,
    pub notch_q: f64,
    /// Butterworth order for the high- and low-pass stages. Must be even.
    pub order: usize,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self {
            highpass_hz: 0.5,
            lowpass_ceiling_hz: 100.0,
            lowpass_nyquist_fraction: 0.8,
            lowpass_fallback_normalized: 0.95,
            notch_hz: 60.0,
            notch_q: 30.0,
            order: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    pub wavelet: Wavelet,
    pub levels: usize,
    /// Subsequences with this many samples or fewer are passed through.
    pub min_segment_samples: usize,
    pub motion_scale: f64,
    pub quiet_scale: f64,
    /// Per-level threshold growth, finest detail = growth^1. 1.0 disables it.
    pub level_growth: f64,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            wavelet: Wavelet::Db4,
            levels: 4,
            min_segment_samples: 100,
            motion_scale: 2.0,
            quiet_scale: 1.0,
            level_growth: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartRateConfig {
    pub edge_margin_s: f64,
    /// 0.33 s caps detection at roughly 180 BPM.
    pub min_peak_distance_s: f64,
    pub height_sigmas: f64,
}

impl Default for HeartRateConfig {
    fn default() -> Self {
        Self {
            edge_margin_s: 1.0,
            min_peak_distance_s: 0.33,
            height_sigmas: 3.0,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, HolterError> {
        let config: PipelineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HolterError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), HolterError> {
        let device = &self.device;
        if !(device.ecg_scale > 0.0 && device.accel_scale > 0.0) {
            return Err(invalid("device scales must be positive"));
        }
        if !(device.fallback_ecg_rate_hz > 0.0 && device.fallback_accel_rate_hz > 0.0) {
            return Err(invalid("fallback sample rates must be positive"));
        }
        if self.motion.window == 0 {
            return Err(invalid("motion window must be at least one sample"));
        }
        if !self.motion.threshold_g.is_finite() || self.motion.threshold_g < 0.0 {
            return Err(invalid("motion threshold must be a non-negative number"));
        }
        let cond = &self.conditioning;
        if cond.order < 2 || cond.order % 2 != 0 {
            return Err(invalid(format!(
                "filter order must be even and at least 2, got {}",
                cond.order
            )));
        }
        if !(cond.lowpass_fallback_normalized > 0.0 && cond.lowpass_fallback_normalized < 1.0) {
            return Err(invalid("low-pass fallback must lie inside (0, 1)"));
        }
        if cond.notch_q <= 0.0 {
            return Err(invalid("notch Q must be positive"));
        }
        let denoise = &self.denoise;
        if denoise.levels == 0 {
            return Err(invalid("wavelet levels must be at least 1"));
        }
        if denoise.motion_scale < 0.0 || denoise.quiet_scale < 0.0 || denoise.level_growth <= 0.0 {
            return Err(invalid("threshold scales must be non-negative"));
        }
        let hr = &self.heart_rate;
        if [hr.edge_margin_s, hr.min_peak_distance_s, hr.height_sigmas]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(invalid("heart-rate parameters must be finite and non-negative"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> HolterError {
    HolterError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{ "motion": { "threshold_g": 0.5 }, "denoise": { "wavelet": "haar" } }"#,
        )
        .unwrap();
        assert_eq!(config.motion.threshold_g, 0.5);
        assert_eq!(config.motion.window, 50);
        assert_eq!(config.denoise.wavelet, Wavelet::Haar);
        assert_eq!(config.conditioning, ConditioningConfig::default());
    }
    #[test]
    fn odd_filter_order_is_rejected() {
        let err = PipelineConfig::from_json_str(r#"{ "conditioning": { "order": 3 } }"#)
            .unwrap_err();
        assert!(matches!(err, HolterError::InvalidConfig(_)));
    }
    #[test]
    fn infinite_edge_margin_is_rejected() {
        let mut config = PipelineConfig::default();
        config.heart_rate.edge_margin_s = f64::INFINITY;
        assert!(matches!(config.validate(), Err(HolterError::InvalidConfig(_))));
        config.heart_rate.edge_margin_s = 1e17;
        assert!(config.validate().is_ok());
    }
}
