//! Accelerometer-driven motion segmentation.
//!
//! Motion is whatever the magnitude signal does that its own moving average
//! does not: samples whose distance from the local mean exceeds the
//! configured threshold are flagged. An empty accelerometer matrix is a
//! stationary recording.
use log::debug;
use ndarray::ArrayView2;
use serde::Serialize;

use crate::config::MotionConfig;

/// One flag per sample, `true` where the device was moving.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MotionMask {
    flags: Vec<bool>,
}

impl MotionMask {
    pub fn new(flags: Vec<bool>) -> Self {
        Self { flags }
    }
    pub fn stationary(len: usize) -> Self {
        Self {
            flags: vec![false; len],
        }
    }
    pub fn len(&self) -> usize {
        self.flags.len()
    }
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
    pub fn as_slice(&self) -> &[bool] {
        &self.flags
    }
    pub fn motion_count(&self) -> usize {
        self.flags.iter().filter(|flag| **flag).count()
    }
    /// Share of flagged samples in percent; 0 for an empty mask.
    pub fn motion_percentage(&self) -> f64 {
        if self.flags.is_empty() {
            return 0.0;
        }
        self.motion_count() as f64 * 100.0 / self.flags.len() as f64
    }
    /// Stretch or shrink to `target_len` entries.
    pub fn resample(&self, target_len: usize) -> MotionMask {
        MotionMask::new(resample_mask(&self.flags, target_len))
    }
}

impl From<Vec<bool>> for MotionMask {
    fn from(flags: Vec<bool>) -> Self {
        Self::new(flags)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MotionSegmenter {
    config: MotionConfig,
}

impl MotionSegmenter {
    pub fn new(config: MotionConfig) -> Self {
        Self { config }
    }

    /// Motion mask at the accelerometer rate.
    pub fn segment(&self, accel: ArrayView2<f64>) -> MotionMask {
        if accel.nrows() == 0 {
            debug!("no accelerometer samples, treating recording as stationary");
            return MotionMask::default();
        }
        let magnitude = magnitude(accel);
        let smoothed = if magnitude.len() < self.config.window {
            magnitude.clone()
        } else {
            moving_average(&magnitude, self.config.window)
        };
        let flags: Vec<bool> = magnitude
            .iter()
            .zip(&smoothed)
            .map(|(m, s)| (m - s).abs() > self.config.threshold_g)
            .collect();
        let mask = MotionMask::new(flags);
        debug!(
            "motion segmentation: {}/{} accelerometer samples flagged ({:.1}%)",
            mask.motion_count(),
            mask.len(),
            mask.motion_percentage()
        );
        mask
    }
}

/// Euclidean norm of each accelerometer row.
pub fn magnitude(accel: ArrayView2<f64>) -> Vec<f64> {
    accel
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v * v).sum::<f64>().sqrt())
        .collect()
}

/// Centred moving average. Near the edges only the in-range samples are
/// averaged.
fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut prefix = Vec::with_capacity(values.len() + 1);
    prefix.push(0.0);
    for value in values {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + value);
    }
    let behind = window / 2;
    let ahead = (window - 1) / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(behind);
            let hi = (i + ahead + 1).min(values.len());
            (prefix[hi] - prefix[lo]) / (hi - lo) as f64
        })
        .collect()
}

/// Nearest-index resampling over a uniform mapping of
/// `[0, source.len() - 1]` onto `[0, target_len - 1]`.
pub fn resample_mask(source: &[bool], target_len: usize) -> Vec<bool> {
    if source.is_empty() {
        return vec![false; target_len];
    }
    if source.len() == target_len {
        return source.to_vec();
    }
    match target_len {
        0 => return Vec::new(),
        1 => return vec![source[0]],
        _ => {}
    }
    let last = (source.len() - 1) as f64;
    let step = last / (target_len - 1) as f64;
    (0..target_len)
        .map(|i| {
            let index = (i as f64 * step).round() as usize;
            source[index.min(source.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn still(samples: usize) -> Array2<f64> {
        Array2::from_shape_fn((samples, 3), |(_, axis)| if axis == 2 { 1.0 } else { 0.0 })
    }

    #[test]
    fn empty_accelerometer_gives_empty_mask() {
        let accel = Array2::<f64>::zeros((0, 3));
        let mask = MotionSegmenter::default().segment(accel.view());
        assert!(mask.is_empty());
        assert_eq!(mask.motion_percentage(), 0.0);
    }

    #[test]
    fn still_device_has_no_motion() {
        let mask = MotionSegmenter::default().segment(still(400).view());
        assert_eq!(mask.len(), 400);
        assert_eq!(mask.motion_count(), 0);
    }

    #[test]
    fn short_signal_skips_smoothing() {
        let mut accel = still(10);
        accel[[4, 0]] = 3.0;
        let mask = MotionSegmenter::default().segment(accel.view());
        // Without smoothing the detrended signal is identically zero.
        assert_eq!(mask.motion_count(), 0);
    }

    #[test]
    fn spike_is_flagged() {
        let mut accel = still(200);
        accel[[100, 0]] = 2.0;
        let mask = MotionSegmenter::default().segment(accel.view());
        assert!(mask.as_slice()[100]);
        assert_eq!(mask.motion_count(), 1);
    }

    #[test]
    fn moving_average_matches_centred_window() {
        let values = [0.0, 0.0, 4.0, 0.0, 0.0];
        let smoothed = moving_average(&values, 2);
        // window 2 covers [i - 1, i]
        assert_eq!(smoothed, vec![0.0, 0.0, 2.0, 2.0, 0.0]);
        let smoothed = moving_average(&values, 3);
        assert!((smoothed[1] - 4.0 / 3.0).abs() < 1e-12);
        assert_eq!(smoothed[0], 0.0);
    }

    #[test]
    fn resampling_properties() {
        let source = [true, false, false, true];
        for target in [1usize, 2, 3, 7, 1000] {
            assert_eq!(resample_mask(&source, target).len(), target);
        }
        assert_eq!(resample_mask(&source, 4), source.to_vec());
        assert_eq!(resample_mask(&[], 5), vec![false; 5]);
        let stretched = resample_mask(&source, 7);
        assert!(stretched[0] && stretched[6]);
        assert_eq!(resample_mask(&source, 0), Vec::<bool>::new());
    }
}
