//! Motion-adaptive wavelet shrinkage.
//!
//! Each lead is split by the motion mask into a motion subsequence and a
//! quiet subsequence. Both are decomposed with a periodized orthogonal DWT,
//! the detail bands are soft-thresholded against a universal threshold
//! derived from the MAD noise estimate of the finest band, and the result is
//! written back to the original indices.
//!
//! # Threshold
//!
//! ```text
//! sigma     = median(|cD1|) / 0.6745
//! threshold = scale * sigma * sqrt(2 ln N) * growth^depth
//! ```
//!
//! `scale` is larger for motion than for quiet segments; `depth` is 1 for the
//! finest detail band. The approximation band is never touched.
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::DenoiseConfig;

const MAD_TO_SIGMA: f64 = 0.6745;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Wavelet {
    Haar,
    Db2,
    Db4,
}

const HAAR: [f64; 2] = [std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
const DB2: [f64; 4] = [
    0.482_962_913_144_690_25,
    0.836_516_303_737_469,
    0.224_143_868_041_857_35,
    -0.129_409_522_550_921_45,
];
const DB4: [f64; 8] = [
    0.230_377_813_308_855_23,
    0.714_846_570_552_541_5,
    0.630_880_767_929_590_4,
    -0.027_983_769_416_983_85,
    -0.187_034_811_718_881_14,
    0.030_841_381_835_986_965,
    0.032_883_011_666_982_945,
    -0.010_597_401_784_997_278,
];

impl Wavelet {
    /// Scaling (low-pass) filter taps.
    pub fn scaling(&self) -> &'static [f64] {
        match self {
            Wavelet::Haar => &HAAR,
            Wavelet::Db2 => &DB2,
            Wavelet::Db4 => &DB4,
        }
    }

    /// Wavelet (high-pass) taps, the quadrature mirror of [`Wavelet::scaling`].
    pub fn wavelet(&self) -> Vec<f64> {
        let h = self.scaling();
        let len = h.len();
        (0..len)
            .map(|j| {
                let sign = if j % 2 == 0 { 1.0 } else { -1.0 };
                sign * h[len - 1 - j]
            })
            .collect()
    }
}

/// Multi-level decomposition. `details[0]` is the finest band.
#[derive(Clone, Debug)]
pub struct Decomposition {
    pub wavelet: Wavelet,
    pub approx: Vec<f64>,
    pub details: Vec<Vec<f64>>,
    /// Input length at each level, finest first.
    lengths: Vec<usize>,
}

impl Decomposition {
    pub fn levels(&self) -> usize {
        self.details.len()
    }
}

/// Periodized DWT down to `levels` bands, or fewer if the signal runs out.
pub fn wavedec(signal: &[f64], wavelet: Wavelet, levels: usize) -> Decomposition {
    let h = wavelet.scaling();
    let g = wavelet.wavelet();
    let mut current = signal.to_vec();
    let mut details = Vec::with_capacity(levels);
    let mut lengths = Vec::with_capacity(levels);
    for _ in 0..levels {
        if current.len() < 2 {
            break;
        }
        lengths.push(current.len());
        if current.len() % 2 == 1 {
            let last = current[current.len() - 1];
            current.push(last);
        }
        let n = current.len();
        let half = n / 2;
        let mut approx = vec![0.0; half];
        let mut detail = vec![0.0; half];
        for k in 0..half {
            for (j, (hj, gj)) in h.iter().zip(&g).enumerate() {
                let x = current[(2 * k + j) % n];
                approx[k] += hj * x;
                detail[k] += gj * x;
            }
        }
        details.push(detail);
        current = approx;
    }
    Decomposition {
        wavelet,
        approx: current,
        details,
        lengths,
    }
}

/// Inverse of [`wavedec`].
pub fn waverec(decomposition: &Decomposition) -> Vec<f64> {
    let h = decomposition.wavelet.scaling();
    let g = decomposition.wavelet.wavelet();
    let mut current = decomposition.approx.clone();
    for (detail, &len) in decomposition
        .details
        .iter()
        .zip(&decomposition.lengths)
        .rev()
    {
        let half = current.len().min(detail.len());
        let n = 2 * half;
        let mut out = vec![0.0; n];
        if n > 0 {
            for k in 0..half {
                for (j, (hj, gj)) in h.iter().zip(&g).enumerate() {
                    out[(2 * k + j) % n] += hj * current[k] + gj * detail[k];
                }
            }
        }
        out.resize(len, 0.0);
        current = out;
    }
    current
}

pub fn soft_threshold(value: f64, threshold: f64) -> f64 {
    let magnitude = value.abs() - threshold;
    if magnitude > 0.0 {
        magnitude.copysign(value)
    } else {
        0.0
    }
}

/// Robust noise scale from a detail band.
pub fn mad_sigma(coefficients: &[f64]) -> f64 {
    if coefficients.is_empty() {
        return 0.0;
    }
    let mut magnitudes: Vec<f64> = coefficients.iter().map(|c| c.abs()).collect();
    magnitudes.sort_by(|a, b| a.total_cmp(b));
    let mid = magnitudes.len() / 2;
    let median = if magnitudes.len() % 2 == 0 {
        (magnitudes[mid - 1] + magnitudes[mid]) / 2.0
    } else {
        magnitudes[mid]
    };
    median / MAD_TO_SIGMA
}

/// Decomposition depth actually used for an `n`-sample segment.
pub fn effective_levels(n: usize, requested: usize) -> usize {
    if n >= 1usize.checked_shl(requested as u32).unwrap_or(usize::MAX) {
        return requested;
    }
    let log2 = if n == 0 { 0 } else { n.ilog2() as usize };
    log2.saturating_sub(1).max(1)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentReport {
    pub samples: usize,
    pub scale: f64,
    pub sigma: f64,
    /// Threshold before per-level growth.
    pub threshold: f64,
    pub levels: usize,
}

/// Per-lead record of what was thresholded. `None` means the subsequence
/// was too short and passed through.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DenoiseReport {
    pub motion: Option<SegmentReport>,
    pub quiet: Option<SegmentReport>,
}

#[derive(Clone, Debug, Default)]
pub struct AdaptiveDenoiser {
    config: DenoiseConfig,
}

impl AdaptiveDenoiser {
    pub fn new(config: DenoiseConfig) -> Self {
        Self { config }
    }

    /// Denoise `signal` using `mask` to pick each sample's threshold scale.
    /// Samples past the end of `mask` count as quiet. The output always has
    /// the length of `signal`.
    pub fn denoise(&self, signal: &[f64], mask: &[bool]) -> (Vec<f64>, DenoiseReport) {
        let (motion_idx, quiet_idx): (Vec<usize>, Vec<usize>) = (0..signal.len())
            .partition(|&i| mask.get(i).copied().unwrap_or(false));
        let mut output = signal.to_vec();
        let report = DenoiseReport {
            motion: self.denoise_indices(signal, &motion_idx, self.config.motion_scale, &mut output),
            quiet: self.denoise_indices(signal, &quiet_idx, self.config.quiet_scale, &mut output),
        };
        (output, report)
    }

    fn denoise_indices(
        &self,
        signal: &[f64],
        indices: &[usize],
        scale: f64,
        output: &mut [f64],
    ) -> Option<SegmentReport> {
        if indices.len() <= self.config.min_segment_samples {
            if !indices.is_empty() {
                debug!(
                    "{} samples at scale {scale} too few to denoise, passed through",
                    indices.len()
                );
            }
            return None;
        }
        let segment: Vec<f64> = indices.iter().map(|&i| signal[i]).collect();
        let (cleaned, report) = self.denoise_segment(&segment, scale);
        for (&i, value) in indices.iter().zip(cleaned) {
            output[i] = value;
        }
        Some(report)
    }

    /// Shrink one contiguous subsequence. Output length equals input length.
    pub fn denoise_segment(&self, segment: &[f64], scale: f64) -> (Vec<f64>, SegmentReport) {
        let n = segment.len();
        let levels = effective_levels(n, self.config.levels);
        let mut decomposition = wavedec(segment, self.config.wavelet, levels);
        let sigma = decomposition
            .details
            .first()
            .map(|finest| mad_sigma(finest))
            .unwrap_or(0.0);
        let universal = if n > 1 {
            (2.0 * (n as f64).ln()).sqrt()
        } else {
            0.0
        };
        let threshold = scale * sigma * universal;
        let mut level_threshold = threshold;
        for detail in decomposition.details.iter_mut() {
            level_threshold *= self.config.level_growth;
            for c in detail.iter_mut() {
                *c = soft_threshold(*c, level_threshold);
            }
        }
        let mut cleaned = waverec(&decomposition);
        cleaned.resize(n, 0.0);
        debug!(
            "denoised {n} samples: {} levels, sigma {sigma:.5}, threshold {threshold:.5}",
            decomposition.levels()
        );
        let report = SegmentReport {
            samples: n,
            scale,
            sigma,
            threshold,
            levels: decomposition.levels(),
        };
        (cleaned, report)
    }
}
