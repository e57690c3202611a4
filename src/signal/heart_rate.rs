use log::debug;
use serde::Serialize;

use crate::config::HeartRateConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

/// Beats found on one lead. Peak indices are in the coordinates of the
/// untrimmed lead.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HeartRateResult {
    pub bpm: f64,
    pub r_peaks: Vec<usize>,
    pub num_beats: usize,
    pub polarity: Polarity,
}

impl HeartRateResult {
    fn none() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Default)]
pub struct HeartRateEstimator {
    config: HeartRateConfig,
}

impl HeartRateEstimator {
    pub fn new(config: HeartRateConfig) -> Self {
        Self { config }
    }

    pub fn estimate(&self, signal: &[f64], sample_rate_hz: f64) -> HeartRateResult {
        if !(sample_rate_hz > 0.0) || !sample_rate_hz.is_finite() {
            return HeartRateResult::none();
        }
        let margin = (self.config.edge_margin_s * sample_rate_hz) as usize;
        let (window, offset) = if signal.len() > margin.saturating_mul(2) {
            (&signal[margin..signal.len() - margin], margin)
        } else {
            (signal, 0)
        };
        if window.len() < 3 {
            return HeartRateResult::none();
        }
        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let sigma = (window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if !sigma.is_finite() || sigma < 1e-9 {
            debug!("lead has no variance, no beats");
            return HeartRateResult::none();
        }
        let centred: Vec<f64> = window.iter().map(|v| v - mean).collect();
        let inverted: Vec<f64> = centred.iter().map(|v| -v).collect();
        let height = self.config.height_sigmas * sigma;
        let distance = ((self.config.min_peak_distance_s * sample_rate_hz) as usize).max(1);

        let positive = find_peaks(&centred, height, distance);
        let negative = find_peaks(&inverted, height, distance);
        let (peaks, polarity) = if negative.len() > positive.len() {
            (negative, Polarity::Negative)
        } else {
            (positive, Polarity::Positive)
        };
        if peaks.len() < 2 {
            debug!("{} peak(s) above {height:.4}, no rate", peaks.len());
            return HeartRateResult {
                polarity,
                ..HeartRateResult::none()
            };
        }
        let mean_rr = peaks
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as f64 / sample_rate_hz)
            .sum::<f64>()
            / (peaks.len() - 1) as f64;
        let bpm = if mean_rr.is_finite() && mean_rr > 0.0 {
            60.0 / mean_rr
        } else {
            0.0
        };
        let r_peaks: Vec<usize> = peaks.into_iter().map(|p| p + offset).collect();
        debug!("{} beats ({polarity:?}), {bpm:.1} BPM", r_peaks.len());
        HeartRateResult {
            bpm,
            num_beats: r_peaks.len(),
            r_peaks,
            polarity,
        }
    }
}

/// Local maxima at least `height` tall, thinned so that no two survivors are
/// closer than `distance` samples. Taller peaks win. Flat tops report their
/// midpoint; the first and last samples are never peaks.
pub fn find_peaks(signal: &[f64], height: f64, distance: usize) -> Vec<usize> {
    let peaks: Vec<usize> = local_maxima(signal)
        .into_iter()
        .filter(|&i| signal[i] >= height)
        .collect();
    if distance <= 1 || peaks.len() < 2 {
        return peaks;
    }
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| signal[peaks[a]].total_cmp(&signal[peaks[b]]));
    let mut keep = vec![true; peaks.len()];
    for &j in order.iter().rev() {
        if !keep[j] {
            continue;
        }
        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            k -= 1;
            keep[k] = false;
        }
        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }
    peaks
        .into_iter()
        .zip(keep)
        .filter_map(|(peak, kept)| kept.then_some(peak))
        .collect()
}

fn local_maxima(signal: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if signal.len() < 3 {
        return peaks;
    }
    let last = signal.len() - 1;
    let mut i = 1;
    while i < last {
        if signal[i - 1] < signal[i] {
            let mut ahead = i + 1;
            while ahead < last && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FS: f64 = 250.0;

    /// Narrow positive pulses at `rate_hz`, peaking where the sine does.
    fn pulse_train(rate_hz: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let s = (2.0 * PI * rate_hz * i as f64 / FS).sin();
                s.max(0.0).powi(32)
            })
            .collect()
    }

    #[test]
    fn local_maxima_report_plateau_midpoints() {
        assert_eq!(local_maxima(&[0.0, 1.0, 1.0, 1.0, 0.0]), vec![2]);
        assert_eq!(local_maxima(&[0.0, 2.0, 2.0, 0.0]), vec![1]);
        assert_eq!(local_maxima(&[3.0, 1.0, 2.0, 4.0]), Vec::<usize>::new());
        assert_eq!(local_maxima(&[0.0, 1.0, 1.0, 2.0, 0.0]), vec![3]);
    }

    #[test]
    fn distance_keeps_the_tallest() {
        let signal = [0.0, 1.0, 0.0, 3.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.5, 0.0];
        assert_eq!(find_peaks(&signal, 0.5, 3), vec![3, 9]);
        assert_eq!(find_peaks(&signal, 0.5, 1), vec![1, 3, 5, 9]);
        assert_eq!(find_peaks(&signal, 1.8, 1), vec![3, 5]);
    }

    #[test]
    fn pulse_train_at_72_bpm() {
        let signal = pulse_train(1.2, 2500);
        let result = HeartRateEstimator::default().estimate(&signal, FS);
        assert!((result.bpm - 72.0).abs() < 0.72, "bpm {}", result.bpm);
        assert_eq!(result.polarity, Polarity::Positive);
        assert_eq!(result.num_beats, result.r_peaks.len());
        for peak in &result.r_peaks {
            let beat = ((*peak as f64 / FS) * 1.2 - 0.25).round();
            let expected = (beat + 0.25) / 1.2 * FS;
            assert!((*peak as f64 - expected).abs() <= 1.0, "peak {peak}");
            assert!(*peak >= 250 && *peak < 2250);
        }
    }

    #[test]
    fn inverted_electrodes_are_detected() {
        let signal: Vec<f64> = pulse_train(1.5, 2500).iter().map(|v| -v).collect();
        let result = HeartRateEstimator::default().estimate(&signal, FS);
        assert_eq!(result.polarity, Polarity::Negative);
        assert!((result.bpm - 90.0).abs() < 0.9, "bpm {}", result.bpm);
    }

    #[test]
    fn equal_counts_prefer_positive() {
        let mut signal = vec![0.0; 1000];
        for centre in [300, 450, 600] {
            signal[centre] = 1.0;
            signal[centre + 50] = -1.0;
        }
        let result = HeartRateEstimator::default().estimate(&signal, FS);
        assert_eq!(result.polarity, Polarity::Positive);
        assert_eq!(result.r_peaks, vec![300, 450, 600]);
        assert!((result.bpm - 100.0).abs() < 1e-9);
    }

    #[test]
    fn flat_and_zero_signals_have_no_rate() {
        let estimator = HeartRateEstimator::default();
        for signal in [vec![0.0; 1000], vec![0.7; 1000]] {
            let result = estimator.estimate(&signal, FS);
            assert_eq!(result.bpm, 0.0);
            assert!(result.r_peaks.is_empty());
            assert_eq!(result.num_beats, 0);
        }
    }

    #[test]
    fn single_beat_has_no_rate() {
        let mut signal = vec![0.0; 1000];
        signal[500] = 1.0;
        let result = HeartRateEstimator::default().estimate(&signal, FS);
        assert_eq!(result.bpm, 0.0);
        assert!(result.r_peaks.is_empty());
    }

    #[test]
    fn short_signals_skip_trimming() {
        let estimator = HeartRateEstimator::default();
        assert_eq!(estimator.estimate(&[], FS).bpm, 0.0);
        assert_eq!(estimator.estimate(&[1.0, 2.0], FS).bpm, 0.0);
        let mut signal = vec![0.0; 400];
        signal[100] = 1.0;
        signal[300] = 1.0;
        let result = estimator.estimate(&signal, FS);
        assert_eq!(result.r_peaks, vec![100, 300]);
        assert!((result.bpm - 75.0).abs() < 1e-9);
        assert_eq!(estimator.estimate(&signal, 0.0).bpm, 0.0);
    }

    #[test]
    fn huge_edge_margin_falls_back_to_the_whole_signal() {
        let estimator = HeartRateEstimator::new(HeartRateConfig {
            edge_margin_s: 1e17,
            ..HeartRateConfig::default()
        });
        let mut signal = vec![0.0; 400];
        signal[100] = 1.0;
        signal[300] = 1.0;
        let result = estimator.estimate(&signal, FS);
        assert_eq!(result.r_peaks, vec![100, 300]);
        assert!((result.bpm - 75.0).abs() < 1e-9);
    }
}
