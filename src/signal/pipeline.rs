use std::fmt;
use std::thread::{self, ScopedJoinHandle};

use log::{info, warn};
use ndarray::{Array2, ArrayView1};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::signal::filter::{ConditionedLead, EcgConditioner, FilterStage, StageOutcome, StageReport};
use crate::signal::frame::{FrameHeader, FrameLayout, FrameParser, FrameWarning, ParsedFrame, LEAD_NAMES};
use crate::signal::heart_rate::{HeartRateEstimator, HeartRateResult};
use crate::signal::motion::{MotionMask, MotionSegmenter};
use crate::signal::wavelet::{AdaptiveDenoiser, DenoiseReport};
use crate::signal::HolterError;

/// Non-fatal conditions met while processing one blob.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    Frame { warning: FrameWarning },
    RateFallback {
        stream: &'static str,
        declared_hz: u16,
        used_hz: f64,
    },
    FilterStage {
        lead: &'static str,
        stage: FilterStage,
        #[serde(flatten)]
        outcome: StageOutcome,
    },
    NoAccelerometerData,
    SegmentPassedThrough {
        lead: &'static str,
        segment: &'static str,
        samples: usize,
    },
    NoHeartRate {
        lead: &'static str,
        peaks: usize,
    },
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::Frame { warning } => write!(f, "{warning}"),
            PipelineWarning::RateFallback {
                stream,
                declared_hz,
                used_hz,
            } => write!(f, "{stream} rate {declared_hz} Hz unusable, using {used_hz} Hz"),
            PipelineWarning::FilterStage {
                lead,
                stage,
                outcome,
            } => write!(f, "lead {lead}: {stage:?} stage {outcome:?}"),
            PipelineWarning::NoAccelerometerData => {
                write!(f, "no accelerometer data, recording treated as stationary")
            }
            PipelineWarning::SegmentPassedThrough {
                lead,
                segment,
                samples,
            } => write!(f, "lead {lead}: {samples} {segment} samples passed through unfiltered"),
            PipelineWarning::NoHeartRate { lead, peaks } => {
                write!(f, "lead {lead}: {peaks} peak(s) detected, heart rate unavailable")
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LeadReport {
    pub name: &'static str,
    pub heart_rate: HeartRateResult,
    pub denoise: DenoiseReport,
    pub stages: Vec<StageReport>,
}

/// Everything one invocation produced. Matrices are samples x 3.
#[derive(Clone, Debug)]
pub struct PipelineResult {
    pub header: FrameHeader,
    pub layout: FrameLayout,
    pub ecg_rate_hz: f64,
    pub accel_rate_hz: f64,
    pub raw_ecg: Array2<f64>,
    pub accel: Array2<f64>,
    /// Conditioned, before wavelet shrinkage.
    pub preprocessed: Array2<f64>,
    pub filtered: Array2<f64>,
    /// Mask at the accelerometer rate.
    pub accel_motion: MotionMask,
    /// Mask resampled to one entry per ECG sample.
    pub motion_mask: MotionMask,
    pub motion_percentage: f64,
    pub duration_s: f64,
    pub leads: Vec<LeadReport>,
    pub warnings: Vec<PipelineWarning>,
}

impl PipelineResult {
    pub fn num_ecg_samples(&self) -> usize {
        self.raw_ecg.nrows()
    }
    pub fn num_accel_samples(&self) -> usize {
        self.accel.nrows()
    }
    pub fn filtered_lead(&self, lead: usize) -> ArrayView1<'_, f64> {
        self.filtered.column(lead)
    }
    pub fn heart_rate(&self, lead: usize) -> Option<&HeartRateResult> {
        self.leads.get(lead).map(|report| &report.heart_rate)
    }
    /// Mean over leads that produced a rate, 0 if none did.
    pub fn average_bpm(&self) -> f64 {
        let rates: Vec<f64> = self
            .leads
            .iter()
            .map(|lead| lead.heart_rate.bpm)
            .filter(|bpm| *bpm > 0.0)
            .collect();
        if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        }
    }
}

/// Bytes in, denoised leads and heart rates out. Holds no state between
/// invocations.
pub struct Pipeline {
    config: PipelineConfig,
    parser: FrameParser,
    segmenter: MotionSegmenter,
    conditioner: EcgConditioner,
    denoiser: AdaptiveDenoiser,
    estimator: HeartRateEstimator,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::build(PipelineConfig::default())
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, HolterError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: PipelineConfig) -> Self {
        Self {
            parser: FrameParser::new(config.device.clone()),
            segmenter: MotionSegmenter::new(config.motion.clone()),
            conditioner: EcgConditioner::new(config.conditioning.clone()),
            denoiser: AdaptiveDenoiser::new(config.denoise.clone()),
            estimator: HeartRateEstimator::new(config.heart_rate.clone()),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Only a malformed blob fails; every later stage degrades instead.
    pub fn process(&self, bytes: &[u8]) -> Result<PipelineResult, HolterError> {
        let frame = self.parser.parse(bytes)?;
        Ok(self.process_frame(frame))
    }

    pub fn process_frame(&self, frame: ParsedFrame) -> PipelineResult {
        let mut warnings: Vec<PipelineWarning> = frame
            .warnings
            .iter()
            .cloned()
            .map(|warning| PipelineWarning::Frame { warning })
            .collect();
        let device = &self.config.device;
        let ecg_rate_hz = resolve_rate(
            "ecg",
            frame.header.ecg_rate_hz,
            device.fallback_ecg_rate_hz,
            device.force_fallback_rates,
            &mut warnings,
        );
        let accel_rate_hz = resolve_rate(
            "accelerometer",
            frame.header.accel_rate_hz,
            device.fallback_accel_rate_hz,
            device.force_fallback_rates,
            &mut warnings,
        );
        if frame.accel.nrows() == 0 {
            warnings.push(PipelineWarning::NoAccelerometerData);
        }
        let n = frame.ecg.nrows();

        // Motion segmentation and per-lead conditioning share nothing.
        let (accel_motion, conditioned) = thread::scope(|scope| {
            let motion = scope.spawn(|| self.segmenter.segment(frame.accel.view()));
            let workers: Vec<ScopedJoinHandle<'_, ConditionedLead>> = (0..LEAD_NAMES.len())
                .map(|lead| {
                    let column = frame.ecg.column(lead).to_vec();
                    scope.spawn(move || self.conditioner.condition(&column, ecg_rate_hz))
                })
                .collect();
            let conditioned: Vec<ConditionedLead> = workers.into_iter().map(join_worker).collect();
            (join_worker(motion), conditioned)
        });
        let motion_mask = accel_motion.resample(n);

        let denoised: Vec<(Vec<f64>, DenoiseReport, HeartRateResult)> = thread::scope(|scope| {
            let mask = motion_mask.as_slice();
            let workers: Vec<_> = conditioned
                .iter()
                .map(|lead| {
                    scope.spawn(move || {
                        let (signal, report) = self.denoiser.denoise(&lead.signal, mask);
                        let heart_rate = self.estimator.estimate(&signal, ecg_rate_hz);
                        (signal, report, heart_rate)
                    })
                })
                .collect();
            workers.into_iter().map(join_worker).collect()
        });

        let preprocessed = Array2::from_shape_fn((n, LEAD_NAMES.len()), |(i, lead)| {
            conditioned[lead].signal[i]
        });
        let filtered = Array2::from_shape_fn((n, LEAD_NAMES.len()), |(i, lead)| denoised[lead].0[i]);

        let motion_count = motion_mask.motion_count();
        let leads: Vec<LeadReport> = LEAD_NAMES
            .iter()
            .zip(conditioned)
            .zip(denoised)
            .map(|((&name, lead), (_, denoise, heart_rate))| {
                collect_lead_warnings(name, &lead, &denoise, &heart_rate, motion_count, n, &mut warnings);
                LeadReport {
                    name,
                    heart_rate,
                    denoise,
                    stages: lead.stages,
                }
            })
            .collect();

        for warning in &warnings {
            warn!("{warning}");
        }
        let motion_percentage = accel_motion.motion_percentage();
        let duration_s = n as f64 / ecg_rate_hz;
        info!(
            "processed device {} session {}: {n} ECG samples ({duration_s:.1} s), motion {motion_percentage:.1}%, \
             BPM I/II/III = {:.1}/{:.1}/{:.1}",
            frame.header.device_id,
            frame.header.session_id,
            leads[0].heart_rate.bpm,
            leads[1].heart_rate.bpm,
            leads[2].heart_rate.bpm,
        );
        PipelineResult {
            header: frame.header,
            layout: frame.layout,
            ecg_rate_hz,
            accel_rate_hz,
            raw_ecg: frame.ecg,
            accel: frame.accel,
            preprocessed,
            filtered,
            accel_motion,
            motion_mask,
            motion_percentage,
            duration_s,
            leads,
            warnings,
        }
    }
}

fn join_worker<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

fn resolve_rate(
    stream: &'static str,
    declared: u16,
    fallback: f64,
    force_fallback: bool,
    warnings: &mut Vec<PipelineWarning>,
) -> f64 {
    if force_fallback {
        return fallback;
    }
    if declared == 0 {
        warnings.push(PipelineWarning::RateFallback {
            stream,
            declared_hz: declared,
            used_hz: fallback,
        });
        return fallback;
    }
    f64::from(declared)
}

fn collect_lead_warnings(
    name: &'static str,
    lead: &ConditionedLead,
    denoise: &DenoiseReport,
    heart_rate: &HeartRateResult,
    motion_count: usize,
    total: usize,
    warnings: &mut Vec<PipelineWarning>,
) {
    for stage in lead.stages.iter().filter(|stage| stage.outcome.is_warning()) {
        warnings.push(PipelineWarning::FilterStage {
            lead: name,
            stage: stage.stage,
            outcome: stage.outcome,
        });
    }
    let segments = [
        ("motion", denoise.motion.is_none(), motion_count),
        ("quiet", denoise.quiet.is_none(), total - motion_count),
    ];
    for (segment, passed_through, samples) in segments {
        if passed_through && samples > 0 {
            warnings.push(PipelineWarning::SegmentPassedThrough {
                lead: name,
                segment,
                samples,
            });
        }
    }
    if heart_rate.num_beats < 2 {
        warnings.push(PipelineWarning::NoHeartRate {
            lead: name,
            peaks: heart_rate.num_beats,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceProfile, ECGD_MAGIC};
    use crate::signal::frame::encode_frame;

    fn blob(ecg_rate_hz: u16, ecg: &Array2<f64>, accel: &Array2<f64>) -> Vec<u8> {
        let header = FrameHeader {
            magic: ECGD_MAGIC,
            version: 1,
            device_id: 1,
            session_id: 99,
            start_time: 1_700_000_000,
            ecg_rate_hz,
            accel_rate_hz: 50,
            ecg_samples: 0,
            accel_samples: 0,
        };
        encode_frame(&header, ecg.view(), accel.view(), &DeviceProfile::default()).unwrap()
    }

    #[test]
    fn empty_frame_degrades_gracefully() {
        let ecg = Array2::zeros((0, 3));
        let result = Pipeline::default()
            .process(&blob(250, &ecg, &ecg))
            .unwrap();
        assert_eq!(result.filtered.dim(), (0, 3));
        assert!(result.motion_mask.is_empty());
        assert_eq!(result.duration_s, 0.0);
        assert_eq!(result.average_bpm(), 0.0);
        assert!(result.warnings.contains(&PipelineWarning::NoAccelerometerData));
    }

    #[test]
    fn zero_declared_rate_falls_back() {
        let ecg = Array2::from_elem((500, 3), 0.1);
        let result = Pipeline::default()
            .process(&blob(0, &ecg, &Array2::zeros((0, 3))))
            .unwrap();
        assert_eq!(result.ecg_rate_hz, 250.0);
        assert_eq!(result.accel_rate_hz, 50.0);
        assert!((result.duration_s - 2.0).abs() < 1e-12);
        assert!(result.warnings.contains(&PipelineWarning::RateFallback {
            stream: "ecg",
            declared_hz: 0,
            used_hz: 250.0,
        }));
    }

    #[test]
    fn forced_fallback_ignores_header() {
        let mut config = PipelineConfig::default();
        config.device.force_fallback_rates = true;
        config.device.fallback_ecg_rate_hz = 500.0;
        let ecg = Array2::from_elem((500, 3), 0.1);
        let result = Pipeline::new(config)
            .unwrap()
            .process(&blob(250, &ecg, &Array2::zeros((0, 3))))
            .unwrap();
        assert_eq!(result.ecg_rate_hz, 500.0);
        assert!(!result
            .warnings
            .iter()
            .any(|w| matches!(w, PipelineWarning::RateFallback { .. })));
    }

    #[test]
    fn low_rate_skips_notch_per_lead() {
        let ecg = Array2::from_elem((300, 3), 0.0);
        let result = Pipeline::default()
            .process(&blob(100, &ecg, &Array2::zeros((0, 3))))
            .unwrap();
        let skipped = result
            .warnings
            .iter()
            .filter(|w| {
                matches!(
                    w,
                    PipelineWarning::FilterStage {
                        stage: FilterStage::Notch,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(skipped, 3);
        assert!(result.leads.iter().all(|lead| lead.stages.len() == 3));
    }

    #[test]
    fn structural_errors_propagate() {
        let err = Pipeline::default().process(&[0u8; 10]).err().unwrap();
        assert!(err.is_structural());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.motion.window = 0;
        assert!(matches!(
            Pipeline::new(config),
            Err(HolterError::InvalidConfig(_))
        ));
    }
}
