use std::f64::consts::PI;

use log::{debug, warn};
use serde::Serialize;

use crate::config::ConditioningConfig;

/// Filter design request. Frequencies are normalized to Nyquist, `(0, 1)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FilterKind {
    Highpass { normalized: f64, order: usize },
    Lowpass { normalized: f64, order: usize },
    Notch { normalized: f64, q: f64 },
}
#[derive(Clone, Copy, Debug, PartialEq)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}
#[derive(Clone, Copy, Debug, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}
impl BiquadCoeffs {
    fn process(&self, state: &mut BiquadState, input: f64) -> f64 {
        // Transposed direct form II
        let y = self.b0 * input + state.z1;
        state.z1 = self.b1 * input - self.a1 * y + state.z2;
        state.z2 = self.b2 * input - self.a2 * y;
        y
    }
    fn dc_gain(&self) -> f64 {
        let den = 1.0 + self.a1 + self.a2;
        if den.abs() < 1e-12 {
            0.0
        } else {
            (self.b0 + self.b1 + self.b2) / den
        }
    }
    /// State after a unit step has settled.
    fn step_state(&self) -> BiquadState {
        let g = self.dc_gain();
        let z2 = self.b2 - self.a2 * g;
        BiquadState {
            z1: self.b1 - self.a1 * g + z2,
            z2,
        }
    }
}
/// Cascade of second-order sections applied forward and backward.
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    sections: Vec<BiquadCoeffs>,
}
impl FilterChain {
    pub fn from_kinds(kinds: &[FilterKind]) -> Self {
        let mut sections = Vec::new();
        for kind in kinds {
            sections.extend(design_sections(*kind));
        }
        Self { sections }
    }
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }
    /// Zero-phase filtering. The signal is padded by odd reflection at both
    /// ends and each pass starts from the settled state for its first sample.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        if self.sections.is_empty() || signal.len() < 2 {
            return signal.to_vec();
        }
        let edge = (3 * (2 * self.sections.len() + 1)).min(signal.len() - 1);
        let extended = odd_extend(signal, edge);
        let initial = self.initial_states();
        let mut forward = self.run(&extended, &initial);
        forward.reverse();
        let mut backward = self.run(&forward, &initial);
        backward.reverse();
        backward[edge..edge + signal.len()].to_vec()
    }
    fn initial_states(&self) -> Vec<BiquadState> {
        let mut scale = 1.0;
        self.sections
            .iter()
            .map(|section| {
                let step = section.step_state();
                let state = BiquadState {
                    z1: step.z1 * scale,
                    z2: step.z2 * scale,
                };
                scale *= section.dc_gain();
                state
            })
            .collect()
    }
    fn run(&self, input: &[f64], initial: &[BiquadState]) -> Vec<f64> {
        let x0 = input.first().copied().unwrap_or(0.0);
        let mut data = input.to_vec();
        for (section, start) in self.sections.iter().zip(initial) {
            let mut state = BiquadState {
                z1: start.z1 * x0,
                z2: start.z2 * x0,
            };
            for value in data.iter_mut() {
                *value = section.process(&mut state, *value);
            }
        }
        data
    }
}
fn odd_extend(signal: &[f64], edge: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];
    let mut out = Vec::with_capacity(n + 2 * edge);
    out.extend((1..=edge).rev().map(|i| 2.0 * first - signal[i]));
    out.extend_from_slice(signal);
    out.extend((1..=edge).map(|i| 2.0 * last - signal[n - 1 - i]));
    out
}
fn design_sections(kind: FilterKind) -> Vec<BiquadCoeffs> {
    match kind {
        FilterKind::Highpass { normalized, order } => butterworth_qs(order)
            .map(|q| highpass(normalized, q))
            .collect(),
        FilterKind::Lowpass { normalized, order } => butterworth_qs(order)
            .map(|q| lowpass(normalized, q))
            .collect(),
        FilterKind::Notch { normalized, q } => vec![notch(normalized, q)],
    }
}
/// Section Q values of an even-order Butterworth prototype.
fn butterworth_qs(order: usize) -> impl Iterator<Item = f64> {
    let n = order.max(2) as f64;
    (0..order.max(2) / 2).map(move |k| {
        let theta = (2.0 * k as f64 + 1.0) * PI / (2.0 * n);
        1.0 / (2.0 * theta.cos())
    })
}
fn lowpass(normalized: f64, q: f64) -> BiquadCoeffs {
    let w0 = PI * normalized;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}
fn highpass(normalized: f64, q: f64) -> BiquadCoeffs {
    let w0 = PI * normalized;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 + cos_w0) * 0.5;
    let b1 = -(1.0 + cos_w0);
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}
/// Second-order IIR notch, -3 dB bandwidth `normalized / q`.
fn notch(normalized: f64, q: f64) -> BiquadCoeffs {
    let w0 = PI * normalized;
    let bandwidth = w0 / q;
    let gain = 1.0 / (1.0 + (bandwidth / 2.0).tan());
    let cos_w0 = w0.cos();
    BiquadCoeffs {
        b0: gain,
        b1: -2.0 * gain * cos_w0,
        b2: gain,
        a1: -2.0 * gain * cos_w0,
        a2: 2.0 * gain - 1.0,
    }
}
fn normalize(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> BiquadCoeffs {
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Highpass,
    Lowpass,
    Notch,
}

/// What a conditioning stage did with its requested cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Applied { normalized: f64 },
    Skipped { normalized: f64 },
    Clamped { requested: f64, used: f64 },
}

impl StageOutcome {
    pub fn is_warning(&self) -> bool {
        !matches!(self, StageOutcome::Applied { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: FilterStage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Clone, Debug)]
pub struct ConditionedLead {
    pub signal: Vec<f64>,
    pub stages: Vec<StageReport>,
}

/// High-pass, low-pass and mains notch, each zero-phase, over a whole lead.
#[derive(Clone, Debug, Default)]
pub struct EcgConditioner {
    config: ConditioningConfig,
}

impl EcgConditioner {
    pub fn new(config: ConditioningConfig) -> Self {
        Self { config }
    }

    /// Resolves each stage against `sample_rate_hz` without touching data.
    pub fn plan(&self, sample_rate_hz: f64) -> (FilterChain, Vec<StageReport>) {
        let cfg = &self.config;
        let nyquist = sample_rate_hz / 2.0;
        let mut kinds = Vec::with_capacity(3);
        let mut stages = Vec::with_capacity(3);

        let hp = cfg.highpass_hz / nyquist;
        let outcome = if is_unit_interval(hp) {
            kinds.push(FilterKind::Highpass {
                normalized: hp,
                order: cfg.order,
            });
            StageOutcome::Applied { normalized: hp }
        } else {
            warn!(
                "high-pass cutoff {} Hz invalid at {} Hz (normalized {hp}); stage skipped",
                cfg.highpass_hz, sample_rate_hz
            );
            StageOutcome::Skipped { normalized: hp }
        };
        stages.push(StageReport {
            stage: FilterStage::Highpass,
            outcome,
        });

        let lp_hz = cfg
            .lowpass_ceiling_hz
            .min(cfg.lowpass_nyquist_fraction * nyquist);
        let lp = lp_hz / nyquist;
        let outcome = if is_unit_interval(lp) {
            kinds.push(FilterKind::Lowpass {
                normalized: lp,
                order: cfg.order,
            });
            StageOutcome::Applied { normalized: lp }
        } else {
            let used = cfg.lowpass_fallback_normalized;
            warn!("low-pass cutoff normalized to {lp} is invalid; clamped to {used}");
            kinds.push(FilterKind::Lowpass {
                normalized: used,
                order: cfg.order,
            });
            StageOutcome::Clamped {
                requested: lp,
                used,
            }
        };
        stages.push(StageReport {
            stage: FilterStage::Lowpass,
            outcome,
        });

        let notch = cfg.notch_hz / nyquist;
        let outcome = if cfg.notch_hz > 0.0 && sample_rate_hz > 2.0 * cfg.notch_hz {
            kinds.push(FilterKind::Notch {
                normalized: notch,
                q: cfg.notch_q,
            });
            StageOutcome::Applied { normalized: notch }
        } else {
            debug!(
                "{} Hz notch skipped at {} Hz sample rate",
                cfg.notch_hz, sample_rate_hz
            );
            StageOutcome::Skipped { normalized: notch }
        };
        stages.push(StageReport {
            stage: FilterStage::Notch,
            outcome,
        });

        (FilterChain::from_kinds(&kinds), stages)
    }

    pub fn condition(&self, signal: &[f64], sample_rate_hz: f64) -> ConditionedLead {
        let (chain, stages) = self.plan(sample_rate_hz);
        let signal = chain.filtfilt(signal);
        debug!(
            "conditioned {} samples through {} sections",
            signal.len(),
            chain.num_sections()
        );
        ConditionedLead { signal, stages }
    }
}

fn is_unit_interval(value: f64) -> bool {
    value > 0.0 && value < 1.0
}
