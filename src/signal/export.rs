use std::io::{self, BufWriter, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::signal::frame::FrameLayout;
use crate::signal::heart_rate::HeartRateResult;
use crate::signal::pipeline::{PipelineResult, PipelineWarning};
use crate::signal::plot::{render_comparison_png, render_leads_png, render_motion_png, PlotStyle};
use crate::signal::source::ArtifactSink;
use crate::signal::HolterError;

pub const CSV_HEADER: &str = "time_ecg_s,ecg_I_raw_mV,ecg_II_raw_mV,ecg_III_raw_mV,\
ecg_I_filt_mV,ecg_II_filt_mV,ecg_III_filt_mV,time_imu_s,accel_x_g,accel_y_g,accel_z_g,motion_detected";

#[derive(Clone, Debug, Serialize)]
pub struct LeadHeartRate {
    pub bpm: f64,
    pub num_beats: usize,
    pub r_peaks: Vec<usize>,
}

impl From<&HeartRateResult> for LeadHeartRate {
    fn from(value: &HeartRateResult) -> Self {
        Self {
            bpm: value.bpm,
            num_beats: value.num_beats,
            r_peaks: value.r_peaks.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HeartRateSummary {
    pub average_bpm: f64,
    #[serde(rename = "lead_I")]
    pub lead_i: LeadHeartRate,
    #[serde(rename = "lead_II")]
    pub lead_ii: LeadHeartRate,
    #[serde(rename = "lead_III")]
    pub lead_iii: LeadHeartRate,
}

/// Metadata record written next to the processed signals.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessingSummary {
    pub source_file: String,
    pub processing_timestamp: String,
    pub device_id: u16,
    pub session_id: u32,
    pub layout: FrameLayout,
    pub duration_seconds: f64,
    pub motion_percentage: f64,
    pub ecg_samples: usize,
    pub imu_samples: usize,
    pub ecg_sample_rate_hz: f64,
    pub imu_sample_rate_hz: f64,
    pub header_ecg_rate: u16,
    pub header_imu_rate: u16,
    pub heart_rate: HeartRateSummary,
    pub warnings: Vec<PipelineWarning>,
}

impl ProcessingSummary {
    pub fn from_result(
        result: &PipelineResult,
        source_file: impl Into<String>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let lead = |i: usize| {
            result
                .heart_rate(i)
                .map(LeadHeartRate::from)
                .unwrap_or_else(|| LeadHeartRate::from(&HeartRateResult::default()))
        };
        Self {
            source_file: source_file.into(),
            processing_timestamp: processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            device_id: result.header.device_id,
            session_id: result.header.session_id,
            layout: result.layout,
            duration_seconds: result.duration_s,
            motion_percentage: result.motion_percentage,
            ecg_samples: result.num_ecg_samples(),
            imu_samples: result.num_accel_samples(),
            ecg_sample_rate_hz: result.ecg_rate_hz,
            imu_sample_rate_hz: result.accel_rate_hz,
            header_ecg_rate: result.header.ecg_rate_hz,
            header_imu_rate: result.header.accel_rate_hz,
            heart_rate: HeartRateSummary {
                average_bpm: result.average_bpm(),
                lead_i: lead(0),
                lead_ii: lead(1),
                lead_iii: lead(2),
            },
            warnings: result.warnings.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, HolterError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Processed,
    Failed,
}

/// Record pushed to the session-tracking store once a blob is handled.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatusUpdate {
    pub device_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub processed_key: Option<String>,
    pub motion_percentage: Option<f64>,
    pub average_bpm: Option<f64>,
    pub error: Option<String>,
    pub processed_at: String,
}

impl SessionStatusUpdate {
    pub fn processed(
        result: &PipelineResult,
        processed_key: impl Into<String>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: result.header.device_id.to_string(),
            session_id: result.header.session_id.to_string(),
            status: SessionStatus::Processed,
            processed_key: Some(processed_key.into()),
            motion_percentage: Some(result.motion_percentage),
            average_bpm: Some(result.average_bpm()),
            error: None,
            processed_at: processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn failed(
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        error: &HolterError,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: session_id.into(),
            status: SessionStatus::Failed,
            processed_key: None,
            motion_percentage: None,
            average_bpm: None,
            error: Some(error.to_string()),
            processed_at: processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// One row per sample of the longer stream; the shorter stream's columns
/// are left blank past its end.
pub fn write_signals_csv<W: Write>(result: &PipelineResult, writer: W) -> io::Result<()> {
    let mut w = BufWriter::new(writer);
    writeln!(w, "{CSV_HEADER}")?;
    let n_ecg = result.num_ecg_samples();
    let n_imu = result.num_accel_samples();
    let motion = result.accel_motion.as_slice();
    for i in 0..n_ecg.max(n_imu) {
        if i < n_ecg {
            let raw = result.raw_ecg.row(i);
            let filt = result.filtered.row(i);
            write!(
                w,
                "{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4}",
                i as f64 / result.ecg_rate_hz,
                raw[0],
                raw[1],
                raw[2],
                filt[0],
                filt[1],
                filt[2]
            )?;
        } else {
            write!(w, ",,,,,,")?;
        }
        if i < n_imu {
            let accel = result.accel.row(i);
            let moving = motion.get(i).copied().unwrap_or(false);
            writeln!(
                w,
                ",{:.4},{:.4},{:.4},{:.4},{}",
                i as f64 / result.accel_rate_hz,
                accel[0],
                accel[1],
                accel[2],
                u8::from(moving)
            )?;
        } else {
            writeln!(w, ",,,,,")?;
        }
    }
    w.flush()
}

pub fn signals_csv(result: &PipelineResult) -> Result<Vec<u8>, HolterError> {
    let mut out = Vec::new();
    write_signals_csv(result, &mut out)?;
    Ok(out)
}

/// Writes CSV, metadata and optionally plots under `base_key`, returning
/// the keys written. A plot that fails to render is logged and skipped.
pub fn export_artifacts<S: ArtifactSink + ?Sized>(
    result: &PipelineResult,
    summary: &ProcessingSummary,
    base_key: &str,
    sink: &mut S,
    plots: Option<&PlotStyle>,
) -> Result<Vec<String>, HolterError> {
    let mut written = Vec::new();
    if let Some(style) = plots {
        let mut renders = vec![
            ("ecg_filtered.png", render_leads_png(result, style)),
            ("ecg_comparison.png", render_comparison_png(result, style)),
        ];
        if result.num_accel_samples() > 0 {
            renders.push(("motion.png", render_motion_png(result, style)));
        }
        for (name, render) in renders {
            match render {
                Ok(png) => {
                    let key = format!("{base_key}_{name}");
                    sink.put(&key, "image/png", &png)?;
                    written.push(key);
                }
                Err(err) => warn!("skipping {name}: {err}"),
            }
        }
    }
    let csv_key = format!("{base_key}_signals.csv");
    sink.put(&csv_key, "text/csv", &signals_csv(result)?)?;
    written.push(csv_key);

    let metadata_key = format!("{base_key}_metadata.json");
    sink.put(&metadata_key, "application/json", summary.to_json()?.as_bytes())?;
    written.push(metadata_key);

    info!("exported {} artifacts under {base_key}", written.len());
    Ok(written)
}
