// src/signal/mod.rs
pub mod error;
pub mod export;
pub mod filter;
pub mod frame;
pub mod heart_rate;
pub mod motion;
pub mod pipeline;
pub mod plot;
pub mod source;
pub mod wavelet;
pub use error::HolterError;
pub use export::{export_artifacts, signals_csv, ProcessingSummary, SessionStatusUpdate};
pub use filter::{ConditionedLead, EcgConditioner, StageOutcome};
pub use frame::{encode_frame, FrameHeader, FrameLayout, FrameParser, FrameWarning, ParsedFrame};
pub use heart_rate::{HeartRateEstimator, HeartRateResult};
pub use motion::{resample_mask, MotionMask, MotionSegmenter};
pub use pipeline::{LeadReport, Pipeline, PipelineResult, PipelineWarning};
pub use plot::{render_comparison_png, render_leads_png, render_motion_png, PlotStyle};
pub use source::{
    processed_base_key, raw_object_key, ArtifactSink, BlobSource, DirectorySink, DirectorySource,
    MemorySink, MemorySource,
};
pub use wavelet::{AdaptiveDenoiser, DenoiseReport, SegmentReport, Wavelet};
