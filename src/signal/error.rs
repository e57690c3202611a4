use thiserror::Error;
#[derive(Debug, Error)]
pub enum HolterError {
    #[error("buffer too short for frame header: need {needed} bytes, got {got}")]
    HeaderTooShort { needed: usize, got: usize },
    #[error("truncated {region} payload: need {needed} bytes, got {got}")]
    TruncatedPayload {
        region: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("capture session failed: {0}")]
    Capture(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
}
impl HolterError {
    /// True for the structural failures that abort a pipeline invocation
    /// before any numeric stage runs.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            HolterError::HeaderTooShort { .. } | HolterError::TruncatedPayload { .. }
        )
    }
}
impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for HolterError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        HolterError::Plot(format!("{value:?}"))
    }
}
impl From<image::ImageError> for HolterError {
    fn from(value: image::ImageError) -> Self {
        HolterError::Plot(value.to_string())
    }
}
