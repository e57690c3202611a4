use std::io::Cursor;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;
use crate::signal::frame::{AXIS_NAMES, LEAD_NAMES};
use crate::signal::motion::magnitude;
use crate::signal::pipeline::PipelineResult;
use crate::signal::HolterError;
#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub foreground: RGBColor,
    pub palette: Vec<RGBColor>,
}
impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 1400,
            height: 900,
            background: RGBColor(10, 10, 10),
            foreground: WHITE,
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW],
        }
    }
}
impl PlotStyle {
    fn color(&self, idx: usize) -> RGBColor {
        self.palette
            .get(idx % self.palette.len().max(1))
            .copied()
            .unwrap_or(self.foreground)
    }
}
/// Filtered leads I, II and III stacked over time.
pub fn render_leads_png(result: &PipelineResult, style: &PlotStyle) -> Result<Vec<u8>, HolterError> {
    let n = result.filtered.nrows();
    if n == 0 {
        return Err(HolterError::Plot("no ECG samples to plot".into()));
    }
    let fs = result.ecg_rate_hz;
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        for (lead, panel) in root.split_evenly((LEAD_NAMES.len(), 1)).iter().enumerate() {
            let column = result.filtered.column(lead);
            let (lo, hi) = bounds(column.iter().copied());
            let mut chart = ChartBuilder::on(panel)
                .margin(8)
                .caption(
                    format!("Lead {} (filtered)", LEAD_NAMES[lead]),
                    ("sans-serif", 16).into_font().color(&style.foreground),
                )
                .set_label_area_size(LabelAreaPosition::Left, 55)
                .set_label_area_size(LabelAreaPosition::Bottom, 30)
                .build_cartesian_2d(0f64..time_span(n, fs), lo..hi)?;
            chart
                .configure_mesh()
                .light_line_style(&style.foreground.mix(0.1))
                .label_style(("sans-serif", 12).into_font().color(&style.foreground))
                .y_desc("mV")
                .draw()?;
            let series = column.iter().enumerate().map(|(i, v)| (i as f64 / fs, *v));
            chart.draw_series(LineSeries::new(series, &style.color(lead)))?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
/// Lead II before and after conditioning, with detected beats marked.
pub fn render_comparison_png(
    result: &PipelineResult,
    style: &PlotStyle,
) -> Result<Vec<u8>, HolterError> {
    const LEAD: usize = 1;
    let n = result.filtered.nrows();
    if n == 0 {
        return Err(HolterError::Plot("no ECG samples to plot".into()));
    }
    let fs = result.ecg_rate_hz;
    let raw = result.raw_ecg.column(LEAD);
    let filtered = result.filtered.column(LEAD);
    let peaks = result
        .heart_rate(LEAD)
        .map(|hr| hr.r_peaks.clone())
        .unwrap_or_default();
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let (lo, hi) = bounds(raw.iter().chain(filtered.iter()).copied());
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(
                format!("Lead {}: raw vs filtered", LEAD_NAMES[LEAD]),
                ("sans-serif", 20).into_font().color(&style.foreground),
            )
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(0f64..time_span(n, fs), lo..hi)?;
        chart
            .configure_mesh()
            .light_line_style(&style.foreground.mix(0.1))
            .label_style(("sans-serif", 12).into_font().color(&style.foreground))
            .x_desc("s")
            .y_desc("mV")
            .draw()?;
        let raw_color = style.foreground.mix(0.4);
        chart
            .draw_series(LineSeries::new(
                raw.iter().enumerate().map(|(i, v)| (i as f64 / fs, *v)),
                &raw_color,
            ))?
            .label("raw")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &raw_color));
        let filt_color = style.color(0);
        chart
            .draw_series(LineSeries::new(
                filtered.iter().enumerate().map(|(i, v)| (i as f64 / fs, *v)),
                &filt_color,
            ))?
            .label("filtered")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &filt_color));
        let peak_color = style.color(1);
        chart
            .draw_series(
                peaks
                    .iter()
                    .filter(|&&p| p < n)
                    .map(|&p| Circle::new((p as f64 / fs, filtered[p]), 4, peak_color.filled())),
            )?
            .label(format!("R-peaks ({})", peaks.len()))
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, peak_color.filled()));
        chart
            .configure_series_labels()
            .label_font(("sans-serif", 12).into_font().color(&style.foreground))
            .border_style(&style.foreground.mix(0.2))
            .background_style(&style.background)
            .draw()?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
/// Accelerometer axes, magnitude and the motion mask.
pub fn render_motion_png(result: &PipelineResult, style: &PlotStyle) -> Result<Vec<u8>, HolterError> {
    let n = result.accel.nrows();
    if n == 0 {
        return Err(HolterError::Plot("no accelerometer samples to plot".into()));
    }
    let fs = result.accel_rate_hz;
    let span = time_span(n, fs);
    let norms = magnitude(result.accel.view());
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let panels = root.split_evenly((2, 1));
        let (lo, hi) = bounds(result.accel.iter().chain(norms.iter()).copied());
        let mut chart = ChartBuilder::on(&panels[0])
            .margin(8)
            .caption(
                format!("Accelerometer, motion {:.1}%", result.motion_percentage),
                ("sans-serif", 16).into_font().color(&style.foreground),
            )
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 30)
            .build_cartesian_2d(0f64..span, lo..hi)?;
        chart
            .configure_mesh()
            .light_line_style(&style.foreground.mix(0.1))
            .label_style(("sans-serif", 12).into_font().color(&style.foreground))
            .y_desc("g")
            .draw()?;
        for (axis, name) in AXIS_NAMES.iter().enumerate() {
            let color = style.color(axis + 1);
            let column = result.accel.column(axis);
            chart
                .draw_series(LineSeries::new(
                    column.iter().enumerate().map(|(i, v)| (i as f64 / fs, *v)),
                    &color,
                ))?
                .label(*name)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        let mag_color = style.foreground;
        chart
            .draw_series(LineSeries::new(
                norms.iter().enumerate().map(|(i, v)| (i as f64 / fs, *v)),
                &mag_color,
            ))?
            .label("|a|")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &mag_color));
        chart
            .configure_series_labels()
            .label_font(("sans-serif", 12).into_font().color(&style.foreground))
            .border_style(&style.foreground.mix(0.2))
            .background_style(&style.background)
            .draw()?;

        let mut mask_chart = ChartBuilder::on(&panels[1])
            .margin(8)
            .caption(
                "Motion mask",
                ("sans-serif", 16).into_font().color(&style.foreground),
            )
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 30)
            .build_cartesian_2d(0f64..span, -0.1f64..1.1f64)?;
        mask_chart
            .configure_mesh()
            .light_line_style(&style.foreground.mix(0.1))
            .label_style(("sans-serif", 12).into_font().color(&style.foreground))
            .x_desc("s")
            .draw()?;
        let flags = result.accel_motion.as_slice();
        mask_chart.draw_series(LineSeries::new(
            flags
                .iter()
                .enumerate()
                .map(|(i, flag)| (i as f64 / fs, if *flag { 1.0 } else { 0.0 })),
            &style.color(1),
        ))?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
fn time_span(samples: usize, fs: f64) -> f64 {
    samples.saturating_sub(1).max(1) as f64 / fs
}
fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    if (hi - lo).abs() < 1e-9 {
        return (lo - 1.0, hi + 1.0);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}
fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, HolterError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| HolterError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceProfile, ECGD_MAGIC};
    use crate::signal::frame::{encode_frame, FrameHeader};
    use crate::signal::pipeline::Pipeline;
    use ndarray::Array2;
    fn empty_result() -> PipelineResult {
        let header = FrameHeader {
            magic: ECGD_MAGIC,
            version: 1,
            device_id: 1,
            session_id: 1,
            start_time: 0,
            ecg_rate_hz: 250,
            accel_rate_hz: 50,
            ecg_samples: 0,
            accel_samples: 0,
        };
        let empty = Array2::zeros((0, 3));
        let bytes =
            encode_frame(&header, empty.view(), empty.view(), &DeviceProfile::default()).unwrap();
        Pipeline::default().process(&bytes).unwrap()
    }
    #[test]
    fn empty_results_are_rejected_before_drawing() {
        let result = empty_result();
        let style = PlotStyle::default();
        assert!(matches!(render_leads_png(&result, &style), Err(HolterError::Plot(_))));
        assert!(matches!(render_comparison_png(&result, &style), Err(HolterError::Plot(_))));
        assert!(matches!(render_motion_png(&result, &style), Err(HolterError::Plot(_))));
    }
    #[test]
    fn bounds_pad_flat_and_empty_series() {
        assert_eq!(bounds([0.5, 0.5].into_iter()), (-0.5, 1.5));
        assert_eq!(bounds(std::iter::empty()), (-1.0, 1.0));
        let (lo, hi) = bounds([0.0, 10.0, f64::NAN].into_iter());
        assert!((lo + 0.5).abs() < 1e-12 && (hi - 10.5).abs() < 1e-12);
    }
    #[test]
    fn empty_palette_falls_back_to_foreground() {
        let style = PlotStyle {
            palette: Vec::new(),
            ..PlotStyle::default()
        };
        assert_eq!(style.color(3), style.foreground);
    }
}
