use std::f64::consts::PI;

use holter_signal::capture::{CaptureEvent, CaptureSession, CaptureState, DEVICE_SAMPLE_RATE_HZ};
use holter_signal::config::DeviceProfile;
use holter_signal::signal::filter::FilterStage;
use holter_signal::signal::{FrameParser, PipelineWarning};
use holter_signal::Pipeline;

/// The line sequence a freshly booted recorder prints for one block.
fn device_script(samples: usize) -> Vec<String> {
    let mut lines: Vec<String> = [
        "SYSTEM:STARTING",
        "SYSTEM:XSPACEBIO_OK",
        "SYSTEM:ADXL345_OK",
        "SYSTEM:READY",
        "SYSTEM:BUFFER_SIZE:1500",
        "CAPTURE:START",
        "PROGRESS:100/1500",
        "CAPTURE:COMPLETE",
        "TRANSFER:START",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    lines.push(format!("TRANSFER:SAMPLES:{samples}"));
    for i in 0..samples {
        let t = i as f64 / f64::from(DEVICE_SAMPLE_RATE_HZ);
        let beat = (2.0 * PI * 1.2 * t).sin().max(0.0).powi(32);
        // One millivolt at the electrodes is 1.1 V after the AD8232 gain.
        let lead_i = 1.65 + 0.6 * 1.1 * beat;
        let lead_ii = 1.65 + 1.1 * beat;
        lines.push(format!(
            "DATA:{},{lead_i:.6},{lead_ii:.6},{:.6},0.0100,-0.0200,9.8066",
            1000 + i * 10,
            lead_ii - lead_i
        ));
    }
    lines.push("TRANSFER:END".to_string());
    lines.push("WAITING:COMMAND".to_string());
    lines
}

#[test]
fn scripted_block_reaches_the_pipeline() {
    let mut session = CaptureSession::new();
    let mut samples = 0;
    let mut ended = None;
    for line in device_script(1000) {
        match session.ingest_line(&line) {
            CaptureEvent::Sample => samples += 1,
            CaptureEvent::TransferEnded { received, expected } => ended = Some((received, expected)),
            CaptureEvent::MalformedData { line, reason } => panic!("{line}: {reason}"),
            _ => {}
        }
    }
    assert_eq!(samples, 1000);
    assert_eq!(ended, Some((1000, Some(1000))));
    assert_eq!(session.state(), CaptureState::TransferComplete);

    let block = session.take_block().unwrap();
    assert_eq!(session.state(), CaptureState::AwaitingCaptureStart);
    assert!(block.is_complete());
    assert!((block.duration_s() - 9.99).abs() < 1e-9);

    let device = DeviceProfile::default();
    let frame = block.to_frame(3, 1_763_337_600, &device).unwrap();
    let parsed = FrameParser::new(device).parse(&frame).unwrap();
    assert!(parsed.warnings.is_empty());
    assert_eq!(parsed.header.device_id, 3);
    assert_eq!(parsed.header.ecg_rate_hz, 100);
    assert_eq!(parsed.ecg.nrows(), 1000);
    assert_eq!(parsed.accel.nrows(), 1000);
    assert!((parsed.accel[[0, 2]] - 1.0).abs() < 1e-3);

    let result = Pipeline::default().process_frame(parsed);
    let bpm = result.leads[1].heart_rate.bpm;
    assert!((bpm - 72.0).abs() < 72.0 * 0.05, "bpm {bpm}");
    assert_eq!(result.motion_percentage, 0.0);
    // 60 Hz sits above Nyquist at 100 Hz.
    assert!(result.warnings.iter().any(|w| matches!(
        w,
        PipelineWarning::FilterStage { lead: "II", stage: FilterStage::Notch, .. }
    )));
}

#[test]
fn noise_on_the_line_does_not_abort_a_transfer() {
    let mut session = CaptureSession::new();
    let mut lines = device_script(5);
    lines.insert(12, "DATA:garbage".to_string());
    lines.insert(13, "\u{fffd}\u{fffd}".to_string());
    lines.insert(3, "ERROR:ADXL345_NOT_FOUND".to_string());
    let events: Vec<CaptureEvent> = lines.iter().map(|l| session.ingest_line(l)).collect();

    assert!(events.contains(&CaptureEvent::DeviceError("ADXL345_NOT_FOUND".to_string())));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::MalformedData { .. }))
            .count(),
        1
    );
    assert_eq!(session.malformed_lines(), 1);
    let block = session.take_block().unwrap();
    assert_eq!(block.len(), 5);
    assert!(block.is_complete());
}

#[test]
fn short_transfer_is_flagged_incomplete() {
    let mut session = CaptureSession::new();
    for line in device_script(4) {
        let line = line.replace("TRANSFER:SAMPLES:4", "TRANSFER:SAMPLES:6");
        session.ingest_line(&line);
    }
    let block = session.take_block().unwrap();
    assert_eq!(block.len(), 4);
    assert_eq!(block.expected, Some(6));
    assert!(!block.is_complete());
}

#[test]
fn consecutive_blocks_reuse_the_session() {
    let mut session = CaptureSession::new();
    for line in device_script(3) {
        session.ingest_line(&line);
    }
    let first = session.take_block().unwrap();

    assert_eq!(session.ingest_line("CAPTURE:START"), CaptureEvent::CaptureStarted);
    assert_eq!(session.ingest_line("TRANSFER:START"), CaptureEvent::TransferStarted);
    assert_eq!(
        session.ingest_line("DATA:5000,1.7,1.8,0.1,0.0,0.0,9.8"),
        CaptureEvent::Sample
    );
    assert!(matches!(
        session.ingest_line("TRANSFER:END"),
        CaptureEvent::TransferEnded { received: 1, expected: None }
    ));
    let second = session.take_block().unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 1);
    assert_eq!(second.samples[0].timestamp_ms, 5000);
}
