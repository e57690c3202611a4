//! Binary capture blob decoding.
//!
//! Current layout (little-endian, 28-byte header):
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     Magic ("ECGD" = 0x45434744)
//! 4       2     Format version
//! 6       2     Device id
//! 8       4     Session id
//! 12      4     Capture start (epoch seconds)
//! 16      2     Declared ECG sample rate
//! 18      2     Declared accelerometer sample rate
//! 20      4     ECG sample count
//! 24      4     Accelerometer sample count
//! 28      N     ECG samples, 3 x i16 (leads I, II, III)
//! ..      M     Accelerometer samples, 3 x i16 (x, y, z)
//! ```
//!
//! Blobs tagged "DATA" come from the earlier firmware: a 32-byte header
//! without the accelerometer count, f32 millivolt ECG samples and 6-axis
//! IMU records whose length is inferred from what is left of the buffer.
//!
//! A wrong magic tag is only a warning. A buffer that cannot hold the
//! regions its header declares is an error.
use std::io::{Cursor, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use ndarray::{Array2, ArrayView2};
use serde::Serialize;

use crate::config::DeviceProfile;
use crate::signal::HolterError;

pub const HEADER_SIZE: usize = 28;
pub const ECG_SAMPLE_STRIDE: usize = 3 * 2;
pub const ACCEL_SAMPLE_STRIDE: usize = 3 * 2;

/// "DATA", written by the first firmware generation.
pub const LEGACY_MAGIC: u32 = 0x4441_5441;
pub const LEGACY_HEADER_SIZE: usize = 28;
const LEGACY_ECG_STRIDE: usize = 3 * 4;
const LEGACY_IMU_STRIDE: usize = 6 * 2;
const LEGACY_ACCEL_COUNTS_PER_G: f64 = 2048.0;

pub const LEAD_NAMES: [&str; 3] = ["I", "II", "III"];
pub const AXIS_NAMES: [&str; 3] = ["x", "y", "z"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub device_id: u16,
    pub session_id: u32,
    pub start_time: u32,
    pub ecg_rate_hz: u16,
    pub accel_rate_hz: u16,
    pub ecg_samples: u32,
    pub accel_samples: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLayout {
    Current,
    Legacy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameWarning {
    MagicMismatch { expected: u32, found: u32 },
    LegacyLayout,
    /// The header declared accelerometer samples but none follow the ECG.
    AccelerometerMissing { declared: u32 },
}

impl std::fmt::Display for FrameWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameWarning::MagicMismatch { expected, found } => {
                write!(f, "magic tag {found:#010x} does not match {expected:#010x}")
            }
            FrameWarning::LegacyLayout => write!(f, "decoded with the legacy DATA layout"),
            FrameWarning::AccelerometerMissing { declared } => write!(
                f,
                "header declares {declared} accelerometer samples but the region is empty"
            ),
        }
    }
}

/// Decoded blob: ECG in millivolts (samples x leads), accelerometer in g
/// (samples x axes). The accelerometer matrix may have zero rows.
#[derive(Clone, Debug)]
pub struct ParsedFrame {
    pub header: FrameHeader,
    pub layout: FrameLayout,
    pub ecg: Array2<f64>,
    pub accel: Array2<f64>,
    pub warnings: Vec<FrameWarning>,
}

pub struct FrameParser {
    device: DeviceProfile,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}

impl FrameParser {
    pub fn new(device: DeviceProfile) -> Self {
        Self { device }
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<ParsedFrame, HolterError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HolterError::HeaderTooShort {
                needed: HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let magic = LittleEndian::read_u32(&bytes[..4]);
        if magic == LEGACY_MAGIC && magic != self.device.expected_magic {
            return self.parse_legacy(bytes);
        }
        self.parse_current(bytes)
    }

    fn parse_current(&self, bytes: &[u8]) -> Result<ParsedFrame, HolterError> {
        let mut cursor = Cursor::new(bytes);
        let header = FrameHeader {
            magic: cursor.read_u32::<LittleEndian>()?,
            version: cursor.read_u16::<LittleEndian>()?,
            device_id: cursor.read_u16::<LittleEndian>()?,
            session_id: cursor.read_u32::<LittleEndian>()?,
            start_time: cursor.read_u32::<LittleEndian>()?,
            ecg_rate_hz: cursor.read_u16::<LittleEndian>()?,
            accel_rate_hz: cursor.read_u16::<LittleEndian>()?,
            ecg_samples: cursor.read_u32::<LittleEndian>()?,
            accel_samples: cursor.read_u32::<LittleEndian>()?,
        };
        let mut warnings = Vec::new();
        self.check_magic(header.magic, &mut warnings);

        let ecg_count = header.ecg_samples as usize;
        let ecg_end = region_end(HEADER_SIZE, ecg_count, ECG_SAMPLE_STRIDE);
        if bytes.len() < ecg_end {
            return Err(HolterError::TruncatedPayload {
                region: "ecg",
                needed: ecg_end,
                got: bytes.len(),
            });
        }
        let mut ecg = Array2::zeros((ecg_count, 3));
        for (row, chunk) in bytes[HEADER_SIZE..ecg_end]
            .chunks_exact(ECG_SAMPLE_STRIDE)
            .enumerate()
        {
            for lead in 0..3 {
                let counts = LittleEndian::read_i16(&chunk[lead * 2..lead * 2 + 2]);
                ecg[[row, lead]] = f64::from(counts) / self.device.ecg_scale;
            }
        }

        let accel_count = header.accel_samples as usize;
        let available = bytes.len() - ecg_end;
        let accel = if accel_count == 0 {
            Array2::zeros((0, 3))
        } else if available == 0 {
            warnings.push(FrameWarning::AccelerometerMissing {
                declared: header.accel_samples,
            });
            Array2::zeros((0, 3))
        } else {
            let accel_end = region_end(ecg_end, accel_count, ACCEL_SAMPLE_STRIDE);
            if bytes.len() < accel_end {
                return Err(HolterError::TruncatedPayload {
                    region: "accelerometer",
                    needed: accel_end,
                    got: bytes.len(),
                });
            }
            let mut accel = Array2::zeros((accel_count, 3));
            for (row, chunk) in bytes[ecg_end..accel_end]
                .chunks_exact(ACCEL_SAMPLE_STRIDE)
                .enumerate()
            {
                for axis in 0..3 {
                    let counts = LittleEndian::read_i16(&chunk[axis * 2..axis * 2 + 2]);
                    accel[[row, axis]] = f64::from(counts) * self.device.accel_scale;
                }
            }
            accel
        };
        debug!(
            "parsed frame: device {} session {} ecg {}x3 @ {} Hz, accel {}x3 @ {} Hz",
            header.device_id,
            header.session_id,
            ecg.nrows(),
            header.ecg_rate_hz,
            accel.nrows(),
            header.accel_rate_hz
        );
        Ok(ParsedFrame {
            header,
            layout: FrameLayout::Current,
            ecg,
            accel,
            warnings,
        })
    }

    fn parse_legacy(&self, bytes: &[u8]) -> Result<ParsedFrame, HolterError> {
        if bytes.len() < LEGACY_HEADER_SIZE {
            return Err(HolterError::HeaderTooShort {
                needed: LEGACY_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        let version = cursor.read_u16::<LittleEndian>()?;
        let device_id = cursor.read_u16::<LittleEndian>()?;
        let session_id = cursor.read_u32::<LittleEndian>()?;
        let start_time = cursor.read_u32::<LittleEndian>()?;
        let ecg_rate_hz = cursor.read_u16::<LittleEndian>()?;
        let accel_rate_hz = cursor.read_u16::<LittleEndian>()?;
        let ecg_samples = cursor.read_u32::<LittleEndian>()?;

        let ecg_count = ecg_samples as usize;
        let ecg_end = region_end(LEGACY_HEADER_SIZE, ecg_count, LEGACY_ECG_STRIDE);
        if bytes.len() < ecg_end {
            return Err(HolterError::TruncatedPayload {
                region: "ecg",
                needed: ecg_end,
                got: bytes.len(),
            });
        }
        let mut ecg = Array2::zeros((ecg_count, 3));
        for (row, chunk) in bytes[LEGACY_HEADER_SIZE..ecg_end]
            .chunks_exact(LEGACY_ECG_STRIDE)
            .enumerate()
        {
            for lead in 0..3 {
                ecg[[row, lead]] = f64::from(LittleEndian::read_f32(&chunk[lead * 4..lead * 4 + 4]));
            }
        }

        // Only the accelerometer half of each IMU record is used.
        let imu_records = bytes[ecg_end..].chunks_exact(LEGACY_IMU_STRIDE);
        let mut accel = Array2::zeros((imu_records.len(), 3));
        for (row, chunk) in imu_records.enumerate() {
            for axis in 0..3 {
                let counts = LittleEndian::read_i16(&chunk[axis * 2..axis * 2 + 2]);
                accel[[row, axis]] = f64::from(counts) / LEGACY_ACCEL_COUNTS_PER_G;
            }
        }
        warn!("blob tagged {magic:#010x} decoded with the legacy layout");
        let header = FrameHeader {
            magic,
            version,
            device_id,
            session_id,
            start_time,
            ecg_rate_hz,
            accel_rate_hz,
            ecg_samples,
            accel_samples: accel.nrows() as u32,
        };
        Ok(ParsedFrame {
            header,
            layout: FrameLayout::Legacy,
            ecg,
            accel,
            warnings: vec![FrameWarning::LegacyLayout],
        })
    }

    fn check_magic(&self, found: u32, warnings: &mut Vec<FrameWarning>) {
        let expected = self.device.expected_magic;
        if found != expected {
            warn!("magic tag {found:#010x} (expected {expected:#010x}); parsing anyway");
            warnings.push(FrameWarning::MagicMismatch { expected, found });
        }
    }
}

fn region_end(start: usize, count: usize, stride: usize) -> usize {
    count
        .checked_mul(stride)
        .and_then(|len| len.checked_add(start))
        .unwrap_or(usize::MAX)
}

/// Writes `ecg` (mV) and `accel` (g) in the current layout. The sample
/// counts in the written header always match the matrices.
pub fn encode_frame(
    header: &FrameHeader,
    ecg: ArrayView2<f64>,
    accel: ArrayView2<f64>,
    device: &DeviceProfile,
) -> Result<Vec<u8>, HolterError> {
    let mut out = Vec::with_capacity(
        HEADER_SIZE + ecg.nrows() * ECG_SAMPLE_STRIDE + accel.nrows() * ACCEL_SAMPLE_STRIDE,
    );
    out.write_u32::<LittleEndian>(header.magic)?;
    out.write_u16::<LittleEndian>(header.version)?;
    out.write_u16::<LittleEndian>(header.device_id)?;
    out.write_u32::<LittleEndian>(header.session_id)?;
    out.write_u32::<LittleEndian>(header.start_time)?;
    out.write_u16::<LittleEndian>(header.ecg_rate_hz)?;
    out.write_u16::<LittleEndian>(header.accel_rate_hz)?;
    out.write_u32::<LittleEndian>(ecg.nrows() as u32)?;
    out.write_u32::<LittleEndian>(accel.nrows() as u32)?;
    for row in ecg.rows() {
        for lead in 0..3 {
            let value = row.get(lead).copied().unwrap_or(0.0);
            out.write_i16::<LittleEndian>(quantize(value * device.ecg_scale))?;
        }
    }
    for row in accel.rows() {
        for axis in 0..3 {
            let value = row.get(axis).copied().unwrap_or(0.0);
            out.write_i16::<LittleEndian>(quantize(value / device.accel_scale))?;
        }
    }
    out.flush()?;
    Ok(out)
}

fn quantize(counts: f64) -> i16 {
    if counts.is_nan() {
        return 0;
    }
    counts.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ECGD_MAGIC;

    fn header(ecg_samples: u32, accel_samples: u32) -> FrameHeader {
        FrameHeader {
            magic: ECGD_MAGIC,
            version: 2,
            device_id: 7,
            session_id: 1_700_000_123,
            start_time: 1_700_000_000,
            ecg_rate_hz: 250,
            accel_rate_hz: 50,
            ecg_samples,
            accel_samples,
        }
    }

    fn blob(ecg_rows: usize, accel_rows: usize) -> Vec<u8> {
        let ecg = Array2::from_shape_fn((ecg_rows, 3), |(i, lead)| {
            (i as f64 * 0.01) - lead as f64 * 0.5
        });
        let accel = Array2::from_shape_fn((accel_rows, 3), |(_, axis)| {
            if axis == 2 {
                1.0
            } else {
                0.0
            }
        });
        encode_frame(
            &header(ecg_rows as u32, accel_rows as u32),
            ecg.view(),
            accel.view(),
            &DeviceProfile::default(),
        )
        .unwrap()
    }

    #[test]
    fn parses_declared_counts_and_scales() {
        let bytes = blob(120, 24);
        let frame = FrameParser::default().parse(&bytes).unwrap();
        assert_eq!(frame.header.device_id, 7);
        assert_eq!(frame.header.ecg_samples, 120);
        assert_eq!(frame.ecg.dim(), (120, 3));
        assert_eq!(frame.accel.dim(), (24, 3));
        assert!(frame.warnings.is_empty());
        assert!((frame.ecg[[100, 0]] - 1.0).abs() < 1e-3);
        assert!((frame.ecg[[0, 2]] + 1.0).abs() < 1e-3);
        assert!((frame.accel[[5, 2]] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn short_header_is_structural() {
        let err = FrameParser::default().parse(&[0u8; 27]).unwrap_err();
        assert!(matches!(err, HolterError::HeaderTooShort { needed: 28, got: 27 }));
        assert!(err.is_structural());
    }

    #[test]
    fn truncated_ecg_region_is_structural() {
        let mut bytes = blob(50, 0);
        bytes.truncate(bytes.len() - 1);
        let err = FrameParser::default().parse(&bytes).unwrap_err();
        assert!(matches!(err, HolterError::TruncatedPayload { region: "ecg", .. }));
    }

    #[test]
    fn huge_declared_count_does_not_overflow() {
        let mut bytes = blob(0, 0);
        bytes[20..24].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = FrameParser::default().parse(&bytes).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn wrong_magic_only_warns() {
        let mut bytes = blob(10, 0);
        bytes[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let frame = FrameParser::default().parse(&bytes).unwrap();
        assert_eq!(frame.ecg.nrows(), 10);
        assert_eq!(
            frame.warnings,
            vec![FrameWarning::MagicMismatch {
                expected: ECGD_MAGIC,
                found: 0xDEAD_BEEF
            }]
        );
    }

    #[test]
    fn missing_accelerometer_region_is_empty_not_fatal() {
        let mut bytes = blob(10, 0);
        bytes[24..28].copy_from_slice(&40u32.to_le_bytes());
        let frame = FrameParser::default().parse(&bytes).unwrap();
        assert_eq!(frame.accel.nrows(), 0);
        assert_eq!(
            frame.warnings,
            vec![FrameWarning::AccelerometerMissing { declared: 40 }]
        );
    }

    #[test]
    fn partial_accelerometer_region_is_structural() {
        let mut bytes = blob(10, 8);
        bytes.truncate(bytes.len() - 3);
        let err = FrameParser::default().parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            HolterError::TruncatedPayload {
                region: "accelerometer",
                ..
            }
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = blob(10, 4);
        bytes.extend_from_slice(&[0xAB; 17]);
        let frame = FrameParser::default().parse(&bytes).unwrap();
        assert_eq!(frame.ecg.nrows(), 10);
        assert_eq!(frame.accel.nrows(), 4);
    }

    #[test]
    fn legacy_layout_is_dispatched_by_magic() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(LEGACY_MAGIC).unwrap();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u16::<LittleEndian>(3).unwrap();
        bytes.write_u32::<LittleEndian>(42).unwrap();
        bytes.write_u32::<LittleEndian>(1_600_000_000).unwrap();
        bytes.write_u16::<LittleEndian>(100).unwrap();
        bytes.write_u16::<LittleEndian>(100).unwrap();
        bytes.write_u32::<LittleEndian>(2).unwrap();
        bytes.extend_from_slice(b"\0\0\0\0");
        for value in [0.5f32, -0.25, 1.0, 0.0, 0.0, 0.0] {
            bytes.write_f32::<LittleEndian>(value).unwrap();
        }
        for value in [0i16, 0, 2048, 11, 12, 13, 1024, 0, 2048, 0, 0, 0] {
            bytes.write_i16::<LittleEndian>(value).unwrap();
        }
        bytes.push(0xFF);

        let frame = FrameParser::default().parse(&bytes).unwrap();
        assert_eq!(frame.layout, FrameLayout::Legacy);
        assert_eq!(frame.warnings, vec![FrameWarning::LegacyLayout]);
        assert_eq!(frame.ecg.dim(), (2, 3));
        assert_eq!(frame.ecg[[0, 1]], -0.25);
        assert_eq!(frame.header.accel_samples, 2);
        assert_eq!(frame.accel[[0, 2]], 1.0);
        assert_eq!(frame.accel[[1, 0]], 0.5);
    }

    #[test]
    fn legacy_ecg_starts_right_after_the_header() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(LEGACY_MAGIC).unwrap();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u16::<LittleEndian>(7).unwrap();
        bytes.write_u32::<LittleEndian>(9).unwrap();
        bytes.write_u32::<LittleEndian>(1_600_000_000).unwrap();
        bytes.write_u16::<LittleEndian>(250).unwrap();
        bytes.write_u16::<LittleEndian>(50).unwrap();
        bytes.write_u32::<LittleEndian>(3).unwrap();
        bytes.extend_from_slice(b"rsvd");
        assert_eq!(bytes.len(), LEGACY_HEADER_SIZE);
        for value in 1..=9 {
            bytes.write_f32::<LittleEndian>(value as f32).unwrap();
        }
        for _ in 0..3 {
            for value in [0i16, 0, 2048, 1, 2, 3] {
                bytes.write_i16::<LittleEndian>(value).unwrap();
            }
        }

        let frame = FrameParser::default().parse(&bytes).unwrap();
        assert_eq!(frame.header.device_id, 7);
        assert_eq!(frame.header.ecg_samples, 3);
        let rows: Vec<Vec<f64>> = frame.ecg.rows().into_iter().map(|r| r.to_vec()).collect();
        assert_eq!(
            rows,
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0, 9.0]]
        );
        assert_eq!(frame.header.accel_samples, 3);
        assert_eq!(frame.accel.nrows(), 3);
        assert!(frame.accel.column(2).iter().all(|&g| g == 1.0));
    }
}
