//! # Sensor Event Model
//!
//! Batched sensor readings as they are appended to a channel log, one JSON
//! object per line. Every batch except heart rate carries the device-relative
//! timestamp (milliseconds) of its *last* sample only; per-sample times are
//! reconstructed later by the converter.
//!
//! ## Line Format
//! ```text
//! {"acc":{"Timestamp":100,"ArrayAcc":[{"x":0.1,"y":0.2,"z":9.8}]}},
//! {"heartRate":{"average":61.5,"rrData":[980,1002]}},
//! ```
//! The trailing comma separator is optional and stripped before decoding.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Separator appended after each encoded record by the channel writer
pub const RECORD_SEPARATOR: char = ',';

/// One 3-axis reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccData {
    #[serde(rename = "Timestamp")]
    pub timestamp: u32,
    #[serde(rename = "ArrayAcc")]
    pub vectors: Vec<Vector3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GyroData {
    #[serde(rename = "Timestamp")]
    pub timestamp: u32,
    #[serde(rename = "ArrayGyro")]
    pub vectors: Vec<Vector3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnData {
    #[serde(rename = "Timestamp")]
    pub timestamp: u32,
    #[serde(rename = "ArrayMagn")]
    pub vectors: Vec<Vector3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcgData {
    #[serde(rename = "Timestamp")]
    pub timestamp: u32,
    #[serde(rename = "Samples")]
    pub samples: Vec<i32>,
}

/// Combined accelerometer + gyroscope batch; both arrays share one timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuData {
    #[serde(rename = "Timestamp")]
    pub timestamp: u32,
    #[serde(rename = "ArrayAcc")]
    pub acc_vectors: Vec<Vector3>,
    #[serde(rename = "ArrayGyro")]
    pub gyro_vectors: Vec<Vector3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateData {
    pub average: f64,
    #[serde(rename = "rrData", default)]
    pub rr_data: Vec<u32>,
}

/// A single decoded log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    Acc(AccData),
    Gyro(GyroData),
    Magn(MagnData),
    Ecg(EcgData),
    Imu(ImuData),
    HeartRate(HeartRateData),
}

/// Record variant without payload, used to pick the CSV layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Acc,
    Gyro,
    Magn,
    Ecg,
    Imu,
    HeartRate,
}

impl EventKind {
    /// Fixed column header for tables converted from this kind of log
    pub fn csv_header(&self) -> &'static str {
        match self {
            EventKind::Acc | EventKind::Gyro | EventKind::Magn => "timestamp,x,y,z",
            EventKind::Ecg => "timestamp,sample",
            EventKind::Imu => "timestamp,x,y,z,gx,gy,gz",
            EventKind::HeartRate => "average,rrData",
        }
    }
}

/// Strip the line ending and one trailing record separator, if present
pub fn strip_separator(line: &str) -> &str {
    let line = line.trim_end_matches(['\n', '\r']);
    line.strip_suffix(RECORD_SEPARATOR).unwrap_or(line)
}

impl Event {
    /// Decode one log line (line ending and separator are tolerated)
    pub fn decode_line(line: &str) -> Result<Event, DecodeError> {
        let body = strip_separator(line);
        if body.trim().is_empty() {
            return Err(DecodeError::Empty);
        }
        serde_json::from_str(body).map_err(DecodeError::Malformed)
    }

    /// Encode as a log line body: JSON followed by the record separator
    pub fn encode_line(&self) -> Result<String, DecodeError> {
        let mut line = serde_json::to_string(self).map_err(DecodeError::Encode)?;
        line.push(RECORD_SEPARATOR);
        Ok(line)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Acc(_) => EventKind::Acc,
            Event::Gyro(_) => EventKind::Gyro,
            Event::Magn(_) => EventKind::Magn,
            Event::Ecg(_) => EventKind::Ecg,
            Event::Imu(_) => EventKind::Imu,
            Event::HeartRate(_) => EventKind::HeartRate,
        }
    }

    /// Timestamp of the last sample in the batch; heart rate has none
    pub fn end_timestamp(&self) -> Option<u32> {
        match self {
            Event::Acc(d) => Some(d.timestamp),
            Event::Gyro(d) => Some(d.timestamp),
            Event::Magn(d) => Some(d.timestamp),
            Event::Ecg(d) => Some(d.timestamp),
            Event::Imu(d) => Some(d.timestamp),
            Event::HeartRate(_) => None,
        }
    }

    /// Number of samples in the primary sequence
    pub fn sample_count(&self) -> usize {
        match self {
            Event::Acc(d) => d.vectors.len(),
            Event::Gyro(d) => d.vectors.len(),
            Event::Magn(d) => d.vectors.len(),
            Event::Ecg(d) => d.samples.len(),
            Event::Imu(d) => d.acc_vectors.len(),
            Event::HeartRate(_) => 1,
        }
    }
}
