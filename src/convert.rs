//! # Log-to-CSV Converter
//!
//! Streams a finished channel log into a CSV table, one row per sample,
//! without holding more than one line in memory.
//!
//! ## Key Types
//! - `Converter`: Runs one conversion, reporting progress on a `Notifier`
//! - `CancelFlag`: Cooperative cancellation, checked once per log line
//! - `ConversionOutcome`: Complete or truncated (undecodable line mid-stream)
//! - `ConversionJob`: A conversion running on the background pool
//!
//! ## Responsibilities
//! 1. Pick the column layout from the first data record
//! 2. Split each batch into rows with reconstructed per-sample timestamps
//! 3. Publish monotonic progress by byte offset
//!
//! ## Timestamp Reconstruction
//! A batch only carries the timestamp of its last sample. With `P` the end
//! timestamp of the previous batch and `T` that of the current one, sample
//! `i` of `K` gets `P + trunc((T - P) * i / K)`. The first batch only seeds
//! `P` and is never written, so every written sample lies between two real
//! batch timestamps. Counter wraparound is not corrected.

use crate::error::{ConvertError, DecodeError};
use crate::event::{Event, EventKind, Vector3};
use crate::notify::{Notifier, RecorderEvent};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Separator between inter-beat intervals inside the `rrData` column
const RR_SEPARATOR: char = ';';

/// Shared cancellation flag for one conversion
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Successful result of a conversion
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    /// Every line of the log was converted
    Complete(PathBuf),
    /// Stopped at an undecodable line; rows before it were kept
    Truncated {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

impl ConversionOutcome {
    pub fn path(&self) -> &Path {
        match self {
            ConversionOutcome::Complete(path) => path,
            ConversionOutcome::Truncated { path, .. } => path,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ConversionOutcome::Complete(_))
    }
}

/// CSV file written next to `source`
pub fn destination_for(source: &Path) -> PathBuf {
    source.with_extension("csv")
}

/// Timestamp of sample `index` out of `count` in a batch ending at `end`
pub fn sample_timestamp(previous: u32, end: u32, index: usize, count: usize) -> u32 {
    let span = f64::from(end) - f64::from(previous);
    (f64::from(previous) + span * index as f64 / count as f64) as u32
}

fn push_vector(row: &mut String, v: &Vector3) {
    let _ = write!(row, ",{},{},{}", v.x, v.y, v.z);
}

/// Render the CSV rows of one batch, given the previous batch end timestamp
fn batch_rows(event: &Event, previous: u32) -> Vec<String> {
    let count = event.sample_count();
    let timestamp = |i| sample_timestamp(previous, event.end_timestamp().unwrap_or(previous), i, count);

    match event {
        Event::Acc(d) => vector_rows(&d.vectors, timestamp),
        Event::Gyro(d) => vector_rows(&d.vectors, timestamp),
        Event::Magn(d) => vector_rows(&d.vectors, timestamp),
        Event::Ecg(d) => d
            .samples
            .iter()
            .enumerate()
            .map(|(i, sample)| format!("{},{}", timestamp(i), sample))
            .collect(),
        Event::Imu(d) => {
            if d.acc_vectors.len() != d.gyro_vectors.len() {
                log::warn!(
                    "Skipping IMU batch at {}: {} acc vs {} gyro samples",
                    d.timestamp,
                    d.acc_vectors.len(),
                    d.gyro_vectors.len()
                );
                return Vec::new();
            }
            d.acc_vectors
                .iter()
                .zip(&d.gyro_vectors)
                .enumerate()
                .map(|(i, (acc, gyro))| {
                    let mut row = timestamp(i).to_string();
                    push_vector(&mut row, acc);
                    push_vector(&mut row, gyro);
                    row
                })
                .collect()
        }
        Event::HeartRate(d) => {
            let rr: Vec<String> = d.rr_data.iter().map(|rr| rr.to_string()).collect();
            vec![format!("{},{}", d.average, rr.join(&RR_SEPARATOR.to_string()))]
        }
    }
}

fn vector_rows(vectors: &[Vector3], timestamp: impl Fn(usize) -> u32) -> Vec<String> {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let mut row = timestamp(i).to_string();
            push_vector(&mut row, v);
            row
        })
        .collect()
}

/// Per-invocation conversion state
struct ConversionJobState {
    source: PathBuf,
    destination: PathBuf,
    target: String,
    reader: BufReader<File>,
    writer: BufWriter<File>,
    total_bytes: u64,
    consumed_bytes: u64,
    reported_percent: u8,
    /// End timestamp of the previous batch; `None` until the first one is read
    previous: Option<u32>,
    line_number: u64,
}

enum LoopEnd {
    Eof,
    Cancelled,
    Undecodable { line: u64, reason: String },
}

impl ConversionJobState {
    fn source_err(&self, source: std::io::Error) -> ConvertError {
        ConvertError::Source {
            path: self.source.clone(),
            source,
        }
    }

    fn destination_err(&self, source: std::io::Error) -> ConvertError {
        ConvertError::Destination {
            path: self.destination.clone(),
            source,
        }
    }

    fn write_row(&mut self, row: &str) -> Result<(), ConvertError> {
        writeln!(self.writer, "{}", row).map_err(|e| self.destination_err(e))
    }

    fn publish_progress(&mut self, notifier: &Notifier) {
        let percent = (100 * self.consumed_bytes / self.total_bytes).min(100) as u8;
        if percent > self.reported_percent {
            self.reported_percent = percent;
            notifier.publish(RecorderEvent::Converting {
                target: self.target.clone(),
                percent,
            });
        }
    }

    fn run_loop(&mut self, notifier: &Notifier, cancel: &CancelFlag) -> Result<LoopEnd, ConvertError> {
        let mut buf = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Ok(LoopEnd::Cancelled);
            }

            buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| self.source_err(e))?;
            if read == 0 {
                return Ok(LoopEnd::Eof);
            }
            self.consumed_bytes += read as u64;
            self.line_number += 1;

            let event = match std::str::from_utf8(&buf)
                .map_err(DecodeError::NotUtf8)
                .and_then(Event::decode_line)
            {
                Ok(event) => event,
                Err(e) => {
                    return Ok(LoopEnd::Undecodable {
                        line: self.line_number,
                        reason: e.to_string(),
                    })
                }
            };

            if let Some(previous) = self.previous {
                for row in batch_rows(&event, previous) {
                    self.write_row(&row)?;
                }
            }

            let previous = self.previous.unwrap_or(0);
            self.previous = Some(event.end_timestamp().unwrap_or(previous));

            self.publish_progress(notifier);
        }
    }
}

/// Converts finished channel logs to CSV
pub struct Converter {
    notifier: Notifier,
    cancel: CancelFlag,
}

impl Converter {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            notifier,
            cancel: CancelFlag::new(),
        }
    }

    /// Use an externally owned cancellation flag
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Convert `source` into `<source>.csv`.
    ///
    /// Failures before the first row (unreadable or empty log, undecodable
    /// first record) and I/O failures are also published as `Error` events.
    /// Cancellation is not an error event; the partial table is kept.
    pub fn convert(&self, source: &Path) -> Result<ConversionOutcome, ConvertError> {
        let result = self.run(source);
        match &result {
            Ok(ConversionOutcome::Complete(path)) => {
                log::info!("Converted {} to {}", source.display(), path.display());
            }
            Ok(ConversionOutcome::Truncated { line, reason, .. }) => {
                log::warn!(
                    "Conversion of {} stopped at line {}: {}",
                    source.display(),
                    line,
                    reason
                );
            }
            Err(ConvertError::Cancelled { partial }) => {
                log::info!("Conversion cancelled, kept {}", partial.display());
            }
            Err(e) => {
                log::error!("Conversion of {} failed: {}", source.display(), e);
                self.notifier.publish(RecorderEvent::Error(e.to_string()));
            }
        }
        result
    }

    fn run(&self, source: &Path) -> Result<ConversionOutcome, ConvertError> {
        let source_err = |source_error| ConvertError::Source {
            path: source.to_path_buf(),
            source: source_error,
        };

        let file = File::open(source).map_err(source_err)?;
        let total_bytes = file.metadata().map_err(source_err)?.len();
        if total_bytes == 0 {
            return Err(ConvertError::EmptySource(source.to_path_buf()));
        }
        let mut reader = BufReader::new(file);

        // Line 1 is the recording header; line 2 decides the table layout
        let mut line = Vec::new();
        let header_len = reader.read_until(b'\n', &mut line).map_err(source_err)?;
        line.clear();
        let first_len = reader.read_until(b'\n', &mut line).map_err(source_err)?;
        if header_len == 0 || first_len == 0 {
            return Err(ConvertError::MissingRecord(source.to_path_buf()));
        }

        let kind: EventKind = std::str::from_utf8(&line)
            .map_err(DecodeError::NotUtf8)
            .and_then(Event::decode_line)
            .map_err(|e| ConvertError::FirstRecord {
                path: source.to_path_buf(),
                source: e,
            })?
            .kind();

        // The loop reads line 2 again to seed the reference timestamp
        let second_line_offset = header_len as u64;
        reader
            .seek(SeekFrom::Start(second_line_offset))
            .map_err(source_err)?;

        let destination = destination_for(source);
        let output = File::create(&destination).map_err(|e| ConvertError::Destination {
            path: destination.clone(),
            source: e,
        })?;
        let target = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut job = ConversionJobState {
            source: source.to_path_buf(),
            destination,
            target,
            reader,
            writer: BufWriter::new(output),
            total_bytes,
            consumed_bytes: second_line_offset,
            reported_percent: 0,
            previous: None,
            line_number: 1,
        };

        log::debug!("Converting {} ({:?}, {} bytes)", source.display(), kind, total_bytes);
        job.write_row(kind.csv_header())?;

        let end = job.run_loop(&self.notifier, &self.cancel)?;
        job.writer.flush().map_err(|e| job.destination_err(e))?;

        match end {
            LoopEnd::Eof => Ok(ConversionOutcome::Complete(job.destination)),
            LoopEnd::Cancelled => Err(ConvertError::Cancelled {
                partial: job.destination,
            }),
            LoopEnd::Undecodable { line, reason } => Ok(ConversionOutcome::Truncated {
                path: job.destination,
                line,
                reason,
            }),
        }
    }
}

/// A conversion running as one cancellable unit on the background pool
pub struct ConversionJob {
    cancel: CancelFlag,
    handle: JoinHandle<Result<ConversionOutcome, ConvertError>>,
}

impl ConversionJob {
    pub fn spawn(runtime: &Handle, converter: Converter, source: PathBuf) -> Self {
        let cancel = converter.cancel_flag();
        let handle = runtime.spawn_blocking(move || converter.convert(&source));
        Self { cancel, handle }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<ConversionOutcome, ConvertError> {
        self.handle
            .await
            .map_err(|e| ConvertError::Task(e.to_string()))?
    }
}
