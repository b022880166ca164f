//! # Error Types Module
//!
//! Centralized error handling for the sensor logbook.
//! One error type per concern, each carrying enough context (paths, line
//! numbers, device serials) to be useful in a log line or an error event.
//!
//! ## Error Types
//! - `ConfigError`: Configuration file I/O and parsing errors
//! - `DecodeError`: Malformed or structurally unexpected log records
//! - `ConvertError`: Log-to-CSV conversion failures (including cancellation)
//! - `WriterError`: Channel log writer failures during a recording session
//! - `StoreError`: Recording store listing/copy/removal failures
//! - `SensorError`: Sensor request failures reported by the access layer
//!
//! ## Usage Examples
//! ```ignore
//! // Config module uses ConfigError
//! pub fn load() -> Result<Config, ConfigError> { ... }
//!
//! // Converter returns ConvertError, wrapping DecodeError for the first record
//! pub fn convert_to_csv(...) -> Result<ConversionOutcome, ConvertError> { ... }
//! ```

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[source] io::Error),
    /// Failed to write config file
    #[error("Failed to write config file: {0}")]
    WriteFailed(#[source] io::Error),
    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[source] toml::de::Error),
    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
}

/// Errors produced while decoding or encoding a single log line
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Line was empty after stripping the separator
    #[error("Empty record line")]
    Empty,
    /// JSON did not match any known record shape
    #[error("Malformed record: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Line bytes are not UTF-8
    #[error("Record is not valid UTF-8: {0}")]
    NotUtf8(#[source] std::str::Utf8Error),
    /// Record could not be encoded back to JSON
    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors that can occur while converting a channel log to CSV
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Source log could not be opened or read
    #[error("Failed to read log {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Destination CSV could not be created or written
    #[error("Failed to write table {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Source log has zero bytes
    #[error("Log {0} is empty")]
    EmptySource(PathBuf),
    /// Log has no header line or no first data record
    #[error("Log {0} has no data records")]
    MissingRecord(PathBuf),
    /// First data record could not be decoded, so no column header is known
    #[error("First record of {path} is not decodable: {source}")]
    FirstRecord {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    /// Conversion was cancelled; rows written so far remain in `partial`
    #[error("Conversion cancelled, partial output kept at {partial}")]
    Cancelled { partial: PathBuf },
    /// Background conversion task panicked or was aborted
    #[error("Conversion task failed: {0}")]
    Task(String),
}

/// Errors reported by a channel writer during an active session
#[derive(Debug, Error)]
pub enum WriterError {
    /// Could not create the session directory or the log file
    #[error("Failed to open log for {channel}: {source}")]
    Open {
        channel: String,
        #[source]
        source: io::Error,
    },
    /// Appending a line failed
    #[error("Failed to append to log for {channel}: {source}")]
    Append {
        channel: String,
        #[source]
        source: io::Error,
    },
    /// Record could not be encoded
    #[error("Failed to encode record for {channel}: {source}")]
    Encode {
        channel: String,
        #[source]
        source: DecodeError,
    },
    /// Writer thread is gone
    #[error("Writer thread for {0} is not running")]
    Disconnected(String),
}

/// Errors that can occur in the local recording store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Recordings directory is missing or unreadable
    #[error("Unable to read records in {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Copying a record to the temporary directory failed
    #[error("Unable to stage {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Removing a record or temporary file failed
    #[error("Unable to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Record path has no file name component
    #[error("Record path {0} has no file name")]
    InvalidRecordPath(String),
}

/// Errors reported by the sensor access layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// Device is not currently reachable
    #[error("Device {0} is not connected")]
    NotConnected(String),
    /// Request reached the device but the operation failed
    #[error("Operation failed on {device}: {reason}")]
    Operation { device: String, reason: String },
    /// Response did not have the shape expected for the request
    #[error("Unexpected response from {device}: {detail}")]
    UnexpectedResponse { device: String, detail: String },
}
