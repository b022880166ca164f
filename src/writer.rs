//! # Channel Log Writer
//!
//! Appends one channel's sensor batches to a line-oriented JSON log while a
//! recording session is active.
//!
//! ## Architecture
//! - **ChannelWriter**: What the session manager drives (start / append / stop)
//! - **JsonChannelWriter**: Default writer; owns a background thread
//! - **Writer Thread**: Performs all file I/O, fed by a crossbeam command channel
//! - **FaultReporter**: Route back to the session for write failures
//!
//! ## File Layout
//! ```text
//! <storage_root>/recordings/
//! └── 20261016_101500_123/           (session start, UTC)
//!     ├── 174630000192_acc.jsonl     line 1: RecordFile JSON, then one Event per line
//!     └── 174630000192_acc.header    RecordFile JSON sidecar, used for listing
//! ```
//!
//! A write failure is reported once through the session's `FaultReporter`,
//! after which the writer drops appends until the next `start`.

use crate::error::WriterError;
use crate::event::Event;
use crate::session::DeviceOperationKey;
use crate::store::{RecordFile, HEADER_SUFFIX, LOG_SUFFIX, RECORDINGS_DIR};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;

/// Receives write faults raised by channel writers
pub trait FaultSink: Send + Sync {
    fn channel_fault(&self, key: &DeviceOperationKey, error: WriterError);
}

/// Cloneable handle a writer uses to report faults to its session.
///
/// Holds the session weakly; reports after the session is gone are logged
/// and dropped.
#[derive(Clone)]
pub struct FaultReporter {
    sink: Weak<dyn FaultSink>,
}

impl FaultReporter {
    pub fn new(sink: Weak<dyn FaultSink>) -> Self {
        Self { sink }
    }

    pub fn report(&self, key: &DeviceOperationKey, error: WriterError) {
        match self.sink.upgrade() {
            Some(sink) => sink.channel_fault(key, error),
            None => log::warn!("Fault on {} after session ended: {}", key, error),
        }
    }
}

/// One channel's log writer, as driven by the session manager
pub trait ChannelWriter: Send + Sync {
    fn key(&self) -> &DeviceOperationKey;

    /// Begin a new log using `origin` as the session start time
    fn start(&self, origin: DateTime<Utc>, faults: FaultReporter);

    /// Queue one batch for appending
    fn append(&self, event: &Event) -> Result<(), WriterError>;

    /// Finalize and close the log of session `origin`; returns once closed
    fn stop(&self, origin: DateTime<Utc>);
}

/// Builds writers for channels added to a session
pub trait ChannelWriterFactory: Send + Sync {
    fn create(&self, key: DeviceOperationKey) -> Arc<dyn ChannelWriter>;
}

/// Directory name for a session started at `origin`
pub fn session_dir_name(origin: DateTime<Utc>) -> String {
    origin.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// Command sent to the writer thread
enum WriterCommand {
    Start {
        origin: DateTime<Utc>,
        faults: FaultReporter,
    },
    Append(Event),
    Stop {
        origin: DateTime<Utc>,
        done: Sender<()>,
    },
    Shutdown,
}

/// State owned by the writer thread
struct ChannelLog {
    key: DeviceOperationKey,
    storage_root: PathBuf,
    file: Option<BufWriter<File>>,
    origin: Option<DateTime<Utc>>,
    faults: Option<FaultReporter>,
}

impl ChannelLog {
    fn new(key: DeviceOperationKey, storage_root: PathBuf) -> Self {
        Self {
            key,
            storage_root,
            file: None,
            origin: None,
            faults: None,
        }
    }

    fn open(&mut self, origin: DateTime<Utc>) -> Result<(), WriterError> {
        let channel = self.key.to_string();
        let relative_dir = Path::new(RECORDINGS_DIR).join(session_dir_name(origin));
        let dir = self.storage_root.join(&relative_dir);
        fs::create_dir_all(&dir).map_err(|source| WriterError::Open {
            channel: channel.clone(),
            source,
        })?;

        let stem = self.key.file_stem();
        let log_name = format!("{}{}", stem, LOG_SUFFIX);
        let record = RecordFile {
            serial_number: self.key.device_id.clone(),
            operation: self.key.operation,
            start_date: origin,
            file_path: relative_dir.join(&log_name),
        };
        let header = serde_json::to_string(&record).map_err(|e| WriterError::Encode {
            channel: channel.clone(),
            source: crate::error::DecodeError::Encode(e),
        })?;

        let open_err = |source| WriterError::Open {
            channel: channel.clone(),
            source,
        };
        fs::write(dir.join(format!("{}{}", stem, HEADER_SUFFIX)), &header).map_err(open_err)?;

        let mut file = BufWriter::new(File::create(dir.join(&log_name)).map_err(open_err)?);
        writeln!(file, "{}", header).map_err(open_err)?;

        log::info!("Recording {} to {}", self.key, dir.join(&log_name).display());
        self.file = Some(file);
        self.origin = Some(origin);
        Ok(())
    }

    fn append(&mut self, event: &Event) -> Result<(), WriterError> {
        let Some(file) = self.file.as_mut() else {
            log::trace!("Dropping {:?} batch for idle channel {}", event.kind(), self.key);
            return Ok(());
        };
        let line = event.encode_line().map_err(|source| WriterError::Encode {
            channel: self.key.to_string(),
            source,
        })?;
        writeln!(file, "{}", line).map_err(|source| WriterError::Append {
            channel: self.key.to_string(),
            source,
        })
    }

    fn close(&mut self) -> Result<(), WriterError> {
        self.origin = None;
        match self.file.take() {
            Some(mut file) => file.flush().map_err(|source| WriterError::Append {
                channel: self.key.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// Report a fault and go inert until the next start
    fn fail(&mut self, error: WriterError) {
        log::error!("Channel {} failed: {}", self.key, error);
        self.file = None;
        self.origin = None;
        if let Some(faults) = self.faults.take() {
            faults.report(&self.key, error);
        }
    }
}

/// JSON-lines writer backed by a dedicated thread
pub struct JsonChannelWriter {
    key: DeviceOperationKey,
    command_tx: Sender<WriterCommand>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl JsonChannelWriter {
    pub fn new(key: DeviceOperationKey, storage_root: impl Into<PathBuf>) -> Self {
        let (command_tx, command_rx) = unbounded();
        let log = ChannelLog::new(key.clone(), storage_root.into());

        let writer_thread = thread::spawn(move || {
            Self::writer_loop(command_rx, log);
        });

        Self {
            key,
            command_tx,
            writer_thread: Some(writer_thread),
        }
    }

    /// Writer thread loop
    ///
    /// Processes commands in arrival order and performs all file I/O.
    fn writer_loop(command_rx: Receiver<WriterCommand>, mut log: ChannelLog) {
        loop {
            match command_rx.recv() {
                Ok(WriterCommand::Start { origin, faults }) => {
                    if let Err(e) = log.close() {
                        log::warn!("Closing previous log of {} failed: {}", log.key, e);
                    }
                    log.faults = Some(faults);
                    if let Err(e) = log.open(origin) {
                        log.fail(e);
                    }
                }
                Ok(WriterCommand::Append(event)) => {
                    if let Err(e) = log.append(&event) {
                        log.fail(e);
                    }
                }
                Ok(WriterCommand::Stop { origin, done }) => {
                    if log.origin.is_some_and(|started| started != origin) {
                        log::warn!("Stopping {} with a different session origin", log.key);
                    }
                    if let Err(e) = log.close() {
                        log.fail(e);
                    }
                    log.faults = None;
                    let _ = done.send(());
                }
                Ok(WriterCommand::Shutdown) => {
                    if let Err(e) = log.close() {
                        log::error!("Failed to flush {} on shutdown: {}", log.key, e);
                    }
                    log::debug!("Writer thread for {} stopped", log.key);
                    break;
                }
                Err(_) => {
                    log::debug!("Writer thread for {}: command channel closed", log.key);
                    break;
                }
            }
        }
    }
}

impl ChannelWriter for JsonChannelWriter {
    fn key(&self) -> &DeviceOperationKey {
        &self.key
    }

    fn start(&self, origin: DateTime<Utc>, faults: FaultReporter) {
        if self
            .command_tx
            .send(WriterCommand::Start { origin, faults: faults.clone() })
            .is_err()
        {
            faults.report(&self.key, WriterError::Disconnected(self.key.to_string()));
        }
    }

    fn append(&self, event: &Event) -> Result<(), WriterError> {
        self.command_tx
            .send(WriterCommand::Append(event.clone()))
            .map_err(|_| WriterError::Disconnected(self.key.to_string()))
    }

    fn stop(&self, origin: DateTime<Utc>) {
        let (done_tx, done_rx) = bounded(1);
        if self
            .command_tx
            .send(WriterCommand::Stop { origin, done: done_tx })
            .is_ok()
        {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for JsonChannelWriter {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Creates `JsonChannelWriter`s under one storage root
pub struct JsonWriterFactory {
    storage_root: PathBuf,
}

impl JsonWriterFactory {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
        }
    }
}

impl ChannelWriterFactory for JsonWriterFactory {
    fn create(&self, key: DeviceOperationKey) -> Arc<dyn ChannelWriter> {
        Arc::new(JsonChannelWriter::new(key, self.storage_root.clone()))
    }
}
