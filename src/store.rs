//! # Recording Store
//!
//! Lists, stages, converts and deletes finished recordings under the
//! application storage root.
//!
//! I/O failures never propagate to the caller here: they are published as
//! `Error` events and the call returns an empty or no-op result.

use crate::convert::{CancelFlag, ConversionJob, Converter};
use crate::error::StoreError;
use crate::notify::{Notifier, RecorderEvent};
use crate::session::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::runtime::Handle;

/// Directory under the storage root that holds session directories
pub const RECORDINGS_DIR: &str = "recordings";
/// Extension of channel log files
pub const LOG_SUFFIX: &str = ".jsonl";
/// Extension of record sidecar files
pub const HEADER_SUFFIX: &str = ".header";

/// Metadata of one recorded channel log.
///
/// Written as the first line of the log and as a `.header` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFile {
    pub serial_number: String,
    pub operation: Operation,
    pub start_date: DateTime<Utc>,
    /// Log path relative to the storage root
    pub file_path: PathBuf,
}

impl RecordFile {
    /// File name used when the log is staged in the temporary directory
    pub fn staged_name(&self) -> Option<String> {
        let file_name = self.file_path.file_name()?.to_string_lossy();
        Some(format!(
            "{}_{}_{}",
            self.start_date.format("%Y%m%dT%H%M%SZ"),
            self.serial_number,
            file_name
        ))
    }
}

pub struct RecordStore {
    storage_root: PathBuf,
    temp_dir: PathBuf,
    notifier: Notifier,
    conversion: Mutex<Option<CancelFlag>>,
}

impl RecordStore {
    pub fn new(storage_root: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>, notifier: Notifier) -> Self {
        Self {
            storage_root: storage_root.into(),
            temp_dir: temp_dir.into(),
            notifier,
            conversion: Mutex::new(None),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.storage_root.join(RECORDINGS_DIR)
    }

    fn report(&self, error: StoreError) {
        log::error!("{}", error);
        self.notifier.publish(RecorderEvent::Error(error.to_string()));
    }

    /// All records with a readable sidecar, sorted by start date
    pub fn records(&self) -> Vec<RecordFile> {
        let root = self.recordings_dir();
        let mut sidecars = Vec::new();
        if let Err(source) = collect_sidecars(&root, &mut sidecars) {
            self.report(StoreError::List { path: root, source });
            return Vec::new();
        }

        let mut records: Vec<RecordFile> = sidecars
            .iter()
            .filter_map(|path| {
                let contents = fs::read(path).ok()?;
                match serde_json::from_slice(&contents) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        log::debug!("Skipping unreadable sidecar {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .collect();
        records.sort_by(|a, b| {
            a.start_date
                .cmp(&b.start_date)
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        records
    }

    /// Copy a record's log into the temporary directory, replacing an older copy
    pub fn temp_copy(&self, record: &RecordFile) -> Option<PathBuf> {
        let Some(name) = record.staged_name() else {
            self.report(StoreError::InvalidRecordPath(
                record.file_path.display().to_string(),
            ));
            return None;
        };
        let source = self.storage_root.join(&record.file_path);
        let target = self.temp_dir.join(name);

        let _ = fs::remove_file(&target);
        let copied = fs::create_dir_all(&self.temp_dir).and_then(|_| fs::copy(&source, &target));
        if let Err(e) = copied {
            self.report(StoreError::Copy {
                path: source,
                source: e,
            });
            return None;
        }

        log::debug!("Staged {} as {}", record.file_path.display(), target.display());
        Some(target)
    }

    /// Cancel the running conversion and empty the temporary directory
    pub fn temp_clear(&self) {
        if let Some(cancel) = self.active_conversion() {
            cancel.cancel();
        }

        let entries = match fs::read_dir(&self.temp_dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.report(StoreError::List {
                    path: self.temp_dir.clone(),
                    source: e,
                });
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                log::debug!("Could not remove {}: {}", path.display(), e);
            }
        }
    }

    /// Delete a record's log and sidecar; the session directory goes once empty
    pub fn remove_record(&self, record: &RecordFile) {
        let log_path = self.storage_root.join(&record.file_path);
        let sidecar = log_path.with_extension(HEADER_SUFFIX.trim_start_matches('.'));

        if let Err(e) = fs::remove_file(&log_path) {
            self.report(StoreError::Remove {
                path: log_path,
                source: e,
            });
            return;
        }
        if let Err(e) = fs::remove_file(&sidecar) {
            log::warn!("Sidecar {} not removed: {}", sidecar.display(), e);
        }

        if let Some(dir) = log_path.parent() {
            let is_empty = fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false);
            if is_empty {
                if let Err(e) = fs::remove_dir(dir) {
                    log::warn!("Session directory {} not removed: {}", dir.display(), e);
                }
            }
        }

        self.notifier.publish(RecorderEvent::RecordsUpdated);
    }

    /// Start converting a (staged) log on the pool.
    ///
    /// Replaces any previously registered conversion as the one `temp_clear`
    /// cancels.
    pub fn convert(&self, runtime: &Handle, source: PathBuf) -> ConversionJob {
        let converter = Converter::new(self.notifier.clone());
        *self
            .conversion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(converter.cancel_flag());
        ConversionJob::spawn(runtime, converter, source)
    }

    fn active_conversion(&self) -> Option<CancelFlag> {
        self.conversion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Recursively collect `*.header` files below `dir`
fn collect_sidecars(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_sidecars(&path, out)?;
        } else if path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(HEADER_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AccData, Event, Vector3};
    use crate::notify::Subscription;
    use crate::session::DeviceOperationKey;
    use crate::writer::{ChannelWriter, FaultReporter, FaultSink, JsonChannelWriter};
    use crate::error::WriterError;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct IgnoreFaults;

    impl FaultSink for IgnoreFaults {
        fn channel_fault(&self, _key: &DeviceOperationKey, _error: WriterError) {}
    }

    fn record_session(root: &Path, serial: &str, operation: Operation, batches: u32) {
        let writer = JsonChannelWriter::new(DeviceOperationKey::new(serial, operation), root);
        let sink: Arc<dyn FaultSink> = Arc::new(IgnoreFaults);
        let origin = Utc::now();
        writer.start(origin, FaultReporter::new(Arc::downgrade(&sink)));
        for i in 0..batches {
            writer
                .append(&Event::Acc(AccData {
                    timestamp: i * 40,
                    vectors: vec![Vector3::new(0.0, 0.0, 1.0); 2],
                }))
                .unwrap();
        }
        writer.stop(origin);
    }

    fn store() -> (TempDir, RecordStore, Subscription<RecorderEvent>) {
        let dir = tempdir().unwrap();
        let notifier = Notifier::new();
        let sub = notifier.subscribe();
        let store = RecordStore::new(dir.path().join("storage"), dir.path().join("tmp"), notifier);
        (dir, store, sub)
    }

    #[test]
    fn test_records_lists_sidecars() {
        let (_dir, store, sub) = store();
        record_session(store.storage_root(), "A1", Operation::Acc, 3);
        record_session(store.storage_root(), "B2", Operation::Gyro, 3);

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].serial_number, "A1");
        assert_eq!(records[1].operation, Operation::Gyro);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_records_missing_directory_reports_error() {
        let (_dir, store, sub) = store();
        assert!(store.records().is_empty());
        assert!(matches!(sub.drain()[..], [RecorderEvent::Error(_)]));
    }

    #[test]
    fn test_temp_copy_and_clear() {
        let (_dir, store, _sub) = store();
        record_session(store.storage_root(), "A1", Operation::Acc, 3);
        let record = store.records().remove(0);

        let staged = store.temp_copy(&record).expect("record staged");
        assert!(staged.starts_with(store.temp_dir()));
        let name = staged.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_A1_A1_acc.jsonl"));

        // Staging twice replaces the earlier copy
        assert_eq!(store.temp_copy(&record), Some(staged.clone()));

        store.temp_clear();
        assert!(!staged.exists());
        assert_eq!(fs::read_dir(store.temp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_temp_copy_missing_log_reports_error() {
        let (_dir, store, sub) = store();
        let record = RecordFile {
            serial_number: "A1".to_string(),
            operation: Operation::Ecg,
            start_date: Utc::now(),
            file_path: PathBuf::from("recordings/none/A1_ecg.jsonl"),
        };
        assert!(store.temp_copy(&record).is_none());
        assert!(matches!(sub.drain()[..], [RecorderEvent::Error(_)]));
    }

    #[test]
    fn test_remove_record() {
        let (_dir, store, sub) = store();
        record_session(store.storage_root(), "A1", Operation::Acc, 2);
        let record = store.records().remove(0);
        let session_dir = store
            .storage_root()
            .join(&record.file_path)
            .parent()
            .unwrap()
            .to_path_buf();

        store.remove_record(&record);
        assert!(store.records().is_empty());
        assert!(!session_dir.exists());
        assert_eq!(sub.drain(), vec![RecorderEvent::RecordsUpdated]);

        store.remove_record(&record);
        assert!(matches!(sub.drain()[..], [RecorderEvent::Error(_)]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_temp_clear_cancels_running_conversion() {
        let (_dir, store, sub) = store();
        fs::create_dir_all(store.temp_dir()).unwrap();
        let record = RecordFile {
            serial_number: "A1".to_string(),
            operation: Operation::Acc,
            start_date: Utc::now(),
            file_path: PathBuf::from("recordings/x/A1_acc.jsonl"),
        };
        let mut body = serde_json::to_string(&record).unwrap();
        body.push('\n');
        for i in 0..20_000u32 {
            let event = Event::Acc(AccData {
                timestamp: i * 20,
                vectors: vec![Vector3::new(0.0, 0.0, 1.0); 4],
            });
            body.push_str(&event.encode_line().unwrap());
            body.push('\n');
        }
        let staged = store.temp_dir().join("A1_acc.jsonl");
        fs::write(&staged, body).unwrap();

        let job = store.convert(&Handle::current(), staged);
        loop {
            match sub.receiver.recv_timeout(std::time::Duration::from_secs(10)) {
                Ok(RecorderEvent::Converting { .. }) => break,
                Ok(_) => continue,
                Err(e) => panic!("no progress reported: {}", e),
            }
        }
        store.temp_clear();

        assert!(matches!(
            job.join().await,
            Err(crate::error::ConvertError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_convert_staged_record() {
        let (_dir, store, _sub) = store();
        record_session(store.storage_root(), "A1", Operation::Acc, 3);
        let record = store.records().remove(0);
        let staged = store.temp_copy(&record).unwrap();

        let outcome = store
            .convert(&Handle::current(), staged)
            .join()
            .await
            .unwrap();
        let csv = fs::read_to_string(outcome.path()).unwrap();
        // Batches 2 and 3 each contribute two rows
        assert_eq!(csv.lines().count(), 5);
    }
}
