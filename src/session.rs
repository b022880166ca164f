//! # Recording Session Manager
//!
//! Tracks which (device, operation) channels take part in the next recording
//! and starts/stops all of them together under one shared start time.
//!
//! ## Lifecycle
//! 1. `add_channel` / `remove_channel` build the channel set (duplicates ignored)
//! 2. `start` captures the session timestamp *before* dispatching to the
//!    background pool, so every writer sees the same origin
//! 3. `stop` closes every writer of the session, then publishes `Idle`
//!
//! ## Failure Policy
//! A fault from any single writer stops the whole session: the fault is
//! published as an `Error` event and every channel is stopped, healthy or not.
//!
//! All mutators take `&mut self`; the manager expects a single owner.

use crate::error::WriterError;
use crate::notify::{Notifier, RecorderEvent};
use crate::writer::{ChannelWriter, ChannelWriterFactory, FaultReporter, FaultSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Recordable sensor operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Acc,
    Gyro,
    Magn,
    Ecg,
    Imu,
    HeartRate,
}

impl Operation {
    /// Name used in log file names
    pub fn file_stem(&self) -> &'static str {
        match self {
            Operation::Acc => "acc",
            Operation::Gyro => "gyro",
            Operation::Magn => "magn",
            Operation::Ecg => "ecg",
            Operation::Imu => "imu",
            Operation::HeartRate => "hr",
        }
    }
}

/// Identity of one channel within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceOperationKey {
    pub device_id: String,
    pub operation: Operation,
}

impl DeviceOperationKey {
    pub fn new(device_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            device_id: device_id.into(),
            operation,
        }
    }

    /// `<serial>_<operation>`
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.device_id, self.operation.file_stem())
    }
}

impl fmt::Display for DeviceOperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.operation.file_stem())
    }
}

/// One start/stop cycle over a fixed set of writers
struct Session {
    started_at: DateTime<Utc>,
    writers: Vec<Arc<dyn ChannelWriter>>,
    stopped: AtomicBool,
    notifier: Notifier,
    runtime: Handle,
}

impl Session {
    /// Close every writer on the pool, then publish `Idle`.
    ///
    /// Writers are closed at most once per session.
    fn shutdown(&self) -> JoinHandle<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            let notifier = self.notifier.clone();
            return self
                .runtime
                .spawn_blocking(move || notifier.publish(RecorderEvent::Idle));
        }
        self.close_writers()
    }

    fn close_writers(&self) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        let writers = self.writers.clone();
        let origin = self.started_at;
        self.runtime.spawn_blocking(move || {
            for writer in &writers {
                writer.stop(origin);
            }
            log::info!("Recording session {} stopped", origin);
            notifier.publish(RecorderEvent::Idle);
        })
    }
}

impl FaultSink for Session {
    fn channel_fault(&self, key: &DeviceOperationKey, error: WriterError) {
        // Only the first fault of a session is escalated.
        if self.stopped.swap(true, Ordering::SeqCst) {
            log::warn!("Channel {} faulted after session stop: {}", key, error);
            return;
        }
        log::error!("Channel {} faulted, stopping session: {}", key, error);
        self.notifier.publish(RecorderEvent::Error(error.to_string()));
        // Completion is observed through the Idle event.
        drop(self.close_writers());
    }
}

/// Owns the channel set and the active recording session
pub struct Recorder {
    runtime: Handle,
    notifier: Notifier,
    factory: Arc<dyn ChannelWriterFactory>,
    channels: Vec<Arc<dyn ChannelWriter>>,
    started_at: DateTime<Utc>,
    session: Option<Arc<Session>>,
}

impl Recorder {
    /// Create a recorder that dispatches writer work on `runtime`
    pub fn new(
        runtime: Handle,
        notifier: Notifier,
        factory: Arc<dyn ChannelWriterFactory>,
    ) -> Self {
        Self {
            runtime,
            notifier,
            factory,
            channels: Vec::new(),
            started_at: Utc::now(),
            session: None,
        }
    }

    /// Track a channel; adding an already tracked channel does nothing
    pub fn add_channel(&mut self, device_id: &str, operation: Operation) {
        let key = DeviceOperationKey::new(device_id, operation);
        if self.channels.iter().any(|w| w.key() == &key) {
            log::debug!("Channel {} already tracked", key);
            return;
        }
        log::info!("Adding channel {}", key);
        self.channels.push(self.factory.create(key));
    }

    pub fn remove_channel(&mut self, device_id: &str, operation: Operation) {
        let key = DeviceOperationKey::new(device_id, operation);
        self.channels.retain(|w| w.key() != &key);
    }

    pub fn remove_all_channels(&mut self) {
        self.channels.clear();
    }

    pub fn channels(&self) -> impl Iterator<Item = &DeviceOperationKey> {
        self.channels.iter().map(|w| w.key())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Writer of a tracked channel, for feeding it sensor batches
    pub fn writer(&self, device_id: &str, operation: Operation) -> Option<Arc<dyn ChannelWriter>> {
        let key = DeviceOperationKey::new(device_id, operation);
        self.channels.iter().find(|w| w.key() == &key).cloned()
    }

    /// Whether a session is running and has not been stopped by a fault
    pub fn is_recording(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.stopped.load(Ordering::SeqCst))
    }

    /// Start time of the current (or last) session
    pub fn session_started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Start all tracked channels under one new session timestamp.
    ///
    /// Publishes `Recording` without waiting for the writers; the returned
    /// handle completes once every writer has been told to start.
    pub fn start(&mut self) -> JoinHandle<()> {
        let started_at = Utc::now();
        if self.is_recording() {
            log::warn!("Starting a new session while one is active");
        }
        self.started_at = started_at;

        let session = Arc::new(Session {
            started_at,
            writers: self.channels.clone(),
            stopped: AtomicBool::new(false),
            notifier: self.notifier.clone(),
            runtime: self.runtime.clone(),
        });
        let sink: Weak<dyn FaultSink> = Arc::downgrade(&session) as Weak<dyn FaultSink>;
        let reporter = FaultReporter::new(sink);
        let writers = session.writers.clone();
        self.session = Some(session);

        log::info!(
            "Starting recording session {} with {} channel(s)",
            started_at,
            writers.len()
        );
        let handle = self.runtime.spawn_blocking(move || {
            for writer in &writers {
                writer.start(started_at, reporter.clone());
            }
        });

        self.notifier.publish(RecorderEvent::Recording);
        handle
    }

    /// Stop every channel of the current session.
    ///
    /// Without an active session the tracked channels are told to stop using
    /// the last session timestamp. `Idle` is published once writers are closed.
    pub fn stop(&mut self) -> JoinHandle<()> {
        let session = self.session.take().unwrap_or_else(|| {
            Arc::new(Session {
                started_at: self.started_at,
                writers: self.channels.clone(),
                stopped: AtomicBool::new(false),
                notifier: self.notifier.clone(),
                runtime: self.runtime.clone(),
            })
        });
        session.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::notify::Subscription;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(DateTime<Utc>),
        Stop(DateTime<Utc>),
    }

    struct FakeWriter {
        key: DeviceOperationKey,
        calls: Mutex<Vec<Call>>,
        reporter: Mutex<Option<FaultReporter>>,
    }

    impl FakeWriter {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(&self) {
            let reporter = self.reporter.lock().unwrap().clone();
            reporter
                .expect("writer was started")
                .report(&self.key, WriterError::Disconnected(self.key.to_string()));
        }
    }

    impl ChannelWriter for FakeWriter {
        fn key(&self) -> &DeviceOperationKey {
            &self.key
        }

        fn start(&self, origin: DateTime<Utc>, faults: FaultReporter) {
            self.calls.lock().unwrap().push(Call::Start(origin));
            *self.reporter.lock().unwrap() = Some(faults);
        }

        fn append(&self, _event: &Event) -> Result<(), WriterError> {
            Ok(())
        }

        fn stop(&self, origin: DateTime<Utc>) {
            self.calls.lock().unwrap().push(Call::Stop(origin));
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: Mutex<Vec<Arc<FakeWriter>>>,
    }

    impl FakeFactory {
        fn writers(&self) -> Vec<Arc<FakeWriter>> {
            self.created.lock().unwrap().clone()
        }
    }

    impl ChannelWriterFactory for FakeFactory {
        fn create(&self, key: DeviceOperationKey) -> Arc<dyn ChannelWriter> {
            let writer = Arc::new(FakeWriter {
                key,
                calls: Mutex::new(Vec::new()),
                reporter: Mutex::new(None),
            });
            self.created.lock().unwrap().push(writer.clone());
            writer
        }
    }

    fn recorder() -> (Recorder, Arc<FakeFactory>, Subscription<RecorderEvent>) {
        let notifier = Notifier::new();
        let subscription = notifier.subscribe();
        let factory = Arc::new(FakeFactory::default());
        let recorder = Recorder::new(Handle::current(), notifier, factory.clone());
        (recorder, factory, subscription)
    }

    fn wait_for(sub: &Subscription<RecorderEvent>, wanted: RecorderEvent) -> Vec<RecorderEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = sub.receiver.recv_timeout(Duration::from_secs(5)) {
            let done = event == wanted;
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("never received {:?}, saw {:?}", wanted, seen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_channel_is_idempotent() {
        let (mut recorder, factory, _sub) = recorder();
        recorder.add_channel("174630000192", Operation::Acc);
        recorder.add_channel("174630000192", Operation::Acc);
        assert_eq!(recorder.channel_count(), 1);
        assert_eq!(factory.writers().len(), 1);

        recorder.add_channel("174630000192", Operation::Ecg);
        assert_eq!(recorder.channel_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_channels() {
        let (mut recorder, _factory, _sub) = recorder();
        recorder.remove_channel("X", Operation::Acc);
        recorder.remove_all_channels();

        recorder.add_channel("A", Operation::Acc);
        recorder.add_channel("B", Operation::Acc);
        recorder.remove_channel("A", Operation::Acc);
        let keys: Vec<_> = recorder.channels().cloned().collect();
        assert_eq!(keys, vec![DeviceOperationKey::new("B", Operation::Acc)]);

        recorder.remove_all_channels();
        assert_eq!(recorder.channel_count(), 0);
        assert!(recorder.writer("B", Operation::Acc).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_shares_one_origin() {
        let (mut recorder, factory, sub) = recorder();
        recorder.add_channel("A", Operation::Acc);
        recorder.add_channel("B", Operation::Gyro);
        recorder.add_channel("C", Operation::HeartRate);

        let started = recorder.start();
        assert_eq!(sub.receiver.try_recv().unwrap(), RecorderEvent::Recording);
        started.await.unwrap();
        assert!(recorder.is_recording());

        let origin = recorder.session_started_at();
        for writer in factory.writers() {
            assert_eq!(writer.calls(), vec![Call::Start(origin)]);
        }

        recorder.stop().await.unwrap();
        assert_eq!(sub.receiver.try_recv().unwrap(), RecorderEvent::Idle);
        assert!(!recorder.is_recording());
        for writer in factory.writers() {
            assert_eq!(writer.calls(), vec![Call::Start(origin), Call::Stop(origin)]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_without_session_still_goes_idle() {
        let (mut recorder, factory, sub) = recorder();
        recorder.add_channel("A", Operation::Ecg);
        recorder.stop().await.unwrap();

        assert_eq!(sub.drain(), vec![RecorderEvent::Idle]);
        assert_eq!(factory.writers()[0].calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_channel_fault_stops_whole_session() {
        let (mut recorder, factory, sub) = recorder();
        recorder.add_channel("A", Operation::Acc);
        recorder.add_channel("B", Operation::Acc);
        recorder.start().await.unwrap();
        let origin = recorder.session_started_at();

        let writers = factory.writers();
        writers[1].fail();

        let events = wait_for(&sub, RecorderEvent::Idle);
        assert_eq!(events[0], RecorderEvent::Recording);
        assert!(matches!(events[1], RecorderEvent::Error(_)));
        assert_eq!(events.last(), Some(&RecorderEvent::Idle));
        assert!(!recorder.is_recording());

        // The healthy channel was stopped too
        assert_eq!(writers[0].calls(), vec![Call::Start(origin), Call::Stop(origin)]);

        // A second fault in the same session is not escalated again
        writers[0].fail();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_faults_publish_one_error() {
        let (mut recorder, factory, sub) = recorder();
        for serial in ["A", "B", "C", "D", "E", "F", "G", "H"] {
            recorder.add_channel(serial, Operation::Acc);
        }
        recorder.start().await.unwrap();

        let writers = factory.writers();
        let barrier = Arc::new(std::sync::Barrier::new(writers.len()));
        let threads: Vec<_> = writers
            .into_iter()
            .map(|writer| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    writer.fail();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let events = wait_for(&sub, RecorderEvent::Idle);
        let errors = events
            .iter()
            .filter(|e| matches!(e, RecorderEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.drain().is_empty());
    }
}
