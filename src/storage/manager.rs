//! Storage driver selection and the recording consumer.
//!
//! For a run started with `save = true` the manager opens a sink on the
//! current storage driver, subscribes to the block stream without a queue
//! bound, so no block is ever dropped from a recording, and drains it on a
//! blocking worker. `on_finishing` unsubscribes; the worker then writes what is
//! still queued, finalizes the file and sets the storage rendezvous. Runs
//! without `save` only take part in the handshake.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::{BlockSink, SinkSummary, StorageDriver, StorageRegistry};
use crate::block::{BlockPublisher, SampleBlock, SubscriptionId};
use crate::config::DriverEntry;
use crate::error::{AppResult, DaqError};
use crate::manager::set::SwitchGuard;
use crate::manager::{AcquisitionEvent, AcquisitionObserver, DriverRef, DriverSet, RunInfo};
use crate::rendezvous::{Rendezvous, SetOnDrop};

const EVENT_CAPACITY: usize = 16;

struct Recording {
    subscription: SubscriptionId,
    blocks: Arc<BlockPublisher>,
}

/// Owns the storage drivers and records runs.
pub struct StorageManager {
    control: Mutex<DriverSet<dyn StorageDriver>>,
    switching: AtomicBool,
    events: broadcast::Sender<AcquisitionEvent>,
    done: Arc<Rendezvous>,
    runtime: Handle,
    recording: Mutex<Option<Recording>>,
    last_error: Arc<Mutex<Option<DaqError>>>,
    last_file: Arc<Mutex<Option<SinkSummary>>>,
}

impl StorageManager {
    /// `done` is the storage rendezvous.
    pub fn new(done: Arc<Rendezvous>, runtime: Handle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            control: Mutex::new(DriverSet::new("storage")),
            switching: AtomicBool::new(false),
            events,
            done,
            runtime,
            recording: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
            last_file: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a storage driver. The first one becomes current.
    pub fn add_driver(&self, driver: Box<dyn StorageDriver>) -> AppResult<()> {
        self.control.lock().add(driver).map(|_| ())
    }

    /// Instantiates `[[storages]]` entries; `defaults` fills keys they omit.
    pub fn load_drivers(
        &self,
        entries: &[DriverEntry],
        registry: &StorageRegistry,
        defaults: &toml::Value,
    ) -> usize {
        self.control.lock().load(entries, |entry| {
            registry.create(&entry.kind, &entry.args_with_defaults(defaults))
        })
    }

    /// Storage driver changes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }

    /// Registered storage driver names.
    pub fn get_drivers(&self) -> Vec<String> {
        self.control.lock().names()
    }

    /// Name of the current storage driver.
    pub fn get_driver(&self) -> Option<String> {
        self.control.lock().current_name().map(str::to_string)
    }

    /// Index of `name`, or of the current driver.
    pub fn get_index(&self, name: Option<&str>) -> Option<usize> {
        self.control.lock().index_of(name)
    }

    /// Applies `f` to every storage driver; the flag marks the current one.
    pub fn map_drivers<R>(&self, mut f: impl FnMut(&dyn StorageDriver, bool) -> R) -> Vec<R> {
        let drivers = self.control.lock();
        let current = drivers.index_of(None);
        drivers
            .iter()
            .enumerate()
            .map(|(i, driver)| f(driver, Some(i) == current))
            .collect()
    }

    /// Selects the current storage driver. `Ok(false)` while a change is in
    /// progress.
    pub fn set_driver<'a>(&self, target: impl Into<DriverRef<'a>>) -> AppResult<bool> {
        let Some(_switching) = SwitchGuard::try_acquire(&self.switching) else {
            return Ok(false);
        };
        if self.is_recording() {
            return Err(DaqError::InvalidState(
                "cannot change storage while recording".into(),
            ));
        }
        let name = self.control.lock().select(target.into())?.to_string();
        info!(storage = %name, "storage driver selected");
        let _ = self.events.send(AcquisitionEvent::DriverChanged(name));
        Ok(true)
    }

    /// Runs `f` on the current storage driver.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut dyn StorageDriver) -> R) -> AppResult<R> {
        let mut drivers = self.control.lock();
        let driver = drivers
            .current_mut()
            .ok_or_else(|| DaqError::NotFound("storage driver".into()))?;
        Ok(f(driver))
    }

    /// Whether a saved run is in progress.
    pub fn is_recording(&self) -> bool {
        self.recording.lock().is_some()
    }

    /// File written by the most recent saved run.
    pub fn last_file(&self) -> Option<SinkSummary> {
        self.last_file.lock().clone()
    }

    /// Path the next saved run will write to.
    pub fn next_path(&self) -> Option<PathBuf> {
        self.with_current(|d| d.target().file_path(super::npy::EXTENSION))
            .ok()
    }

    fn open_sink(&self, run: &RunInfo) -> AppResult<Box<dyn BlockSink>> {
        let mut drivers = self.control.lock();
        let driver = drivers
            .current_mut()
            .ok_or_else(|| DaqError::NotFound("storage driver".into()))?;
        driver.open(run)
    }
}

impl AcquisitionObserver for StorageManager {
    fn name(&self) -> &str {
        "storage"
    }

    fn on_starting(&self, run: &RunInfo) -> AppResult<()> {
        *self.last_error.lock() = None;
        if !run.save {
            debug!("run not saved, storage only acknowledges");
            return Ok(());
        }
        let sink = match self.open_sink(run) {
            Ok(sink) => sink,
            Err(e) => {
                self.done.set();
                return Err(e);
            }
        };
        let (subscription, rx) = run.blocks.subscribe_lossless("storage");
        let done = Arc::clone(&self.done);
        let last_error = Arc::clone(&self.last_error);
        let last_file = Arc::clone(&self.last_file);
        self.runtime.spawn_blocking(move || {
            let _done = SetOnDrop::new(done);
            match record(sink, rx) {
                Ok(summary) => *last_file.lock() = Some(summary),
                Err(e) => {
                    error!(error = %e, "recording failed");
                    *last_error.lock() = Some(e);
                }
            }
        });
        *self.recording.lock() = Some(Recording {
            subscription,
            blocks: Arc::clone(&run.blocks),
        });
        Ok(())
    }

    /// Ends the recording. The acquisition number advances for every run that
    /// opened a file, including one whose writes later failed: that file keeps
    /// the rows written before the failure and is never overwritten.
    fn on_finishing(&self) {
        let Some(recording) = self.recording.lock().take() else {
            self.done.set();
            return;
        };
        recording.blocks.unsubscribe(recording.subscription);
        let mut drivers = self.control.lock();
        if let Some(driver) = drivers.current_mut() {
            driver.target_mut().advance();
            debug!(acqno = driver.target().acqno, "acquisition number advanced");
        }
    }

    fn take_error(&self) -> Option<DaqError> {
        self.last_error.lock().take()
    }
}

/// Writes blocks until the stream closes, then finalizes.
///
/// After a failed write the remaining blocks are discarded; the file is still
/// finalized so its header matches the rows that made it to disk.
fn record(
    mut sink: Box<dyn BlockSink>,
    mut rx: mpsc::UnboundedReceiver<Arc<SampleBlock>>,
) -> AppResult<SinkSummary> {
    let mut failure = None;
    while let Some(block) = rx.blocking_recv() {
        if let Err(e) = sink.write_block(&block) {
            error!(sequence = block.sequence(), error = %e, "block write failed");
            failure = Some(e);
            break;
        }
    }
    drop(rx);
    let finalized = sink.finalize();
    match failure {
        Some(e) => {
            if let Err(fin) = finalized {
                warn!(error = %fin, "finalize after write failure also failed");
            }
            Err(e)
        }
        None => finalized,
    }
}
