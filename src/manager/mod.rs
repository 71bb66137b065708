//! Driver manager: driver selection and the acquisition state machine.
//!
//! ```text
//!   Idle ──start()──▶ Starting ──▶ Running ──stop()──▶ Stopping ──▶ Idle
//! ```
//!
//! `start(save)` prepares the current driver, resets both completion
//! rendezvous, notifies every [`AcquisitionObserver`] (they subscribe to the
//! block stream here) and finally starts the driver. `stop()` halts the
//! driver, tells the observers to finish and then blocks until both
//! rendezvous are set or the configured stop timeout has passed. A timeout is
//! logged, not escalated; the manager always returns to `Idle`.
//!
//! Lifecycle events are also broadcast on a `tokio::sync::broadcast` channel
//! for listeners that only need to follow along (UI state, logging).
//!
//! Observers are invoked while the manager's control lock is held and must
//! not call `start`, `stop` or `set_driver` from those callbacks, with the
//! exception of `on_driver_changed`, where a nested `set_driver` is ignored.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::block::BlockPublisher;
use crate::channel::Channel;
use crate::config::DriverEntry;
use crate::driver::{Driver, DriverRegistry, SamplingConfig};
use crate::error::{AppResult, DaqError};
use crate::rendezvous::{AcquisitionStates, Rendezvous};

pub mod set;

pub use set::{DriverRef, DriverSet, Selectable};
use set::SwitchGuard;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AcquisitionEvent {
    /// A different driver was selected.
    DriverChanged(String),
    /// `start()` accepted; the driver is about to be prepared.
    AboutToStart,
    /// The driver is prepared; consumers should subscribe now.
    Starting {
        /// Whether the run is being recorded.
        save: bool,
    },
    /// `stop()` accepted; the driver is about to be halted.
    AboutToFinish,
    /// The driver has stopped; consumers should finalize.
    Finishing,
}

/// Where the manager is in its start/stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquisitionState {
    /// No run; drivers can be changed.
    Idle,
    /// Inside `start()`.
    Starting,
    /// Blocks are flowing.
    Running,
    /// Inside `stop()`, waiting for the consumers.
    Stopping,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Starting => "starting",
            AcquisitionState::Running => "running",
            AcquisitionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What consumers need to know about a run, captured right after `prepare()`.
#[derive(Debug, Clone)]
pub struct RunInfo {
    /// Whether the run is being recorded.
    pub save: bool,
    /// Name of the driver producing the blocks.
    pub driver: String,
    /// Sampling configuration of the run.
    pub sampling: SamplingConfig,
    /// Active channels, in block column order.
    pub channels: Vec<Channel>,
    /// Stream the driver publishes on.
    pub blocks: Arc<BlockPublisher>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl RunInfo {
    /// Snapshot of a prepared driver.
    pub fn capture(driver: &dyn Driver, save: bool) -> Self {
        Self {
            save,
            driver: driver.name().to_string(),
            sampling: driver.sampling(),
            channels: driver
                .channels()
                .active_channels()
                .into_iter()
                .cloned()
                .collect(),
            blocks: driver.blocks(),
            started_at: Utc::now(),
        }
    }

    /// Sample period in seconds.
    pub fn dt(&self) -> f64 {
        self.sampling.dt()
    }

    /// Number of columns in every block of this run.
    pub fn n_active(&self) -> usize {
        self.channels.len()
    }

    /// Per-column scale factors.
    pub fn scales(&self) -> Vec<f64> {
        self.channels.iter().map(Channel::scale).collect()
    }
}

/// A consumer taking part in every run.
pub trait AcquisitionObserver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called after the driver is prepared and before it starts.
    /// An error aborts the start.
    fn on_starting(&self, run: &RunInfo) -> AppResult<()>;

    /// Called once the driver has stopped, or when a start is aborted after
    /// `on_starting` succeeded. The observer must eventually set its
    /// rendezvous.
    fn on_finishing(&self);

    /// Called after a new driver was selected.
    fn on_driver_changed(&self, _driver: &str) {}

    /// Error raised by the observer's worker during the last run, if any.
    fn take_error(&self) -> Option<DaqError> {
        None
    }
}

/// Outcome of the completion handshake in `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Storage consumer acknowledged before the deadline.
    pub storage_done: bool,
    /// View consumer acknowledged before the deadline.
    pub view_done: bool,
    /// Time spent waiting for acknowledgements.
    pub waited_ms: u64,
}

impl StopReport {
    /// Both consumers acknowledged in time.
    pub fn is_clean(&self) -> bool {
        self.storage_done && self.view_done
    }
}

impl Selectable for dyn Driver {
    fn key(&self) -> &str {
        self.name()
    }
}

/// Owns the acquisition drivers and sequences runs.
pub struct DriverManager {
    control: Mutex<DriverSet<dyn Driver>>,
    switching: AtomicBool,
    state: watch::Sender<AcquisitionState>,
    observers: RwLock<Vec<Arc<dyn AcquisitionObserver>>>,
    events: broadcast::Sender<AcquisitionEvent>,
    states: AcquisitionStates,
    runtime: Handle,
    stop_timeout: Duration,
}

impl DriverManager {
    /// Empty manager. `stop_timeout` bounds the wait in [`stop`](Self::stop).
    pub fn new(states: AcquisitionStates, runtime: Handle, stop_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(AcquisitionState::Idle);
        Self {
            control: Mutex::new(DriverSet::new("acquisition")),
            switching: AtomicBool::new(false),
            state,
            observers: RwLock::new(Vec::new()),
            events,
            states,
            runtime,
            stop_timeout,
        }
    }

    /// Registers a driver. The first one becomes current.
    pub fn add_driver(&self, driver: Box<dyn Driver>) -> AppResult<()> {
        let name = driver.name().to_string();
        self.control.lock().add(driver)?;
        info!(driver = %name, "driver registered");
        Ok(())
    }

    /// Instantiates configured drivers. Unresolvable entries are skipped.
    pub fn load_drivers(&self, entries: &[DriverEntry], registry: &DriverRegistry) -> usize {
        self.control
            .lock()
            .load(entries, |entry| registry.create(&entry.kind, &entry.args))
    }

    /// Adds a consumer notified on every run.
    pub fn add_observer(&self, observer: Arc<dyn AcquisitionObserver>) {
        debug!(observer = observer.name(), "acquisition observer added");
        self.observers.write().push(observer);
    }

    /// Lifecycle events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }

    /// Receiver following the state machine.
    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// How long `stop()` waits for the consumers.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Registered driver names, in registration order.
    pub fn get_drivers(&self) -> Vec<String> {
        self.control.lock().names()
    }

    /// Name of the current driver.
    pub fn get_driver(&self) -> Option<String> {
        self.control.lock().current_name().map(str::to_string)
    }

    /// Registration index of `name`, or of the current driver.
    pub fn get_index(&self, name: Option<&str>) -> Option<usize> {
        self.control.lock().index_of(name)
    }

    /// Applies `f` to every driver in registration order; the flag marks the
    /// current one.
    pub fn map_drivers<R>(&self, mut f: impl FnMut(&dyn Driver, bool) -> R) -> Vec<R> {
        let drivers = self.control.lock();
        let current = drivers.index_of(None);
        drivers
            .iter()
            .enumerate()
            .map(|(i, driver)| f(driver, Some(i) == current))
            .collect()
    }

    /// Selects the current driver.
    ///
    /// Returns `Ok(false)` without doing anything when another driver change
    /// is still in progress. Fails with `NotFound` for unknown drivers and
    /// with `InvalidState` unless the manager is idle.
    pub fn set_driver<'a>(&self, target: impl Into<DriverRef<'a>>) -> AppResult<bool> {
        let Some(_switching) = SwitchGuard::try_acquire(&self.switching) else {
            debug!("driver change already in progress, ignoring");
            return Ok(false);
        };
        let name = {
            let mut drivers = self.control.lock();
            let state = self.state();
            if state != AcquisitionState::Idle {
                return Err(DaqError::InvalidState(format!(
                    "cannot change driver while {state}"
                )));
            }
            drivers.select(target.into())?.to_string()
        };
        info!(driver = %name, "driver selected");
        self.emit(AcquisitionEvent::DriverChanged(name.clone()));
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_driver_changed(&name);
        }
        Ok(true)
    }

    /// Runs `f` on the current driver.
    ///
    /// Channel and sampling edits made while running only apply to the next run.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut dyn Driver) -> R) -> AppResult<R> {
        let mut drivers = self.control.lock();
        let driver = drivers.current_mut().ok_or(DaqError::NoDriverAvailable)?;
        Ok(f(driver))
    }

    /// Starts a run on the current driver.
    pub fn start(&self, save: bool) -> AppResult<RunInfo> {
        let mut drivers = self.control.lock();
        let state = self.state();
        if state != AcquisitionState::Idle {
            return Err(DaqError::InvalidState(format!(
                "start() called while {state}"
            )));
        }
        let driver = drivers.current_mut().ok_or(DaqError::NoDriverAvailable)?;

        self.set_state(AcquisitionState::Starting);
        self.emit(AcquisitionEvent::AboutToStart);
        match self.launch(driver, save) {
            Ok(run) => {
                self.set_state(AcquisitionState::Running);
                info!(
                    driver = %run.driver,
                    save,
                    rate_hz = run.sampling.rate_hz,
                    interval = run.sampling.interval,
                    channels = run.n_active(),
                    "acquisition running"
                );
                Ok(run)
            }
            Err(e) => {
                self.set_state(AcquisitionState::Idle);
                error!(error = %e, "acquisition failed to start");
                Err(e)
            }
        }
    }

    fn launch(&self, driver: &mut dyn Driver, save: bool) -> AppResult<RunInfo> {
        driver.prepare()?;
        self.states.reset_all();
        let run = RunInfo::capture(driver, save);
        self.emit(AcquisitionEvent::Starting { save });

        let observers = self.observers.read().clone();
        for (i, observer) in observers.iter().enumerate() {
            if let Err(e) = observer.on_starting(&run) {
                warn!(observer = observer.name(), error = %e, "observer rejected run");
                for started in &observers[..i] {
                    started.on_finishing();
                }
                return Err(e);
            }
        }

        if let Err(e) = driver.start(&self.runtime) {
            for observer in &observers {
                observer.on_finishing();
            }
            if let Err(stop_err) = driver.stop() {
                warn!(error = %stop_err, "driver cleanup after failed start");
            }
            return Err(e);
        }
        Ok(run)
    }

    /// Ends the current run and waits for the consumers.
    ///
    /// Blocks the calling thread for at most the stop timeout. A failure to
    /// stop the driver, or an error reported by a consumer, is returned after
    /// the handshake has completed and the manager is idle again.
    pub fn stop(&self) -> AppResult<StopReport> {
        let mut drivers = self.control.lock();
        let state = self.state();
        if state != AcquisitionState::Running {
            return Err(DaqError::InvalidState(format!(
                "stop() called while {state}"
            )));
        }

        self.set_state(AcquisitionState::Stopping);
        self.emit(AcquisitionEvent::AboutToFinish);
        let stopped = drivers.current_mut().map_or(Ok(()), |driver| driver.stop());
        if let Err(e) = &stopped {
            error!(error = %e, "driver failed to stop, finishing run anyway");
        }
        self.emit(AcquisitionEvent::Finishing);

        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_finishing();
        }
        let report = self.await_consumers();
        self.set_state(AcquisitionState::Idle);

        let mut errors = observers.iter().filter_map(|o| o.take_error());
        let consumer_error = errors.next();
        for extra in errors {
            warn!(error = %extra, "additional consumer error");
        }
        stopped?;
        if let Some(e) = consumer_error {
            return Err(e);
        }
        info!(
            storage_done = report.storage_done,
            view_done = report.view_done,
            waited_ms = report.waited_ms,
            "acquisition finished"
        );
        Ok(report)
    }

    fn await_consumers(&self) -> StopReport {
        let started = Instant::now();
        let deadline = started + self.stop_timeout;
        let wait = |rendezvous: &Rendezvous| {
            let done = rendezvous.wait(deadline.saturating_duration_since(Instant::now()));
            if !done {
                warn!(
                    consumer = rendezvous.name(),
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "consumer did not acknowledge finish before timeout"
                );
            }
            done
        };
        let storage_done = wait(&self.states.storage_done);
        let view_done = wait(&self.states.view_done);
        StopReport {
            storage_done,
            view_done,
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn set_state(&self, state: AcquisitionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: AcquisitionEvent) {
        debug!(?event, "acquisition event");
        let _ = self.events.send(event);
    }
}
