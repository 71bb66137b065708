//! The process-wide owner of the acquisition pipeline.
//!
//! `DaqContext` builds the tokio runtime, the completion rendezvous and the
//! three managers from [`Settings`], wires the storage and view consumers into
//! the driver manager and exposes a synchronous API on top. Components receive
//! what they need from here; nothing is reached through globals.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::config::Settings;
use crate::driver::{self, DriverRegistry};
use crate::error::{AppResult, DaqError};
use crate::manager::{DriverManager, RunInfo, StopReport};
use crate::rendezvous::AcquisitionStates;
use crate::storage::{self, StorageManager, StorageRegistry};
use crate::view::ViewManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-wide owner of the runtime and the managers.
pub struct DaqContext {
    runtime: Runtime,
    settings: Settings,
    states: AcquisitionStates,
    devices: Arc<DriverManager>,
    storage: Arc<StorageManager>,
    view: Arc<ViewManager>,
}

impl DaqContext {
    /// Context with the built-in driver and storage kinds.
    pub fn new(settings: Settings) -> AppResult<Self> {
        Self::with_registries(settings, &driver::builtin_registry(), &storage::builtin_registry())
    }

    /// Context whose `[[devices]]` and `[[storages]]` resolve against the
    /// given registries.
    pub fn with_registries(
        settings: Settings,
        devices: &DriverRegistry,
        storages: &StorageRegistry,
    ) -> AppResult<Self> {
        settings.validate()?;
        let runtime = Builder::new_multi_thread()
            .thread_name("mosca-worker")
            .enable_all()
            .build()
            .map_err(DaqError::Tokio)?;
        let states = AcquisitionStates::new();

        let device_manager = Arc::new(DriverManager::new(
            states.clone(),
            runtime.handle().clone(),
            settings.acquisition.stop_timeout(),
        ));
        let loaded = device_manager.load_drivers(&settings.devices, devices);
        if loaded == 0 {
            warn!("no acquisition driver could be loaded");
        }

        let storage = Arc::new(StorageManager::new(
            Arc::clone(&states.storage_done),
            runtime.handle().clone(),
        ));
        storage.load_drivers(&settings.storages, storages, &settings.storage_defaults());

        let view = Arc::new(ViewManager::new(
            settings.view.clone(),
            Arc::clone(&states.view_done),
            runtime.handle().clone(),
            settings.acquisition.subscriber_capacity,
        ));

        device_manager.add_observer(storage.clone());
        device_manager.add_observer(view.clone());
        info!(
            devices = ?device_manager.get_drivers(),
            storages = ?storage.get_drivers(),
            "acquisition context ready"
        );

        Ok(Self {
            runtime,
            settings,
            states,
            devices: device_manager,
            storage,
            view,
        })
    }

    /// Settings the context was built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Storage and view completion rendezvous.
    pub fn states(&self) -> &AcquisitionStates {
        &self.states
    }

    /// Acquisition driver manager.
    pub fn devices(&self) -> &Arc<DriverManager> {
        &self.devices
    }

    /// Storage manager.
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Live view manager.
    pub fn view(&self) -> &Arc<ViewManager> {
        &self.view
    }

    /// Runtime the drivers and consumers run on.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Starts a run on the current driver. See [`DriverManager::start`].
    pub fn start(&self, save: bool) -> AppResult<RunInfo> {
        self.devices.start(save)
    }

    /// Stops the running acquisition. See [`DriverManager::stop`].
    pub fn stop(&self) -> AppResult<StopReport> {
        self.devices.stop()
    }

    /// Stops a run still in progress and shuts the runtime down.
    pub fn shutdown(self) -> AppResult<()> {
        let stopped = if self.devices.state() == crate::manager::AcquisitionState::Running {
            self.devices.stop().map(|_| ())
        } else {
            Ok(())
        };
        self.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        info!("acquisition context shut down");
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_stop_timeout(Duration::from_secs(1));
        settings.storage.directory = dir.path().to_path_buf();
        let ctx = DaqContext::new(settings).unwrap();
        assert_eq!(ctx.devices().get_drivers(), vec!["Dummy"]);
        assert_eq!(ctx.storage().get_drivers(), vec!["NumPy Binary"]);
        assert_eq!(
            ctx.storage().next_path().unwrap(),
            dir.path().join("wave_001.npy")
        );
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::with_stop_timeout(Duration::from_secs(1));
        settings.view.redraw_chunk = 0;
        assert!(matches!(
            DaqContext::new(settings),
            Err(DaqError::Configuration(_))
        ));
    }
}
