//! National Instruments DAQmx driver placeholder.
//!
//! Registers under `nidaqmx` so configurations that name it load and show up
//! in driver lists. Without the `nidaqmx` feature `prepare()` reports the
//! feature as disabled; with it, the missing backend is reported instead.

use serde::Deserialize;
use tokio::runtime::Handle;

use super::{Driver, DriverCore, SamplingRanges};
use crate::channel::ChannelRegistry;
use crate::error::{AppResult, DaqError};
use crate::registry::parse_args;

/// Registry tag.
pub const KIND: &str = "nidaqmx";
const FEATURE: &str = "nidaqmx";
/// Aggregate rate limit of the supported M-series boards.
const RATE_LIMITS: (i64, i64) = (1, 250_000);

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NiDaqArgs {
    name: Option<String>,
    device: Option<String>,
}

/// NI-DAQmx device. Channels and ranges are real; acquisition is not built in.
pub struct NiDaqDriver {
    core: DriverCore,
    device: String,
}

impl NiDaqDriver {
    /// Driver named `name` for `device`.
    pub fn new(name: &str, device: &str) -> Self {
        let core = DriverCore::new(name, ChannelRegistry::with_inputs("AI", 8)).with_ranges(
            SamplingRanges {
                rate: RATE_LIMITS,
                interval: super::UNBOUNDED,
            },
        );
        Self {
            core,
            device: device.to_string(),
        }
    }

    /// Builds from `{name, device}` args.
    pub fn from_args(args: &toml::Value) -> AppResult<Self> {
        let args: NiDaqArgs = parse_args(KIND, args)?;
        Ok(Self::new(
            args.name.as_deref().unwrap_or("NI-DAQmx"),
            args.device.as_deref().unwrap_or("Dev1"),
        ))
    }

    /// Device identifier, e.g. `Dev1`.
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Driver for NiDaqDriver {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    #[cfg(not(feature = "nidaqmx"))]
    fn prepare(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled(FEATURE.to_string()))
    }

    #[cfg(feature = "nidaqmx")]
    fn prepare(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureIncomplete(
            FEATURE.to_string(),
            format!("No DAQmx task backend for device {}.", self.device),
        ))
    }

    fn start(&mut self, _runtime: &Handle) -> AppResult<()> {
        Err(DaqError::InvalidState(format!(
            "{} started before prepare()",
            self.name()
        )))
    }

    fn stop(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_and_ranges() {
        let driver = NiDaqDriver::new("NI", "Dev2");
        assert_eq!(driver.channels().len(), 8);
        assert_eq!(driver.device(), "Dev2");
        assert_eq!(driver.core().ranges().rate, (1, 250_000));
    }

    #[test]
    fn test_prepare_reports_missing_backend() {
        let mut driver = NiDaqDriver::new("NI", "Dev1");
        let err = driver.prepare().unwrap_err();
        assert!(err.to_string().contains("nidaqmx"));
        assert!(driver.stop().is_ok());
    }
}
