//! Acquisition drivers.
//!
//! A driver owns a sampling configuration and a channel registry, and produces
//! [`SampleBlock`](crate::block::SampleBlock)s on its own timer once started.
//! The lifecycle is `prepare()` → `start()` → `stop()`, repeatable across runs.
//!
//! # Architecture
//!
//! ```text
//! Driver (trait)
//!   ├─ DriverCore        name, sampling config + bounds, channels, publisher
//!   ├─ DummyDriver       sine table replayed with a circular shift
//!   └─ NiDaqDriver       hardware stub, feature gated
//!
//! Emitter                timer task publishing one block per tick
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::info;

use crate::block::BlockPublisher;
use crate::channel::ChannelRegistry;
use crate::error::{AppResult, DaqError};
use crate::parameter::{self, Configurable, ParamMode, ParamSpec};
use crate::registry::Registry;

pub mod dummy;
pub mod emitter;
pub mod nidaq;

pub use dummy::DummyDriver;
pub use emitter::{BlockSource, Emitter};
pub use nidaq::NiDaqDriver;

/// Sampling rate used until a driver is configured.
pub const DEFAULT_RATE_HZ: u64 = 10_000;
/// Block length used until a driver is configured.
pub const DEFAULT_INTERVAL: u64 = 1_000;
/// Bounds a driver accepts when it declares none.
pub const UNBOUNDED: (i64, i64) = (0, i64::MAX);
/// Shortest timer period the emitter will run with.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Rate and block length of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Samples per second per channel.
    pub rate_hz: u64,
    /// Samples per channel in each block.
    pub interval: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl SamplingConfig {
    /// Sample spacing in seconds.
    pub fn dt(&self) -> f64 {
        1.0 / self.rate_hz as f64
    }

    /// Time between blocks: `interval * 1000 / rate_hz` ms, at least [`MIN_PERIOD`].
    pub fn period(&self) -> Duration {
        let micros = self.interval.saturating_mul(1_000_000) / self.rate_hz.max(1);
        Duration::from_micros(micros).max(MIN_PERIOD)
    }
}

/// Inclusive bounds a driver accepts for [`SamplingConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingRanges {
    /// Accepted sampling rates in Hz.
    pub rate: (i64, i64),
    /// Accepted samples per block.
    pub interval: (i64, i64),
}

impl Default for SamplingRanges {
    fn default() -> Self {
        Self {
            rate: UNBOUNDED,
            interval: UNBOUNDED,
        }
    }
}

/// State every driver carries.
pub struct DriverCore {
    name: String,
    sampling: SamplingConfig,
    ranges: SamplingRanges,
    channels: ChannelRegistry,
    blocks: Arc<BlockPublisher>,
}

impl DriverCore {
    /// Core with the default sampling config and unbounded ranges.
    pub fn new(name: impl Into<String>, channels: ChannelRegistry) -> Self {
        Self {
            name: name.into(),
            sampling: SamplingConfig::default(),
            ranges: SamplingRanges::default(),
            channels,
            blocks: Arc::new(BlockPublisher::new()),
        }
    }

    /// Replaces the accepted sampling ranges.
    #[must_use]
    pub fn with_ranges(mut self, ranges: SamplingRanges) -> Self {
        self.ranges = ranges;
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current sampling configuration.
    pub fn sampling(&self) -> SamplingConfig {
        self.sampling
    }

    /// Accepted sampling ranges.
    pub fn ranges(&self) -> SamplingRanges {
        self.ranges
    }

    /// Channel registry.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Mutable channel registry.
    pub fn channels_mut(&mut self) -> &mut ChannelRegistry {
        &mut self.channels
    }

    /// Stream the driver publishes its blocks on.
    pub fn blocks(&self) -> &Arc<BlockPublisher> {
        &self.blocks
    }

    /// Validates both values against the declared bounds, then stores them.
    /// Nothing changes if either value is rejected.
    pub fn configure(&mut self, rate: i64, interval: i64) -> AppResult<()> {
        let rate_hz = positive(rate, self.ranges.rate, "sampling rate")?;
        let interval = positive(interval, self.ranges.interval, "update interval")?;
        self.sampling = SamplingConfig { rate_hz, interval };
        info!(driver = %self.name, rate_hz, interval, "sampling configured");
        Ok(())
    }

    /// Parses and sets the rate; the old value stays on failure.
    pub fn set_rate(&mut self, text: &str) -> AppResult<()> {
        let rate = parameter::validate_integer(text, self.ranges.rate, "sampling rate")?;
        self.sampling.rate_hz = positive(rate, self.ranges.rate, "sampling rate")?;
        Ok(())
    }

    /// Parses and sets the block length; the old value stays on failure.
    pub fn set_interval(&mut self, text: &str) -> AppResult<()> {
        let interval = parameter::validate_integer(text, self.ranges.interval, "update interval")?;
        self.sampling.interval = positive(interval, self.ranges.interval, "update interval")?;
        Ok(())
    }
}

fn positive(value: i64, range: (i64, i64), label: &str) -> AppResult<u64> {
    let value = parameter::check_range(value, range, label)?;
    match u64::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(DaqError::Range(format!("{label} must be positive, got {value}"))),
    }
}

impl Configurable for DriverCore {
    fn config_map(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("rate", "Sampling rate (Hz)", ParamMode::Int),
            ParamSpec::new("interval", "Update interval (Samples)", ParamMode::Int),
        ]
    }

    fn get_param(&self, key: &str) -> AppResult<String> {
        match key {
            "rate" => Ok(self.sampling.rate_hz.to_string()),
            "interval" => Ok(self.sampling.interval.to_string()),
            _ => Err(parameter::unknown_param(key)),
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> AppResult<()> {
        match key {
            "rate" => self.set_rate(value),
            "interval" => self.set_interval(value),
            _ => Err(parameter::unknown_param(key)),
        }
    }
}

/// A pluggable acquisition source.
///
/// `configure` and channel edits are only meaningful while the driver is not
/// running; the current run keeps the configuration captured by `prepare()`.
pub trait Driver: Send {
    /// Registry tag of this implementation.
    fn kind(&self) -> &'static str;

    /// Shared driver state.
    fn core(&self) -> &DriverCore;

    /// Shared driver state, mutably.
    fn core_mut(&mut self) -> &mut DriverCore;

    /// Snapshots the active channels and allocates per-run buffers.
    fn prepare(&mut self) -> AppResult<()>;

    /// Begins periodic block emission on `runtime`.
    fn start(&mut self, runtime: &Handle) -> AppResult<()>;

    /// Halts emission. No block is published after this returns.
    fn stop(&mut self) -> AppResult<()>;

    /// Whether blocks are being emitted.
    fn is_running(&self) -> bool;

    /// Display name, unique among drivers.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Current sampling configuration.
    fn sampling(&self) -> SamplingConfig {
        self.core().sampling()
    }

    /// Sample period in seconds.
    fn dt(&self) -> f64 {
        self.core().sampling().dt()
    }

    /// Validates and sets rate and block length. Applies at the next `prepare()`.
    fn configure(&mut self, rate: i64, interval: i64) -> AppResult<()> {
        self.core_mut().configure(rate, interval)
    }

    /// Channel registry.
    fn channels(&self) -> &ChannelRegistry {
        self.core().channels()
    }

    /// Mutable channel registry.
    fn channels_mut(&mut self) -> &mut ChannelRegistry {
        self.core_mut().channels_mut()
    }

    /// Stream every emitted block is published on.
    fn blocks(&self) -> Arc<BlockPublisher> {
        Arc::clone(self.core().blocks())
    }
}

/// Registry of acquisition driver factories.
pub type DriverRegistry = Registry<dyn Driver>;

/// Registry holding `dummy` and `nidaqmx`.
pub fn builtin_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new("device driver");
    registry.register(dummy::KIND, |args| {
        Ok(Box::new(DummyDriver::from_args(args)?) as Box<dyn Driver>)
    });
    registry.register(nidaq::KIND, |args| {
        Ok(Box::new(NiDaqDriver::from_args(args)?) as Box<dyn Driver>)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> DriverCore {
        DriverCore::new("Test", ChannelRegistry::with_inputs("AI", 2)).with_ranges(
            SamplingRanges {
                rate: (1, 50_000),
                interval: (1, 10_000),
            },
        )
    }

    #[test]
    fn test_default_sampling() {
        let sampling = SamplingConfig::default();
        assert_eq!(sampling.rate_hz, 10_000);
        assert_eq!(sampling.interval, 1_000);
        assert_eq!(sampling.period(), Duration::from_millis(100));
        assert!((sampling.dt() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_period_has_floor() {
        let sampling = SamplingConfig {
            rate_hz: 1_000_000,
            interval: 1,
        };
        assert_eq!(sampling.period(), MIN_PERIOD);
    }

    #[test]
    fn test_configure_out_of_range_keeps_previous() {
        let mut core = core();
        core.configure(20_000, 500).unwrap();
        let err = core.configure(60_000, 500).unwrap_err();
        assert!(matches!(err, DaqError::Range(_)));
        assert!(err.to_string().contains("Sampling rate must be >1 and <50000"));
        let err = core.configure(1_000, 0).unwrap_err();
        assert!(err.to_string().contains("Update interval"));
        assert_eq!(
            core.sampling(),
            SamplingConfig {
                rate_hz: 20_000,
                interval: 500
            }
        );
    }

    #[test]
    fn test_configure_rejects_zero_with_unbounded_ranges() {
        let mut core = DriverCore::new("Open", ChannelRegistry::new());
        let err = core.configure(0, 10).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_rate_param_round_trip() {
        let mut core = core();
        core.set_param("rate", "2000").unwrap();
        assert_eq!(core.get_param("rate").unwrap(), "2000");
        assert!(matches!(
            core.set_param("rate", "fast"),
            Err(DaqError::Validation(_))
        ));
        assert_eq!(core.sampling().rate_hz, 2000);
    }

    #[test]
    fn test_builtin_registry_kinds() {
        let registry = builtin_registry();
        assert_eq!(registry.kinds(), vec!["dummy", "nidaqmx"]);
    }
}
