//! A signal generator that needs no hardware.
//!
//! `prepare()` builds a 20000-sample sine table with one phase-shifted column
//! per active channel. Every tick emits the next `interval` rows of the table
//! and advances the read position, wrapping around at the end. Unless the
//! interval divides the table length the output shows a beat pattern, which
//! makes block boundaries easy to spot in the live view.

use std::f64::consts::{FRAC_PI_4, TAU};

use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::info;

use super::{Driver, DriverCore, Emitter, SamplingRanges};
use crate::block::SampleBlock;
use crate::channel::ChannelRegistry;
use crate::driver::emitter::BlockSource;
use crate::error::{AppResult, DaqError};
use crate::registry::parse_args;

/// Registry tag.
pub const KIND: &str = "dummy";
/// Rows in the synthetic source table.
pub const TABLE_LEN: usize = 20_000;
/// Full sine periods stored in the table.
const CYCLES_PER_TABLE: f64 = 4.0;
/// Bounds accepted for both rate and interval.
const LIMITS: (i64, i64) = (1, 1_000_000);

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DummyArgs {
    name: Option<String>,
    channels: Option<usize>,
    rate: Option<i64>,
    interval: Option<i64>,
    block_limit: Option<u64>,
}

/// Sine table replayed with a circular read position.
#[derive(Debug, Clone)]
pub struct SineTable {
    data: Vec<f64>,
    cols: usize,
    rows_per_block: usize,
    position: usize,
}

impl SineTable {
    /// Table for `cols` active channels, read `rows_per_block` rows at a time.
    pub fn new(cols: usize, rows_per_block: usize) -> Self {
        let mut data = Vec::with_capacity(TABLE_LEN * cols);
        for row in 0..TABLE_LEN {
            let theta = TAU * CYCLES_PER_TABLE * row as f64 / TABLE_LEN as f64;
            data.extend((0..cols).map(|col| (theta + col as f64 * FRAC_PI_4).sin()));
        }
        Self {
            data,
            cols,
            rows_per_block,
            position: 0,
        }
    }

    /// Row the next block starts at.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl BlockSource for SineTable {
    fn next_block(&mut self, sequence: u64) -> AppResult<SampleBlock> {
        let mut values = Vec::with_capacity(self.rows_per_block * self.cols);
        for i in 0..self.rows_per_block {
            let row = (self.position + i) % TABLE_LEN;
            values.extend_from_slice(&self.data[row * self.cols..(row + 1) * self.cols]);
        }
        self.position = (self.position + self.rows_per_block) % TABLE_LEN;
        SampleBlock::new(self.rows_per_block, self.cols, values, sequence)
    }
}

/// Hardware-free driver with channels AI0..AI3.
pub struct DummyDriver {
    core: DriverCore,
    block_limit: Option<u64>,
    prepared: Option<SineTable>,
    emitter: Option<Emitter>,
}

impl Default for DummyDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDriver {
    /// Four-channel dummy named `Dummy`.
    pub fn new() -> Self {
        Self::with_channels("Dummy", 4)
    }

    /// Dummy named `name` with `count` channels `AI0..`.
    pub fn with_channels(name: &str, count: usize) -> Self {
        let core = DriverCore::new(name, ChannelRegistry::with_inputs("AI", count)).with_ranges(
            SamplingRanges {
                rate: LIMITS,
                interval: LIMITS,
            },
        );
        Self {
            core,
            block_limit: None,
            prepared: None,
            emitter: None,
        }
    }

    /// Builds a driver from a registry entry's `args`.
    ///
    /// Recognised keys: `name`, `channels`, `rate`, `interval`, `block_limit`.
    pub fn from_args(args: &toml::Value) -> AppResult<Self> {
        let args: DummyArgs = parse_args(KIND, args)?;
        let mut driver = Self::with_channels(
            args.name.as_deref().unwrap_or("Dummy"),
            args.channels.unwrap_or(4),
        );
        if args.rate.is_some() || args.interval.is_some() {
            // defaults are within LIMITS, so they fit in i64
            let current = driver.sampling();
            driver.configure(
                args.rate.unwrap_or(current.rate_hz as i64),
                args.interval.unwrap_or(current.interval as i64),
            )?;
        }
        driver.block_limit = args.block_limit;
        Ok(driver)
    }

    /// Ends every run on its own after `limit` blocks.
    #[must_use]
    pub fn with_block_limit(mut self, limit: Option<u64>) -> Self {
        self.block_limit = limit;
        self
    }
}

impl Driver for DummyDriver {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn prepare(&mut self) -> AppResult<()> {
        if self.emitter.is_some() {
            return Err(DaqError::InvalidState(format!(
                "{} cannot prepare while running",
                self.name()
            )));
        }
        let n_active = self.channels().active_channels().len();
        let rows = usize::try_from(self.sampling().interval)
            .map_err(|_| DaqError::Range("update interval exceeds address space".into()))?;
        self.prepared = Some(SineTable::new(n_active, rows));
        info!(
            driver = %self.name(),
            n_active,
            rows,
            period_ms = self.sampling().period().as_millis() as u64,
            "driver prepared"
        );
        Ok(())
    }

    fn start(&mut self, runtime: &Handle) -> AppResult<()> {
        if self.emitter.is_some() {
            return Err(DaqError::InvalidState(format!(
                "{} is already running",
                self.name()
            )));
        }
        let table = self.prepared.take().ok_or_else(|| {
            DaqError::InvalidState(format!("{} started before prepare()", self.name()))
        })?;
        if table.cols == 0 {
            info!(driver = %self.name(), "no active channels, nothing to emit");
            return Ok(());
        }
        self.emitter = Some(Emitter::spawn(
            runtime,
            table,
            self.blocks(),
            self.sampling().period(),
            self.block_limit,
        ));
        info!(driver = %self.name(), "acquisition started");
        Ok(())
    }

    fn stop(&mut self) -> AppResult<()> {
        if let Some(emitter) = self.emitter.take() {
            emitter.halt();
            info!(driver = %self.name(), "acquisition stopped");
        }
        self.prepared = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.emitter.as_ref().is_some_and(|e| !e.is_finished())
    }
}
