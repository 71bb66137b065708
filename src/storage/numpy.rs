//! `numpy` storage backend: one `.npy` file per run.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{error, info};

use super::npy::{NpyWriter, EXTENSION};
use super::{BlockSink, SinkSummary, StorageDriver, StorageTarget};
use crate::block::SampleBlock;
use crate::config::StorageSettings;
use crate::error::{AppResult, DaqError};
use crate::manager::RunInfo;
use crate::registry::parse_args;

/// Registry tag.
pub const KIND: &str = "numpy";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NpyArgs {
    name: Option<String>,
    directory: PathBuf,
    basename: String,
    acqno: i64,
    flush_every_block: bool,
}

impl Default for NpyArgs {
    fn default() -> Self {
        let settings = StorageSettings::default();
        Self {
            name: None,
            directory: settings.directory,
            basename: settings.basename,
            acqno: settings.acqno,
            flush_every_block: settings.flush_every_block,
        }
    }
}

/// Writes NPY v1.0 files named `{basename}_{acqno:03}.npy`.
pub struct NpyStorage {
    name: String,
    target: StorageTarget,
    flush_every_block: bool,
}

impl Default for NpyStorage {
    fn default() -> Self {
        Self::new(StorageTarget::default())
    }
}

impl NpyStorage {
    /// Backend writing to `target`, flushing after every block.
    pub fn new(target: StorageTarget) -> Self {
        Self {
            name: "NumPy Binary".to_string(),
            target,
            flush_every_block: true,
        }
    }

    /// Builds from `[[storages]]` args over the `[storage]` defaults.
    pub fn from_args(args: &toml::Value) -> AppResult<Self> {
        let args: NpyArgs = parse_args(KIND, args)?;
        if args.basename.trim().is_empty() {
            return Err(DaqError::Configuration(
                "numpy storage basename must not be empty".into(),
            ));
        }
        let mut storage = Self::new(StorageTarget {
            directory: args.directory,
            basename: args.basename,
            acqno: args.acqno,
        })
        .with_flush_every_block(args.flush_every_block);
        if let Some(name) = args.name {
            storage.name = name;
        }
        Ok(storage)
    }

    /// With `false`, data reaches the file when the write buffer fills or the
    /// run ends.
    #[must_use]
    pub fn with_flush_every_block(mut self, flush: bool) -> Self {
        self.flush_every_block = flush;
        self
    }
}

impl StorageDriver for NpyStorage {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> &StorageTarget {
        &self.target
    }

    fn target_mut(&mut self) -> &mut StorageTarget {
        &mut self.target
    }

    fn open(&mut self, run: &RunInfo) -> AppResult<Box<dyn BlockSink>> {
        fs::create_dir_all(&self.target.directory).map_err(|e| {
            error!(directory = %self.target.directory.display(), error = %e, "cannot create storage directory");
            DaqError::Storage(e)
        })?;
        let path = self.target.file_path(EXTENSION);
        let file = File::create(&path).map_err(|e| {
            error!(path = %path.display(), error = %e, "cannot create data file");
            DaqError::Storage(e)
        })?;
        let writer = NpyWriter::create(BufWriter::new(file), run.n_active())?;
        info!(
            path = %path.display(),
            cols = run.n_active(),
            flush_every_block = self.flush_every_block,
            "recording started"
        );
        Ok(Box::new(NpySink {
            writer,
            scales: run.scales(),
            flush_every_block: self.flush_every_block,
            path,
        }))
    }
}

struct NpySink {
    writer: NpyWriter<BufWriter<File>>,
    scales: Vec<f64>,
    flush_every_block: bool,
    path: PathBuf,
}

impl BlockSink for NpySink {
    fn write_block(&mut self, block: &SampleBlock) -> AppResult<()> {
        self.writer.write_block(block, &self.scales)?;
        if self.flush_every_block {
            self.writer.get_mut().flush()?;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> AppResult<SinkSummary> {
        let rows = self.writer.rows();
        let cols = self.writer.cols();
        let file = self
            .writer
            .finish()?
            .into_inner()
            .map_err(|e| DaqError::Storage(e.into_error()))?;
        file.sync_data()?;
        info!(path = %self.path.display(), rows, cols, "recording finalized");
        Ok(SinkSummary {
            path: self.path,
            rows,
            cols,
        })
    }
}
