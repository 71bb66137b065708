//! Recording acquisitions to disk.
//!
//! A [`StorageDriver`] knows where files go ([`StorageTarget`]) and how to
//! open a [`BlockSink`] for one run. The [`StorageManager`] selects among the
//! configured storage drivers and takes part in every run as an
//! acquisition observer.

use std::path::{Path, PathBuf};

use crate::block::SampleBlock;
use crate::config::StorageSettings;
use crate::error::{AppResult, DaqError};
use crate::manager::{RunInfo, Selectable};
use crate::parameter::{self, Configurable, ParamMode, ParamSpec};
use crate::registry::Registry;

pub mod manager;
pub mod npy;
pub mod numpy;

pub use manager::StorageManager;
pub use npy::{read_npy, NpyArray, NpyWriter};
pub use numpy::NpyStorage;

/// Bounds for the acquisition number.
pub const ACQNO_RANGE: (i64, i64) = (-i64::MAX, i64::MAX);

/// Directory, basename and run number that name the next file.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageTarget {
    /// Directory files are written to.
    pub directory: PathBuf,
    /// File name prefix.
    pub basename: String,
    /// Acquisition number of the next file.
    pub acqno: i64,
}

impl Default for StorageTarget {
    fn default() -> Self {
        Self::from(&StorageSettings::default())
    }
}

impl From<&StorageSettings> for StorageTarget {
    fn from(settings: &StorageSettings) -> Self {
        Self {
            directory: settings.directory.clone(),
            basename: settings.basename.clone(),
            acqno: settings.acqno,
        }
    }
}

impl StorageTarget {
    /// `{directory}/{basename}_{acqno:03}.{ext}`
    pub fn file_path(&self, ext: &str) -> PathBuf {
        self.directory
            .join(format!("{}_{:03}.{ext}", self.basename, self.acqno))
    }

    /// Moves on to the next acquisition number.
    pub fn advance(&mut self) {
        self.acqno = self.acqno.saturating_add(1).min(ACQNO_RANGE.1);
    }

    /// Sets the output directory.
    pub fn set_directory(&mut self, directory: impl AsRef<Path>) {
        self.directory = directory.as_ref().to_path_buf();
    }
}

impl Configurable for StorageTarget {
    fn config_map(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("directory", "Directory", ParamMode::Dir),
            ParamSpec::new("basename", "Basename", ParamMode::Str),
            ParamSpec::new("acqno", "Acquisition number", ParamMode::Int),
        ]
    }

    fn get_param(&self, key: &str) -> AppResult<String> {
        match key {
            "directory" => Ok(self.directory.display().to_string()),
            "basename" => Ok(self.basename.clone()),
            "acqno" => Ok(self.acqno.to_string()),
            _ => Err(parameter::unknown_param(key)),
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> AppResult<()> {
        match key {
            "directory" => {
                self.set_directory(value);
                Ok(())
            }
            "basename" => {
                let value = value.trim();
                if value.is_empty() {
                    return Err(DaqError::Validation("Basename must not be empty".into()));
                }
                self.basename = value.to_string();
                Ok(())
            }
            "acqno" => {
                self.acqno = parameter::validate_integer(value, ACQNO_RANGE, "acquisition number")?;
                Ok(())
            }
            _ => Err(parameter::unknown_param(key)),
        }
    }
}

/// Where the blocks of one run went.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SinkSummary {
    /// File that was written.
    pub path: PathBuf,
    /// Rows declared in the finalized header.
    pub rows: u64,
    /// Columns, one per active channel.
    pub cols: usize,
}

/// Receives the blocks of one run.
pub trait BlockSink: Send {
    /// Appends one block.
    fn write_block(&mut self, block: &SampleBlock) -> AppResult<()>;

    /// Completes the file. Called once, also after a failed write.
    fn finalize(self: Box<Self>) -> AppResult<SinkSummary>;
}

/// A storage backend.
pub trait StorageDriver: Send {
    /// Registry tag.
    fn kind(&self) -> &'static str;

    /// Display name, unique among storage drivers.
    fn name(&self) -> &str;

    /// Where the next file goes.
    fn target(&self) -> &StorageTarget;

    /// Where the next file goes, mutably.
    fn target_mut(&mut self) -> &mut StorageTarget;

    /// Opens the sink for a run, creating the target directory if needed.
    fn open(&mut self, run: &RunInfo) -> AppResult<Box<dyn BlockSink>>;
}

impl Selectable for dyn StorageDriver {
    fn key(&self) -> &str {
        self.name()
    }
}

/// Storage backends by kind.
pub type StorageRegistry = Registry<dyn StorageDriver>;

/// Registry with the storage backends compiled into this crate.
pub fn builtin_registry() -> StorageRegistry {
    let mut registry = StorageRegistry::new("storage");
    registry.register(numpy::KIND, |args| {
        Ok(Box::new(NpyStorage::from_args(args)?) as Box<dyn StorageDriver>)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_zero_padded() {
        let target = StorageTarget {
            directory: PathBuf::from("/data"),
            basename: "wave".into(),
            acqno: 7,
        };
        assert_eq!(target.file_path("npy"), PathBuf::from("/data/wave_007.npy"));
        let target = StorageTarget {
            acqno: 1234,
            ..target
        };
        assert_eq!(target.file_path("npy"), PathBuf::from("/data/wave_1234.npy"));
    }

    #[test]
    fn test_acqno_validation() {
        let mut target = StorageTarget::default();
        target.set_param("acqno", "42").unwrap();
        assert_eq!(target.acqno, 42);

        let err = target.set_param("acqno", "forty").unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
        assert_eq!(target.get_param("acqno").unwrap(), "42");
        assert!(target.set_param("basename", "  ").is_err());
        assert_eq!(target.basename, "wave");
    }

    #[test]
    fn test_descriptors() {
        let target = StorageTarget::default();
        let labels: Vec<_> = target.config_map().iter().map(|s| s.label).collect();
        assert_eq!(labels, vec!["Directory", "Basename", "Acquisition number"]);
        assert_eq!(target.param_spec("directory").unwrap().mode, ParamMode::Dir);
    }

    #[test]
    fn test_advance() {
        let mut target = StorageTarget::default();
        target.advance();
        assert_eq!(target.acqno, 2);
        target.acqno = i64::MAX;
        target.advance();
        assert_eq!(target.acqno, i64::MAX);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert_eq!(registry.kinds(), vec!["numpy"]);
        let empty = toml::Value::Table(toml::map::Map::new());
        let storage = registry.create("numpy", &empty).unwrap();
        assert_eq!(storage.name(), "NumPy Binary");
        assert!(registry.create("hdf5", &empty).is_err());
    }
}
