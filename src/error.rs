//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by every part of
//! the acquisition pipeline. Using the `thiserror` crate, it provides a single
//! place where failures from parameter editing, driver lifecycle, storage I/O and
//! configuration loading are described.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: a parameter value could not be parsed (e.g. a non-numeric
//!   channel scale). Callers at the edit site restore the previous value.
//! - **`Range`**: a value parsed but falls outside the bounds a driver declares.
//! - **`DuplicateName`** / **`NotFound`**: registry collisions and failed lookups
//!   for channels, drivers and parameters.
//! - **`Storage`**: wraps `std::io::Error` raised while writing acquisition files.
//! - **`NoDriverAvailable`**: an acquisition was requested with no driver selected.
//! - **`InvalidState`**: a lifecycle call arrived in the wrong acquisition state.
//! - **`FeatureNotEnabled`**: the requested backend was not compiled in.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! so the `?` operator works across the crate.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the acquisition pipeline can report.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but contains semantically invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A parameter value could not be parsed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A parameter value lies outside the declared bounds.
    #[error("Range error: {0}")]
    Range(String),

    /// A channel or driver name is already registered.
    #[error("Duplicate name: '{0}'")]
    DuplicateName(String),

    /// A channel, driver or parameter lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// File I/O failure while persisting an acquisition.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Failure inside a driver's lifecycle call.
    #[error("Driver error: {0}")]
    Driver(String),

    /// `start()` was requested but no driver is registered.
    #[error("No acquisition driver available")]
    NoDriverAvailable,

    /// A lifecycle operation was called in the wrong state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The async runtime could not be created.
    #[error("Tokio runtime error: {0}")]
    Tokio(std::io::Error),

    /// Functionality gated behind a cargo feature that is not enabled.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Functionality gated behind a cargo feature that has no backend yet.
    #[error("Feature '{0}' is enabled but not yet implemented. {1}")]
    FeatureIncomplete(String, String),
}
