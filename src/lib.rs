//! Multi-channel data acquisition.
//!
//! A [`driver::Driver`] produces fixed-size [`block::SampleBlock`]s on its own
//! timer. The [`manager::DriverManager`] runs the start/stop state machine and
//! fans every block out to two consumers: the [`storage::StorageManager`],
//! which records runs to NPY files, and the [`view::ViewManager`], which keeps
//! a rolling window of scaled traces. `stop()` waits on one
//! [`rendezvous::Rendezvous`] per consumer before returning.
//!
//! [`context::DaqContext`] owns all of the above and is the entry point for
//! applications.

pub mod block;
pub mod channel;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod manager;
pub mod parameter;
pub mod registry;
pub mod rendezvous;
pub mod storage;
pub mod view;

pub use context::DaqContext;
pub use error::{AppResult, DaqError};
