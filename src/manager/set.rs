//! Ordered, selectable collection of drivers.
//!
//! Shared by the acquisition and storage managers. Registration order is
//! stable for the life of the process, so indices can be used to keep a
//! selection widget in sync.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::config::DriverEntry;
use crate::error::{AppResult, DaqError};

/// Anything a [`DriverSet`] can hold.
pub trait Selectable {
    /// Name the driver is selected by.
    fn key(&self) -> &str;
}

/// Driver selection by name or registration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRef<'a> {
    /// By name.
    Name(&'a str),
    /// By registration index.
    Index(usize),
}

impl<'a> From<&'a str> for DriverRef<'a> {
    fn from(name: &'a str) -> Self {
        DriverRef::Name(name)
    }
}

impl<'a> From<&'a String> for DriverRef<'a> {
    fn from(name: &'a String) -> Self {
        DriverRef::Name(name)
    }
}

impl From<usize> for DriverRef<'_> {
    fn from(index: usize) -> Self {
        DriverRef::Index(index)
    }
}

/// Drivers in registration order plus the current selection.
///
/// `current` is `Some` as soon as one driver has been added and always
/// indexes into `drivers`.
pub struct DriverSet<D: ?Sized> {
    label: &'static str,
    drivers: Vec<Box<D>>,
    current: Option<usize>,
}

impl<D: ?Sized + Selectable> DriverSet<D> {
    /// Empty set; `label` names it in errors and logs.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            drivers: Vec::new(),
            current: None,
        }
    }

    /// Name used in errors and logs.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Appends a driver. The first driver added becomes current.
    pub fn add(&mut self, driver: Box<D>) -> AppResult<usize> {
        if self.position(driver.key()).is_some() {
            return Err(DaqError::DuplicateName(driver.key().to_string()));
        }
        self.drivers.push(driver);
        let index = self.drivers.len() - 1;
        self.current.get_or_insert(index);
        Ok(index)
    }

    /// Instantiates configuration entries in order.
    ///
    /// Entries that fail to construct or collide with an existing name are
    /// skipped with a warning. The first entry marked `default` that loads
    /// becomes current. Returns the number of drivers added.
    pub fn load<F>(&mut self, entries: &[DriverEntry], mut create: F) -> usize
    where
        F: FnMut(&DriverEntry) -> AppResult<Box<D>>,
    {
        let mut loaded = 0;
        let mut default_chosen = false;
        for entry in entries {
            let added = create(entry).and_then(|driver| self.add(driver));
            match added {
                Ok(index) => {
                    loaded += 1;
                    if entry.default && !default_chosen {
                        self.current = Some(index);
                        default_chosen = true;
                    }
                    info!(set = self.label, kind = %entry.kind, driver = %self.drivers[index].key(), "driver registered");
                }
                Err(e) => {
                    warn!(set = self.label, kind = %entry.kind, error = %e, "skipping driver entry");
                }
            }
        }
        loaded
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.drivers.iter().map(|d| d.key().to_string()).collect()
    }

    /// Currently selected member.
    pub fn current(&self) -> Option<&D> {
        self.current.and_then(|i| self.drivers.get(i)).map(|d| &**d)
    }

    /// Currently selected member, mutably.
    pub fn current_mut(&mut self) -> Option<&mut D> {
        match self.current {
            Some(i) => self.drivers.get_mut(i).map(|d| &mut **d),
            None => None,
        }
    }

    /// Name of the current member.
    pub fn current_name(&self) -> Option<&str> {
        self.current().map(Selectable::key)
    }

    /// Member by key.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut D> {
        let index = self.position(name)?;
        self.drivers.get_mut(index).map(|d| &mut **d)
    }

    /// Makes `target` current and returns its name.
    pub fn select(&mut self, target: DriverRef<'_>) -> AppResult<&str> {
        let index = self.resolve(target)?;
        self.current = Some(index);
        Ok(self.drivers[index].key())
    }

    /// Registration index of `name`, or of the current driver when `None`.
    pub fn index_of(&self, name: Option<&str>) -> Option<usize> {
        match name {
            Some(name) => self.position(name),
            None => self.current,
        }
    }

    /// Members in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.drivers.iter().map(|d| &**d)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    fn resolve(&self, target: DriverRef<'_>) -> AppResult<usize> {
        match target {
            DriverRef::Name(name) => self
                .position(name)
                .ok_or_else(|| DaqError::NotFound(format!("{} driver '{name}'", self.label))),
            DriverRef::Index(index) if index < self.drivers.len() => Ok(index),
            DriverRef::Index(index) => Err(DaqError::NotFound(format!(
                "{} driver index {index}",
                self.label
            ))),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.drivers.iter().position(|d| d.key() == name)
    }
}

/// Holds a manager's `switching` flag for the duration of a driver change.
pub(crate) struct SwitchGuard<'a>(&'a AtomicBool);

impl<'a> SwitchGuard<'a> {
    /// `None` when a change is already in progress.
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
