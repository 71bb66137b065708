//! Channel descriptors and the per-driver channel registry.
//!
//! The registry keeps channels in registration order. That order, filtered to
//! the channels marked `in_use`, is the column order of every sample block a
//! driver emits for the run.
//!
//! The registry itself is not synchronised. It must only be edited while the
//! owning driver is not running; the driver snapshots the active channels in
//! `prepare()`.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::parameter::{self, Configurable, ParamMode, ParamSpec};

/// Input range reported for channels that do not declare one.
pub const DEFAULT_INPUT_RANGE: &str = "±10 V";
/// Unit reported for channels that do not declare one.
pub const DEFAULT_UNIT: &str = "V";

/// One analog input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    name: String,
    label: String,
    in_use: bool,
    input_range: String,
    unit: String,
    scale: f64,
}

impl Channel {
    /// Disabled channel with default range, unit and unit scale.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            in_use: false,
            input_range: DEFAULT_INPUT_RANGE.to_string(),
            unit: DEFAULT_UNIT.to_string(),
            scale: 1.0,
        }
    }

    /// Builder-style enable flag.
    #[must_use]
    pub fn enabled(mut self, in_use: bool) -> Self {
        self.in_use = in_use;
        self
    }

    /// Builder-style input range.
    #[must_use]
    pub fn with_input_range(mut self, input_range: impl Into<String>) -> Self {
        self.input_range = input_range.into();
        self
    }

    /// Unique key within the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Label as configured; may be empty.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Label, or the channel name when no label is set.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }

    /// Whether the channel is acquired.
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Device input range, e.g. `-10,10`.
    pub fn input_range(&self) -> &str {
        &self.input_range
    }

    /// Physical unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Multiplier from raw device units to `unit`.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Enables or disables the channel.
    pub fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    /// Sets the display label.
    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    /// Sets the physical unit.
    pub fn set_unit(&mut self, unit: &str) {
        self.unit = unit.to_string();
    }

    /// Sets the input range.
    pub fn set_input_range(&mut self, input_range: &str) {
        self.input_range = input_range.to_string();
    }

    /// Parses and stores the scale. Non-numeric or non-finite input leaves
    /// the current scale untouched.
    pub fn set_scale(&mut self, text: &str) -> AppResult<()> {
        self.scale = parameter::parse_float(text, "scale")?;
        Ok(())
    }
}

impl Configurable for Channel {
    fn config_map(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("name", "Name", ParamMode::Label).read_only(),
            ParamSpec::new("label", "Label", ParamMode::Str),
            ParamSpec::new("in_use", "In use", ParamMode::Bool),
            ParamSpec::new("input_range", "Input range", ParamMode::Str),
            ParamSpec::new("unit", "Unit", ParamMode::Str),
            ParamSpec::new("scale", "Scale (Unit/V_in)", ParamMode::Float),
        ]
    }

    fn get_param(&self, key: &str) -> AppResult<String> {
        Ok(match key {
            "name" => self.name.clone(),
            "label" => self.label.clone(),
            "in_use" => self.in_use.to_string(),
            "input_range" => self.input_range.clone(),
            "unit" => self.unit.clone(),
            "scale" => self.scale.to_string(),
            _ => return Err(parameter::unknown_param(key)),
        })
    }

    fn set_param(&mut self, key: &str, value: &str) -> AppResult<()> {
        match key {
            "name" => return Err(parameter::read_only(key)),
            "label" => self.set_label(value),
            "in_use" => self.in_use = parameter::parse_bool(value, "in use")?,
            "input_range" => self.set_input_range(value),
            "unit" => self.set_unit(value),
            "scale" => self.set_scale(value)?,
            _ => return Err(parameter::unknown_param(key)),
        }
        Ok(())
    }
}

/// Ordered set of channels keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    /// Registry without channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with channels `{prefix}0..{prefix}{count-1}`, all disabled.
    pub fn with_inputs(prefix: &str, count: usize) -> Self {
        Self {
            channels: (0..count)
                .map(|i| Channel::new(format!("{prefix}{i}")))
                .collect(),
        }
    }

    /// Appends `channel` under its name.
    pub fn add(&mut self, channel: Channel) -> AppResult<()> {
        if self.get(channel.name()).is_some() {
            return Err(DaqError::DuplicateName(channel.name().to_string()));
        }
        self.channels.push(channel);
        Ok(())
    }

    /// Channel by name.
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|ch| ch.name == name)
    }

    /// Mutable access for generic parameter editing.
    pub fn get_mut(&mut self, name: &str) -> AppResult<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|ch| ch.name == name)
            .ok_or_else(|| DaqError::NotFound(format!("channel '{name}'")))
    }

    /// Channel at registration position `index`.
    pub fn get_index(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Enables or disables `name`. Fails with `NotFound` for unknown channels.
    pub fn set_in_use(&mut self, name: &str, in_use: bool) -> AppResult<()> {
        self.get_mut(name)?.set_in_use(in_use);
        Ok(())
    }

    /// Sets the label of `name`.
    pub fn set_label(&mut self, name: &str, label: &str) -> AppResult<()> {
        self.get_mut(name)?.set_label(label);
        Ok(())
    }

    /// Parses and sets the scale of `name`; the old value stays on failure.
    pub fn set_scale(&mut self, name: &str, scale: &str) -> AppResult<()> {
        self.get_mut(name)?.set_scale(scale)
    }

    /// Sets the unit of `name`.
    pub fn set_unit(&mut self, name: &str, unit: &str) -> AppResult<()> {
        self.get_mut(name)?.set_unit(unit);
        Ok(())
    }

    /// Sets the input range of `name`.
    pub fn set_range(&mut self, name: &str, input_range: &str) -> AppResult<()> {
        self.get_mut(name)?.set_input_range(input_range);
        Ok(())
    }

    /// Channels with `in_use == true`, in registration order.
    pub fn active_channels(&self) -> Vec<&Channel> {
        self.channels.iter().filter(|ch| ch.in_use).collect()
    }

    /// Channels in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Channel names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.channels.iter().map(Channel::name).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
