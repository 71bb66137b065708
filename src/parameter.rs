//! Parameter descriptors for generic form generation.
//!
//! Channels, drivers and storage targets describe their editable settings as a
//! list of [`ParamSpec`] entries. A presentation layer renders one widget per
//! entry from its [`ParamMode`] and talks to the owner exclusively through the
//! string-based [`Configurable`] accessors:
//!
//! ```rust,ignore
//! use mosca::parameter::{apply_edit, Configurable};
//!
//! for spec in channel.config_map() {
//!     println!("{}: {}", spec.label, channel.get_param(spec.key)?);
//! }
//!
//! // A rejected edit hands back the value that should be shown again.
//! if let Err(rejected) = apply_edit(&mut channel, "scale", "abc") {
//!     eprintln!("{} (restored {})", rejected.error, rejected.restored);
//! }
//! ```
//!
//! The core only guarantees that `set_param` followed by `get_param` round-trips,
//! and that an invalid value fails loudly without modifying the owner.

use serde::Serialize;

use crate::error::{AppResult, DaqError};

/// Widget kind a parameter maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamMode {
    /// Free text.
    Str,
    /// Checkbox.
    Bool,
    /// Integer field.
    Int,
    /// Floating-point field.
    Float,
    /// Directory picker.
    Dir,
    /// One value out of a fixed list.
    Choice(Vec<String>),
    /// Display only.
    Label,
}

/// Descriptor for one editable parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    /// Key passed to [`Configurable::get_param`] / [`Configurable::set_param`].
    pub key: &'static str,
    /// Human readable label.
    pub label: &'static str,
    /// Widget kind.
    pub mode: ParamMode,
    /// True when the parameter has no setter.
    pub read_only: bool,
}

impl ParamSpec {
    /// Editable parameter.
    pub fn new(key: &'static str, label: &'static str, mode: ParamMode) -> Self {
        Self {
            key,
            label,
            mode,
            read_only: false,
        }
    }

    /// Marks the parameter as read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// String-based access to a set of parameters.
pub trait Configurable {
    /// Ordered parameter descriptors.
    fn config_map(&self) -> Vec<ParamSpec>;

    /// Current value of `key`, formatted for display.
    fn get_param(&self, key: &str) -> AppResult<String>;

    /// Parses and stores `value`. On error the stored value is unchanged.
    fn set_param(&mut self, key: &str, value: &str) -> AppResult<()>;

    /// Descriptor for `key`, if any.
    fn param_spec(&self, key: &str) -> Option<ParamSpec> {
        self.config_map().into_iter().find(|spec| spec.key == key)
    }
}

/// An edit that was rejected, with the value to show again.
#[derive(Debug)]
pub struct EditRejected {
    /// Why the edit failed.
    pub error: DaqError,
    /// Current (unchanged) value of the parameter.
    pub restored: String,
}

/// Applies a user edit and returns the value to display.
///
/// Read-only parameters are rejected before the setter is consulted. On
/// failure the returned [`EditRejected`] carries the previous value so the
/// caller can revert its widget.
pub fn apply_edit<C>(target: &mut C, key: &str, text: &str) -> Result<String, EditRejected>
where
    C: Configurable + ?Sized,
{
    let outcome = match target.param_spec(key) {
        Some(spec) if spec.read_only => Err(read_only(key)),
        Some(_) => target.set_param(key, text),
        None => Err(unknown_param(key)),
    };
    match outcome {
        Ok(()) => target.get_param(key).map_err(|error| EditRejected {
            error,
            restored: String::new(),
        }),
        Err(error) => {
            tracing::warn!(param = key, value = text, %error, "parameter edit rejected");
            Err(EditRejected {
                error,
                restored: target.get_param(key).unwrap_or_default(),
            })
        }
    }
}

/// Parses an integer and checks it against an inclusive range.
///
/// ```
/// use mosca::parameter::validate_integer;
///
/// assert_eq!(validate_integer("42", (0, 100), "sampling rate").unwrap(), 42);
/// assert!(validate_integer("4x", (0, 100), "sampling rate").is_err());
/// ```
pub fn validate_integer(text: &str, range: (i64, i64), label: &str) -> AppResult<i64> {
    let value: i64 = text
        .trim()
        .parse()
        .map_err(|_| DaqError::Validation(format!("Failed to parse {label}: '{text}'")))?;
    check_range(value, range, label)
}

/// Checks an already parsed integer against an inclusive range.
pub fn check_range(value: i64, range: (i64, i64), label: &str) -> AppResult<i64> {
    let (min, max) = range;
    if value < min || value > max {
        return Err(DaqError::Range(format!(
            "{} must be >{min} and <{max}",
            capitalize(label)
        )));
    }
    Ok(value)
}

/// Parses a finite floating-point value.
pub fn parse_float(text: &str, label: &str) -> AppResult<f64> {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(DaqError::Validation(format!(
            "Failed to parse {label}: '{text}'"
        ))),
    }
}

/// Parses a checkbox value.
pub fn parse_bool(text: &str, label: &str) -> AppResult<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DaqError::Validation(format!(
            "Failed to parse {label}: '{text}'"
        ))),
    }
}

pub(crate) fn unknown_param(key: &str) -> DaqError {
    DaqError::NotFound(format!("parameter '{key}'"))
}

pub(crate) fn read_only(key: &str) -> DaqError {
    DaqError::Validation(format!(
        "parameter '{key}' is read-only: no setter is specified"
    ))
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Knob {
        gain: i64,
        serial: String,
    }

    impl Configurable for Knob {
        fn config_map(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::new("gain", "Gain", ParamMode::Int),
                ParamSpec::new("serial", "Serial", ParamMode::Label).read_only(),
            ]
        }

        fn get_param(&self, key: &str) -> AppResult<String> {
            match key {
                "gain" => Ok(self.gain.to_string()),
                "serial" => Ok(self.serial.clone()),
                _ => Err(unknown_param(key)),
            }
        }

        fn set_param(&mut self, key: &str, value: &str) -> AppResult<()> {
            match key {
                "gain" => {
                    self.gain = validate_integer(value, (1, 10), "gain")?;
                    Ok(())
                }
                "serial" => Err(read_only(key)),
                _ => Err(unknown_param(key)),
            }
        }
    }

    fn knob() -> Knob {
        Knob {
            gain: 2,
            serial: "SN-1".into(),
        }
    }

    #[test]
    fn test_validate_integer_messages() {
        let err = validate_integer("abc", (0, 10), "sampling rate").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Failed to parse sampling rate: 'abc'"
        );

        let err = validate_integer("11", (0, 10), "sampling rate").unwrap_err();
        assert!(matches!(err, DaqError::Range(_)));
        assert!(err.to_string().contains("Sampling rate must be >0 and <10"));
    }

    #[test]
    fn test_validate_integer_bounds_are_inclusive() {
        assert_eq!(validate_integer("0", (0, 10), "x").unwrap(), 0);
        assert_eq!(validate_integer(" 10 ", (0, 10), "x").unwrap(), 10);
    }

    #[test]
    fn test_parse_float_rejects_non_finite() {
        assert!(parse_float("inf", "scale").is_err());
        assert!(parse_float("NaN", "scale").is_err());
        assert_eq!(parse_float("2.5", "scale").unwrap(), 2.5);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("Yes", "in use").unwrap());
        assert!(!parse_bool("0", "in use").unwrap());
        assert!(parse_bool("maybe", "in use").is_err());
    }

    #[test]
    fn test_apply_edit_round_trip() {
        let mut k = knob();
        assert_eq!(apply_edit(&mut k, "gain", "7").unwrap(), "7");
        assert_eq!(k.gain, 7);
    }

    #[test]
    fn test_apply_edit_restores_previous_value() {
        let mut k = knob();
        let rejected = apply_edit(&mut k, "gain", "99").unwrap_err();
        assert!(matches!(rejected.error, DaqError::Range(_)));
        assert_eq!(rejected.restored, "2");
        assert_eq!(k.gain, 2);
    }

    #[test]
    fn test_apply_edit_read_only_and_unknown() {
        let mut k = knob();
        let rejected = apply_edit(&mut k, "serial", "SN-2").unwrap_err();
        assert!(rejected.error.to_string().contains("read-only"));
        assert_eq!(rejected.restored, "SN-1");

        let rejected = apply_edit(&mut k, "missing", "1").unwrap_err();
        assert!(matches!(rejected.error, DaqError::NotFound(_)));
    }
}
