//! Static factory registries keyed by a driver kind tag.
//!
//! Configuration names implementations by tag (`kind = "dummy"`); the registry
//! maps each tag to a constructor taking the entry's free-form `args` table.
//! Unknown tags are reported as [`DaqError::NotFound`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::{AppResult, DaqError};

/// Constructor for one implementation of `T`.
pub type Factory<T> = Box<dyn Fn(&toml::Value) -> AppResult<Box<T>> + Send + Sync>;

/// Tag-to-factory map for trait objects of type `T`.
pub struct Registry<T: ?Sized> {
    what: &'static str,
    factories: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    /// Empty registry; `what` names the product in error messages.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            factories: HashMap::new(),
        }
    }

    /// Registers (or replaces) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Value) -> AppResult<Box<T>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Builds a `kind` from `args`. Unknown kinds are `NotFound`.
    pub fn create(&self, kind: &str, args: &toml::Value) -> AppResult<Box<T>> {
        self.factories
            .get(kind)
            .ok_or_else(|| DaqError::NotFound(format!("{} kind '{kind}'", self.what)))
            .and_then(|factory| factory(args))
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered tags, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Deserializes a factory's `args` table.
pub fn parse_args<A: DeserializeOwned>(kind: &str, args: &toml::Value) -> AppResult<A> {
    args.clone()
        .try_into()
        .map_err(|e| DaqError::Configuration(format!("invalid arguments for '{kind}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    trait Shape {
        fn sides(&self) -> u32;
    }

    struct Polygon(u32);

    impl Shape for Polygon {
        fn sides(&self) -> u32 {
            self.0
        }
    }

    #[derive(Deserialize)]
    struct PolygonArgs {
        sides: u32,
    }

    fn registry() -> Registry<dyn Shape> {
        let mut reg: Registry<dyn Shape> = Registry::new("shape");
        reg.register("polygon", |args| {
            let args: PolygonArgs = parse_args("polygon", args)?;
            Ok(Box::new(Polygon(args.sides)) as Box<dyn Shape>)
        });
        reg
    }

    #[test]
    fn test_create_known_kind() {
        let args = toml::Value::Table(toml::toml! { sides = 5 });
        let shape = registry().create("polygon", &args).unwrap();
        assert_eq!(shape.sides(), 5);
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        let args = toml::Value::Table(toml::map::Map::new());
        let err = registry().create("circle", &args).err().unwrap();
        assert_eq!(err.to_string(), "Not found: shape kind 'circle'");
    }

    #[test]
    fn test_bad_args_are_configuration_errors() {
        let args = toml::Value::Table(toml::toml! { sides = "many" });
        let err = registry().create("polygon", &args).err().unwrap();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}
