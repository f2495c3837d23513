//! Reflective instantiation.
//!
//! Creates registered types by name from their default state, without the
//! caller supplying constructor arguments. Uses no raw memory access.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::Runtime;
use crate::loader::UnitHandle;
use crate::unit::{CodeUnit, HookError};

pub const UNIT: &str = "reflect.Instantiator";

pub fn unit() -> CodeUnit {
    CodeUnit::new(UNIT).methods(["register", "new_instance"])
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReflectError {
    #[error("type not registered: {0}")]
    NotRegistered(String),

    #[error("instantiation refused")]
    Refused {
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Load(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, ReflectError>;

type Factory = fn() -> Box<dyn Any + Send>;

fn make<T: Default + Send + 'static>() -> Box<dyn Any + Send> {
    Box::new(T::default())
}

/// Registry of instantiable types.
pub struct Instantiator {
    unit: UnitHandle,
    factories: RwLock<HashMap<String, Factory>>,
}

impl Instantiator {
    pub fn new(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            unit: runtime.load(UNIT)?,
            factories: RwLock::new(HashMap::new()),
        })
    }

    fn enter(&self, method: &str) -> Result<()> {
        self.unit
            .enter(method)
            .map_err(|source| ReflectError::Refused { source })
    }

    /// Register `T` under its type name.
    pub fn register<T: Default + Send + 'static>(&self) -> Result<()> {
        self.register_as::<T>(type_name::<T>())
    }

    pub fn register_as<T: Default + Send + 'static>(&self, name: &str) -> Result<()> {
        self.enter("register")?;
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), make::<T>);
        Ok(())
    }

    /// Create an instance of the type registered as `name`.
    pub fn new_instance(&self, name: &str) -> Result<Box<dyn Any + Send>> {
        self.enter("new_instance")?;
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| ReflectError::NotRegistered(name.to_string()))?;
        Ok(factory())
    }

    /// Typed form of [`new_instance`](Self::new_instance) for a type
    /// registered under its own name.
    pub fn new_instance_of<T: 'static>(&self) -> Result<Box<T>> {
        let name = type_name::<T>();
        self.new_instance(name)?
            .downcast::<T>()
            .map_err(|_| ReflectError::NotRegistered(name.to_string()))
    }
}

impl fmt::Debug for Instantiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = factories.keys().collect();
        names.sort();
        f.debug_struct("Instantiator").field("types", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Config {
        retries: u32,
        name: String,
    }

    #[test]
    fn test_instantiates_registered_types() {
        let rt = Runtime::new();
        let instantiator = Instantiator::new(&rt).unwrap();
        instantiator.register::<Config>().unwrap();
        instantiator.register_as::<Vec<u8>>("bytes").unwrap();

        let config = instantiator.new_instance_of::<Config>().unwrap();
        assert_eq!(*config, Config::default());

        let bytes = instantiator.new_instance("bytes").unwrap();
        assert!(bytes.downcast_ref::<Vec<u8>>().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_types_fail() {
        let rt = Runtime::new();
        let instantiator = Instantiator::new(&rt).unwrap();
        assert!(matches!(
            instantiator.new_instance("nope"),
            Err(ReflectError::NotRegistered(_))
        ));
        instantiator.register_as::<Config>("other").unwrap();
        assert!(instantiator.new_instance_of::<Config>().is_err());
    }
}
