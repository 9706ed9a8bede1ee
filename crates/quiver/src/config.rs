//! Validated backend configuration options. The engine core consumes these;
//! it never owns or mutates them.
//!
//! Each option is keyed by a string identifier with an access scope and a
//! change-time category. The core only reads values that already passed
//! `validate`; it never mutates configuration state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Who may set the option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionAccess {
    Public,
    Private,
}

/// When a change to the option takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionCategory {
    CompileTime,
    Runtime,
}

/// One backend setting with validation and typed parsing.
pub trait ConfigurationOption {
    type Value;

    const KEY: &'static str;
    const ACCESS: OptionAccess;
    const CATEGORY: OptionCategory;

    fn default_value() -> &'static str;

    fn validate(value: &str) -> EngineResult<()>;

    fn parse(value: &str) -> EngineResult<Self::Value>;
}

/// Maps the switch strings accepted by boolean options.
pub fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "YES" => Some(true),
        "NO" => Some(false),
        _ => None,
    }
}

/// Raw option values that already passed validation.
#[derive(Debug, Default, Clone)]
pub struct OptionMap {
    values: BTreeMap<String, String>,
}

impl OptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a value for `O`.
    pub fn set<O: ConfigurationOption>(&mut self, value: &str) -> EngineResult<()> {
        O::validate(value)?;
        self.values.insert(O::KEY.to_string(), value.to_string());
        Ok(())
    }

    /// Returns the typed value for `O`, falling back to its default.
    pub fn get<O: ConfigurationOption>(&self) -> EngineResult<O::Value> {
        match self.values.get(O::KEY) {
            Some(raw) => O::parse(raw),
            None => O::parse(O::default_value()),
        }
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Seed for the deterministic fill applied to unfed parameters.
pub struct FillSeedOption;

impl ConfigurationOption for FillSeedOption {
    type Value = u64;

    const KEY: &'static str = "engine.fill-seed";
    const ACCESS: OptionAccess = OptionAccess::Public;
    const CATEGORY: OptionCategory = OptionCategory::Runtime;

    fn default_value() -> &'static str {
        "0"
    }

    fn validate(value: &str) -> EngineResult<()> {
        Self::parse(value).map(|_| ())
    }

    fn parse(value: &str) -> EngineResult<u64> {
        value.parse::<u64>().map_err(|_| {
            EngineError::configuration(
                Self::KEY,
                format!("expected an unsigned integer, got \"{value}\""),
            )
        })
    }
}
