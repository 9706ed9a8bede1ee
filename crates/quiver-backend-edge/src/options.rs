//! Configuration owned by the edge backend.

use quiver::config::{parse_switch, ConfigurationOption, OptionAccess, OptionCategory};
use quiver::error::{EngineError, EngineResult};

/// Keeps data ports in plain row-major layout instead of the NPU's blocked
/// layout. Diagnostic switch; not part of the public surface.
pub struct DisableLayoutReorderOption;

impl ConfigurationOption for DisableLayoutReorderOption {
    type Value = bool;

    const KEY: &'static str = "edge.disable-layout-reorder";
    const ACCESS: OptionAccess = OptionAccess::Private;
    const CATEGORY: OptionCategory = OptionCategory::CompileTime;

    fn default_value() -> &'static str {
        "NO"
    }

    fn validate(value: &str) -> EngineResult<()> {
        Self::parse(value).map(|_| ())
    }

    fn parse(value: &str) -> EngineResult<bool> {
        parse_switch(value).ok_or_else(|| {
            EngineError::configuration(
                Self::KEY,
                format!("unexpected value \"{value}\", only YES and NO are supported"),
            )
        })
    }
}
