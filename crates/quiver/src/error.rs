//! Error taxonomy shared by the graph core and every backend.
//!
//! Errors are never downgraded or swallowed: an execution either fully
//! succeeds or reports exactly one of these kinds, and no output buffer is
//! considered valid once an error has been reported.

use std::fmt;

use crate::element::ElementType;

/// Closed set of graph-construction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralCode {
    ArityMismatch,
    RankMismatch,
    DTypeMismatch,
    OutputIndexOutOfRange,
    NodeOutOfOrder,
    BroadcastIncompatible,
    MissingAttribute,
    InvalidAttribute,
    DynamicDimensionUnresolved,
}

impl StructuralCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructuralCode::ArityMismatch => "structural: input arity mismatch",
            StructuralCode::RankMismatch => "structural: input rank mismatch",
            StructuralCode::DTypeMismatch => "structural: element type mismatch",
            StructuralCode::OutputIndexOutOfRange => {
                "structural: referenced output index does not exist"
            }
            StructuralCode::NodeOutOfOrder => {
                "structural: edge references a node not yet in the graph"
            }
            StructuralCode::BroadcastIncompatible => {
                "structural: shapes incompatible under broadcast policy"
            }
            StructuralCode::MissingAttribute => "structural: required attribute missing",
            StructuralCode::InvalidAttribute => "structural: invalid attribute value",
            StructuralCode::DynamicDimensionUnresolved => {
                "structural: dynamic dimension not resolved"
            }
        }
    }
}

/// Validation failure captured at graph construction, before any execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralError {
    pub code: StructuralCode,
    pub detail: Option<String>,
}

impl StructuralError {
    pub fn new(code: StructuralCode, detail: impl Into<Option<String>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl std::error::Error for StructuralError {}

/// Engine error surfaced to callers.
#[derive(Debug)]
pub enum EngineError {
    /// Bad arity/rank/type detected at graph construction. Fatal, never retried.
    Structural(StructuralError),
    /// The operation has no kernel registered for the runtime element type.
    /// Nothing is written to the output.
    UnsupportedType {
        op: &'static str,
        dtype: ElementType,
    },
    /// The backend cannot process the declared precision and no promotion
    /// rule covers it.
    UnsupportedPrecision {
        backend: &'static str,
        dtype: ElementType,
    },
    /// Index/offset data inconsistent with table or buffer extents. The
    /// execution aborts without partial output.
    Bounds { detail: String },
    /// Backend runtime support requested but absent from the running build.
    DeviceUnavailable {
        backend: &'static str,
        reason: String,
    },
    /// Rejected configuration option value.
    Configuration { key: &'static str, detail: String },
    /// Device call failure or broken internal invariant.
    Execution { detail: String },
}

impl EngineError {
    pub fn structural(code: StructuralCode, detail: impl Into<Option<String>>) -> Self {
        EngineError::Structural(StructuralError::new(code, detail))
    }

    pub fn unsupported_type(op: &'static str, dtype: ElementType) -> Self {
        EngineError::UnsupportedType { op, dtype }
    }

    pub fn unsupported_precision(backend: &'static str, dtype: ElementType) -> Self {
        EngineError::UnsupportedPrecision { backend, dtype }
    }

    pub fn bounds(detail: impl Into<String>) -> Self {
        EngineError::Bounds {
            detail: detail.into(),
        }
    }

    pub fn device_unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        EngineError::DeviceUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    pub fn configuration(key: &'static str, detail: impl Into<String>) -> Self {
        EngineError::Configuration {
            key,
            detail: detail.into(),
        }
    }

    pub fn execution(detail: impl Into<String>) -> Self {
        EngineError::Execution {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Structural(err) => write!(f, "{err}"),
            EngineError::UnsupportedType { op, dtype } => {
                write!(f, "{op} has no kernel for element type {dtype}")
            }
            EngineError::UnsupportedPrecision { backend, dtype } => {
                write!(f, "backend {backend} does not support precision {dtype}")
            }
            EngineError::Bounds { detail } => write!(f, "bounds error: {detail}"),
            EngineError::DeviceUnavailable { backend, reason } => {
                write!(f, "backend {backend} runtime unavailable: {reason}")
            }
            EngineError::Configuration { key, detail } => {
                write!(f, "configuration option {key}: {detail}")
            }
            EngineError::Execution { detail } => write!(f, "execution failure: {detail}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Convenience alias for results returned by engine routines.
pub type EngineResult<T> = Result<T, EngineError>;
