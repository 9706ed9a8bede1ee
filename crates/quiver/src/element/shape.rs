use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::ElementType;

/// Names a symbolic dynamic dimension (e.g. `?batch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// A single axis extent: fixed at construction or resolved at execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dim {
    pub fn is_static(&self) -> bool {
        matches!(self, Dim::Static(_))
    }
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Static(value)
    }
}

/// Ordered sequence of non-negative dimensions. Rank 0 (scalar) is legal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dim>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dim>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Convenience constructor for fully static shapes.
    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dim::Static).collect(),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(Dim::is_static)
    }

    /// Returns concrete dimensions when all axes are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dim::Static(value) => dims.push(*value),
                Dim::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Total element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match dim {
                Dim::Static(value) => write!(f, "{value}")?,
                Dim::Dynamic(symbol) => write!(f, "?{}", symbol.as_str())?,
            }
        }
        write!(f, ")")
    }
}

/// Tensor metadata coupling element type and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: ElementType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: ElementType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Convenience constructor for fully static specs.
    pub fn from_static(dtype: ElementType, dims: &[usize]) -> Self {
        Self {
            dtype,
            shape: Shape::from_static(dims),
        }
    }

    /// Total element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Total byte length when the shape is fully static.
    pub fn byte_len(&self) -> Option<usize> {
        Some(self.dtype.byte_len(self.element_count()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_shape_has_no_element_count() {
        let shape = Shape::new(vec![Dim::Static(2), Dim::Dynamic(DimSymbol::new("n"))]);
        assert_eq!(shape.rank(), 2);
        assert!(!shape.is_static());
        assert_eq!(shape.element_count(), None);
    }

    #[test]
    fn byte_len_scales_with_the_element_type() {
        let spec = TensorSpec::from_static(ElementType::F16, &[3, 4]);
        assert_eq!(spec.element_count(), Some(12));
        assert_eq!(spec.byte_len(), Some(24));
    }

    #[test]
    fn tensor_spec_survives_a_serde_round_trip() {
        let spec = TensorSpec::new(
            ElementType::I32,
            Shape::new(vec![Dim::Static(4), Dim::Dynamic(DimSymbol::new("batch"))]),
        );
        let json = serde_json::to_string(&spec).unwrap();
        let back: TensorSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
