//! Precision conversion at compiled-primitive port boundaries.
//!
//! When a backend promotes a declared precision (e.g. f16 to f32) the port
//! buffer keeps the declared element type; inputs are widened into a compute
//! buffer before the kernel runs and the result is narrowed back afterwards.
//! Both directions of every promotion rule in the per-backend tables are
//! covered here; any other pair is rejected.

use half::{bf16, f16};

use crate::element::ElementType;
use crate::error::{EngineError, EngineResult};
use crate::eval::kernels::Element;

fn map_elements<S: Element, D: Element>(
    cast: fn(S) -> D,
    src: &[u8],
    dst: &mut [u8],
    count: usize,
) {
    for i in 0..count {
        cast(S::read(src, i)).write(dst, i);
    }
}

/// Converts `count` elements from `src_dtype` to `dst_dtype`. Identity
/// conversions copy bytes through unchanged.
pub fn convert_buffer(
    src_dtype: ElementType,
    dst_dtype: ElementType,
    src: &[u8],
    dst: &mut [u8],
    count: usize,
) -> EngineResult<()> {
    use ElementType::*;
    match (src_dtype, dst_dtype) {
        (a, b) if a == b => {
            let len = a.byte_len(count);
            dst[..len].copy_from_slice(&src[..len]);
        }
        (F16, F32) => map_elements::<f16, f32>(f16::to_f32, src, dst, count),
        (F32, F16) => map_elements::<f32, f16>(f16::from_f32, src, dst, count),
        (Bf16, F32) => map_elements::<bf16, f32>(bf16::to_f32, src, dst, count),
        (F32, Bf16) => map_elements::<f32, bf16>(bf16::from_f32, src, dst, count),
        (I8, I32) => map_elements::<i8, i32>(|v| v as i32, src, dst, count),
        (I32, I8) => map_elements::<i32, i8>(|v| v as i8, src, dst, count),
        (I16, I32) => map_elements::<i16, i32>(|v| v as i32, src, dst, count),
        (I32, I16) => map_elements::<i32, i16>(|v| v as i16, src, dst, count),
        (U8, I32) => map_elements::<u8, i32>(|v| v as i32, src, dst, count),
        (I32, U8) => map_elements::<i32, u8>(|v| v as u8, src, dst, count),
        (U16, I32) => map_elements::<u16, i32>(|v| v as i32, src, dst, count),
        (I32, U16) => map_elements::<i32, u16>(|v| v as u16, src, dst, count),
        (src_dtype, dst_dtype) => {
            return Err(EngineError::execution(format!(
                "no conversion from {src_dtype} to {dst_dtype}"
            )))
        }
    }
    Ok(())
}
