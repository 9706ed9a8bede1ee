//! Fixed-seed pseudo-random buffer population.
//!
//! Used whenever no real input data is supplied so every executable path has
//! defined content. Two fills with the same seed and element type produce
//! byte-identical buffers.

use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::element::ElementType;
use crate::error::{EngineError, EngineResult};
use crate::eval::kernels::Element;

// Float fills stay within the byte range of the original sample data; every
// integer type covers its full representable range.
const FLOAT_FILL_MAX: f32 = 256.0;

/// Populates `bytes` with seeded pseudo-random values bounded to the
/// representable range of `dtype`. Boolean buffers only ever hold 0 or 1.
pub fn fill_deterministic(dtype: ElementType, seed: u64, bytes: &mut [u8]) -> EngineResult<()> {
    let elem_size = dtype.size_in_bytes();
    if bytes.len() % elem_size != 0 {
        return Err(EngineError::execution(format!(
            "buffer of {} bytes is not a whole number of {dtype} elements",
            bytes.len()
        )));
    }
    let count = bytes.len() / elem_size;
    let mut rng = StdRng::seed_from_u64(seed);

    match dtype {
        ElementType::F32 => {
            for i in 0..count {
                rng.gen_range(0.0f32..FLOAT_FILL_MAX).write(bytes, i);
            }
        }
        ElementType::F16 => {
            for i in 0..count {
                f16::from_f32(rng.gen_range(0.0f32..FLOAT_FILL_MAX)).write(bytes, i);
            }
        }
        ElementType::Bf16 => {
            for i in 0..count {
                bf16::from_f32(rng.gen_range(0.0f32..FLOAT_FILL_MAX)).write(bytes, i);
            }
        }
        ElementType::I64 => {
            for i in 0..count {
                rng.gen::<i64>().write(bytes, i);
            }
        }
        ElementType::I32 => {
            for i in 0..count {
                rng.gen::<i32>().write(bytes, i);
            }
        }
        ElementType::I16 => {
            for i in 0..count {
                rng.gen::<i16>().write(bytes, i);
            }
        }
        ElementType::I8 => {
            for i in 0..count {
                rng.gen::<i8>().write(bytes, i);
            }
        }
        ElementType::U64 => {
            for i in 0..count {
                rng.gen::<u64>().write(bytes, i);
            }
        }
        ElementType::U32 => {
            for i in 0..count {
                rng.gen::<u32>().write(bytes, i);
            }
        }
        ElementType::U16 => {
            for i in 0..count {
                rng.gen::<u16>().write(bytes, i);
            }
        }
        ElementType::U8 => {
            for i in 0..count {
                rng.gen::<u8>().write(bytes, i);
            }
        }
        ElementType::Boolean => {
            for i in 0..count {
                rng.gen_range(0u8..=1).write(bytes, i);
            }
        }
    }
    Ok(())
}
