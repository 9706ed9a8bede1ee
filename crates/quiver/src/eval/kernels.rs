//! Type-specialized kernel implementations and the dispatch tables over them.

use std::collections::HashMap;

use half::{bf16, f16};
use once_cell::sync::Lazy;

use crate::element::ElementType;
use crate::error::{EngineError, EngineResult};
use crate::eval::{BinaryOp, UnaryOp};

/// Little-endian scalar storage shared by every kernel.
pub(crate) trait Element: Copy {
    const DTYPE: ElementType;
    fn read(bytes: &[u8], index: usize) -> Self;
    fn write(self, bytes: &mut [u8], index: usize);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $width:expr) => {
        impl Element for $ty {
            const DTYPE: ElementType = $dtype;

            fn read(bytes: &[u8], index: usize) -> Self {
                let at = index * $width;
                let mut raw = [0u8; $width];
                raw.copy_from_slice(&bytes[at..at + $width]);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, bytes: &mut [u8], index: usize) {
                let at = index * $width;
                bytes[at..at + $width].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_element!(f32, ElementType::F32, 4);
impl_element!(f16, ElementType::F16, 2);
impl_element!(bf16, ElementType::Bf16, 2);
impl_element!(i64, ElementType::I64, 8);
impl_element!(i32, ElementType::I32, 4);
impl_element!(i16, ElementType::I16, 2);
impl_element!(i8, ElementType::I8, 1);
impl_element!(u64, ElementType::U64, 8);
impl_element!(u32, ElementType::U32, 4);
impl_element!(u16, ElementType::U16, 2);
impl_element!(u8, ElementType::U8, 1);

pub(crate) type BinaryKernelFn = fn(&[u8], &[u8], &mut [u8], &[usize], &[usize]);
pub(crate) type UnaryKernelFn = fn(&[u8], &mut [u8], usize);
pub(crate) type SegmentKernelFn = fn(&SegmentSumArgs<'_>, &mut [u8]) -> EngineResult<()>;

fn binary_map<T: Element>(
    op: fn(T, T) -> T,
    lhs: &[u8],
    rhs: &[u8],
    out: &mut [u8],
    lhs_map: &[usize],
    rhs_map: &[usize],
) {
    for (i, (l, r)) in lhs_map.iter().zip(rhs_map.iter()).enumerate() {
        op(T::read(lhs, *l), T::read(rhs, *r)).write(out, i);
    }
}

fn unary_map<T: Element>(op: fn(T) -> T, input: &[u8], out: &mut [u8], count: usize) {
    for i in 0..count {
        op(T::read(input, i)).write(out, i);
    }
}

/// Raw arguments handed to a segment-sum kernel after dispatch.
pub(crate) struct SegmentSumArgs<'a> {
    pub table: &'a [u8],
    pub rows: usize,
    pub row_len: usize,
    pub indices: &'a [i32],
    pub offsets: &'a [i32],
    pub default_index: Option<i32>,
    pub weights: Option<&'a [u8]>,
}

enum SegmentSpan {
    Slice { start: usize, end: usize },
    DefaultRow(usize),
    Empty,
}

// Every index/offset is validated here, before the kernel writes a single
// byte, so a bounds failure cannot leave partial output behind.
fn resolve_segments(args: &SegmentSumArgs<'_>) -> EngineResult<Vec<SegmentSpan>> {
    let indices_len = args.indices.len();
    let mut spans = Vec::with_capacity(args.offsets.len());
    for (segment, &offset) in args.offsets.iter().enumerate() {
        if offset < 0 || offset as usize > indices_len {
            return Err(EngineError::bounds(format!(
                "segment {segment} offset {offset} exceeds indices length {indices_len}"
            )));
        }
        let start = offset as usize;
        let end = match args.offsets.get(segment + 1) {
            Some(&next) => {
                if next < offset {
                    return Err(EngineError::bounds(format!(
                        "offsets must be non-decreasing, got {offset} then {next}"
                    )));
                }
                if next as usize > indices_len {
                    return Err(EngineError::bounds(format!(
                        "segment {} offset {next} exceeds indices length {indices_len}",
                        segment + 1
                    )));
                }
                next as usize
            }
            // The last segment extends to the end of the indices buffer.
            None => indices_len,
        };
        if start == end {
            match args.default_index {
                Some(default) => {
                    let row = check_row(default, args.rows, "default index")?;
                    spans.push(SegmentSpan::DefaultRow(row));
                }
                None => spans.push(SegmentSpan::Empty),
            }
        } else {
            for &index in &args.indices[start..end] {
                check_row(index, args.rows, "index")?;
            }
            spans.push(SegmentSpan::Slice { start, end });
        }
    }
    Ok(spans)
}

fn check_row(index: i32, rows: usize, what: &str) -> EngineResult<usize> {
    if index < 0 || index as usize >= rows {
        return Err(EngineError::bounds(format!(
            "{what} {index} outside table with {rows} rows"
        )));
    }
    Ok(index as usize)
}

fn segment_sum<T: Element + Default>(
    add: fn(T, T) -> T,
    mul: fn(T, T) -> T,
    args: &SegmentSumArgs<'_>,
    out: &mut [u8],
) -> EngineResult<()> {
    let spans = resolve_segments(args)?;
    for (segment, span) in spans.iter().enumerate() {
        let out_base = segment * args.row_len;
        match span {
            SegmentSpan::Empty => {
                for slot in 0..args.row_len {
                    T::default().write(out, out_base + slot);
                }
            }
            // An empty segment with a configured default gathers exactly
            // that one row, unweighted.
            SegmentSpan::DefaultRow(row) => {
                let row_base = row * args.row_len;
                for slot in 0..args.row_len {
                    T::read(args.table, row_base + slot).write(out, out_base + slot);
                }
            }
            SegmentSpan::Slice { start, end } => {
                for slot in 0..args.row_len {
                    let mut acc = T::default();
                    for position in *start..*end {
                        let row = args.indices[position] as usize;
                        let mut value = T::read(args.table, row * args.row_len + slot);
                        if let Some(weights) = args.weights {
                            value = mul(value, T::read(weights, position));
                        }
                        acc = add(acc, value);
                    }
                    acc.write(out, out_base + slot);
                }
            }
        }
    }
    Ok(())
}

struct KernelRegistry {
    binary: HashMap<(BinaryOp, ElementType), BinaryKernelFn>,
    unary: HashMap<(UnaryOp, ElementType), UnaryKernelFn>,
    segment: HashMap<ElementType, SegmentKernelFn>,
}

macro_rules! binary_kernels {
    ($map:expr, $op:expr, { $($dtype:path => $ty:ty : $f:expr),+ $(,)? }) => {
        $(
            $map.insert(($op, $dtype), {
                fn kernel(
                    lhs: &[u8],
                    rhs: &[u8],
                    out: &mut [u8],
                    lhs_map: &[usize],
                    rhs_map: &[usize],
                ) {
                    binary_map::<$ty>($f, lhs, rhs, out, lhs_map, rhs_map);
                }
                kernel as BinaryKernelFn
            });
        )+
    };
}

macro_rules! unary_kernels {
    ($map:expr, $op:expr, { $($dtype:path => $ty:ty : $f:expr),+ $(,)? }) => {
        $(
            $map.insert(($op, $dtype), {
                fn kernel(input: &[u8], out: &mut [u8], count: usize) {
                    unary_map::<$ty>($f, input, out, count);
                }
                kernel as UnaryKernelFn
            });
        )+
    };
}

macro_rules! segment_kernels {
    ($map:expr, { $($dtype:path => $ty:ty : $add:expr, $mul:expr);+ $(;)? }) => {
        $(
            $map.insert($dtype, {
                fn kernel(args: &SegmentSumArgs<'_>, out: &mut [u8]) -> EngineResult<()> {
                    segment_sum::<$ty>($add, $mul, args, out)
                }
                kernel as SegmentKernelFn
            });
        )+
    };
}

fn hsigmoid_f32(x: f32) -> f32 {
    (x + 3.0).clamp(0.0, 6.0) / 6.0
}

impl KernelRegistry {
    fn build() -> Self {
        let mut binary: HashMap<(BinaryOp, ElementType), BinaryKernelFn> = HashMap::new();
        let mut unary: HashMap<(UnaryOp, ElementType), UnaryKernelFn> = HashMap::new();
        let mut segment: HashMap<ElementType, SegmentKernelFn> = HashMap::new();

        binary_kernels!(binary, BinaryOp::Add, {
            ElementType::F32 => f32: |a, b| a + b,
            ElementType::F16 => f16: |a, b| f16::from_f32(a.to_f32() + b.to_f32()),
            ElementType::Bf16 => bf16: |a, b| bf16::from_f32(a.to_f32() + b.to_f32()),
            ElementType::I32 => i32: |a, b| a.wrapping_add(b),
            ElementType::I64 => i64: |a, b| a.wrapping_add(b),
            ElementType::U32 => u32: |a, b| a.wrapping_add(b),
            ElementType::U64 => u64: |a, b| a.wrapping_add(b),
        });
        binary_kernels!(binary, BinaryOp::Multiply, {
            ElementType::F32 => f32: |a, b| a * b,
            ElementType::F16 => f16: |a, b| f16::from_f32(a.to_f32() * b.to_f32()),
            ElementType::Bf16 => bf16: |a, b| bf16::from_f32(a.to_f32() * b.to_f32()),
            ElementType::I32 => i32: |a, b| a.wrapping_mul(b),
            ElementType::I64 => i64: |a, b| a.wrapping_mul(b),
            ElementType::U32 => u32: |a, b| a.wrapping_mul(b),
            ElementType::U64 => u64: |a, b| a.wrapping_mul(b),
        });
        binary_kernels!(binary, BinaryOp::Maximum, {
            ElementType::F32 => f32: |a, b| a.max(b),
            ElementType::F16 => f16: |a, b| if a >= b { a } else { b },
            ElementType::Bf16 => bf16: |a, b| if a >= b { a } else { b },
            ElementType::I32 => i32: |a, b| a.max(b),
            ElementType::I64 => i64: |a, b| a.max(b),
            ElementType::U32 => u32: |a, b| a.max(b),
            ElementType::U64 => u64: |a, b| a.max(b),
        });

        unary_kernels!(unary, UnaryOp::HSigmoid, {
            ElementType::F32 => f32: hsigmoid_f32,
            ElementType::F16 => f16: |x| f16::from_f32(hsigmoid_f32(x.to_f32())),
            ElementType::Bf16 => bf16: |x| bf16::from_f32(hsigmoid_f32(x.to_f32())),
        });

        segment_kernels!(segment, {
            ElementType::F32 => f32: |a, b| a + b, |a, b| a * b;
            ElementType::I32 => i32: |a: i32, b: i32| a.wrapping_add(b), |a: i32, b: i32| a.wrapping_mul(b);
            ElementType::I8 => i8: |a: i8, b: i8| a.wrapping_add(b), |a: i8, b: i8| a.wrapping_mul(b);
            ElementType::U8 => u8: |a: u8, b: u8| a.wrapping_add(b), |a: u8, b: u8| a.wrapping_mul(b);
        });

        Self {
            binary,
            unary,
            segment,
        }
    }
}

static KERNELS: Lazy<KernelRegistry> = Lazy::new(KernelRegistry::build);

pub(crate) fn binary_kernel(op: BinaryOp, dtype: ElementType) -> Option<BinaryKernelFn> {
    KERNELS.binary.get(&(op, dtype)).copied()
}

pub(crate) fn unary_kernel(op: UnaryOp, dtype: ElementType) -> Option<UnaryKernelFn> {
    KERNELS.unary.get(&(op, dtype)).copied()
}

pub(crate) fn segment_kernel(dtype: ElementType) -> Option<SegmentKernelFn> {
    KERNELS.segment.get(&dtype).copied()
}
