use anyhow::Result;
use half::f16;
use quiver::element::{ElementType, TensorSpec};
use quiver::error::EngineError;
use quiver::eval::{
    evaluate_binary, evaluate_segment_sum, evaluate_unary, BinaryOp, SegmentSumRequest,
    TensorView, TensorViewMut, UnaryOp,
};
use quiver::graph::BroadcastPolicy;

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[test]
fn maximum_f32_broadcasts_trailing_axis() -> Result<()> {
    let lhs_spec = TensorSpec::from_static(ElementType::F32, &[2, 3]);
    let rhs_spec = TensorSpec::from_static(ElementType::F32, &[3]);
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 3]);

    let lhs = f32_bytes(&[1.0, 5.0, 2.0, -1.0, 0.5, 9.0]);
    let rhs = f32_bytes(&[2.0, 2.0, 2.0]);
    let mut out = vec![0u8; 24];

    let lhs_view = TensorView::new(&lhs_spec, &lhs)?;
    let rhs_view = TensorView::new(&rhs_spec, &rhs)?;
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    evaluate_binary(
        BinaryOp::Maximum,
        BroadcastPolicy::Numpy,
        &lhs_view,
        &rhs_view,
        &mut out_view,
    )?;

    assert_eq!(read_f32(&out), vec![2.0, 5.0, 2.0, 2.0, 2.0, 9.0]);
    Ok(())
}

#[test]
fn maximum_matches_scalar_max_for_integer_types() -> Result<()> {
    let spec = TensorSpec::from_static(ElementType::I32, &[4]);
    let lhs = i32_bytes(&[-3, 7, 0, i32::MIN]);
    let rhs = i32_bytes(&[2, -7, 0, i32::MAX]);
    let mut out = vec![0u8; 16];

    let lhs_view = TensorView::new(&spec, &lhs)?;
    let rhs_view = TensorView::new(&spec, &rhs)?;
    let mut out_view = TensorViewMut::new(&spec, &mut out)?;
    evaluate_binary(
        BinaryOp::Maximum,
        BroadcastPolicy::None,
        &lhs_view,
        &rhs_view,
        &mut out_view,
    )?;

    assert_eq!(read_i32(&out), vec![2, 7, 0, i32::MAX]);
    Ok(())
}

#[test]
fn maximum_f16_dispatches_natively() -> Result<()> {
    let spec = TensorSpec::from_static(ElementType::F16, &[2]);
    let lhs: Vec<u8> = [f16::from_f32(1.5), f16::from_f32(-2.0)]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let rhs: Vec<u8> = [f16::from_f32(0.25), f16::from_f32(4.0)]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let mut out = vec![0u8; 4];

    let lhs_view = TensorView::new(&spec, &lhs)?;
    let rhs_view = TensorView::new(&spec, &rhs)?;
    let mut out_view = TensorViewMut::new(&spec, &mut out)?;
    evaluate_binary(
        BinaryOp::Maximum,
        BroadcastPolicy::None,
        &lhs_view,
        &rhs_view,
        &mut out_view,
    )?;

    let first = f16::from_le_bytes([out[0], out[1]]);
    let second = f16::from_le_bytes([out[2], out[3]]);
    assert_eq!(first.to_f32(), 1.5);
    assert_eq!(second.to_f32(), 4.0);
    Ok(())
}

#[test]
fn unsupported_type_leaves_output_untouched() -> Result<()> {
    let spec = TensorSpec::from_static(ElementType::Boolean, &[4]);
    let lhs = vec![1u8, 0, 1, 0];
    let rhs = vec![0u8, 1, 1, 0];
    let mut out = vec![0xaau8; 4];

    let lhs_view = TensorView::new(&spec, &lhs)?;
    let rhs_view = TensorView::new(&spec, &rhs)?;
    let mut out_view = TensorViewMut::new(&spec, &mut out)?;
    let err = evaluate_binary(
        BinaryOp::Maximum,
        BroadcastPolicy::None,
        &lhs_view,
        &rhs_view,
        &mut out_view,
    )
    .unwrap_err();

    assert!(matches!(err, EngineError::UnsupportedType { .. }));
    assert_eq!(out, vec![0xaau8; 4], "failed dispatch must not write");
    Ok(())
}

#[test]
fn none_policy_rejects_shape_mismatch() -> Result<()> {
    let lhs_spec = TensorSpec::from_static(ElementType::F32, &[2, 3]);
    let rhs_spec = TensorSpec::from_static(ElementType::F32, &[2, 4]);
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 3]);

    let lhs = f32_bytes(&[0.0; 6]);
    let rhs = f32_bytes(&[0.0; 8]);
    let mut out = vec![0u8; 24];

    let lhs_view = TensorView::new(&lhs_spec, &lhs)?;
    let rhs_view = TensorView::new(&rhs_spec, &rhs)?;
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    let err = evaluate_binary(
        BinaryOp::Add,
        BroadcastPolicy::None,
        &lhs_view,
        &rhs_view,
        &mut out_view,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Structural(_)));
    Ok(())
}

#[test]
fn hsigmoid_reference_values() -> Result<()> {
    let spec = TensorSpec::from_static(ElementType::F32, &[5]);
    let input = f32_bytes(&[-4.0, -3.0, 0.0, 3.0, 4.0]);
    let mut out = vec![0u8; 20];

    let in_view = TensorView::new(&spec, &input)?;
    let mut out_view = TensorViewMut::new(&spec, &mut out)?;
    evaluate_unary(UnaryOp::HSigmoid, &in_view, &mut out_view)?;

    assert_eq!(read_f32(&out), vec![0.0, 0.0, 0.5, 1.0, 1.0]);
    Ok(())
}

#[test]
fn hsigmoid_rejects_integer_input() -> Result<()> {
    let spec = TensorSpec::from_static(ElementType::I32, &[2]);
    let input = i32_bytes(&[1, 2]);
    let mut out = vec![0u8; 8];

    let in_view = TensorView::new(&spec, &input)?;
    let mut out_view = TensorViewMut::new(&spec, &mut out)?;
    let err = evaluate_unary(UnaryOp::HSigmoid, &in_view, &mut out_view).unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedType { .. }));
    Ok(())
}

fn segment_fixture() -> (TensorSpec, Vec<u8>, Vec<i32>, Vec<i32>) {
    let table_spec = TensorSpec::from_static(ElementType::F32, &[4, 1]);
    let table = f32_bytes(&[10.0, 20.0, 30.0, 40.0]);
    (table_spec, table, vec![0, 1, 2, 3], vec![0, 2])
}

#[test]
fn segment_sum_reference_case() -> Result<()> {
    let (table_spec, table, indices, offsets) = segment_fixture();
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 1]);
    let mut out = vec![0u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: None,
        weights: None,
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    evaluate_segment_sum(&request, &mut out_view)?;

    assert_eq!(read_f32(&out), vec![30.0, 70.0]);
    Ok(())
}

#[test]
fn empty_trailing_segment_gathers_default_row() -> Result<()> {
    let (table_spec, table, indices, _) = segment_fixture();
    // Segment 1 starts at the end of the indices buffer: empty.
    let offsets = vec![0, 4];
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 1]);
    let mut out = vec![0u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: Some(2),
        weights: None,
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    evaluate_segment_sum(&request, &mut out_view)?;

    assert_eq!(read_f32(&out), vec![100.0, 30.0]);
    Ok(())
}

#[test]
fn empty_segment_without_default_contributes_nothing() -> Result<()> {
    let (table_spec, table, indices, _) = segment_fixture();
    let offsets = vec![0, 4];
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 1]);
    let mut out = vec![0u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: None,
        weights: None,
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    evaluate_segment_sum(&request, &mut out_view)?;

    assert_eq!(read_f32(&out), vec![100.0, 0.0]);
    Ok(())
}

#[test]
fn per_sample_weights_scale_rows() -> Result<()> {
    let (table_spec, table, indices, offsets) = segment_fixture();
    let weights_spec = TensorSpec::from_static(ElementType::F32, &[4]);
    let weights = f32_bytes(&[1.0, 0.5, 2.0, 0.0]);
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 1]);
    let mut out = vec![0u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: None,
        weights: Some(TensorView::new(&weights_spec, &weights)?),
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    evaluate_segment_sum(&request, &mut out_view)?;

    // 10*1 + 20*0.5 = 20; 30*2 + 40*0 = 60.
    assert_eq!(read_f32(&out), vec![20.0, 60.0]);
    Ok(())
}

#[test]
fn index_beyond_table_rows_is_a_bounds_error() -> Result<()> {
    let (table_spec, table, _, offsets) = segment_fixture();
    let indices = vec![0, 1, 4, 3];
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 1]);
    let mut out = vec![0x55u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: None,
        weights: None,
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    let err = evaluate_segment_sum(&request, &mut out_view).unwrap_err();
    assert!(matches!(err, EngineError::Bounds { .. }));
    assert_eq!(out, vec![0x55u8; 8], "bounds failure must not write");
    Ok(())
}

#[test]
fn offset_beyond_indices_is_a_bounds_error() -> Result<()> {
    let (table_spec, table, indices, _) = segment_fixture();
    let offsets = vec![0, 5];
    let out_spec = TensorSpec::from_static(ElementType::F32, &[2, 1]);
    let mut out = vec![0u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: None,
        weights: None,
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    let err = evaluate_segment_sum(&request, &mut out_view).unwrap_err();
    assert!(matches!(err, EngineError::Bounds { .. }));
    Ok(())
}

#[test]
fn segment_sum_i32_rows() -> Result<()> {
    let table_spec = TensorSpec::from_static(ElementType::I32, &[3, 2]);
    let table = i32_bytes(&[1, 2, 3, 4, 5, 6]);
    let indices = vec![0, 2];
    let offsets = vec![0];
    let out_spec = TensorSpec::from_static(ElementType::I32, &[1, 2]);
    let mut out = vec![0u8; 8];

    let request = SegmentSumRequest {
        table: TensorView::new(&table_spec, &table)?,
        indices: &indices,
        offsets: &offsets,
        default_index: None,
        weights: None,
    };
    let mut out_view = TensorViewMut::new(&out_spec, &mut out)?;
    evaluate_segment_sum(&request, &mut out_view)?;

    assert_eq!(read_i32(&out), vec![6, 8]);
    Ok(())
}
