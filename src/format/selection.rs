//! Box intersection and selection copy.
//!
//! Destinations are always host-order, row-major. Sources carry the layout
//! recorded by the producer and may be column-major or foreign-endian.

use crate::error::{Result, StreamError};
use crate::types::{element_count, BlockLayout, DataType, Dims};

/// Intersect two boxes. `None` when they share no element, differ in
/// dimensionality, or either box reaches past `u64::MAX`. Two scalars (no
/// dimensions) always overlap.
pub fn calculate_overlap(
    in_start: &[u64],
    in_count: &[u64],
    out_start: &[u64],
    out_count: &[u64],
) -> Option<(Dims, Dims)> {
    if in_start.len() != out_start.len()
        || in_count.len() != in_start.len()
        || out_count.len() != out_start.len()
    {
        return None;
    }
    let mut start = Vec::with_capacity(in_start.len());
    let mut count = Vec::with_capacity(in_start.len());
    for d in 0..in_start.len() {
        let lo = in_start[d].max(out_start[d]);
        let in_end = in_start[d].checked_add(in_count[d])?;
        let out_end = out_start[d].checked_add(out_count[d])?;
        let hi = in_end.min(out_end);
        if lo >= hi {
            return None;
        }
        start.push(lo);
        count.push(hi - lo);
    }
    Some((start, count))
}

/// Element strides of a box with extents `count`.
fn strides(count: &[u64], row_major: bool) -> Vec<u64> {
    let n = count.len();
    let mut strides = vec![1u64; n];
    if row_major {
        for d in (0..n.saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * count[d + 1];
        }
    } else {
        for d in 1..n {
            strides[d] = strides[d - 1] * count[d - 1];
        }
    }
    strides
}

fn offset(pos: &[u64], start: &[u64], strides: &[u64]) -> usize {
    pos.iter()
        .zip(start)
        .zip(strides)
        .map(|((p, s), st)| (p - s) * st)
        .sum::<u64>() as usize
}

/// Advance `pos` through the box `start`/`count`, skipping dimensions at or
/// beyond `limit`. Returns false once every position was visited.
fn advance(pos: &mut [u64], start: &[u64], count: &[u64], limit: usize) -> bool {
    for d in (0..limit).rev() {
        pos[d] += 1;
        if pos[d] < start[d] + count[d] {
            return true;
        }
        pos[d] = start[d];
    }
    false
}

fn swap_element(bytes: &mut [u8], unit: usize) {
    for chunk in bytes.chunks_exact_mut(unit) {
        chunk.reverse();
    }
}

/// Copy the intersection of the source block and the destination box from
/// `src` into `dst`. Returns the number of bytes written.
#[allow(clippy::too_many_arguments)]
pub fn copy_selection(
    src: &[u8],
    src_start: &[u64],
    src_count: &[u64],
    src_layout: BlockLayout,
    dst: &mut [u8],
    dst_start: &[u64],
    dst_count: &[u64],
    data_type: DataType,
) -> Result<usize> {
    let esize = data_type.size();
    let src_needed = element_count(src_count) as usize * esize;
    let dst_needed = element_count(dst_count) as usize * esize;
    if src.len() < src_needed {
        return Err(StreamError::invalid(format!(
            "source holds {} bytes, its box needs {}",
            src.len(),
            src_needed
        )));
    }
    if dst.len() < dst_needed {
        return Err(StreamError::invalid(format!(
            "destination holds {} bytes, selection needs {}",
            dst.len(),
            dst_needed
        )));
    }
    if src_start.len() != dst_start.len() {
        return Err(StreamError::invalid(format!(
            "selection has {} dimensions, block has {}",
            dst_start.len(),
            src_start.len()
        )));
    }

    let Some((ov_start, ov_count)) = calculate_overlap(src_start, src_count, dst_start, dst_count)
    else {
        return Ok(0);
    };

    let swap = src_layout.needs_swap() && data_type.swap_unit() > 1;
    let ndim = ov_start.len();

    if ndim == 0 {
        dst[..esize].copy_from_slice(&src[..esize]);
        if swap {
            swap_element(&mut dst[..esize], data_type.swap_unit());
        }
        return Ok(esize);
    }

    let src_strides = strides(src_count, src_layout.is_row_major());
    let dst_strides = strides(dst_count, true);
    let mut pos = ov_start.clone();
    let mut copied = 0;

    if src_layout.is_row_major() && !swap {
        // Contiguous runs along the innermost dimension.
        let run = ov_count[ndim - 1] as usize * esize;
        loop {
            let s = offset(&pos, src_start, &src_strides) * esize;
            let d = offset(&pos, dst_start, &dst_strides) * esize;
            dst[d..d + run].copy_from_slice(&src[s..s + run]);
            copied += run;
            if !advance(&mut pos, &ov_start, &ov_count, ndim - 1) {
                break;
            }
        }
    } else {
        loop {
            let s = offset(&pos, src_start, &src_strides) * esize;
            let d = offset(&pos, dst_start, &dst_strides) * esize;
            let element = &mut dst[d..d + esize];
            element.copy_from_slice(&src[s..s + esize]);
            if swap {
                swap_element(element, data_type.swap_unit());
            }
            copied += esize;
            if !advance(&mut pos, &ov_start, &ov_count, ndim) {
                break;
            }
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Element;
    use proptest::prelude::*;

    fn bytes_of(values: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        u16::extend_bytes(values, &mut out);
        out
    }

    fn values_of(bytes: &[u8]) -> Vec<u16> {
        let mut out = vec![0u16; bytes.len() / 2];
        u16::fill_from_bytes(bytes, &mut out);
        out
    }

    #[test]
    fn test_overlap_example() {
        let overlap = calculate_overlap(&[2, 2], &[5, 2], &[0, 0], &[4, 4]);
        assert_eq!(overlap, Some((vec![2, 2], vec![2, 2])));
    }

    #[test]
    fn test_overlap_disjoint_and_touching() {
        assert_eq!(calculate_overlap(&[0], &[4], &[10], &[2]), None);
        // Boxes that only share a boundary have no elements in common.
        assert_eq!(calculate_overlap(&[0, 0], &[4, 4], &[4, 0], &[2, 4]), None);
        assert_eq!(calculate_overlap(&[0], &[4], &[0, 0], &[1, 1]), None);
        assert_eq!(calculate_overlap(&[], &[], &[], &[]), Some((vec![], vec![])));
    }

    #[test]
    fn test_copy_inner_selection_row_major() {
        // 4x4 block at origin holding 0..16, select the 2x2 box at [1,1].
        let src = bytes_of(&(0..16).collect::<Vec<_>>());
        let mut dst = vec![0u8; 8];
        let copied = copy_selection(
            &src,
            &[0, 0],
            &[4, 4],
            BlockLayout::native(),
            &mut dst,
            &[1, 1],
            &[2, 2],
            DataType::UInt16,
        )
        .unwrap();
        assert_eq!(copied, 8);
        assert_eq!(values_of(&dst), vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_copy_partial_block_into_larger_selection() {
        // Block [2,2]+[5,2] against selection [0,0]+[4,4].
        let src = bytes_of(&(1..=10).collect::<Vec<_>>());
        let mut dst = vec![0u8; 32];
        let copied = copy_selection(
            &src,
            &[2, 2],
            &[5, 2],
            BlockLayout::native(),
            &mut dst,
            &[0, 0],
            &[4, 4],
            DataType::UInt16,
        )
        .unwrap();
        assert_eq!(copied, 8);
        let out = values_of(&dst);
        assert_eq!(&out[8..12], &[0, 0, 1, 2]);
        assert_eq!(&out[12..16], &[0, 0, 3, 4]);
        assert!(out[..8].iter().all(|v| *v == 0));
    }

    #[test]
    fn test_overlap_near_u64_max() {
        assert_eq!(calculate_overlap(&[u64::MAX], &[2], &[0], &[4]), None);
        assert_eq!(calculate_overlap(&[0], &[4], &[u64::MAX - 1], &[5]), None);
        // Boxes ending exactly at u64::MAX still intersect.
        assert_eq!(
            calculate_overlap(&[u64::MAX - 4], &[4], &[u64::MAX - 2], &[2]),
            Some((vec![u64::MAX - 2], vec![2]))
        );

        let src = bytes_of(&[1, 2, 3, 4]);
        let mut dst = vec![0xAAu8; 2];
        let copied = copy_selection(
            &src,
            &[0],
            &[4],
            BlockLayout::native(),
            &mut dst,
            &[u64::MAX],
            &[1],
            DataType::UInt16,
        )
        .unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn test_copy_outside_block_is_noop() {
        let src = bytes_of(&[1, 2, 3, 4]);
        let mut dst = vec![0xAAu8; 4];
        let copied = copy_selection(
            &src,
            &[0],
            &[4],
            BlockLayout::native(),
            &mut dst,
            &[8],
            &[2],
            DataType::UInt16,
        )
        .unwrap();
        assert_eq!(copied, 0);
        assert_eq!(dst, vec![0xAA; 4]);
    }

    #[test]
    fn test_copy_column_major_source() {
        // 2x3 array [[1,2,3],[4,5,6]] stored column-major.
        let src = bytes_of(&[1, 4, 2, 5, 3, 6]);
        let layout = BlockLayout::native() - BlockLayout::ROW_MAJOR;
        let mut dst = vec![0u8; 12];
        copy_selection(
            &src,
            &[0, 0],
            &[2, 3],
            layout,
            &mut dst,
            &[0, 0],
            &[2, 3],
            DataType::UInt16,
        )
        .unwrap();
        assert_eq!(values_of(&dst), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_copy_swaps_foreign_endian() {
        let src: Vec<u8> = [0x0102u16, 0x0304]
            .iter()
            .flat_map(|v| v.swap_bytes().to_ne_bytes())
            .collect();
        let layout = BlockLayout::native() ^ BlockLayout::LITTLE_ENDIAN;
        let mut dst = vec![0u8; 4];
        copy_selection(&src, &[0], &[2], layout, &mut dst, &[0], &[2], DataType::UInt16)
            .unwrap();
        assert_eq!(values_of(&dst), vec![0x0102, 0x0304]);
    }

    #[test]
    fn test_copy_scalar() {
        let src = 7.5f64.to_ne_bytes();
        let mut dst = [0u8; 8];
        let copied = copy_selection(
            &src,
            &[],
            &[],
            BlockLayout::native(),
            &mut dst,
            &[],
            &[],
            DataType::Double,
        )
        .unwrap();
        assert_eq!(copied, 8);
        assert_eq!(f64::from_ne_bytes(dst), 7.5);
    }

    #[test]
    fn test_copy_rejects_short_destination() {
        let src = bytes_of(&[1, 2, 3, 4]);
        let mut dst = vec![0u8; 2];
        let err = copy_selection(
            &src,
            &[0],
            &[4],
            BlockLayout::native(),
            &mut dst,
            &[0],
            &[4],
            DataType::UInt16,
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::InvalidArgument(_)));
    }

    fn boxes() -> impl Strategy<Value = (Vec<u64>, Vec<u64>, Vec<u64>, Vec<u64>)> {
        (1usize..4).prop_flat_map(|n| {
            (
                prop::collection::vec(0u64..8, n),
                prop::collection::vec(1u64..6, n),
                prop::collection::vec(0u64..8, n),
                prop::collection::vec(1u64..6, n),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_overlap_is_contained_and_symmetric((a_start, a_count, b_start, b_count) in boxes()) {
            let ab = calculate_overlap(&a_start, &a_count, &b_start, &b_count);
            let ba = calculate_overlap(&b_start, &b_count, &a_start, &a_count);
            prop_assert_eq!(&ab, &ba);
            if let Some((start, count)) = ab {
                for d in 0..start.len() {
                    prop_assert!(count[d] > 0);
                    prop_assert!(start[d] >= a_start[d] && start[d] >= b_start[d]);
                    prop_assert!(start[d] + count[d] <= a_start[d] + a_count[d]);
                    prop_assert!(start[d] + count[d] <= b_start[d] + b_count[d]);
                }
            }
        }

        #[test]
        fn prop_copied_bytes_match_overlap((a_start, a_count, b_start, b_count) in boxes()) {
            let esize = DataType::UInt16.size();
            let src = vec![1u8; element_count(&a_count) as usize * esize];
            let mut dst = vec![0u8; element_count(&b_count) as usize * esize];
            let copied = copy_selection(
                &src, &a_start, &a_count, BlockLayout::native(),
                &mut dst, &b_start, &b_count, DataType::UInt16,
            ).unwrap();
            let expected = calculate_overlap(&a_start, &a_count, &b_start, &b_count)
                .map_or(0, |(_, count)| element_count(&count) as usize * esize);
            prop_assert_eq!(copied, expected);
            prop_assert_eq!(dst.iter().filter(|b| **b == 1).count(), expected);
        }
    }
}
