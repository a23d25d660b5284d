//! Conversion between 1D (storage) and 3D (geometric) voxel indices.
//!
//! Voxels are stored with x varying fastest and z slowest.

#[allow(non_camel_case_types)] pub type Index1_u = usize;
#[allow(non_camel_case_types)] pub type Index3_u = [usize; 3];
#[allow(non_camel_case_types)] pub type BoxDim_u = [usize; 3];

/// Signed offset to a neighbouring voxel
pub type Offset3 = [isize; 3];

use std::ops::{Add, Div, Mul, Rem};

pub fn index3_to_1<T>([ix, iy, iz]: [T; 3], [nx, ny, _nz]: [T; 3]) -> T
where
    T: Mul<Output = T> + Add<Output = T>
{
    ix + (iy + iz * ny) * nx
}

#[allow(clippy::many_single_char_names)]
pub fn index1_to_3<T>(i: T, [nx, ny, _nz]: [T; 3]) -> [T; 3]
where
    T: Mul<Output = T> +
    Div<Output = T> +
    Rem<Output = T> +
    Copy
{
    let z = i / (nx * ny);
    let r = i % (nx * ny);
    let y = r / nx;
    let x = r % nx;
    [x,y,z]
}

/// The neighbour of `i` at `offset`, replicating edge voxels when the offset
/// points outside the box.
#[inline]
pub fn clamped_neighbour(i: Index3_u, offset: Offset3, n: BoxDim_u) -> Index3_u {
    let clamp = |d: usize| (i[d] as isize + offset[d]).clamp(0, n[d] as isize - 1) as usize;
    [clamp(0), clamp(1), clamp(2)]
}

/// The neighbour of `i` at `offset`, or `None` if it lies outside the box.
#[inline]
pub fn checked_neighbour(i: Index3_u, offset: Offset3, n: BoxDim_u) -> Option<Index3_u> {
    let shift = |d: usize| {
        let j = i[d] as isize + offset[d];
        (0..n[d] as isize).contains(&j).then_some(j as usize)
    };
    Some([shift(0)?, shift(1)?, shift(2)?])
}

#[cfg(test)]
mod test_index_conversion {
    use super::*;
    use rstest::rstest;

    #[rstest(/**/    size   , index3 , index1,
             case([ 1, 1, 1], [0,0,0],   0),
             case([ 7, 1, 1], [4,0,0],   4),
             case([ 1, 6, 1], [0,5,0],   5),
             case([ 1, 1, 3], [0,0,2],   2),
             case([ 4, 3, 1], [1,2,0],   9),
             case([ 4, 3, 5], [3,2,4],  59),
             case([ 2, 5, 3], [1,0,2],  21),
    )]
    fn hand_picked(size: Index3_u, index3: Index3_u, index1: usize) {
        assert_eq!(index3_to_1(index3, size), index1);
        assert_eq!(index1_to_3(index1, size), index3);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn index_roundtrip((size, index) in (1..50_usize, 1..50_usize, 1..50_usize)
                           .prop_flat_map(|(nx, ny, nz)| (Just([nx, ny, nz]), 0..nx*ny*nz))
        ) {
            let there = index1_to_3(index, size);
            let back  = index3_to_1(there, size);
            assert_eq!(back, index)
        }
    }

    #[rstest(/**/ index  ,   offset   , expected,
             case([0,0,0], [-1, 0, 0], [0,0,0]),
             case([0,0,0], [ 1, 1, 1], [1,1,1]),
             case([3,2,1], [ 2, 0,-3], [3,2,0]),
             case([1,1,1], [ 0,-1, 1], [1,0,2]),
    )]
    fn neighbours_replicate_edges(index: Index3_u, offset: Offset3, expected: Index3_u) {
        assert_eq!(clamped_neighbour(index, offset, [4, 3, 3]), expected);
    }

    #[test]
    fn checked_neighbour_rejects_outside() {
        assert_eq!(checked_neighbour([0,0,0], [-1,0,0], [4,3,3]), None);
        assert_eq!(checked_neighbour([3,2,2], [ 0,0,1], [4,3,3]), None);
        assert_eq!(checked_neighbour([1,1,1], [ 1,1,1], [4,3,3]), Some([2,2,2]));
    }
}
