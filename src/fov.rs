/// The size and granularity of a Field of View (FOV): a box of voxels in which
/// activity is reconstructed.

use geometry::{AaBox, Point, Vector};
use units::{mm_, Length, todo::Lengthf32};

use crate::index::{BoxDim_u, Index3_u, Index1_u, index1_to_3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FOV {
    pub centre: Point,
    pub half_width: Vector,
    pub n: BoxDim_u,
    pub voxel_size: Vector,
}

impl FOV {

    /// FOV centred on the scanner's origin
    pub fn new(
        full_size: (Length, Length, Length),
        (nx, ny, nz): (usize, usize, usize)
    ) -> Self {
        let (dx, dy, dz) = full_size;
        Self::from_mm([mm_(dx), mm_(dy), mm_(dz)], [nx, ny, nz])
    }

    pub fn from_mm(full_size: [Lengthf32; 3], n: BoxDim_u) -> Self {
        let half_width = Vector::new(full_size[0] / 2.0, full_size[1] / 2.0, full_size[2] / 2.0);
        let voxel_size = Self::voxel_size(n, half_width);
        Self { centre: Point::origin(), half_width, n, voxel_size }
    }

    /// FOV spanning the box between `lower` and `upper` corners
    pub fn between(lower: Point, upper: Point, n: BoxDim_u) -> Self {
        let half_width = (upper - lower) / 2.0;
        let centre = lower + half_width;
        let voxel_size = Self::voxel_size(n, half_width);
        Self { centre, half_width, n, voxel_size }
    }

    pub fn with_centre(self, centre: Point) -> Self { Self { centre, ..self } }

    fn voxel_size(n: BoxDim_u, half_width: Vector) -> Vector {
        let full_width = half_width * 2.0;
        Vector::new(full_width[0] / n[0] as f32,
                    full_width[1] / n[1] as f32,
                    full_width[2] / n[2] as f32,
        )
    }

    pub fn n_voxels(&self) -> usize { self.n.iter().product() }

    pub fn voxel_volume(&self) -> Lengthf32 { self.voxel_size.iter().product() }

    pub fn aabb(&self) -> AaBox { AaBox::new(self.centre, self.half_width) }

    pub fn lower_corner(&self) -> Point { self.centre - self.half_width }

    /// Find centre of voxel with given 3D index
    pub fn voxel_centre(&self, i: Index3_u) -> Point {
        let s = self.voxel_size;
        self.lower_corner() + Vector::new((i[0] as Lengthf32 + 0.5) * s.x,
                                          (i[1] as Lengthf32 + 0.5) * s.y,
                                          (i[2] as Lengthf32 + 0.5) * s.z)
    }

    /// Find centre of voxel with given 1D index
    pub fn voxel_centre1(&self, i: Index1_u) -> Point {
        self.voxel_centre(index1_to_3(i, self.n))
    }

    /// Index of the voxel containing `p`. Points on the upper faces belong to
    /// the last voxel.
    pub fn voxel_of(&self, p: Point) -> Option<Index3_u> {
        let local = p - self.lower_corner();
        let mut index = [0; 3];
        for d in 0..3 {
            let x = local[d] / self.voxel_size[d];
            if !(0.0..=self.n[d] as f32).contains(&x) { return None }
            index[d] = (x as usize).min(self.n[d] - 1);
        }
        Some(index)
    }

    /// Point at which the segment `p1`-`p2` enters the FOV
    pub fn entry(&self, p1: Point, p2: Point) -> Option<Point> {
        self.aabb().entry(p1, p2)
    }

    /// Do the two FOVs share any volume?
    pub fn overlaps(&self, other: &FOV) -> bool {
        let d = other.centre - self.centre;
        (0..3).all(|i| d[i].abs() < self.half_width[i] + other.half_width[i] - 1e-4)
    }
}
