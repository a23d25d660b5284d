use geometry::{Point, Vector};
use units::todo::Lengthf32;

use crate::{
    LOR,
    fov::FOV,
    image::Region,
    tof::TofWindow,
};

use super::{SystemMatrix, SystemMatrixRow};

/// Exact ray traversal: the weight of a voxel is the length of the LOR inside
/// it.
///
/// With more than one ray per axis, each LOR is replaced by a bundle of
/// parallel rays spread across the faces of its two crystals, and the weights
/// are averaged over the bundle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Siddon {
    pub rays_transaxial: usize,
    pub rays_axial: usize,
    /// Crystal face widths over which the rays are spread
    pub crystal_width_transaxial: Lengthf32,
    pub crystal_width_axial: Lengthf32,
}

impl Default for Siddon {
    fn default() -> Self { Self::single_ray() }
}

impl Siddon {

    pub fn single_ray() -> Self {
        Self { rays_transaxial: 1, rays_axial: 1, crystal_width_transaxial: 0.0, crystal_width_axial: 0.0 }
    }

    pub fn multi_ray(rays_transaxial: usize, rays_axial: usize, widths: (Lengthf32, Lengthf32)) -> Self {
        Self {
            rays_transaxial: rays_transaxial.max(1),
            rays_axial: rays_axial.max(1),
            crystal_width_transaxial: widths.0,
            crystal_width_axial: widths.1,
        }
    }

    pub fn n_rays(&self) -> usize { self.rays_transaxial * self.rays_axial }

    /// Endpoints of every ray of the bundle replacing `lor`
    fn rays(&self, lor: &LOR) -> impl Iterator<Item = (Point, Point)> + '_ {
        let (p1, p2) = (lor.p1, lor.p2);
        // Tangent to the ring at each end, oriented so that equal offsets at
        // both ends produce parallel rays
        let tangent = |p: Point| {
            let r = Vector::new(p.x, p.y, 0.0);
            let norm = r.norm();
            if norm > 0.0 { Vector::new(-r.y, r.x, 0.0) / norm } else { Vector::zeros() }
        };
        let (t1, t2) = (tangent(p1), -tangent(p2));
        let axial = Vector::z();
        let offset = |k: usize, n: usize, width: Lengthf32| ((k as f32 + 0.5) / n as f32 - 0.5) * width;
        itertools::iproduct!(0..self.rays_transaxial, 0..self.rays_axial).map(move |(a, b)| {
            let ot = offset(a, self.rays_transaxial, self.crystal_width_transaxial);
            let oa = offset(b, self.rays_axial     , self.crystal_width_axial     );
            (p1 + t1 * ot + axial * oa, p2 + t2 * ot + axial * oa)
        })
    }

    /// Append the voxels crossed by the segment `p1`-`p2`, with their
    /// weights multiplied by `scale`
    #[inline]
    fn trace(row: &mut SystemMatrixRow, p1: Point, p2: Point, region: &Region, tof: Option<&TofWindow>, scale: f32) {
        let Some(FovHit { mut next_boundary, voxel_size, mut index, delta_index, mut remaining, entry_distance, chord })
            = lor_fov_hit(p1, p2, &region.fov) else { return };

        // How far we have moved since entering the FOV
        let mut here = 0.0;

        loop {
            // Which voxel boundary will be hit next, and its position
            let (dimension, boundary_position) = next_boundary.argmin();
            let boundary_position = boundary_position.min(chord);

            // The weight is the length of LOR in this voxel
            let mut weight = boundary_position - here;

            if let Some(tof) = tof {
                weight *= tof.weight(entry_distance + (here + boundary_position) / 2.0);
            }

            if weight > 0.0 {
                row.push(region.offset + index as usize, weight * scale);
            }

            // Stop at the far face of the FOV
            if boundary_position >= chord { break }

            // Move along LOR until it leaves this voxel
            here = boundary_position;

            // Find the next boundary in this dimension
            next_boundary[dimension] += voxel_size[dimension];

            // Move index across the boundary we are crossing
            index += delta_index[dimension];
            remaining[dimension] -= 1;

            // If we have traversed the whole FOV, we're finished
            if remaining[dimension] == 0 { break }
        }
    }
}

impl SystemMatrix for Siddon {
    type Data = ();

    fn data(&self, _fov: &FOV) -> Self::Data {}

    fn update_system_matrix_row(&self, row: &mut SystemMatrixRow, lor: &LOR, region: &Region, _: &(), tof: Option<&TofWindow>) {
        if self.n_rays() == 1 {
            Self::trace(row, lor.p1, lor.p2, region, tof, 1.0);
        } else {
            let scale = 1.0 / self.n_rays() as f32;
            for (p1, p2) in self.rays(lor) {
                Self::trace(row, p1, p2, region, tof, scale);
            }
        }
    }

    fn capacity(&self, fov: &FOV) -> usize {
        let [nx, ny, nz] = fov.n;
        (nx + ny + nz) * self.n_rays()
    }
}

/// Information about where a LOR enters the FOV, and how to step through the
/// voxels along it.
#[derive(Clone, Copy, Debug)]
pub struct FovHit {
    /// Distance from the entry point to the next voxel boundary, in each
    /// dimension
    pub next_boundary: Vector,
    /// Distance along the LOR between successive boundaries, in each
    /// dimension
    pub voxel_size: Vector,
    /// 1D index of the first voxel crossed
    pub index: i32,
    /// Change of 1D index when crossing a boundary, in each dimension
    pub delta_index: [i32; 3],
    /// Boundaries left to cross before leaving the FOV, in each dimension
    pub remaining: [i32; 3],
    /// Distance from the LOR's first point to the entry point
    pub entry_distance: Lengthf32,
    /// Length of the LOR inside the FOV
    pub chord: Lengthf32,
}

/// Figure out if the segment `p1`-`p2` hits the FOV, and if so, where it
/// enters and how to traverse the voxels from there.
pub fn lor_fov_hit(p1: Point, p2: Point, fov: &FOV) -> Option<FovHit> {
    let (entry, exit) = fov.aabb().chord(p1, p2)?;
    let chord = (exit - entry).norm();
    if !(chord > 0.0) { return None }

    let direction = (p2 - p1).normalize();
    let lower = fov.lower_corner();
    let [nx, ny, _] = fov.n;
    let n = fov.n.map(|n| n as i32);
    let stride = [1, nx as i32, (nx * ny) as i32];

    let mut next_boundary = Vector::zeros();
    let mut voxel_size    = Vector::zeros();
    let mut index3        = [0_i32; 3];
    let mut delta_index   = [0_i32; 3];
    let mut remaining     = [0_i32; 3];

    for d in 0..3 {
        let u = direction[d];
        // Entry point in voxel units, from the lower corner
        let e = ((entry[d] - lower[d]) / fov.voxel_size[d]).clamp(0.0, n[d] as f32);
        if u >= 0.0 {
            let i = (e.floor() as i32).min(n[d] - 1);
            index3[d]      = i;
            remaining[d]   = n[d] - i;
            delta_index[d] = stride[d];
            if u > 0.0 {
                voxel_size[d]    = fov.voxel_size[d] / u;
                next_boundary[d] = (i as f32 + 1.0 - e) * voxel_size[d];
            } else {
                voxel_size[d]    = Lengthf32::INFINITY;
                next_boundary[d] = Lengthf32::INFINITY;
            }
        } else {
            let i = (e.ceil() as i32 - 1).clamp(0, n[d] - 1);
            index3[d]        = i;
            remaining[d]     = i + 1;
            delta_index[d]   = -stride[d];
            voxel_size[d]    = fov.voxel_size[d] / -u;
            next_boundary[d] = (e - i as f32) * voxel_size[d];
        }
    }

    let index = index3[0] + stride[1] * index3[1] + stride[2] * index3[2];
    let entry_distance = (entry - p1).norm();
    Some(FovHit { next_boundary, voxel_size, index, delta_index, remaining, entry_distance, chord })
}
