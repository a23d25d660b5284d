//! Line integral by sampling: points spaced evenly along the LOR, each shared
//! between its eight nearest voxel centres with trilinear weights.

use units::todo::Lengthf32;

use crate::{
    LOR,
    fov::FOV,
    image::Region,
    index::index3_to_1,
    tof::TofWindow,
};

use super::{SystemMatrix, SystemMatrixRow};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interpolation {
    /// Sample spacing, relative to the smaller transaxial voxel size
    pub step: f32,
}

impl Interpolation {
    fn spacing(&self, fov: &FOV) -> Lengthf32 {
        self.step * fov.voxel_size.x.min(fov.voxel_size.y)
    }
}

impl SystemMatrix for Interpolation {
    type Data = ();

    fn data(&self, _fov: &FOV) -> Self::Data {}

    fn update_system_matrix_row(&self, row: &mut SystemMatrixRow, lor: &LOR, region: &Region, _: &(), tof: Option<&TofWindow>) {
        let fov = &region.fov;
        let Some((a, b)) = fov.aabb().chord(lor.p1, lor.p2) else { return };
        let chord = (b - a).norm();
        let spacing = self.spacing(fov);
        if !(chord > 0.0) || !(spacing > 0.0) { return }
        let n_samples = (chord / spacing).ceil().max(1.0) as usize;
        let h = chord / n_samples as f32;
        let u = (b - a) / chord;
        let start = (a - lor.p1).norm();

        let lower = fov.lower_corner();
        let vs = fov.voxel_size;
        let n = fov.n;
        for k in 0..n_samples {
            let t = (k as f32 + 0.5) * h;
            let p = a + u * t;
            let sample = match tof {
                Some(tof) => h * tof.weight(start + t),
                None => h,
            };
            if sample <= 0.0 { continue }
            // Position in units of voxels, relative to the first voxel centre
            let g = (p - lower).component_div(&vs).add_scalar(-0.5);
            let base = [g.x.floor(), g.y.floor(), g.z.floor()];
            let frac = [g.x - base[0], g.y - base[1], g.z - base[2]];
            for corner in 0..8 {
                let mut index = [0; 3];
                let mut weight = sample;
                let mut inside = true;
                for d in 0..3 {
                    let high = (corner >> d) & 1 == 1;
                    let i = base[d] as isize + high as isize;
                    if i < 0 || i >= n[d] as isize { inside = false; break }
                    index[d] = i as usize;
                    weight *= if high { frac[d] } else { 1.0 - frac[d] };
                }
                if inside && weight > 0.0 { row.push(region.offset + index3_to_1(index, n), weight) }
            }
        }
    }

    fn capacity(&self, fov: &FOV) -> usize {
        let diagonal = 2.0 * fov.half_width.norm();
        8 * ((diagonal / self.spacing(fov)).ceil() as usize + 1)
    }
}
