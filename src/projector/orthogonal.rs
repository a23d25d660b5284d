use geometry::{Point, Vector, AaBox, distance_to_line, project_onto_line};
use units::todo::Lengthf32;

use crate::{
    LOR,
    fov::FOV,
    image::Region,
    index::index3_to_1,
    tof::TofWindow,
};

use super::{SystemMatrix, SystemMatrixRow};

/// Tube of response of fixed width around the LOR. Voxels whose centres lie
/// within `width` of the line get a weight falling linearly from the full
/// step length on the line to zero at the edge of the tube.
///
/// With `planar` set, distances are measured in the transaxial plane only, so
/// the tube has the width of a single voxel slice axially.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Orthogonal {
    pub width: Lengthf32,
    pub planar: bool,
}

impl Orthogonal {
    pub fn new_3d(width: Lengthf32) -> Self { Self { width, planar: false } }
    pub fn new_2d(width: Lengthf32) -> Self { Self { width, planar: true  } }
}

impl SystemMatrix for Orthogonal {
    type Data = ();

    fn data(&self, _fov: &FOV) -> Self::Data {}

    fn update_system_matrix_row(&self, row: &mut SystemMatrixRow, lor: &LOR, region: &Region, _: &(), tof: Option<&TofWindow>) {
        let width = self.width;
        voxels_near_line(lor.p1, lor.p2, &region.fov, width, self.planar, |index, distance, along, step| {
            let mut weight = (1.0 - distance / width) * step;
            if let Some(tof) = tof { weight *= tof.weight(along) }
            if weight > 0.0 { row.push(region.offset + index, weight) }
        });
    }

    fn capacity(&self, fov: &FOV) -> usize {
        let [nx, ny, nz] = fov.n;
        let across = 2 * (self.width / fov.voxel_size.min()).ceil() as usize + 2;
        (nx + ny + nz) * across * if self.planar { 1 } else { across }
    }
}

/// Visit the voxels of `fov` whose centres lie closer than `reach` to the
/// line through `p1` and `p2`, near the part of the segment inside the FOV.
///
/// The FOV is sliced perpendicular to the axis along which the line advances
/// fastest; within each slice only a window of voxels around the line's
/// crossing point is examined. `visit` receives the voxel's 1D index, its
/// distance from the line, the distance from `p1` to the foot of that
/// distance, and the length of line per slice.
pub(super) fn voxels_near_line(
    p1: Point, p2: Point, fov: &FOV, reach: Lengthf32, planar: bool,
    mut visit: impl FnMut(usize, Lengthf32, Lengthf32, Lengthf32),
) {
    let expanded = AaBox::new(fov.centre, fov.half_width + Vector::repeat(reach));
    let Some((a, b)) = expanded.chord(p1, p2) else { return };
    let length = (p2 - p1).norm();
    if !(length > 0.0) { return }
    let u = (p2 - p1) / length;

    let transaxial = Vector::new(u.x, u.y, 0.0);
    let planar = planar && transaxial.norm() > 1e-6;
    let candidates: &[usize] = if planar { &[0, 1] } else { &[0, 1, 2] };
    let Some(&main) = candidates.iter().max_by(|&&i, &&j| u[i].abs().total_cmp(&u[j].abs())) else { return };
    let others: Vec<usize> = if planar { vec![1 - main] } else { (0..3).filter(|&d| d != main).collect() };

    let lower = fov.lower_corner();
    let vs = fov.voxel_size;
    let n = fov.n;
    let step = vs[main] / u[main].abs();
    let slice_of = |x: Lengthf32| ((x - lower[main]) / vs[main]).floor();
    let (k_lo, k_hi) = {
        let (s, t) = (slice_of(a[main]), slice_of(b[main]));
        (s.min(t).max(0.0) as usize, (s.max(t).min(n[main] as f32 - 1.0)).max(-1.0) as isize)
    };
    if k_hi < 0 { return }

    let transaxial_u = transaxial.normalize();
    let distance = |c: Point| -> Lengthf32 {
        if planar {
            let w = Vector::new(c.x - p1.x, c.y - p1.y, 0.0);
            (w - transaxial_u * w.dot(&transaxial_u)).norm()
        } else {
            distance_to_line(c, p1, u)
        }
    };

    let window = |d: usize| (reach / (u[main].abs() * vs[d])).ceil() as isize + 1;
    let range_around = |d: usize, x: Lengthf32| {
        let centre = ((x - lower[d]) / vs[d]).floor() as isize;
        let w = window(d);
        (centre - w).max(0)..=(centre + w).min(n[d] as isize - 1)
    };

    for k in k_lo as isize..=k_hi {
        let plane = lower[main] + (k as f32 + 0.5) * vs[main];
        let t = (plane - p1[main]) / u[main];
        let q = p1 + u * t;
        let mut index = [0_usize; 3];
        index[main] = k as usize;
        if planar {
            // Single axial slice, at the height of the line
            let iz = ((q.z - lower.z) / vs.z).floor();
            if iz < 0.0 || iz >= n[2] as f32 { continue }
            index[2] = iz as usize;
            let d = others[0];
            for i in range_around(d, q[d]) {
                index[d] = i as usize;
                let c = fov.voxel_centre(index);
                let dist = distance(c);
                if dist < reach { visit(index3_to_1(index, n), dist, project_onto_line(c, p1, u), step) }
            }
        } else {
            let (d1, d2) = (others[0], others[1]);
            for i in range_around(d1, q[d1]) {
                index[d1] = i as usize;
                for j in range_around(d2, q[d2]) {
                    index[d2] = j as usize;
                    let c = fov.voxel_centre(index);
                    let dist = distance(c);
                    if dist < reach { visit(index3_to_1(index, n), dist, project_onto_line(c, p1, u), step) }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::VolumeLayout;
    use float_eq::assert_float_eq;

    fn row_for(kernel: &Orthogonal, lor: &LOR, fov: FOV) -> SystemMatrixRow {
        let mut row = SystemMatrixRow::default();
        kernel.update_system_matrix_row(&mut row, lor, VolumeLayout::single(fov).inner(), &(), None);
        row
    }

    #[test]
    fn voxel_on_line_gets_full_step() {
        let fov = FOV::from_mm([10.0, 10.0, 10.0], [5, 5, 5]);
        let lor = LOR::new(Point::new(-20.0, 0.0, 0.0), Point::new(20.0, 0.0, 0.0));
        let row = row_for(&Orthogonal::new_3d(1.5), &lor, fov);
        // Centres on the line are at (x, 0, 0): index (ix, 2, 2); nothing else
        // is within 1.5 mm because neighbouring centres are 2 mm away
        assert_eq!(row.len(), 5);
        for (i, w) in &row {
            assert_eq!(crate::index::index1_to_3(i, fov.n)[1..], [2, 2]);
            assert_float_eq!(w, 2.0, abs <= 1e-5);
        }
    }

    #[test]
    fn tube_reaches_neighbouring_voxels() {
        let fov = FOV::from_mm([10.0, 10.0, 10.0], [5, 5, 5]);
        let lor = LOR::new(Point::new(-20.0, 0.0, 0.0), Point::new(20.0, 0.0, 0.0));
        let row = row_for(&Orthogonal::new_3d(2.5), &lor, fov);
        // Centre line plus 4 face neighbours per slice (at 2 mm); diagonal
        // neighbours are 2.83 mm away
        assert_eq!(row.len(), 5 * 5);
        let weights: Vec<f32> = row.iter().map(|(_, w)| w).collect();
        assert!(weights.iter().any(|&w| (w - 2.0 * (1.0 - 2.0 / 2.5)).abs() < 1e-4));
    }

    #[test]
    fn planar_tube_ignores_axial_distance() {
        let fov = FOV::from_mm([10.0, 10.0, 10.0], [5, 5, 5]);
        let lor = LOR::new(Point::new(-20.0, 0.0, 0.5), Point::new(20.0, 0.0, 0.5));
        let row = row_for(&Orthogonal::new_2d(2.5), &lor, fov);
        // One axial slice, three voxels across per x slice
        assert_eq!(row.len(), 5 * 3);
        assert!(row.iter().all(|(i, _)| crate::index::index1_to_3(i, fov.n)[2] == 2));
    }

    #[test]
    fn oblique_lor_stays_near_line() {
        let fov = FOV::from_mm([20.0, 20.0, 20.0], [10, 10, 10]);
        let lor = LOR::new(Point::new(-30.0, -20.0, -5.0), Point::new(30.0, 25.0, 4.0));
        let kernel = Orthogonal::new_3d(3.0);
        let row = row_for(&kernel, &lor, fov);
        assert!(!row.is_empty());
        let u = lor.direction();
        for (i, w) in &row {
            assert!(distance_to_line(fov.voxel_centre1(i), lor.p1, u) < 3.0);
            assert!(w > 0.0);
        }
    }

    #[test]
    fn distant_lor_has_no_weights() {
        let fov = FOV::from_mm([10.0, 10.0, 10.0], [5, 5, 5]);
        let lor = LOR::new(Point::new(-20.0, 9.0, 0.0), Point::new(20.0, 9.0, 0.0));
        assert!(row_for(&Orthogonal::new_3d(2.0), &lor, fov).is_empty());
    }
}
