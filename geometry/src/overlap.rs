//! Overlap volumes between spheres and infinite cylinders.
//!
//! The volume-of-intersection projector models each voxel as a sphere and the
//! tube of response as a cylinder. The weight of a voxel is proportional to the
//! volume they share, which depends only on the radii and on the perpendicular
//! distance between the sphere's centre and the cylinder's axis.

use std::f32::consts::{FRAC_PI_2, PI};
use units::todo::Lengthf32;

/// Area of the intersection of two circles with radii `r1` and `r2` whose
/// centres are `d` apart.
pub fn lens_area(r1: Lengthf32, r2: Lengthf32, d: Lengthf32) -> Lengthf32 {
    if r1 <= 0.0 || r2 <= 0.0 || d >= r1 + r2 { return 0.0 }
    if d <= (r1 - r2).abs() {
        let r = r1.min(r2);
        return PI * r * r
    }
    let acos = |x: f32| x.clamp(-1.0, 1.0).acos();
    let a1 = r1 * r1 * acos((d * d + r1 * r1 - r2 * r2) / (2.0 * d * r1));
    let a2 = r2 * r2 * acos((d * d + r2 * r2 - r1 * r1) / (2.0 * d * r2));
    let kite = (-d + r1 + r2) * (d + r1 - r2) * (d - r1 + r2) * (d + r1 + r2);
    a1 + a2 - 0.5 * kite.max(0.0).sqrt()
}

/// Volume of the intersection of a sphere of radius `sphere` with an infinite
/// cylinder of radius `cylinder`, whose axis passes at distance `d` from the
/// sphere's centre.
///
/// The sphere is sliced perpendicular to the cylinder axis: each slice is a
/// disc intersecting the cylinder's circular cross-section. Slices are
/// parametrized by `z = sphere * sin(θ)` to remove the square-root singularity
/// at the poles, and integrated with Simpson's rule.
pub fn sphere_cylinder_overlap(sphere: Lengthf32, cylinder: Lengthf32, d: Lengthf32) -> Lengthf32 {
    if d >= sphere + cylinder { return 0.0 }
    if d + sphere <= cylinder { return 4.0 / 3.0 * PI * sphere.powi(3) }
    const N: usize = 128; // must be even
    let h = FRAC_PI_2 / N as f32;
    let slice = |theta: f32| {
        let c = theta.cos();
        lens_area(sphere * c, cylinder, d) * sphere * c
    };
    let mut sum = slice(0.0) + slice(FRAC_PI_2);
    for i in 1..N {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * slice(i as f32 * h);
    }
    // Factor 2: integrated over one hemisphere only
    2.0 * sum * h / 3.0
}

/// Tabulated `sphere_cylinder_overlap` for fixed radii, interpolated linearly
/// in the distance. The exact evaluation is far too slow for the projector
/// inner loop.
#[derive(Clone, Debug)]
pub struct OverlapTable {
    step: Lengthf32,
    values: Vec<Lengthf32>,
    sphere_volume: Lengthf32,
}

impl OverlapTable {

    pub fn new(sphere: Lengthf32, cylinder: Lengthf32, n: usize) -> Self {
        let n = n.max(2);
        let max_distance = sphere + cylinder;
        let step = max_distance / (n - 1) as f32;
        let values = (0..n)
            .map(|i| sphere_cylinder_overlap(sphere, cylinder, i as f32 * step))
            .collect();
        let sphere_volume = 4.0 / 3.0 * PI * sphere.powi(3);
        Self { step, values, sphere_volume }
    }

    /// Overlap volume at distance `d`; zero beyond `sphere + cylinder`.
    pub fn at(&self, d: Lengthf32) -> Lengthf32 {
        let x = d / self.step;
        let i = x.floor() as usize;
        if i + 1 >= self.values.len() { return 0.0 }
        let f = x - i as f32;
        self.values[i] * (1.0 - f) + self.values[i + 1] * f
    }

    /// Largest distance at which the overlap is non-zero
    pub fn reach(&self) -> Lengthf32 { self.step * (self.values.len() - 1) as f32 }

    pub fn sphere_volume(&self) -> Lengthf32 { self.sphere_volume }
}
