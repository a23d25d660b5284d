use units::{Length, mm_, todo::Lengthf32};

/// Positions in the scanner frame, in mm. The z-axis is the scanner axis.
pub type Point  = nalgebra::Point3 <Lengthf32>;
pub type Vector = nalgebra::Vector3<Lengthf32>;

/// Convert a `uom`-aware position into the `f32`-in-mm representation used in
/// the inner loops.
pub fn point_mm(x: Length, y: Length, z: Length) -> Point {
    Point::new(mm_(x), mm_(y), mm_(z))
}

/// Perpendicular distance from `q` to the line passing through `p` with *unit*
/// direction `u`.
#[inline]
pub fn distance_to_line(q: Point, p: Point, u: Vector) -> Lengthf32 {
    let w = q - p;
    (w - u * w.dot(&u)).norm()
}

/// Signed distance from `p` to the foot of the perpendicular dropped from `q`
/// onto the line through `p` with *unit* direction `u`.
#[inline]
pub fn project_onto_line(q: Point, p: Point, u: Vector) -> Lengthf32 {
    (q - p).dot(&u)
}
