use parry3d::query::{Ray, RayCast};
use parry3d::shape::Cuboid;

use units::todo::Lengthf32;
use crate::{Point, Vector};

/// An axis-aligned box, described by its centre and half-widths.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AaBox {
    pub centre: Point,
    pub half_width: Vector,
}

impl AaBox {

    pub fn new(centre: Point, half_width: Vector) -> Self { Self { centre, half_width } }

    /// The point at which the segment going from `p1` to `p2` first enters the
    /// box. If `p1` lies inside the box, `p1` itself is the entry point.
    /// `None` if the segment misses the box.
    pub fn entry(&self, p1: Point, p2: Point) -> Option<Point> {
        let direction = p2 - p1;
        let length = direction.norm();
        if length == 0.0 { return None }
        // parry's cuboids are centred on the origin: shift the segment instead
        let ray = Ray::new(p1 - self.centre.coords, direction / length);
        Cuboid::new(self.half_width)
            .cast_local_ray(&ray, length, true)
            .map(|toi| ray.point_at(toi) + self.centre.coords)
    }

    /// The points at which the segment `p1`-`p2` enters and leaves the box.
    pub fn chord(&self, p1: Point, p2: Point) -> Option<(Point, Point)> {
        Some((self.entry(p1, p2)?, self.entry(p2, p1)?))
    }

    /// Length of the part of the segment `p1`-`p2` lying inside the box.
    pub fn chord_length(&self, p1: Point, p2: Point) -> Lengthf32 {
        self.chord(p1, p2).map_or(0.0, |(a, b)| (b - a).norm())
    }

    pub fn contains(&self, p: Point) -> bool {
        let d = p - self.centre;
        d.x.abs() <= self.half_width.x &&
        d.y.abs() <= self.half_width.y &&
        d.z.abs() <= self.half_width.z
    }

    pub fn lower_corner(&self) -> Point { self.centre - self.half_width }
    pub fn upper_corner(&self) -> Point { self.centre + self.half_width }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    fn unit_cube_at(x: f32, y: f32, z: f32) -> AaBox {
        AaBox::new(Point::new(x, y, z), Vector::new(1.0, 1.0, 1.0))
    }

    #[rstest(/**/   p1               ,       p2           , length,
             case((-5.0,  0.0,  0.0), ( 5.0,  0.0,  0.0),   2.0   ),
             case(( 0.0, -5.0,  0.5), ( 0.0,  5.0,  0.5),   2.0   ),
             case((-5.0, -5.0,  0.0), ( 5.0,  5.0,  0.0),   2.828_427),
             case((-5.0,  3.0,  0.0), ( 5.0,  3.0,  0.0),   0.0   ),
             // segment stops short of the box
             case((-5.0,  0.0,  0.0), (-2.0,  0.0,  0.0),   0.0   ),
             // segment starts inside the box
             case(( 0.0,  0.0,  0.0), ( 5.0,  0.0,  0.0),   1.0   ),
    )]
    fn chord_length_through_centred_cube(p1: (f32, f32, f32), p2: (f32, f32, f32), length: f32) {
        let cube = unit_cube_at(0.0, 0.0, 0.0);
        let p1 = Point::new(p1.0, p1.1, p1.2);
        let p2 = Point::new(p2.0, p2.1, p2.2);
        assert_float_eq!(cube.chord_length(p1, p2), length, abs <= 1e-5);
    }

    #[test]
    fn offset_box_entry_point() {
        let cube = unit_cube_at(10.0, 0.0, 0.0);
        let entry = cube.entry(Point::new(0.0, 0.0, 0.0), Point::new(20.0, 0.0, 0.0)).unwrap();
        assert_float_eq!([entry.x, entry.y, entry.z], [9.0, 0.0, 0.0], abs <= [1e-5, 1e-5, 1e-5]);
        assert!(cube.contains(Point::new(10.5, -0.5, 0.9)));
        assert!(!cube.contains(Point::new(8.5, 0.0, 0.0)));
    }
}
