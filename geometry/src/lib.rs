mod point;
mod cuboid;
mod overlap;

pub use point::{Point, Vector, point_mm, distance_to_line, project_onto_line};
pub use cuboid::AaBox;
pub use overlap::{lens_area, sphere_cylinder_overlap, OverlapTable};
