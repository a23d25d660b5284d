use geometry::{Point, Vector};
use units::todo::Lengthf32;

/// Line Of Response.
///
/// The segment between the two detection points of a coincidence, optionally
/// tagged with the TOF bin of the measurement it represents.
#[derive(Clone, Copy, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct LOR {
    pub p1: Point,
    pub p2: Point,
    pub tof_bin: Option<u16>,
}

impl LOR {
    pub fn new(p1: Point, p2: Point) -> Self { Self { p1, p2, tof_bin: None } }

    pub fn with_tof_bin(self, bin: u16) -> Self { Self { tof_bin: Some(bin), ..self } }

    pub fn without_tof(self) -> Self { Self { tof_bin: None, ..self } }

    /// Stand-in for measurements which have no physical line (those involving
    /// pseudo-detectors). Every projector ignores it.
    pub fn degenerate() -> Self { Self::new(Point::origin(), Point::origin()) }

    pub fn length(&self) -> Lengthf32 { (self.p2 - self.p1).norm() }

    pub fn is_degenerate(&self) -> bool { self.length() <= f32::EPSILON }

    /// Unit vector from `p1` towards `p2`
    pub fn direction(&self) -> Vector { (self.p2 - self.p1).normalize() }

    pub fn midpoint(&self) -> Point { nalgebra::center(&self.p1, &self.p2) }
}

use core::fmt;
impl fmt::Display for LOR {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (p, q) = (self.p1, self.p2);
        write!(f, "<LOR ({:8.2} {:8.2} {:8.2}) ({:8.2} {:8.2} {:8.2}) /{:7.2} ",
               p.x, p.y, p.z,
               q.x, q.y, q.z,
               self.length())?;
        match self.tof_bin {
            Some(bin) => write!(f, "tof {bin}>"),
            None      => write!(f, "no tof>"),
        }
    }
}
