//! Physical quantities used at the boundaries of the reconstruction engine.
//!
//! Configuration values (crystal pitches, ring diameters, TOF bin widths and
//! resolutions) are written with explicit units and parsed into `uom`
//! quantities. Once inside the engine, everything is converted to plain `f32`
//! in mm and ps (see the `todo` module), because the projector inner loops
//! cannot afford the conversions.

pub mod todo;

pub use uom;
pub use uom::si::Quantity;
pub use uom::si::f32::{Angle, Length, Ratio, Time, Velocity};

mod unit {
  pub use uom::si::{length  ::{nanometer, millimeter, centimeter, meter},
                    time    ::{nanosecond, picosecond},
                    velocity::meter_per_second,
                    ratio   ::ratio,
                    angle   ::radian,
  };
}

// Making values from float literals is very long-winded, so provide some
// pithily-named convenience constructors.

/// Generate a function called NAME which returns QUANTITY by interpreting its
/// argument as UNIT
///
/// wrap!(NAME QUANTITY UNIT);
macro_rules! wrap {
  ($name:ident $quantity:ident $unit:ident ) => {
    pub fn $name(x: f32) -> $quantity { $quantity::new::<unit::$unit>(x) }
  };
}

wrap!(cm     Length         centimeter);
wrap!(mm     Length         millimeter);
wrap!(nm     Length          nanometer);
wrap!(m      Length              meter);
wrap!(ns     Time           nanosecond);
wrap!(ps     Time           picosecond);
wrap!(m_s    Velocity meter_per_second);
wrap!(ratio  Ratio               ratio);
wrap!(radian Angle              radian);

// Reverse direction of the above.
pub fn mm_    (x: Length  ) -> f32 { x.get::<unit::millimeter>() }
pub fn ps_    (x: Time    ) -> f32 { x.get::<unit::picosecond>() }
pub fn ns_    (x: Time    ) -> f32 { x.get::<unit::nanosecond>() }
pub fn m_s_   (x: Velocity) -> f32 { x.get::<unit::meter_per_second>() }
pub fn ratio_ (x: Ratio   ) -> f32 { x.get::<unit::ratio>() }
pub fn radian_(x: Angle   ) -> f32 { x.get::<unit::radian>() }

/// Speed of light in mm/ps, for use in the `f32` inner loops.
#[allow(clippy::excessive_precision)] // Stick to official definition of c
pub const C: todo::Lengthf32 = 0.299_792_458;

/// Speed of light as a `uom` quantity.
pub fn speed_of_light() -> Velocity { m_s(C * 1e9) }

/// Distance along a LOR corresponding to a difference `dt` in arrival times
/// of the two photons. Half of the light-distance, because one photon's path
/// lengthens while the other's shortens.
pub fn tof_distance(dt: Time) -> Length { speed_of_light() * dt / 2.0 }

#[macro_export]
macro_rules! assert_uom_eq {
  ($unit:ident, $lhs:expr, $rhs:expr, $algo:ident <= $tol:expr) => {
    float_eq::assert_float_eq!($lhs.get::<$unit>(), $rhs.get::<$unit>(), $algo <= $tol)
  };
}
