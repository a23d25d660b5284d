/// Units which are simply type aliases for `f32` rather than having an
/// implementation as a `uom` `Quantity`.
///
/// These are used in the projector and solver inner loops, where every voxel
/// weight and intensity is touched once per LOR, and in the atomic
/// accumulators, which need the raw bit patterns. The names are still clues
/// as to what the values represent: lengths are always in mm, times in ps.

pub type Lengthf32    = f32;
pub type Timef32      = f32;
pub type Weightf32    = f32;
pub type Ratiof32     = f32;
pub type Intensityf32 = f32; // TODO uom Intensity (activity per voxel volume)
pub type PerLengthf32 = f32; // attenuation coefficients in mm⁻¹
