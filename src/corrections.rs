//! Randoms, scatter, attenuation and normalization.
//!
//! Every correction is held per measurement index. Multiplicative ones are
//! correction coefficients: multiplying the measured data by them corrects
//! it. Additive ones (randoms, scatter) are estimates in the units of the
//! uncorrected data.
//!
//! In `PreReconstruction` mode the data are corrected once, before the solver
//! sees them. In `DuringReconstruction` mode the data are left alone and the
//! corrections are folded into the expected measurement instead:
//!
//! ```text
//! ȳ = a · (A x) / (n · g) + r + s
//! ```
//!
//! Attenuation `a` enters the expected measurement in both modes.

use serde::Deserialize;

use crate::{
    LOR,
    error::Result,
    image::ImageVolume,
    measurement_error,
    projector::{Kernel, Precision, Projector, Siddon},
    tof::TofBinning,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    #[default]
    PreReconstruction,
    DuringReconstruction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Corrections {
    pub mode: CorrectionMode,
    pub normalization: Option<Vec<f32>>,
    pub randoms: Option<Vec<f32>>,
    pub scatter: Option<Vec<f32>>,
    /// Survival probability `exp(-∫μ)` of each LOR
    pub attenuation: Option<Vec<f32>>,
    pub global_factor: f32,
    /// Clamp pre-corrected data at zero
    pub nonnegative_randoms: bool,
}

impl Default for Corrections {
    fn default() -> Self {
        Self {
            mode: CorrectionMode::default(),
            normalization: None,
            randoms: None,
            scatter: None,
            attenuation: None,
            global_factor: 1.0,
            nonnegative_randoms: false,
        }
    }
}

/// Multiplicative and additive terms relating the projection of the image to
/// the expected measurement, for one slice of the data.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardModel {
    pub multiplicative: Vec<f32>,
    pub additive: Vec<f32>,
}

impl ForwardModel {
    pub fn neutral(n: usize) -> Self {
        Self { multiplicative: vec![1.0; n], additive: vec![0.0; n] }
    }

    pub fn len(&self) -> usize { self.multiplicative.len() }
    pub fn is_empty(&self) -> bool { self.multiplicative.is_empty() }

    /// Turn a projection of the image into an expected measurement, in place
    pub fn apply(&self, projection: &mut [f32]) {
        for ((p, &m), &a) in projection.iter_mut().zip(&self.multiplicative).zip(&self.additive) {
            *p = *p * m + a;
        }
    }

    pub fn has_additive(&self) -> bool { self.additive.iter().any(|&a| a != 0.0) }
}

impl Corrections {

    pub fn none() -> Self { Self::default() }

    pub fn is_neutral(&self) -> bool {
        self.normalization.is_none() && self.randoms.is_none() && self.scatter.is_none()
            && self.attenuation.is_none() && self.global_factor == 1.0
    }

    /// Check that every correction array covers exactly `n` measurements and
    /// holds usable values.
    pub fn validate(&self, n: usize) -> Result<()> {
        let arrays = [
            ("normalization", &self.normalization, true ),
            ("randoms"      , &self.randoms      , true ),
            ("scatter"      , &self.scatter      , true ),
            ("attenuation"  , &self.attenuation  , false),
        ];
        for (name, array, may_be_zero) in arrays {
            let Some(values) = array else { continue };
            if values.len() != n {
                return Err(measurement_error!("{name} correction has {} values for {n} measurements", values.len()))
            }
            if let Some(i) = values.iter().position(|v| !v.is_finite() || *v < 0.0 || (!may_be_zero && *v == 0.0)) {
                return Err(measurement_error!("{name} correction {i} is {}", values[i]))
            }
        }
        if !(self.global_factor > 0.0 && self.global_factor.is_finite()) {
            return Err(measurement_error!("global correction factor must be positive, got {}", self.global_factor))
        }
        Ok(())
    }

    /// Correct the measurement slice `values`, taken at `indices`. Only does
    /// anything in `PreReconstruction` mode.
    pub fn apply(&self, values: &mut [f32], indices: &[usize]) {
        if self.mode != CorrectionMode::PreReconstruction { return }
        let at = |array: &Option<Vec<f32>>, i: usize, default: f32| array.as_ref().map_or(default, |a| a[i]);
        for (y, &i) in values.iter_mut().zip(indices) {
            let mut v = *y - at(&self.randoms, i, 0.0) - at(&self.scatter, i, 0.0);
            v *= at(&self.normalization, i, 1.0) * self.global_factor;
            if self.nonnegative_randoms { v = v.max(0.0) }
            *y = v;
        }
    }

    /// The forward model of the measurements at `indices`
    pub fn forward_model(&self, indices: &[usize]) -> ForwardModel {
        let at = |array: &Option<Vec<f32>>, i: usize, default: f32| array.as_ref().map_or(default, |a| a[i]);
        let during = self.mode == CorrectionMode::DuringReconstruction;
        let multiplicative = indices.iter().map(|&i| {
            let attenuation = at(&self.attenuation, i, 1.0);
            if !during { return attenuation }
            let coefficient = at(&self.normalization, i, 1.0) * self.global_factor;
            // A zero coefficient marks a dead LOR
            if coefficient > 0.0 { attenuation / coefficient } else { 0.0 }
        }).collect();
        let additive = indices.iter().map(|&i| {
            if during { at(&self.randoms, i, 0.0) + at(&self.scatter, i, 0.0) } else { 0.0 }
        }).collect();
        ForwardModel { multiplicative, additive }
    }
}

/// Survival probability `exp(-Σ l μ)` along each LOR, through the attenuation
/// map `mu` (in mm⁻¹). TOF information in the LORs is ignored.
pub fn attenuation_factors(mu: &ImageVolume, lors: &[LOR]) -> Result<Vec<f32>> {
    if let Some(i) = mu.data.iter().position(|v| !v.is_finite() || *v < 0.0) {
        return Err(measurement_error!("attenuation coefficient {i} is {}", mu.data[i]))
    }
    let projector = Projector::symmetric(
        Kernel::Siddon(Siddon::single_ray()), mu.layout().clone(), TofBinning::disabled(), Precision::Double)?;
    let lors: Vec<LOR> = lors.iter().map(|l| l.without_tof()).collect();
    Ok(projector.forward(mu, &lors).into_iter().map(|x| (-x).exp()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fov::FOV;
    use float_eq::assert_float_eq;
    use geometry::Point;
    use rstest::rstest;

    fn corrections(mode: CorrectionMode) -> Corrections {
        Corrections {
            mode,
            normalization: Some(vec![2.0, 1.0, 0.5]),
            randoms: Some(vec![1.0, 1.0, 4.0]),
            scatter: Some(vec![0.5, 0.0, 0.0]),
            attenuation: Some(vec![0.5, 1.0, 0.25]),
            global_factor: 2.0,
            nonnegative_randoms: false,
        }
    }

    #[test]
    fn pre_correction_subtracts_then_scales() {
        let c = corrections(CorrectionMode::PreReconstruction);
        let mut y = vec![10.0, 3.0, 2.0];
        c.apply(&mut y, &[0, 1, 2]);
        assert_float_eq!(y, vec![34.0, 4.0, -2.0], abs_all <= 1e-6);
        // Attenuation alone remains in the forward model
        assert_eq!(c.forward_model(&[0, 1, 2]), ForwardModel { multiplicative: vec![0.5, 1.0, 0.25], additive: vec![0.0; 3] });
    }

    #[test]
    fn nonnegative_randoms_clamp() {
        let c = Corrections { nonnegative_randoms: true, ..corrections(CorrectionMode::PreReconstruction) };
        let mut y = vec![2.0];
        c.apply(&mut y, &[2]);
        assert_eq!(y, vec![0.0]);
    }

    #[test]
    fn during_reconstruction_leaves_data_alone() {
        let c = corrections(CorrectionMode::DuringReconstruction);
        let mut y = vec![10.0, 3.0];
        c.apply(&mut y, &[2, 0]);
        assert_eq!(y, vec![10.0, 3.0]);
        let model = c.forward_model(&[2, 0]);
        assert_float_eq!(model.multiplicative, vec![0.25, 0.125], abs_all <= 1e-7);
        assert_float_eq!(model.additive, vec![4.0, 1.5], abs_all <= 1e-7);
        let mut p = vec![8.0, 8.0];
        model.apply(&mut p);
        assert_float_eq!(p, vec![6.0, 2.5], abs_all <= 1e-6);
    }

    #[rstest(/**/ c, ok,
             case(Corrections::none(), true),
             case(Corrections { randoms: Some(vec![0.0; 2]), ..Corrections::none() }, false),
             case(Corrections { scatter: Some(vec![0.0, 1.0, f32::NAN]), ..Corrections::none() }, false),
             case(Corrections { attenuation: Some(vec![1.0, 0.0, 1.0]), ..Corrections::none() }, false),
             case(Corrections { normalization: Some(vec![1.0, 0.0, 1.0]), ..Corrections::none() }, true),
             case(Corrections { global_factor: 0.0, ..Corrections::none() }, false),
    )]
    fn validation(c: Corrections, ok: bool) {
        assert_eq!(c.validate(3).is_ok(), ok);
    }

    #[test]
    fn attenuation_through_uniform_block() {
        let fov = FOV::from_mm([20.0, 20.0, 20.0], [10, 10, 10]);
        let mu = ImageVolume::single(fov, vec![0.01; 1000]).unwrap();
        let lors = [
            LOR::new(Point::new(-50.0, 0.0, 0.0), Point::new(50.0, 0.0, 0.0)).with_tof_bin(3),
            LOR::new(Point::new(-50.0, 30.0, 0.0), Point::new(50.0, 30.0, 0.0)),
        ];
        let factors = attenuation_factors(&mu, &lors).unwrap();
        assert_float_eq!(factors, vec![(-0.2_f32).exp(), 1.0], abs_all <= 1e-5);
    }
}
