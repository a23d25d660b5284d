//! Time-of-flight binning and weighting.
//!
//! `dt` is always `t2 - t1`: the arrival time at the second detector of a LOR
//! minus that at the first. A positive `dt` places the annihilation closer to
//! the first detector.

use units::{ps_, Time, C, todo::{Lengthf32, Timef32}};

use crate::config_error;
use crate::error::Result;
use crate::gauss::Gaussian;

/// Ratio between full width at half maximum and sigma of a gaussian
const FWHM_PER_SIGMA: f32 = 2.354_820;

/// Default truncation of the TOF kernel, in sigmas
pub const DEFAULT_CUTOFF: f32 = 3.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TofBinning {
    bins: usize,
    width: Timef32,
    offset: Timef32,
    fwhm: Timef32,
    cutoff: f32,
}

impl TofBinning {

    pub fn new(bins: usize, width: Time, offset: Time, fwhm: Time) -> Result<Self> {
        Self::from_ps(bins, ps_(width), ps_(offset), ps_(fwhm))
    }

    pub fn from_ps(bins: usize, width: Timef32, offset: Timef32, fwhm: Timef32) -> Result<Self> {
        if bins == 0 { return Err(config_error!("number of TOF bins must be positive")) }
        if bins > 1 && !(width > 0.0) { return Err(config_error!("TOF bin width must be positive, got {width} ps")) }
        if bins > 1 && !(fwhm > 0.0) { return Err(config_error!("TOF resolution must be positive, got {fwhm} ps")) }
        if bins > u16::MAX as usize { return Err(config_error!("at most {} TOF bins supported", u16::MAX)) }
        Ok(Self { bins, width, offset, fwhm, cutoff: DEFAULT_CUTOFF })
    }

    /// A single bin: no timing information
    pub fn disabled() -> Self {
        Self { bins: 1, width: 0.0, offset: 0.0, fwhm: 0.0, cutoff: DEFAULT_CUTOFF }
    }

    pub fn with_cutoff(self, cutoff: f32) -> Self { Self { cutoff, ..self } }

    pub fn bins(&self) -> usize { self.bins }

    /// A single bin carries no timing information
    pub fn is_enabled(&self) -> bool { self.bins > 1 }

    /// Bin to which an event with timing difference `dt` (ps) belongs.
    /// Events beyond the outermost bins are assigned to them.
    pub fn bin_of(&self, dt: Timef32) -> usize {
        if self.bins == 1 { return 0 }
        let x = ((dt - self.offset) / self.width + self.bins as f32 / 2.0).floor();
        x.clamp(0.0, (self.bins - 1) as f32) as usize
    }

    /// Number of events falling into each bin
    pub fn histogram(&self, dts: impl IntoIterator<Item = Timef32>) -> Vec<usize> {
        let mut counts = vec![0; self.bins];
        for dt in dts { counts[self.bin_of(dt)] += 1 }
        counts
    }

    /// Centre of bin `bin`, as a timing difference in ps
    pub fn bin_centre_time(&self, bin: usize) -> Timef32 {
        (bin as f32 + 0.5 - self.bins as f32 / 2.0) * self.width + self.offset
    }

    /// Width of a bin as a distance along the LOR, in mm
    pub fn bin_width_mm(&self) -> Lengthf32 { self.width * C / 2.0 }

    /// Spatial standard deviation of the TOF kernel, in mm
    pub fn sigma_mm(&self) -> Lengthf32 { self.fwhm * C / (2.0 * FWHM_PER_SIGMA) }

    /// The weighting function of `bin` along a LOR of length `lor_length`,
    /// parametrized by distance from the LOR's first point.
    pub fn window(&self, bin: usize, lor_length: Lengthf32) -> TofWindow {
        // positive dt moves the peak towards the first point
        let shift = -self.bin_centre_time(bin) * C / 2.0;
        TofWindow {
            centre: lor_length / 2.0 + shift,
            gauss: Gaussian::new(self.sigma_mm(), Some(self.cutoff)),
            bin_width: self.bin_width_mm(),
        }
    }
}

/// TOF weight along one LOR for one bin
#[derive(Clone, Copy, Debug)]
pub struct TofWindow {
    /// Distance from the LOR's first point to the centre of the bin
    centre: Lengthf32,
    gauss: Gaussian,
    bin_width: Lengthf32,
}

impl TofWindow {
    /// Weight of a voxel whose centre lies at distance `t` from the LOR's
    /// first point
    #[inline]
    pub fn weight(&self, t: Lengthf32) -> f32 {
        self.bin_width * self.gauss.call(t - self.centre)
    }

    /// Range of distances from the first point with non-zero weight
    pub fn support(&self) -> (Lengthf32, Lengthf32) {
        let reach = self.gauss.cutoff();
        (self.centre - reach, self.centre + reach)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use units::ps;

    fn binning() -> TofBinning { TofBinning::from_ps(5, 100.0, 0.0, 250.0).unwrap() }

    #[rstest(/**/  dt   , bin,
             case(   0.0,  2 ),
             case(  49.0,  2 ),
             case(  51.0,  3 ),
             case(-151.0,  0 ),
             case( 260.0,  4 ),
             case(9999.0,  4 ),
             case(-9e9  ,  0 ),
    )]
    fn bin_assignment(dt: f32, bin: usize) {
        assert_eq!(binning().bin_of(dt), bin);
    }

    #[test]
    fn uom_constructor() {
        let tof = TofBinning::new(5, ps(100.0), ps(0.0), ps(250.0)).unwrap();
        assert_eq!(tof, binning());
    }

    #[test]
    fn bin_centres_are_assigned_to_their_bin() {
        let tof = TofBinning::from_ps(8, 60.0, 15.0, 200.0).unwrap();
        for b in 0..8 { assert_eq!(tof.bin_of(tof.bin_centre_time(b)), b); }
    }

    proptest! {
        #[test]
        fn histogram_covers_every_event(
            dts in proptest::collection::vec(-2000.0_f32..2000.0, 0..300),
            bins in 1_usize..12,
        ) {
            let tof = TofBinning::from_ps(bins, 73.0, -11.0, 200.0).unwrap();
            let histogram = tof.histogram(dts.iter().copied());
            prop_assert_eq!(histogram.len(), bins);
            prop_assert_eq!(histogram.iter().sum::<usize>(), dts.len());
            for &dt in &dts { prop_assert!(tof.bin_of(dt) < bins); }
        }
    }

    #[test]
    fn windows_of_all_bins_add_up_to_one() {
        // Summing the windows of all bins gives (almost) uniform unit weight
        // away from the ends of the binned range
        let tof = TofBinning::from_ps(41, 20.0, 0.0, 200.0).unwrap();
        let length = 300.0;
        for t in [120.0, 150.0, 171.3] {
            let total: f32 = (0..41).map(|b| tof.window(b, length).weight(t)).sum();
            assert_float_eq!(total, 1.0, abs <= 0.02);
        }
    }

    #[test]
    fn positive_dt_moves_peak_towards_first_point() {
        let tof = TofBinning::from_ps(3, 100.0, 0.0, 100.0).unwrap();
        let length = 400.0;
        let (lo, hi) = tof.window(2, length).support();
        assert!((lo + hi) / 2.0 < length / 2.0);
        assert_float_eq!((lo + hi) / 2.0, 200.0 - 100.0 * C / 2.0, abs <= 1e-3);
    }

    #[test]
    fn invalid_binning_is_rejected() {
        assert!(TofBinning::from_ps(0, 100.0, 0.0, 100.0).is_err());
        assert!(TofBinning::from_ps(4,   0.0, 0.0, 100.0).is_err());
        assert!(TofBinning::from_ps(1,   0.0, 0.0,   0.0).is_ok());
    }
}
