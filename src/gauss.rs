use std::f32::consts::TAU;
use units::todo::{Lengthf32, PerLengthf32};

/// Normalized gaussian with standard deviation `sigma`, truncated to zero
/// beyond `cutoff` standard deviations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gaussian {
    sigma: Lengthf32,
    peak_height: PerLengthf32,
    cutoff: Lengthf32,
}

impl Gaussian {

    pub fn new(sigma: Lengthf32, cutoff: Option<f32>) -> Self {
        let peak_height = 1.0 / (sigma * TAU.sqrt());
        let cutoff = cutoff.map_or(Lengthf32::INFINITY, |width| width * sigma);
        Self { sigma, peak_height, cutoff }
    }

    #[inline]
    pub fn call(&self, dx: Lengthf32) -> PerLengthf32 {
        if dx.abs() < self.cutoff {
            let y = dx / self.sigma;
            self.peak_height * (-0.5 * y * y).exp()
        } else {
            0.0
        }
    }

    pub fn sigma (&self) -> Lengthf32 { self.sigma  }
    pub fn cutoff(&self) -> Lengthf32 { self.cutoff }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    #[test]
    fn integrates_to_one() {
        let g = Gaussian::new(2.5, None);
        let dx = 0.01;
        let total: f32 = (-3000..3000).map(|i| g.call(i as f32 * dx) * dx).sum();
        assert_float_eq!(total, 1.0, abs <= 1e-4);
    }

    #[test]
    fn cutoff_truncates() {
        let g = Gaussian::new(1.0, Some(3.0));
        assert!(g.call(2.99) > 0.0);
        assert_eq!(g.call(3.01), 0.0);
        assert_eq!(g.call(-3.01), 0.0);
    }
}
