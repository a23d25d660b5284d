//! Synthetic measurements of simple activity distributions.

use geometry::Point;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Poisson};

use crate::{
    error::{Error, Result},
    image::{ImageVolume, VolumeLayout},
    measurement::Measurements,
    measurement_error,
    projector::Projector,
    scanner::ScannerGeometry,
    sinogram::SinogramLayout,
};

/// An image which is zero everywhere except in the voxel containing
/// `position`, which holds `activity`.
pub fn point_source(layout: &VolumeLayout, position: Point, activity: f32) -> Result<ImageVolume> {
    let Some((region, voxel)) = layout.locate(position) else {
        return Err(measurement_error!("point source at {position:?} lies outside the image volume"))
    };
    let mut image = ImageVolume::zeros(layout.clone());
    let i = layout.arena_index(region, voxel);
    image[i] = activity;
    Ok(image)
}

/// Replace every expected count by a Poisson-distributed sample of it
pub fn poisson_noise(expected: &[f32], seed: u64) -> Result<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    expected.iter().map(|&mean| {
        if mean <= 0.0 { return Ok(0.0) }
        let poisson = Poisson::new(mean as f64)
            .map_err(|e| Error::InvalidMeasurement(format!("mean {mean}: {e}")))?;
        Ok(poisson.sample(&mut rng) as f32)
    }).collect()
}

/// The sinogram expected from `image`, optionally with Poisson noise drawn
/// with the given seed. TOF bins are taken from the projector.
pub fn sinogram(
    scanner: &ScannerGeometry,
    layout: &SinogramLayout,
    projector: &Projector,
    image: &ImageVolume,
    noise_seed: Option<u64>,
) -> Result<Measurements> {
    let tof_bins = projector.tof().bins().max(1);
    let n = layout.n_bins();
    let lors = (0..n * tof_bins)
        .map(|i| {
            let lor = layout.lor(scanner, i % n);
            if tof_bins > 1 { lor.with_tof_bin((i / n) as u16) } else { lor }
        })
        .collect::<Vec<_>>();
    let expected = projector.forward(image, &lors);
    let counts = match noise_seed {
        Some(seed) => poisson_noise(&expected, seed)?,
        None => expected,
    };
    log::info!("simulated {:.0} counts in {} bins", counts.iter().map(|&c| c as f64).sum::<f64>(), counts.len());
    Ok(Measurements::Sinogram { layout: layout.clone(), counts, tof_bins })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fov::FOV;
    use crate::projector::{Kernel, Precision};
    use crate::scanner::ScannerParameters;
    use crate::tof::TofBinning;
    use float_eq::assert_float_eq;

    #[test]
    fn point_source_fills_one_voxel() {
        let layout = VolumeLayout::single(FOV::from_mm([30.0, 30.0, 30.0], [3, 3, 3]));
        let image = point_source(&layout, Point::new(0.0, 0.0, 0.0), 7.0).unwrap();
        assert_eq!(image.sum(), 7.0);
        assert_eq!(image[13], 7.0);
        assert!(point_source(&layout, Point::new(0.0, 0.0, 40.0), 1.0).is_err());
    }

    #[test]
    fn noise_preserves_mean() {
        let expected = vec![20.0; 5000];
        let noisy = poisson_noise(&expected, 3).unwrap();
        let mean = noisy.iter().sum::<f32>() / noisy.len() as f32;
        assert_float_eq!(mean, 20.0, abs <= 0.5);
        assert!(noisy.iter().all(|c| *c >= 0.0 && c.fract() == 0.0));
        assert_eq!(noisy, poisson_noise(&expected, 3).unwrap());
    }

    #[test]
    fn sinogram_of_central_source() {
        let scanner = ScannerGeometry::new(ScannerParameters {
            blocks_per_ring: 8, cryst_per_block: 4, cryst_per_block_axial: 2,
            pitch_transaxial: 4.0, pitch_axial: 4.0, diameter: 100.0,
            ..ScannerParameters::default()
        }).unwrap();
        let sinogram_layout = SinogramLayout::new(&scanner, 15, 1, 1).unwrap();
        let layout = VolumeLayout::single(FOV::from_mm([36.0, 36.0, 8.0], [9, 9, 2]));
        let projector = Projector::symmetric(Kernel::default(), layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
        let image = point_source(&layout, Point::new(0.0, 0.0, 1.0), 100.0).unwrap();
        let measurements = sinogram(&scanner, &sinogram_layout, &projector, &image, None).unwrap();
        assert_eq!(measurements.len(), sinogram_layout.n_bins());
        assert!(measurements.total() > 0.0);
        measurements.validate(&scanner).unwrap();
    }
}
