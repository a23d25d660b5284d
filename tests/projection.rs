use float_eq::assert_float_eq;
use ndarray::Array1;
use ndarray_rand::{RandomExt, rand::{Rng, SeedableRng}, rand_distr::Uniform};
use proptest::prelude::*;
use rand_isaac::Isaac64Rng;
use rstest::rstest;

use geometry::{AaBox, Point, Vector};
use lorecon::{
    LOR,
    fov::FOV,
    image::{ImageVolume, VolumeLayout},
    projector::{Kernel, Precision, Projector,
                interpolation::Interpolation, orthogonal::Orthogonal, siddon::Siddon, volume::Volume},
    tof::TofBinning,
};

fn fov() -> FOV { FOV::from_mm([40.0, 40.0, 20.0], [10, 10, 5]) }

/// LORs between random points on a cylinder enclosing `fov()`
fn random_lors(rng: &mut Isaac64Rng, n: usize) -> Vec<LOR> {
    let mut point = || {
        let phi: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
        let z  : f32 = rng.gen_range(-15.0..15.0);
        Point::new(60.0 * phi.cos(), 60.0 * phi.sin(), z)
    };
    (0..n).map(|_| LOR::new(point(), point())).collect()
}

fn random_values(rng: &mut Isaac64Rng, n: usize) -> Vec<f32> {
    Array1::random_using(n, Uniform::new(0.0, 1.0), rng).to_vec()
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&a, &b)| a as f64 * b as f64).sum()
}

// ----- ⟨Ax, y⟩ = ⟨x, Aᵀy⟩ for every kernel ----------------------------------------
#[rstest(/**/ kernel,
         case(Kernel::Siddon(Siddon::single_ray())),
         case(Kernel::Siddon(Siddon::multi_ray(2, 2, (4.0, 4.0)))),
         case(Kernel::Orthogonal(Orthogonal::new_3d(3.0))),
         case(Kernel::Orthogonal(Orthogonal::new_2d(3.0))),
         case(Kernel::Volume(Volume { tube_radius: 3.0, voxel_radius: 1.0 })),
         case(Kernel::Interpolation(Interpolation { step: 0.5 })),
)]
fn projections_are_adjoint(kernel: Kernel) {
    let mut rng = Isaac64Rng::seed_from_u64(42);
    let layout = VolumeLayout::single(fov());
    let projector = Projector::symmetric(kernel, layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
    for _ in 0..3 {
        let lors = random_lors(&mut rng, 200);
        let x = ImageVolume::new(layout.clone(), random_values(&mut rng, layout.len())).unwrap();
        let y = random_values(&mut rng, lors.len());
        let lhs = dot(&projector.forward(&x, &lors), &y);
        let rhs = dot(&x.data, &projector.backward(&y, &lors, None));
        assert_float_eq!(lhs, rhs, rmax <= 1e-4);
    }
}

#[test]
fn tof_projections_are_adjoint() {
    let mut rng = Isaac64Rng::seed_from_u64(7);
    let layout = VolumeLayout::single(fov());
    let tof = TofBinning::from_ps(5, 100.0, 0.0, 200.0).unwrap();
    let projector = Projector::symmetric(Kernel::default(), layout.clone(), tof, Precision::Double).unwrap();
    let lors: Vec<LOR> = random_lors(&mut rng, 100).into_iter()
        .enumerate()
        .map(|(i, l)| l.with_tof_bin((i % 5) as u16))
        .collect();
    let x = ImageVolume::new(layout.clone(), random_values(&mut rng, layout.len())).unwrap();
    let y = random_values(&mut rng, lors.len());
    let lhs = dot(&projector.forward(&x, &lors), &y);
    let rhs = dot(&x.data, &projector.backward(&y, &lors, None));
    assert_float_eq!(lhs, rhs, rmax <= 1e-4);
}

#[test]
fn multi_resolution_projections_are_adjoint() {
    let mut rng = Isaac64Rng::seed_from_u64(3);
    let layout = VolumeLayout::multi_resolution(fov(), Vector::new(40.0, 40.0, 10.0), 0.5).unwrap();
    let projector = Projector::symmetric(Kernel::default(), layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
    let lors = random_lors(&mut rng, 200);
    let x = ImageVolume::new(layout.clone(), random_values(&mut rng, layout.len())).unwrap();
    let y = random_values(&mut rng, lors.len());
    let lhs = dot(&projector.forward(&x, &lors), &y);
    let rhs = dot(&x.data, &projector.backward(&y, &lors, None));
    assert_float_eq!(lhs, rhs, rmax <= 1e-4);
}

// ----- Ray sums through a uniform unit image are chord lengths ---------------------
proptest! {
    #[test]
    fn uniform_image_ray_sum(
        phi1 in 0.0..std::f32::consts::TAU, z1 in -30.0..(30.0 as f32),
        phi2 in 0.0..std::f32::consts::TAU, z2 in -30.0..(30.0 as f32),
    ) {
        let fov = fov();
        let layout = VolumeLayout::single(fov);
        let projector = Projector::symmetric(Kernel::default(), layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
        let p1 = Point::new(60.0 * phi1.cos(), 60.0 * phi1.sin(), z1);
        let p2 = Point::new(60.0 * phi2.cos(), 60.0 * phi2.sin(), z2);
        let ray_sum = projector.forward(&ImageVolume::ones(layout), &[LOR::new(p1, p2)])[0];
        let chord = AaBox::new(fov.centre, fov.half_width).chord_length(p1, p2);
        assert_float_eq!(ray_sum, chord, abs <= 1e-3 * (1.0 + chord));
    }

    #[test]
    fn kernel_weights_are_non_negative(seed in 0..1000_u64) {
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let layout = VolumeLayout::single(fov());
        for kernel in [
            Kernel::Orthogonal(Orthogonal::new_3d(3.0)),
            Kernel::Volume(Volume { tube_radius: 3.0, voxel_radius: 1.0 }),
            Kernel::Interpolation(Interpolation { step: 0.5 }),
        ] {
            let projector = Projector::symmetric(kernel, layout.clone(), TofBinning::disabled(), Precision::Single).unwrap();
            let sensitivity = projector.sensitivity(&random_lors(&mut rng, 20), None, None);
            assert!(sensitivity.iter().all(|&s| s >= 0.0));
        }
    }

    // ----- Every TOF bin assignment lies in range -----------------------------------
    #[test]
    fn tof_bins_cover_every_event(
        bins in 1..20_usize,
        width in 20.0..200.0_f32,
        dts in proptest::collection::vec(-5000.0..5000.0_f32, 0..200),
    ) {
        let tof = TofBinning::from_ps(bins, width, 0.0, 2.0 * width).unwrap();
        prop_assert!(dts.iter().all(|&dt| tof.bin_of(dt) < bins));
        let histogram = tof.histogram(dts.iter().copied());
        prop_assert_eq!(histogram.len(), bins);
        prop_assert_eq!(histogram.iter().sum::<usize>(), dts.len());
    }
}
