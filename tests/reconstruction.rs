use float_eq::assert_float_eq;
use proptest::prelude::*;
use rstest::rstest;
use tempfile::tempdir;

use geometry::Point;
use lorecon::{
    config::read_config_file,
    corrections::Corrections,
    fov::FOV,
    image::{ImageVolume, VolumeLayout},
    io,
    measurement::{Measurements, SinogramShape},
    phantom,
    projector::{Kernel, Precision, Projector},
    scanner::{ScannerGeometry, ScannerParameters},
    sinogram::SinogramLayout,
    solver::{Algorithm, Problem, Settings, Solver},
    subsets::{SubsetPolicy, partition},
    tof::TofBinning,
};

fn scanner() -> ScannerGeometry {
    ScannerGeometry::new(ScannerParameters {
        blocks_per_ring: 8, cryst_per_block: 4, cryst_per_block_axial: 2,
        pitch_transaxial: 4.0, pitch_axial: 4.0, diameter: 100.0,
        ..ScannerParameters::default()
    }).unwrap()
}

fn layout() -> VolumeLayout { VolumeLayout::single(FOV::from_mm([36.0, 36.0, 8.0], [9, 9, 2])) }

fn source() -> Point { Point::new(0.0, 0.0, 2.0) }

/// Sinogram of a point source, optionally on a uniform background
fn problem(background: f32, noise_seed: Option<u64>) -> Problem {
    let scanner = scanner();
    let sinogram = SinogramLayout::new(&scanner, 15, 1, 1).unwrap();
    let layout = layout();
    let projector = Projector::symmetric(Kernel::default(), layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
    let mut truth = phantom::point_source(&layout, source(), 100.0).unwrap();
    truth.data.iter_mut().for_each(|v| *v += background);
    let measurements = phantom::sinogram(&scanner, &sinogram, &projector, &truth, noise_seed).unwrap();
    Problem {
        scanner, measurements, projector,
        corrections: Corrections::none(),
        prior: None,
        initial: ImageVolume::ones(layout),
    }
}

fn settings(algorithm: &str, iterations: usize, subsets: usize) -> Settings {
    Settings { algorithm: Algorithm::from_name(algorithm).unwrap(), iterations, subsets, ..Settings::default() }
}

// ----- One MLEM iteration lights up the source -------------------------------------
#[test]
fn point_source_end_to_end() {
    let problem = problem(1.0, None);
    let layout = problem.projector.layout().clone();
    let (region, voxel) = layout.locate(source()).unwrap();
    let hot = layout.arena_index(region, voxel);

    // Voxels sharing no LOR with the source voxel
    let all = (0..problem.measurements.len()).collect::<Vec<_>>();
    let lors = problem.measurements.lors(&problem.scanner, &all);
    let through_source = problem.projector.forward(&phantom::point_source(&layout, source(), 1.0).unwrap(), &lors);
    let touched = problem.projector.backward(&through_source, &lors, None);
    let far: Vec<usize> = (0..layout.len()).filter(|&i| touched[i] == 0.0).collect();
    assert!(!far.is_empty());

    let output = Solver::new(settings("MLEM", 1, 1), problem).unwrap().run(None).unwrap();
    let image = output.image;
    assert!(image[hot] > 1.0);
    for i in far {
        assert_float_eq!(image[i], 1.0, abs <= 1e-5, "voxel {i}");
    }
}

// ----- Σ forward(image) ≈ Σ measurements -------------------------------------------
#[rstest(/**/ algorithm, subsets, iterations,
         case("MLEM" , 1, 1),
         case("OSEM" , 4, 10),
)]
fn counts_are_preserved(algorithm: &str, subsets: usize, iterations: usize) {
    let problem = problem(1.0, None);
    let measured = problem.measurements.total();
    let all = (0..problem.measurements.len()).collect::<Vec<_>>();
    let lors = problem.measurements.lors(&problem.scanner, &all);
    let projector = problem.projector.clone();
    let output = Solver::new(settings(algorithm, iterations, subsets), problem).unwrap().run(None).unwrap();
    let expected: f64 = projector.forward(&output.image, &lors).iter().map(|&e| e as f64).sum();
    assert_float_eq!(expected, measured, rmax <= 2e-2);
}

// ----- Positivity holds after every step ------------------------------------------
#[rstest(/**/ algorithm,
         case("OSEM"), case("RAMLA"), case("MRAMLA"), case("ROSEM"), case("RBI"), case("DRAMA"),
         case("COSEM"), case("ECOSEM"), case("ACOSEM"), case("BSREM"), case("MBSREM"), case("ROSEM-MAP"),
         case("FISTA"), case("FISTA-L1"), case("PKMA"),
         case("PDHG"), case("PDHG-L1"), case("PDHG-KL"), case("PDDY"),
)]
fn positivity_after_every_step(algorithm: &str) {
    let problem = problem(0.5, Some(11));
    let mut negative = vec![];
    Solver::new(settings(algorithm, 3, 4), problem).unwrap()
        .run_with(None, |solver| {
            if let Some(v) = solver.image().data.iter().find(|&&v| v < 0.0) {
                negative.push((solver.iteration(), solver.subset(), *v));
            }
        })
        .unwrap();
    assert!(negative.is_empty(), "{negative:?}");
}

// ----- Subsets partition the measurements -----------------------------------------
proptest! {
    #[test]
    fn partition_is_complete(
        rows in 1..6_usize, cols in 1..6_usize, planes in 1..8_usize,
        subsets in 1..5_usize,
        number in prop::sample::select(vec![1_u32, 2, 3, 4, 5, 8, 9, 11]),
        seed in 0..100_u64,
    ) {
        let shape = SinogramShape { rows, cols, planes };
        let n = shape.len();
        let policy = SubsetPolicy::from_number(number).unwrap();
        let unit = match policy {
            SubsetPolicy::SinogramColumns => rows,
            SubsetPolicy::SinogramRows => cols,
            SubsetPolicy::Planes | SubsetPolicy::RandomPlanes | SubsetPolicy::PrimePlanes => rows * cols,
            _ => 1,
        };
        let Ok(result) = partition(n, subsets, policy, Some(shape), seed) else {
            // Only when there are fewer selection units than subsets
            prop_assert!(n / unit < subsets);
            return Ok(());
        };
        prop_assert_eq!(result.len(), subsets);
        let mut all: Vec<usize> = result.iter().flatten().copied().collect();
        all.sort_unstable();
        prop_assert_eq!(all, (0..n).collect::<Vec<_>>());
        let sizes = result.iter().map(Vec::len);
        let (min, max) = (sizes.clone().min().unwrap_or(0), sizes.max().unwrap_or(0));
        prop_assert!(max - min <= unit);
    }
}

// ----- Simulate, write, read back and reconstruct from the example configuration ---
#[test]
fn simulated_sinogram_through_files() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut config = read_config_file("lorecon.toml".as_ref())?;
    config.image.voxels = (16, 16, 4);
    config.reconstruction.iterations = 1;
    config.reconstruction.subsets = 2;
    config.reconstruction.save_iterations = vec![];
    config.tof = None;
    config.prior = None;

    let scanner = config.scanner.geometry()?;
    let sinogram = config.sinogram.as_ref().ok_or("no [sinogram]")?.layout(&scanner)?;
    let layout = config.image.layout()?;
    let projector = config.projector.projector(&config.scanner, layout.clone(), config.tof()?)?;
    let source = phantom::point_source(&layout, Point::new(10.0, 0.0, 2.0), 500.0)?;
    let simulated = phantom::sinogram(&scanner, &sinogram, &projector, &source, Some(5))?;
    let path = dir.path().join("sinogram.raw");
    let all = (0..simulated.len()).collect::<Vec<_>>();
    io::raw::write(simulated.values(&all).into_iter(), &path)?;

    let measurements = io::read_measurements(&config, &path)?;
    assert!(matches!(measurements, Measurements::Sinogram { .. }));
    assert_eq!(measurements.total(), simulated.total());

    let (problem, settings) = io::load_problem(&config, measurements)?;
    let output = Solver::new(settings, problem)?.run(None)?;
    let written = io::write_image(&output.image, &dir.path().join("recon"), 1)?;
    assert!(written.ends_with("recon_1.raw"));
    assert_eq!(io::read_image(&written, "image", &layout)?.data, output.image.data);
    Ok(())
}
