mod cli;
mod progress;

use std::error::Error;
use std::path::Path;

use clap::Parser;
use geometry::Point;

use lorecon::{
    config::{Config, read_config_file},
    config_error,
    io,
    phantom,
    solver::Solver,
    utils::{group_digits, timing::Progress},
};

use cli::{Cli, Command};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    if let Some(n) = args.num_threads {
        // Set the maximum number of threads used by rayon for parallel iteration
        match rayon::ThreadPoolBuilder::new().num_threads(n).build_global() {
            Err(e) => log::warn!("{e}"),
            Ok(_)  => log::info!("Using up to {n} threads."),
        }
    }

    match args.command {
        Command::Reconstruct { config, input, out, check } => reconstruct(&config, &input, &out, check),
        Command::Simulate { config, out, position: (x, y, z), activity, seed } =>
            simulate(&config, &out, Point::new(x, y, z), activity, seed),
    }
}

fn load_config(path: &Path, progress: &mut Progress) -> Result<Config, Box<dyn Error>> {
    progress.start(&format!("Reading {}", path.display()));
    let config = read_config_file(path)?;
    config.validate()?;
    progress.done();
    Ok(config)
}

fn reconstruct(config: &Path, input: &Path, out: &Path, check: bool) -> Result<(), Box<dyn Error>> {
    let mut progress = Progress::new();
    let config = load_config(config, &mut progress)?;

    progress.start("Reading measurements");
    let measurements = io::read_measurements(&config, input)?;
    progress.done_with_message(&format!("Read {} measurements", group_digits(measurements.len())));

    progress.start("Reading side channels");
    let (problem, settings) = io::load_problem(&config, measurements)?;
    progress.done();

    progress.start("Computing sensitivity");
    let solver = Solver::new(settings, problem)?;
    progress.done();
    if check {
        println!("{} is consistent", config.reconstruction.algorithm);
        return Ok(())
    }

    let bar = progress::Steps::new(&solver)?;
    progress.startln("Reconstructing");
    let output = solver.run_with(None, |s| bar.step(s))?;
    bar.finish();
    progress.done_with_message("Reconstructed");

    for warning in &output.warnings { log::warn!("{warning}") }
    for (iteration, image) in &output.saved {
        io::write_image(image, out, *iteration)?;
    }
    let last = config.reconstruction.iterations;
    if !output.saved.iter().any(|(i, _)| *i == last) {
        io::write_image(&output.image, out, last)?;
    }
    if !output.forward_projections.is_empty() {
        let mut path = out.as_os_str().to_owned();
        path.push("_forward.raw");
        io::raw::write(output.forward_projections.iter().flatten().copied(), Path::new(&path))?;
    }
    Ok(())
}

fn simulate(config: &Path, out: &Path, position: Point, activity: f32, seed: Option<u64>) -> Result<(), Box<dyn Error>> {
    let mut progress = Progress::new();
    let config = load_config(config, &mut progress)?;
    let Some(sinogram) = &config.sinogram else {
        return Err(config_error!("simulation needs a [sinogram] table").into())
    };
    let scanner = config.scanner.geometry()?;
    let sinogram = sinogram.layout(&scanner)?;
    let layout = config.image.layout()?;
    let projector = config.projector.projector(&config.scanner, layout.clone(), config.tof()?)?;

    progress.start("Projecting point source");
    let image = phantom::point_source(&layout, position, activity)?;
    let measurements = phantom::sinogram(&scanner, &sinogram, &projector, &image, seed)?;
    progress.done_with_message(&format!("{} counts", group_digits(measurements.total().round() as u64)));

    let all = (0..measurements.len()).collect::<Vec<_>>();
    io::raw::write(measurements.values(&all).into_iter(), out)?;
    log::info!("wrote {}", out.display());
    Ok(())
}
