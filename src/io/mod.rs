//! Reading measurements and side channels from disk, assembling them into a
//! reconstruction problem, and writing images.

pub mod events;
pub mod raw;

use std::path::{Path, PathBuf};

use crate::{
    config::Config,
    corrections::{Corrections, attenuation_factors},
    error::{Error, Result},
    image::{ImageVolume, VolumeLayout},
    measurement::Measurements,
    measurement_error,
    sinogram::SinogramLayout,
    solver::{Problem, Settings},
};

/// All `f32`s in the raw file at `path`, which holds `what`
pub fn read_f32s(path: &Path, what: &str) -> Result<Vec<f32>> {
    if !path.exists() {
        return Err(Error::MissingResource { what: what.into(), path: Some(path.into()) })
    }
    Ok(raw::read(path)?.collect::<std::io::Result<_>>()?)
}

/// Exactly `n` values, from `path`
pub fn read_exactly(path: &Path, what: &str, n: usize) -> Result<Vec<f32>> {
    let values = read_f32s(path, what)?;
    if values.len() != n {
        return Err(measurement_error!("{what} in {} has {} values, expected {n}", path.display(), values.len()))
    }
    Ok(values)
}

pub fn read_image(path: &Path, what: &str, layout: &VolumeLayout) -> Result<ImageVolume> {
    ImageVolume::new(layout.clone(), read_exactly(path, what, layout.len())?)
}

/// Voxels where the stored image is zero are excluded
pub fn read_mask(path: &Path, layout: &VolumeLayout) -> Result<Vec<bool>> {
    Ok(read_exactly(path, "image mask", layout.len())?.into_iter().map(|v| v != 0.0).collect())
}

pub fn read_sinogram(path: &Path, layout: &SinogramLayout, tof_bins: usize) -> Result<Measurements> {
    let counts = read_exactly(path, "sinogram", layout.n_bins() * tof_bins)?;
    Ok(Measurements::Sinogram { layout: layout.clone(), counts, tof_bins })
}

/// Raw sinogram if the configuration describes one, list of indexed events
/// otherwise
pub fn read_measurements(config: &Config, path: &Path) -> Result<Measurements> {
    let tof_bins = config.tof()?.bins();
    match &config.sinogram {
        Some(sinogram) => {
            let scanner = config.scanner.geometry()?;
            read_sinogram(path, &sinogram.layout(&scanner)?, tof_bins)
        }
        None => Ok(Measurements::Indexed { events: events::read(path)?, tof_bins }),
    }
}

/// `<pattern>_<iteration>.raw`
pub fn image_path(pattern: &Path, iteration: usize) -> PathBuf {
    let mut name = pattern.as_os_str().to_owned();
    name.push(format!("_{iteration}.raw"));
    PathBuf::from(name)
}

pub fn write_image(image: &ImageVolume, pattern: &Path, iteration: usize) -> Result<PathBuf> {
    let path = image_path(pattern, iteration);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    raw::write(image.data.iter().copied(), &path)?;
    log::info!("wrote {}", path.display());
    Ok(path)
}

/// Everything the solver needs, from `config` and the measurements. Every
/// file named by the configuration is read here.
pub fn load_problem(config: &Config, measurements: Measurements) -> Result<(Problem, Settings)> {
    config.validate()?;
    let scanner = config.scanner.geometry()?;
    let layout = config.image.layout()?;
    let projector = config.projector.projector(&config.scanner, layout.clone(), config.tof()?)?;

    let image = &config.image;
    let mut initial = match &image.initial {
        Some(path) => read_image(path, "initial image", &layout)?,
        None => ImageVolume::uniform(layout.clone(), image.initial_value),
    };
    if let Some(path) = &image.mask {
        initial = initial.with_mask(read_mask(path, &layout)?)?;
    }

    let n = measurements.len();
    let c = &config.corrections;
    let side = |path: &Option<PathBuf>, what: &str| path.as_deref().map(|p| read_exactly(p, what, n)).transpose();
    let attenuation = match &c.attenuation_map {
        Some(path) => {
            let mu = read_image(path, "attenuation map", &layout)?;
            let all = (0..n).collect::<Vec<_>>();
            Some(attenuation_factors(&mu, &measurements.lors(&scanner, &all))?)
        }
        None => None,
    };
    let corrections = Corrections {
        mode: c.mode,
        normalization: side(&c.normalization, "normalization correction")?,
        randoms      : side(&c.randoms      , "randoms correction"      )?,
        scatter      : side(&c.scatter      , "scatter correction"      )?,
        attenuation,
        global_factor: c.global_factor,
        nonnegative_randoms: c.nonnegative_randoms,
    };

    let prior = match &config.prior {
        Some(p) => {
            let reference = p.reference.as_deref().map(|path| read_image(path, "prior reference image", &layout)).transpose()?;
            let v = layout.inner().fov.voxel_size;
            Some(p.prior([v.x, v.y, v.z], reference)?)
        }
        None => None,
    };

    let pre = &config.preconditioner;
    let iem = pre.iem_reference.as_deref().map(|p| read_exactly(p, "IEM reference image", layout.len())).transpose()?;
    let settings = config.reconstruction.settings(config.projector.staging, pre.preconditioners(iem)?)?;

    Ok((Problem { scanner, measurements, corrections, projector, prior, initial }, settings))
}
