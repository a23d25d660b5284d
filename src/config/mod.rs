//! Configuration file parser for reconstructions.
//!
//! Physical quantities are written with their units, as strings
//! (`pitch_axial = "4 mm"`, `fwhm = "200 ps"`), and parsed by `uom`. Every
//! table rejects unknown keys.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use geometry::Vector;
use serde::{Deserialize, Deserializer, de};
use units::{Length, Time, mm, mm_, ps};

use crate::{
    config_error,
    corrections::CorrectionMode,
    error::{Error, Result, missing},
    fov::FOV,
    image::{ImageVolume, VolumeLayout},
    priors::{
        Neighbourhood, Prior, PriorKind,
        median::{AnisotropicDiffusion, DiffusionType, Flux, MeanType},
        nonlocal::{NlVariant, NonLocal},
        variation::{Apls, Tgv, TotalVariation, TvType},
    },
    projector::{DEFAULT_JOB_SIZE, Interpolation, Kernel, Orthogonal, Precision, Projector, Siddon, Volume},
    scanner::{ScannerGeometry, ScannerParameters},
    sinogram::SinogramLayout,
    solver::{Algorithm, ImagePreconditioner, MeasurementPreconditioner, Preconditioners, Relaxation, Settings, Staging, Window},
    subsets::SubsetPolicy,
    tof::TofBinning,
};

fn deserialize_uom_opt<'d, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Option::<&str>::deserialize(deserializer)?
        .map(str::parse::<T>)
        .transpose()
        .map_err(de::Error::custom)
}

fn deserialize_uom<'d, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    <&str>::deserialize(deserializer)?
        .parse::<T>()
        .map_err(de::Error::custom)
}

fn deserialize_uom_3d_opt<'d, D, T>(deserializer: D) -> std::result::Result<Option<(T, T, T)>, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Option::<(&str, &str, &str)>::deserialize(deserializer)?
        .map(|(x,y,z)| tr_tup_res((x.parse(), y.parse(), z.parse())))
        .transpose()
        .map_err(de::Error::custom)
}

fn deserialize_uom_3d<'d, D, T>(deserializer: D) -> std::result::Result<(T, T, T), D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let (x, y, z) = <(&str, &str, &str)>::deserialize(deserializer)?;
    tr_tup_res((x.parse(), y.parse(), z.parse())).map_err(de::Error::custom)
}

/// Transpose 3-tuple of `Result`
///
/// `Ok` if all elements `Ok`; if any element is an `Err` return the first one.
fn tr_tup_res<O, E>((x,y,z): (std::result::Result<O, E>, std::result::Result<O, E>, std::result::Result<O, E>)) -> std::result::Result<(O, O, O), E> {
    Ok((x?, y?, z?))
}

fn one() -> usize { 1 }
fn one_f32() -> f32 { 1.0 }
fn yes() -> bool { true }

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub sinogram: Option<SinogramConfig>,
    pub image: ImageConfig,
    #[serde(default)]
    pub projector: ProjectorConfig,
    #[serde(default)]
    pub tof: Option<TofConfig>,
    #[serde(default)]
    pub corrections: CorrectionsConfig,
    pub reconstruction: ReconstructionConfig,
    #[serde(default)]
    pub prior: Option<PriorConfig>,
    #[serde(default)]
    pub preconditioner: PreconditionerConfig,
}

// ----- [scanner] ---------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    pub blocks_per_ring: usize,
    pub cryst_per_block: usize,
    pub cryst_per_block_axial: usize,
    #[serde(default = "one")]
    pub linear_multip: usize,
    #[serde(default = "one")]
    pub transaxial_multip: usize,
    #[serde(default)]
    pub pseudo_per_block: usize,
    #[serde(default)]
    pub rings: Option<usize>,
    #[serde(deserialize_with = "deserialize_uom")]
    pub pitch_transaxial: Length,
    #[serde(deserialize_with = "deserialize_uom")]
    pub pitch_axial: Length,
    #[serde(deserialize_with = "deserialize_uom")]
    pub diameter: Length,
    #[serde(default)]
    pub ring_gaps: Vec<usize>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_uom_opt")]
    pub ring_gap_width: Option<Length>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_uom_opt")]
    pub doi: Option<Length>,
}

impl ScannerConfig {
    pub fn parameters(&self) -> ScannerParameters {
        ScannerParameters {
            blocks_per_ring      : self.blocks_per_ring,
            cryst_per_block      : self.cryst_per_block,
            cryst_per_block_axial: self.cryst_per_block_axial,
            linear_multip        : self.linear_multip,
            transaxial_multip    : self.transaxial_multip,
            pseudo_per_block     : self.pseudo_per_block,
            rings                : self.rings,
            pitch_transaxial     : mm_(self.pitch_transaxial),
            pitch_axial          : mm_(self.pitch_axial),
            diameter             : mm_(self.diameter),
            ring_gaps            : self.ring_gaps.clone(),
            ring_gap_width       : self.ring_gap_width.map(mm_),
            doi                  : self.doi.map_or(0.0, mm_),
        }
    }

    pub fn geometry(&self) -> Result<ScannerGeometry> { ScannerGeometry::new(self.parameters()) }
}

// ----- [sinogram] --------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SinogramConfig {
    /// Radial bins
    pub n_dist: usize,
    #[serde(default = "one")]
    pub span: usize,
    /// Largest ring difference; all of them if not given
    #[serde(default)]
    pub ring_difference: Option<usize>,
}

impl SinogramConfig {
    pub fn layout(&self, scanner: &ScannerGeometry) -> Result<SinogramLayout> {
        let rd = self.ring_difference.unwrap_or(scanner.rings().saturating_sub(1));
        SinogramLayout::new(scanner, self.n_dist, self.span, rd)
    }
}

// ----- [image] -----------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    pub voxels: (usize, usize, usize),
    #[serde(deserialize_with = "deserialize_uom_3d")]
    pub fov_size: (Length, Length, Length),
    /// Uniform starting value, unless `initial` is given
    #[serde(default = "one_f32")]
    pub initial_value: f32,
    /// Raw `f32` starting image
    #[serde(default)]
    pub initial: Option<PathBuf>,
    /// Raw `f32` image; voxels where it is zero are not reconstructed
    #[serde(default)]
    pub mask: Option<PathBuf>,
    /// Size of the extended FOV, covered by coarser voxels outside the native one
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_uom_3d_opt")]
    pub extended_fov_size: Option<(Length, Length, Length)>,
    /// Native voxel pitch over extended voxel pitch
    #[serde(default = "quarter")]
    pub multi_resolution_scale: f32,
}

fn quarter() -> f32 { 0.25 }

impl ImageConfig {
    pub fn fov(&self) -> FOV { FOV::new(self.fov_size, self.voxels) }

    pub fn layout(&self) -> Result<VolumeLayout> {
        match self.extended_fov_size {
            None => Ok(VolumeLayout::single(self.fov())),
            Some((x, y, z)) => {
                let half = Vector::new(mm_(x) / 2.0, mm_(y) / 2.0, mm_(z) / 2.0);
                VolumeLayout::multi_resolution(self.fov(), half, self.multi_resolution_scale)
            }
        }
    }
}

// ----- [projector] -------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KernelName {
    #[default]
    Siddon,
    Orthogonal,
    Volume,
    Interpolation,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectorConfig {
    #[serde(default)]
    pub forward: KernelName,
    /// Same as `forward` if not given
    #[serde(default)]
    pub backward: Option<KernelName>,
    #[serde(default = "one")]
    pub rays_transaxial: usize,
    #[serde(default = "one")]
    pub rays_axial: usize,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_uom_opt")]
    pub crystal_width_transaxial: Option<Length>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_uom_opt")]
    pub crystal_width_axial: Option<Length>,
    #[serde(default = "default_tube")]
    #[serde(deserialize_with = "deserialize_uom")]
    pub tube_width: Length,
    /// Orthogonal distance measured in 3D rather than in the transaxial plane
    #[serde(default = "yes")]
    pub orthogonal_3d: bool,
    #[serde(default = "default_tube")]
    #[serde(deserialize_with = "deserialize_uom")]
    pub tube_radius: Length,
    #[serde(default = "one_f32")]
    pub voxel_radius: f32,
    /// Sample spacing relative to the voxel size
    #[serde(default = "half")]
    pub interpolation_length: f32,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub staging: Staging,
    #[serde(default = "default_job_size")]
    pub job_size: usize,
}

fn default_tube() -> Length { mm(2.0) }
fn half() -> f32 { 0.5 }
fn default_job_size() -> usize { DEFAULT_JOB_SIZE }

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            forward: KernelName::default(), backward: None,
            rays_transaxial: 1, rays_axial: 1,
            crystal_width_transaxial: None, crystal_width_axial: None,
            tube_width: default_tube(), orthogonal_3d: true,
            tube_radius: default_tube(), voxel_radius: 1.0,
            interpolation_length: half(),
            precision: Precision::default(), staging: Staging::default(),
            job_size: DEFAULT_JOB_SIZE,
        }
    }
}

impl ProjectorConfig {

    /// Crystal widths default to the scanner's pitches
    pub fn kernel(&self, name: KernelName, scanner: &ScannerConfig) -> Kernel {
        match name {
            KernelName::Siddon => Kernel::Siddon(Siddon::multi_ray(self.rays_transaxial, self.rays_axial, (
                mm_(self.crystal_width_transaxial.unwrap_or(scanner.pitch_transaxial)),
                mm_(self.crystal_width_axial     .unwrap_or(scanner.pitch_axial     )),
            ))),
            KernelName::Orthogonal if self.orthogonal_3d => Kernel::Orthogonal(Orthogonal::new_3d(mm_(self.tube_width))),
            KernelName::Orthogonal => Kernel::Orthogonal(Orthogonal::new_2d(mm_(self.tube_width))),
            KernelName::Volume => Kernel::Volume(Volume { tube_radius: mm_(self.tube_radius), voxel_radius: self.voxel_radius }),
            KernelName::Interpolation => Kernel::Interpolation(Interpolation { step: self.interpolation_length }),
        }
    }

    pub fn projector(&self, scanner: &ScannerConfig, layout: VolumeLayout, tof: TofBinning) -> Result<Projector> {
        let forward = self.kernel(self.forward, scanner);
        let backward = self.kernel(self.backward.unwrap_or(self.forward), scanner);
        Ok(Projector::new(forward, backward, layout, tof, self.precision)?.with_job_size(self.job_size))
    }
}

// ----- [tof] -------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TofConfig {
    pub bins: usize,
    #[serde(deserialize_with = "deserialize_uom")]
    pub width: Time,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_uom_opt")]
    pub offset: Option<Time>,
    #[serde(deserialize_with = "deserialize_uom")]
    pub fwhm: Time,
    /// Gaussian cut-off, in standard deviations
    #[serde(default)]
    pub cutoff: Option<f32>,
}

impl TofConfig {
    pub fn binning(&self) -> Result<TofBinning> {
        let binning = TofBinning::new(self.bins, self.width, self.offset.unwrap_or(ps(0.0)), self.fwhm)?;
        Ok(match self.cutoff {
            Some(c) if !(c > 0.0) => return Err(config_error!("TOF cut-off must be positive, got {c}")),
            Some(c) => binning.with_cutoff(c),
            None => binning,
        })
    }
}

// ----- [corrections] -----------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CorrectionsConfig {
    #[serde(default)]
    pub mode: CorrectionMode,
    #[serde(default)]
    pub normalization: Option<PathBuf>,
    #[serde(default)]
    pub randoms: Option<PathBuf>,
    #[serde(default)]
    pub scatter: Option<PathBuf>,
    /// μ-map in mm⁻¹ on the image grid
    #[serde(default)]
    pub attenuation_map: Option<PathBuf>,
    #[serde(default = "one_f32")]
    pub global_factor: f32,
    #[serde(default)]
    pub nonnegative_randoms: bool,
}

impl Default for CorrectionsConfig {
    fn default() -> Self {
        Self {
            mode: CorrectionMode::default(),
            normalization: None, randoms: None, scatter: None, attenuation_map: None,
            global_factor: 1.0,
            nonnegative_randoms: false,
        }
    }
}

// ----- [reconstruction] --------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconstructionConfig {
    /// Name of the algorithm, such as `"OSEM"` or `"PDHG-KL"`
    pub algorithm: String,
    pub iterations: usize,
    #[serde(default = "one")]
    pub subsets: usize,
    /// Conventional subset type number
    #[serde(default = "one_u32")]
    pub subset_type: u32,
    #[serde(default)]
    pub seed: u64,
    /// Empty or a single value: decreasing schedule; several: one per iteration
    #[serde(default)]
    pub relaxation: Vec<f32>,
    #[serde(default = "yes")]
    pub positivity: bool,
    #[serde(default = "default_eps")]
    pub eps: f32,
    #[serde(default)]
    pub save_iterations: Vec<usize>,
    #[serde(default)]
    pub store_forward_projections: bool,
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,

    // Algorithm parameters; defaults come with the algorithm
    #[serde(default)] pub h: Option<f32>,
    #[serde(default)] pub upper_bound: Option<f32>,
    #[serde(default)] pub drama_beta0: Option<f32>,
    #[serde(default)] pub drama_beta: Option<f32>,
    #[serde(default)] pub drama_alpha: Option<f32>,
    #[serde(default)] pub pkma_rho: Option<f32>,
    #[serde(default)] pub pkma_delta: Option<f32>,
    #[serde(default)] pub pkma_alpha: Vec<f32>,
    #[serde(default)] pub l1_weight: Option<f32>,
    #[serde(default)] pub tau: Option<f32>,
    #[serde(default)] pub sigma: Option<f32>,
    #[serde(default)] pub theta: Option<f32>,
}

fn one_u32() -> u32 { 1 }
fn default_eps() -> f32 { 1e-8 }
fn default_power_iterations() -> usize { 20 }

impl ReconstructionConfig {

    pub fn algorithm(&self) -> Result<Algorithm> {
        let set = |target: &mut f32, value: Option<f32>| if let Some(v) = value { *target = v };
        let mut algorithm = Algorithm::from_name(&self.algorithm)?;
        match &mut algorithm {
            Algorithm::Acosem { h } => set(h, self.h),
            Algorithm::Mramla { upper } | Algorithm::Mbsrem { upper } => set(upper, self.upper_bound),
            Algorithm::Drama { beta0, beta, alpha } => {
                set(beta0, self.drama_beta0);
                set(beta, self.drama_beta);
                set(alpha, self.drama_alpha);
            }
            Algorithm::Pkma { rho, delta, alpha } => {
                set(rho, self.pkma_rho);
                set(delta, self.pkma_delta);
                alpha.clone_from(&self.pkma_alpha);
            }
            Algorithm::FistaL1 { weight } => set(weight, self.l1_weight),
            Algorithm::Pdhg(pd) | Algorithm::PdhgL1(pd) | Algorithm::PdhgKl(pd) | Algorithm::Pddy(pd) => {
                set(&mut pd.tau, self.tau);
                set(&mut pd.sigma, self.sigma);
                set(&mut pd.theta, self.theta);
            }
            _ => (),
        }
        algorithm.validate()?;
        Ok(algorithm)
    }

    pub fn settings(&self, staging: Staging, preconditioners: Preconditioners) -> Result<Settings> {
        let settings = Settings {
            algorithm: self.algorithm()?,
            iterations: self.iterations,
            subsets: self.subsets,
            subset_policy: SubsetPolicy::from_number(self.subset_type)?,
            seed: self.seed,
            relaxation: Relaxation::from_values(&self.relaxation),
            enforce_positivity: self.positivity,
            eps: self.eps,
            save_iterations: self.save_iterations.clone(),
            store_forward_projections: self.store_forward_projections,
            staging,
            preconditioners,
            power_iterations: self.power_iterations,
        };
        settings.relaxation.validate(settings.iterations)?;
        Ok(settings)
    }
}

// ----- [prior] -----------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorName {
    Mrp, Quadratic, Huber, LFilter, Fmh, WeightedMean, Tv, AdMrp, Apls, Hyperbolic, Tgv, Nlm, Rdp, Ggmrf,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NonLocalName {
    #[default]
    Means,
    Tv,
    Mrp,
    Rdp,
    Ggmrf,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PriorConfig {
    #[serde(rename = "type")]
    pub kind: PriorName,
    pub beta: f32,
    /// Neighbourhood half-size, in voxels
    #[serde(default = "unit_radius")]
    pub radius: [usize; 3],
    /// Neighbourhood weights over the full window, x fastest; inverse
    /// distances if not given
    #[serde(default)]
    pub weights: Option<Vec<f32>>,
    /// Normalize the median family by the filtered image
    #[serde(default = "yes")]
    pub normalize: bool,
    /// Raw `f32` reference (anatomical) image
    #[serde(default)]
    pub reference: Option<PathBuf>,

    #[serde(default)] pub delta: Option<f32>,
    #[serde(default)] pub gamma: Option<f32>,
    #[serde(default)] pub include_corners: bool,
    #[serde(default)] pub p: Option<f32>,
    #[serde(default)] pub q: Option<f32>,
    #[serde(default)] pub c: Option<f32>,
    #[serde(default)] pub l_weights: Option<Vec<f32>>,
    #[serde(default)] pub fmh_taps: Option<Vec<f32>>,
    #[serde(default)] pub mean_type: MeanType,
    #[serde(default)] pub centre_weight: Option<f32>,
    #[serde(default)] pub tv_type: TvType,
    #[serde(default)] pub smoothing: Option<f32>,
    #[serde(default)] pub t: Option<f32>,
    #[serde(default)] pub tv_c: Option<f32>,
    #[serde(default)] pub eta: Option<f32>,
    #[serde(default)] pub alpha0: Option<f32>,
    #[serde(default)] pub alpha1: Option<f32>,
    #[serde(default)] pub tgv_iterations: Option<usize>,
    #[serde(default)] pub time_step: Option<f32>,
    #[serde(default)] pub k: Option<f32>,
    #[serde(default)] pub ad_iterations: Option<usize>,
    #[serde(default)] pub flux: Flux,
    #[serde(default)] pub diffusion: DiffusionType,
    #[serde(default)] pub nl_variant: NonLocalName,
    #[serde(default)] pub search: Option<[usize; 3]>,
    #[serde(default)] pub patch: Option<[usize; 3]>,
    #[serde(default)] pub h: Option<f32>,
    #[serde(default)] pub patch_sigma: Option<f32>,
    /// NLM similarities from the reference image
    #[serde(default)] pub anatomical: bool,
}

fn unit_radius() -> [usize; 3] { [1, 1, 1] }

impl PriorConfig {

    pub fn kind(&self) -> PriorKind {
        let or = |v: Option<f32>, default: f32| v.unwrap_or(default);
        let smoothing = or(self.smoothing, 1e-2);
        match self.kind {
            PriorName::Mrp => PriorKind::Mrp,
            PriorName::Quadratic => PriorKind::Quadratic,
            PriorName::Huber => PriorKind::Huber { delta: or(self.delta, 1.0) },
            PriorName::LFilter => PriorKind::LFilter { weights: self.l_weights.clone() },
            PriorName::Fmh => PriorKind::Fmh { taps: self.fmh_taps.clone(), centre_weight: or(self.centre_weight, 4.0) as usize },
            PriorName::WeightedMean => PriorKind::WeightedMean { mean: self.mean_type, centre_weight: or(self.centre_weight, 4.0) },
            PriorName::Tv => PriorKind::Tv(TotalVariation {
                tv: self.tv_type, smoothing, t: or(self.t, 0.5), c: or(self.tv_c, 1.0),
            }),
            PriorName::AdMrp => PriorKind::AdMrp(AnisotropicDiffusion {
                time_step: or(self.time_step, 0.0625), k: or(self.k, 2.0),
                iterations: self.ad_iterations.unwrap_or(10), flux: self.flux, diffusion: self.diffusion,
            }),
            PriorName::Apls => PriorKind::Apls(Apls { eta: or(self.eta, 1e-3), smoothing }),
            PriorName::Hyperbolic => PriorKind::Hyperbolic { delta: or(self.delta, 1.0) },
            PriorName::Tgv => PriorKind::Tgv(Tgv {
                alpha0: or(self.alpha0, 1.0), alpha1: or(self.alpha1, 2.0), smoothing,
                iterations: self.tgv_iterations.unwrap_or(10),
            }),
            PriorName::Nlm => PriorKind::Nlm(NonLocal {
                variant: match self.nl_variant {
                    NonLocalName::Means => NlVariant::Means,
                    NonLocalName::Tv => NlVariant::Tv,
                    NonLocalName::Mrp => NlVariant::Mrp,
                    NonLocalName::Rdp => NlVariant::RelativeDifference { gamma: or(self.gamma, 10.0) },
                    NonLocalName::Ggmrf => NlVariant::Ggmrf { p: or(self.p, 1.5), q: or(self.q, 1.0), c: or(self.c, 5e-4) },
                },
                search: self.search.unwrap_or([2, 2, 1]),
                patch: self.patch.unwrap_or([1, 1, 1]),
                h: or(self.h, 1e-3),
                patch_sigma: or(self.patch_sigma, 1.0),
                anatomical: self.anatomical,
                eps: smoothing,
            }),
            PriorName::Rdp => PriorKind::Rdp { gamma: or(self.gamma, 10.0), include_corners: self.include_corners },
            PriorName::Ggmrf => PriorKind::Ggmrf { p: or(self.p, 1.5), q: or(self.q, 1.0), c: or(self.c, 5e-4) },
        }
    }

    /// The prior, on a volume with voxels of `voxel_size` mm
    pub fn prior(&self, voxel_size: [f32; 3], reference: Option<ImageVolume>) -> Result<Prior> {
        let neighbourhood = match &self.weights {
            Some(w) => Neighbourhood::with_weights(self.radius, w)?,
            None => Neighbourhood::inverse_distance(self.radius, voxel_size),
        };
        let prior = Prior::new(self.kind(), self.beta, neighbourhood).with_normalization(self.normalize);
        Ok(match reference {
            Some(r) => prior.with_reference(r),
            None => prior,
        })
    }
}

// ----- [preconditioner] --------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImagePreconditionerName { Diagonal, Em, Iem, Momentum, Gradient, Filtering, Curvature }

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementPreconditionerName { Diagonal, Filtering }

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PreconditionerConfig {
    #[serde(default)]
    pub image: Vec<ImagePreconditionerName>,
    #[serde(default)]
    pub measurement: Vec<MeasurementPreconditionerName>,
    #[serde(default)]
    pub window: Window,
    /// Sub-iterations during which filtering is applied
    #[serde(default = "one")]
    pub filtering_iterations: usize,
    #[serde(default = "default_rho")]
    pub momentum_rho: f32,
    #[serde(default = "one_f32")]
    pub momentum_delta: f32,
    #[serde(default = "default_v1")]
    pub gradient_v1: f32,
    #[serde(default = "default_v2")]
    pub gradient_v2: f32,
    /// One-based sub-iterations bounding the gradient-based preconditioner
    #[serde(default = "one")]
    pub gradient_first: usize,
    #[serde(default = "default_last")]
    pub gradient_last: usize,
    /// Raw `f32` estimate of the final image, for IEM
    #[serde(default)]
    pub iem_reference: Option<PathBuf>,
    #[serde(default = "default_floor")]
    pub iem_floor: f32,
}

fn default_rho() -> f32 { 0.95 }
fn default_v1() -> f32 { 1.0 }
fn default_v2() -> f32 { 2.0 }
fn default_last() -> usize { 100 }
fn default_floor() -> f32 { 1e-4 }

impl Default for PreconditionerConfig {
    fn default() -> Self {
        Self {
            image: vec![], measurement: vec![],
            window: Window::default(), filtering_iterations: 1,
            momentum_rho: default_rho(), momentum_delta: 1.0,
            gradient_v1: default_v1(), gradient_v2: default_v2(), gradient_first: 1, gradient_last: default_last(),
            iem_reference: None, iem_floor: default_floor(),
        }
    }
}

impl PreconditionerConfig {
    pub fn preconditioners(&self, iem_reference: Option<Vec<f32>>) -> Result<Preconditioners> {
        let mut iem_reference = iem_reference;
        let image = self.image.iter().map(|name| Ok(match name {
            ImagePreconditionerName::Diagonal => ImagePreconditioner::Diagonal,
            ImagePreconditionerName::Em => ImagePreconditioner::Em,
            ImagePreconditionerName::Iem => ImagePreconditioner::Iem {
                reference: iem_reference.take().ok_or_else(|| missing("reference image of the IEM preconditioner"))?,
                floor: self.iem_floor,
            },
            ImagePreconditionerName::Momentum => ImagePreconditioner::Momentum { rho: self.momentum_rho, delta: self.momentum_delta },
            ImagePreconditionerName::Gradient => ImagePreconditioner::Gradient {
                v1: self.gradient_v1, v2: self.gradient_v2, first: self.gradient_first, last: self.gradient_last,
            },
            ImagePreconditionerName::Filtering => ImagePreconditioner::Filtering { window: self.window, iterations: self.filtering_iterations },
            ImagePreconditionerName::Curvature => ImagePreconditioner::Curvature,
        })).collect::<Result<Vec<_>>>()?;
        let measurement = self.measurement.iter().map(|name| match name {
            MeasurementPreconditionerName::Diagonal => MeasurementPreconditioner::Diagonal,
            MeasurementPreconditionerName::Filtering => MeasurementPreconditioner::Filtering { window: self.window, iterations: self.filtering_iterations },
        }).collect();
        Ok(Preconditioners { image, measurement })
    }
}

// ----- whole file --------------------------------------------------------------

impl Config {

    /// Every file the configuration refers to, with what it is for
    pub fn files(&self) -> Vec<(&'static str, &Path)> {
        let c = &self.corrections;
        [
            ("initial image"            , self.image.initial.as_deref()),
            ("image mask"               , self.image.mask.as_deref()),
            ("normalization correction" , c.normalization.as_deref()),
            ("randoms correction"       , c.randoms.as_deref()),
            ("scatter correction"       , c.scatter.as_deref()),
            ("attenuation map"          , c.attenuation_map.as_deref()),
            ("prior reference image"    , self.prior.as_ref().and_then(|p| p.reference.as_deref())),
            ("IEM reference image"      , self.preconditioner.iem_reference.as_deref()),
        ].into_iter()
            .filter_map(|(what, path)| path.map(|p| (what, p)))
            .collect()
    }

    pub fn tof(&self) -> Result<TofBinning> {
        self.tof.as_ref().map_or(Ok(TofBinning::disabled()), TofConfig::binning)
    }

    /// Check everything that can be checked without reading the data
    pub fn validate(&self) -> Result<()> {
        for (what, path) in self.files() {
            if !path.exists() {
                return Err(Error::MissingResource { what: what.into(), path: Some(path.into()) })
            }
        }
        let scanner = self.scanner.geometry()?;
        if let Some(sinogram) = &self.sinogram { sinogram.layout(&scanner)?; }
        let layout = self.image.layout()?;
        self.projector.projector(&self.scanner, layout.clone(), self.tof()?)?;
        let recon = &self.reconstruction;
        let algorithm = recon.algorithm()?;
        let policy = SubsetPolicy::from_number(recon.subset_type)?;
        if policy.needs_sinogram() && self.sinogram.is_none() {
            return Err(config_error!("subset type {} needs a [sinogram] table", recon.subset_type))
        }
        if algorithm.requires_single_subset() && recon.subsets != 1 {
            return Err(config_error!("{} needs a single subset, got {}", algorithm.name(), recon.subsets))
        }
        Relaxation::from_values(&recon.relaxation).validate(recon.iterations)?;
        if let Some(prior) = &self.prior {
            if !algorithm.supports_prior() {
                return Err(config_error!("{} cannot be combined with a prior", algorithm.name()))
            }
            let kind = prior.kind();
            if kind.needs_reference() && prior.reference.is_none() {
                return Err(missing(format!("reference image required by the {} prior", kind.name())))
            }
        }
        if self.preconditioner.image.contains(&ImagePreconditionerName::Iem) && self.preconditioner.iem_reference.is_none() {
            return Err(missing("reference image of the IEM preconditioner"))
        }
        Ok(())
    }
}

pub fn read_config_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(Error::MissingResource { what: "configuration file".into(), path: Some(path.into()) })
    }
    let config: String = fs::read_to_string(path)?;
    Ok(toml::from_str(&config)?)
}
