//! The (iteration, subset) loop shared by every algorithm.
//!
//! A `Solver` owns the problem and the current estimate. Each call to `step`
//! processes exactly one subset: forward projection of the estimate along
//! the subset's LORs, comparison with the data, back-projection, update.
//! Every configuration and resource error is raised by `Solver::new`, before
//! the first step.

pub mod algorithm;
pub mod power;
pub mod preconditioner;
pub mod relaxation;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;

pub use algorithm::{Algorithm, DataTerm, Family, PrimalDual};
pub use preconditioner::{ImagePreconditioner, MeasurementPreconditioner, Preconditioners, Window};
pub use relaxation::Relaxation;

use crate::{
    LOR,
    config_error,
    corrections::{Corrections, ForwardModel},
    error::{Result, Warning},
    image::{ImageData, ImageVolume},
    measurement::Measurements,
    priors::Prior,
    projector::Projector,
    scanner::ScannerGeometry,
    subsets::{SubsetPolicy, partition},
};
use algorithm::{clamp_nonnegative, em_update, fista_momentum, log_likelihood, ratios, soft_threshold};
use preconditioner::{Base, StepContext};

/// Where the per-subset LORs and correction factors live
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Staging {
    /// Built once, for all subsets, before the first step
    #[default]
    Resident,
    /// Built for the active subset at the start of each step
    PerSubset,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub algorithm: Algorithm,
    pub iterations: usize,
    pub subsets: usize,
    pub subset_policy: SubsetPolicy,
    pub seed: u64,
    pub relaxation: Relaxation,
    pub enforce_positivity: bool,
    /// Guards divisions by vanishing sensitivities and expectations
    pub eps: f32,
    /// One-based iterations after which the estimate is kept
    pub save_iterations: Vec<usize>,
    pub store_forward_projections: bool,
    pub staging: Staging,
    pub preconditioners: Preconditioners,
    pub power_iterations: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Osem,
            iterations: 1,
            subsets: 1,
            subset_policy: SubsetPolicy::default(),
            seed: 0,
            relaxation: Relaxation::default(),
            enforce_positivity: true,
            eps: 1e-8,
            save_iterations: vec![],
            store_forward_projections: false,
            staging: Staging::default(),
            preconditioners: Preconditioners::default(),
            power_iterations: 20,
        }
    }
}

/// Everything that is reconstructed, as opposed to how
#[derive(Clone, Debug)]
pub struct Problem {
    pub scanner: ScannerGeometry,
    pub measurements: Measurements,
    pub corrections: Corrections,
    pub projector: Projector,
    pub prior: Option<Prior>,
    /// Starting estimate; its mask restricts the reconstruction
    pub initial: ImageVolume,
}

#[derive(Clone, Debug)]
pub struct RunOutput {
    pub image: ImageVolume,
    /// Estimates after the requested (one-based) iterations
    pub saved: Vec<(usize, ImageVolume)>,
    /// Expected measurement of the active subset, one per step
    pub forward_projections: Vec<Vec<f32>>,
    pub warnings: Vec<Warning>,
}

/// The data of one subset, as the algorithms see them
#[derive(Clone, Debug)]
struct SubsetData {
    lors: Vec<LOR>,
    /// Measured values, corrected if corrections precede reconstruction
    y: Vec<f32>,
    model: ForwardModel,
}

fn build_subset(problem: &Problem, indices: &[usize]) -> SubsetData {
    let mut y = problem.measurements.values(indices);
    problem.corrections.apply(&mut y, indices);
    SubsetData {
        lors: problem.measurements.lors(&problem.scanner, indices),
        y,
        model: problem.corrections.forward_model(indices),
    }
}

/// Algorithm-specific memory carried between steps
#[derive(Clone, Debug)]
enum State {
    Memoryless,
    /// Per-subset complete data of the COSEM family, and their sum
    CompleteData { parts: Vec<ImageData>, sum: ImageData },
    /// Extrapolated point and momentum of FISTA
    Fista { z: ImageData, t: f32 },
    Cgls { r: Vec<f32>, p: ImageData, gamma: f64 },
    Lsqr { u: Vec<f32>, v: ImageData, w: ImageData, alpha: f64, phi_bar: f64, rho_bar: f64 },
    PrimalDual {
        duals: Vec<Vec<f32>>,
        z: ImageData,
        z_bar: ImageData,
        /// Unprojected primal iterate of PDDY
        s: ImageData,
        tau: Vec<f32>,
        sigma: Vec<Vec<f32>>,
    },
}

pub struct Solver {
    settings: Settings,
    problem: Problem,
    subsets: Vec<Vec<usize>>,
    staged: Option<Vec<SubsetData>>,
    /// Sensitivity of each subset
    sensitivities: Vec<ImageData>,
    /// Sensitivity of the full data
    sensitivity: ImageData,
    /// Voxel upper bound of MRAMLA and MBSREM
    upper: f32,
    image: ImageVolume,
    state: State,
    iteration: usize,
    subset: usize,
    sub_iteration: usize,
    warnings: Vec<Warning>,
    saved: Vec<(usize, ImageVolume)>,
    forward_projections: Vec<Vec<f32>>,
}

impl Solver {

    pub fn new(settings: Settings, problem: Problem) -> Result<Self> {
        validate(&settings, &problem)?;
        let mut warnings = vec![];
        if let Some(w) = problem.projector.precision().overflow_warning(problem.measurements.total()) {
            log::warn!("{w}");
            warnings.push(w);
        }
        let subsets = partition(problem.measurements.len(), settings.subsets, settings.subset_policy,
                                problem.measurements.shape(), settings.seed)?;
        let staged = (settings.staging == Staging::Resident)
            .then(|| subsets.iter().map(|s| build_subset(&problem, s)).collect());
        let mut image = problem.initial.clone();
        if positivity(&settings) { clamp_nonnegative(&mut image.data) }

        let mut solver = Self {
            settings, problem, subsets, staged,
            sensitivities: vec![], sensitivity: vec![], upper: 0.0,
            image, state: State::Memoryless,
            iteration: 0, subset: 0, sub_iteration: 0,
            warnings, saved: vec![], forward_projections: vec![],
        };
        solver.prepare()?;
        log::info!("{}: {} iteration(s) of {} subset(s), {} measurements, {} voxels",
                   solver.settings.algorithm.name(), solver.settings.iterations, solver.subsets.len(),
                   solver.problem.measurements.len(), solver.image.len());
        Ok(solver)
    }

    pub fn image      (&self) -> &ImageVolume    { &self.image }
    pub fn iteration  (&self) -> usize           { self.iteration }
    pub fn subset     (&self) -> usize           { self.subset }
    pub fn warnings   (&self) -> &[Warning]      { &self.warnings }
    pub fn subsets    (&self) -> &[Vec<usize>]   { &self.subsets }
    pub fn sensitivity(&self) -> &[f32]          { &self.sensitivity }
    pub fn settings   (&self) -> &Settings       { &self.settings }
    pub fn n_steps    (&self) -> usize           { self.settings.iterations * self.subsets.len() }

    pub fn is_finished(&self) -> bool { self.iteration >= self.settings.iterations }

    /// Process the next subset. Returns `false`, doing nothing, once every
    /// iteration has been run.
    pub fn step(&mut self) -> Result<bool> {
        if self.is_finished() { return Ok(false) }
        let m = self.subset;
        let staged = self.staged.take();
        let outcome = match &staged {
            Some(all) => self.update(m, &all[m]),
            None => {
                let data = build_subset(&self.problem, &self.subsets[m]);
                self.update(m, &data)
            }
        };
        self.staged = staged;
        let expected = outcome?;

        if positivity(&self.settings) { clamp_nonnegative(&mut self.image.data) }
        if self.settings.store_forward_projections { self.forward_projections.push(expected) }
        log::debug!("{} iteration {}/{}, subset {}/{}", self.settings.algorithm.name(),
                    self.iteration + 1, self.settings.iterations, m + 1, self.subsets.len());

        self.sub_iteration += 1;
        self.subset += 1;
        if self.subset == self.subsets.len() {
            self.subset = 0;
            self.iteration += 1;
            if self.settings.save_iterations.contains(&self.iteration) {
                self.saved.push((self.iteration, self.image.clone()));
            }
        }
        Ok(true)
    }

    /// Run the remaining steps, checking `stop` between them
    pub fn run(self, stop: Option<&AtomicBool>) -> Result<RunOutput> {
        self.run_with(stop, |_| ())
    }

    /// As `run`, calling `observe` after every step
    pub fn run_with(mut self, stop: Option<&AtomicBool>, mut observe: impl FnMut(&Solver)) -> Result<RunOutput> {
        while !self.is_finished() {
            if stop.map_or(false, |s| s.load(Ordering::Relaxed)) {
                let w = Warning::Cancelled { iteration: self.iteration, subset: self.subset };
                log::warn!("{w}");
                self.warnings.push(w);
                break;
            }
            self.step()?;
            observe(&self);
        }
        Ok(RunOutput {
            image: self.image,
            saved: self.saved,
            forward_projections: self.forward_projections,
            warnings: self.warnings,
        })
    }

    // ----- set-up ----------------------------------------------------------

    fn with_subset<T>(&self, m: usize, f: impl FnOnce(&SubsetData) -> T) -> T {
        match &self.staged {
            Some(all) => f(&all[m]),
            None => f(&build_subset(&self.problem, &self.subsets[m])),
        }
    }

    fn prepare(&mut self) -> Result<()> {
        let mask = self.image.mask();
        let sensitivities: Vec<ImageData> = (0..self.subsets.len())
            .map(|m| self.with_subset(m, |d| {
                self.problem.projector.sensitivity(&d.lors, Some(&d.model.multiplicative), mask)
            }))
            .collect();
        let mut total = vec![0.0; self.image.len()];
        for s in &sensitivities {
            total.iter_mut().zip(s).for_each(|(t, s)| *t += s);
        }
        self.sensitivities = sensitivities;
        self.sensitivity = total;

        let eps = self.settings.eps;
        if let Some(upper) = self.settings.algorithm.upper_bound() {
            self.upper = if upper > 0.0 { upper } else {
                let counts: f64 = (0..self.subsets.len())
                    .map(|m| self.with_subset(m, |d| d.y.iter().map(|&y| y as f64).sum::<f64>()))
                    .sum();
                let smallest = self.sensitivity.iter().copied().filter(|&s| s > eps).fold(f32::INFINITY, f32::min);
                (counts / smallest as f64) as f32
            };
            log::info!("{} upper bound: {:.4e}", self.settings.algorithm.name(), self.upper);
        }

        self.state = match self.settings.algorithm.family() {
            Family::ExpectationMaximization if self.is_cosem() => {
                let x = &self.image.data;
                let parts: Vec<ImageData> = (0..self.subsets.len())
                    .map(|m| self.with_subset(m, |d| {
                        let expected = self.expected(x, d);
                        let b = self.back(&ratios(&d.y, &expected, eps), d);
                        x.iter().zip(b).map(|(x, b)| x * b).collect()
                    }))
                    .collect();
                let mut sum = vec![0.0; x.len()];
                for part in &parts {
                    sum.iter_mut().zip(part).for_each(|(s, p)| *s += p);
                }
                State::CompleteData { parts, sum }
            }
            Family::Gradient if matches!(self.settings.algorithm, Algorithm::Fista | Algorithm::FistaL1 { .. }) =>
                State::Fista { z: self.image.data.clone(), t: 1.0 },
            Family::LeastSquares => self.with_subset(0, |d| self.least_squares_start(d)),
            Family::PrimalDual => self.primal_dual_start()?,
            _ => State::Memoryless,
        };
        Ok(())
    }

    fn is_cosem(&self) -> bool {
        matches!(self.settings.algorithm, Algorithm::Cosem | Algorithm::Ecosem | Algorithm::Acosem { .. })
    }

    fn least_squares_start(&self, d: &SubsetData) -> State {
        let b = data_minus_additive(d);
        let kx = self.forward_linear(&self.image.data, d);
        let r: Vec<f32> = b.iter().zip(kx).map(|(b, k)| b - k).collect();
        match self.settings.algorithm {
            Algorithm::Cgls => {
                let s = self.back(&r, d);
                let gamma = norm_squared(&s);
                State::Cgls { r, p: s, gamma }
            }
            _ => {
                let mut u = r;
                let beta = normalize(&mut u);
                let mut v = self.back(&u, d);
                let alpha = normalize(&mut v);
                State::Lsqr { w: v.clone(), u, v, alpha, phi_bar: beta, rho_bar: alpha }
            }
        }
    }

    fn primal_dual_start(&self) -> Result<State> {
        let (Algorithm::Pdhg(pd) | Algorithm::PdhgL1(pd) | Algorithm::PdhgKl(pd) | Algorithm::Pddy(pd)) = &self.settings.algorithm
        else { return Ok(State::Memoryless) };
        let eps = self.settings.eps;
        let n = self.image.len();
        let precond = &self.settings.preconditioners;
        let sigma: Vec<Vec<f32>> = (0..self.subsets.len())
            .map(|m| self.with_subset(m, |d| {
                let scaling = precond.has_measurement_diagonal()
                    .then(|| self.forward_linear(&vec![1.0; n], d))
                    .and_then(|row_sums| precond.dual_scaling(&row_sums, eps));
                match scaling {
                    Some(s) => s.into_iter().map(|s| pd.sigma * s).collect(),
                    None => vec![pd.sigma; d.y.len()],
                }
            }))
            .collect();

        let tau = if pd.tau > 0.0 {
            pd.tau
        } else if precond.has_measurement_diagonal() && precond.has_image_scaling() {
            1.0 / pd.sigma
        } else {
            let normal = |x: &[f32]| {
                let mut out = vec![0.0; x.len()];
                for m in 0..self.subsets.len() {
                    let ktkx = self.with_subset(m, |d| self.back(&self.forward_linear(x, d), d));
                    out.iter_mut().zip(ktkx).for_each(|(o, v)| *o += v);
                }
                out
            };
            let l = power::operator_norm_squared(normal, n, self.settings.power_iterations, self.settings.seed);
            if !(l > 0.0) { return Err(config_error!("{}: the system matrix has no non-zero elements", self.settings.algorithm.name())) }
            0.99 / (pd.sigma * l)
        };
        log::info!("{} primal step {tau:.4e}", self.settings.algorithm.name());
        let ctx = self.context(&self.image.data, None);
        let tau = if precond.has_image_scaling() {
            precond.scaling(&ctx, Base::Identity, eps).into_iter().map(|s| tau * s).collect()
        } else {
            vec![tau; n]
        };
        Ok(State::PrimalDual {
            duals: self.subsets.iter().map(|s| vec![0.0; s.len()]).collect(),
            z: vec![0.0; n],
            z_bar: vec![0.0; n],
            s: self.image.data.clone(),
            tau,
            sigma,
        })
    }

    // ----- operators -------------------------------------------------------

    /// ȳ = mult · A x + add
    fn expected(&self, x: &[f32], d: &SubsetData) -> Vec<f32> {
        let mut e = self.problem.projector.forward_data(x, &d.lors);
        d.model.apply(&mut e);
        e
    }

    /// K x = mult · A x
    fn forward_linear(&self, x: &[f32], d: &SubsetData) -> Vec<f32> {
        let mut e = self.problem.projector.forward_data(x, &d.lors);
        e.iter_mut().zip(&d.model.multiplicative).for_each(|(e, m)| *e *= m);
        e
    }

    /// Kᵀ v = Aᵀ (mult · v)
    fn back(&self, v: &[f32], d: &SubsetData) -> ImageData {
        let weighted: Vec<f32> = v.iter().zip(&d.model.multiplicative).map(|(v, m)| v * m).collect();
        self.problem.projector.backward(&weighted, &d.lors, self.image.mask())
    }

    fn prior_gradient(&self, x: &[f32]) -> Result<Option<ImageData>> {
        match &self.problem.prior {
            None => Ok(None),
            Some(prior) => Ok(Some(prior.gradient(&self.image.with_data(x.to_vec())?)?)),
        }
    }

    fn context<'a>(&'a self, x: &'a [f32], curvature: Option<&'a [f32]>) -> StepContext<'a> {
        StepContext {
            x,
            sensitivity: &self.sensitivity,
            curvature,
            sub_iteration: self.sub_iteration,
            layout: self.image.layout(),
        }
    }

    fn relaxation(&self) -> f32 { self.settings.relaxation.at(self.iteration) }

    // ----- updates ---------------------------------------------------------

    fn update(&mut self, m: usize, d: &SubsetData) -> Result<Vec<f32>> {
        match self.settings.algorithm.family() {
            Family::ExpectationMaximization => self.em_step(m, d),
            Family::Gradient => self.gradient_step(d),
            Family::LeastSquares => {
                self.least_squares_step(d);
                Ok(if self.settings.store_forward_projections { self.expected(&self.image.data, d) } else { vec![] })
            }
            Family::PrimalDual => self.primal_dual_step(m, d),
        }
    }

    fn em_step(&mut self, m: usize, d: &SubsetData) -> Result<Vec<f32>> {
        use Algorithm::*;
        let eps = self.settings.eps;
        let p = self.subsets.len() as f32;
        let lambda = match self.settings.algorithm {
            Drama { beta0, beta, alpha } => Algorithm::drama_relaxation(beta0, beta, alpha, self.sub_iteration),
            _ => self.relaxation(),
        };
        let expected = self.expected(&self.image.data, d);
        let b = self.back(&ratios(&d.y, &expected, eps), d);
        let prior = self.prior_gradient(&self.image.data)?;
        let g = |j: usize| prior.as_ref().map_or(0.0, |g| g[j]);
        let s = &self.sensitivities[m];
        let big_s = &self.sensitivity;
        let upper = self.upper.max(eps);
        let x = &mut self.image.data;

        match &self.settings.algorithm {
            Osem => {
                let denominator: Vec<f32> = s.iter().enumerate().map(|(j, s)| s + g(j)).collect();
                em_update(x, &b, &denominator, eps);
            }
            Rosem | RosemMap => for j in 0..x.len() {
                if s[j] > eps { x[j] += lambda * x[j] / s[j] * (b[j] - s[j] - g(j) / p) }
            },
            Ramla | Drama { .. } | Bsrem => for j in 0..x.len() {
                if big_s[j] > eps { x[j] += lambda * x[j] * p / big_s[j] * (b[j] - s[j] - g(j) / p) }
            },
            Mramla { .. } | Mbsrem { .. } => for j in 0..x.len() {
                if big_s[j] > eps {
                    let distance = if x[j] <= upper / 2.0 { x[j] } else { upper - x[j] };
                    x[j] = (x[j] + lambda * distance * p / big_s[j] * (b[j] - s[j] - g(j) / p)).clamp(eps, upper);
                }
            },
            Rbi => {
                let c = s.iter().zip(big_s)
                    .filter(|&(_, &big)| big > eps)
                    .map(|(&s, &big)| s / big)
                    .fold(0.0, f32::max);
                let c = if c > 0.0 { 1.0 / c } else { 1.0 };
                for j in 0..x.len() {
                    if big_s[j] > eps { x[j] += c * x[j] / big_s[j] * (b[j] - s[j] - g(j)) }
                }
            }
            Cosem | Ecosem | Acosem { .. } => {
                let State::CompleteData { parts, sum } = &mut self.state else { return Err(state_mismatch(&self.settings.algorithm)) };
                for j in 0..x.len() {
                    let new = x[j] * b[j];
                    sum[j] += new - parts[m][j];
                    parts[m][j] = new;
                }
                let h = match self.settings.algorithm { Acosem { h } => h, _ => 1.0 };
                let cosem: Vec<f32> = (0..x.len()).map(|j| {
                    let denominator = big_s[j] + g(j);
                    if denominator > eps { sum[j].max(0.0).powf(1.0 / h) / denominator } else { x[j] }
                }).collect();
                let osem: Option<Vec<f32>> = matches!(self.settings.algorithm, Ecosem).then(|| {
                    (0..x.len()).map(|j| if s[j] > eps { x[j] * b[j] / s[j] } else { x[j] }).collect()
                });
                let next = match osem {
                    Some(osem) => self.ecosem_blend(cosem, &osem, d),
                    None if h != 1.0 => self.rescale_counts(cosem, d),
                    None => cosem,
                };
                self.image.data = next;
            }
            other => return Err(config_error!("{} is not an expectation-maximization algorithm", other.name())),
        }
        Ok(expected)
    }

    /// Largest step from COSEM towards OSEM which does not decrease the
    /// likelihood of the subset
    fn ecosem_blend(&self, cosem: Vec<f32>, osem: &[f32], d: &SubsetData) -> Vec<f32> {
        let eps = self.settings.eps;
        let baseline = log_likelihood(&d.y, &self.expected(&cosem, d), eps);
        let mut alpha = 1.0;
        for _ in 0..5 {
            let blend: Vec<f32> = cosem.iter().zip(osem).map(|(c, o)| alpha * o + (1.0 - alpha) * c).collect();
            if log_likelihood(&d.y, &self.expected(&blend, d), eps) >= baseline { return blend }
            alpha /= 2.0;
        }
        cosem
    }

    /// Scale `x` so that its expectation matches the counts of the subset
    fn rescale_counts(&self, mut x: Vec<f32>, d: &SubsetData) -> Vec<f32> {
        let expected: f64 = self.expected(&x, d).iter().map(|&e| e as f64).sum();
        let measured: f64 = d.y.iter().map(|&y| y as f64).sum();
        if expected > 0.0 && measured > 0.0 {
            let f = (measured / expected) as f32;
            x.iter_mut().for_each(|v| *v *= f);
        }
        x
    }

    /// FISTA, FISTA-L1 and PKMA: a preconditioned gradient step on the
    /// Poisson log-posterior of the subset, scaled up by the subset count.
    fn gradient_step(&mut self, d: &SubsetData) -> Result<Vec<f32>> {
        let eps = self.settings.eps;
        let p = self.subsets.len() as f32;
        let lambda = self.relaxation();
        let k = self.sub_iteration;
        let point = match &self.state {
            State::Fista { z, .. } => z.clone(),
            _ => self.image.data.clone(),
        };

        let expected = self.expected(&point, d);
        let mut residual: Vec<f32> = d.y.iter().zip(&expected).map(|(&y, &e)| y / e.max(eps) - 1.0).collect();
        let rows = self.problem.measurements.shape().map_or(1, |s| s.rows);
        self.settings.preconditioners.filter_measurements(k, &mut residual, rows);
        let mut direction = self.back(&residual, d);
        let prior = self.prior_gradient(&point)?;
        for (j, g) in direction.iter_mut().enumerate() {
            *g = p * *g - prior.as_ref().map_or(0.0, |r| r[j]);
        }

        let curvature = self.settings.preconditioners.needs_curvature().then(|| self.curvature(&expected, d, p));
        let ctx = self.context(&point, curvature.as_deref());
        let scaling = self.settings.preconditioners.scaling(&ctx, Base::Em, eps);
        direction.iter_mut().zip(&scaling).for_each(|(g, s)| *g *= s);
        self.settings.preconditioners.modify(&ctx, &mut direction);

        let mut next: Vec<f32> = point.iter().zip(&direction).map(|(x, g)| x + lambda * g).collect();
        if let Algorithm::FistaL1 { weight } = self.settings.algorithm {
            next.iter_mut().zip(&scaling).for_each(|(x, s)| *x = soft_threshold(*x, lambda * s * weight));
        }
        let positive = positivity(&self.settings);
        if positive { clamp_nonnegative(&mut next) }

        match (&mut self.state, &self.settings.algorithm) {
            (State::Fista { z, t }, _) => {
                let (t_next, w) = fista_momentum(*t);
                *z = next.iter().zip(&self.image.data).map(|(n, x)| n + w * (n - x)).collect();
                *t = t_next;
            }
            (_, Algorithm::Pkma { rho, delta, alpha }) => {
                let a = Algorithm::pkma_alpha(*rho, *delta, alpha, k);
                next.iter_mut().zip(&self.image.data).for_each(|(n, x)| *n = (1.0 - a) * x + a * *n);
                if positive { clamp_nonnegative(&mut next) }
            }
            _ => (),
        }
        self.image.data = next;
        Ok(expected)
    }

    /// P · Kᵀ((y/ȳ²) · K1), the diagonal of the likelihood Hessian
    fn curvature(&self, expected: &[f32], d: &SubsetData, p: f32) -> Vec<f32> {
        let eps = self.settings.eps;
        let k1 = self.forward_linear(&vec![1.0; self.image.len()], d);
        let weights: Vec<f32> = d.y.iter().zip(expected).zip(k1)
            .map(|((&y, &e), k1)| y / e.max(eps).powi(2) * k1)
            .collect();
        self.back(&weights, d).into_iter().map(|c| p * c).collect()
    }

    fn least_squares_step(&mut self, d: &SubsetData) {
        match std::mem::replace(&mut self.state, State::Memoryless) {
            State::Cgls { mut r, mut p, gamma } => {
                let q = self.forward_linear(&p, d);
                let qq = norm_squared(&q);
                if gamma > 0.0 && qq > 0.0 {
                    let alpha = (gamma / qq) as f32;
                    self.image.data.iter_mut().zip(&p).for_each(|(x, p)| *x += alpha * p);
                    r.iter_mut().zip(&q).for_each(|(r, q)| *r -= alpha * q);
                    let s = self.back(&r, d);
                    let gamma_next = norm_squared(&s);
                    let beta = (gamma_next / gamma) as f32;
                    p.iter_mut().zip(&s).for_each(|(p, s)| *p = s + beta * *p);
                    self.state = State::Cgls { r, p, gamma: gamma_next };
                } else {
                    self.state = State::Cgls { r, p, gamma };
                }
            }
            State::Lsqr { mut u, mut v, mut w, alpha, phi_bar, rho_bar } => {
                if alpha == 0.0 || phi_bar == 0.0 {
                    self.state = State::Lsqr { u, v, w, alpha, phi_bar, rho_bar };
                    return
                }
                let kv = self.forward_linear(&v, d);
                u.iter_mut().zip(kv).for_each(|(u, kv)| *u = kv - alpha as f32 * *u);
                let beta = normalize(&mut u);
                let ktu = self.back(&u, d);
                v.iter_mut().zip(ktu).for_each(|(v, ktu)| *v = ktu - beta as f32 * *v);
                let alpha_next = normalize(&mut v);

                let rho = (rho_bar * rho_bar + beta * beta).sqrt();
                let (c, s) = (rho_bar / rho, beta / rho);
                let theta = s * alpha_next;
                let rho_bar = -c * alpha_next;
                let phi = c * phi_bar;
                let phi_bar = s * phi_bar;
                let (step, shrink) = ((phi / rho) as f32, (theta / rho) as f32);
                self.image.data.iter_mut().zip(&w).for_each(|(x, w)| *x += step * w);
                w.iter_mut().zip(&v).for_each(|(w, v)| *w = v - shrink * *w);
                self.state = State::Lsqr { u, v, w, alpha: alpha_next, phi_bar, rho_bar };
            }
            other => self.state = other,
        }
    }

    /// Stochastic PDHG over the subsets. PDHG takes the primal step first and
    /// updates the dual of the subset at the new estimate; PDDY updates the
    /// dual at the current estimate and then takes a projected primal step
    /// with the prior gradient evaluated at the projection.
    fn primal_dual_step(&mut self, m: usize, d: &SubsetData) -> Result<Vec<f32>> {
        let (term, theta) = match &self.settings.algorithm {
            Algorithm::Pdhg(pd) | Algorithm::Pddy(pd) => (DataTerm::LeastSquares, pd.theta),
            Algorithm::PdhgL1(pd) => (DataTerm::L1, pd.theta),
            Algorithm::PdhgKl(pd) => (DataTerm::KullbackLeibler, pd.theta),
            other => return Err(config_error!("{} is not a primal-dual algorithm", other.name())),
        };
        let pddy = matches!(self.settings.algorithm, Algorithm::Pddy(_));
        let positive = positivity(&self.settings);
        let p = self.subsets.len() as f32;
        let k = self.sub_iteration;
        let State::PrimalDual { mut duals, mut z, mut z_bar, mut s, tau, sigma } = std::mem::replace(&mut self.state, State::Memoryless)
        else { return Err(state_mismatch(&self.settings.algorithm)) };

        let primal = |this: &Self, from: &[f32], z_bar: &[f32]| -> Result<Vec<f32>> {
            let prior = this.prior_gradient(from)?;
            Ok(from.iter().enumerate()
               .map(|(j, x)| x - tau[j] * (z_bar[j] + prior.as_ref().map_or(0.0, |g| g[j])))
               .collect())
        };

        if !pddy {
            let mut next = primal(self, &self.image.data, &z_bar)?;
            if positive { clamp_nonnegative(&mut next) }
            self.image.data = next;
        }

        let expected = self.expected(&self.image.data, d);
        let dual = &mut duals[m];
        let mut delta: Vec<f32> = dual.iter().zip(&expected).zip(&d.y).zip(&sigma[m])
            .map(|(((&q, &e), &y), &sigma)| term.dual_prox(q + sigma * e, y, sigma) - q)
            .collect();
        dual.iter_mut().zip(&delta).for_each(|(q, dq)| *q += dq);
        let rows = self.problem.measurements.shape().map_or(1, |s| s.rows);
        self.settings.preconditioners.filter_measurements(k, &mut delta, rows);
        let dz = self.back(&delta, d);
        for j in 0..z.len() {
            z[j] += dz[j];
            z_bar[j] = z[j] + theta * p * dz[j];
        }

        if pddy {
            s = primal(self, &self.image.data, &z_bar)?;
            let mut next = s.clone();
            if positive { clamp_nonnegative(&mut next) }
            self.image.data = next;
        }
        self.state = State::PrimalDual { duals, z, z_bar, s, tau, sigma };
        Ok(expected)
    }
}

fn positivity(settings: &Settings) -> bool {
    settings.enforce_positivity && settings.algorithm.supports_positivity()
}

fn data_minus_additive(d: &SubsetData) -> Vec<f32> {
    d.y.iter().zip(&d.model.additive).map(|(y, a)| y - a).collect()
}

fn norm_squared(x: &[f32]) -> f64 { x.iter().map(|&v| (v as f64).powi(2)).sum() }

/// Scale `x` to unit length, returning its original length
fn normalize(x: &mut [f32]) -> f64 {
    let n = norm_squared(x).sqrt();
    if n > 0.0 { x.iter_mut().for_each(|v| *v = (*v as f64 / n) as f32) }
    n
}

fn state_mismatch(algorithm: &Algorithm) -> crate::error::Error {
    config_error!("solver state was not prepared for {}", algorithm.name())
}

/// Reject every inconsistency between settings and problem
fn validate(settings: &Settings, problem: &Problem) -> Result<()> {
    let algorithm = &settings.algorithm;
    let name = algorithm.name();
    algorithm.validate()?;
    if settings.iterations == 0 { return Err(config_error!("number of iterations must be positive")) }
    if settings.subsets == 0 { return Err(config_error!("number of subsets must be positive")) }
    if settings.subsets > problem.measurements.len() {
        return Err(config_error!("{} subsets for {} measurements", settings.subsets, problem.measurements.len()))
    }
    if algorithm.requires_single_subset() && settings.subsets != 1 {
        return Err(config_error!("{name} needs a single subset, got {}", settings.subsets))
    }
    if !(settings.eps > 0.0) { return Err(config_error!("epsilon must be positive, got {}", settings.eps)) }
    settings.relaxation.validate(settings.iterations)?;

    let layout = problem.projector.layout();
    if problem.initial.layout() != layout {
        return Err(config_error!("initial image of {} voxels does not match the projector's {} voxels",
                                 problem.initial.len(), layout.len()))
    }
    settings.preconditioners.validate(layout.len())?;
    if let Some(prior) = &problem.prior {
        if !algorithm.supports_prior() {
            return Err(config_error!("{name} cannot be combined with the {} prior", prior.kind.name()))
        }
        prior.validate(layout)?;
    }

    let precond = &settings.preconditioners;
    if !precond.image.is_empty() && !matches!(algorithm.family(), Family::Gradient | Family::PrimalDual) {
        return Err(config_error!("image-based preconditioners do not apply to {name}"))
    }
    if algorithm.family() == Family::PrimalDual && precond.image.iter().any(|p| !matches!(p,
        ImagePreconditioner::Diagonal | ImagePreconditioner::Em | ImagePreconditioner::Iem { .. })) {
        return Err(config_error!("{name} accepts only diagonal, EM and IEM image preconditioners"))
    }
    if !precond.measurement.is_empty() && !matches!(algorithm.family(), Family::Gradient | Family::PrimalDual) {
        return Err(config_error!("measurement-based preconditioners do not apply to {name}"))
    }
    if precond.has_measurement_diagonal() && algorithm.family() != Family::PrimalDual {
        return Err(config_error!("the diagonal measurement preconditioner applies only to primal-dual algorithms"))
    }
    if precond.filters_measurements() {
        let whole_rows = settings.subsets == 1 || matches!(settings.subset_policy,
            SubsetPolicy::Planes | SubsetPolicy::RandomPlanes | SubsetPolicy::PrimePlanes);
        if problem.measurements.shape().is_none() || !whole_rows {
            return Err(config_error!("measurement filtering needs sinogram data split into whole planes"))
        }
    }

    problem.measurements.validate(&problem.scanner)?;
    problem.corrections.validate(problem.measurements.len())?;
    let (data_bins, tof_bins) = (problem.measurements.tof_bins(), problem.projector.tof().bins().max(1));
    if data_bins != tof_bins {
        return Err(config_error!("data have {data_bins} TOF bin(s), projector expects {tof_bins}"))
    }
    Ok(())
}
