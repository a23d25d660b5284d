//! Preconditioners of the gradient-type and primal-dual algorithms.
//!
//! Image-based preconditioners shape the update direction in image space:
//! one of them (diagonal, EM, IEM or curvature) provides the diagonal
//! scaling, and the others (momentum, gradient-based, filtering) modify the
//! scaled direction. Measurement-based ones scale or filter the data-space
//! residuals.

use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use serde::Deserialize;

use crate::config_error;
use crate::error::Result;
use crate::image::VolumeLayout;
use crate::priors::variation::forward_differences;

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    #[default]
    None,
    Hamming,
    Hann,
    Cosine,
    Gaussian { sigma: f32 },
}

impl Window {
    /// Value at normalized frequency `f` in cycles per sample, `0 <= f <= 1/2`
    pub fn at(&self, f: f32) -> f32 {
        use std::f32::consts::PI;
        let w = match *self {
            Window::None => 1.0,
            Window::Hamming => 0.54 + 0.46 * (2.0 * PI * f).cos(),
            Window::Hann => 0.5 + 0.5 * (2.0 * PI * f).cos(),
            Window::Cosine => (PI * f).cos(),
            Window::Gaussian { sigma } => (-f * f / (2.0 * sigma * sigma)).exp(),
        };
        w.max(0.0)
    }

    /// The windowed ramp, scaled to 1 at the Nyquist frequency of an
    /// unwindowed ramp. The zero frequency keeps the weight of the lowest
    /// non-zero one, `1/len`.
    fn ramp(&self, f: f32, len: usize) -> f32 {
        2.0 * f.max(1.0 / len as f32) * self.at(f.min(0.5))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ImagePreconditioner {
    /// 1 / Aᵀ1
    Diagonal,
    /// x / Aᵀ1
    Em,
    /// max(floor, x̂, x) / Aᵀ1, with an estimate x̂ of the final image
    Iem { reference: Vec<f32>, floor: f32 },
    /// Scales the step by 1 + ρk/(k + δ)
    Momentum { rho: f32, delta: f32 },
    /// Shrinks the step where the estimate has steep gradients, during
    /// sub-iterations `first..=last` (one-based)
    Gradient { v1: f32, v2: f32, first: usize, last: usize },
    /// Windowed ramp filter in each transaxial slice, for the first
    /// `iterations` sub-iterations
    Filtering { window: Window, iterations: usize },
    /// 1 / Aᵀ((y/ȳ²)·A1)
    Curvature,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MeasurementPreconditioner {
    /// 1 / A1
    Diagonal,
    /// Windowed ramp filter along the radial axis of the sinogram, for the
    /// first `iterations` sub-iterations
    Filtering { window: Window, iterations: usize },
}

/// Diagonal scaling used when no scaling preconditioner is configured
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Base { Identity, Diagonal, Em }

/// What the image preconditioners look at
pub struct StepContext<'a> {
    pub x: &'a [f32],
    /// Sensitivity of the full data
    pub sensitivity: &'a [f32],
    pub curvature: Option<&'a [f32]>,
    /// Zero-based count of sub-iterations done so far
    pub sub_iteration: usize,
    pub layout: &'a VolumeLayout,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preconditioners {
    pub image: Vec<ImagePreconditioner>,
    pub measurement: Vec<MeasurementPreconditioner>,
}

impl Preconditioners {

    pub fn validate(&self, image_len: usize) -> Result<()> {
        for p in &self.image {
            match p {
                ImagePreconditioner::Iem { reference, .. } if reference.len() != image_len =>
                    return Err(config_error!("IEM reference image has {} voxels, image has {image_len}", reference.len())),
                ImagePreconditioner::Gradient { first, last, .. } if first > last =>
                    return Err(config_error!("gradient-based preconditioner: first sub-iteration {first} after last {last}")),
                ImagePreconditioner::Momentum { delta, .. } if *delta <= 0.0 =>
                    return Err(config_error!("momentum preconditioner needs positive delta, got {delta}")),
                _ => (),
            }
        }
        Ok(())
    }

    pub fn needs_curvature(&self) -> bool { self.image.contains(&ImagePreconditioner::Curvature) }

    pub fn filters_measurements(&self) -> bool {
        self.measurement.iter().any(|m| matches!(m, MeasurementPreconditioner::Filtering { .. }))
    }

    pub fn has_measurement_diagonal(&self) -> bool { self.measurement.contains(&MeasurementPreconditioner::Diagonal) }

    pub fn has_image_scaling(&self) -> bool {
        self.image.iter().any(|p| matches!(p,
            ImagePreconditioner::Diagonal | ImagePreconditioner::Em | ImagePreconditioner::Iem { .. } | ImagePreconditioner::Curvature))
    }

    /// The diagonal scaling of the update direction
    pub fn scaling(&self, ctx: &StepContext, default: Base, eps: f32) -> Vec<f32> {
        let chosen = self.image.iter().rev().find(|p| matches!(p,
            ImagePreconditioner::Diagonal | ImagePreconditioner::Em | ImagePreconditioner::Iem { .. } | ImagePreconditioner::Curvature));
        let inverse = |s: f32| if s > eps { 1.0 / s } else { 0.0 };
        let s = ctx.sensitivity;
        match chosen {
            Some(ImagePreconditioner::Diagonal) => s.iter().map(|&s| inverse(s)).collect(),
            Some(ImagePreconditioner::Em) => ctx.x.iter().zip(s).map(|(x, &s)| x * inverse(s)).collect(),
            Some(ImagePreconditioner::Iem { reference, floor }) => ctx.x.iter().zip(reference).zip(s)
                .map(|((&x, &r), &s)| x.max(r).max(*floor) * inverse(s))
                .collect(),
            Some(ImagePreconditioner::Curvature) => match ctx.curvature {
                Some(c) => c.iter().map(|&c| inverse(c)).collect(),
                None => s.iter().map(|&s| inverse(s)).collect(),
            },
            _ => match default {
                Base::Identity => vec![1.0; ctx.x.len()],
                Base::Diagonal => s.iter().map(|&s| inverse(s)).collect(),
                Base::Em => ctx.x.iter().zip(s).map(|(x, &s)| x * inverse(s)).collect(),
            },
        }
    }

    /// Apply the non-diagonal image preconditioners to a scaled direction
    pub fn modify(&self, ctx: &StepContext, direction: &mut [f32]) {
        let k = ctx.sub_iteration;
        for p in &self.image {
            match p {
                ImagePreconditioner::Momentum { rho, delta } => {
                    let alpha = 1.0 + rho * k as f32 / (k as f32 + delta);
                    direction.iter_mut().for_each(|d| *d *= alpha);
                }
                ImagePreconditioner::Gradient { v1, v2, first, last } if (*first..=*last).contains(&(k + 1)) => {
                    let factors = gradient_factors(ctx.x, ctx.layout, *v1, *v2);
                    direction.iter_mut().zip(factors).for_each(|(d, f)| *d *= f);
                }
                ImagePreconditioner::Filtering { window, iterations } if k < *iterations => {
                    filter_slices(direction, ctx.layout, *window);
                }
                _ => (),
            }
        }
    }

    /// Per-measurement dual step scaling, from the forward projection of a
    /// uniform image
    pub fn dual_scaling(&self, forward_ones: &[f32], eps: f32) -> Option<Vec<f32>> {
        self.has_measurement_diagonal()
            .then(|| forward_ones.iter().map(|&a| if a > eps { 1.0 / a } else { 0.0 }).collect())
    }

    /// Filter data-space values made of consecutive runs of `rows` radial bins
    pub fn filter_measurements(&self, sub_iteration: usize, values: &mut [f32], rows: usize) {
        for p in &self.measurement {
            if let MeasurementPreconditioner::Filtering { window, iterations } = p {
                if sub_iteration < *iterations && rows > 1 {
                    filter_runs(values, rows, *window);
                }
            }
        }
    }
}

/// 1 / (1 + v1 γ^v2), with γ the gradient magnitude relative to its maximum
fn gradient_factors(x: &[f32], layout: &VolumeLayout, v1: f32, v2: f32) -> Vec<f32> {
    let mut magnitude = vec![0.0; x.len()];
    for region in layout.regions() {
        let g = forward_differences(&x[region.range()], region.fov.n);
        for (m, g) in magnitude[region.range()].iter_mut().zip(g) {
            *m = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();
        }
    }
    let max = magnitude.iter().copied().fold(0.0, f32::max);
    if max == 0.0 { return vec![1.0; x.len()] }
    magnitude.into_iter().map(|m| 1.0 / (1.0 + v1 * (m / max).powf(v2))).collect()
}

/// Forward and inverse transforms of one length
struct Transform {
    len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Transform {
    fn new(planner: &mut FftPlanner<f32>, n: usize) -> Self {
        Self { len: n, forward: planner.plan_fft_forward(n), inverse: planner.plan_fft_inverse(n) }
    }

    /// Transform every column of a row-major grid with rows of `width`
    fn columns(&self, grid: &mut [Complex<f32>], width: usize, inverse: bool) {
        let fft = if inverse { &self.inverse } else { &self.forward };
        let mut column = vec![Complex::new(0.0, 0.0); self.len];
        for x in 0..width {
            for (y, c) in column.iter_mut().enumerate() { *c = grid[x + y * width] }
            fft.process(&mut column);
            for (y, c) in column.iter().enumerate() { grid[x + y * width] = *c }
        }
    }
}

fn frequency(k: usize, n: usize) -> f32 { k.min(n - k) as f32 / n as f32 }

/// Ramp-filter consecutive runs of `len` values, each zero-padded to twice
/// its length
fn filter_runs(values: &mut [f32], len: usize, window: Window) {
    if len == 0 { return }
    let n = 2 * len;
    let fft = Transform::new(&mut FftPlanner::new(), n);
    let ramp: Vec<f32> = (0..n).map(|k| window.ramp(frequency(k, n), n)).collect();
    let mut buffer = vec![Complex::new(0.0, 0.0); n];
    for run in values.chunks_mut(len) {
        for (i, b) in buffer.iter_mut().enumerate() { *b = Complex::new(run.get(i).copied().unwrap_or(0.0), 0.0) }
        fft.forward.process(&mut buffer);
        for (b, &r) in buffer.iter_mut().zip(&ramp) { *b *= r }
        fft.inverse.process(&mut buffer);
        for (v, b) in run.iter_mut().zip(&buffer) { *v = b.re / n as f32 }
    }
}

/// Ramp-filter every transaxial slice of the native region
fn filter_slices(data: &mut [f32], layout: &VolumeLayout, window: Window) {
    let region = layout.inner();
    let [nx, ny, nz] = region.fov.n;
    if nx == 0 || ny == 0 { return }
    let (px, py) = (2 * nx, 2 * ny);
    let mut planner = FftPlanner::new();
    let (rows, cols) = (Transform::new(&mut planner, px), Transform::new(&mut planner, py));
    let ramp: Vec<f32> = (0..px * py)
        .map(|i| window.ramp(frequency(i % px, px).hypot(frequency(i / px, py)), px.max(py)))
        .collect();
    let scale = (px * py) as f32;
    let inner = &mut data[region.range()];
    let mut grid = vec![Complex::new(0.0, 0.0); px * py];
    for slice in inner.chunks_mut(nx * ny).take(nz) {
        grid.iter_mut().for_each(|g| *g = Complex::new(0.0, 0.0));
        for y in 0..ny { for x in 0..nx { grid[x + y * px].re = slice[x + y * nx] } }
        rows.forward.process(&mut grid);
        cols.columns(&mut grid, px, false);
        for (g, &r) in grid.iter_mut().zip(&ramp) { *g *= r }
        rows.inverse.process(&mut grid);
        cols.columns(&mut grid, px, true);
        for y in 0..ny { for x in 0..nx { slice[x + y * nx] = grid[x + y * px].re / scale } }
    }
}
