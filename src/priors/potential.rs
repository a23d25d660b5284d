//! Priors built from a potential on the difference between a voxel and each
//! of its neighbours.
//!
//! ```text
//! R(x) = ½ Σ_j Σ_k w_k ψ(x_j, x_k)
//! ```
//!
//! With a symmetric neighbourhood, the gradient is Σ_k w_k ψ'(x_j, x_k), where
//! ψ' is the derivative with respect to the first argument.

use rayon::prelude::*;

use crate::index::{BoxDim_u, clamped_neighbour, index1_to_3, index3_to_1};

use super::Neighbourhood;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Potential {
    /// ψ = D²/2
    Quadratic,
    /// Quadratic within `delta`, linear beyond
    Huber { delta: f32 },
    /// ψ = δ² (√(1 + (D/δ)²) − 1)
    Hyperbolic { delta: f32 },
    /// ψ = D² / (x_j + x_k + γ|D| + ε)
    RelativeDifference { gamma: f32 },
    /// ψ = |D|^p / (1 + |D/c|^(p−q))
    Ggmrf { p: f32, q: f32, c: f32 },
}

impl Potential {

    /// ψ'(x_j, x_k), derivative with respect to `xj`
    #[inline]
    pub fn derivative(&self, xj: f32, xk: f32, eps: f32) -> f32 {
        let d = xj - xk;
        match *self {
            Potential::Quadratic => d,
            Potential::Huber { delta } => d.clamp(-delta, delta),
            Potential::Hyperbolic { delta } => d / (1.0 + (d / delta).powi(2)).sqrt(),
            Potential::RelativeDifference { gamma } => {
                let s = xj + xk + gamma * d.abs() + eps;
                d * (gamma * d.abs() + xj + 3.0 * xk + 2.0 * eps) / (s * s)
            }
            Potential::Ggmrf { p, q, c } => {
                let a = d.abs();
                if a == 0.0 { return 0.0 }
                let r = (a / c).powf(p - q);
                d.signum() * a.powf(p - 1.0) * (p + q * r) / ((1.0 + r) * (1.0 + r))
            }
        }
    }

    /// ψ(x_j, x_k)
    #[inline]
    pub fn value(&self, xj: f32, xk: f32, eps: f32) -> f32 {
        let d = xj - xk;
        match *self {
            Potential::Quadratic => d * d / 2.0,
            Potential::Huber { delta } => {
                if d.abs() <= delta { d * d / 2.0 } else { delta * d.abs() - delta * delta / 2.0 }
            }
            Potential::Hyperbolic { delta } => delta * delta * ((1.0 + (d / delta).powi(2)).sqrt() - 1.0),
            Potential::RelativeDifference { gamma } => d * d / (xj + xk + gamma * d.abs() + eps),
            Potential::Ggmrf { p, q, c } => {
                let a = d.abs();
                a.powf(p) / (1.0 + (a / c).powf(p - q))
            }
        }
    }
}

/// Σ_k w_k ψ'(x_j, x_k) for every voxel of a box of size `n`. Neighbours
/// beyond the edges are replaced by the nearest voxel inside.
pub fn gradient(x: &[f32], n: BoxDim_u, neighbourhood: &Neighbourhood, potential: Potential, eps: f32, out: &mut [f32]) {
    out.par_iter_mut().enumerate().for_each(|(j, g)| {
        let i3 = index1_to_3(j, n);
        let xj = x[j];
        *g = neighbourhood.iter()
            .map(|(offset, w)| w * potential.derivative(xj, x[index3_to_1(clamped_neighbour(i3, offset, n), n)], eps))
            .sum();
    });
}

/// ½ Σ_j Σ_k w_k ψ(x_j, x_k)
pub fn penalty(x: &[f32], n: BoxDim_u, neighbourhood: &Neighbourhood, potential: Potential, eps: f32) -> f64 {
    let total: f64 = (0..x.len()).into_par_iter().map(|j| {
        let i3 = index1_to_3(j, n);
        neighbourhood.iter()
            .map(|(offset, w)| (w * potential.value(x[j], x[index3_to_1(clamped_neighbour(i3, offset, n), n)], eps)) as f64)
            .sum::<f64>()
    }).sum();
    total / 2.0
}
