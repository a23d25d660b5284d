//! Priors on the image gradient: total variation and its weighted and Lange
//! forms, asymmetric parallel level sets, and total generalized variation.
//!
//! The gradient is taken with forward differences, zero across the upper
//! faces of the box. Every penalty here has the form Σ_i φ(∇x_i), so its
//! gradient with respect to `x` is `Dᵀ q`, with `q_i = ∂φ/∂(∇x_i)` and `Dᵀ`
//! the adjoint of the forward difference operator.

use serde::Deserialize;

use crate::index::{BoxDim_u, index1_to_3};

type Vec3 = [f32; 3];

/// Forward differences of `x` along each axis
pub fn forward_differences(x: &[f32], n: BoxDim_u) -> Vec<Vec3> {
    let strides = [1, n[0], n[0] * n[1]];
    (0..x.len()).map(|j| {
        let i = index1_to_3(j, n);
        [0, 1, 2].map(|d| if i[d] + 1 < n[d] { x[j + strides[d]] - x[j] } else { 0.0 })
    }).collect()
}

/// Adjoint of `forward_differences`, applied to the vector field `q`
pub fn adjoint_differences(q: &[Vec3], n: BoxDim_u) -> Vec<f32> {
    let strides = [1, n[0], n[0] * n[1]];
    (0..q.len()).map(|j| {
        let i = index1_to_3(j, n);
        (0..3).map(|d| {
            let from_below = if i[d] > 0         { q[j - strides[d]][d] } else { 0.0 };
            let own        = if i[d] + 1 < n[d] { q[j][d]               } else { 0.0 };
            from_below - own
        }).sum()
    }).collect()
}

fn dot(a: Vec3, b: Vec3) -> f32 { a[0] * b[0] + a[1] * b[1] + a[2] * b[2] }
fn norm2(a: Vec3) -> f32 { dot(a, a) }
fn scale(a: Vec3, s: f32) -> Vec3 { a.map(|c| c * s) }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TvType {
    /// √(|∇x|² + ε²)
    #[default]
    Smoothed,
    /// Smoothed TV, damped where the reference image has edges
    Weighted,
    /// Lange's function of the smoothed gradient magnitude
    Lange,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TotalVariation {
    pub tv: TvType,
    /// ε
    pub smoothing: f32,
    /// Edge scale of the reference image (Weighted) or of the Lange function
    pub t: f32,
    /// Strength of the reference image weighting
    pub c: f32,
}

impl TotalVariation {

    pub fn needs_reference(&self) -> bool { self.tv == TvType::Weighted }

    fn reference_weights(&self, reference: Option<&[f32]>, n: BoxDim_u) -> Option<Vec<f32>> {
        let reference = reference.filter(|_| self.needs_reference())?;
        Some(forward_differences(reference, n).into_iter()
             .map(|g| 1.0 / (1.0 + self.c * norm2(g) / (self.t * self.t)).sqrt())
             .collect())
    }

    pub fn gradient(&self, x: &[f32], n: BoxDim_u, reference: Option<&[f32]>) -> Vec<f32> {
        let eps2 = self.smoothing * self.smoothing;
        let weights = self.reference_weights(reference, n);
        let q: Vec<Vec3> = forward_differences(x, n).into_iter().enumerate().map(|(i, g)| {
            let r = (norm2(g) + eps2).sqrt();
            let kappa = match self.tv {
                TvType::Smoothed => 1.0 / r,
                TvType::Weighted => weights.as_ref().map_or(1.0, |w| w[i]) / r,
                TvType::Lange    => 1.0 / (1.0 + r / self.t),
            };
            scale(g, kappa)
        }).collect();
        adjoint_differences(&q, n)
    }

    pub fn penalty(&self, x: &[f32], n: BoxDim_u, reference: Option<&[f32]>) -> f64 {
        let eps2 = self.smoothing * self.smoothing;
        let weights = self.reference_weights(reference, n);
        forward_differences(x, n).into_iter().enumerate().map(|(i, g)| {
            let r = (norm2(g) + eps2).sqrt();
            (match self.tv {
                TvType::Smoothed => r,
                TvType::Weighted => weights.as_ref().map_or(1.0, |w| w[i]) * r,
                TvType::Lange    => self.t * self.t * (r / self.t - (1.0 + r / self.t).ln()),
            }) as f64
        }).sum()
    }
}

/// Asymmetric parallel level sets: penalizes the part of the image gradient
/// which is not parallel to the gradient of a reference image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Apls {
    /// Smoothing of the reference gradient direction
    pub eta: f32,
    /// ε
    pub smoothing: f32,
}

impl Apls {

    fn directions(&self, reference: &[f32], n: BoxDim_u) -> Vec<Vec3> {
        forward_differences(reference, n).into_iter()
            .map(|g| scale(g, 1.0 / (norm2(g) + self.eta * self.eta).sqrt()))
            .collect()
    }

    pub fn gradient(&self, x: &[f32], n: BoxDim_u, reference: &[f32]) -> Vec<f32> {
        let eps2 = self.smoothing * self.smoothing;
        let xi = self.directions(reference, n);
        let q: Vec<Vec3> = forward_differences(x, n).into_iter().zip(xi).map(|(g, xi)| {
            let along = dot(g, xi);
            let phi = (eps2 + norm2(g) - along * along).max(eps2).sqrt();
            [0, 1, 2].map(|d| (g[d] - along * xi[d]) / phi)
        }).collect();
        adjoint_differences(&q, n)
    }

    pub fn penalty(&self, x: &[f32], n: BoxDim_u, reference: &[f32]) -> f64 {
        let eps2 = self.smoothing * self.smoothing;
        let xi = self.directions(reference, n);
        forward_differences(x, n).into_iter().zip(xi).map(|(g, xi)| {
            let along = dot(g, xi);
            (eps2 + norm2(g) - along * along).max(eps2).sqrt() as f64
        }).sum()
    }
}

/// Total generalized variation of second order:
///
/// ```text
/// min_v  α₁ Σ |∇x − v|_ε + α₀ Σ |E v|_ε
/// ```
///
/// with `E` the symmetrized gradient. The inner minimization over the vector
/// field `v` is done approximately, by a fixed number of gradient steps
/// starting from `v = ∇x`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tgv {
    pub alpha0: f32,
    pub alpha1: f32,
    pub smoothing: f32,
    pub iterations: usize,
}

/// Symmetric 3×3 tensor stored as xx, yy, zz, xy, xz, yz
type Sym = [f32; 6];
const PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (0, 1), (0, 2), (1, 2)];

impl Tgv {

    fn symmetrized_gradient(v: &[Vec3], n: BoxDim_u) -> Vec<Sym> {
        // derivative[a][b] = D_a v_b
        let components: Vec<Vec<Vec3>> = (0..3)
            .map(|b| forward_differences(&v.iter().map(|c| c[b]).collect::<Vec<_>>(), n))
            .collect();
        (0..v.len()).map(|i| PAIRS.map(|(a, b)| 0.5 * (components[b][i][a] + components[a][i][b]))).collect()
    }

    /// ∂/∂v of Σ |E v|_ε, given p = E v / |E v|_ε
    fn symmetrized_adjoint(p: &[Sym], n: BoxDim_u) -> Vec<Vec3> {
        let full = |s: &Sym, a: usize, b: usize| {
            let k = PAIRS.iter().position(|&(i, j)| (i, j) == (a.min(b), a.max(b))).unwrap_or(0);
            s[k]
        };
        let per_b: Vec<Vec<f32>> = (0..3).map(|b| {
            let field: Vec<Vec3> = p.iter().map(|s| [0, 1, 2].map(|a| full(s, a, b))).collect();
            adjoint_differences(&field, n)
        }).collect();
        (0..p.len()).map(|i| [per_b[0][i], per_b[1][i], per_b[2][i]]).collect()
    }

    fn tensor_norm(e: &Sym, eps2: f32) -> f32 {
        let diagonal = e[0] * e[0] + e[1] * e[1] + e[2] * e[2];
        let off = e[3] * e[3] + e[4] * e[4] + e[5] * e[5];
        (diagonal + 2.0 * off + eps2).sqrt()
    }

    /// The image gradient and the approximately optimal `v`
    fn solve(&self, x: &[f32], n: BoxDim_u) -> (Vec<Vec3>, Vec<Vec3>) {
        let eps2 = self.smoothing * self.smoothing;
        let g = forward_differences(x, n);
        let mut v = g.clone();
        // Lipschitz bound of the smoothed objective in v
        let step = self.smoothing / (self.alpha1 + 12.0 * self.alpha0).max(f32::EPSILON);
        for _ in 0..self.iterations {
            let p1: Vec<Vec3> = g.iter().zip(&v).map(|(g, v)| {
                let r = [0, 1, 2].map(|d| g[d] - v[d]);
                scale(r, 1.0 / (norm2(r) + eps2).sqrt())
            }).collect();
            let p0: Vec<Sym> = Self::symmetrized_gradient(&v, n).into_iter()
                .map(|e| { let m = Self::tensor_norm(&e, eps2); e.map(|c| c / m) })
                .collect();
            let adj = Self::symmetrized_adjoint(&p0, n);
            for ((v, p1), adj) in v.iter_mut().zip(&p1).zip(&adj) {
                for d in 0..3 {
                    v[d] -= step * (-self.alpha1 * p1[d] + self.alpha0 * adj[d]);
                }
            }
        }
        (g, v)
    }

    pub fn gradient(&self, x: &[f32], n: BoxDim_u) -> Vec<f32> {
        let eps2 = self.smoothing * self.smoothing;
        let (g, v) = self.solve(x, n);
        let q: Vec<Vec3> = g.iter().zip(&v).map(|(g, v)| {
            let r = [0, 1, 2].map(|d| g[d] - v[d]);
            scale(r, self.alpha1 / (norm2(r) + eps2).sqrt())
        }).collect();
        adjoint_differences(&q, n)
    }

    pub fn penalty(&self, x: &[f32], n: BoxDim_u) -> f64 {
        let eps2 = self.smoothing * self.smoothing;
        let (g, v) = self.solve(x, n);
        let first: f64 = g.iter().zip(&v)
            .map(|(g, v)| (norm2([0, 1, 2].map(|d| g[d] - v[d])) + eps2).sqrt() as f64)
            .sum();
        let second: f64 = Self::symmetrized_gradient(&v, n).iter()
            .map(|e| Self::tensor_norm(e, eps2) as f64)
            .sum();
        self.alpha1 as f64 * first + self.alpha0 as f64 * second
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const N: BoxDim_u = [4, 3, 2];

    fn bumpy() -> Vec<f32> {
        (0..24).map(|i| 1.0 + ((i * 7) % 5) as f32 * 0.3).collect()
    }

    proptest! {
        #[test]
        fn differences_and_adjoint_are_adjoint(
            x in proptest::collection::vec(-5.0_f32..5.0, 24),
            q in proptest::collection::vec(-5.0_f32..5.0, 72),
        ) {
            let q: Vec<Vec3> = q.chunks(3).map(|c| [c[0], c[1], c[2]]).collect();
            let dx = forward_differences(&x, N);
            let lhs: f32 = dx.iter().zip(&q).map(|(a, b)| dot(*a, *b)).sum();
            let rhs: f32 = x.iter().zip(adjoint_differences(&q, N)).map(|(a, b)| a * b).sum();
            prop_assert!((lhs - rhs).abs() < 1e-3 * (1.0 + lhs.abs()));
        }
    }

    fn numeric_gradient(f: impl Fn(&[f32]) -> f64, x: &[f32]) -> Vec<f32> {
        let h = 1e-2;
        (0..x.len()).map(|j| {
            let mut up = x.to_vec(); up[j] += h;
            let mut dn = x.to_vec(); dn[j] -= h;
            ((f(&up) - f(&dn)) / (2.0 * h as f64)) as f32
        }).collect()
    }

    #[rstest(/**/ tv,
             case(TvType::Smoothed),
             case(TvType::Weighted),
             case(TvType::Lange),
    )]
    fn tv_gradient_is_exact(tv: TvType) {
        let x = bumpy();
        let reference: Vec<f32> = (0..24).map(|i| (i % 4) as f32).collect();
        let prior = TotalVariation { tv, smoothing: 0.1, t: 0.5, c: 1.0 };
        let analytic = prior.gradient(&x, N, Some(&reference));
        let numeric = numeric_gradient(|x| prior.penalty(x, N, Some(&reference)), &x);
        assert_float_eq!(analytic, numeric, abs_all <= 5e-3);
    }

    #[test]
    fn apls_gradient_is_exact() {
        let x = bumpy();
        let reference: Vec<f32> = (0..24).map(|i| ((i * 3) % 7) as f32).collect();
        let prior = Apls { eta: 0.5, smoothing: 0.1 };
        let analytic = prior.gradient(&x, N, &reference);
        let numeric = numeric_gradient(|x| prior.penalty(x, N, &reference), &x);
        assert_float_eq!(analytic, numeric, abs_all <= 5e-3);
    }

    #[test]
    fn apls_ignores_edges_parallel_to_reference() {
        // Image and reference vary along x only
        let ramp: Vec<f32> = (0..24).map(|i| (i % 4) as f32).collect();
        let prior = Apls { eta: 1e-3, smoothing: 1e-3 };
        let g = prior.gradient(&ramp, N, &ramp);
        assert!(g.iter().all(|v| v.abs() < 1e-2));
    }

    #[test]
    fn flat_images_have_no_gradient() {
        let flat = vec![3.0; 24];
        let tv = TotalVariation { tv: TvType::Smoothed, smoothing: 0.01, t: 1.0, c: 1.0 };
        assert!(tv.gradient(&flat, N, None).iter().all(|&v| v == 0.0));
        let tgv = Tgv { alpha0: 1.0, alpha1: 1.0, smoothing: 0.01, iterations: 5 };
        assert!(tgv.gradient(&flat, N).iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn tgv_does_not_penalize_ramps_as_much_as_tv() {
        let ramp: Vec<f32> = (0..24).map(|i| (i % 4) as f32).collect();
        let tgv = Tgv { alpha0: 1.0, alpha1: 1.0, smoothing: 0.01, iterations: 0 };
        let tv = TotalVariation { tv: TvType::Smoothed, smoothing: 0.01, t: 1.0, c: 1.0 };
        // Starting from v = ∇x, the first-order term vanishes and only the
        // (small) second-order edge terms remain
        assert!(tgv.penalty(&ramp, N) < tv.penalty(&ramp, N, None));
    }

    #[test]
    fn tgv_gradient_smooths_a_spike() {
        let mut x = vec![1.0; 24];
        x[5] = 4.0;
        let tgv = Tgv { alpha0: 1.0, alpha1: 1.0, smoothing: 0.05, iterations: 10 };
        let g = tgv.gradient(&x, N);
        assert!(g[5] > 0.0);
        assert_float_eq!(g.iter().sum::<f32>(), 0.0, abs <= 1e-3);
    }
}
