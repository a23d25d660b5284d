//! Largest eigenvalue of `KᵀK` by power iteration, used to choose the
//! primal step size of the primal-dual algorithms.

use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Uniform};

/// Estimate `‖K‖²`, given `normal` applying `KᵀK` to an image of `n` voxels.
pub fn operator_norm_squared(normal: impl Fn(&[f32]) -> Vec<f32>, n: usize, iterations: usize, seed: u64) -> f32 {
    let mut rng = StdRng::seed_from_u64(seed);
    let uniform = Uniform::new(0.5_f32, 1.5);
    let mut x: Vec<f32> = (0..n).map(|_| uniform.sample(&mut rng)).collect();
    normalize(&mut x);
    let mut estimate = 0.0;
    for i in 0..iterations.max(1) {
        let mut y = normal(&x);
        estimate = norm(&y);
        if estimate == 0.0 { break }
        normalize(&mut y);
        x = y;
        log::debug!("power method {}: {estimate:.4e}", i + 1);
    }
    estimate
}

fn norm(x: &[f32]) -> f32 { x.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt() as f32 }

fn normalize(x: &mut [f32]) {
    let n = norm(x);
    if n > 0.0 { x.iter_mut().for_each(|v| *v /= n) }
}
