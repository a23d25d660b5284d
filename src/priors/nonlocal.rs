//! Non-local priors: neighbours are searched in a window around each voxel
//! and weighted by how similar the patch around them is to the patch around
//! the voxel itself,
//!
//! ```text
//! w_jk = exp(−Σ_p g_p (u_{j+p} − u_{k+p})² / h²)
//! ```
//!
//! with `g` a normalized Gaussian over the patch, and `u` either the image
//! being reconstructed or an anatomical reference.

use rayon::prelude::*;
use serde::Deserialize;

use crate::index::{BoxDim_u, Index3_u, Offset3, clamped_neighbour, index1_to_3, index3_to_1};

use super::potential::Potential;

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NlVariant {
    /// Quadratic differences: NLM
    #[default]
    Means,
    /// NLTV
    Tv,
    /// Median-root style, with the non-local mean as reference
    Mrp,
    /// NLRD
    RelativeDifference { gamma: f32 },
    /// NLGGMRF
    Ggmrf { p: f32, q: f32, c: f32 },
}

impl NlVariant {
    fn potential(&self) -> Option<Potential> {
        match *self {
            NlVariant::Means => Some(Potential::Quadratic),
            NlVariant::RelativeDifference { gamma } => Some(Potential::RelativeDifference { gamma }),
            NlVariant::Ggmrf { p, q, c } => Some(Potential::Ggmrf { p, q, c }),
            NlVariant::Tv | NlVariant::Mrp => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NonLocal {
    pub variant: NlVariant,
    /// Half-size of the search window
    pub search: [usize; 3],
    /// Half-size of the similarity patch
    pub patch: [usize; 3],
    /// Filter strength
    pub h: f32,
    pub patch_sigma: f32,
    /// Compute similarities on the reference image rather than on the estimate
    pub anatomical: bool,
    /// NLTV smoothing, and the guard in the denominators of Mrp and RDP
    pub eps: f32,
}

fn window(radius: [usize; 3]) -> impl Iterator<Item = Offset3> {
    let r = radius.map(|r| r as isize);
    itertools::iproduct!(-r[2]..=r[2], -r[1]..=r[1], -r[0]..=r[0]).map(|(z, y, x)| [x, y, z])
}

impl NonLocal {

    fn patch_weights(&self) -> Vec<(Offset3, f32)> {
        let two_s2 = 2.0 * self.patch_sigma * self.patch_sigma;
        let raw: Vec<(Offset3, f32)> = window(self.patch)
            .map(|o| (o, (-(o.iter().map(|&c| (c * c) as f32).sum::<f32>()) / two_s2).exp()))
            .collect();
        let total: f32 = raw.iter().map(|(_, g)| g).sum();
        raw.into_iter().map(|(o, g)| (o, g / total)).collect()
    }

    /// Similarity weights of every neighbour in the search window of `j`
    fn similarities(&self, u: &[f32], n: BoxDim_u, j3: Index3_u, patch: &[(Offset3, f32)], out: &mut Vec<(usize, f32)>) {
        out.clear();
        let h2 = self.h * self.h;
        let at = |i3: Index3_u, o: Offset3| u[index3_to_1(clamped_neighbour(i3, o, n), n)];
        for offset in window(self.search).filter(|&o| o != [0, 0, 0]) {
            let k3 = clamped_neighbour(j3, offset, n);
            let distance: f32 = patch.iter()
                .map(|&(p, g)| { let d = at(j3, p) - at(k3, p); g * d * d })
                .sum();
            out.push((index3_to_1(k3, n), (-distance / h2).exp()));
        }
    }

    pub fn gradient(&self, x: &[f32], n: BoxDim_u, reference: Option<&[f32]>, normalize: bool) -> Vec<f32> {
        let u = reference.filter(|_| self.anatomical).unwrap_or(x);
        let patch = self.patch_weights();
        let potential = self.variant.potential();
        (0..x.len()).into_par_iter().map_init(Vec::new, |weights: &mut Vec<(usize, f32)>, j| {
            self.similarities(u, n, index1_to_3(j, n), &patch, weights);
            let xj = x[j];
            match self.variant {
                NlVariant::Tv => {
                    let norm = (weights.iter().map(|&(k, w)| w * (xj - x[k]).powi(2)).sum::<f32>() + self.eps * self.eps).sqrt();
                    weights.iter().map(|&(k, w)| w * (xj - x[k])).sum::<f32>() / norm
                }
                NlVariant::Mrp => {
                    let total: f32 = weights.iter().map(|(_, w)| w).sum();
                    let m = weights.iter().map(|&(k, w)| w * x[k]).sum::<f32>() / total.max(f32::MIN_POSITIVE);
                    if normalize { (xj - m) / (m + self.eps) } else { xj - m }
                }
                _ => {
                    let potential = potential.unwrap_or(Potential::Quadratic);
                    weights.iter().map(|&(k, w)| w * potential.derivative(xj, x[k], self.eps)).sum()
                }
            }
        }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    fn prior(variant: NlVariant) -> NonLocal {
        NonLocal { variant, search: [1, 1, 1], patch: [1, 1, 1], h: 1.0, patch_sigma: 1.0, anatomical: false, eps: 1e-3 }
    }

    #[test]
    fn patch_weights_are_normalized() {
        let p = prior(NlVariant::Means).patch_weights();
        assert_eq!(p.len(), 27);
        assert_float_eq!(p.iter().map(|(_, g)| g).sum::<f32>(), 1.0, abs <= 1e-6);
    }

    #[rstest(/**/ variant,
             case(NlVariant::Means),
             case(NlVariant::Tv),
             case(NlVariant::Mrp),
             case(NlVariant::RelativeDifference { gamma: 2.0 }),
             case(NlVariant::Ggmrf { p: 1.5, q: 1.0, c: 2.0 }),
    )]
    fn flat_images_are_stationary(variant: NlVariant) {
        let x = vec![2.0; 27];
        let g = prior(variant).gradient(&x, [3, 3, 3], None, true);
        assert!(g.iter().all(|v| v.abs() < 1e-5), "{variant:?}: {g:?}");
    }

    #[rstest(/**/ variant,
             case(NlVariant::Means),
             case(NlVariant::Tv),
             case(NlVariant::Mrp),
             case(NlVariant::RelativeDifference { gamma: 2.0 }),
    )]
    fn spikes_are_pushed_down(variant: NlVariant) {
        let mut x = vec![1.0; 27];
        x[13] = 3.0;
        let g = prior(variant).gradient(&x, [3, 3, 3], None, true);
        assert!(g[13] > 0.0);
    }

    #[test]
    fn anatomical_edges_decouple_neighbours() {
        let n = [4, 1, 1];
        let x = [1.0, 1.0, 2.0, 2.0];
        let edge = [0.0, 0.0, 10.0, 10.0];
        let mut p = prior(NlVariant::Means);
        p.search = [1, 0, 0];
        p.patch = [0, 0, 0];
        let free = p.gradient(&x, n, Some(&edge), true);
        p.anatomical = true;
        let guided = p.gradient(&x, n, Some(&edge), true);
        // Across the reference edge the similarity is exp(-100)
        assert!(free[1].abs() > 0.1);
        assert!(guided[1].abs() < 1e-6);
    }
}
