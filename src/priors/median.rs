//! One-step-late priors of the median-root family: the image is compared
//! with a filtered version of itself, and the gradient is
//!
//! ```text
//! (x_j − m_j) / (m_j + ε)
//! ```
//!
//! or, when normalization is off, just `x_j − m_j`.

use rayon::prelude::*;
use serde::Deserialize;

use crate::index::{BoxDim_u, Offset3, clamped_neighbour, index1_to_3, index3_to_1};

use super::Neighbourhood;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeanType {
    #[default]
    Arithmetic,
    Harmonic,
    Geometric,
}

/// The filters from which the median-root family takes its reference
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Median,
    /// Weighted sum of the sorted neighbourhood values (centre included)
    LFilter { weights: Vec<f32> },
    /// FIR-median hybrid: median of the one-sided means along every line
    /// through the centre, and of `centre_weight` copies of the centre
    Fmh { taps: Vec<f32>, centre_weight: usize },
    /// Weighted mean of the neighbourhood, the centre with `centre_weight`
    WeightedMean { mean: MeanType, centre_weight: f32 },
}

/// `x` passed through `filter`, voxel by voxel, over a box of size `n`
pub fn filtered(x: &[f32], n: BoxDim_u, neighbourhood: &Neighbourhood, filter: &Filter, eps: f32) -> Vec<f32> {
    let lines = fmh_lines(neighbourhood.radius());
    (0..x.len()).into_par_iter().map_init(Vec::new, |values: &mut Vec<f32>, j| {
        let i3 = index1_to_3(j, n);
        let at = |offset: Offset3| x[index3_to_1(clamped_neighbour(i3, offset, n), n)];
        match filter {
            Filter::Median => {
                values.clear();
                values.push(x[j]);
                values.extend(neighbourhood.iter().map(|(o, _)| at(o)));
                median(values)
            }
            Filter::LFilter { weights } => {
                values.clear();
                values.push(x[j]);
                values.extend(neighbourhood.iter().map(|(o, _)| at(o)));
                values.sort_unstable_by(f32::total_cmp);
                values.iter().zip(weights).map(|(v, w)| v * w).sum()
            }
            Filter::Fmh { taps, centre_weight } => {
                values.clear();
                for &direction in &lines {
                    for sign in [1, -1] {
                        let (mut sum, mut norm) = (0.0, 0.0);
                        for (k, &w) in taps.iter().enumerate() {
                            let s = sign * (k as isize + 1);
                            sum += w * at(direction.map(|d| d * s));
                            norm += w;
                        }
                        if norm > 0.0 { values.push(sum / norm) }
                    }
                }
                values.extend(std::iter::repeat(x[j]).take(*centre_weight));
                median(values)
            }
            Filter::WeightedMean { mean, centre_weight } => {
                let cw = *centre_weight;
                let total: f32 = neighbourhood.iter().map(|(_, w)| w).sum::<f32>() + cw;
                let positive = |v: f32| v.max(eps);
                match mean {
                    MeanType::Arithmetic => {
                        (neighbourhood.iter().map(|(o, w)| w * at(o)).sum::<f32>() + cw * x[j]) / total
                    }
                    MeanType::Harmonic => {
                        total / (neighbourhood.iter().map(|(o, w)| w / positive(at(o))).sum::<f32>() + cw / positive(x[j]))
                    }
                    MeanType::Geometric => {
                        ((neighbourhood.iter().map(|(o, w)| w * positive(at(o)).ln()).sum::<f32>()
                          + cw * positive(x[j]).ln()) / total).exp()
                    }
                }
            }
        }
    }).collect()
}

/// The one-step-late gradient from the filtered image `m`
pub fn one_step_late(x: &[f32], m: &[f32], normalize: bool, eps: f32, out: &mut [f32]) {
    out.par_iter_mut().zip(x).zip(m).for_each(|((g, &xj), &mj)| {
        *g = if normalize { (xj - mj) / (mj + eps) } else { xj - mj };
    });
}

/// Default L-filter coefficients for `m` sorted values: a discrete Laplace
/// distribution peaked on the median, summing to one.
pub fn default_l_weights(m: usize) -> Vec<f32> {
    let centre = (m as f32 - 1.0) / 2.0;
    let scale = (m as f32 / 4.0).max(0.5);
    let raw: Vec<f32> = (0..m)
        .map(|i| (-std::f32::consts::SQRT_2 * (i as f32 - centre).abs() / scale).exp())
        .collect();
    let total: f32 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// One direction per line through the centre of a neighbourhood: offsets
/// with components in {-1, 0, 1}, only one of each opposite pair, restricted
/// to the axes the neighbourhood extends along.
fn fmh_lines(radius: [usize; 3]) -> Vec<Offset3> {
    let range = |r: usize| if r > 0 { -1..=1 } else { 0..=0 };
    itertools::iproduct!(range(radius[2]), range(radius[1]), range(radius[0]))
        .map(|(z, y, x)| [x, y, z])
        .filter(|&o| o != [0, 0, 0])
        // keep the one whose first non-zero component is positive
        .filter(|o| o.iter().find(|&&c| c != 0).is_some_and(|&c| c > 0))
        .collect()
}

fn median(values: &mut [f32]) -> f32 {
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    *m
}

/// Smoothing by anisotropic (Perona-Malik) diffusion, as used by AD-MRP
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnisotropicDiffusion {
    pub time_step: f32,
    /// Edge threshold
    pub k: f32,
    pub iterations: usize,
    pub flux: Flux,
    pub diffusion: DiffusionType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flux {
    /// exp(−(|∇|/K)²)
    #[default]
    Exponential,
    /// 1 / (1 + (|∇|/K)²)
    Quadratic,
}

/// Which neighbours exchange flux
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffusionType {
    /// The six face neighbours
    #[default]
    Faces,
    /// All 26 neighbours, weighted by inverse squared distance
    Full,
}

impl AnisotropicDiffusion {

    fn conductance(&self, gradient: f32) -> f32 {
        let r = (gradient / self.k).powi(2);
        match self.flux {
            Flux::Exponential => (-r).exp(),
            Flux::Quadratic => 1.0 / (1.0 + r),
        }
    }

    pub fn smooth(&self, x: &[f32], n: BoxDim_u) -> Vec<f32> {
        let offsets: Vec<(Offset3, f32)> = match self.diffusion {
            DiffusionType::Faces => [[1, 0, 0], [-1, 0, 0], [0, 1, 0], [0, -1, 0], [0, 0, 1], [0, 0, -1]]
                .into_iter().map(|o| (o, 1.0)).collect(),
            DiffusionType::Full => itertools::iproduct!(-1..=1_isize, -1..=1_isize, -1..=1_isize)
                .map(|(x, y, z)| [x, y, z])
                .filter(|&o| o != [0, 0, 0])
                .map(|o| (o, 1.0 / o.iter().map(|c| (c * c) as f32).sum::<f32>()))
                .collect(),
        };
        let mut current = x.to_vec();
        for _ in 0..self.iterations {
            current = (0..current.len()).into_par_iter().map(|j| {
                let i3 = index1_to_3(j, n);
                let flux: f32 = offsets.iter().map(|&(o, w)| {
                    let d = current[index3_to_1(clamped_neighbour(i3, o, n), n)] - current[j];
                    w * self.conductance(d.abs()) * d
                }).sum();
                current[j] + self.time_step * flux
            }).collect();
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    fn spike() -> (Vec<f32>, BoxDim_u) {
        let mut x = vec![1.0; 27];
        x[13] = 10.0;
        (x, [3, 3, 3])
    }

    fn neighbourhood() -> Neighbourhood { Neighbourhood::inverse_distance([1, 1, 1], [1.0, 1.0, 1.0]) }

    #[rstest(/**/ filter,
             case(Filter::Median),
             case(Filter::LFilter { weights: default_l_weights(27) }),
             case(Filter::Fmh { taps: vec![1.0], centre_weight: 1 }),
             case(Filter::WeightedMean { mean: MeanType::Harmonic, centre_weight: 1.0 }),
             case(Filter::WeightedMean { mean: MeanType::Geometric, centre_weight: 1.0 }),
    )]
    fn filters_remove_a_spike(filter: Filter) {
        let (x, n) = spike();
        let m = filtered(&x, n, &neighbourhood(), &filter, 1e-6);
        assert!(m[13] < 2.0, "{filter:?} left {}", m[13]);
    }

    #[test]
    fn arithmetic_mean_includes_centre() {
        let (x, n) = spike();
        let nb = neighbourhood();
        let m = filtered(&x, n, &nb, &Filter::WeightedMean { mean: MeanType::Arithmetic, centre_weight: 1.0 }, 1e-6);
        let total: f32 = nb.iter().map(|(_, w)| w).sum::<f32>() + 1.0;
        assert_float_eq!(m[13], (total - 1.0 + 10.0) / total, rmax <= 1e-5);
    }

    #[test]
    fn mrp_gradient_is_relative_excess() {
        let (x, n) = spike();
        let m = filtered(&x, n, &neighbourhood(), &Filter::Median, 0.0);
        let mut g = vec![0.0; 27];
        one_step_late(&x, &m, true, 0.0, &mut g);
        assert_float_eq!(g[13], 9.0, abs <= 1e-6);
        one_step_late(&x, &m, false, 0.0, &mut g);
        assert_float_eq!(g[13], 9.0, abs <= 1e-6);
        assert_eq!(g[0], 0.0);
    }

    #[test]
    fn l_weights_are_normalized_and_peaked() {
        let w = default_l_weights(9);
        assert_float_eq!(w.iter().sum::<f32>(), 1.0, abs <= 1e-6);
        assert!(w[4] > w[3] && w[3] > w[0]);
        assert_float_eq!(w[2], w[6], abs <= 1e-7);
    }

    #[test]
    fn thirteen_lines_in_three_dimensions() {
        assert_eq!(fmh_lines([1, 1, 1]).len(), 13);
        assert_eq!(fmh_lines([2, 2, 0]).len(), 4);
    }

    #[rstest(/**/ flux, diffusion,
             case(Flux::Exponential, DiffusionType::Faces),
             case(Flux::Quadratic  , DiffusionType::Full ),
    )]
    fn diffusion_preserves_total_and_smooths(flux: Flux, diffusion: DiffusionType) {
        let (x, n) = spike();
        let ad = AnisotropicDiffusion { time_step: 0.02, k: 20.0, iterations: 5, flux, diffusion };
        let smooth = ad.smooth(&x, n);
        assert_float_eq!(smooth.iter().sum::<f32>(), x.iter().sum::<f32>(), rmax <= 1e-5);
        assert!(smooth[13] < 10.0);
        assert!(smooth[4] > 1.0);
    }
}
