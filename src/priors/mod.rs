//! Regularization of the reconstruction by local (or non-local) penalties.
//!
//! Every prior maps an image to a per-voxel gradient, scaled by `beta`, which
//! the MAP algorithms combine with the data term. Neighbourhoods never reach
//! across regions of a multi-resolution volume: each region is regularized on
//! its own grid, with voxels beyond its edges replaced by the nearest voxel
//! inside.

pub mod median;
pub mod nonlocal;
pub mod potential;
pub mod variation;

use crate::{
    config_error,
    error::{Result, missing},
    image::{ImageData, ImageVolume, VolumeLayout},
    index::{BoxDim_u, Offset3},
};

use median::{AnisotropicDiffusion, Filter, MeanType};
use nonlocal::NonLocal;
use potential::Potential;
use variation::{Apls, Tgv, TotalVariation};

/// Guard added to denominators
pub const DEFAULT_EPS: f32 = 1e-6;

/// The offsets, and their weights, of the neighbours of a voxel. The centre
/// itself is never included.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbourhood {
    radius: [usize; 3],
    entries: Vec<(Offset3, f32)>,
}

fn window(radius: [usize; 3]) -> impl Iterator<Item = Offset3> {
    let r = radius.map(|r| r as isize);
    itertools::iproduct!(-r[2]..=r[2], -r[1]..=r[1], -r[0]..=r[0]).map(|(z, y, x)| [x, y, z])
}

impl Neighbourhood {

    /// Weights inversely proportional to the physical distance, with the
    /// nearest possible neighbour (along the finest axis) weighing 1.
    pub fn inverse_distance(radius: [usize; 3], voxel_size: [f32; 3]) -> Self {
        let finest = voxel_size.iter().copied().fold(f32::INFINITY, f32::min);
        let entries = window(radius)
            .filter(|&o| o != [0, 0, 0])
            .map(|o| {
                let d2: f32 = (0..3).map(|d| (o[d] as f32 * voxel_size[d]).powi(2)).sum();
                (o, finest / d2.sqrt())
            })
            .collect();
        Self { radius, entries }
    }

    /// Explicit weights for the whole window, x fastest. The weight given for
    /// the centre is ignored.
    pub fn with_weights(radius: [usize; 3], weights: &[f32]) -> Result<Self> {
        let expected: usize = radius.iter().map(|r| 2 * r + 1).product();
        if weights.len() != expected {
            return Err(config_error!(
                "neighbourhood of radius {radius:?} needs {expected} weights, got {}", weights.len()))
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(config_error!("neighbourhood weight {w} is not a non-negative number"))
        }
        let entries = window(radius).zip(weights)
            .filter(|(o, _)| *o != [0, 0, 0])
            .map(|(o, &w)| (o, w))
            .collect();
        Ok(Self { radius, entries })
    }

    /// Only the neighbours sharing a face with the centre
    pub fn without_corners(&self) -> Self {
        let entries = self.entries.iter()
            .filter(|(o, _)| o.iter().filter(|&&c| c != 0).count() == 1)
            .copied()
            .collect();
        Self { radius: self.radius, entries }
    }

    /// The same neighbourhood with weights summing to one
    pub fn normalized(&self) -> Self {
        let total: f32 = self.entries.iter().map(|(_, w)| w).sum();
        if total <= 0.0 { return self.clone() }
        Self { radius: self.radius, entries: self.entries.iter().map(|&(o, w)| (o, w / total)).collect() }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Offset3, f32)> + '_ { self.entries.iter().copied() }
    pub fn radius(&self) -> [usize; 3] { self.radius }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// The closed set of regularizers
#[derive(Clone, Debug, PartialEq)]
pub enum PriorKind {
    /// Median root prior
    Mrp,
    Quadratic,
    Huber { delta: f32 },
    /// Median root prior with an L-filter; default coefficients if `None`
    LFilter { weights: Option<Vec<f32>> },
    /// FIR-median hybrid; one unit tap per neighbourhood radius if `None`
    Fmh { taps: Option<Vec<f32>>, centre_weight: usize },
    WeightedMean { mean: MeanType, centre_weight: f32 },
    Tv(TotalVariation),
    /// Median root prior on an anisotropically diffused image
    AdMrp(AnisotropicDiffusion),
    Apls(Apls),
    Hyperbolic { delta: f32 },
    Tgv(Tgv),
    Nlm(NonLocal),
    /// Relative difference prior
    Rdp { gamma: f32, include_corners: bool },
    /// Generalized Gaussian Markov random field
    Ggmrf { p: f32, q: f32, c: f32 },
}

impl PriorKind {

    pub fn name(&self) -> &'static str {
        use PriorKind::*;
        match self {
            Mrp => "MRP", Quadratic => "quadratic", Huber { .. } => "Huber",
            LFilter { .. } => "L-filter", Fmh { .. } => "FMH", WeightedMean { .. } => "weighted mean",
            Tv(_) => "TV", AdMrp(_) => "AD-MRP", Apls(_) => "APLS", Hyperbolic { .. } => "hyperbolic",
            Tgv(_) => "TGV", Nlm(_) => "NLM", Rdp { .. } => "RDP", Ggmrf { .. } => "GGMRF",
        }
    }

    pub fn needs_reference(&self) -> bool {
        match self {
            PriorKind::Apls(_) => true,
            PriorKind::Tv(tv) => tv.needs_reference(),
            PriorKind::Nlm(nl) => nl.anatomical,
            _ => false,
        }
    }

    fn potential(&self) -> Option<Potential> {
        match *self {
            PriorKind::Quadratic => Some(Potential::Quadratic),
            PriorKind::Huber { delta } => Some(Potential::Huber { delta }),
            PriorKind::Hyperbolic { delta } => Some(Potential::Hyperbolic { delta }),
            PriorKind::Rdp { gamma, .. } => Some(Potential::RelativeDifference { gamma }),
            PriorKind::Ggmrf { p, q, c } => Some(Potential::Ggmrf { p, q, c }),
            _ => None,
        }
    }

    fn filter(&self, neighbourhood: &Neighbourhood) -> Option<Filter> {
        Some(match self {
            PriorKind::Mrp | PriorKind::AdMrp(_) => Filter::Median,
            PriorKind::LFilter { weights } => Filter::LFilter {
                weights: weights.clone().unwrap_or_else(|| median::default_l_weights(neighbourhood.len() + 1)),
            },
            PriorKind::Fmh { taps, centre_weight } => Filter::Fmh {
                taps: taps.clone().unwrap_or_else(|| vec![1.0; neighbourhood.radius().into_iter().max().unwrap_or(1).max(1)]),
                centre_weight: *centre_weight,
            },
            PriorKind::WeightedMean { mean, centre_weight } => Filter::WeightedMean { mean: *mean, centre_weight: *centre_weight },
            _ => return None,
        })
    }
}

/// A regularizer with its strength, neighbourhood and side inputs
#[derive(Clone, Debug)]
pub struct Prior {
    pub kind: PriorKind,
    pub beta: f32,
    pub neighbourhood: Neighbourhood,
    /// Divide the median-family differences by the filtered image
    pub normalize: bool,
    pub eps: f32,
    reference: Option<ImageVolume>,
}

impl Prior {

    pub fn new(kind: PriorKind, beta: f32, neighbourhood: Neighbourhood) -> Self {
        Self { kind, beta, neighbourhood, normalize: true, eps: DEFAULT_EPS, reference: None }
    }

    pub fn with_reference(self, reference: ImageVolume) -> Self { Self { reference: Some(reference), ..self } }
    pub fn with_normalization(self, normalize: bool) -> Self { Self { normalize, ..self } }
    pub fn with_eps(self, eps: f32) -> Self { Self { eps, ..self } }

    pub fn reference(&self) -> Option<&ImageVolume> { self.reference.as_ref() }

    /// Check everything which could go wrong later, against the volume the
    /// prior will be applied to.
    pub fn validate(&self, layout: &VolumeLayout) -> Result<()> {
        if !(self.beta >= 0.0 && self.beta.is_finite()) {
            return Err(config_error!("prior strength beta must be non-negative, got {}", self.beta))
        }
        match &self.reference {
            None if self.kind.needs_reference() =>
                return Err(missing(format!("reference image required by the {} prior", self.kind.name()))),
            Some(r) if r.layout() != layout =>
                return Err(config_error!("reference image of {} voxels does not match the {} voxel volume", r.len(), layout.len())),
            _ => (),
        }
        let positive = |name: &str, v: f32| {
            if v > 0.0 && v.is_finite() { Ok(()) } else { Err(config_error!("{} prior: {name} must be positive, got {v}", self.kind.name())) }
        };
        match &self.kind {
            PriorKind::Huber { delta } | PriorKind::Hyperbolic { delta } => positive("delta", *delta)?,
            PriorKind::Ggmrf { p, q, c } => {
                positive("c", *c)?;
                if !(*p >= 1.0 && *q >= 1.0 && p >= q) { return Err(config_error!("GGMRF prior needs p >= q >= 1, got p={p}, q={q}")) }
            }
            PriorKind::Rdp { gamma, .. } => if *gamma < 0.0 { return Err(config_error!("RDP gamma must be non-negative, got {gamma}")) },
            PriorKind::LFilter { weights: Some(w) } if w.len() != self.neighbourhood.len() + 1 =>
                return Err(config_error!("L-filter needs {} coefficients, got {}", self.neighbourhood.len() + 1, w.len())),
            PriorKind::Fmh { taps: Some(t), .. } if t.is_empty() => return Err(config_error!("FMH prior needs at least one tap")),
            PriorKind::Tv(tv) => { positive("smoothing", tv.smoothing)?; positive("T", tv.t)? }
            PriorKind::Apls(a) => { positive("eta", a.eta)?; positive("smoothing", a.smoothing)? }
            PriorKind::Tgv(t) => { positive("alpha0", t.alpha0)?; positive("alpha1", t.alpha1)?; positive("smoothing", t.smoothing)? }
            PriorKind::AdMrp(ad) => { positive("K", ad.k)?; positive("time step", ad.time_step)? }
            PriorKind::Nlm(nl) => { positive("h", nl.h)?; positive("patch sigma", nl.patch_sigma)? }
            _ => (),
        }
        if self.neighbourhood.is_empty() && self.kind.potential().is_some() {
            return Err(config_error!("{} prior with an empty neighbourhood", self.kind.name()))
        }
        Ok(())
    }

    /// `beta` times the gradient of the penalty (or its one-step-late
    /// equivalent) at `image`
    pub fn gradient(&self, image: &ImageVolume) -> Result<ImageData> {
        let mut out = vec![0.0; image.len()];
        for (k, region) in image.layout().regions().iter().enumerate() {
            let x = image.region_data(k);
            let reference = self.reference.as_ref().map(|r| r.region_data(k));
            let g = self.region_gradient(x, region.fov.n, reference)?;
            for (o, g) in out[region.range()].iter_mut().zip(g) {
                *o = self.beta * g;
            }
        }
        Ok(out)
    }

    fn region_gradient(&self, x: &[f32], n: BoxDim_u, reference: Option<&[f32]>) -> Result<Vec<f32>> {
        let nb = &self.neighbourhood;
        let needed = || missing(format!("reference image required by the {} prior", self.kind.name()));
        if let Some(potential) = self.kind.potential() {
            let nb = match self.kind { PriorKind::Rdp { include_corners: false, .. } => nb.without_corners(), _ => nb.clone() };
            let mut g = vec![0.0; x.len()];
            potential::gradient(x, n, &nb, potential, self.eps, &mut g);
            return Ok(g)
        }
        if let Some(filter) = self.kind.filter(nb) {
            let smoothed;
            let source = match &self.kind {
                PriorKind::AdMrp(ad) => { smoothed = ad.smooth(x, n); &smoothed[..] }
                _ => x,
            };
            let m = median::filtered(source, n, nb, &filter, self.eps);
            let mut g = vec![0.0; x.len()];
            median::one_step_late(x, &m, self.normalize, self.eps, &mut g);
            return Ok(g)
        }
        Ok(match &self.kind {
            PriorKind::Tv(tv) => {
                if tv.needs_reference() && reference.is_none() { return Err(needed()) }
                tv.gradient(x, n, reference)
            }
            PriorKind::Apls(apls) => apls.gradient(x, n, reference.ok_or_else(needed)?),
            PriorKind::Tgv(tgv) => tgv.gradient(x, n),
            PriorKind::Nlm(nl) => {
                if nl.anatomical && reference.is_none() { return Err(needed()) }
                nl.gradient(x, n, reference, self.normalize)
            }
            other => return Err(config_error!("{} prior has no gradient rule", other.name())),
        })
    }

    /// `beta` times the penalty at `image`, for the priors which are
    /// gradients of an explicit penalty
    pub fn penalty(&self, image: &ImageVolume) -> Result<Option<f64>> {
        let mut total = 0.0;
        for (k, region) in image.layout().regions().iter().enumerate() {
            let (x, n) = (image.region_data(k), region.fov.n);
            let reference = self.reference.as_ref().map(|r| r.region_data(k));
            total += match &self.kind {
                PriorKind::Rdp { include_corners: false, gamma } =>
                    potential::penalty(x, n, &self.neighbourhood.without_corners(), Potential::RelativeDifference { gamma: *gamma }, self.eps),
                kind if kind.potential().is_some() =>
                    potential::penalty(x, n, &self.neighbourhood, kind.potential().unwrap_or(Potential::Quadratic), self.eps),
                PriorKind::Tv(tv) => tv.penalty(x, n, reference),
                PriorKind::Apls(apls) => match reference {
                    Some(r) => apls.penalty(x, n, r),
                    None => return Err(missing("reference image required by the APLS prior")),
                },
                PriorKind::Tgv(tgv) => tgv.penalty(x, n),
                _ => return Ok(None),
            };
        }
        Ok(Some(self.beta as f64 * total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fov::FOV;
    use float_eq::assert_float_eq;
    use geometry::Vector;
    use rstest::rstest;
    use variation::TvType;

    fn fov() -> FOV { FOV::from_mm([5.0, 5.0, 5.0], [5, 5, 5]) }

    fn spike() -> ImageVolume {
        let mut data = vec![1.0; 125];
        data[62] = 5.0;
        ImageVolume::single(fov(), data).unwrap()
    }

    fn nb() -> Neighbourhood { Neighbourhood::inverse_distance([1, 1, 1], [1.0, 1.0, 1.0]) }

    #[test]
    fn inverse_distance_weights() {
        let nb = nb();
        assert_eq!(nb.len(), 26);
        let weight = |o: Offset3| nb.iter().find(|(p, _)| *p == o).map(|(_, w)| w);
        assert_float_eq!(weight([1, 0, 0]).unwrap(), 1.0, abs <= 1e-6);
        assert_float_eq!(weight([1, 1, 0]).unwrap(), 1.0 / 2.0_f32.sqrt(), abs <= 1e-6);
        assert_float_eq!(weight([1, 1, 1]).unwrap(), 1.0 / 3.0_f32.sqrt(), abs <= 1e-6);
        assert_eq!(nb.without_corners().len(), 6);
        assert_float_eq!(nb.normalized().iter().map(|(_, w)| w).sum::<f32>(), 1.0, abs <= 1e-5);
    }

    #[test]
    fn anisotropic_voxels_weigh_by_distance() {
        let nb = Neighbourhood::inverse_distance([1, 1, 0], [1.0, 2.0, 3.0]);
        assert_eq!(nb.len(), 8);
        let w: Vec<f32> = nb.iter().filter(|(o, _)| *o == [0, 1, 0]).map(|(_, w)| w).collect();
        assert_float_eq!(w[0], 0.5, abs <= 1e-6);
    }

    #[test]
    fn explicit_weights_need_whole_window() {
        assert!(Neighbourhood::with_weights([1, 0, 0], &[1.0, 0.0]).is_err());
        let nb = Neighbourhood::with_weights([1, 0, 0], &[2.0, 9.0, 3.0]).unwrap();
        assert_eq!(nb.iter().collect::<Vec<_>>(), vec![([-1, 0, 0], 2.0), ([1, 0, 0], 3.0)]);
    }

    fn all_kinds() -> Vec<PriorKind> {
        vec![
            PriorKind::Mrp,
            PriorKind::Quadratic,
            PriorKind::Huber { delta: 1.0 },
            PriorKind::LFilter { weights: None },
            PriorKind::Fmh { taps: None, centre_weight: 4 },
            PriorKind::WeightedMean { mean: MeanType::Arithmetic, centre_weight: 4.0 },
            PriorKind::Tv(TotalVariation { tv: TvType::Smoothed, smoothing: 0.01, t: 1.0, c: 1.0 }),
            PriorKind::AdMrp(AnisotropicDiffusion {
                time_step: 0.05, k: 2.0, iterations: 3, flux: median::Flux::Exponential, diffusion: median::DiffusionType::Faces,
            }),
            PriorKind::Hyperbolic { delta: 1.0 },
            PriorKind::Tgv(Tgv { alpha0: 1.0, alpha1: 1.0, smoothing: 0.01, iterations: 5 }),
            PriorKind::Nlm(NonLocal {
                variant: nonlocal::NlVariant::Means, search: [1, 1, 1], patch: [1, 1, 1],
                h: 1.0, patch_sigma: 1.0, anatomical: false, eps: 1e-3,
            }),
            PriorKind::Rdp { gamma: 2.0, include_corners: false },
            PriorKind::Ggmrf { p: 2.0, q: 1.5, c: 1.0 },
        ]
    }

    #[test]
    fn every_prior_pushes_a_spike_down() {
        let image = spike();
        for kind in all_kinds() {
            let prior = Prior::new(kind.clone(), 0.5, nb());
            prior.validate(image.layout()).unwrap();
            let g = prior.gradient(&image).unwrap();
            assert!(g[62] > 0.0, "{}: {}", kind.name(), g[62]);
        }
    }

    #[test]
    fn beta_scales_gradient() {
        let image = spike();
        let g1 = Prior::new(PriorKind::Quadratic, 1.0, nb()).gradient(&image).unwrap();
        let g3 = Prior::new(PriorKind::Quadratic, 3.0, nb()).gradient(&image).unwrap();
        for (a, b) in g1.iter().zip(&g3) { assert_float_eq!(3.0 * a, *b, abs <= 1e-5) }
    }

    #[rstest(/**/ kind,
             case(PriorKind::Apls(Apls { eta: 1.0, smoothing: 0.1 })),
             case(PriorKind::Tv(TotalVariation { tv: TvType::Weighted, smoothing: 0.1, t: 1.0, c: 1.0 })),
    )]
    fn reference_is_mandatory(kind: PriorKind) {
        let image = spike();
        let prior = Prior::new(kind, 1.0, nb());
        assert!(matches!(prior.validate(image.layout()), Err(crate::Error::MissingResource { .. })));
        assert!(prior.gradient(&image).is_err());
        let prior = prior.with_reference(spike());
        assert!(prior.validate(image.layout()).is_ok());
        assert!(prior.gradient(&image).is_ok());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let layout = spike().layout().clone();
        assert!(Prior::new(PriorKind::Huber { delta: 0.0 }, 1.0, nb()).validate(&layout).is_err());
        assert!(Prior::new(PriorKind::Quadratic, -1.0, nb()).validate(&layout).is_err());
        assert!(Prior::new(PriorKind::Ggmrf { p: 1.0, q: 2.0, c: 1.0 }, 1.0, nb()).validate(&layout).is_err());
        assert!(Prior::new(PriorKind::LFilter { weights: Some(vec![1.0; 3]) }, 1.0, nb()).validate(&layout).is_err());
    }

    #[test]
    fn penalties_only_for_explicit_potentials() {
        let image = spike();
        let quadratic = Prior::new(PriorKind::Quadratic, 1.0, nb()).penalty(&image).unwrap();
        assert!(quadratic.unwrap() > 0.0);
        assert_eq!(Prior::new(PriorKind::Mrp, 1.0, nb()).penalty(&image).unwrap(), None);
    }

    #[test]
    fn regions_are_regularized_separately() {
        let layout = VolumeLayout::multi_resolution(fov(), Vector::new(5.0, 5.0, 7.5), 0.5).unwrap();
        let image = ImageVolume::uniform(layout, 2.0);
        let g = Prior::new(PriorKind::Quadratic, 1.0, nb()).gradient(&image).unwrap();
        assert_eq!(g.len(), image.len());
        assert!(g.iter().all(|v| v.abs() < 1e-6));
    }
}
