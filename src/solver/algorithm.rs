//! The closed set of reconstruction algorithms, their parameters, and the
//! voxel-wise and measurement-wise pieces of their update rules.

use crate::config_error;
use crate::error::Result;

/// Parameters shared by the primal-dual algorithms
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrimalDual {
    /// Primal step; zero means: derive from the operator norm
    pub tau: f32,
    /// Dual step
    pub sigma: f32,
    /// Extrapolation
    pub theta: f32,
}

impl Default for PrimalDual {
    fn default() -> Self { Self { tau: 0.0, sigma: 1.0, theta: 1.0 } }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Algorithm {
    /// OSEM, or MLEM with a single subset; one-step-late with a prior
    Osem,
    Ramla,
    /// Upper bound `upper` on voxel values; zero means: derive from the data
    Mramla { upper: f32 },
    Rosem,
    /// Rescaled block-iterative EM; one-step-late with a prior
    Rbi,
    /// Dynamic RAMLA: relaxation β₀β / (β + α k) at sub-iteration `k`
    Drama { beta0: f32, beta: f32, alpha: f32 },
    /// Complete-data OSEM; one-step-late with a prior
    Cosem,
    /// Enhanced COSEM: a likelihood-increasing blend of COSEM and OSEM
    Ecosem,
    /// Accelerated COSEM; `h = 1` is COSEM
    Acosem { h: f32 },
    Fista,
    /// FISTA with an L1 penalty of the given weight
    FistaL1 { weight: f32 },
    Lsqr,
    Cgls,
    Bsrem,
    Mbsrem { upper: f32 },
    RosemMap,
    /// Preconditioned Krasnoselskii-Mann. `alpha` overrides the computed
    /// averaging weights 1 + ρk/(k + δ) when it has enough values.
    Pkma { rho: f32, delta: f32, alpha: Vec<f32> },
    /// PDHG with a least-squares data term
    Pdhg(PrimalDual),
    PdhgL1(PrimalDual),
    /// PDHG with the Poisson (Kullback-Leibler) data term
    PdhgKl(PrimalDual),
    /// Primal-dual Davis-Yin
    Pddy(PrimalDual),
}

/// How the data are compared with their expectation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// Ratios y/ȳ, multiplicative or EM-preconditioned additive updates
    ExpectationMaximization,
    /// Preconditioned gradient steps on the Poisson log-likelihood
    Gradient,
    /// Conjugate-gradient type least squares
    LeastSquares,
    PrimalDual,
}

impl Algorithm {

    pub fn name(&self) -> &'static str {
        use Algorithm::*;
        match self {
            Osem => "OSEM", Ramla => "RAMLA", Mramla { .. } => "MRAMLA", Rosem => "ROSEM", Rbi => "RBI",
            Drama { .. } => "DRAMA", Cosem => "COSEM", Ecosem => "ECOSEM", Acosem { .. } => "ACOSEM",
            Fista => "FISTA", FistaL1 { .. } => "FISTA-L1", Lsqr => "LSQR", Cgls => "CGLS",
            Bsrem => "BSREM", Mbsrem { .. } => "MBSREM", RosemMap => "ROSEM-MAP", Pkma { .. } => "PKMA",
            Pdhg(_) => "PDHG", PdhgL1(_) => "PDHG-L1", PdhgKl(_) => "PDHG-KL", Pddy(_) => "PDDY",
        }
    }

    /// Look up an algorithm by (case-insensitive) name, with default parameters
    pub fn from_name(name: &str) -> Result<Self> {
        use Algorithm::*;
        let pd = PrimalDual::default();
        Ok(match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "osem" | "mlem" => Osem, "ramla" => Ramla, "mramla" => Mramla { upper: 0.0 },
            "rosem" => Rosem, "rbi" => Rbi, "drama" => Drama { beta0: 0.1, beta: 1.0, alpha: 0.1 },
            "cosem" => Cosem, "ecosem" => Ecosem, "acosem" => Acosem { h: 2.0 },
            "fista" => Fista, "fistal1" => FistaL1 { weight: 1.0 }, "lsqr" => Lsqr, "cgls" => Cgls,
            "bsrem" => Bsrem, "mbsrem" => Mbsrem { upper: 0.0 }, "rosemmap" => RosemMap,
            "pkma" => Pkma { rho: 0.95, delta: 1.0, alpha: vec![] },
            "pdhg" => Pdhg(pd), "pdhgl1" => PdhgL1(pd), "pdhgkl" => PdhgKl(pd), "pddy" => Pddy(pd),
            _ => return Err(config_error!("unknown algorithm '{name}'")),
        })
    }

    pub fn family(&self) -> Family {
        use Algorithm::*;
        match self {
            Osem | Ramla | Mramla { .. } | Rosem | Rbi | Drama { .. } | Cosem | Ecosem | Acosem { .. }
                | Bsrem | Mbsrem { .. } | RosemMap => Family::ExpectationMaximization,
            Fista | FistaL1 { .. } | Pkma { .. } => Family::Gradient,
            Lsqr | Cgls => Family::LeastSquares,
            Pdhg(_) | PdhgL1(_) | PdhgKl(_) | Pddy(_) => Family::PrimalDual,
        }
    }

    /// Whether a prior may be combined with this algorithm
    pub fn supports_prior(&self) -> bool {
        use Algorithm::*;
        matches!(self,
            Osem | Rbi | Cosem | Acosem { .. } | Bsrem | Mbsrem { .. } | RosemMap | Pkma { .. }
            | Fista | FistaL1 { .. } | Pdhg(_) | PdhgL1(_) | PdhgKl(_) | Pddy(_))
    }

    pub fn requires_single_subset(&self) -> bool { matches!(self, Algorithm::Lsqr | Algorithm::Cgls) }

    /// Least squares solvers are free to go negative
    pub fn supports_positivity(&self) -> bool { self.family() != Family::LeastSquares }

    /// The configured upper bound of MRAMLA and MBSREM
    pub fn upper_bound(&self) -> Option<f32> {
        match self {
            Algorithm::Mramla { upper } | Algorithm::Mbsrem { upper } => Some(*upper),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |what: &str, v: f32| {
            if v > 0.0 && v.is_finite() { Ok(()) } else { Err(config_error!("{}: {what} must be positive, got {v}", self.name())) }
        };
        match self {
            Algorithm::Acosem { h } => positive("h", *h),
            Algorithm::Drama { beta0, beta, alpha } => { positive("beta0", *beta0)?; positive("beta", *beta)?; if *alpha < 0.0 { return Err(config_error!("DRAMA: alpha must not be negative")) } Ok(()) }
            Algorithm::Mramla { upper } | Algorithm::Mbsrem { upper } if *upper < 0.0 =>
                Err(config_error!("{}: upper bound must not be negative", self.name())),
            Algorithm::FistaL1 { weight } if *weight < 0.0 => Err(config_error!("FISTA-L1: weight must not be negative")),
            Algorithm::Pkma { delta, .. } => positive("delta", *delta),
            Algorithm::Pdhg(pd) | Algorithm::PdhgL1(pd) | Algorithm::PdhgKl(pd) | Algorithm::Pddy(pd) => {
                positive("sigma", pd.sigma)?;
                if pd.tau < 0.0 { return Err(config_error!("{}: tau must not be negative", self.name())) }
                if !(0.0..=1.0).contains(&pd.theta) { return Err(config_error!("{}: theta must lie in [0, 1]", self.name())) }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// DRAMA relaxation at zero-based sub-iteration `k`
    pub fn drama_relaxation(beta0: f32, beta: f32, alpha: f32, k: usize) -> f32 {
        beta0 * beta / (beta + alpha * k as f32)
    }

    /// PKMA averaging weight at zero-based sub-iteration `k`, in `[1, 1 + rho)`
    /// unless given explicitly
    pub fn pkma_alpha(rho: f32, delta: f32, alpha: &[f32], k: usize) -> f32 {
        alpha.get(k).copied().unwrap_or_else(|| 1.0 + rho * k as f32 / (k as f32 + delta))
    }
}

// ----- measurement-space pieces ------------------------------------------

/// y / ȳ, guarded against vanishing expectations
pub fn ratios(y: &[f32], expected: &[f32], eps: f32) -> Vec<f32> {
    y.iter().zip(expected).map(|(&y, &e)| y / e.max(eps)).collect()
}

/// Σ y log ȳ − ȳ, the Poisson log-likelihood up to a constant
pub fn log_likelihood(y: &[f32], expected: &[f32], eps: f32) -> f64 {
    y.iter().zip(expected)
        .map(|(&y, &e)| { let e = e.max(eps) as f64; y as f64 * e.ln() - e })
        .sum()
}

/// Resolvent of the conjugate data term, for each primal-dual variant.
/// `v` is `p + σ ȳ`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataTerm { LeastSquares, L1, KullbackLeibler }

impl DataTerm {
    #[inline]
    pub fn dual_prox(&self, v: f32, y: f32, sigma: f32) -> f32 {
        match self {
            DataTerm::LeastSquares => (v - sigma * y) / (1.0 + sigma),
            DataTerm::L1 => (v - sigma * y).clamp(-1.0, 1.0),
            DataTerm::KullbackLeibler => 0.5 * (1.0 + v - ((v - 1.0).powi(2) + 4.0 * sigma * y.max(0.0)).sqrt()),
        }
    }
}

// ----- image-space pieces ------------------------------------------------

/// x · b / d where `d` is positive; unchanged elsewhere
pub fn em_update(x: &mut [f32], backprojection: &[f32], denominator: &[f32], eps: f32) {
    for ((x, &b), &d) in x.iter_mut().zip(backprojection).zip(denominator) {
        if d > eps { *x *= b / d }
    }
}

/// x + λ d g
pub fn scaled_step(x: &mut [f32], scaling: &[f32], direction: &[f32], lambda: f32) {
    for ((x, &d), &g) in x.iter_mut().zip(scaling).zip(direction) {
        *x += lambda * d * g;
    }
}

/// Proximal map of `t·|x|`
#[inline]
pub fn soft_threshold(x: f32, t: f32) -> f32 {
    x.signum() * (x.abs() - t).max(0.0)
}

/// FISTA momentum: the next `t`, and the weight of the new step
pub fn fista_momentum(t: f32) -> (f32, f32) {
    let next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
    (next, (t - 1.0) / next)
}

pub fn clamp_nonnegative(x: &mut [f32]) { x.iter_mut().for_each(|v| *v = v.max(0.0)) }

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    #[test]
    fn names_round_trip() {
        for name in ["OSEM", "RAMLA", "MRAMLA", "ROSEM", "RBI", "DRAMA", "COSEM", "ECOSEM", "ACOSEM", "FISTA",
                     "FISTA-L1", "LSQR", "CGLS", "BSREM", "MBSREM", "ROSEM-MAP", "PKMA", "PDHG", "PDHG-L1",
                     "PDHG-KL", "PDDY"] {
            assert_eq!(Algorithm::from_name(name).unwrap().name(), name);
        }
        assert_eq!(Algorithm::from_name("mlem").unwrap(), Algorithm::Osem);
        assert!(Algorithm::from_name("art").is_err());
    }

    #[rstest(/**/ name, prior,
             case("OSEM"    , true ),
             case("RAMLA"   , false),
             case("MRAMLA"  , false),
             case("ROSEM"   , false),
             case("DRAMA"   , false),
             case("ECOSEM"  , false),
             case("LSQR"    , false),
             case("CGLS"    , false),
             case("RBI"     , true ),
             case("COSEM"   , true ),
             case("MBSREM"  , true ),
             case("PKMA"    , true ),
             case("PDDY"    , true ),
    )]
    fn map_support(name: &str, prior: bool) {
        assert_eq!(Algorithm::from_name(name).unwrap().supports_prior(), prior);
    }

    #[test]
    fn least_squares_only() {
        assert!(Algorithm::Lsqr.requires_single_subset());
        assert!(!Algorithm::Lsqr.supports_positivity());
        assert!(Algorithm::Pdhg(PrimalDual::default()).supports_positivity());
    }

    #[test]
    fn parameter_validation() {
        assert!(Algorithm::Acosem { h: 0.0 }.validate().is_err());
        assert!(Algorithm::Pdhg(PrimalDual { theta: 2.0, ..Default::default() }).validate().is_err());
        assert!(Algorithm::Mbsrem { upper: -1.0 }.validate().is_err());
        assert!(Algorithm::from_name("DRAMA").unwrap().validate().is_ok());
    }

    #[test]
    fn schedules() {
        assert_float_eq!(Algorithm::drama_relaxation(0.1, 1.0, 0.1, 0), 0.1, abs <= 1e-7);
        assert_float_eq!(Algorithm::drama_relaxation(0.1, 1.0, 0.1, 10), 0.05, abs <= 1e-7);
        assert_eq!(Algorithm::pkma_alpha(0.95, 1.0, &[], 0), 1.0);
        assert_float_eq!(Algorithm::pkma_alpha(0.95, 1.0, &[], 1), 1.475, abs <= 1e-6);
        assert_eq!(Algorithm::pkma_alpha(0.95, 1.0, &[0.3, 0.2], 1), 0.2);
        // Grows monotonically from 1 towards 1 + rho
        let alphas: Vec<f32> = (0..200).map(|k| Algorithm::pkma_alpha(0.95, 1.0, &[], k)).collect();
        assert!(alphas.windows(2).all(|w| w[0] <= w[1]));
        assert!(alphas.iter().all(|&a| (1.0..1.95).contains(&a)));
    }

    #[rstest(/**/ term,
             case(DataTerm::LeastSquares),
             case(DataTerm::L1),
             case(DataTerm::KullbackLeibler),
    )]
    fn dual_fixed_point_at_perfect_fit(term: DataTerm) {
        // At ȳ = y, the optimal dual variable is the derivative of the data
        // term at y: 0 for L2 and L1, 1 - y/ȳ = 0 for KL; it is a fixed point.
        let (y, sigma) = (4.0, 0.7);
        let p = 0.0;
        assert_float_eq!(term.dual_prox(p + sigma * y, y, sigma), p, abs <= 1e-6);
    }

    #[test]
    fn em_update_skips_insensitive_voxels() {
        let mut x = vec![2.0, 2.0];
        em_update(&mut x, &[3.0, 3.0], &[1.5, 0.0], 1e-9);
        assert_eq!(x, vec![4.0, 2.0]);
    }

    #[test]
    fn helpers() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-0.5, 1.0), 0.0);
        let (t, w) = fista_momentum(1.0);
        assert_float_eq!(t, (1.0 + 5.0_f32.sqrt()) / 2.0, abs <= 1e-6);
        assert_eq!(w, 0.0);
        assert_eq!(ratios(&[2.0, 1.0], &[4.0, 0.0], 0.5), vec![0.5, 2.0]);
        let mut x = vec![-1.0, 2.0];
        clamp_nonnegative(&mut x);
        assert_eq!(x, vec![0.0, 2.0]);
        assert!(log_likelihood(&[2.0], &[2.0], 1e-9) > log_likelihood(&[2.0], &[3.0], 1e-9));
    }
}
