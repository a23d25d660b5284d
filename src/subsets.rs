//! Partition of the measurement indices into ordered subsets.
//!
//! Every policy works the same way: it chooses a *unit* of selection (a
//! single measurement, a sinogram column, a radial row, a whole plane), puts
//! the units into a policy-specific order, and deals them out to the subsets
//! like cards. Subsets are therefore disjoint, cover every index, and their
//! sizes, counted in units, differ by at most one.

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::Deserialize;

use crate::config_error;
use crate::error::Result;
use crate::measurement::SinogramShape;

/// How measurement indices are dealt into subsets. The numbers are the
/// conventional subset type numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsetPolicy {
    /// 1: indices `k, k+P, k+2P, ...`
    #[default]
    Interleaved,
    /// 2: as 1, after transposing the data so that the slowest axis varies
    /// fastest
    Transposed,
    /// 3: uniformly random, seeded
    Random,
    /// 4: whole angular columns of the sinogram
    SinogramColumns,
    /// 5: whole radial rows of the sinogram
    SinogramRows,
    /// 8: whole sinogram planes, every `P`th one
    Planes,
    /// 9: whole sinogram planes, randomly, seeded
    RandomPlanes,
    /// 11: whole sinogram planes, visited in a prime-step order
    PrimePlanes,
}

impl SubsetPolicy {

    pub fn from_number(n: u32) -> Result<Self> {
        use SubsetPolicy::*;
        Ok(match n {
            1 => Interleaved, 2 => Transposed, 3 => Random,
            4 => SinogramColumns, 5 => SinogramRows,
            8 => Planes, 9 => RandomPlanes, 11 => PrimePlanes,
            _ => return Err(config_error!("unsupported subset type {n}")),
        })
    }

    pub fn number(&self) -> u32 {
        use SubsetPolicy::*;
        match self {
            Interleaved => 1, Transposed => 2, Random => 3,
            SinogramColumns => 4, SinogramRows => 5,
            Planes => 8, RandomPlanes => 9, PrimePlanes => 11,
        }
    }

    pub fn needs_sinogram(&self) -> bool { self.number() >= 4 }
}

/// Split the `n` measurement indices into `subsets` subsets. Policies which
/// select parts of sinograms need `shape`. Each subset lists its indices in
/// increasing order.
pub fn partition(n: usize, subsets: usize, policy: SubsetPolicy, shape: Option<SinogramShape>, seed: u64) -> Result<Vec<Vec<usize>>> {
    if subsets == 0 { return Err(config_error!("number of subsets must be positive")) }
    if subsets == 1 { return Ok(vec![(0..n).collect()]) }

    if policy.needs_sinogram() {
        match shape {
            None => return Err(config_error!("subset type {} needs sinogram data", policy.number())),
            Some(s) if s.len() != n =>
                return Err(config_error!("sinogram shape {s:?} does not match {n} measurements")),
            _ => (),
        }
    }
    // Only consulted by the sinogram policies, for which it is the real shape
    let s = shape.unwrap_or(SinogramShape { rows: n, cols: 1, planes: 1 });

    // Units in dealing order; each unit is a list of measurement indices
    let units: Vec<Vec<usize>> = match policy {
        SubsetPolicy::Interleaved => (0..n).map(|i| vec![i]).collect(),

        SubsetPolicy::Transposed => {
            let rows = shape.map_or_else(|| (n as f64).sqrt().ceil() as usize, |s| s.rows * s.cols).max(1);
            let cols = n.div_ceil(rows);
            (0..rows)
                .flat_map(|r| (0..cols).map(move |c| r + rows * c))
                .filter(|&i| i < n)
                .map(|i| vec![i])
                .collect()
        }

        SubsetPolicy::Random => {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut StdRng::seed_from_u64(seed));
            order.into_iter().map(|i| vec![i]).collect()
        }

        SubsetPolicy::SinogramColumns => {
            (0..s.cols * s.planes)
                .map(|c| {
                    let (ang, plane) = (c % s.cols, c / s.cols);
                    (0..s.rows).map(|dist| dist + s.rows * (ang + s.cols * plane)).collect()
                })
                .collect()
        }

        SubsetPolicy::SinogramRows => {
            (0..s.rows * s.planes)
                .map(|r| {
                    let (dist, plane) = (r % s.rows, r / s.rows);
                    (0..s.cols).map(|ang| dist + s.rows * (ang + s.cols * plane)).collect()
                })
                .collect()
        }

        SubsetPolicy::Planes => planes(s, 0..s.planes),

        SubsetPolicy::RandomPlanes => {
            let mut order: Vec<usize> = (0..s.planes).collect();
            order.shuffle(&mut StdRng::seed_from_u64(seed));
            planes(s, order)
        }

        SubsetPolicy::PrimePlanes => {
            let step = prime_step(s.planes, subsets);
            planes(s, (0..s.planes).map(|k| (k * step) % s.planes))
        }
    };

    if units.len() < subsets {
        return Err(config_error!(
            "{subsets} subsets requested, but subset type {} yields only {} selection units",
            policy.number(), units.len()))
    }

    let mut result = vec![vec![]; subsets];
    for (k, unit) in units.into_iter().enumerate() {
        result[k % subsets].extend(unit);
    }
    for subset in &mut result { subset.sort_unstable() }
    log::debug!("subsets (type {}): sizes {:?}", policy.number(), result.iter().map(Vec::len).collect::<Vec<_>>());
    Ok(result)
}

fn planes(s: SinogramShape, order: impl IntoIterator<Item = usize>) -> Vec<Vec<usize>> {
    let per_plane = s.rows * s.cols;
    order.into_iter()
        .map(|p| (p * per_plane..(p + 1) * per_plane).collect())
        .collect()
}

/// The smallest prime, at least `planes / subsets`, that shares no factor
/// with `planes`: stepping through the planes with it visits each once.
fn prime_step(planes: usize, subsets: usize) -> usize {
    let start = (planes / subsets).max(2);
    (start..)
        .filter(|&p| is_prime(p))
        .find(|&p| gcd(p, planes) == 1)
        .filter(|&p| p < planes)
        .unwrap_or(1)
}

fn is_prime(n: usize) -> bool {
    n >= 2 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    const SHAPE: SinogramShape = SinogramShape { rows: 5, cols: 4, planes: 6 };

    fn check_partition(subsets: &[Vec<usize>], n: usize) {
        let mut all: Vec<usize> = subsets.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn interleaved_takes_every_pth_index() {
        let s = partition(10, 3, SubsetPolicy::Interleaved, None, 0).unwrap();
        assert_eq!(s, vec![vec![0, 3, 6, 9], vec![1, 4, 7], vec![2, 5, 8]]);
    }

    #[test]
    fn single_subset_is_everything() {
        assert_eq!(partition(4, 1, SubsetPolicy::PrimePlanes, None, 0).unwrap(), vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn random_policies_depend_on_seed_only() {
        let a = partition(100, 4, SubsetPolicy::Random, None, 42).unwrap();
        let b = partition(100, 4, SubsetPolicy::Random, None, 42).unwrap();
        let c = partition(100, 4, SubsetPolicy::Random, None, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn whole_planes_stay_together() {
        let n = SHAPE.len();
        let per_plane = SHAPE.rows * SHAPE.cols;
        for policy in [SubsetPolicy::Planes, SubsetPolicy::RandomPlanes, SubsetPolicy::PrimePlanes] {
            let subsets = partition(n, 3, policy, Some(SHAPE), 7).unwrap();
            check_partition(&subsets, n);
            for subset in &subsets {
                assert_eq!(subset.len(), 2 * per_plane);
                for chunk in subset.chunks(per_plane) {
                    assert_eq!(chunk[0] % per_plane, 0);
                    assert_eq!(chunk[per_plane - 1], chunk[0] + per_plane - 1);
                }
            }
        }
    }

    #[test]
    fn sinogram_columns_keep_all_radial_bins() {
        let subsets = partition(SHAPE.len(), 4, SubsetPolicy::SinogramColumns, Some(SHAPE), 0).unwrap();
        // 4 angles, 4 subsets: subset k holds angle k of every plane
        for (k, subset) in subsets.iter().enumerate() {
            assert!(subset.iter().all(|&i| (i / SHAPE.rows) % SHAPE.cols == k));
        }
    }

    #[rstest(/**/ policy,
             case(SubsetPolicy::SinogramColumns),
             case(SubsetPolicy::SinogramRows),
             case(SubsetPolicy::Planes),
    )]
    fn sinogram_policies_need_sinograms(policy: SubsetPolicy) {
        assert!(partition(120, 2, policy, None, 0).is_err());
    }

    #[test]
    fn too_many_subsets() {
        assert!(partition(SHAPE.len(), 7, SubsetPolicy::Planes, Some(SHAPE), 0).is_err());
        assert!(partition(10, 0, SubsetPolicy::Interleaved, None, 0).is_err());
    }

    #[rstest(/**/ planes, subsets, step,
             case(6, 3, 5), case(20, 4, 7), case(16, 2, 11), case(3, 3, 2), case(2, 2, 1),
    )]
    fn prime_steps(planes: usize, subsets: usize, step: usize) {
        assert_eq!(prime_step(planes, subsets), step);
    }

    #[test]
    fn policy_numbers() {
        for n in [1, 2, 3, 4, 5, 8, 9, 11] {
            assert_eq!(SubsetPolicy::from_number(n).unwrap().number(), n);
        }
        assert!(SubsetPolicy::from_number(6).is_err());
    }

    proptest! {
        #[test]
        fn every_policy_partitions(
            rows in 1_usize..6, cols in 1_usize..6, planes in 1_usize..8,
            subsets in 1_usize..5, seed in any::<u64>(),
            policy in proptest::sample::select(vec![
                SubsetPolicy::Interleaved, SubsetPolicy::Transposed, SubsetPolicy::Random,
                SubsetPolicy::SinogramColumns, SubsetPolicy::SinogramRows,
                SubsetPolicy::Planes, SubsetPolicy::RandomPlanes, SubsetPolicy::PrimePlanes,
            ]),
        ) {
            let shape = SinogramShape { rows, cols, planes };
            let n = shape.len();
            let unit = match policy {
                SubsetPolicy::SinogramColumns => rows,
                SubsetPolicy::SinogramRows => cols,
                SubsetPolicy::Planes | SubsetPolicy::RandomPlanes | SubsetPolicy::PrimePlanes => rows * cols,
                _ => 1,
            };
            match partition(n, subsets, policy, Some(shape), seed) {
                Ok(result) => {
                    prop_assert_eq!(result.len(), subsets);
                    let mut all: Vec<usize> = result.iter().flatten().copied().collect();
                    all.sort_unstable();
                    prop_assert_eq!(all, (0..n).collect::<Vec<_>>());
                    let sizes: Vec<usize> = result.iter().map(|s| s.len() / unit).collect();
                    let (lo, hi) = (sizes.iter().min().copied().unwrap_or(0), sizes.iter().max().copied().unwrap_or(0));
                    prop_assert!(hi - lo <= 1);
                }
                Err(_) => prop_assert!(subsets > 1 && n / unit < subsets),
            }
        }
    }
}
