//! Measured data: dense sinograms or lists of detector-index pairs.

use crate::error::Result;
use crate::lor::LOR;
use crate::measurement_error;
use crate::scanner::ScannerGeometry;
use crate::sinogram::SinogramLayout;

/// Zero-based detector indices of both ends of a coincidence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DetectorPair {
    pub transaxial: [u32; 2],
    pub axial: [u32; 2],
}

impl DetectorPair {
    pub fn new((tr1, ax1): (u32, u32), (tr2, ax2): (u32, u32)) -> Self {
        Self { transaxial: [tr1, tr2], axial: [ax1, ax2] }
    }
}

/// One entry of an index-based measurement. The weight is `+1` for prompts
/// and `-1` for delayed coincidences, which subtract the randoms estimate
/// directly from the data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexedEvent {
    pub pair: DetectorPair,
    pub weight: f32,
    pub tof_bin: u16,
}

/// Shape of sinogram data, as needed by the sinogram-aware subset policies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinogramShape {
    /// Radial bins
    pub rows: usize,
    /// Angular bins
    pub cols: usize,
    /// Axial planes times TOF bins
    pub planes: usize,
}

impl SinogramShape {
    pub fn len(&self) -> usize { self.rows * self.cols * self.planes }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[derive(Clone, Debug)]
pub enum Measurements {
    /// Counts per sinogram bin, TOF bin varying slowest
    Sinogram { layout: SinogramLayout, counts: Vec<f32>, tof_bins: usize },
    Indexed  { events: Vec<IndexedEvent>, tof_bins: usize },
}

impl Measurements {

    pub fn len(&self) -> usize {
        match self {
            Self::Sinogram { counts, .. } => counts.len(),
            Self::Indexed  { events, .. } => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn tof_bins(&self) -> usize {
        match self { Self::Sinogram { tof_bins, .. } | Self::Indexed { tof_bins, .. } => *tof_bins }
    }

    pub fn is_index_based(&self) -> bool { matches!(self, Self::Indexed { .. }) }

    #[inline]
    pub fn value(&self, i: usize) -> f32 {
        match self {
            Self::Sinogram { counts, .. } => counts[i],
            Self::Indexed  { events, .. } => events[i].weight,
        }
    }

    pub fn values(&self, indices: &[usize]) -> Vec<f32> {
        indices.iter().map(|&i| self.value(i)).collect()
    }

    pub fn total(&self) -> f64 {
        (0..self.len()).map(|i| self.value(i) as f64).sum()
    }

    pub fn lor(&self, scanner: &ScannerGeometry, i: usize) -> LOR {
        match self {
            Self::Sinogram { layout, tof_bins, .. } => {
                let n = layout.n_bins();
                let lor = layout.lor(scanner, i % n);
                if *tof_bins > 1 { lor.with_tof_bin((i / n) as u16) } else { lor }
            }
            Self::Indexed { events, tof_bins } => {
                let IndexedEvent { pair: DetectorPair { transaxial, axial }, tof_bin, .. } = events[i];
                let p1 = scanner.detector(transaxial[0] as usize, axial[0] as usize);
                let p2 = scanner.detector(transaxial[1] as usize, axial[1] as usize);
                let lor = LOR::new(p1, p2);
                if *tof_bins > 1 { lor.with_tof_bin(tof_bin) } else { lor }
            }
        }
    }

    pub fn lors(&self, scanner: &ScannerGeometry, indices: &[usize]) -> Vec<LOR> {
        indices.iter().map(|&i| self.lor(scanner, i)).collect()
    }

    pub fn shape(&self) -> Option<SinogramShape> {
        match self {
            Self::Sinogram { layout, tof_bins, .. } => Some(SinogramShape {
                rows: layout.n_dist(), cols: layout.n_ang(), planes: layout.n_planes() * tof_bins,
            }),
            Self::Indexed { .. } => None,
        }
    }

    /// Check that the data can be reconstructed with `scanner`. Negative
    /// values are accepted only as index-based delayed events.
    pub fn validate(&self, scanner: &ScannerGeometry) -> Result<()> {
        if self.tof_bins() == 0 { return Err(measurement_error!("zero TOF bins")) }
        match self {
            Self::Sinogram { layout, counts, tof_bins } => {
                let expected = layout.n_bins() * tof_bins;
                if counts.len() != expected {
                    return Err(measurement_error!(
                        "sinogram has {} bins, layout needs {} x {} x {} x {} TOF = {expected}",
                        counts.len(), layout.n_dist(), layout.n_ang(), layout.n_planes(), tof_bins))
                }
                if let Some(i) = counts.iter().position(|c| !c.is_finite() || *c < 0.0) {
                    return Err(measurement_error!(
                        "sinogram bin {i} holds {}: negative counts are accepted only in index-based mode", counts[i]))
                }
            }
            Self::Indexed { events, tof_bins } => {
                let (n_tr, n_ax) = (scanner.det_w_pseudo() as u32, scanner.rings() as u32);
                for (i, e) in events.iter().enumerate() {
                    let DetectorPair { transaxial, axial } = e.pair;
                    if transaxial.iter().any(|&t| t >= n_tr) || axial.iter().any(|&a| a >= n_ax) {
                        return Err(measurement_error!(
                            "event {i}: detectors {transaxial:?}/{axial:?} outside {n_tr} x {n_ax} table"))
                    }
                    if transaxial.iter().any(|&t| scanner.is_pseudo(t as usize)) {
                        return Err(measurement_error!("event {i} involves a pseudo-detector"))
                    }
                    if transaxial[0] == transaxial[1] && axial[0] == axial[1] {
                        return Err(measurement_error!("event {i} joins a detector to itself"))
                    }
                    if e.tof_bin as usize >= *tof_bins {
                        return Err(measurement_error!("event {i}: TOF bin {} not below {tof_bins}", e.tof_bin))
                    }
                    if !e.weight.is_finite() {
                        return Err(measurement_error!("event {i} has weight {}", e.weight))
                    }
                }
            }
        }
        Ok(())
    }

    /// Accumulate index-based events into a sinogram. Events outside the
    /// layout's ring-difference range are dropped; the number dropped is
    /// returned alongside.
    pub fn to_sinogram(&self, layout: &SinogramLayout) -> Result<(Measurements, usize)> {
        let Self::Indexed { events, tof_bins } = self else {
            return Err(measurement_error!("data are already a sinogram"))
        };
        let n = layout.n_bins();
        let mut counts = vec![0.0; n * tof_bins];
        let mut dropped = 0;
        for e in events {
            let DetectorPair { transaxial: [t1, t2], axial: [a1, a2] } = e.pair;
            match layout.bin_of_pair((t1 as usize, a1 as usize), (t2 as usize, a2 as usize)) {
                Some(bin) => counts[bin + n * e.tof_bin as usize] += e.weight,
                None => dropped += 1,
            }
        }
        Ok((Measurements::Sinogram { layout: layout.clone(), counts, tof_bins: *tof_bins }, dropped))
    }
}
