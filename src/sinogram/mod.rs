//! Sinogram layout: the mapping between sinogram bins and detector pairs.
//!
//! A bin is addressed by `(dist, ang, plane)`: the radial distance of its LOR
//! from the scanner axis, its transaxial angle, and its axial plane. Planes
//! are built from ring pairs, which are grouped into segments by ring
//! difference (axial compression, controlled by `span`) and, within a
//! segment, by axial position (`r1 + r2`).
//!
//! Bins are stored with `dist` varying fastest and `plane` slowest.

use std::collections::{BTreeMap, HashMap};

use crate::config_error;
use crate::error::Result;
use crate::lor::LOR;
use crate::scanner::ScannerGeometry;
use geometry::Point;

/// One axial plane of the sinogram
#[derive(Clone, Debug, PartialEq)]
pub struct Plane {
    /// Ring pairs contributing to this plane, `(ring of first detector, ring
    /// of second detector)`
    pub ring_pairs: Vec<(usize, usize)>,
    pub segment: i32,
}

#[derive(Clone, Debug)]
pub struct SinogramLayout {
    n_dist: usize,
    n_ang: usize,
    det_w_pseudo: usize,
    span: usize,
    planes: Vec<Plane>,
    segment_table: Vec<usize>,
    plane_of_rings: HashMap<(usize, usize), usize>,
}

impl SinogramLayout {

    pub fn new(scanner: &ScannerGeometry, n_dist: usize, span: usize, ring_difference: usize) -> Result<Self> {
        let rings = scanner.rings();
        let det_w_pseudo = scanner.det_w_pseudo();
        if span == 0 || span % 2 == 0 {
            return Err(config_error!("span must be odd, got {span}"))
        }
        if ring_difference >= rings {
            return Err(config_error!("maximum ring difference {ring_difference} needs more than {rings} rings"))
        }
        if det_w_pseudo < 4 || det_w_pseudo % 2 != 0 {
            return Err(config_error!("sinograms need an even number of detectors per ring, got {det_w_pseudo}"))
        }
        let half = (det_w_pseudo / 2) as i64;
        let lowest  = half - (n_dist / 2) as i64;
        let highest = half + (n_dist - n_dist / 2) as i64 - 1;
        if n_dist == 0 || lowest < 1 || highest > det_w_pseudo as i64 - 1 {
            return Err(config_error!("{n_dist} radial bins do not fit {det_w_pseudo} detectors per ring"))
        }

        // Group ring pairs by (segment order, axial position)
        let mut groups: BTreeMap<(usize, usize), (i32, Vec<(usize, usize)>)> = BTreeMap::new();
        for r1 in 0..rings {
            for r2 in 0..rings {
                let d = r2 as i32 - r1 as i32;
                if d.unsigned_abs() as usize > ring_difference { continue }
                let segment = segment_of(d, span);
                groups.entry((segment_order(segment), r1 + r2))
                    .or_insert_with(|| (segment, vec![]))
                    .1.push((r1, r2));
            }
        }
        let planes: Vec<Plane> = groups.into_values()
            .map(|(segment, ring_pairs)| Plane { ring_pairs, segment })
            .collect();

        let mut segment_table: Vec<usize> = vec![];
        let mut previous = None;
        for plane in &planes {
            match segment_table.last_mut() {
                Some(count) if previous == Some(plane.segment) => *count += 1,
                _ => { segment_table.push(1); previous = Some(plane.segment) }
            }
        }

        let plane_of_rings = planes.iter().enumerate()
            .flat_map(|(n, p)| p.ring_pairs.iter().map(move |&rs| (rs, n)))
            .collect();

        log::debug!("sinogram: {n_dist} x {} x {} planes, segments {:?}", det_w_pseudo / 2, planes.len(), segment_table);
        Ok(Self { n_dist, n_ang: det_w_pseudo / 2, det_w_pseudo, span, planes, segment_table, plane_of_rings })
    }

    pub fn n_dist  (&self) -> usize { self.n_dist }
    pub fn n_ang   (&self) -> usize { self.n_ang }
    pub fn n_planes(&self) -> usize { self.planes.len() }
    pub fn span    (&self) -> usize { self.span }
    pub fn planes  (&self) -> &[Plane] { &self.planes }
    pub fn segment_table(&self) -> &[usize] { &self.segment_table }

    /// Number of bins in one (non-TOF) sinogram
    pub fn n_bins(&self) -> usize { self.n_dist * self.n_ang * self.planes.len() }

    pub fn bin_index(&self, dist: usize, ang: usize, plane: usize) -> usize {
        dist + self.n_dist * (ang + self.n_ang * plane)
    }

    pub fn bin_coordinates(&self, bin: usize) -> (usize, usize, usize) {
        let dist = bin % self.n_dist;
        let rest = bin / self.n_dist;
        (dist, rest % self.n_ang, rest / self.n_ang)
    }

    /// Transaxial detectors at the ends of the LORs of `(dist, ang)`
    pub fn detector_pair(&self, dist: usize, ang: usize) -> (usize, usize) {
        let n = self.det_w_pseudo as i64;
        let separation = n / 2 + dist as i64 - (self.n_dist / 2) as i64;
        let a = ang as i64;
        let i = a + (separation + 1) / 2;
        let j = a - separation / 2;
        (i.rem_euclid(n) as usize, j.rem_euclid(n) as usize)
    }

    /// The bin containing the LOR between detectors `(tr1, r1)` and
    /// `(tr2, r2)`, if the layout covers it.
    pub fn bin_of_pair(&self, (tr1, r1): (usize, usize), (tr2, r2): (usize, usize)) -> Option<usize> {
        let n = self.det_w_pseudo as i64;
        let half = n / 2;
        [((tr1, r1), (tr2, r2)), ((tr2, r2), (tr1, r1))].into_iter().find_map(|((i, ri), (j, rj))| {
            let separation = (i as i64 - j as i64).rem_euclid(n);
            let dist = separation - half + (self.n_dist / 2) as i64;
            let ang = (i as i64 - (separation + 1) / 2).rem_euclid(n);
            if !(0..self.n_dist as i64).contains(&dist) || ang >= half { return None }
            let plane = *self.plane_of_rings.get(&(ri, rj))?;
            Some(self.bin_index(dist as usize, ang as usize, plane))
        })
    }

    /// The LOR of `bin`. Bins whose detectors include a pseudo-detector get a
    /// degenerate LOR.
    pub fn lor(&self, scanner: &ScannerGeometry, bin: usize) -> LOR {
        let (dist, ang, plane) = self.bin_coordinates(bin);
        let (i, j) = self.detector_pair(dist, ang);
        if scanner.is_pseudo(i) || scanner.is_pseudo(j) { return LOR::degenerate() }
        let z = scanner.axial_coordinates();
        let pairs = &self.planes[plane].ring_pairs;
        let count = pairs.len() as f32;
        let z1 = pairs.iter().map(|&(r1, _)| z[r1]).sum::<f32>() / count;
        let z2 = pairs.iter().map(|&(_, r2)| z[r2]).sum::<f32>() / count;
        let (x1, y1) = scanner.transaxial_coordinates()[i];
        let (x2, y2) = scanner.transaxial_coordinates()[j];
        LOR::new(Point::new(x1, y1, z1), Point::new(x2, y2, z2))
    }
}

/// Segment number of ring difference `d`: segment 0 holds `|d| <= span/2`,
/// each further segment the next `span` differences.
fn segment_of(d: i32, span: usize) -> i32 {
    let span = span as i32;
    d.signum() * ((d.abs() + span / 2) / span)
}

/// Segments are stored in the order 0, +1, -1, +2, -2, ...
fn segment_order(segment: i32) -> usize {
    match segment {
        0 => 0,
        s if s > 0 => 2 * s as usize - 1,
        s => 2 * s.unsigned_abs() as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScannerParameters;
    use float_eq::assert_float_eq;
    use rstest::rstest;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    fn scanner(rings: usize, pseudo: usize) -> ScannerGeometry {
        ScannerGeometry::new(ScannerParameters {
            blocks_per_ring: 8, cryst_per_block: 4, cryst_per_block_axial: rings,
            pseudo_per_block: pseudo, pitch_transaxial: 4.0, pitch_axial: 4.0, diameter: 100.0,
            ..ScannerParameters::default()
        }).unwrap()
    }

    #[rstest(/**/ d, span, segment,
             case( 0, 1,  0), case( 3, 1,  3), case(-2, 1, -2),
             case( 1, 3,  0), case(-1, 3,  0), case( 2, 3,  1), case( 4, 3,  1),
             case( 5, 3,  2), case(-5, 3, -2), case( 3, 7,  0), case( 4, 7,  1),
    )]
    fn segments(d: i32, span: usize, segment: i32) {
        assert_eq!(segment_of(d, span), segment);
    }

    #[test]
    fn span_one_has_a_plane_per_ring_pair() {
        let layout = SinogramLayout::new(&scanner(4, 0), 15, 1, 3).unwrap();
        assert_eq!(layout.n_planes(), 16);
        assert_eq!(layout.segment_table(), &[4, 3, 3, 2, 2, 1, 1]);
        assert!(layout.planes().iter().all(|p| p.ring_pairs.len() == 1));
        assert_eq!(layout.planes()[0].ring_pairs, vec![(0, 0)]);
        assert_eq!(layout.planes()[4].segment, 1);
    }

    #[test]
    fn span_three_compresses_oblique_planes() {
        let layout = SinogramLayout::new(&scanner(4, 0), 15, 3, 3).unwrap();
        // Segment 0 holds differences -1, 0, 1 grouped by r1 + r2: sums 0..=6
        assert_eq!(layout.segment_table()[0], 7);
        assert_eq!(layout.planes()[1].ring_pairs, vec![(0, 1), (1, 0)]);
        let total: usize = layout.planes().iter().map(|p| p.ring_pairs.len()).sum();
        assert_eq!(total, 16);
    }

    #[test]
    fn central_bin_passes_through_axis() {
        let scanner = scanner(2, 0);
        let layout = SinogramLayout::new(&scanner, 15, 1, 1).unwrap();
        for ang in 0..layout.n_ang() {
            let lor = layout.lor(&scanner, layout.bin_index(7, ang, 0));
            let m = lor.midpoint();
            assert_float_eq!([m.x, m.y], [0.0, 0.0], abs <= [1e-3, 1e-3]);
        }
    }

    #[test]
    fn oblique_plane_lor_spans_rings() {
        let scanner = scanner(2, 0);
        let layout = SinogramLayout::new(&scanner, 15, 1, 1).unwrap();
        // Planes: (0,0), (1,1), (0,1), (1,0)
        let lor = layout.lor(&scanner, layout.bin_index(3, 5, 2));
        assert_float_eq!([lor.p1.z, lor.p2.z], [-2.0, 2.0], abs <= [1e-6, 1e-6]);
    }

    #[test]
    fn bins_map_back_from_their_detector_pairs() {
        let scanner = scanner(3, 0);
        let layout = SinogramLayout::new(&scanner, 11, 1, 2).unwrap();
        for bin in 0..layout.n_bins() {
            let (dist, ang, plane) = layout.bin_coordinates(bin);
            let (i, j) = layout.detector_pair(dist, ang);
            let (r1, r2) = layout.planes()[plane].ring_pairs[0];
            assert_eq!(layout.bin_of_pair((i, r1), (j, r2)), Some(bin));
        }
    }

    #[test]
    fn pseudo_detector_bins_are_degenerate() {
        let scanner = scanner(1, 1);
        let layout = SinogramLayout::new(&scanner, 11, 1, 0).unwrap();
        let degenerate = (0..layout.n_bins()).filter(|&b| layout.lor(&scanner, b).is_degenerate()).count();
        assert!(degenerate > 0);
        assert!(degenerate < layout.n_bins());
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        let scanner = scanner(2, 0);
        assert!(SinogramLayout::new(&scanner, 15, 2, 1).is_err());
        assert!(SinogramLayout::new(&scanner, 15, 1, 2).is_err());
        assert!(SinogramLayout::new(&scanner, 40, 1, 1).is_err());
    }
}
