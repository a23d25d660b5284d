//! Detector geometry of a ring scanner.
//!
//! A ring is a polygon of flat module faces. Each face holds
//! `transaxial_multip` blocks side by side; each block holds
//! `cryst_per_block` crystals, optionally followed by pseudo-detector slots
//! (gaps between blocks, which produce no events but occupy a position in the
//! detector numbering and in sinograms). Axially, `linear_multip` blocks of
//! `cryst_per_block_axial` crystal rings are stacked, with optional extra gaps
//! after selected rings.
//!
//! Detectors are numbered transaxially face by face, counter-clockwise, and
//! the full table is ordered ring by ring.

use geometry::{Point, Vector};
use units::todo::Lengthf32;

use crate::config_error;
use crate::error::Result;

/// Scanner description, in mm.
#[derive(Clone, Debug, PartialEq)]
pub struct ScannerParameters {
    pub blocks_per_ring      : usize,
    pub cryst_per_block      : usize,
    pub cryst_per_block_axial: usize,
    pub linear_multip        : usize,
    pub transaxial_multip    : usize,
    /// Pseudo-detector slots at the end of each block
    pub pseudo_per_block     : usize,
    /// If given, must agree with `linear_multip * cryst_per_block_axial`
    pub rings                : Option<usize>,
    /// Distance between adjacent crystal centres, transaxially
    pub pitch_transaxial     : Lengthf32,
    /// Distance between adjacent ring centres
    pub pitch_axial          : Lengthf32,
    /// Diameter of the circle inscribed in the polygon of module faces
    pub diameter             : Lengthf32,
    /// Indices of the rings after which an additional gap occurs
    pub ring_gaps            : Vec<usize>,
    /// Width of each ring gap; one axial pitch if not given
    pub ring_gap_width       : Option<Lengthf32>,
    /// Mean depth of interaction: detection points are moved this far
    /// inwards, towards the scanner axis
    pub doi                  : Lengthf32,
}

impl Default for ScannerParameters {
    fn default() -> Self {
        Self {
            blocks_per_ring: 16,
            cryst_per_block: 8,
            cryst_per_block_axial: 8,
            linear_multip: 1,
            transaxial_multip: 1,
            pseudo_per_block: 0,
            rings: None,
            pitch_transaxial: 4.0,
            pitch_axial: 4.0,
            diameter: 200.0,
            ring_gaps: vec![],
            ring_gap_width: None,
            doi: 0.0,
        }
    }
}

/// Fully expanded detector coordinates.
#[derive(Clone, Debug)]
pub struct ScannerGeometry {
    params: ScannerParameters,
    /// xy of every transaxial slot, pseudo-detectors included
    transaxial: Vec<(Lengthf32, Lengthf32)>,
    /// Unit vector along the crystal face, for every transaxial slot
    tangents: Vec<(Lengthf32, Lengthf32)>,
    pseudo: Vec<bool>,
    /// z of every ring
    axial: Vec<Lengthf32>,
}

impl ScannerGeometry {

    pub fn new(params: ScannerParameters) -> Result<Self> {
        validate(&params)?;
        let ScannerParameters {
            blocks_per_ring, cryst_per_block, transaxial_multip, pseudo_per_block,
            pitch_transaxial, diameter, doi, ..
        } = params;

        let n_faces = blocks_per_ring / transaxial_multip;
        let slots_per_block = cryst_per_block + pseudo_per_block;
        let slots_per_face = slots_per_block * transaxial_multip;
        let face_distance = diameter / 2.0;

        let mut transaxial = Vec::with_capacity(n_faces * slots_per_face);
        let mut tangents   = Vec::with_capacity(n_faces * slots_per_face);
        let mut pseudo     = Vec::with_capacity(n_faces * slots_per_face);
        for face in 0..n_faces {
            let phi = std::f32::consts::TAU * face as f32 / n_faces as f32;
            let (s, c) = phi.sin_cos();
            for slot in 0..slots_per_face {
                let t = (slot as f32 - (slots_per_face as f32 - 1.0) / 2.0) * pitch_transaxial;
                let (x, y) = (face_distance * c - t * s, face_distance * s + t * c);
                // DOI moves the detection point straight towards the axis
                let shrink = 1.0 - doi / x.hypot(y);
                transaxial.push((x * shrink, y * shrink));
                tangents.push((-s, c));
                pseudo.push(slot % slots_per_block >= cryst_per_block);
            }
        }

        let n_rings = params.linear_multip * params.cryst_per_block_axial;
        let mut axial = Vec::with_capacity(n_rings);
        let gap = params.ring_gap_width.unwrap_or(params.pitch_axial);
        let mut z = 0.0;
        for ring in 0..n_rings {
            axial.push(z);
            z += params.pitch_axial;
            if params.ring_gaps.contains(&ring) { z += gap }
        }
        let middle = axial.last().copied().unwrap_or(0.0) / 2.0;
        for z in &mut axial { *z -= middle }

        log::debug!("scanner: {} faces, {} transaxial slots ({} pseudo), {} rings",
                    n_faces, transaxial.len(), pseudo.iter().filter(|&&p| p).count(), n_rings);
        Ok(Self { params, transaxial, tangents, pseudo, axial })
    }

    pub fn parameters(&self) -> &ScannerParameters { &self.params }

    /// Transaxial slots per ring, including pseudo-detectors
    pub fn det_w_pseudo(&self) -> usize { self.transaxial.len() }

    /// Real detectors per ring
    pub fn det_per_ring(&self) -> usize { self.pseudo.iter().filter(|&&p| !p).count() }

    pub fn rings(&self) -> usize { self.axial.len() }

    pub fn n_detectors(&self) -> usize { self.det_w_pseudo() * self.rings() }

    pub fn is_pseudo(&self, transaxial: usize) -> bool { self.pseudo[transaxial] }

    pub fn transaxial_coordinates(&self) -> &[(Lengthf32, Lengthf32)] { &self.transaxial }
    pub fn axial_coordinates     (&self) -> &[Lengthf32]               { &self.axial      }

    pub fn detector(&self, transaxial: usize, ring: usize) -> Point {
        let (x, y) = self.transaxial[transaxial];
        Point::new(x, y, self.axial[ring])
    }

    /// Direction along the face of the crystal at `transaxial`
    pub fn tangent(&self, transaxial: usize) -> Vector {
        let (x, y) = self.tangents[transaxial];
        Vector::new(x, y, 0.0)
    }

    /// All detector positions, ring by ring
    pub fn table(&self) -> Vec<Point> {
        itertools::iproduct!(0..self.rings(), 0..self.det_w_pseudo())
            .map(|(ring, tr)| self.detector(tr, ring))
            .collect()
    }

    /// Radius at which the detection points lie, at the centre of a face
    pub fn radius(&self) -> Lengthf32 { self.params.diameter / 2.0 - self.params.doi }

    pub fn axial_extent(&self) -> Lengthf32 {
        self.axial.last().copied().unwrap_or(0.0) - self.axial.first().copied().unwrap_or(0.0)
    }
}

fn validate(p: &ScannerParameters) -> Result<()> {
    let counts = [
        ("blocks_per_ring"      , p.blocks_per_ring      ),
        ("cryst_per_block"      , p.cryst_per_block      ),
        ("cryst_per_block_axial", p.cryst_per_block_axial),
        ("linear_multip"        , p.linear_multip        ),
        ("transaxial_multip"    , p.transaxial_multip    ),
    ];
    for (name, n) in counts {
        if n == 0 { return Err(config_error!("{name} must be positive")) }
    }
    for (name, x) in [("pitch_transaxial", p.pitch_transaxial), ("pitch_axial", p.pitch_axial), ("diameter", p.diameter)] {
        if !(x > 0.0) { return Err(config_error!("{name} must be positive, got {x}")) }
    }
    if p.blocks_per_ring % p.transaxial_multip != 0 {
        return Err(config_error!("blocks_per_ring ({}) is not a multiple of transaxial_multip ({})",
                                 p.blocks_per_ring, p.transaxial_multip))
    }
    let rings = p.linear_multip * p.cryst_per_block_axial;
    if let Some(declared) = p.rings {
        if declared != rings {
            return Err(config_error!(
                "{declared} rings declared, but {} axial blocks of {} crystals make {rings}",
                p.linear_multip, p.cryst_per_block_axial))
        }
    }
    if let Some(bad) = p.ring_gaps.iter().find(|&&g| g + 1 >= rings) {
        return Err(config_error!("ring gap after ring {bad}, but there are only {rings} rings"))
    }
    if p.ring_gap_width.map_or(false, |w| w < 0.0) { return Err(config_error!("negative ring gap width")) }
    if !(p.doi >= 0.0 && p.doi < p.diameter / 2.0) {
        return Err(config_error!("depth of interaction {} outside [0, radius)", p.doi))
    }
    // Crystals on one face must not reach beyond the neighbouring faces
    let n_faces = p.blocks_per_ring / p.transaxial_multip;
    let face_width = (p.cryst_per_block + p.pseudo_per_block) as f32 * p.transaxial_multip as f32 * p.pitch_transaxial;
    let polygon_side = p.diameter * (std::f32::consts::PI / n_faces as f32).tan();
    if n_faces >= 3 && face_width > polygon_side * 1.0001 {
        return Err(config_error!("module face ({face_width} mm) wider than polygon side ({polygon_side} mm)"))
    }
    Ok(())
}
