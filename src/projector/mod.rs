//! Forward and backward projection.
//!
//! The system matrix is never stored: each of its rows (the voxel weights of
//! one LOR) is generated on the fly by a kernel, used, and thrown away. Rows
//! are built into a per-thread `SystemMatrixRow` buffer which is reused
//! across LORs, because allocating one per LOR had a noticeable cost.

pub mod accumulate;
pub mod siddon;
pub mod orthogonal;
pub mod volume;
pub mod interpolation;

pub use accumulate::{Accumulator, Precision};
pub use siddon::Siddon;
pub use orthogonal::Orthogonal;
pub use volume::Volume;
pub use interpolation::Interpolation;

use rayon::prelude::*;

use crate::{
    LOR,
    config_error,
    error::Result,
    fov::FOV,
    image::{ImageData, ImageVolume, Region, VolumeLayout},
    tof::{TofBinning, TofWindow},
};

/// Sparse storage of one row of the system matrix: `(voxel index, weight)`
/// pairs, indices into the whole image arena.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemMatrixRow(pub Vec<(usize, f32)>);

impl SystemMatrixRow {
    pub fn with_capacity(n: usize) -> Self { Self(Vec::with_capacity(n)) }

    #[inline] pub fn push(&mut self, index: usize, weight: f32) { self.0.push((index, weight)) }

    pub fn clear(&mut self) { self.0.clear() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, (usize, f32)>> { self.0.iter().copied() }

    /// Σ weight · image
    #[inline]
    pub fn dot(&self, image: &[f32]) -> f32 {
        self.0.iter().map(|&(i, w)| w * image[i]).sum()
    }
}

impl<'a> IntoIterator for &'a SystemMatrixRow {
    type Item = (usize, f32);
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, (usize, f32)>>;
    fn into_iter(self) -> Self::IntoIter { self.iter() }
}

/// A way of generating system matrix rows, one image region at a time.
pub trait SystemMatrix {
    /// Anything worth computing once per region rather than once per LOR
    type Data: Clone + std::fmt::Debug + Send + Sync;

    fn data(&self, fov: &FOV) -> Self::Data;

    /// Append the weights of the voxels of `region` which contribute to `lor`
    fn update_system_matrix_row(
        &self,
        row: &mut SystemMatrixRow,
        lor: &LOR,
        region: &Region,
        data: &Self::Data,
        tof: Option<&TofWindow>,
    );

    /// Typical upper bound on the number of voxels in one row
    fn capacity(&self, fov: &FOV) -> usize;
}

/// The closed set of projection kernels
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Kernel {
    Siddon(Siddon),
    Orthogonal(Orthogonal),
    Volume(Volume),
    Interpolation(Interpolation),
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Siddon       (_) => "siddon",
            Kernel::Orthogonal   (_) => "orthogonal",
            Kernel::Volume       (_) => "volume",
            Kernel::Interpolation(_) => "interpolation",
        }
    }
}

impl Default for Kernel {
    fn default() -> Self { Kernel::Siddon(Siddon::single_ray()) }
}

/// A kernel together with its per-region data
#[derive(Clone, Debug)]
struct Prepared<K: SystemMatrix> {
    kernel: K,
    data: Vec<K::Data>,
}

impl<K: SystemMatrix> Prepared<K> {
    fn new(kernel: K, layout: &VolumeLayout) -> Self {
        let data = layout.regions().iter().map(|r| kernel.data(&r.fov)).collect();
        Self { kernel, data }
    }

    fn update(&self, row: &mut SystemMatrixRow, lor: &LOR, layout: &VolumeLayout, tof: Option<&TofWindow>) {
        for (region, data) in layout.regions().iter().zip(&self.data) {
            self.kernel.update_system_matrix_row(row, lor, region, data, tof);
        }
    }

    fn capacity(&self, layout: &VolumeLayout) -> usize {
        layout.regions().iter().map(|r| self.kernel.capacity(&r.fov)).sum()
    }
}

#[derive(Clone, Debug)]
enum PreparedKernel {
    Siddon       (Prepared<Siddon>),
    Orthogonal   (Prepared<Orthogonal>),
    Volume       (Prepared<Volume>),
    Interpolation(Prepared<Interpolation>),
}

impl PreparedKernel {
    fn new(kernel: Kernel, layout: &VolumeLayout) -> Self {
        match kernel {
            Kernel::Siddon       (k) => Self::Siddon       (Prepared::new(k, layout)),
            Kernel::Orthogonal   (k) => Self::Orthogonal   (Prepared::new(k, layout)),
            Kernel::Volume       (k) => Self::Volume       (Prepared::new(k, layout)),
            Kernel::Interpolation(k) => Self::Interpolation(Prepared::new(k, layout)),
        }
    }

    /// Replace the contents of `row` with the row of `lor`
    fn row(&self, row: &mut SystemMatrixRow, lor: &LOR, layout: &VolumeLayout, tof: Option<&TofWindow>) {
        row.clear();
        if lor.is_degenerate() { return }
        match self {
            Self::Siddon       (p) => p.update(row, lor, layout, tof),
            Self::Orthogonal   (p) => p.update(row, lor, layout, tof),
            Self::Volume       (p) => p.update(row, lor, layout, tof),
            Self::Interpolation(p) => p.update(row, lor, layout, tof),
        }
    }

    fn capacity(&self, layout: &VolumeLayout) -> usize {
        match self {
            Self::Siddon       (p) => p.capacity(layout),
            Self::Orthogonal   (p) => p.capacity(layout),
            Self::Volume       (p) => p.capacity(layout),
            Self::Interpolation(p) => p.capacity(layout),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction { Forward, Backward }

/// Default number of LORs handed to a rayon job
pub const DEFAULT_JOB_SIZE: usize = 256;

/// Forward and backward projection of one image layout, with a kernel for
/// each direction.
#[derive(Clone, Debug)]
pub struct Projector {
    kernels: (Kernel, Kernel),
    forward: PreparedKernel,
    backward: PreparedKernel,
    layout: VolumeLayout,
    tof: TofBinning,
    precision: Precision,
    job_size: usize,
}

impl Projector {

    /// Different kernels in the two directions are supported only when one of
    /// them is Siddon.
    pub fn new(forward: Kernel, backward: Kernel, layout: VolumeLayout, tof: TofBinning, precision: Precision) -> Result<Self> {
        let mixed = std::mem::discriminant(&forward) != std::mem::discriminant(&backward);
        let siddon = |k: &Kernel| matches!(k, Kernel::Siddon(_));
        if mixed && !siddon(&forward) && !siddon(&backward) {
            return Err(config_error!(
                "unsupported kernel combination: {} forward with {} backward", forward.name(), backward.name()))
        }
        validate_kernel(&forward)?;
        validate_kernel(&backward)?;
        log::debug!("projector: {} forward, {} backward, {} region(s), {} TOF bin(s)",
                    forward.name(), backward.name(), layout.n_regions(), tof.bins());
        Ok(Self {
            kernels: (forward, backward),
            forward : PreparedKernel::new(forward , &layout),
            backward: PreparedKernel::new(backward, &layout),
            layout, tof, precision,
            job_size: DEFAULT_JOB_SIZE,
        })
    }

    /// Same kernel in both directions
    pub fn symmetric(kernel: Kernel, layout: VolumeLayout, tof: TofBinning, precision: Precision) -> Result<Self> {
        Self::new(kernel, kernel, layout, tof, precision)
    }

    pub fn with_job_size(self, job_size: usize) -> Self { Self { job_size: job_size.max(1), ..self } }

    pub fn layout   (&self) -> &VolumeLayout { &self.layout }
    pub fn tof      (&self) -> &TofBinning   { &self.tof }
    pub fn precision(&self) -> Precision     { self.precision }
    pub fn kernels  (&self) -> (Kernel, Kernel) { self.kernels }

    fn window(&self, lor: &LOR) -> Option<TofWindow> {
        if !self.tof.is_enabled() { return None }
        lor.tof_bin.map(|bin| self.tof.window(bin as usize, lor.length()))
    }

    fn kernel(&self, direction: Direction) -> &PreparedKernel {
        match direction {
            Direction::Forward  => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    fn buffer(&self, direction: Direction) -> SystemMatrixRow {
        SystemMatrixRow::with_capacity(self.kernel(direction).capacity(&self.layout))
    }

    /// The system matrix row of `lor`
    pub fn row(&self, direction: Direction, lor: &LOR) -> SystemMatrixRow {
        let mut row = SystemMatrixRow::default();
        self.kernel(direction).row(&mut row, lor, &self.layout, self.window(lor).as_ref());
        row
    }

    pub fn forward(&self, image: &ImageVolume, lors: &[LOR]) -> Vec<f32> {
        self.forward_data(&image.data, lors)
    }

    /// Expected measurement of every LOR, given the arena `image`
    pub fn forward_data(&self, image: &[f32], lors: &[LOR]) -> Vec<f32> {
        lors.par_iter()
            .with_min_len(self.job_size)
            .map_init(
                || self.buffer(Direction::Forward),
                |row, lor| {
                    self.forward.row(row, lor, &self.layout, self.window(lor).as_ref());
                    row.dot(image)
                })
            .collect()
    }

    /// Distribute `values[i]` along `lors[i]`, for every `i`. All LORs add
    /// into one shared arena. Voxels outside `mask` receive nothing.
    pub fn backward(&self, values: &[f32], lors: &[LOR], mask: Option<&[bool]>) -> ImageData {
        let arena = Accumulator::zeros(self.precision, self.layout.len());
        lors.par_iter()
            .zip(values.par_iter())
            .with_min_len(self.job_size)
            .for_each_init(
                || self.buffer(Direction::Backward),
                |row, (lor, &value)| {
                    if value == 0.0 { return }
                    self.backward.row(row, lor, &self.layout, self.window(lor).as_ref());
                    for (i, w) in &*row {
                        if mask.map_or(true, |m| m[i]) { arena.add(i, w * value) }
                    }
                });
        arena.into_vec()
    }

    /// Back-projection of unit values, or of `weights` if given
    pub fn sensitivity(&self, lors: &[LOR], weights: Option<&[f32]>, mask: Option<&[bool]>) -> ImageData {
        match weights {
            Some(w) => self.backward(w, lors, mask),
            None    => self.backward(&vec![1.0; lors.len()], lors, mask),
        }
    }
}

fn validate_kernel(kernel: &Kernel) -> Result<()> {
    match kernel {
        Kernel::Siddon(s) if s.n_rays() > 1
            && !(s.crystal_width_transaxial >= 0.0 && s.crystal_width_axial >= 0.0) =>
            Err(config_error!("multi-ray crystal widths must not be negative")),
        Kernel::Orthogonal(o) if !(o.width > 0.0) =>
            Err(config_error!("orthogonal tube width must be positive, got {} mm", o.width)),
        Kernel::Volume(v) if !(v.tube_radius > 0.0 && v.voxel_radius > 0.0) =>
            Err(config_error!("volume kernel needs positive tube and voxel radii, got {} mm and {}",
                              v.tube_radius, v.voxel_radius)),
        Kernel::Interpolation(i) if !(i.step > 0.0) =>
            Err(config_error!("interpolation step must be positive, got {}", i.step)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use geometry::{Point, Vector};
    use rstest::rstest;

    fn fov() -> FOV { FOV::from_mm([40.0, 40.0, 20.0], [10, 10, 5]) }

    fn siddon() -> Kernel { Kernel::Siddon(Siddon::single_ray()) }

    fn lors() -> Vec<LOR> {
        vec![
            LOR::new(Point::new(-50.0,   0.0,  0.0), Point::new( 50.0,  0.0,  0.0)),
            LOR::new(Point::new(-50.0, -30.0,  5.0), Point::new( 50.0, 25.0, -3.0)),
            LOR::new(Point::new(  3.0, -50.0,  1.0), Point::new( -7.0, 50.0,  1.0)),
            LOR::new(Point::new(-50.0,  40.0,  0.0), Point::new( 50.0, 45.0,  0.0)), // misses
        ]
    }

    #[rstest(/**/ forward, backward, ok,
             case(Kernel::Orthogonal(Orthogonal::new_3d(2.0)), siddon(), true),
             case(siddon(), Kernel::Interpolation(Interpolation { step: 0.5 }), true),
             case(Kernel::Orthogonal(Orthogonal::new_3d(2.0)), Kernel::Interpolation(Interpolation { step: 0.5 }), false),
             case(Kernel::Volume(Volume { tube_radius: 2.0, voxel_radius: 1.0 }),
                  Kernel::Volume(Volume { tube_radius: 3.0, voxel_radius: 1.0 }), true),
             case(Kernel::Orthogonal(Orthogonal::new_3d(0.0)), siddon(), false),
    )]
    fn kernel_combinations(forward: Kernel, backward: Kernel, ok: bool) {
        let result = Projector::new(forward, backward, VolumeLayout::single(fov()), TofBinning::disabled(), Precision::Double);
        assert_eq!(result.is_ok(), ok);
    }

    #[test]
    fn uniform_image_projects_to_chord_lengths() {
        let projector = Projector::symmetric(siddon(), VolumeLayout::single(fov()), TofBinning::disabled(), Precision::Double).unwrap();
        let image = ImageVolume::ones(projector.layout().clone());
        let lors = lors();
        let projected = projector.forward(&image, &lors);
        for (lor, p) in lors.iter().zip(projected) {
            assert_float_eq!(p, fov().aabb().chord_length(lor.p1, lor.p2), abs <= 1e-3);
        }
    }

    #[test]
    fn multi_region_ray_sum_covers_outer_box() {
        let layout = VolumeLayout::multi_resolution(fov(), Vector::new(30.0, 30.0, 20.0), 0.5).unwrap();
        let projector = Projector::symmetric(siddon(), layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
        let image = ImageVolume::ones(layout);
        let outer = geometry::AaBox::new(Point::origin(), Vector::new(30.0, 30.0, 20.0));
        let lors = lors();
        for (lor, p) in lors.iter().zip(projector.forward(&image, &lors)) {
            assert_float_eq!(p, outer.chord_length(lor.p1, lor.p2), abs <= 2e-3);
        }
    }

    #[test]
    fn degenerate_lor_has_empty_row() {
        let projector = Projector::symmetric(siddon(), VolumeLayout::single(fov()), TofBinning::disabled(), Precision::Double).unwrap();
        assert!(projector.row(Direction::Forward, &LOR::degenerate()).is_empty());
        let back = projector.backward(&[5.0], &[LOR::degenerate()], None);
        assert!(back.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn masked_voxels_receive_nothing() {
        let layout = VolumeLayout::single(fov());
        let projector = Projector::symmetric(siddon(), layout.clone(), TofBinning::disabled(), Precision::Single).unwrap();
        let mask: Vec<bool> = (0..layout.len()).map(|i| i % 2 == 0).collect();
        let lors = lors();
        let back = projector.backward(&[1.0, 2.0, 3.0, 4.0], &lors, Some(&mask));
        assert!(back.iter().zip(&mask).all(|(&v, &m)| m || v == 0.0));
        assert!(back.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn tof_rows_add_up_to_non_tof_row() {
        let tof = TofBinning::from_ps(11, 100.0, 0.0, 200.0).unwrap();
        let layout = VolumeLayout::single(fov());
        let plain = Projector::symmetric(siddon(), layout.clone(), TofBinning::disabled(), Precision::Double).unwrap();
        let timed = Projector::symmetric(siddon(), layout.clone(), tof, Precision::Double).unwrap();
        let image = ImageVolume::ones(layout);
        let lor = lors()[1];
        let per_bin: Vec<LOR> = (0..11).map(|b| lor.with_tof_bin(b)).collect();
        let total: f32 = timed.forward(&image, &per_bin).iter().sum();
        let expected = plain.forward(&image, &[lor])[0];
        assert_float_eq!(total, expected, rmax <= 0.02);
        // Without a bin, TOF is ignored
        assert_float_eq!(timed.forward(&image, &[lor])[0], expected, rmax <= 1e-6);
    }
}
