//! Reconstructed images.
//!
//! An `ImageVolume` is a single flat arena of voxel values, partitioned into
//! one or more *regions*. Each region is a box of voxels with its own
//! `FOV`, living at some offset in the arena. The first region is always the
//! native-resolution FOV; further regions are the coarse slabs of an extended
//! FOV, which surround the native one without overlapping it.
//!
//! Algorithms never care about the partition: they see one vector. Only the
//! projectors (which must know where each voxel is) and the priors (which must
//! know which voxels are neighbours) look at the regions.

use std::ops::Range;

use geometry::{Point, Vector};
use units::todo::{Intensityf32, Lengthf32};

use crate::error::Result;
use crate::config_error;
use crate::fov::FOV;
use crate::index::{Index1_u, Index3_u, index3_to_1};

pub type ImageData = Vec<Intensityf32>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Region {
    pub fov: FOV,
    /// Position of this region's first voxel in the arena
    pub offset: usize,
}

impl Region {
    pub fn len(&self) -> usize { self.fov.n_voxels() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn range(&self) -> Range<usize> { self.offset..self.offset + self.len() }
}

/// The partition of the arena into regions.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeLayout {
    regions: Vec<Region>,
    len: usize,
}

impl VolumeLayout {

    pub fn single(fov: FOV) -> Self {
        let len = fov.n_voxels();
        Self { regions: vec![Region { fov, offset: 0 }], len }
    }

    /// Build from FOVs which must not overlap. The first one is the native
    /// region.
    pub fn from_fovs(fovs: impl IntoIterator<Item = FOV>) -> Result<Self> {
        let mut regions: Vec<Region> = vec![];
        let mut len = 0;
        for fov in fovs {
            if fov.n.iter().any(|&n| n == 0) {
                return Err(config_error!("region with zero voxels: {:?}", fov.n))
            }
            if let Some(other) = regions.iter().find(|r| r.fov.overlaps(&fov)) {
                return Err(config_error!("image regions overlap: {:?} and {:?}", other.fov, fov))
            }
            regions.push(Region { fov, offset: len });
            len += fov.n_voxels();
        }
        if regions.is_empty() { return Err(config_error!("image volume without regions")) }
        Ok(Self { regions, len })
    }

    /// The native `inner` FOV, surrounded by up to six coarse slabs which
    /// extend the covered volume to a box of half-widths `outer_half_width`,
    /// centred on the inner FOV. `scale` is the ratio of coarse to native
    /// resolution: 0.25 gives slab voxels four times as wide as native ones.
    ///
    /// The z-slabs cover the full transaxial extent of the outer box, the
    /// y-slabs the full x extent between them, and the x-slabs only what is
    /// left at the inner FOV's height and depth.
    pub fn multi_resolution(inner: FOV, outer_half_width: Vector, scale: f32) -> Result<Self> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(config_error!("multi-resolution scale must lie in (0, 1], got {scale}"))
        }
        let lo_in = inner.lower_corner();
        let hi_in = inner.centre + inner.half_width;
        let lo_out = inner.centre - outer_half_width;
        let hi_out = inner.centre + outer_half_width;
        for d in 0..3 {
            if outer_half_width[d] < inner.half_width[d] {
                return Err(config_error!("extended FOV smaller than native FOV along axis {d}"))
            }
        }
        let coarse = inner.voxel_size / scale;

        // Coarse voxel counts cover the slab extent exactly
        let slab = |lo: Point, hi: Point| -> Option<FOV> {
            let extent = hi - lo;
            if (0..3).any(|d| extent[d] <= 1e-4) { return None }
            let n = [0, 1, 2].map(|d| ((extent[d] / coarse[d]).round() as usize).max(1));
            Some(FOV::between(lo, hi, n))
        };
        let p = Point::new;
        let slabs = [
            // z below and above
            slab(p(lo_out.x, lo_out.y, lo_out.z), p(hi_out.x, hi_out.y, lo_in .z)),
            slab(p(lo_out.x, lo_out.y, hi_in .z), p(hi_out.x, hi_out.y, hi_out.z)),
            // y, at the inner FOV's z-range
            slab(p(lo_out.x, lo_out.y, lo_in .z), p(hi_out.x, lo_in .y, hi_in .z)),
            slab(p(lo_out.x, hi_in .y, lo_in .z), p(hi_out.x, hi_out.y, hi_in .z)),
            // x, at the inner FOV's y- and z-ranges
            slab(p(lo_out.x, lo_in .y, lo_in .z), p(lo_in .x, hi_in .y, hi_in .z)),
            slab(p(hi_in .x, lo_in .y, lo_in .z), p(hi_out.x, hi_in .y, hi_in .z)),
        ];
        Self::from_fovs(std::iter::once(inner).chain(slabs.into_iter().flatten()))
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn regions(&self) -> &[Region] { &self.regions }
    pub fn n_regions(&self) -> usize { self.regions.len() }

    /// The native-resolution region
    pub fn inner(&self) -> &Region { &self.regions[0] }

    /// Region number and position within that region, of arena index `i`
    pub fn region_of(&self, i: Index1_u) -> Option<(usize, Index1_u)> {
        self.regions.iter().enumerate()
            .find(|(_, r)| r.range().contains(&i))
            .map(|(n, r)| (n, i - r.offset))
    }

    /// Region and voxel containing `p`. The native region wins on shared faces.
    pub fn locate(&self, p: Point) -> Option<(usize, Index3_u)> {
        self.regions.iter().enumerate()
            .find_map(|(n, r)| r.fov.voxel_of(p).map(|i| (n, i)))
    }

    /// Arena index of voxel `i` in region `region`
    pub fn arena_index(&self, region: usize, i: Index3_u) -> Index1_u {
        let r = &self.regions[region];
        r.offset + index3_to_1(i, r.fov.n)
    }

    /// Bounding box of all regions, at native voxel pitch.
    pub fn native_grid(&self) -> FOV {
        let inner = self.inner().fov;
        let mut lo = inner.lower_corner();
        let mut hi = inner.centre + inner.half_width;
        for r in &self.regions[1..] {
            let (l, h) = (r.fov.lower_corner(), r.fov.centre + r.fov.half_width);
            for d in 0..3 { lo[d] = lo[d].min(l[d]); hi[d] = hi[d].max(h[d]); }
        }
        let n = [0, 1, 2].map(|d| ((hi[d] - lo[d]) / inner.voxel_size[d]).round().max(1.0) as usize);
        FOV::between(lo, hi, n)
    }

    /// The ranges of native-grid voxel indices covered by voxel `i` of
    /// `region`. For the native region each range has length one.
    pub fn native_indices_of(&self, region: usize, i: Index3_u) -> [Range<usize>; 3] {
        let grid = self.native_grid();
        let fov = self.regions[region].fov;
        let lo = fov.lower_corner() - grid.lower_corner();
        [0, 1, 2].map(|d| {
            let pitch = grid.voxel_size[d];
            let start = lo[d] + i[d] as Lengthf32 * fov.voxel_size[d];
            let stop  = start + fov.voxel_size[d];
            let a = (start / pitch + 1e-3).floor() as usize;
            let b = ((stop / pitch - 1e-3).ceil() as usize).min(grid.n[d]).max(a + 1);
            a..b
        })
    }
}

/// Voxel values over a `VolumeLayout`, with an optional mask restricting which
/// voxels may be updated.
#[derive(Clone, Debug)]
pub struct ImageVolume {
    layout: VolumeLayout,
    pub data: ImageData,
    mask: Option<Vec<bool>>,
}

impl ImageVolume {

    pub fn new(layout: VolumeLayout, data: ImageData) -> Result<Self> {
        if data.len() != layout.len() {
            return Err(config_error!(
                "image data length {} does not match volume of {} voxels", data.len(), layout.len()))
        }
        Ok(Self { layout, data, mask: None })
    }

    pub fn uniform(layout: VolumeLayout, value: Intensityf32) -> Self {
        let data = vec![value; layout.len()];
        Self { layout, data, mask: None }
    }

    pub fn ones (layout: VolumeLayout) -> Self { Self::uniform(layout, 1.0) }
    pub fn zeros(layout: VolumeLayout) -> Self { Self::uniform(layout, 0.0) }

    pub fn single(fov: FOV, data: ImageData) -> Result<Self> { Self::new(VolumeLayout::single(fov), data) }

    /// A copy of this image with different voxel values
    pub fn with_data(&self, data: ImageData) -> Result<Self> {
        let mut image = Self::new(self.layout.clone(), data)?;
        image.mask = self.mask.clone();
        Ok(image)
    }

    pub fn with_mask(mut self, mask: Vec<bool>) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(config_error!("mask has {} voxels, image has {}", mask.len(), self.len()))
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Apply a per-slice transaxial mask (`nx * ny` values) to every slice of
    /// the native region. Coarse regions remain unmasked.
    pub fn with_slice_mask(self, slice: &[bool]) -> Result<Self> {
        let fov = self.layout.inner().fov;
        let [nx, ny, nz] = fov.n;
        if slice.len() != nx * ny {
            return Err(config_error!("slice mask has {} voxels, expected {nx} x {ny}", slice.len()))
        }
        let mut mask = vec![true; self.len()];
        for z in 0..nz {
            mask[z * nx * ny..(z + 1) * nx * ny].copy_from_slice(slice);
        }
        self.with_mask(mask)
    }

    pub fn layout(&self) -> &VolumeLayout { &self.layout }
    pub fn mask(&self) -> Option<&[bool]> { self.mask.as_deref() }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    #[inline]
    pub fn is_active(&self, i: Index1_u) -> bool {
        self.mask.as_ref().map_or(true, |m| m[i])
    }

    pub fn region_data(&self, region: usize) -> &[Intensityf32] {
        &self.data[self.layout.regions()[region].range()]
    }

    pub fn region_data_mut(&mut self, region: usize) -> &mut [Intensityf32] {
        let range = self.layout.regions()[region].range();
        &mut self.data[range]
    }

    /// Region and voxel containing `p`, and the value there
    pub fn locate(&self, p: Point) -> Option<(usize, Index3_u, Intensityf32)> {
        let (region, voxel) = self.layout.locate(p)?;
        Some((region, voxel, self.data[self.layout.arena_index(region, voxel)]))
    }

    pub fn native_indices_of(&self, region: usize, voxel: Index3_u) -> [Range<usize>; 3] {
        self.layout.native_indices_of(region, voxel)
    }

    /// The native region on its own
    pub fn inner(&self) -> ImageVolume {
        let region = *self.layout.inner();
        let mask = self.mask.as_ref().map(|m| m[region.range()].to_vec());
        Self { layout: VolumeLayout::single(region.fov), data: self.data[region.range()].to_vec(), mask }
    }

    /// Resample every region onto the native grid of the whole volume: each
    /// native voxel takes the value of the voxel containing its centre.
    pub fn to_native_grid(&self) -> ImageVolume {
        let grid = self.layout.native_grid();
        let data = (0..grid.n_voxels())
            .map(|i| {
                self.layout.locate(grid.voxel_centre1(i))
                    .map_or(0.0, |(r, i3)| self.data[self.layout.arena_index(r, i3)])
            })
            .collect();
        Self { layout: VolumeLayout::single(grid), data, mask: None }
    }

    pub fn sum(&self) -> Intensityf32 { self.data.iter().sum() }
}

impl core::ops::Index<Index1_u> for ImageVolume {
    type Output = Intensityf32;
    #[inline]
    fn index(&self, i: Index1_u) -> &Self::Output { &self.data[i] }
}

impl core::ops::IndexMut<Index1_u> for ImageVolume {
    #[inline]
    fn index_mut(&mut self, i: Index1_u) -> &mut Self::Output { &mut self.data[i] }
}
