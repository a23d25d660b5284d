//! Volume-of-intersection kernel: voxels are spheres, the tube of response a
//! cylinder, and a voxel's weight is proportional to the volume they share.

use geometry::OverlapTable;
use units::todo::Lengthf32;

use crate::{
    LOR,
    fov::FOV,
    image::Region,
    tof::TofWindow,
};

use super::{SystemMatrix, SystemMatrixRow, orthogonal::voxels_near_line};

/// Resolution of the tabulated overlap volumes
const TABLE_SIZE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Volume {
    /// Radius of the tube of response
    pub tube_radius: Lengthf32,
    /// Radius of the voxel sphere, relative to half the voxel diagonal
    pub voxel_radius: f32,
}

impl Volume {
    pub fn sphere_radius(&self, fov: &FOV) -> Lengthf32 {
        self.voxel_radius * fov.voxel_size.norm() / 2.0
    }
}

#[derive(Clone, Debug)]
pub struct VolumeData {
    table: OverlapTable,
    /// Converts overlap volumes into lengths along the LOR
    scale: f32,
}

impl SystemMatrix for Volume {
    type Data = VolumeData;

    fn data(&self, fov: &FOV) -> VolumeData {
        let sphere = self.sphere_radius(fov);
        let table = OverlapTable::new(sphere, self.tube_radius, TABLE_SIZE);
        let tube_area = std::f32::consts::PI * self.tube_radius * self.tube_radius;
        // A sphere swept along the tube fills its voxel's share of it
        let scale = fov.voxel_volume() / (tube_area * table.sphere_volume());
        VolumeData { table, scale }
    }

    fn update_system_matrix_row(&self, row: &mut SystemMatrixRow, lor: &LOR, region: &Region, data: &VolumeData, tof: Option<&TofWindow>) {
        let VolumeData { table, scale } = data;
        voxels_near_line(lor.p1, lor.p2, &region.fov, table.reach(), false, |index, distance, along, _step| {
            let mut weight = table.at(distance) * scale;
            if let Some(tof) = tof { weight *= tof.weight(along) }
            if weight > 0.0 { row.push(region.offset + index, weight) }
        });
    }

    fn capacity(&self, fov: &FOV) -> usize {
        let [nx, ny, nz] = fov.n;
        let reach = self.tube_radius + self.sphere_radius(fov);
        let across = 2 * (reach / fov.voxel_size.min()).ceil() as usize + 2;
        (nx + ny + nz) * across * across
    }
}
