//! Iterative reconstruction of PET images from list-mode or sinogram data.
//!
//! A [`solver::Solver`] combines the measurements of a [`scanner::ScannerGeometry`],
//! a [`projector::Projector`], optional [`corrections::Corrections`] and a
//! [`priors::Prior`], and improves an [`image::ImageVolume`] one subset at a
//! time.

pub mod error;
pub mod index;
pub mod fov;
pub mod image;
pub mod gauss;
pub mod lor;
pub mod scanner;
pub mod sinogram;
pub mod measurement;
pub mod tof;
pub mod corrections;
pub mod subsets;
pub mod projector;
pub mod priors;
pub mod solver;
pub mod config;
pub mod phantom;
pub mod io;
pub mod utils;

pub use error::{Error, Result, Warning};
pub use lor::LOR;
pub use geometry::{Point, Vector};
