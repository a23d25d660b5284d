//! Error and warning types shared by every stage of a reconstruction.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /// Inconsistent geometry, unknown algorithm, subset count too large,
    /// unsupported kernel combination, ...
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A prior or correction needs an input which was not supplied, or whose
    /// file does not exist.
    #[error("missing {what}{}", display_path(.path))]
    MissingResource { what: String, path: Option<PathBuf> },

    /// Input data of the wrong shape, or violating non-negativity outside of
    /// index-based randoms subtraction.
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("malformed binary input: {0}")]
    BinaryFormat(String),
}

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        match e {
            binrw::Error::Io(e) => Error::Io(e),
            other => Error::BinaryFormat(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Conditions which do not stop a reconstruction, but which the caller should
/// hear about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Warning {
    /// 32-bit accumulation chosen for data whose total exceeds what `f32`
    /// represents exactly
    NumericOverflow { total: f64, max: f64 },
    /// The solver was asked to stop before running all iterations
    Cancelled { iteration: usize, subset: usize },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::NumericOverflow { total, max } =>
                write!(f, "32-bit accumulation of {total:.3e} counts exceeds exact range {max:.3e}: \
                           consider 64-bit accumulation"),
            Warning::Cancelled { iteration, subset } =>
                write!(f, "cancelled before iteration {iteration}, subset {subset}"),
        }
    }
}

/// `Error::Configuration` with `format!` syntax
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => { $crate::error::Error::Configuration(format!($($arg)*)) };
}

/// `Error::InvalidMeasurement` with `format!` syntax
#[macro_export]
macro_rules! measurement_error {
    ($($arg:tt)*) => { $crate::error::Error::InvalidMeasurement(format!($($arg)*)) };
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref().map(|p| format!(": {}", p.display())).unwrap_or_default()
}

/// `Error::MissingResource` without an associated file
pub fn missing(what: impl Into<String>) -> Error {
    Error::MissingResource { what: what.into(), path: None }
}
