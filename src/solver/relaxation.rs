//! Step-size schedules of the relaxed algorithms.

use crate::config_error;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq)]
pub enum Relaxation {
    /// λ / ((n − 1)/20 + 1), for one-based iteration `n`
    Decreasing(f32),
    /// One value per iteration, used as given
    Schedule(Vec<f32>),
}

impl Default for Relaxation {
    fn default() -> Self { Relaxation::Decreasing(1.0) }
}

impl Relaxation {

    /// Interpret configured values: nothing or a single zero means the
    /// decreasing schedule starting at 1, any other single value the
    /// decreasing schedule starting there, and several values a schedule.
    pub fn from_values(values: &[f32]) -> Self {
        match values {
            [] => Self::default(),
            [l] if *l == 0.0 => Self::default(),
            [l] => Relaxation::Decreasing(*l),
            many => Relaxation::Schedule(many.to_vec()),
        }
    }

    pub fn validate(&self, iterations: usize) -> Result<()> {
        match self {
            Relaxation::Decreasing(l) if !(*l > 0.0 && l.is_finite()) =>
                Err(config_error!("relaxation parameter must be positive, got {l}")),
            Relaxation::Schedule(s) if s.len() < iterations =>
                Err(config_error!("relaxation schedule has {} values for {iterations} iterations", s.len())),
            Relaxation::Schedule(s) if s.iter().any(|l| !(*l > 0.0 && l.is_finite())) =>
                Err(config_error!("relaxation schedule contains non-positive values")),
            _ => Ok(()),
        }
    }

    /// λ for the zero-based `iteration`
    pub fn at(&self, iteration: usize) -> f32 {
        match self {
            Relaxation::Decreasing(l) => l / (iteration as f32 / 20.0 + 1.0),
            Relaxation::Schedule(s) => s.get(iteration).or(s.last()).copied().unwrap_or(1.0),
        }
    }
}
