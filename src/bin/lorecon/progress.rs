use indicatif::{ProgressBar, ProgressStyle};

use lorecon::solver::Solver;

/// Progress bar over the (iteration, subset) steps of a reconstruction
pub(super) struct Steps(ProgressBar);

impl Steps {

    pub(super) fn new(solver: &Solver) -> Result<Self, indicatif::style::TemplateError> {
        let bar = ProgressBar::new(solver.n_steps() as u64);
        bar.set_style(ProgressStyle::default_bar()
                      .template("{msg}\n[{elapsed_precise}] {wide_bar} {pos}/{len} ({eta_precise})")?);
        bar.set_message(format!("{}: {} iterations, {} subsets",
                                solver.settings().algorithm.name(),
                                solver.settings().iterations,
                                solver.subsets().len()));
        bar.tick();
        Ok(Self(bar))
    }

    pub(super) fn step(&self, solver: &Solver) {
        self.0.set_message(format!("iteration {} subset {}", solver.iteration() + 1, solver.subset()));
        self.0.inc(1);
    }

    pub(super) fn finish(&self) { self.0.finish_and_clear() }
}
