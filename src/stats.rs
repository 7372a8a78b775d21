//! Phase timings and solve counters for `--stats` output.

use std::time::{Duration, Instant};

/// Collects phase timings and counters of one solver instance.
pub struct Stats {
    total_start: Instant,
    /// Accumulated time per phase name, in first-seen order.
    phases: Vec<(&'static str, Duration)>,
    pub matrix_uploads: u32,
    pub solves: u32,
    pub failed_solves: u32,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            matrix_uploads: 0,
            solves: 0,
            failed_solves: 0,
        }
    }

    /// Add `duration` to the total of phase `name`.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        match self.phases.iter_mut().find(|(n, _)| *n == name) {
            Some((_, total)) => *total += duration,
            None => self.phases.push((name, duration)),
        }
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    /// Total time spent in phase `name`.
    pub fn phase_total(&self, name: &str) -> Duration {
        self.phases
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(Duration::ZERO, |(_, d)| *d)
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== teamsolve stats ===");

        for (name, total) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, total.as_secs_f64());
        }

        eprintln!("  Matrix uploads:         {}", self.matrix_uploads);
        eprintln!("  Solves:                 {}", self.solves);
        if self.failed_solves > 0 {
            eprintln!("  Failed solves:          {}", self.failed_solves);
        }
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_phases_accumulate() {
        let mut stats = Stats::new();
        stats.add_phase("solve", Duration::from_millis(5));
        stats.add_phase("setup", Duration::from_millis(1));
        stats.add_phase("solve", Duration::from_millis(7));
        assert_eq!(stats.phase_total("solve"), Duration::from_millis(12));
        assert_eq!(stats.phase_total("upload"), Duration::ZERO);
        assert_eq!(stats.phases().len(), 2);
        assert_eq!(stats.phases()[0].0, "solve");
    }
}
