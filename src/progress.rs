//! Terminal progress for engine runs

use colored::Colorize;
use declarative::{Phase, ProgressCallback, ResourceStatus};
use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar per phase; failures are printed above the bar as they happen
pub struct TerminalProgress {
    quiet: bool,
    bar: Option<ProgressBar>,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        Self { quiet, bar: None }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl ProgressCallback for TerminalProgress {
    fn on_phase_start(&mut self, phase: Phase, count: usize) {
        let bar = if self.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(count as u64)
        };
        bar.set_style(bar_style());
        bar.set_prefix(match phase {
            Phase::Apply => "Applying",
            Phase::Delete => "Deleting",
        });
        self.bar = Some(bar);
    }

    fn on_resource_start(&mut self, id: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("○ {id}"));
        }
    }

    fn on_resource_complete(&mut self, id: &str, status: &ResourceStatus) {
        let Some(bar) = &self.bar else {
            return;
        };
        match status {
            ResourceStatus::Applied => bar.set_message(format!("✓ {id}")),
            ResourceStatus::Failed { error } => {
                bar.println(format!("  {} {id}: {error}", "✗".red()));
            }
            ResourceStatus::Skipped { .. } => bar.set_message(format!("⊘ {id}")),
            _ => {}
        }
        bar.inc(1);
    }

    fn on_phase_complete(&mut self, _phase: Phase) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
