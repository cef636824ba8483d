use crate::task::TaskResult;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for reporting incremental progress while a phase runs. Called
/// from the orchestrating thread only.
pub trait PhaseObserver {
    fn on_phase_start(&mut self, total_tasks: usize) {
        let _ = total_tasks;
    }
    fn on_task_complete(&mut self, completed: usize, result: &TaskResult) {
        let _ = (completed, result);
    }
    fn on_phase_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopPhaseObserver;

impl PhaseObserver for NoopPhaseObserver {}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tasks ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Terminal progress bar over block tasks. Hidden when stderr is not a terminal.
#[derive(Default)]
pub struct ProgressBarObserver {
    bar: Option<ProgressBar>,
    contributions: u64,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhaseObserver for ProgressBarObserver {
    fn on_phase_start(&mut self, total_tasks: usize) {
        self.bar = Some(create_progress_bar(
            total_tasks as u64,
            "Contracting covariance blocks...",
        ));
    }

    fn on_task_complete(&mut self, completed: usize, result: &TaskResult) {
        self.contributions += result.counters.contributions;
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
            if completed % 64 == 0 {
                bar.set_message(format!("{} contributions", self.contributions));
            }
        }
    }

    fn on_phase_finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("Done.");
        }
    }
}
