//! Build progress reporting.
//!
//! The scheduler narrates the build through the [`Reporter`] trait so the
//! presentation layer stays out of the core: a CLI can render a progress bar,
//! a test harness can record events, an embedder can stay silent. All hooks
//! default to no-ops.

use crate::error::BuildFailure;
use std::path::{Path, PathBuf};
use yansi::Paint;

/// Receives build lifecycle events from the scheduler.
///
/// Called on the coordinator thread; implementations should return quickly.
pub trait Reporter: Send + Sync {
    /// A build-level message, e.g. "Starting builds".
    fn build_message(&self, _message: &str) {}

    /// A task was handed to the worker pool.
    fn task_started(&self, _project: &str, _tool: &str, _input: Option<&Path>) {}

    /// A task completed. `up_to_date` means the task was skipped and the
    /// outputs are the prior run's.
    fn task_finished(&self, _project: &str, _tool: &str, _outputs: &[PathBuf], _up_to_date: bool) {}

    /// A tool invocation failed.
    fn task_failed(&self, _failure: &BuildFailure) {}

    /// Progress tick; `total` grows as completions unlock new work.
    fn tick(&self, _completed: usize, _total: usize) {}
}

/// A reporter that stays quiet.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {}

/// Prints one line per event to stdout/stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicStdoutReporter;

impl Reporter for BasicStdoutReporter {
    fn build_message(&self, message: &str) {
        println!("{message}");
    }

    fn task_finished(&self, project: &str, tool: &str, outputs: &[PathBuf], up_to_date: bool) {
        let names = outputs
            .iter()
            .map(|p| p.file_name().unwrap_or(p.as_os_str()).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        if up_to_date {
            println!("[{project}] {} {tool}: {names}", Paint::cyan("up-to-date"));
        } else {
            println!("[{project}] {} {tool}: {names}", Paint::green("built"));
        }
    }

    fn task_failed(&self, failure: &BuildFailure) {
        eprintln!("{} {failure}", Paint::red("error:"));
    }
}
