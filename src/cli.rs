//! Command-line argument handling for makefile binaries.
//!
//! The crate ships no executable of its own; an embedder declares projects
//! in a small binary and hands the parsed [`BuildArgs`] to a
//! [`BuildSession`](crate::BuildSession). Target, toolchain and architecture
//! selection are consumed by the embedder's plan evaluation; everything else
//! lowers into [`BuildOptions`](crate::BuildOptions) for the driver.

use crate::{BuildMode, BuildOptions};
use clap::{ArgAction, Parser, ValueEnum};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PerfReportMode {
    Tree,
    Flat,
    Html,
}

/// Arguments recognized by the build driver.
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Multi-toolchain, multi-project build orchestration")]
pub struct BuildArgs {
    /// Target(s) for build.
    #[arg(short = 't', long = "target", conflicts_with = "all_targets")]
    pub targets: Vec<String>,

    /// Build all targets.
    #[arg(long = "all-targets", alias = "at")]
    pub all_targets: bool,

    /// Build only the specified project(s), including their dependencies.
    #[arg(short = 'p', long = "project")]
    pub projects: Vec<String>,

    /// Toolchain(s) to use for compiling.
    #[arg(short = 'o', long = "toolchain", conflicts_with = "all_toolchains")]
    pub toolchains: Vec<String>,

    /// Build with all toolchains.
    #[arg(long = "all-toolchains", alias = "ao")]
    pub all_toolchains: bool,

    /// Architecture(s) to compile for each toolchain.
    #[arg(short = 'a', long = "architecture", alias = "arch", conflicts_with = "all_architectures")]
    pub architectures: Vec<String>,

    /// Build all architectures supported by the toolchain.
    #[arg(long = "all-architectures", alias = "aa")]
    pub all_architectures: bool,

    /// Clean the target build.
    #[arg(short = 'c', long = "clean", conflicts_with = "rebuild")]
    pub clean: bool,

    /// Clean the target build, then build it.
    #[arg(short = 'r', long = "rebuild")]
    pub rebuild: bool,

    /// Number of simultaneous build processes. Defaults to the CPU count.
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Verbose; enables additional info-level logging.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Quiet; `-q` disables info logging, `-qq` all build logging.
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    pub quiet: u8,

    /// Stop compilation after the first error is encountered.
    #[arg(long = "stop-on-error")]
    pub stop_on_error: bool,

    /// Show all commands sent to the system.
    #[arg(long = "show-commands")]
    pub show_commands: bool,

    /// Force color on or off.
    #[arg(long = "force-color", value_enum, num_args = 0..=1, default_missing_value = "on")]
    pub force_color: Option<Toggle>,

    /// Force the progress bar on or off.
    #[arg(long = "force-progress-bar", value_enum, num_args = 0..=1, default_missing_value = "on")]
    pub force_progress_bar: Option<Toggle>,

    /// Collect and show a perf report at the end of execution.
    #[arg(long = "perf-report", value_enum, num_args = 0..=1, default_missing_value = "tree")]
    pub perf_report: Option<PerfReportMode>,
}

impl BuildArgs {
    /// Lowers the arguments into driver options.
    pub fn options(&self) -> BuildOptions {
        BuildOptions {
            jobs: self.jobs.unwrap_or_else(num_cpus::get),
            stop_on_error: self.stop_on_error,
            mode: if self.clean {
                BuildMode::Clean
            } else if self.rebuild {
                BuildMode::Rebuild
            } else {
                BuildMode::Build
            },
            perf_report: self.perf_report.is_some(),
        }
    }

    /// The `tracing` filter directive matching the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet >= 2 {
            "error"
        } else if self.quiet == 1 {
            "warn"
        } else if self.verbose >= 2 {
            "trace"
        } else if self.verbose == 1 {
            "debug"
        } else {
            "info"
        }
    }

    /// Applies the color override to the terminal painter.
    pub fn apply_color(&self) {
        match self.force_color {
            Some(Toggle::On) => yansi::Paint::enable(),
            Some(Toggle::Off) => yansi::Paint::disable(),
            None => {}
        }
    }

    /// The process exit code for a finished run: `0` on success, otherwise
    /// the number of failed tasks.
    pub fn exit_code(failures: usize) -> i32 {
        failures.min(i32::MAX as usize) as i32
    }
}
