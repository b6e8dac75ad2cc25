#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, BuildFailure, Result};

mod input;
pub use input::InputFile;

pub mod ledger;
pub use ledger::ArtifactLedger;

pub mod recompile;
pub use recompile::{CompileChecker, MtimeChecker, RecompileStamp};

pub mod project;
pub use project::{Project, ProjectBuilder, ProjectInfo};

pub mod toolchain;
pub use toolchain::{Tool, ToolId, ToolSpec, Toolchain};

pub mod report;
pub use report::{BasicStdoutReporter, Reporter, SilentReporter};

pub mod cli;
pub use cli::BuildArgs;

mod clean;
mod pool;
mod scheduler;

pub mod utils;

use scheduler::Scheduler;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

/// What kind of run the driver performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildMode {
    /// Incremental build.
    Build,
    /// Delete prior artifacts, build nothing.
    Clean,
    /// Clean (retaining output directories and ledgers), then build.
    Rebuild,
}

/// Driver configuration, usually lowered from [`cli::BuildArgs`].
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Worker thread count.
    pub jobs: usize,
    /// Abort the whole build on the first failed task.
    pub stop_on_error: bool,
    pub mode: BuildMode,
    /// Print cumulative per-tool timings after the run.
    pub perf_report: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get(),
            stop_on_error: false,
            mode: BuildMode::Build,
            perf_report: false,
        }
    }
}

/// The result of a finished run.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Failed tasks, plus projects that never finished building.
    pub failures: usize,
    /// Tasks enqueued over the whole run.
    pub total_tasks: usize,
    /// Tasks that completed, skipped ones included.
    pub completed_tasks: usize,
    pub elapsed: Duration,
    /// Cumulative worker time per tool.
    pub tool_times: BTreeMap<String, Duration>,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.failures == 0
    }
}

/// Assembles projects and drives a build run to completion.
///
/// The session resolves declared project dependencies, loads the persisted
/// artifact ledgers, hands everything to the scheduler and flushes the
/// ledgers back to disk once the build quiesces.
///
/// # Examples
///
/// ```no_run
/// use conveyor::{BuildOptions, BuildSession, Project};
///
/// let project = Project::builder("Foo").workdir("projects/foo").build();
/// let outcome = BuildSession::new(BuildOptions::default()).project(project).run()?;
/// std::process::exit(conveyor::BuildArgs::exit_code(outcome.failures));
/// # Ok::<(), conveyor::BuildError>(())
/// ```
pub struct BuildSession {
    projects: Vec<Project>,
    options: BuildOptions,
    reporter: Arc<dyn Reporter>,
}

impl BuildSession {
    pub fn new(options: BuildOptions) -> Self {
        Self { projects: Vec::new(), options, reporter: Arc::new(BasicStdoutReporter) }
    }

    /// Replaces the default stdout reporter.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn project(mut self, project: Project) -> Self {
        self.projects.push(project);
        self
    }

    #[must_use]
    pub fn projects(mut self, projects: impl IntoIterator<Item = Project>) -> Self {
        self.projects.extend(projects);
        self
    }

    /// Restricts the session to the named projects and their transitive
    /// dependencies. Errors on unknown names.
    pub fn filter_projects(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        let by_name: HashMap<String, usize> = self
            .projects
            .iter()
            .enumerate()
            .map(|(idx, project)| (project.name().to_string(), idx))
            .collect();

        let mut selected = HashSet::new();
        let mut pending: Vec<String> = names.to_vec();
        while let Some(name) = pending.pop() {
            let &idx =
                by_name.get(&name).ok_or_else(|| BuildError::UnknownProject(name.clone()))?;
            if selected.insert(idx) {
                pending.extend(self.projects[idx].dependency_names.iter().cloned());
            }
        }

        let mut idx = 0;
        self.projects.retain(|_| {
            let keep = selected.contains(&idx);
            idx += 1;
            keep
        });
        Ok(self)
    }

    /// Runs the configured mode to completion and returns the outcome.
    ///
    /// Clean-only runs report zero tasks. Build runs return the number of
    /// failed tasks in [`BuildOutcome::failures`]; a scheduler-level error
    /// (worker panic, inconsistent state) aborts the pool and surfaces as
    /// `Err` instead.
    pub fn run(mut self) -> Result<BuildOutcome> {
        let started = Instant::now();

        if self.projects.is_empty() {
            return Err(BuildError::msg("no projects to build"));
        }
        self.resolve_dependencies()?;

        for project in &mut self.projects {
            *project.ledger.write() = ArtifactLedger::read(project.info().settings_path());
        }

        match self.options.mode {
            BuildMode::Clean => {
                clean::clean(&self.projects, false, &*self.reporter)?;
                return Ok(BuildOutcome {
                    failures: 0,
                    total_tasks: 0,
                    completed_tasks: 0,
                    elapsed: started.elapsed(),
                    tool_times: BTreeMap::new(),
                });
            }
            BuildMode::Rebuild => clean::clean(&self.projects, true, &*self.reporter)?,
            BuildMode::Build => {}
        }

        // Dependencies are resolved; let tools do their per-project setup
        // before the first task.
        for project in &self.projects {
            for tool_id in project.toolchain.all_tools() {
                project.toolchain.tool(tool_id).setup_for_project(project.info())?;
            }
        }

        let Self { projects, options, reporter } = self;
        let scheduler =
            Scheduler::new(projects, options.jobs, options.stop_on_error, Arc::clone(&reporter));
        let (projects, stats) = scheduler.run()?;

        for project in &projects {
            project.ledger.read().write(project.info().settings_path(), stats.failures > 0)?;
        }

        let outcome = BuildOutcome {
            failures: stats.failures,
            total_tasks: stats.total_builds,
            completed_tasks: stats.completed_builds,
            elapsed: started.elapsed(),
            tool_times: stats.tool_times,
        };

        if options.perf_report {
            reporter.build_message("Cumulative tool time:");
            for (tool, time) in &outcome.tool_times {
                reporter.build_message(&format!("  {tool:<24} {:>9.3}s", time.as_secs_f64()));
            }
        }
        reporter.build_message(&format!(
            "Build finished. Completed {} tasks in {:.2}s",
            outcome.total_tasks,
            outcome.elapsed.as_secs_f64()
        ));

        Ok(outcome)
    }

    /// Resolves declared dependency names to project indices.
    fn resolve_dependencies(&mut self) -> Result<()> {
        let by_name: HashMap<String, usize> = self
            .projects
            .iter()
            .enumerate()
            .map(|(idx, project)| (project.name().to_string(), idx))
            .collect();

        for project in &mut self.projects {
            project.dependencies = project
                .dependency_names
                .iter()
                .map(|name| {
                    by_name
                        .get(name)
                        .copied()
                        .ok_or_else(|| BuildError::UnknownProject(name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(())
    }
}
