//! The dynamic dispatcher.
//!
//! The scheduler discovers the task graph as it runs: every completed build
//! may register output files as new inputs, which unlocks new tasks in the
//! same project and in projects that depend on it. One coordinator (the
//! thread calling [`Scheduler::run`]) owns every piece of mutable state and
//! consumes a single FIFO completion queue; worker threads only execute tool
//! code over the data captured for them at enqueue time.
//!
//! The flow per completion is strict: release the finished task's
//! reachability claims first, then check whether its tool is done for the
//! project, then register outputs and probe for newly unblocked work. The
//! ordering matters because downstream eligibility is defined in terms of
//! extension quiescence, which the release itself may have caused.

use crate::{
    error::{BuildError, BuildFailure, Result},
    input::InputFile,
    ledger::ArtifactLedger,
    pool::{Callback, TaskError, TaskOutput, ThreadPool, Work},
    project::{Project, ProjectInfo},
    recompile,
    report::Reporter,
    toolchain::{Tool, ToolId},
    utils,
};
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Aggregate counters for one scheduler run.
#[derive(Debug, Default)]
pub(crate) struct SchedulerStats {
    pub failures: usize,
    pub total_builds: usize,
    pub completed_builds: usize,
    /// Cumulative wall-clock worker time per tool.
    pub tool_times: BTreeMap<String, Duration>,
}

/// What a worker receives to execute.
enum TaskInput {
    Null,
    Single(InputFile),
    Group(Vec<InputFile>),
}

/// Completion context bound at enqueue time and handed back verbatim.
struct TaskContext {
    project: usize,
    tool: ToolId,
    tool_name: String,
    /// The extension the input was drawn from; `None` for null-input and
    /// group tasks.
    input_extension: Option<String>,
    inputs: Option<Vec<InputFile>>,
}

pub(crate) struct Scheduler {
    projects: Vec<Project>,
    reporter: Arc<dyn Reporter>,
    stop_on_error: bool,
    pool: ThreadPool<TaskContext>,
    callbacks: Receiver<Callback<TaskContext>>,
    running_builds: usize,
    total_builds: usize,
    completed_builds: usize,
    failures: usize,
    /// Projects that recorded a task failure; their residual reachability is
    /// expected and not double-counted by the stuck-build check.
    failed_projects: HashSet<usize>,
    /// Running invocation count per tool name, across all projects.
    cur_parallel: HashMap<String, usize>,
    tool_times: BTreeMap<String, Duration>,
    /// Projects owning at least one tool with cross-project dependencies,
    /// probed after every extension quiescence anywhere.
    cross_project_dep_projects: Vec<usize>,
}

impl Scheduler {
    pub fn new(
        projects: Vec<Project>,
        jobs: usize,
        stop_on_error: bool,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let (pool, callbacks) = ThreadPool::start(jobs);
        let cross_project_dep_projects = projects
            .iter()
            .enumerate()
            .filter(|(_, project)| {
                project
                    .toolchain
                    .all_tools()
                    .into_iter()
                    .any(|id| !project.toolchain.spec(id).cross_project_dependencies.is_empty())
            })
            .map(|(idx, _)| idx)
            .collect();

        Self {
            projects,
            reporter,
            stop_on_error,
            pool,
            callbacks,
            running_builds: 0,
            total_builds: 0,
            completed_builds: 0,
            failures: 0,
            failed_projects: HashSet::new(),
            cur_parallel: HashMap::new(),
            tool_times: BTreeMap::new(),
            cross_project_dep_projects,
        }
    }

    /// Drives the build to completion and returns the frozen projects plus
    /// run statistics.
    pub fn run(mut self) -> Result<(Vec<Project>, SchedulerStats)> {
        self.reporter.build_message("Starting builds");

        if !self.seed() {
            self.reporter.build_message("Nothing to build.");
            self.pool.stop();
            return Ok(self.finish());
        }

        loop {
            let callback = self
                .callbacks
                .recv()
                .map_err(|_| BuildError::msg("callback queue closed before the pool stopped"))?;
            let (ctx, outcome) = match callback {
                Callback::Exit => break,
                Callback::Finished { ctx, outcome } => (ctx, outcome),
            };
            *self.tool_times.entry(ctx.tool_name.clone()).or_default() += outcome.elapsed;

            match outcome.result {
                Ok(output) => self.build_finished(ctx, output),
                Err(TaskError::Failure(failure)) => {
                    self.running_builds -= 1;
                    if self.running_builds == 0 {
                        self.pool.stop();
                    }
                    self.failures += 1;
                    self.failed_projects.insert(ctx.project);
                    error!("{failure}");
                    self.reporter.task_failed(&failure);
                    if self.stop_on_error {
                        self.pool.abort();
                        return Err(failure.into());
                    }
                }
                Err(TaskError::Panic(message)) => {
                    self.pool.abort();
                    return Err(BuildError::WorkerPanic(message));
                }
            }
        }

        Ok(self.finish())
    }

    fn finish(self) -> (Vec<Project>, SchedulerStats) {
        let Self {
            mut pool,
            projects,
            mut failures,
            failed_projects,
            total_builds,
            completed_builds,
            tool_times,
            ..
        } = self;
        pool.join();

        // A tool with residual reachability claims never finished; count the
        // project as failed unless a task failure already did.
        for (idx, project) in projects.iter().enumerate() {
            if project.toolchain.has_any_reachability() {
                error!("project {} did not finish building", project.name());
                if !failed_projects.contains(&idx) {
                    failures += 1;
                }
            }
        }

        (projects, SchedulerStats { failures, total_builds, completed_builds, tool_times })
    }

    /// Seeds the initial task set from the projects' source inputs.
    ///
    /// Returns false if nothing at all was enqueued.
    fn seed(&mut self) -> bool {
        let mut queued = false;
        let no_tools_used = BTreeSet::new();

        for pidx in 0..self.projects.len() {
            // One pass per extension, plus a synthetic pass for null-input
            // tools. Paths are snapshotted up front; an input consumed by an
            // exclusive tool simply fails to resolve for later tools.
            let mut passes: Vec<Option<(String, Vec<PathBuf>)>> = vec![None];
            passes.extend(self.projects[pidx].input_files.iter().map(|(ext, files)| {
                Some((ext.clone(), files.iter().map(|f| f.path().to_path_buf()).collect()))
            }));

            for pass in passes {
                trace!(
                    "enqueuing initial tasks for extension {:?} in project {}",
                    pass.as_ref().map(|(ext, _)| ext.as_str()),
                    self.projects[pidx].name()
                );
                let extension = pass.as_ref().map(|(ext, _)| ext.as_str());
                let tool_ids = self.projects[pidx].toolchain.tools_for(extension, &no_tools_used);

                for tool_id in tool_ids {
                    if !self.pre_build_filter(pidx, tool_id) {
                        continue;
                    }
                    match &pass {
                        None => {
                            if !self.can_run(pidx, tool_id) {
                                continue;
                            }
                            if !self.projects[pidx].toolchain.is_tool_active(tool_id) {
                                continue;
                            }
                            self.enqueue_null(pidx, tool_id);
                            queued = true;
                        }
                        Some((ext, paths)) => {
                            for path in paths {
                                if !self.can_run(pidx, tool_id) {
                                    break;
                                }
                                queued |= self.enqueue_single(pidx, tool_id, ext, path, true);
                            }
                        }
                    }
                }
            }

            // Group tools whose every producer is already quiet can start
            // right away, e.g. an archiver over checked-in objects.
            for tool_id in self.projects[pidx].toolchain.all_tools() {
                if self.projects[pidx].toolchain.spec(tool_id).input_groups.is_empty() {
                    continue;
                }
                if !self.can_run(pidx, tool_id) {
                    continue;
                }
                if !self.pre_build_filter(pidx, tool_id) {
                    continue;
                }
                let files = self.group_input_files(pidx, tool_id);
                if files.is_empty() {
                    continue;
                }
                self.enqueue_group(pidx, tool_id, files, true);
                queued = true;
            }
        }
        queued
    }

    /// The pre-build filter: skip a tool at seed time if any tool in the
    /// project itself or in a direct upstream project could still produce one
    /// of its dependency extensions from the inputs currently available. The
    /// dynamic probes pick the tool up once those producers quiesce.
    fn pre_build_filter(&self, pidx: usize, tool_id: ToolId) -> bool {
        let (dependencies, cross) = {
            let spec = self.projects[pidx].toolchain.spec(tool_id);
            (spec.dependencies.clone(), spec.cross_project_dependencies.clone())
        };
        for &dep_pidx in &self.projects[pidx].dependencies {
            if !self.check_dependencies_pre_build(dep_pidx, &cross) {
                return false;
            }
        }
        self.check_dependencies_pre_build(pidx, &dependencies)
    }

    fn check_dependencies_pre_build(&self, pidx: usize, dependencies: &BTreeSet<String>) -> bool {
        let project = &self.projects[pidx];
        for dependency in dependencies {
            for check_id in project.toolchain.all_tools() {
                let has_inputs = project
                    .toolchain
                    .spec(check_id)
                    .consumed_extensions()
                    .iter()
                    .any(|ext| project.has_inputs(ext));
                if has_inputs && project.toolchain.can_create_output(check_id, dependency) {
                    trace!(
                        "{} in project {} could still produce {}, deferring",
                        project.toolchain.spec(check_id).name,
                        project.name(),
                        dependency
                    );
                    return false;
                }
            }
        }
        true
    }

    /// The concurrency cap: a tool may run when it has no cap or its global
    /// running count is below it.
    fn can_run(&self, pidx: usize, tool_id: ToolId) -> bool {
        let spec = self.projects[pidx].toolchain.spec(tool_id);
        spec.max_parallel == 0
            || self.cur_parallel.get(&spec.name).copied().unwrap_or(0) < spec.max_parallel
    }

    /// The dependency gate: every dependency extension must be inactive in
    /// the project, and every cross-project dependency extension inactive in
    /// every direct upstream project.
    fn dependencies_met(&self, pidx: usize, tool_id: ToolId) -> bool {
        let project = &self.projects[pidx];
        let spec = project.toolchain.spec(tool_id);
        for &dep_pidx in &project.dependencies {
            for ext in &spec.cross_project_dependencies {
                if self.projects[dep_pidx].toolchain.is_output_active(ext) {
                    return false;
                }
            }
        }
        for ext in &spec.dependencies {
            if project.toolchain.is_output_active(ext) {
                return false;
            }
        }
        true
    }

    /// Collects the batch for a group tool: empty while any grouped extension
    /// is still active, otherwise all not-yet-consumed files across the
    /// grouped extensions.
    fn group_input_files(&self, pidx: usize, tool_id: ToolId) -> Vec<InputFile> {
        let project = &self.projects[pidx];
        let spec = project.toolchain.spec(tool_id);
        let mut files = Vec::new();
        for ext in &spec.input_groups {
            if project.toolchain.is_output_active(ext) {
                trace!("extension {ext} is still active, {} can't build yet", spec.name);
                return Vec::new();
            }
            files.extend(
                project.inputs(ext).iter().filter(|f| !f.was_tool_used(&spec.name)).cloned(),
            );
        }
        files
    }

    fn enqueue_null(&mut self, pidx: usize, tool_id: ToolId) {
        debug!(
            "enqueuing null-input build for {} for project {}",
            self.projects[pidx].toolchain.spec(tool_id).name,
            self.projects[pidx].name()
        );
        self.submit(pidx, tool_id, None, TaskInput::Null, false);
    }

    /// Enqueues one per-file task. Returns false if the input is gone from
    /// the pool or the tool already consumed it.
    fn enqueue_single(
        &mut self,
        pidx: usize,
        tool_id: ToolId,
        extension: &str,
        path: &Path,
        do_compile_check: bool,
    ) -> bool {
        let (tool_name, exclusive) = {
            let spec = self.projects[pidx].toolchain.spec(tool_id);
            (spec.name.clone(), spec.exclusive)
        };
        let project = &mut self.projects[pidx];
        let Some(file) = project.input_mut(extension, path) else {
            return false;
        };
        if file.was_tool_used(&tool_name) {
            return false;
        }
        file.mark_tool_used(&tool_name);
        let snapshot = file.clone();
        if exclusive {
            project.remove_input(extension, path);
        }
        debug!(
            "enqueuing build for {} using {} for project {}",
            snapshot,
            tool_name,
            project.name()
        );
        self.submit(
            pidx,
            tool_id,
            Some(extension.to_string()),
            TaskInput::Single(snapshot),
            do_compile_check,
        );
        true
    }

    fn enqueue_group(
        &mut self,
        pidx: usize,
        tool_id: ToolId,
        files: Vec<InputFile>,
        do_compile_check: bool,
    ) {
        let tool_name = self.projects[pidx].toolchain.spec(tool_id).name.clone();
        let project = &mut self.projects[pidx];
        for file in &files {
            let ext = utils::extension_of(file.path());
            if let Some(canonical) = project.input_mut(&ext, file.path()) {
                canonical.mark_tool_used(&tool_name);
            }
        }
        debug!(
            "enqueuing group build of {} files using {} for project {}",
            files.len(),
            tool_name,
            project.name()
        );
        self.submit(pidx, tool_id, None, TaskInput::Group(files), do_compile_check);
    }

    /// Common enqueue bookkeeping and pool submission.
    fn submit(
        &mut self,
        pidx: usize,
        tool_id: ToolId,
        input_extension: Option<String>,
        input: TaskInput,
        do_compile_check: bool,
    ) {
        let tool = Arc::clone(self.projects[pidx].toolchain.tool(tool_id));
        let tool_name = tool.spec().name.clone();

        self.running_builds += 1;
        self.total_builds += 1;
        *self.cur_parallel.entry(tool_name.clone()).or_insert(0) += 1;
        self.reporter.tick(self.completed_builds, self.total_builds);

        let project = &mut self.projects[pidx];
        project.toolchain.create_reachability(tool_id);
        if matches!(input, TaskInput::Null) {
            // Null-input tools run exactly once per project; there is nothing
            // left that could make another task eligible.
            project.toolchain.deactivate_tool(tool_id);
        }

        let inputs = match &input {
            TaskInput::Null => None,
            TaskInput::Single(file) => Some(vec![file.clone()]),
            TaskInput::Group(files) => Some(files.clone()),
        };
        self.reporter.task_started(
            &project.info.name,
            &tool_name,
            inputs.as_ref().and_then(|files| files.first()).map(InputFile::path),
        );

        let info = Arc::clone(&project.info);
        let ledger = Arc::clone(&project.ledger);
        let ctx = TaskContext { project: pidx, tool: tool_id, tool_name, input_extension, inputs };
        let work: Work = Box::new(move || execute_task(tool, info, ledger, input, do_compile_check));
        self.pool.add_task(work, ctx);

        debug_assert!(
            self.failures > 0
                || self.cur_parallel.values().sum::<usize>() == self.running_builds
        );
    }

    /// Post-completion processing, run single-threaded on the coordinator.
    fn build_finished(&mut self, ctx: TaskContext, output: TaskOutput) {
        let TaskContext { project: pidx, tool: tool_id, tool_name, input_extension, inputs } = ctx;

        if let Some(count) = self.cur_parallel.get_mut(&tool_name) {
            *count = count.saturating_sub(1);
        }
        self.running_builds -= 1;
        self.projects[pidx].toolchain.release_reachability(tool_id);

        // Tool completion check: deactivate once the tool has no unconsumed
        // per-file inputs left and nothing can still produce files of any
        // extension it consumes.
        if self.projects[pidx].toolchain.is_tool_active(tool_id) {
            let has_remaining = input_extension.as_deref().map_or(false, |ext| {
                self.projects[pidx].inputs(ext).iter().any(|f| !f.was_tool_used(&tool_name))
            });
            if !has_remaining {
                let consumed: Vec<String> = {
                    let spec = self.projects[pidx].toolchain.spec(tool_id);
                    spec.input_files
                        .iter()
                        .flatten()
                        .chain(spec.input_groups.iter())
                        .cloned()
                        .collect()
                };
                let toolchain = &self.projects[pidx].toolchain;
                if consumed.iter().all(|ext| !toolchain.is_output_active(ext)) {
                    debug!(
                        "tool {} has finished building for project {}",
                        tool_name,
                        self.projects[pidx].name()
                    );
                    self.projects[pidx].toolchain.deactivate_tool(tool_id);
                }
            }
        }

        let input_paths: Vec<PathBuf> =
            inputs.iter().flatten().map(|f| f.path().to_path_buf()).collect();
        let chain: Option<Arc<[InputFile]>> =
            inputs.map(|files| Arc::from(files.into_boxed_slice()));

        // Register every output before probing so a multi-output task cannot
        // hand a group consumer a partial batch.
        let mut output_extensions: Vec<String> = Vec::new();
        for output_path in &output.outputs {
            trace!("checking for new tasks created by {}", output_path.display());
            self.projects[pidx].ledger.write().add_artifact(&input_paths, output_path.clone());

            let output_ext = utils::extension_of(output_path);
            if !output_extensions.contains(&output_ext) {
                output_extensions.push(output_ext.clone());
            }

            // Same-extension outputs keep the chain to their origin so the
            // up-to-date flag survives in-place rewrites.
            let new_input = match (&chain, input_extension.as_deref()) {
                (Some(chain), Some(ext)) if ext == output_ext => {
                    InputFile::derived(output_path.clone(), Arc::clone(chain), output.up_to_date)
                }
                _ => InputFile::fresh(output_path.clone(), output.up_to_date),
            };
            let tools_used = new_input.tools_used().clone();
            self.projects[pidx].add_input(&output_ext, new_input);

            // Fan the new file out to single-input consumers immediately.
            for cand in self.projects[pidx].toolchain.tools_for(Some(&output_ext), &tools_used) {
                if !self.projects[pidx].toolchain.is_tool_active(cand) {
                    continue;
                }
                if !self.can_run(pidx, cand) {
                    continue;
                }
                if !self.dependencies_met(pidx, cand) {
                    continue;
                }
                self.enqueue_single(pidx, cand, &output_ext, output_path, false);
            }
        }

        for output_ext in output_extensions {
            let is_active = self.projects[pidx].toolchain.is_output_active(&output_ext);
            trace!(
                "checking if {} is still active in {}... {}",
                output_ext,
                self.projects[pidx].name(),
                if is_active { "yes" } else { "no" }
            );

            // The last producer of this extension just finished: probe every
            // active tool of the project, and every project gated on this
            // extension across the plan.
            if !is_active {
                self.probe_project(pidx);
                for dep_pidx in self.cross_project_dep_projects.clone() {
                    self.probe_cross_project(dep_pidx, &output_ext);
                }
            }
        }

        self.completed_builds += 1;
        self.reporter.task_finished(
            self.projects[pidx].info.name.as_str(),
            &tool_name,
            &output.outputs,
            output.up_to_date,
        );
        self.reporter.tick(self.completed_builds, self.total_builds);
        debug_assert!(
            self.failures > 0
                || self.cur_parallel.values().sum::<usize>() == self.running_builds
        );

        if self.running_builds == 0 {
            // Nothing is running and finishing this build spawned nothing
            // new: the build is done.
            self.pool.stop();
        }
    }

    /// Probes all active tools of a project for newly unblocked work.
    fn probe_project(&mut self, pidx: usize) {
        for tool_id in self.projects[pidx].toolchain.active_tools() {
            if !self.can_run(pidx, tool_id) {
                continue;
            }
            if !self.dependencies_met(pidx, tool_id) {
                continue;
            }
            self.probe_tool(pidx, tool_id);
        }
    }

    /// Probes the tools of a downstream project whose cross-project
    /// dependencies include the extension that just quiesced.
    fn probe_cross_project(&mut self, pidx: usize, extension: &str) {
        for tool_id in self.projects[pidx].toolchain.active_tools() {
            if !self.can_run(pidx, tool_id) {
                continue;
            }
            if !self.projects[pidx]
                .toolchain
                .spec(tool_id)
                .cross_project_dependencies
                .contains(extension)
            {
                continue;
            }
            if !self.dependencies_met(pidx, tool_id) {
                continue;
            }
            self.probe_tool(pidx, tool_id);
        }
    }

    /// Enqueues whatever work the tool has available right now: a single
    /// null-input run, one task per unconsumed input, or a group batch.
    fn probe_tool(&mut self, pidx: usize, tool_id: ToolId) {
        let (is_null, per_file_exts, has_groups, tool_name) = {
            let spec = self.projects[pidx].toolchain.spec(tool_id);
            (
                spec.is_null_input(),
                spec.input_files.iter().flatten().cloned().collect::<Vec<_>>(),
                !spec.input_groups.is_empty(),
                spec.name.clone(),
            )
        };

        if is_null {
            if !self.can_run(pidx, tool_id) {
                return;
            }
            self.enqueue_null(pidx, tool_id);
        } else {
            for ext in &per_file_exts {
                let paths: Vec<PathBuf> = self.projects[pidx]
                    .inputs(ext)
                    .iter()
                    .filter(|f| !f.was_tool_used(&tool_name))
                    .map(|f| f.path().to_path_buf())
                    .collect();
                for path in paths {
                    if !self.can_run(pidx, tool_id) {
                        break;
                    }
                    self.enqueue_single(pidx, tool_id, ext, &path, false);
                }
            }
        }

        if !has_groups {
            return;
        }
        let files = self.group_input_files(pidx, tool_id);
        if files.is_empty() {
            return;
        }
        self.enqueue_group(pidx, tool_id, files, false);
    }
}

/// The worker body: decide whether the task can be skipped, otherwise run
/// the tool.
fn execute_task(
    tool: Arc<dyn Tool>,
    info: Arc<ProjectInfo>,
    ledger: Arc<RwLock<ArtifactLedger>>,
    input: TaskInput,
    do_compile_check: bool,
) -> Result<TaskOutput, BuildFailure> {
    let files: &[InputFile] = match &input {
        TaskInput::Null => &[],
        TaskInput::Single(file) => std::slice::from_ref(file),
        TaskInput::Group(files) => files,
    };

    if !files.is_empty() {
        let input_paths: Vec<PathBuf> = files.iter().map(|f| f.path().to_path_buf()).collect();
        if do_compile_check {
            let extension = utils::extension_of(files[0].path());
            if let Some(checker) = tool.checker(&extension) {
                let guard = ledger.read();
                if !recompile::should_recompile(&*checker, &guard, files) {
                    if let Some(outputs) = guard.last_result(&input_paths) {
                        trace!("inputs for {} unchanged, skipping", tool.spec().name);
                        return Ok(TaskOutput { outputs: outputs.to_vec(), up_to_date: true });
                    }
                }
            }
        } else if files.iter().all(InputFile::is_up_to_date) {
            let guard = ledger.read();
            if let Some(outputs) = guard.last_result(&input_paths) {
                trace!("all inputs for {} already up to date, skipping", tool.spec().name);
                return Ok(TaskOutput { outputs: outputs.to_vec(), up_to_date: true });
            }
        }
    }

    debug!(
        "processing {} with {} for project {}",
        match files.len() {
            0 => "null input".to_string(),
            n => format!("{n} input(s)"),
        },
        tool.spec().name,
        info.name
    );
    let outputs = match &input {
        TaskInput::Null => tool.run(&info, None)?,
        TaskInput::Single(file) => tool.run(&info, Some(file))?,
        TaskInput::Group(files) => tool.run_group(&info, files)?,
    };
    Ok(TaskOutput { outputs, up_to_date: false })
}
