//! The tool contract and per-project toolchain state.
//!
//! A [`Tool`] is a unit of work with declared consumed and produced file
//! extensions. The scheduler treats tools as opaque: everything it needs to
//! route work is in the [`ToolSpec`] descriptor, and everything a tool does
//! happens inside [`Tool::run`] / [`Tool::run_group`] on a worker thread.
//!
//! The [`Toolchain`] holds the per-project runtime state the scheduler works
//! against: which tools are still active and the reachability multiset. Each
//! scheduled-or-running task claims every extension its tool can produce; an
//! extension with no remaining claims is *inactive*, which is the signal that
//! unlocks group consumers and dependent tools.

use crate::{
    error::{BuildFailure, Result},
    input::InputFile,
    project::ProjectInfo,
    recompile::CompileChecker,
};
use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
};

/// Index of a tool within its project's toolchain.
pub type ToolId = usize;

/// Class-level tool metadata.
///
/// Extensions include the leading dot (`".o"`); the empty string denotes
/// extensionless files.
#[derive(Clone, Debug, Default)]
pub struct ToolSpec {
    /// Display name, also the key for the global parallelism cap.
    pub name: String,
    /// Extensions consumed one file at a time via [`Tool::run`]. `None` means
    /// the tool takes no per-file inputs.
    pub input_files: Option<BTreeSet<String>>,
    /// Extensions consumed as one batch via [`Tool::run_group`]. The batch is
    /// dispatched only once every producer of every listed extension has gone
    /// inactive for the project.
    pub input_groups: BTreeSet<String>,
    /// Extensions this tool produces.
    pub output_files: BTreeSet<String>,
    /// Extensions whose production must quiesce in this project before the
    /// tool may run, even though they are not inputs.
    pub dependencies: BTreeSet<String>,
    /// Extensions whose production must quiesce in every direct upstream
    /// project before the tool may run.
    pub cross_project_dependencies: BTreeSet<String>,
    /// Architectures the tool supports; `None` means all.
    pub supported_architectures: Option<BTreeSet<String>>,
    /// Platforms the tool supports; `None` means all.
    pub supported_platforms: Option<BTreeSet<String>>,
    /// Cap on simultaneous invocations of this tool across all projects.
    /// `0` means unlimited.
    pub max_parallel: usize,
    /// When true, consuming an input removes it from the project's input
    /// pool, so no later tool re-consumes it.
    pub exclusive: bool,
}

fn ext_set<I, S>(extensions: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    extensions.into_iter().map(Into::into).collect()
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    #[must_use]
    pub fn input_files<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_files = Some(ext_set(extensions));
        self
    }

    #[must_use]
    pub fn input_groups<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_groups = ext_set(extensions);
        self
    }

    #[must_use]
    pub fn output_files<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_files = ext_set(extensions);
        self
    }

    #[must_use]
    pub fn dependencies<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = ext_set(extensions);
        self
    }

    #[must_use]
    pub fn cross_project_dependencies<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cross_project_dependencies = ext_set(extensions);
        self
    }

    #[must_use]
    pub fn supported_architectures<I, S>(mut self, architectures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_architectures = Some(ext_set(architectures));
        self
    }

    #[must_use]
    pub fn supported_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_platforms = Some(ext_set(platforms));
        self
    }

    #[must_use]
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Whether this tool takes no inputs at all; such tools run exactly once
    /// per project, as soon as their dependency extensions are inactive.
    pub fn is_null_input(&self) -> bool {
        self.input_files.is_none() && self.input_groups.is_empty()
    }

    /// The full set of extensions the tool consumes, per-file and grouped.
    pub fn consumed_extensions(&self) -> BTreeSet<String> {
        match &self.input_files {
            Some(files) => files.union(&self.input_groups).cloned().collect(),
            None => self.input_groups.clone(),
        }
    }

    /// Whether the tool can run for the given architecture and platform.
    pub fn supports(&self, architecture: &str, platform: &str) -> bool {
        let arch_ok = self
            .supported_architectures
            .as_ref()
            .map_or(true, |archs| archs.contains(architecture));
        let platform_ok =
            self.supported_platforms.as_ref().map_or(true, |plats| plats.contains(platform));
        arch_ok && platform_ok
    }
}

/// A unit of work in a toolchain.
///
/// `run` and `run_group` execute massively in parallel with other build steps
/// on worker threads and must not assume exclusive access to anything but
/// their arguments; shared state inside a tool has to be self-protected.
pub trait Tool: Send + Sync {
    /// The tool's class-level metadata.
    fn spec(&self) -> &ToolSpec;

    /// Called once per project after dependency resolution, before the first
    /// task is scheduled.
    fn setup_for_project(&self, _project: &ProjectInfo) -> Result<()> {
        Ok(())
    }

    /// Executes a single build step. `input` is `None` for null-input tools.
    ///
    /// Returns the files created, all of which must carry an extension listed
    /// in [`ToolSpec::output_files`].
    fn run(
        &self,
        project: &ProjectInfo,
        input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure>;

    /// Executes a batch build step over group inputs.
    fn run_group(
        &self,
        project: &ProjectInfo,
        inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure>;

    /// The recompile policy for inputs of the given extension, if the tool
    /// supports skipping work.
    fn checker(&self, _extension: &str) -> Option<Arc<dyn CompileChecker>> {
        None
    }
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    active: bool,
}

/// Per-project toolchain state.
pub struct Toolchain {
    tools: Vec<ToolEntry>,
    /// Per tool: every extension a task of this tool can lead to, i.e. its
    /// own outputs plus everything transitively producible from them through
    /// the tool graph. Static once the toolchain is assembled.
    reachable_outputs: Vec<BTreeSet<String>>,
    /// Reachability claims: how many scheduled-or-running tasks can still
    /// lead to files of each extension.
    reachability: HashMap<String, usize>,
}

impl Toolchain {
    /// Assembles the toolchain for a project, dropping tools that do not
    /// support the project's architecture or the host platform.
    pub fn assemble(
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
        architecture: &str,
        platform: &str,
    ) -> Self {
        let tools: Vec<ToolEntry> = tools
            .into_iter()
            .filter(|tool| {
                let supported = tool.spec().supports(architecture, platform);
                if !supported {
                    debug!(
                        "tool {} does not support {}/{}, excluding",
                        tool.spec().name,
                        architecture,
                        platform
                    );
                }
                supported
            })
            .map(|tool| ToolEntry { tool, active: true })
            .collect();

        let reachable_outputs =
            tools.iter().map(|entry| transitive_outputs(&tools, entry.tool.spec())).collect();
        Self { tools, reachable_outputs, reachability: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool(&self, id: ToolId) -> &Arc<dyn Tool> {
        &self.tools[id].tool
    }

    pub fn spec(&self, id: ToolId) -> &ToolSpec {
        self.tools[id].tool.spec()
    }

    /// All tools, active or not, in toolchain order.
    pub fn all_tools(&self) -> Vec<ToolId> {
        (0..self.tools.len()).collect()
    }

    /// The tools that have not been deactivated, in toolchain order.
    pub fn active_tools(&self) -> Vec<ToolId> {
        self.tools
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.active)
            .map(|(id, _)| id)
            .collect()
    }

    /// The active tools that consume `extension` per-file and are not listed
    /// in `already_used`. With `extension == None`, the active null-input
    /// tools instead.
    pub fn tools_for(
        &self,
        extension: Option<&str>,
        already_used: &BTreeSet<String>,
    ) -> Vec<ToolId> {
        self.tools
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.active)
            .filter(|(_, entry)| {
                let spec = entry.tool.spec();
                match extension {
                    None => spec.is_null_input(),
                    Some(ext) => {
                        spec.input_files.as_ref().map_or(false, |files| files.contains(ext))
                            && !already_used.contains(&spec.name)
                    }
                }
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_tool_active(&self, id: ToolId) -> bool {
        self.tools[id].active
    }

    /// Permanently deactivates the tool; no further tasks will be enqueued
    /// for it. Idempotent.
    pub fn deactivate_tool(&mut self, id: ToolId) {
        self.tools[id].active = false;
    }

    /// Claims every extension a task of the tool can lead to, its own
    /// outputs and everything producible downstream of them. Called
    /// immediately before a task for the tool is enqueued.
    ///
    /// Claiming transitively is what gates consumers correctly: a linker
    /// waiting on `.lib` quiescence must stay blocked while compile tasks
    /// are still in flight, because each of those can still feed the tool
    /// that produces the `.lib`.
    pub fn create_reachability(&mut self, id: ToolId) {
        for ext in &self.reachable_outputs[id] {
            *self.reachability.entry(ext.clone()).or_insert(0) += 1;
        }
    }

    /// Releases the claims of one completed task. Called at task completion,
    /// before downstream probing, because downstream eligibility depends on
    /// the quiescence of the extensions this tool produces.
    pub fn release_reachability(&mut self, id: ToolId) {
        for ext in &self.reachable_outputs[id] {
            match self.reachability.get_mut(ext) {
                Some(claims) if *claims > 0 => *claims -= 1,
                _ => debug_assert!(false, "reachability released more often than created: {ext}"),
            }
        }
    }

    /// Whether anything scheduled or running can still produce `extension`.
    pub fn is_output_active(&self, extension: &str) -> bool {
        self.reachability.get(extension).map_or(false, |claims| *claims > 0)
    }

    /// Whether any tool still claims any extension. Non-zero claims after
    /// the build loop mean the project did not finish building.
    pub fn has_any_reachability(&self) -> bool {
        self.reachability.values().any(|claims| *claims > 0)
    }

    /// Static reachability query over the tool graph: can a chain of tools
    /// starting from `tool`'s outputs eventually produce `extension`?
    ///
    /// Used by the pre-build filter to avoid queuing a tool whose dependency
    /// extension might still be produced later by another branch of the
    /// graph. The query covers all tools, deactivated ones included, since
    /// it describes the graph, not the current schedule.
    pub fn can_create_output(&self, tool: ToolId, extension: &str) -> bool {
        self.reachable_outputs[tool].contains(extension)
    }
}

/// The outputs of `spec` plus every extension transitively producible from
/// them by chaining through `tools`.
fn transitive_outputs(tools: &[ToolEntry], spec: &ToolSpec) -> BTreeSet<String> {
    let mut reachable = spec.output_files.clone();
    let mut pending: Vec<String> = reachable.iter().cloned().collect();

    while let Some(ext) = pending.pop() {
        for entry in tools {
            let other = entry.tool.spec();
            if !other.consumed_extensions().contains(&ext) {
                continue;
            }
            for output in &other.output_files {
                if reachable.insert(output.clone()) {
                    pending.push(output.clone());
                }
            }
        }
    }
    reachable
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("tools", &self.tools.iter().map(|t| &t.tool.spec().name).collect::<Vec<_>>())
            .field("reachability", &self.reachability)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTool(ToolSpec);

    impl Tool for StubTool {
        fn spec(&self) -> &ToolSpec {
            &self.0
        }

        fn run(
            &self,
            _project: &ProjectInfo,
            _input: Option<&InputFile>,
        ) -> Result<Vec<PathBuf>, BuildFailure> {
            Ok(Vec::new())
        }

        fn run_group(
            &self,
            _project: &ProjectInfo,
            _inputs: &[InputFile],
        ) -> Result<Vec<PathBuf>, BuildFailure> {
            Ok(Vec::new())
        }
    }

    fn tool(spec: ToolSpec) -> Arc<dyn Tool> {
        Arc::new(StubTool(spec))
    }

    fn pipeline() -> Toolchain {
        Toolchain::assemble(
            [
                tool(ToolSpec::new("doubler").input_files([".first"]).output_files([".second"])),
                tool(ToolSpec::new("summer").input_groups([".second"]).output_files([".third"])),
            ],
            "native",
            "any",
        )
    }

    #[test]
    fn reachability_claims_are_counted_per_task() {
        let mut chain = pipeline();
        assert!(!chain.is_output_active(".second"));

        chain.create_reachability(0);
        chain.create_reachability(0);
        assert!(chain.is_output_active(".second"));

        chain.release_reachability(0);
        assert!(chain.is_output_active(".second"));
        chain.release_reachability(0);
        assert!(!chain.is_output_active(".second"));
        assert!(!chain.has_any_reachability());
    }

    #[test]
    fn reachability_claims_are_transitive() {
        let mut chain = pipeline();
        // a scheduled doubler task can still feed the summer, so it claims
        // the summer's output extension too
        chain.create_reachability(0);
        assert!(chain.is_output_active(".third"));
        chain.release_reachability(0);
        assert!(!chain.is_output_active(".third"));

        // the summer's own claims stop at its output
        chain.create_reachability(1);
        assert!(chain.is_output_active(".third"));
        assert!(!chain.is_output_active(".second"));
        chain.release_reachability(1);
        assert!(!chain.has_any_reachability());
    }

    #[test]
    fn deactivation_is_permanent_and_idempotent() {
        let mut chain = pipeline();
        assert!(chain.is_tool_active(0));
        chain.deactivate_tool(0);
        chain.deactivate_tool(0);
        assert!(!chain.is_tool_active(0));
        assert_eq!(chain.active_tools(), vec![1]);
        assert_eq!(chain.all_tools(), vec![0, 1]);
    }

    #[test]
    fn tools_for_filters_consumed_and_inactive() {
        let mut chain = pipeline();
        let none = BTreeSet::new();
        assert_eq!(chain.tools_for(Some(".first"), &none), vec![0]);

        let used: BTreeSet<String> = ["doubler".to_string()].into();
        assert!(chain.tools_for(Some(".first"), &used).is_empty());

        chain.deactivate_tool(0);
        assert!(chain.tools_for(Some(".first"), &none).is_empty());
    }

    #[test]
    fn tools_for_none_returns_null_input_tools() {
        let chain = Toolchain::assemble(
            [
                tool(ToolSpec::new("stamper").output_files([".stamp"])),
                tool(ToolSpec::new("summer").input_groups([".second"]).output_files([".third"])),
            ],
            "native",
            "any",
        );
        // the group tool takes no per-file inputs but is not a null-input tool
        assert_eq!(chain.tools_for(None, &BTreeSet::new()), vec![0]);
    }

    #[test]
    fn can_create_output_walks_the_graph() {
        let chain = pipeline();
        assert!(chain.can_create_output(0, ".second"));
        assert!(chain.can_create_output(0, ".third"));
        assert!(chain.can_create_output(1, ".third"));
        assert!(!chain.can_create_output(1, ".second"));
        assert!(!chain.can_create_output(0, ".first"));
    }

    #[test]
    fn can_create_output_handles_cycles() {
        let chain = Toolchain::assemble(
            [
                tool(ToolSpec::new("a").input_files([".x"]).output_files([".y"])),
                tool(ToolSpec::new("b").input_files([".y"]).output_files([".x"])),
            ],
            "native",
            "any",
        );
        assert!(chain.can_create_output(0, ".x"));
        assert!(!chain.can_create_output(0, ".z"));
    }

    #[test]
    fn assemble_filters_unsupported_tools() {
        let chain = Toolchain::assemble(
            [
                tool(ToolSpec::new("portable").input_files([".c"]).output_files([".o"])),
                tool(
                    ToolSpec::new("msvc-only")
                        .input_files([".c"])
                        .output_files([".obj"])
                        .supported_platforms(["windows"]),
                ),
                tool(
                    ToolSpec::new("arm-only")
                        .input_files([".c"])
                        .output_files([".o"])
                        .supported_architectures(["arm64"]),
                ),
            ],
            "x64",
            "linux",
        );
        assert_eq!(chain.all_tools().len(), 1);
        assert_eq!(chain.spec(0).name, "portable");
    }
}
