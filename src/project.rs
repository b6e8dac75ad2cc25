//! Project model.
//!
//! A [`Project`] is the unit the scheduler drives to completion: a named
//! working directory with a toolchain, an input pool keyed by extension, and
//! an artifact ledger from the previous run. The immutable identity half
//! lives in [`ProjectInfo`] behind an `Arc` so worker threads can read paths
//! and names while the coordinator owns all mutable state.

use crate::{
    input::InputFile,
    ledger::ArtifactLedger,
    toolchain::{Tool, Toolchain},
    utils,
};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The immutable identity of a project, shared with worker threads.
#[derive(Clone, Debug)]
pub struct ProjectInfo {
    /// Unique project name.
    pub name: String,
    /// Directory all relative project paths resolve against.
    pub workdir: PathBuf,
    /// Where tools place intermediate files.
    pub intermediate_dir: PathBuf,
    /// Where tools place final outputs.
    pub output_dir: PathBuf,
    /// Architecture the project is being built for.
    pub architecture: String,
}

impl ProjectInfo {
    /// The directory holding persisted state for this project.
    pub fn settings_dir(&self) -> PathBuf {
        self.workdir.join(".conveyor").join("settings")
    }

    /// The artifact ledger file for this project.
    pub fn settings_path(&self) -> PathBuf {
        self.settings_dir().join(format!("{}.json", self.name))
    }
}

impl std::fmt::Display for ProjectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

/// A concrete project as produced by plan evaluation.
///
/// Mutated only by the scheduler (new outputs become new inputs), frozen at
/// termination with the ledger flushed to disk.
pub struct Project {
    pub(crate) info: Arc<ProjectInfo>,
    pub(crate) toolchain: Toolchain,
    /// Input pool: extension (including `""`) to the ordered files of that
    /// extension.
    pub(crate) input_files: BTreeMap<String, Vec<InputFile>>,
    /// Upstream projects by name, as declared.
    pub(crate) dependency_names: Vec<String>,
    /// Upstream projects resolved to indices into the session's project
    /// list. Populated by dependency resolution before the first task.
    pub(crate) dependencies: Vec<usize>,
    pub(crate) ledger: Arc<RwLock<ArtifactLedger>>,
}

impl Project {
    /// Convenience function to call `ProjectBuilder::new(name)`.
    pub fn builder(name: impl Into<String>) -> ProjectBuilder {
        ProjectBuilder::new(name)
    }

    pub fn info(&self) -> &Arc<ProjectInfo> {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn inputs(&self, extension: &str) -> &[InputFile] {
        self.input_files.get(extension).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn has_inputs(&self, extension: &str) -> bool {
        !self.inputs(extension).is_empty()
    }

    pub(crate) fn input_mut(&mut self, extension: &str, path: &Path) -> Option<&mut InputFile> {
        self.input_files.get_mut(extension)?.iter_mut().find(|file| file.path() == path)
    }

    pub(crate) fn add_input(&mut self, extension: &str, file: InputFile) {
        self.input_files.entry(extension.to_string()).or_default().push(file);
    }

    pub(crate) fn remove_input(&mut self, extension: &str, path: &Path) {
        if let Some(files) = self.input_files.get_mut(extension) {
            files.retain(|file| file.path() != path);
        }
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("info", &self.info)
            .field("toolchain", &self.toolchain)
            .field("dependencies", &self.dependency_names)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Project`].
pub struct ProjectBuilder {
    name: String,
    workdir: Option<PathBuf>,
    intermediate_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    architecture: String,
    tools: Vec<Arc<dyn Tool>>,
    inputs: Vec<PathBuf>,
    dependency_names: Vec<String>,
}

impl ProjectBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workdir: None,
            intermediate_dir: None,
            output_dir: None,
            architecture: "native".to_string(),
            tools: Vec::new(),
            inputs: Vec::new(),
            dependency_names: Vec::new(),
        }
    }

    /// The project's working directory. Defaults to the current directory.
    #[must_use]
    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Where intermediate files go. Defaults to `<workdir>/intermediate`.
    #[must_use]
    pub fn intermediate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.intermediate_dir = Some(dir.into());
        self
    }

    /// Where final outputs go. Defaults to `<workdir>/out`.
    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Adds a source input file; relative paths resolve against the workdir.
    #[must_use]
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    #[must_use]
    pub fn inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Declares a dependency on the named upstream project.
    #[must_use]
    pub fn depends_on(mut self, project: impl Into<String>) -> Self {
        self.dependency_names.push(project.into());
        self
    }

    pub fn build(self) -> Project {
        let workdir = utils::canonicalized(
            self.workdir.unwrap_or_else(|| PathBuf::from(".")),
        );
        let intermediate_dir = self.intermediate_dir.unwrap_or_else(|| workdir.join("intermediate"));
        let output_dir = self.output_dir.unwrap_or_else(|| workdir.join("out"));

        let info = Arc::new(ProjectInfo {
            name: self.name,
            intermediate_dir,
            output_dir,
            architecture: self.architecture,
            workdir: workdir.clone(),
        });

        let toolchain =
            Toolchain::assemble(self.tools, &info.architecture, std::env::consts::OS);

        let mut input_files: BTreeMap<String, Vec<InputFile>> = BTreeMap::new();
        for path in self.inputs {
            let path = if path.is_absolute() { path } else { workdir.join(path) };
            let path = utils::canonicalized(path);
            let files = input_files.entry(utils::extension_of(&path)).or_default();
            if files.iter().all(|file| file.path() != path) {
                files.push(InputFile::new(path));
            }
        }

        Project {
            info,
            toolchain,
            input_files,
            dependency_names: self.dependency_names,
            dependencies: Vec::new(),
            ledger: Arc::new(RwLock::new(ArtifactLedger::default())),
        }
    }
}
