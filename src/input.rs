//! Input file bookkeeping.
//!
//! Every file the scheduler feeds to a tool is wrapped in an [`InputFile`].
//! Besides the path it tracks two things: which tools already consumed the
//! file (so cyclic tool graphs can't reprocess it), and whether the file is
//! already up to date, meaning the task that produced it was skipped because
//! its own inputs hadn't changed. The up-to-date flag is what lets a whole
//! pipeline short-circuit on a no-op rebuild: a consumer whose inputs are all
//! up to date returns its previous outputs without running.

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A single file in a project's input pool.
///
/// Immutable after creation except for the consumed-tool set, which only the
/// coordinator mutates. Workers receive clones and never write back.
#[derive(Clone, Debug)]
pub struct InputFile {
    path: PathBuf,
    /// The files whose transformation produced this one, when the producing
    /// tool's output extension matched its input extension. Keeps the chain
    /// back to the origin file so up-to-date status survives passes that
    /// rewrite files in place.
    source_inputs: Option<Arc<[InputFile]>>,
    up_to_date: bool,
    tools_used: BTreeSet<String>,
}

impl InputFile {
    /// A file with no production history, e.g. a project source file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::fresh(path, false)
    }

    /// A file starting a fresh production chain.
    pub fn fresh(path: impl Into<PathBuf>, up_to_date: bool) -> Self {
        Self { path: path.into(), source_inputs: None, up_to_date, tools_used: BTreeSet::new() }
    }

    /// A file chained to the inputs that produced it.
    ///
    /// The file counts as up to date only if the producing task was skipped
    /// and every ancestor in the chain was itself up to date.
    pub fn derived(path: impl Into<PathBuf>, sources: Arc<[InputFile]>, up_to_date: bool) -> Self {
        let up_to_date = up_to_date && sources.iter().all(InputFile::is_up_to_date);
        Self {
            path: path.into(),
            source_inputs: Some(sources),
            up_to_date,
            tools_used: BTreeSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    /// The chain of files this one was derived from, if any.
    pub fn source_inputs(&self) -> Option<&[InputFile]> {
        self.source_inputs.as_deref()
    }

    /// Records that `tool` consumed this file.
    pub fn mark_tool_used(&mut self, tool: &str) {
        self.tools_used.insert(tool.to_string());
    }

    pub fn was_tool_used(&self, tool: &str) -> bool {
        self.tools_used.contains(tool)
    }

    pub fn tools_used(&self) -> &BTreeSet<String> {
        &self.tools_used
    }
}

impl fmt::Display for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.file_name().unwrap_or(self.path.as_os_str()).to_string_lossy().fmt(f)
    }
}
