use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Various error types
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] BuildIoError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// A tool invocation exited unsuccessfully.
    #[error(transparent)]
    Failure(#[from] BuildFailure),
    #[error("no project named `{0}`")]
    UnknownProject(String),
    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        BuildError::Message(msg.into())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", .path.display())]
pub struct BuildIoError {
    io: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.io
    }
}

/// A structured failure raised by a tool whose underlying command exited non-zero.
///
/// Carries the project and the input files the tool was invoked on, so the
/// coordinator can attribute the failure without inspecting tool internals.
#[derive(Clone, Debug)]
pub struct BuildFailure {
    pub project: String,
    pub inputs: Vec<PathBuf>,
    pub message: String,
}

impl BuildFailure {
    pub fn new(
        project: impl Into<String>,
        inputs: impl IntoIterator<Item = PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            inputs: inputs.into_iter().collect(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.project)?;
        if !self.inputs.is_empty() {
            let names = self
                .inputs
                .iter()
                .map(|p| p.file_name().unwrap_or(p.as_os_str()).to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            write!(f, " {}", names.join(", "))?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for BuildFailure {}
