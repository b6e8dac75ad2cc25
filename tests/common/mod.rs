//! Shared fixtures: a tiny arithmetic toolchain.
//!
//! `.first` files hold a number; the doubler turns each into a `.second`
//! file holding the doubled value, and the summer folds all `.second` files
//! of a project into a single output. Cheap to run, and every stage is
//! observable through file contents and invocation counters.

#![allow(dead_code)]

use conveyor::{
    BuildFailure, CompileChecker, InputFile, MtimeChecker, Project, ProjectInfo, Tool, ToolSpec,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn read_number(path: &Path) -> i64 {
    fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
        .trim()
        .parse()
        .unwrap()
}

pub fn read_text(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

fn fail(project: &ProjectInfo, inputs: &[PathBuf], err: std::io::Error) -> BuildFailure {
    BuildFailure::new(&project.name, inputs.to_vec(), err.to_string())
}

/// Per-file tool: `<stem>.first` -> `<stem>.second` holding `n * factor` for
/// each configured factor. Extra outputs are named `<stem>2.second`,
/// `<stem>3.second`, ...
pub struct Doubler {
    spec: ToolSpec,
    factors: Vec<i64>,
    pub runs: AtomicUsize,
}

impl Doubler {
    pub fn new() -> Arc<Self> {
        Self::with_factors(vec![2])
    }

    /// The multi-output variant: one input yields two `.second` files.
    pub fn multi() -> Arc<Self> {
        Self::with_factors(vec![2, 4])
    }

    fn with_factors(factors: Vec<i64>) -> Arc<Self> {
        Arc::new(Self {
            spec: ToolSpec::new("doubler").input_files([".first"]).output_files([".second"]),
            factors,
            runs: AtomicUsize::new(0),
        })
    }
}

impl Tool for Doubler {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn run(
        &self,
        project: &ProjectInfo,
        input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        let input = input.expect("doubler is a per-file tool");
        self.runs.fetch_add(1, Ordering::SeqCst);

        let inputs = vec![input.path().to_path_buf()];
        fs::create_dir_all(&project.intermediate_dir)
            .map_err(|err| fail(project, &inputs, err))?;

        let stem = input.path().file_stem().unwrap().to_string_lossy();
        let value = read_number(input.path());
        let mut outputs = Vec::new();
        for (idx, factor) in self.factors.iter().enumerate() {
            let name = if idx == 0 {
                format!("{stem}.second")
            } else {
                format!("{stem}{}.second", idx + 1)
            };
            let output = project.intermediate_dir.join(name);
            fs::write(&output, (value * factor).to_string())
                .map_err(|err| fail(project, &inputs, err))?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    fn run_group(
        &self,
        _project: &ProjectInfo,
        _inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        unreachable!("doubler only takes per-file inputs")
    }

    fn checker(&self, _extension: &str) -> Option<Arc<dyn CompileChecker>> {
        Some(Arc::new(MtimeChecker))
    }
}

/// Group tool: sums all `.second` files into `<output_dir>/<project><ext>`.
/// Optionally folds in the values of upstream library files found in the
/// output directory, the way a linker consumes dependency libs.
pub struct Summer {
    spec: ToolSpec,
    output_extension: String,
    fold_in_extension: Option<String>,
    pub runs: AtomicUsize,
}

impl Summer {
    pub fn new() -> Arc<Self> {
        Self::with_output(".third", None)
    }

    pub fn with_output(output_extension: &str, fold_in_extension: Option<&str>) -> Arc<Self> {
        let mut spec = ToolSpec::new(format!("summer{output_extension}"))
            .input_groups([".second"])
            .output_files([output_extension]);
        if let Some(lib) = fold_in_extension {
            spec = spec.cross_project_dependencies([lib]);
        }
        Arc::new(Self {
            spec,
            output_extension: output_extension.to_string(),
            fold_in_extension: fold_in_extension.map(str::to_string),
            runs: AtomicUsize::new(0),
        })
    }
}

impl Tool for Summer {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn run(
        &self,
        _project: &ProjectInfo,
        _input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        unreachable!("summer only takes group inputs")
    }

    fn run_group(
        &self,
        project: &ProjectInfo,
        inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let input_paths: Vec<PathBuf> = inputs.iter().map(|f| f.path().to_path_buf()).collect();

        fs::create_dir_all(&project.output_dir).map_err(|err| fail(project, &input_paths, err))?;

        let mut sum: i64 = inputs.iter().map(|f| read_number(f.path())).sum();
        if let Some(lib_ext) = &self.fold_in_extension {
            for entry in
                fs::read_dir(&project.output_dir).map_err(|err| fail(project, &input_paths, err))?
            {
                let path = entry.map_err(|err| fail(project, &input_paths, err))?.path();
                if conveyor::utils::extension_of(&path) == *lib_ext {
                    sum += read_number(&path);
                }
            }
        }

        let output =
            project.output_dir.join(format!("{}{}", project.name, self.output_extension));
        fs::write(&output, sum.to_string()).map_err(|err| fail(project, &input_paths, err))?;
        Ok(vec![output])
    }

    fn checker(&self, _extension: &str) -> Option<Arc<dyn CompileChecker>> {
        Some(Arc::new(MtimeChecker))
    }
}

/// Null-input tool gated on `.second` quiescence; stamps out how many
/// `.second` files existed in the intermediate dir when it ran.
pub struct Stamper {
    spec: ToolSpec,
    pub runs: AtomicUsize,
}

impl Stamper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spec: ToolSpec::new("stamper").output_files([".stamp"]).dependencies([".second"]),
            runs: AtomicUsize::new(0),
        })
    }
}

impl Tool for Stamper {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn run(
        &self,
        project: &ProjectInfo,
        input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        assert!(input.is_none());
        self.runs.fetch_add(1, Ordering::SeqCst);

        let count = fs::read_dir(&project.intermediate_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| conveyor::utils::extension_of(&e.path()) == ".second")
                    .count()
            })
            .unwrap_or(0);

        fs::create_dir_all(&project.output_dir).map_err(|err| fail(project, &[], err))?;
        let output = project.output_dir.join(format!("{}.stamp", project.name));
        fs::write(&output, count.to_string()).map_err(|err| fail(project, &[], err))?;
        Ok(vec![output])
    }

    fn run_group(
        &self,
        _project: &ProjectInfo,
        _inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        unreachable!("stamper takes no inputs")
    }
}

/// A per-file tool whose command always fails.
pub struct Breaker {
    spec: ToolSpec,
    pub runs: AtomicUsize,
}

impl Breaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spec: ToolSpec::new("breaker").input_files([".first"]).output_files([".second"]),
            runs: AtomicUsize::new(0),
        })
    }
}

impl Tool for Breaker {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn run(
        &self,
        project: &ProjectInfo,
        input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let inputs = input.map(|f| vec![f.path().to_path_buf()]).unwrap_or_default();
        Err(BuildFailure::new(&project.name, inputs, "command exited with code 1"))
    }

    fn run_group(
        &self,
        _project: &ProjectInfo,
        _inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        unreachable!("breaker only takes per-file inputs")
    }
}

/// Doubler variant with a global cap of one concurrent invocation; records
/// the high-water mark of simultaneous runs.
pub struct SerialDoubler {
    spec: ToolSpec,
    active: AtomicUsize,
    pub max_seen: AtomicUsize,
    pub runs: AtomicUsize,
}

impl SerialDoubler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spec: ToolSpec::new("serial-doubler")
                .input_files([".first"])
                .output_files([".second"])
                .max_parallel(1),
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        })
    }
}

impl Tool for SerialDoubler {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn run(
        &self,
        project: &ProjectInfo,
        input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(15));

        let input = input.expect("serial-doubler is a per-file tool");
        let inputs = vec![input.path().to_path_buf()];
        let result = fs::create_dir_all(&project.intermediate_dir)
            .and_then(|()| {
                let stem = input.path().file_stem().unwrap().to_string_lossy();
                let output = project.intermediate_dir.join(format!("{stem}.second"));
                fs::write(&output, (read_number(input.path()) * 2).to_string())?;
                Ok(vec![output])
            })
            .map_err(|err| fail(project, &inputs, err));

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn run_group(
        &self,
        _project: &ProjectInfo,
        _inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        unreachable!("serial-doubler only takes per-file inputs")
    }
}

/// An exclusive consumer of `.first` files: every file it takes leaves the
/// input pool for good.
pub struct Claimer {
    spec: ToolSpec,
    pub runs: AtomicUsize,
}

impl Claimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spec: ToolSpec::new("claimer")
                .input_files([".first"])
                .output_files([".taken"])
                .exclusive(true),
            runs: AtomicUsize::new(0),
        })
    }
}

impl Tool for Claimer {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn run(
        &self,
        project: &ProjectInfo,
        input: Option<&InputFile>,
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let input = input.expect("claimer is a per-file tool");
        let inputs = vec![input.path().to_path_buf()];
        fs::create_dir_all(&project.intermediate_dir)
            .map_err(|err| fail(project, &inputs, err))?;
        let stem = input.path().file_stem().unwrap().to_string_lossy();
        let output = project.intermediate_dir.join(format!("{stem}.taken"));
        fs::write(&output, "taken").map_err(|err| fail(project, &inputs, err))?;
        Ok(vec![output])
    }

    fn run_group(
        &self,
        _project: &ProjectInfo,
        _inputs: &[InputFile],
    ) -> Result<Vec<PathBuf>, BuildFailure> {
        unreachable!("claimer only takes per-file inputs")
    }
}

/// Writes `n` numbered `.first` files (containing 1..=n) under `dir` and
/// returns their paths.
pub fn write_sources(dir: &Path, n: usize) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    (1..=n)
        .map(|i| {
            let path = dir.join(format!("{i}.first"));
            fs::write(&path, i.to_string()).unwrap();
            path
        })
        .collect()
}

/// A project rooted at `<root>/<name>` with its own intermediate dir, the
/// shared `<root>/out` output dir, and `n` numbered source files.
pub fn arith_project(
    root: &Path,
    name: &str,
    n: usize,
    tools: Vec<Arc<dyn Tool>>,
) -> Project {
    let workdir = root.join(name);
    let sources = write_sources(&workdir, n);
    Project::builder(name)
        .workdir(&workdir)
        .intermediate_dir(workdir.join("intermediate"))
        .output_dir(root.join("out"))
        .tools(tools)
        .inputs(sources)
        .build()
}
