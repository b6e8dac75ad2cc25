//! Recompile decisions.
//!
//! Whether a task can be skipped is a per-tool policy. A tool may hand the
//! scheduler a [`CompileChecker`]; the default implementation compares
//! modification times, but a checker can substitute any totally ordered
//! value, fold in extra dependencies (header includes are the classic case),
//! or force a rebuild by reporting no baseline.

use crate::{input::InputFile, ledger::ArtifactLedger};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

/// The opaque value recompile decisions are computed over.
///
/// The default policy uses modification time in milliseconds since the unix
/// epoch; custom checkers may encode anything that compares the same way.
pub type RecompileStamp = u64;

/// Per-tool policy deciding whether an input and its declared dependencies
/// are newer than the prior output.
pub trait CompileChecker: Send + Sync {
    /// The value used to compute recompilability for a single file.
    fn recompile_value(&self, file: &Path) -> RecompileStamp {
        crate::utils::mtime_stamp(file)
    }

    /// Condenses the values of all inputs and dependencies into one.
    fn condense(&self, values: &[RecompileStamp]) -> RecompileStamp {
        values.iter().copied().max().unwrap_or(0)
    }

    /// Additional paths whose values must be folded in for `file`.
    fn dependencies(&self, _file: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    /// The value representing the prior output for `inputs`, or `None` to
    /// force a recompile.
    ///
    /// The default takes the minimum value across the outputs the previous
    /// run produced for these inputs; a missing output file contributes `0`
    /// so that any real input value beats it.
    fn baseline(&self, ledger: &ArtifactLedger, inputs: &[PathBuf]) -> Option<RecompileStamp> {
        let last = ledger.last_result(inputs)?;
        last.iter()
            .map(|output| if output.exists() { self.recompile_value(output) } else { 0 })
            .min()
    }

    /// Compares the condensed input value against the baseline.
    fn should_recompile(&self, condensed: RecompileStamp, baseline: RecompileStamp) -> bool {
        condensed > baseline
    }
}

/// The default modification-time policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct MtimeChecker;

impl CompileChecker for MtimeChecker {}

/// Runs the full recompile decision for a set of input files.
///
/// Walks the checker-declared dependencies transitively (a dependency may
/// itself have dependencies), condenses all collected values, and compares
/// against the baseline. A missing baseline always recompiles.
pub fn should_recompile(
    checker: &dyn CompileChecker,
    ledger: &ArtifactLedger,
    inputs: &[InputFile],
) -> bool {
    let mut values = Vec::new();
    let mut seen = HashSet::new();
    let mut pending: Vec<PathBuf> = inputs.iter().map(|f| f.path().to_path_buf()).collect();

    while let Some(path) = pending.pop() {
        if !seen.insert(path.clone()) {
            continue;
        }
        values.push(checker.recompile_value(&path));
        pending.extend(checker.dependencies(&path));
    }

    let condensed = checker.condense(&values);
    let input_paths: Vec<PathBuf> = inputs.iter().map(|f| f.path().to_path_buf()).collect();
    match checker.baseline(ledger, &input_paths) {
        Some(baseline) => checker.should_recompile(condensed, baseline),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread, time::Duration};

    fn touch(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn missing_baseline_forces_recompile() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.first");
        touch(&src, "1");

        let ledger = ArtifactLedger::default();
        let inputs = [InputFile::new(&src)];
        assert!(should_recompile(&MtimeChecker, &ledger, &inputs));
    }

    #[test]
    fn untouched_input_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.first");
        let out = dir.path().join("a.second");
        touch(&src, "1");
        thread::sleep(Duration::from_millis(10));
        touch(&out, "2");

        let file = dir.path().join("ledger.json");
        let mut ledger = ArtifactLedger::default();
        ledger.add_artifact(&[src.clone()], out);
        ledger.write(&file, false).unwrap();
        let ledger = ArtifactLedger::read(&file);

        let inputs = [InputFile::new(&src)];
        assert!(!should_recompile(&MtimeChecker, &ledger, &inputs));
    }

    #[test]
    fn newer_input_recompiles() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.first");
        let out = dir.path().join("a.second");
        touch(&out, "2");
        thread::sleep(Duration::from_millis(10));
        touch(&src, "1");

        let file = dir.path().join("ledger.json");
        let mut ledger = ArtifactLedger::default();
        ledger.add_artifact(&[src.clone()], out);
        ledger.write(&file, false).unwrap();
        let ledger = ArtifactLedger::read(&file);

        let inputs = [InputFile::new(&src)];
        assert!(should_recompile(&MtimeChecker, &ledger, &inputs));
    }

    #[test]
    fn missing_output_recompiles() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.first");
        touch(&src, "1");

        let file = dir.path().join("ledger.json");
        let mut ledger = ArtifactLedger::default();
        ledger.add_artifact(&[src.clone()], dir.path().join("deleted.second"));
        ledger.write(&file, false).unwrap();
        let ledger = ArtifactLedger::read(&file);

        let inputs = [InputFile::new(&src)];
        assert!(should_recompile(&MtimeChecker, &ledger, &inputs));
    }

    #[test]
    fn checker_declared_dependencies_are_folded_in() {
        struct WithHeader(PathBuf);
        impl CompileChecker for WithHeader {
            fn dependencies(&self, _file: &Path) -> Vec<PathBuf> {
                vec![self.0.clone()]
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.first");
        let header = dir.path().join("a.header");
        let out = dir.path().join("a.second");
        touch(&src, "1");
        thread::sleep(Duration::from_millis(10));
        touch(&out, "2");
        thread::sleep(Duration::from_millis(10));
        // header is newer than the output even though the source isn't
        touch(&header, "3");

        let file = dir.path().join("ledger.json");
        let mut ledger = ArtifactLedger::default();
        ledger.add_artifact(&[src.clone()], out);
        ledger.write(&file, false).unwrap();
        let ledger = ArtifactLedger::read(&file);

        let inputs = [InputFile::new(&src)];
        assert!(should_recompile(&WithHeader(header), &ledger, &inputs));
        assert!(!should_recompile(&MtimeChecker, &ledger, &inputs));
    }
}
