//! The artifact ledger: a per-project, persistent record of which output
//! paths a given set of input paths produced in the previous run.
//!
//! The ledger backs two decisions. The recompile baseline reads it to find
//! the previous outputs whose timestamps a changed input must beat, and clean
//! mode walks it to delete everything a prior run created. The on-disk format
//! carries a `_format` version string so stale files from older releases are
//! discarded instead of misread.

use crate::{
    error::Result,
    utils,
};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Current version of the serialized ledger format.
const LEDGER_FORMAT_VERSION: &str = "conveyor-artifacts-1";

/// Stable fingerprint of a set of input paths.
///
/// Paths are sorted before hashing so the fingerprint does not depend on the
/// completion order that assembled the set, which varies from run to run.
pub fn fingerprint(inputs: &[PathBuf]) -> String {
    let mut sorted: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
    sorted.sort_unstable();
    let mut hasher = Md5::new();
    for path in sorted {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(rename = "_format")]
    format: String,
    artifacts: BTreeMap<String, Vec<PathBuf>>,
}

/// Per-project mapping from input-file-set fingerprints to the output paths
/// produced last run.
///
/// Two generations are kept in memory: `previous` is what the last run left
/// on disk and feeds the recompile baseline; `current` is rebuilt from
/// scratch as tasks complete. At the end of a fully successful run only
/// `current` is persisted, so entries for inputs that no longer exist age
/// out naturally.
#[derive(Debug, Default)]
pub struct ArtifactLedger {
    previous: BTreeMap<String, Vec<PathBuf>>,
    current: BTreeMap<String, Vec<PathBuf>>,
}

impl ArtifactLedger {
    /// Reads the ledger file at `path`, returning an empty ledger if the file
    /// does not exist or was written by an incompatible version.
    pub fn read(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match utils::read_json_file::<LedgerFile>(path) {
            Ok(file) if file.format == LEDGER_FORMAT_VERSION => {
                trace!("read artifact ledger with {} entries from {}", file.artifacts.len(), path.display());
                Self { previous: file.artifacts, current: BTreeMap::new() }
            }
            Ok(file) => {
                debug!("discarding ledger {} with unknown format \"{}\"", path.display(), file.format);
                Self::default()
            }
            Err(err) => {
                debug!("discarding unreadable ledger {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    /// Writes the ledger to `path`.
    ///
    /// A clean run persists only the entries recorded this run. When the run
    /// had failures, previous entries not superseded are retained so a later
    /// clean can still find artifacts of tasks that never got to execute.
    pub fn write(&self, path: impl AsRef<Path>, retain_previous: bool) -> Result<()> {
        let mut artifacts = if retain_previous { self.previous.clone() } else { BTreeMap::new() };
        artifacts.extend(self.current.iter().map(|(k, v)| (k.clone(), v.clone())));
        let file = LedgerFile { format: LEDGER_FORMAT_VERSION.to_string(), artifacts };
        utils::write_json_file(&file, path)
    }

    /// Records that building `inputs` produced `output`.
    pub fn add_artifact(&mut self, inputs: &[PathBuf], output: PathBuf) {
        let entry = self.current.entry(fingerprint(inputs)).or_default();
        if !entry.contains(&output) {
            entry.push(output);
        }
    }

    /// The outputs the previous run produced for `inputs`, if any.
    pub fn last_result(&self, inputs: &[PathBuf]) -> Option<&[PathBuf]> {
        self.previous.get(&fingerprint(inputs)).map(Vec::as_slice)
    }

    /// All output paths known to the ledger, across both generations.
    pub fn all_outputs(&self) -> impl Iterator<Item = &Path> {
        self.previous.values().chain(self.current.values()).flatten().map(PathBuf::as_path)
    }

    /// Whether the previous generation recorded anything at all.
    pub fn is_empty(&self) -> bool {
        self.previous.is_empty() && self.current.is_empty()
    }

    /// Drops everything, previous generation included. Used by clean mode.
    pub fn clear(&mut self) {
        self.previous.clear();
        self.current.clear();
    }
}
