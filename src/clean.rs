//! Clean mode: removes the artifacts of previous builds.
//!
//! Every artifact the ledger remembers is deleted individually; directories
//! are only removed when nothing but empty directory skeletons would be lost,
//! so user files sitting next to build outputs survive a clean.

use crate::{error::Result, project::Project, report::Reporter};
use std::{fs, path::Path};
use walkdir::WalkDir;

/// Deletes the artifacts recorded for the given projects.
///
/// With `keep_artifacts_and_directories` (rebuild mode) the output
/// directories and the persisted ledgers are left in place; a full clean
/// also removes the per-project state directory, the intermediate directory
/// and the output directory when they contain no files.
pub(crate) fn clean(
    projects: &[Project],
    keep_artifacts_and_directories: bool,
    reporter: &dyn Reporter,
) -> Result<()> {
    reporter.build_message("Cleaning...");

    for project in projects {
        debug!("cleaning project {}", project.name());
        {
            let ledger = project.ledger.read();
            for artifact in ledger.all_outputs() {
                if artifact.exists() {
                    trace!("removing {}", artifact.display());
                    fs::remove_file(artifact)
                        .map_err(|err| crate::error::BuildError::io(err, artifact))?;
                }
            }
        }

        if !keep_artifacts_and_directories {
            let settings = project.info().settings_path();
            if settings.exists() {
                fs::remove_file(&settings)
                    .map_err(|err| crate::error::BuildError::io(err, &settings))?;
            }
            project.ledger.write().clear();

            remove_dir_if_possible(&project.info().workdir.join(".conveyor"))?;
            remove_dir_if_possible(&project.info().intermediate_dir)?;
            remove_dir_if_possible(&project.info().output_dir)?;
        }
    }
    Ok(())
}

/// Removes `dir` if it exists and contains only directories, then prunes any
/// parent directories the removal left empty.
fn remove_dir_if_possible(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let contains_files = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| !entry.file_type().is_dir());
    if contains_files {
        return Ok(());
    }

    debug!("removing {}", dir.display());
    fs::remove_dir_all(dir).map_err(|err| crate::error::BuildError::io(err, dir))?;

    let mut parent = dir.parent();
    while let Some(current) = parent {
        match current.read_dir() {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    fs::remove_dir(current)
                        .map_err(|err| crate::error::BuildError::io(err, current))?;
                    parent = current.parent();
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    Ok(())
}
