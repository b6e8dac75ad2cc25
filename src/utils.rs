//! Utility functions

use crate::error::{BuildIoError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

/// Returns the extension of the given path, including the leading dot,
/// or the empty string for extensionless files.
///
/// Extensions are the type tags of the input/output graph, so `""` is a
/// perfectly valid extension and maps to files like `Makefile`.
pub fn extension_of(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

/// Canonicalize the path, platform-agnostic.
///
/// On windows this will ensure the path only consists of `\` separators and no
/// UNC prefix, which is what `dunce` provides.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, BuildIoError> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| BuildIoError::new(err, path))
}

/// Returns the same path config but with canonicalized paths.
///
/// Returns the input path unchanged if it can't be canonicalized, e.g. because
/// it does not exist yet.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Returns the file's last modification time as milliseconds since the unix
/// epoch, or `0` if the file is missing or its metadata is unreadable.
pub fn mtime_stamp(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

/// Creates the parent directory of the `file` and all its ancestors.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<(), BuildIoError> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildIoError::new(err, parent))?;
    }
    Ok(())
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| BuildIoError::new(err, path))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Serializes the value as pretty json and writes it to the file, creating
/// parent directories as needed.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(path, contents).map_err(|err| BuildIoError::new(err, path))?;
    Ok(())
}
