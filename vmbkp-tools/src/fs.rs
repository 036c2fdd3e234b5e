//! File system helpers shared by the profile and archive code.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use proxmox_sys::fs::{create_path, replace_file, CreateOptions};

/// Returns true if `path` exists and is a regular file (symlinks followed).
pub fn is_regular_file<P: AsRef<Path>>(path: P) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Atomically replace the file contents and fsync.
pub fn replace_file_synced<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    replace_file(path, data, CreateOptions::new(), true)
}

/// Path with `suffix` appended to the last component (`a/b` -> `a/b.bak`).
pub fn path_with_suffix<P: AsRef<Path>>(path: P, suffix: &str) -> PathBuf {
    let mut os = path.as_ref().as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Copy `path` to `path.bak`, returns the backup path.
pub fn make_backup_copy<P: AsRef<Path>>(path: P) -> Result<PathBuf, Error> {
    let path = path.as_ref();
    let target = path_with_suffix(path, ".bak");
    std::fs::copy(path, &target)
        .map_err(|err| format_err!("unable to copy {:?} to {:?} - {}", path, target, err))?;
    Ok(target)
}

/// Remove a directory tree, returns false if it did not exist.
pub fn remove_dir_recursive<P: AsRef<Path>>(path: P) -> Result<bool, Error> {
    let path = path.as_ref();
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(format_err!("unable to remove directory {:?} - {}", path, err)),
    }
}

/// Create a directory and its parents.
pub fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    create_path(path, None, None)
        .map(|_| ())
        .map_err(|err| format_err!("unable to create directory {:?} - {}", path, err))
}
