use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use vmbkp_tools::lock::{lock_resource, LockError, LockGuard};

use crate::ConfigStore;

/// A config store together with the file it is loaded from and saved to.
///
/// Mutations only touch the in-memory store until `write()` is called.
/// Callers serialize access through `lock()`, which guards the file with a
/// `<path>.lock` sidecar.
#[derive(Clone, Debug)]
pub struct ProfileHandle {
    path: PathBuf,
    store: ConfigStore,
}

impl ProfileHandle {
    /// Create a handle with an empty store, nothing is read or written.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let mut store = ConfigStore::new();
        store.set_path(&path);
        Self { path, store }
    }

    /// Load an existing profile, `None` if the file does not exist.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Option<Self>, Error> {
        let path = path.into();
        Ok(ConfigStore::read_optional(&path)?.map(|store| Self { path, store }))
    }

    /// Load an existing profile or start with an empty one.
    ///
    /// The flag is true if the file was read.
    pub fn load_or_new<P: Into<PathBuf>>(path: P) -> Result<(Self, bool), Error> {
        let path = path.into();
        match Self::load(path.clone())? {
            Some(handle) => Ok((handle, true)),
            None => Ok((Self::new(path), false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory containing the profile file.
    pub fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    pub fn exists(&self) -> bool {
        vmbkp_tools::fs::is_regular_file(&self.path)
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConfigStore {
        &mut self.store
    }

    /// Discard in-memory changes and read the file again.
    pub fn reload(&mut self) -> Result<(), Error> {
        self.store = ConfigStore::read(&self.path)?;
        Ok(())
    }

    pub fn write(&self) -> Result<(), Error> {
        self.store
            .write_to(&self.path)
            .map_err(|err| format_err!("unable to write profile {:?} - {}", self.path, err))
    }

    /// Copy the current file to `<path>.bak`.
    pub fn make_backup(&self) -> Result<PathBuf, Error> {
        vmbkp_tools::fs::make_backup_copy(&self.path)
    }

    /// Lock the profile file (see `LockFile::lock` for `timeout`).
    pub fn lock(&self, timeout: i64) -> Result<LockGuard, LockError> {
        lock_resource(&self.path, timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::Group;

    fn create_testdir(name: &str) -> Result<String, Error> {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir.to_str().unwrap().to_string())
    }

    #[test]
    fn test_profile_handle() -> Result<(), Error> {
        let testdir = create_testdir("handle")?;
        let path = format!("{}/vmbkp_vm.profile", testdir);

        let (mut handle, loaded) = ProfileHandle::load_or_new(&path)?;
        assert!(!loaded);
        assert!(!handle.exists());
        assert_eq!(handle.directory(), Path::new(&testdir));
        assert_eq!(handle.store().path()?, PathBuf::from(&path));

        let meta = Group::new("meta");
        handle.store_mut().put(&meta, "name", "web01");
        handle.write()?;
        assert!(handle.exists());

        handle.store_mut().put(&meta, "name", "changed");
        handle.reload()?;
        assert_eq!(handle.store().get(&meta, "name"), Some("web01"));

        let bak = handle.make_backup()?;
        assert!(bak.to_string_lossy().ends_with("vmbkp_vm.profile.bak"));

        let (loaded_handle, loaded) = ProfileHandle::load_or_new(&path)?;
        assert!(loaded);
        assert_eq!(loaded_handle.store(), handle.store());

        let _guard = handle.lock(0)?;
        assert!(matches!(loaded_handle.lock(0), Err(LockError::TimeOut)));
        Ok(())
    }
}
