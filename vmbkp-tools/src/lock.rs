//! Advisory inter-process locks on sidecar lock files.
//!
//! Locks are `flock(2)` locks on `<resource>.lock`, so they are released by
//! the kernel when the holding process exits.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

/// Interval between two lock attempts while waiting.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock file extension appended to the resource path.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("timeout while trying to lock")]
    TimeOut,
    #[error("{0}")]
    Other(#[from] Error),
}

impl From<std::io::Error> for LockError {
    fn from(error: std::io::Error) -> Self {
        Self::Other(error.into())
    }
}

/// Returns the lock file path used for `resource`.
pub fn lock_file_path<P: AsRef<Path>>(resource: P) -> PathBuf {
    let mut path = resource.as_ref().as_os_str().to_owned();
    path.push(LOCK_FILE_SUFFIX);
    PathBuf::from(path)
}

/// Lock handle for a single resource.
///
/// The handle knows whether it currently holds the lock. Dropping it
/// releases the lock.
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Create a handle for the lock file at `path` (nothing is opened yet).
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Create a handle guarding `resource` with a `<resource>.lock` file.
    pub fn for_resource<P: AsRef<Path>>(resource: P) -> Self {
        Self::new(lock_file_path(resource))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Acquire an exclusive lock.
    ///
    /// `timeout` is in seconds: `0` tries once, a negative value blocks until
    /// the lock is available, a positive value polls until it expires.
    pub fn lock(&mut self, timeout: i64) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| format_err!("unable to open lock file {:?} - {}", self.path, err))?;

        if timeout < 0 {
            flock(file.as_raw_fd(), FlockArg::LockExclusive)
                .map_err(|err| format_err!("unable to lock {:?} - {}", self.path, err))?;
            self.file = Some(file);
            return Ok(());
        }

        // a deadline beyond the clock range never expires
        let deadline = Instant::now().checked_add(Duration::from_secs(timeout as u64));
        let mut logged = false;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    self.file = Some(file);
                    return Ok(());
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(err) => {
                    return Err(format_err!("unable to lock {:?} - {}", self.path, err).into());
                }
            }

            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Err(LockError::TimeOut);
            }
            if !logged {
                log::info!("waiting for lock {:?}", self.path);
                logged = true;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Release the lock, does nothing if it is not held.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = flock(file.as_raw_fd(), FlockArg::Unlock) {
                log::warn!("unable to unlock {:?} - {}", self.path, err);
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Lock guard, releases the lock when it goes out of scope.
pub struct LockGuard(LockFile);

impl LockGuard {
    pub fn path(&self) -> &Path {
        self.0.path()
    }
}

/// Lock `resource` (via `<resource>.lock`) and return a guard.
pub fn lock_resource<P: AsRef<Path>>(resource: P, timeout: i64) -> Result<LockGuard, LockError> {
    let mut handle = LockFile::for_resource(resource);
    handle.lock(timeout)?;
    Ok(LockGuard(handle))
}

/// Returns true if the error is (or wraps) a lock timeout.
pub fn is_lock_timeout(err: &Error) -> bool {
    matches!(err.downcast_ref::<LockError>(), Some(LockError::TimeOut))
}

#[cfg(test)]
mod test {
    use super::*;

    fn create_testdir(name: &str) -> Result<String, Error> {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir.to_str().unwrap().to_string())
    }

    #[test]
    fn test_try_lock() -> Result<(), Error> {
        let testdir = create_testdir("try_lock")?;
        let resource = format!("{}/vm.profile", testdir);

        let mut first = LockFile::for_resource(&resource);
        first.lock(0)?;
        assert!(first.is_locked());
        assert!(first.path().ends_with("vm.profile.lock"));

        let mut second = LockFile::for_resource(&resource);
        match second.lock(0) {
            Err(LockError::TimeOut) => {}
            Err(other) => panic!("unexpected error {}", other),
            Ok(()) => panic!("lock acquired twice"),
        }
        assert!(!second.is_locked());

        first.unlock();
        first.unlock();
        assert!(!first.is_locked());

        second.lock(0)?;
        Ok(())
    }

    #[test]
    fn test_lock_timeout() -> Result<(), Error> {
        let testdir = create_testdir("timeout")?;
        let resource = format!("{}/vm.profile", testdir);

        let guard = lock_resource(&resource, 0)?;

        let start = Instant::now();
        let err = match lock_resource(&resource, 1) {
            Err(err) => err,
            Ok(_) => panic!("lock acquired twice"),
        };
        assert!(matches!(err, LockError::TimeOut));
        assert!(start.elapsed() >= Duration::from_secs(1));

        let err: Error = err.into();
        assert!(is_lock_timeout(&err));

        drop(guard);
        let _guard = lock_resource(&resource, 1)?;
        Ok(())
    }

    #[test]
    fn test_lock_released_after_wait() -> Result<(), Error> {
        let testdir = create_testdir("release")?;
        let resource = format!("{}/vm.profile", testdir);

        let guard = lock_resource(&resource, 0)?;
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            drop(guard);
        });

        let _guard = lock_resource(&resource, 5)?;
        holder.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_lock_huge_timeout() -> Result<(), Error> {
        let testdir = create_testdir("huge_timeout")?;
        let resource = format!("{}/vm.profile", testdir);

        let guard = lock_resource(&resource, 0)?;
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            drop(guard);
        });

        let _guard = lock_resource(&resource, i64::MAX)?;
        holder.join().unwrap();
        Ok(())
    }
}
