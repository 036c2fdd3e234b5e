//! Config and profile files of vmbkp.
//!
//! All files share one line oriented format (see [`parser`]), loaded into a
//! [`ConfigStore`]. [`ProfileHandle`] ties a store to its file and lock.

use std::path::PathBuf;

pub mod format;
pub mod global;
pub mod group;
pub mod parser;
pub mod profile;
pub mod store;
pub mod vm_group;

pub use global::GlobalConfig;
pub use group::Group;
pub use profile::ProfileHandle;
pub use store::{ConfigStore, EntryMap};
pub use vm_group::{VmGroupConfig, VmLookup};

/// Lock timeout (seconds) for normal operations.
pub const LOCK_TIMEOUT: i64 = 60;
/// Lock timeout for dry runs, which must never wait.
pub const DRY_RUN_LOCK_TIMEOUT: i64 = 0;

pub fn lock_timeout(dry_run: bool) -> i64 {
    if dry_run {
        DRY_RUN_LOCK_TIMEOUT
    } else {
        LOCK_TIMEOUT
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("parse error in line {line}: {content:?}")]
    Parse { line: usize, content: String },
    #[error("{0:?} is not a regular file")]
    NotRegularFile(PathBuf),
    #[error("config file path not set")]
    PathNotSet,
}
