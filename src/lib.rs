//! Metadata and retention engine for incremental virtual machine backups.
//!
//! The per machine storage layer lives in [`vmbkp_datastore`], the config
//! file format in [`vmbkp_config`]. This crate holds the operations which
//! work on a whole archive root: inventory refresh, target resolution,
//! backup, check, clean and status listing.

use std::path::PathBuf;

use anyhow::{format_err, Error};

use vmbkp_config::GlobalConfig;
use vmbkp_datastore::{ArchiveManager, MachineIndex};

pub mod backup;
pub mod check;
pub mod clean;
pub mod inventory;
pub mod status;
pub mod targets;

pub use vmbkp_api_types as api_types;
pub use vmbkp_config as config;
pub use vmbkp_datastore as datastore;

/// Archive root described by the global config, together with its machine
/// index.
pub struct ArchiveRoot {
    config: GlobalConfig,
    index: MachineIndex,
}

impl ArchiveRoot {
    /// Open the machine index, the root directory must exist.
    pub fn open(config: GlobalConfig) -> Result<Self, Error> {
        let index = inventory::open_machine_index(config.all_vm_profile_path()?)?;
        Ok(Self { config, index })
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn index(&self) -> &MachineIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut MachineIndex {
        &mut self.index
    }

    pub fn vm_directory(&self, moref: &str) -> Result<PathBuf, Error> {
        self.config.vm_directory(moref)
    }

    pub fn keep_generations(&self) -> usize {
        self.config.keep_generations() as usize
    }

    /// Open (or create) the archive of a machine listed in the index.
    pub fn open_archive(&self, moref: &str) -> Result<ArchiveManager, Error> {
        let vm = self
            .index
            .vm_info(moref)
            .ok_or_else(|| format_err!("machine {} not found in the index", moref))?;
        ArchiveManager::open(self.vm_directory(moref)?, &vm)
    }

    /// Open an existing archive, `None` if the machine has none.
    pub fn open_existing_archive(&self, moref: &str) -> Result<Option<ArchiveManager>, Error> {
        ArchiveManager::open_existing(self.vm_directory(moref)?)
    }
}
