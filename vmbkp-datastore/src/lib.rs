//! Archive storage layer of vmbkp.
//!
//! # Layout
//!
//! ```text
//! <root>/vmbkp_all_vm.profile          machine index
//! <root>/<moref>/vmbkp_vm.profile      generation chain of one machine
//! <root>/<moref>/<generation>/         one directory per generation
//!     vmbkp_generation.profile         disk manifest
//!     0.dump.gz 0.digest.gz            full dump and digest of disk 0
//!     0.rdiff.gz                       reverse delta to the previous dump
//!     0.bmp                            changed block bitmap
//! ```
//!
//! # Generations
//!
//! Each backup allocates a new generation id (never reused). A generation
//! depends on the latest succeeded generation at allocation time. Disks are
//! correlated across generations by UUID, the disk index is local to one
//! manifest.
//!
//! Only the newest copy of a disk is kept as a full dump. Older generations
//! are reconstructed by replaying reverse deltas stored in the following
//! generations, see [`ArchiveManager::dump_paths_for_restore`].
//!
//! # Locking
//!
//! All mutations of a machine's chain happen while holding the lock on its
//! `vmbkp_vm.profile` (see [`ArchiveManager::lock_vm`]). The machine index
//! has its own lock which is only held during inventory refresh.

pub mod archive_manager;
pub mod backup;
pub mod bitmap;
pub mod chain;
pub mod dump_tool;
pub mod machine_index;
pub mod manifest;
pub mod prune;

pub use archive_manager::{
    archive_state, determine_mode, ArchiveManager, ArchiveState, DeferredTask,
};
pub use backup::{backup_disk, restore_files_present, ChangedBlockSource};
pub use bitmap::ChangedBlockBitmap;
pub use chain::{GenerationChain, GenerationId};
pub use dump_tool::{DiskDumper, DumpRequest, VmdkBkp};
pub use machine_index::{InventoryEntry, MachineIndex};
pub use manifest::{GenerationManifest, GenerationSetup};

use std::path::PathBuf;

/// Chain integrity failures.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("generation {0} is not marked as succeeded")]
    GenerationNotSucceeded(GenerationId),
    #[error("copy of disk {uuid} failed in generation {generation}")]
    DiskNotSucceeded {
        generation: GenerationId,
        uuid: String,
    },
    #[error("disk {uuid} not found in generation {generation}")]
    DiskNotFound {
        generation: GenerationId,
        uuid: String,
    },
    #[error("generation {generation} has neither dump, delta nor unchanged mark for disk {uuid}")]
    BrokenChain {
        generation: GenerationId,
        uuid: String,
    },
    #[error("no full dump found")]
    NoDumpFound,
    #[error("profile {0:?} is not clean, check the archive")]
    NotClean(PathBuf),
    #[error("moref mismatch - expected {expected}, found {found}")]
    MorefMismatch { expected: String, found: String },
}

/// Current time in milliseconds since the epoch.
pub fn epoch_ms() -> i64 {
    (proxmox_time::epoch_f64() * 1000.0) as i64
}
