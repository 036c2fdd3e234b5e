//! Verification of archived generations and restore request setup.

use anyhow::{bail, format_err, Error};

use vmbkp_config::lock_timeout;
use vmbkp_datastore::dump_tool::{CheckRequest, RestoreRequest};
use vmbkp_datastore::{
    archive_state, ArchiveManager, ArchiveState, ChainError, GenerationId, VmdkBkp,
};
use vmbkp_tools::lock::LockGuard;

use crate::ArchiveRoot;

/// Something which verifies archived disk files against their digest.
pub trait DiskChecker {
    fn check(&self, request: &CheckRequest) -> Result<(), Error>;
}

impl DiskChecker for VmdkBkp {
    fn check(&self, request: &CheckRequest) -> Result<(), Error> {
        VmdkBkp::check(self, request)
    }
}

fn generation_id(manager: &ArchiveManager) -> Result<GenerationId, Error> {
    let current = manager.current()?;
    current
        .generation_id()
        .ok_or_else(|| format_err!("generation id missing in {:?}", current.path()))
}

/// Check request for disk `disk_id` of the loaded generation.
pub fn check_request(manager: &ArchiveManager, disk_id: usize) -> Result<CheckRequest, Error> {
    let current = manager.current()?;
    Ok(CheckRequest {
        vm_moref: manager.moref().to_string(),
        digest_in: manager.digest_path_for_check(disk_id)?,
        paths: manager.dump_paths_for_restore(disk_id)?,
        work_dir: current.directory().to_path_buf(),
        generation_id: generation_id(manager)?,
        disk_id,
    })
}

/// Restore request writing disk `disk_id` of the loaded generation to
/// `remote_path`, seen through `snapshot_moref` of machine `vm_moref`.
pub fn restore_request(
    manager: &ArchiveManager,
    disk_id: usize,
    vm_moref: &str,
    snapshot_moref: &str,
    remote_path: &str,
    san: bool,
) -> Result<RestoreRequest, Error> {
    let current = manager.current()?;
    Ok(RestoreRequest {
        vm_moref: vm_moref.to_string(),
        snapshot_moref: snapshot_moref.to_string(),
        remote_path: remote_path.to_string(),
        san,
        digest_in: manager.digest_path_for_check(disk_id)?,
        paths: manager.dump_paths_for_restore(disk_id)?,
        work_dir: current.directory().to_path_buf(),
        generation_id: generation_id(manager)?,
        disk_id,
    })
}

/// Verify every disk of a generation, `None` selects the latest succeeded
/// one.
///
/// Returns `false` if the generation did not succeed, a disk copy failed
/// or a disk does not match its digest.
pub fn check_generation(
    manager: &mut ArchiveManager,
    generation: Option<GenerationId>,
    checker: &dyn DiskChecker,
    dry_run: bool,
) -> Result<bool, Error> {
    let id = match manager.load_generation(generation) {
        Ok(id) => id,
        Err(err) => match err.downcast_ref::<ChainError>() {
            Some(ChainError::GenerationNotSucceeded(id)) => {
                log::warn!("generation {} of {} is not succeeded", id, manager.moref());
                return Ok(false);
            }
            _ => return Err(err),
        },
    };
    log::info!("check generation {} of {}", id, manager.moref());

    let mut ok = true;
    for disk_id in manager.current()?.disk_ids() {
        if !manager.current()?.is_dump_succeeded(disk_id) {
            log::warn!("disk {} of generation {} was not backed up", disk_id, id);
            ok = false;
            continue;
        }

        let request = check_request(manager, disk_id)?;
        if dry_run {
            log::info!("dry run, skip check of {:?}", request.paths);
            continue;
        }
        match checker.check(&request) {
            Ok(()) => log::info!("check of disk {} succeeded", disk_id),
            Err(err) => {
                log::warn!("check of disk {} failed - {}", disk_id, err);
                ok = false;
            }
        }
    }
    Ok(ok)
}

/// Verify a generation of the archive of `moref` while holding its lock.
///
/// Returns `false` if the machine has no archive.
pub fn check_vm(
    root: &ArchiveRoot,
    moref: &str,
    generation: Option<GenerationId>,
    checker: &dyn DiskChecker,
    dry_run: bool,
) -> Result<bool, Error> {
    let vm_directory = root.vm_directory(moref)?;
    if archive_state(&vm_directory) == ArchiveState::NoArchive {
        log::warn!("archive of {} does not exist", moref);
        return Ok(false);
    }

    let _guard = ArchiveManager::lock_vm(&vm_directory, lock_timeout(dry_run))?;
    let mut manager = match ArchiveManager::open_existing(&vm_directory)? {
        Some(manager) => manager,
        None => return Ok(false),
    };
    check_generation(&mut manager, generation, checker, dry_run)
}

/// Lock the archive of `moref` and load the generation to restore, `None`
/// selects the latest succeeded one.
///
/// The archive stays locked until the returned guard is dropped, restore
/// requests must be built and run before that.
pub fn prepare_restore(
    root: &ArchiveRoot,
    moref: &str,
    generation: Option<GenerationId>,
    dry_run: bool,
) -> Result<(LockGuard, ArchiveManager), Error> {
    let vm_directory = root.vm_directory(moref)?;
    if archive_state(&vm_directory) != ArchiveState::HasSucceeded {
        bail!("archive of {} has no succeeded generation", moref);
    }

    let guard = ArchiveManager::lock_vm(&vm_directory, lock_timeout(dry_run))?;
    let mut manager = ArchiveManager::open_existing(&vm_directory)?
        .ok_or_else(|| format_err!("archive of {} does not exist", moref))?;
    let id = manager.load_generation(generation)?;
    log::info!("restore generation {} of {}", id, moref);
    Ok((guard, manager))
}
