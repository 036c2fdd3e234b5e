//! Clean up of machine archives: failed generations and archives of
//! machines which are gone.

use anyhow::{bail, Error};

use vmbkp_config::lock_timeout;
use vmbkp_datastore::{archive_state, ArchiveManager, ArchiveState, GenerationId};

use crate::ArchiveRoot;

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanOptions {
    /// Remove the whole archive of the machine.
    pub all: bool,
    /// Allow removing the archive of a machine which is still available.
    pub force: bool,
    pub dry_run: bool,
}

/// What [`clean_vm`] did (or would do on a dry run).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CleanAction {
    NoArchive,
    /// The whole archive directory.
    RemovedArchive,
    /// Removed failed generations, possibly none.
    RemovedGenerations(Vec<GenerationId>),
    Refused,
}

/// Clean the archive of one machine.
pub fn clean_vm(
    root: &ArchiveRoot,
    moref: &str,
    options: &CleanOptions,
) -> Result<CleanAction, Error> {
    let vm_directory = root.vm_directory(moref)?;

    let state = archive_state(&vm_directory);
    if state == ArchiveState::NoArchive {
        log::warn!("archive of {} does not exist", moref);
        return Ok(CleanAction::NoArchive);
    }

    let _guard = ArchiveManager::lock_vm(&vm_directory, lock_timeout(options.dry_run))?;

    if options.all || state == ArchiveState::Empty {
        if root.index().is_available(moref) && !options.force && state != ArchiveState::Empty {
            log::warn!("{} is still available, use force to remove its archive", moref);
            return Ok(CleanAction::Refused);
        }
        if options.dry_run {
            log::info!("would remove {:?}", vm_directory);
        } else {
            log::info!("remove {:?}", vm_directory);
            vmbkp_tools::fs::remove_dir_recursive(&vm_directory)?;
        }
        return Ok(CleanAction::RemovedArchive);
    }

    let mut manager = match ArchiveManager::open_existing(&vm_directory)? {
        Some(manager) => manager,
        None => return Ok(CleanAction::NoArchive),
    };
    if !manager.chain().is_clean() {
        log::warn!("archive of {} is not clean, skip it", moref);
        return Ok(CleanAction::Refused);
    }

    let failed = manager.failed_generations();
    log::info!("failed generations of {}: {:?}", moref, failed);
    if options.dry_run || failed.is_empty() {
        return Ok(CleanAction::RemovedGenerations(failed));
    }

    let removed = manager.delete_failed_generations();
    manager.save()?;
    Ok(CleanAction::RemovedGenerations(removed))
}

/// Clean every target, a failure of one target does not stop the others.
///
/// Removing whole archives of available machines is restricted to a single
/// target.
pub fn clean(
    root: &ArchiveRoot,
    morefs: &[String],
    options: &CleanOptions,
) -> Result<Vec<(String, bool)>, Error> {
    if options.all && options.force && morefs.len() != 1 {
        bail!("forced removal of whole archives needs exactly one target");
    }

    let mut results = Vec::new();
    for moref in morefs {
        let succeeded = match clean_vm(root, moref, options) {
            Ok(CleanAction::Refused) => false,
            Ok(action) => {
                log::debug!("{}: {:?}", moref, action);
                true
            }
            Err(err) => {
                log::warn!("clean of {} failed - {}", moref, err);
                false
            }
        };
        log::info!(
            "CLEAN {} {}",
            moref,
            if succeeded { "succeeded" } else { "failed" }
        );
        results.push((moref.clone(), succeeded));
    }
    Ok(results)
}
