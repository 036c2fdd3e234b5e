//! Backup of a whole machine.

use anyhow::{bail, Error};

use vmbkp_api_types::{BackupMode, SnapInfo, VmdkInfo};
use vmbkp_config::LOCK_TIMEOUT;
use vmbkp_datastore::{
    backup_disk, ArchiveManager, ChangedBlockSource, DiskDumper, GenerationId,
};

use crate::ArchiveRoot;

#[derive(Clone, Debug, Default)]
pub struct BackupOptions {
    /// Requested mode, `Unknown` picks the best possible one.
    pub mode: BackupMode,
    pub san: bool,
    pub gzip: bool,
    /// Only record the generation, do not copy any disk.
    pub no_vmdk: bool,
    pub dry_run: bool,
}

/// Outcome of a machine backup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupResult {
    /// `None` for dry runs.
    pub generation: Option<GenerationId>,
    pub succeeded: bool,
}

/// Back up all disks of `moref` from an existing snapshot.
///
/// The snapshot is created and removed by the caller. Independent disks are
/// skipped since snapshots do not cover them.
pub fn backup_vm(
    root: &ArchiveRoot,
    moref: &str,
    snapshot: &SnapInfo,
    disks: &[VmdkInfo],
    options: &BackupOptions,
    source: &mut dyn ChangedBlockSource,
    dumper: &dyn DiskDumper,
) -> Result<BackupResult, Error> {
    let index = root.index();
    let name = index.name_by_moref(moref).unwrap_or("");
    log::info!("backup \"{}\" ({}) start, {:?}", name, moref, options);

    if index.is_template(moref) {
        bail!("template backup is not supported ({})", moref);
    }
    if options.dry_run {
        log::info!("backup ends because of dry run");
        return Ok(BackupResult {
            generation: None,
            succeeded: true,
        });
    }

    let vm_directory = root.vm_directory(moref)?;
    vmbkp_tools::fs::create_dir_all(&vm_directory)?;
    let _guard = ArchiveManager::lock_vm(&vm_directory, LOCK_TIMEOUT)?;
    let mut manager = root.open_archive(moref)?;

    // generations are indexed by timestamp, which must be unique
    let timestamp_ms = match manager.latest_timestamp_ms() {
        Some(latest) => vmbkp_datastore::epoch_ms().max(latest + 1),
        None => vmbkp_datastore::epoch_ms(),
    };
    let generation =
        manager.prepare_new_generation(snapshot, disks, timestamp_ms, options.gzip)?;
    log::info!("there are {} disks", disks.len());

    // any error leaves the generation failed and the chain clean
    let succeeded = match backup_disks(&mut manager, generation, disks, options, source, dumper)
        .and_then(|all_succeeded| manager.finalize(all_succeeded, root.keep_generations()))
    {
        Ok(succeeded) => succeeded,
        Err(err) => {
            log::warn!("backup of {} aborted in generation {} - {}", moref, generation, err);
            if let Err(abort_err) = manager.abort() {
                log::warn!("unable to abort generation {} - {}", generation, abort_err);
            }
            return Err(err);
        }
    };
    if !succeeded {
        log::warn!("backup of {} failed in generation {}", moref, generation);
    }

    Ok(BackupResult {
        generation: Some(generation),
        succeeded,
    })
}

fn backup_disks(
    manager: &mut ArchiveManager,
    generation: GenerationId,
    disks: &[VmdkInfo],
    options: &BackupOptions,
    source: &mut dyn ChangedBlockSource,
    dumper: &dyn DiskDumper,
) -> Result<bool, Error> {
    let mut all_succeeded = true;
    for disk in disks {
        let disk_id = match manager.current()?.disk_id_by_uuid(&disk.uuid) {
            Some(disk_id) => disk_id,
            None => bail!("disk {} missing in generation {}", disk.uuid, generation),
        };

        if options.no_vmdk {
            manager.current_mut()?.set_vmdkdump_result(disk_id, true);
        } else if manager.current()?.is_independent_disk(disk_id) {
            log::info!("dump of disk {} skipped (independent disk)", disk.uuid);
        } else {
            let ok = backup_disk(manager, disk, options.mode, options.san, &mut *source, dumper)?;
            log::info!(
                "dump of disk {} {}",
                disk.uuid,
                if ok { "succeeded" } else { "failed" }
            );
            all_succeeded &= ok;
        }
        manager.save()?;
    }
    Ok(all_succeeded)
}
