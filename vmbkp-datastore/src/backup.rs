//! Backup of a single disk into the current generation.

use std::path::PathBuf;

use anyhow::{format_err, Error};

use vmbkp_api_types::{ArchiveFileKind, BackupMode, VmdkInfo};

use crate::archive_manager::{determine_mode, ArchiveManager, DeferredTask};
use crate::bitmap::ChangedBlockBitmap;
use crate::dump_tool::{DiskDumper, DumpRequest};
use crate::manifest::GenerationManifest;

/// Hypervisor side of changed block tracking.
pub trait ChangedBlockSource {
    /// Byte ranges `(offset, length)` of `disk` changed since the state
    /// identified by `prev_change_id`.
    fn changed_areas(
        &mut self,
        disk: &VmdkInfo,
        prev_change_id: &str,
    ) -> Result<Vec<(u64, u64)>, Error>;
}

fn absolute(path: PathBuf) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

fn file_name(
    current: &GenerationManifest,
    disk_id: usize,
    kind: ArchiveFileKind,
) -> Result<PathBuf, Error> {
    current
        .file_name(disk_id, kind)
        .map(PathBuf::from)
        .ok_or_else(|| format_err!("no {} file name for disk {}", kind.extension(), disk_id))
}

/// Fetch the changed areas, store them as bitmap and return whether
/// anything changed.
fn save_changed_blocks(
    manager: &ArchiveManager,
    disk: &VmdkInfo,
    disk_id: usize,
    source: &mut dyn ChangedBlockSource,
) -> Result<bool, Error> {
    let prev_change_id = manager
        .prev_change_id(disk_id)
        .ok_or_else(|| format_err!("no previous change id for disk {}", disk_id))?
        .to_string();

    let areas = source.changed_areas(disk, &prev_change_id)?;

    let mut bitmap = ChangedBlockBitmap::with_default_block_size(disk.capacity)?;
    for (offset, length) in areas {
        bitmap.set_range(offset, length)?;
    }

    let path = manager
        .current()?
        .file_path(disk_id, ArchiveFileKind::Bitmap)
        .ok_or_else(|| format_err!("no bitmap path for disk {}", disk_id))?;
    bitmap.save(&path)?;

    log::info!(
        "disk {}: {} of {} blocks changed",
        disk_id,
        bitmap.changed_blocks(),
        bitmap.block_count()
    );
    Ok(!bitmap.is_all_zero())
}

fn dump_request(
    manager: &ArchiveManager,
    disk_id: usize,
    mode: BackupMode,
    san: bool,
) -> Result<DumpRequest, Error> {
    let current = manager.current()?;
    let delta = mode != BackupMode::Full;

    let prev_file = |path: Option<PathBuf>, what: &str| -> Result<Option<PathBuf>, Error> {
        if !delta {
            return Ok(None);
        }
        let path = path.ok_or_else(|| format_err!("no previous {} for disk {}", what, disk_id))?;
        Ok(Some(absolute(path)?))
    };

    Ok(DumpRequest {
        mode,
        vm_moref: manager.moref().to_string(),
        snapshot_moref: current
            .snapshot_moref()
            .ok_or_else(|| format_err!("no snapshot in {:?}", current.path()))?
            .to_string(),
        remote_path: current
            .remote_path(disk_id)
            .ok_or_else(|| format_err!("no remote path for disk {}", disk_id))?
            .to_string(),
        san,
        dump_in: prev_file(manager.prev_dump_path(disk_id), "dump")?,
        digest_in: prev_file(manager.prev_digest_path(disk_id), "digest")?,
        dump_out: file_name(current, disk_id, ArchiveFileKind::Dump)?,
        digest_out: file_name(current, disk_id, ArchiveFileKind::Digest)?,
        bitmap_in: match mode {
            BackupMode::Incr => Some(file_name(current, disk_id, ArchiveFileKind::Bitmap)?),
            _ => None,
        },
        rdiff_out: if delta {
            Some(file_name(current, disk_id, ArchiveFileKind::Rdiff)?)
        } else {
            None
        },
        work_dir: current.directory().to_path_buf(),
        disk_id,
    })
}

/// Back up one disk of the current generation.
///
/// The mode is `requested` if the disk is eligible for it, otherwise the
/// best eligible one. An incremental backup of an unchanged disk copies
/// nothing and takes over the previous dump after the generation finished.
/// Returns whether the disk was backed up, the result is also recorded in
/// the manifest, which is written before returning.
pub fn backup_disk(
    manager: &mut ArchiveManager,
    disk: &VmdkInfo,
    requested: BackupMode,
    san: bool,
    source: &mut dyn ChangedBlockSource,
    dumper: &dyn DiskDumper,
) -> Result<bool, Error> {
    let uuid = disk.uuid.as_str();
    let disk_id = manager
        .current()?
        .disk_id_by_uuid(uuid)
        .ok_or_else(|| format_err!("disk {} not part of the current generation", uuid))?;

    let diff = manager.can_exec_diff(uuid);
    let mut incr = manager.can_exec_incr(uuid);

    manager.current_mut()?.set_changed(disk_id, true);

    if incr {
        match save_changed_blocks(manager, disk, disk_id, source) {
            Ok(changed) => manager.current_mut()?.set_changed(disk_id, changed),
            Err(err) => {
                log::warn!("unable to get changed blocks of disk {} - {}", uuid, err);
                incr = false;
            }
        }
    }

    let mode = determine_mode(requested, diff, incr);
    log::info!("disk {} ({}): backup mode {}", disk_id, uuid, mode);

    let changed = {
        let current = manager.current_mut()?;
        current.set_backup_mode(disk_id, mode);
        current.set_dump_begin(disk_id, crate::epoch_ms());
        current.is_changed(disk_id) != Some(false)
    };

    let succeeded = if mode == BackupMode::Incr && !changed {
        log::info!("disk {} is not changed, reuse the previous dump", disk_id);
        manager.register_deferred(DeferredTask::RelocatePrevDumpAndDigest(disk_id));
        true
    } else {
        let request = dump_request(manager, disk_id, mode, san)?;
        match dumper.dump(&request) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("backup of disk {} failed - {}", disk_id, err);
                false
            }
        }
    };

    {
        let current = manager.current_mut()?;
        current.set_dump_end(disk_id, crate::epoch_ms());
        current.set_vmdkdump_result(disk_id, succeeded);
    }

    if succeeded && (mode == BackupMode::Diff || (mode == BackupMode::Incr && changed)) {
        manager.register_deferred(DeferredTask::DeletePrevDump(disk_id));
    }

    manager.current()?.write()?;
    Ok(succeeded)
}

/// Check that the files a restore of `disk_id` needs are all present.
pub fn restore_files_present(manager: &ArchiveManager, disk_id: usize) -> Result<bool, Error> {
    let paths = manager.dump_paths_for_restore(disk_id)?;
    let digest = manager.digest_path_for_check(disk_id)?;
    Ok(paths.iter().chain(std::iter::once(&digest)).all(|p| p.is_file()))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::RefCell;

    use vmbkp_api_types::{SnapInfo, VmInfo};

    use crate::manifest::test::test_disk;
    use crate::test_utils::create_testdir;

    const GB8: u64 = 8 << 30;

    struct FakeSource {
        areas: Vec<(u64, u64)>,
        fail: bool,
        asked: Vec<String>,
    }

    impl FakeSource {
        fn new(areas: Vec<(u64, u64)>) -> Self {
            Self {
                areas,
                fail: false,
                asked: Vec::new(),
            }
        }
    }

    impl ChangedBlockSource for FakeSource {
        fn changed_areas(
            &mut self,
            _disk: &VmdkInfo,
            prev_change_id: &str,
        ) -> Result<Vec<(u64, u64)>, Error> {
            self.asked.push(prev_change_id.to_string());
            if self.fail {
                anyhow::bail!("change tracking reset");
            }
            Ok(self.areas.clone())
        }
    }

    /// Writes the output files like the real tool.
    struct FakeDumper {
        fail: bool,
        requests: RefCell<Vec<DumpRequest>>,
    }

    impl FakeDumper {
        fn new() -> Self {
            Self {
                fail: false,
                requests: RefCell::new(Vec::new()),
            }
        }

        fn last(&self) -> DumpRequest {
            self.requests.borrow().last().cloned().unwrap()
        }
    }

    impl DiskDumper for FakeDumper {
        fn dump(&self, request: &DumpRequest) -> Result<(), Error> {
            self.requests.borrow_mut().push(request.clone());
            if self.fail {
                anyhow::bail!("vmdkbkp failed");
            }
            let mut outputs = vec![&request.dump_out, &request.digest_out];
            outputs.extend(request.rdiff_out.as_ref());
            for name in outputs {
                std::fs::write(request.work_dir.join(name), request.mode.as_str())?;
            }
            Ok(())
        }
    }

    fn generation(
        manager: &mut ArchiveManager,
        disks: &[VmdkInfo],
        n: i64,
        requested: BackupMode,
        source: &mut FakeSource,
        dumper: &FakeDumper,
    ) -> Result<bool, Error> {
        let snapshot = SnapInfo::new(format!("vmbkp-{}", n), format!("snapshot-{}", n));
        manager.prepare_new_generation(&snapshot, disks, 1_000_000 + n, true)?;
        let mut all = true;
        for disk in disks {
            all &= backup_disk(manager, disk, requested, false, &mut *source, dumper)?;
        }
        manager.finalize(all, 10)
    }

    fn gen_file(testdir: &str, id: u32, name: &str) -> PathBuf {
        PathBuf::from(format!("{}/vm-101/{}/{}", testdir, id, name))
    }

    #[test]
    fn test_unchanged_incr_takes_over_dump() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "unchanged_incr")?;
        let vm = VmInfo::new("web01", "vm-101");
        let mut manager = ArchiveManager::open(format!("{}/vm-101", testdir), &vm)?;
        let dumper = FakeDumper::new();
        let mut source = FakeSource::new(Vec::new());

        let disks = vec![test_disk("uuid-a", GB8, Some("52 a1/1"))];
        assert!(generation(&mut manager, &disks, 0, BackupMode::Unknown, &mut source, &dumper)?);
        assert_eq!(dumper.last().mode, BackupMode::Full);
        assert_eq!(manager.current()?.backup_mode(0), BackupMode::Full);

        let disks = vec![test_disk("uuid-a", GB8, Some("52 a1/2"))];
        assert!(generation(&mut manager, &disks, 1, BackupMode::Unknown, &mut source, &dumper)?);
        assert_eq!(dumper.requests.borrow().len(), 1);
        assert_eq!(source.asked, vec!["52 a1/1"]);

        let current = manager.current()?;
        assert_eq!(current.backup_mode(0), BackupMode::Incr);
        assert_eq!(current.is_changed(0), Some(false));
        assert!(current.is_dump_succeeded(0));
        assert!(gen_file(&testdir, 1, "0.bmp").is_file());

        // generation 0 still succeeded, its files moved to generation 1
        assert!(manager.chain().is_succeeded(0));
        assert!(!gen_file(&testdir, 0, "0.dump.gz").exists());
        assert!(!gen_file(&testdir, 0, "0.digest.gz").exists());
        assert!(gen_file(&testdir, 1, "0.dump.gz").is_file());

        assert_eq!(manager.dump_paths_for_restore(0)?, vec![gen_file(&testdir, 1, "0.dump.gz")]);
        assert!(restore_files_present(&manager, 0)?);

        manager.load_generation(Some(0))?;
        assert_eq!(manager.dump_paths_for_restore(0)?, vec![gen_file(&testdir, 1, "0.dump.gz")]);
        assert_eq!(manager.digest_path_for_check(0)?, gen_file(&testdir, 1, "0.digest.gz"));
        Ok(())
    }

    #[test]
    fn test_changed_incr_and_fallback() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "changed_incr")?;
        let vm = VmInfo::new("web01", "vm-101");
        let mut manager = ArchiveManager::open(format!("{}/vm-101", testdir), &vm)?;
        let dumper = FakeDumper::new();
        let mut source = FakeSource::new(vec![(0, 4096), (1 << 20, 512)]);

        let disks = vec![test_disk("uuid-a", GB8, Some("52 a1/1"))];
        assert!(generation(&mut manager, &disks, 0, BackupMode::Unknown, &mut source, &dumper)?);

        assert!(generation(&mut manager, &disks, 1, BackupMode::Unknown, &mut source, &dumper)?);
        let request = dumper.last();
        assert_eq!(request.mode, BackupMode::Incr);
        assert_eq!(request.bitmap_in, Some(PathBuf::from("0.bmp")));
        assert_eq!(request.rdiff_out, Some(PathBuf::from("0.rdiff.gz")));
        let dump_in = request.dump_in.unwrap();
        assert!(dump_in.is_absolute());
        assert!(dump_in.ends_with("vm-101/0/0.dump.gz"));

        let bitmap = ChangedBlockBitmap::load(
            gen_file(&testdir, 1, "0.bmp"),
            crate::bitmap::DEFAULT_BLOCK_SIZE,
        )?;
        assert_eq!(bitmap.changed_blocks(), 2);

        // superseded by the new dump
        assert!(!gen_file(&testdir, 0, "0.dump.gz").exists());
        assert!(manager.current()?.is_deleted_previous_dump(0));

        // change tracking fails, fall back to diff
        source.fail = true;
        assert!(generation(&mut manager, &disks, 2, BackupMode::Unknown, &mut source, &dumper)?);
        let request = dumper.last();
        assert_eq!(request.mode, BackupMode::Diff);
        assert_eq!(request.bitmap_in, None);
        assert_eq!(manager.current()?.is_changed(0), Some(true));

        // requested full is honored
        assert!(generation(&mut manager, &disks, 3, BackupMode::Full, &mut source, &dumper)?);
        let request = dumper.last();
        assert_eq!(request.mode, BackupMode::Full);
        assert_eq!(request.dump_in, None);
        assert!(gen_file(&testdir, 2, "0.dump.gz").is_file());

        manager.load_generation(Some(1))?;
        assert_eq!(
            manager.dump_paths_for_restore(0)?,
            vec![gen_file(&testdir, 2, "0.dump.gz"), gen_file(&testdir, 2, "0.rdiff.gz")]
        );
        Ok(())
    }

    #[test]
    fn test_failed_dump() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "failed_dump")?;
        let vm = VmInfo::new("web01", "vm-101");
        let mut manager = ArchiveManager::open(format!("{}/vm-101", testdir), &vm)?;
        let mut dumper = FakeDumper::new();
        let mut source = FakeSource::new(Vec::new());

        let disks = vec![test_disk("uuid-a", GB8, None)];
        assert!(generation(&mut manager, &disks, 0, BackupMode::Unknown, &mut source, &dumper)?);

        dumper.fail = true;
        assert!(!generation(&mut manager, &disks, 1, BackupMode::Incr, &mut source, &dumper)?);
        // no change id, incr request downgraded
        assert_eq!(dumper.last().mode, BackupMode::Diff);
        assert!(source.asked.is_empty());

        let current = manager.current()?;
        assert!(!current.is_dump_succeeded(0));
        assert_eq!(current.num_failed_dumps(), 1);
        assert!(manager.deferred_tasks().is_empty());
        assert!(!manager.chain().is_succeeded(1));
        assert!(manager.chain().is_clean());

        // previous dump untouched
        assert!(gen_file(&testdir, 0, "0.dump.gz").is_file());
        assert_eq!(manager.chain().latest_succeeded(), Some(0));
        Ok(())
    }
}
