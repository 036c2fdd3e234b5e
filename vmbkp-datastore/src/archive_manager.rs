//! Backup archive of one machine: its generation chain plus the manifest of
//! the generation currently worked on.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use vmbkp_api_types::{
    convert_gzip_file_name, is_gzip_file_name, is_valid_change_id, ArchiveFileKind, BackupMode,
    SnapInfo, VmInfo, VmdkInfo, VM_PROFILE_FILE_NAME,
};
use vmbkp_tools::fs::is_regular_file;
use vmbkp_tools::lock::{lock_resource, LockError, LockGuard};

use crate::chain::{GenerationChain, GenerationId};
use crate::manifest::{GenerationManifest, GenerationSetup};
use crate::ChainError;

/// Action postponed until every disk of the generation was copied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeferredTask {
    /// Move the previous dump and digest of the disk into the current
    /// generation directory.
    RelocatePrevDumpAndDigest(usize),
    /// Delete the previous dump, superseded by the current one.
    DeletePrevDump(usize),
}

impl std::fmt::Display for DeferredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeferredTask::RelocatePrevDumpAndDigest(disk_id) => {
                write!(f, "relocate previous dump and digest of disk {}", disk_id)
            }
            DeferredTask::DeletePrevDump(disk_id) => {
                write!(f, "delete previous dump of disk {}", disk_id)
            }
        }
    }
}

/// Archive presence of a machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchiveState {
    /// No machine directory or no chain file.
    NoArchive,
    /// A chain exists, but without any succeeded generation.
    Empty,
    HasSucceeded,
}

/// Check the archive below `vm_directory` without locking it.
pub fn archive_state<P: AsRef<Path>>(vm_directory: P) -> ArchiveState {
    let vm_directory = vm_directory.as_ref();
    let path = vm_directory.join(VM_PROFILE_FILE_NAME);
    if !vm_directory.is_dir() || !is_regular_file(&path) {
        return ArchiveState::NoArchive;
    }
    match GenerationChain::load(&path) {
        Ok(Some(chain)) if chain.latest_succeeded().is_some() => ArchiveState::HasSucceeded,
        Ok(_) => ArchiveState::Empty,
        Err(err) => {
            log::warn!("unable to load {:?} - {}", path, err);
            ArchiveState::Empty
        }
    }
}

/// Pick the backup mode for a disk.
///
/// A requested mode is honored if the disk is eligible for it, otherwise
/// the best eligible mode wins (incr, then diff, then full).
pub fn determine_mode(requested: BackupMode, diff: bool, incr: bool) -> BackupMode {
    match requested {
        BackupMode::Incr if incr => return BackupMode::Incr,
        BackupMode::Diff if diff => return BackupMode::Diff,
        BackupMode::Full => return BackupMode::Full,
        _ => {}
    }
    if incr {
        BackupMode::Incr
    } else if diff {
        BackupMode::Diff
    } else {
        BackupMode::Full
    }
}

pub struct ArchiveManager {
    vm: VmInfo,
    chain: GenerationChain,
    current: Option<GenerationManifest>,
    prev: Option<GenerationManifest>,
    tasks: Vec<DeferredTask>,
}

impl ArchiveManager {
    /// Lock the chain file of the machine stored in `vm_directory`.
    pub fn lock_vm<P: AsRef<Path>>(vm_directory: P, timeout: i64) -> Result<LockGuard, LockError> {
        lock_resource(vm_directory.as_ref().join(VM_PROFILE_FILE_NAME), timeout)
    }

    /// Open the archive of `vm` for a new backup, creating it if needed.
    ///
    /// An existing chain must belong to the same moref and must be clean.
    /// The display name is refreshed and a `.bak` copy of the chain is
    /// written.
    pub fn open<P: Into<PathBuf>>(vm_directory: P, vm: &VmInfo) -> Result<Self, Error> {
        let vm_directory = vm_directory.into();
        vmbkp_tools::fs::create_dir_all(&vm_directory)?;

        let path = vm_directory.join(VM_PROFILE_FILE_NAME);
        let chain = match GenerationChain::load(&path)? {
            Some(mut chain) => {
                let found = chain.moref().unwrap_or("");
                if found != vm.moref {
                    return Err(ChainError::MorefMismatch {
                        expected: vm.moref.clone(),
                        found: found.to_string(),
                    }
                    .into());
                }
                if !chain.is_clean() {
                    return Err(ChainError::NotClean(path).into());
                }
                chain.set_name(&vm.name);
                chain
            }
            None => {
                log::info!("create new archive for {} in {:?}", vm.moref, vm_directory);
                let chain = GenerationChain::create(&path, vm)?;
                chain.write()?;
                chain
            }
        };
        chain.make_backup()?;

        Ok(Self {
            vm: vm.clone(),
            chain,
            current: None,
            prev: None,
            tasks: Vec::new(),
        })
    }

    /// Open an existing archive as it is, `None` if there is none.
    pub fn open_existing<P: AsRef<Path>>(vm_directory: P) -> Result<Option<Self>, Error> {
        let path = vm_directory.as_ref().join(VM_PROFILE_FILE_NAME);
        let chain = match GenerationChain::load(&path)? {
            Some(chain) => chain,
            None => return Ok(None),
        };
        let moref = chain
            .moref()
            .ok_or_else(|| format_err!("no moref in {:?}", path))?;
        let vm = VmInfo::new(chain.name().unwrap_or(""), moref);

        Ok(Some(Self {
            vm,
            chain,
            current: None,
            prev: None,
            tasks: Vec::new(),
        }))
    }

    pub fn vm(&self) -> &VmInfo {
        &self.vm
    }

    pub fn moref(&self) -> &str {
        &self.vm.moref
    }

    pub fn chain(&self) -> &GenerationChain {
        &self.chain
    }

    pub fn directory(&self) -> &Path {
        self.chain.directory()
    }

    pub fn current(&self) -> Result<&GenerationManifest, Error> {
        self.current
            .as_ref()
            .ok_or_else(|| format_err!("no generation loaded for {}", self.vm.moref))
    }

    pub fn current_mut(&mut self) -> Result<&mut GenerationManifest, Error> {
        match self.current.as_mut() {
            Some(current) => Ok(current),
            None => bail!("no generation loaded for {}", self.vm.moref),
        }
    }

    /// Previous succeeded generation of the current one.
    pub fn prev(&self) -> Option<&GenerationManifest> {
        self.prev.as_ref()
    }

    pub fn deferred_tasks(&self) -> &[DeferredTask] {
        &self.tasks
    }

    pub fn reload(&mut self) -> Result<(), Error> {
        self.chain.reload()
    }

    /// Write the chain and the current manifest.
    pub fn save(&self) -> Result<(), Error> {
        self.chain.write()?;
        if let Some(current) = &self.current {
            current.write()?;
        }
        Ok(())
    }

    fn load_prev(&self, id: GenerationId) -> Option<GenerationManifest> {
        let prev_id = self.chain.prev_succeeded(id)?;
        match GenerationManifest::load(self.chain.manifest_path(prev_id)) {
            Ok(prev) => Some(prev),
            Err(err) => {
                log::warn!("unable to load previous generation {} - {}", prev_id, err);
                None
            }
        }
    }

    fn load_succeeded(&self, id: GenerationId) -> Result<GenerationManifest, Error> {
        if !self.chain.is_succeeded(id) {
            return Err(ChainError::GenerationNotSucceeded(id).into());
        }
        GenerationManifest::load(self.chain.manifest_path(id))
    }

    /// Allocate a new generation and write its initial manifest.
    ///
    /// The chain stays marked dirty until [`ArchiveManager::finalize`].
    pub fn prepare_new_generation(
        &mut self,
        snapshot: &SnapInfo,
        disks: &[VmdkInfo],
        timestamp_ms: i64,
        gzip: bool,
    ) -> Result<GenerationId, Error> {
        let prev_generation_id = self.chain.latest_succeeded();
        let id = self.chain.create_new_generation(timestamp_ms)?;
        self.chain.set_clean(false);
        self.chain.write()?;

        let dir = self.chain.generation_dir(id);
        std::fs::create_dir(&dir)
            .map_err(|err| {
                format_err!("unable to create generation directory {:?} - {}", dir, err)
            })?;

        let setup = GenerationSetup {
            generation_id: id,
            prev_generation_id,
            vm: &self.vm,
            snapshot,
            disks,
            timestamp_ms,
            gzip,
        };
        let manifest = GenerationManifest::create(self.chain.manifest_path(id), &setup);
        manifest.write()?;

        log::info!(
            "prepared generation {} of {} (previous {:?})",
            id,
            self.vm.moref,
            prev_generation_id
        );

        self.prev = self.load_prev(id);
        self.current = Some(manifest);
        self.tasks.clear();
        Ok(id)
    }

    /// Load a succeeded generation, `None` selects the latest one.
    pub fn load_generation(&mut self, id: Option<GenerationId>) -> Result<GenerationId, Error> {
        let id = match id {
            Some(id) => id,
            None => self
                .chain
                .latest_succeeded()
                .ok_or_else(|| format_err!("no succeeded generation for {}", self.vm.moref))?,
        };
        let manifest = self.load_succeeded(id)?;
        self.prev = self.load_prev(id);
        self.current = Some(manifest);
        self.tasks.clear();
        Ok(id)
    }

    fn prev_disk_id(&self, disk_id: usize) -> Option<usize> {
        let uuid = self.current.as_ref()?.uuid(disk_id)?;
        self.prev.as_ref()?.disk_id_by_uuid(uuid)
    }

    pub fn prev_dump_path(&self, disk_id: usize) -> Option<PathBuf> {
        let prev_disk_id = self.prev_disk_id(disk_id)?;
        self.prev.as_ref()?.file_path(prev_disk_id, ArchiveFileKind::Dump)
    }

    pub fn prev_digest_path(&self, disk_id: usize) -> Option<PathBuf> {
        let prev_disk_id = self.prev_disk_id(disk_id)?;
        self.prev.as_ref()?.file_path(prev_disk_id, ArchiveFileKind::Digest)
    }

    /// Change id recorded by the previous generation, if usable.
    pub fn prev_change_id(&self, disk_id: usize) -> Option<&str> {
        let prev_disk_id = self.prev_disk_id(disk_id)?;
        self.prev.as_ref()?.change_id(prev_disk_id)
    }

    /// True if the disk can be backed up as a reverse delta against the
    /// previous generation.
    pub fn can_exec_diff(&self, uuid: &str) -> bool {
        let current = match &self.current {
            Some(current) => current,
            None => return false,
        };
        let disk_id = match current.disk_id_by_uuid(uuid) {
            Some(id) => id,
            None => {
                log::info!("disk {} not in the current generation", uuid);
                return false;
            }
        };
        let prev = match &self.prev {
            Some(prev) => prev,
            None => {
                log::info!("no previous generation for disk {}", uuid);
                return false;
            }
        };
        let prev_disk_id = match prev.disk_id_by_uuid(uuid) {
            Some(id) => id,
            None => {
                log::info!("disk {} not in the previous generation", uuid);
                return false;
            }
        };
        if !prev.is_dump_succeeded(prev_disk_id) {
            log::info!("previous copy of disk {} did not succeed", uuid);
            return false;
        }

        match (current.capacity(disk_id), prev.capacity(prev_disk_id)) {
            (Some(capacity), Some(prev_capacity)) if capacity == prev_capacity => {}
            _ => {
                log::info!("capacity of disk {} is invalid or different", uuid);
                return false;
            }
        }

        if !prev.file_exists(prev_disk_id, ArchiveFileKind::Dump)
            || !prev.file_exists(prev_disk_id, ArchiveFileKind::Digest)
        {
            log::info!("previous dump or digest of disk {} does not exist", uuid);
            return false;
        }
        true
    }

    /// Diff eligible and both generations carry a change id.
    pub fn can_exec_incr(&self, uuid: &str) -> bool {
        if !self.can_exec_diff(uuid) {
            return false;
        }
        let (current, prev) = match (&self.current, &self.prev) {
            (Some(current), Some(prev)) => (current, prev),
            _ => return false,
        };
        let current_ok = current
            .disk_id_by_uuid(uuid)
            .map(|id| is_valid_change_id(current.change_id(id)))
            .unwrap_or(false);
        if !current_ok {
            log::info!("no change id for disk {}", uuid);
            return false;
        }
        let prev_ok = prev
            .disk_id_by_uuid(uuid)
            .map(|id| is_valid_change_id(prev.change_id(id)))
            .unwrap_or(false);
        if !prev_ok {
            log::info!("no previous change id for disk {}", uuid);
            return false;
        }
        true
    }

    pub fn register_deferred(&mut self, task: DeferredTask) {
        log::info!("register task: {}", task);
        self.tasks.push(task);
    }

    fn relocate_prev_dump_and_digest(&mut self, disk_id: usize) -> Result<bool, Error> {
        let (from_dump, from_digest) =
            match (self.prev_dump_path(disk_id), self.prev_digest_path(disk_id)) {
                (Some(dump), Some(digest)) => (dump, digest),
                _ => {
                    log::warn!("no previous dump and digest for disk {}", disk_id);
                    return Ok(false);
                }
            };

        for from in [&from_dump, &from_digest] {
            if !is_regular_file(from) {
                log::warn!("file {:?} not found", from);
                return Ok(false);
            }
        }

        let current = self.current_mut()?;
        for (kind, from) in [
            (ArchiveFileKind::Dump, &from_dump),
            (ArchiveFileKind::Digest, &from_digest),
        ] {
            let name = current
                .file_name(disk_id, kind)
                .ok_or_else(|| {
                    format_err!("no {} file name for disk {}", kind.extension(), disk_id)
                })?
                .to_string();
            let gzip = is_gzip_file_name(&from.to_string_lossy());
            if gzip != is_gzip_file_name(&name) {
                current.set_file_name(disk_id, kind, &convert_gzip_file_name(&name, gzip));
            }
        }

        let to_dump = current
            .file_path(disk_id, ArchiveFileKind::Dump)
            .ok_or_else(|| format_err!("no dump path for disk {}", disk_id))?;
        let to_digest = current
            .file_path(disk_id, ArchiveFileKind::Digest)
            .ok_or_else(|| format_err!("no digest path for disk {}", disk_id))?;

        log::info!(
            "move dump {:?} to {:?}, digest {:?} to {:?}",
            from_dump,
            to_dump,
            from_digest,
            to_digest
        );
        std::fs::rename(&from_dump, &to_dump)
            .map_err(|err| format_err!("unable to move {:?} - {}", from_dump, err))?;
        std::fs::rename(&from_digest, &to_digest)
            .map_err(|err| format_err!("unable to move {:?} - {}", from_digest, err))?;
        Ok(true)
    }

    fn delete_prev_dump(&mut self, disk_id: usize) -> Result<bool, Error> {
        let path = match self.prev_dump_path(disk_id) {
            Some(path) => path,
            None => {
                log::warn!("no previous dump for disk {}", disk_id);
                return Ok(false);
            }
        };
        if !is_regular_file(&path) {
            log::warn!("previous dump {:?} is not a regular file", path);
            return Ok(false);
        }

        let deleted = match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("unable to delete {:?} - {}", path, err);
                false
            }
        };
        self.current_mut()?.set_deleted_previous_dump(disk_id, deleted);
        log::info!(
            "deleting previous dump {:?} {}",
            path,
            if deleted { "succeeded" } else { "failed" }
        );
        Ok(deleted)
    }

    fn exec_deferred_tasks(&mut self) -> bool {
        let tasks = std::mem::take(&mut self.tasks);
        let mut ok = true;
        for task in tasks {
            log::info!("execute task: {}", task);
            let result = match task {
                DeferredTask::RelocatePrevDumpAndDigest(disk_id) => {
                    self.relocate_prev_dump_and_digest(disk_id)
                }
                DeferredTask::DeletePrevDump(disk_id) => self.delete_prev_dump(disk_id),
            };
            match result {
                Ok(true) => {}
                Ok(false) => ok = false,
                Err(err) => {
                    log::warn!("task '{}' failed - {}", task, err);
                    ok = false;
                }
            }
        }
        ok
    }

    /// Finish the current generation.
    ///
    /// Deferred tasks only run if every disk copy succeeded, a failing
    /// task fails the generation. On success generations beyond the `keep`
    /// newest succeeded ones are deleted. The chain is marked clean and
    /// written. Returns the final result.
    pub fn finalize(&mut self, all_succeeded: bool, keep: usize) -> Result<bool, Error> {
        let mut succeeded = all_succeeded;
        if succeeded {
            succeeded = self.exec_deferred_tasks();
        } else if !self.tasks.is_empty() {
            log::info!("skip {} deferred tasks", self.tasks.len());
            self.tasks.clear();
        }

        let current = self.current_mut()?;
        current.set_succeeded(succeeded)?;
        current.write()?;
        let id = current
            .generation_id()
            .ok_or_else(|| format_err!("generation id missing in {:?}", current.path()))?;
        let timestamp_ms = current
            .timestamp_ms()
            .ok_or_else(|| format_err!("timestamp missing in {:?}", current.path()))?;

        self.chain.set_succeeded(id, succeeded);
        self.chain.set_timestamp_ms(id, timestamp_ms);

        if succeeded {
            self.delete_old_generations(keep.max(1), id);
        }

        self.chain.set_clean(true);
        self.chain.write()?;

        log::info!(
            "generation {} of {} {}",
            id,
            self.vm.moref,
            if succeeded { "succeeded" } else { "failed" }
        );
        Ok(succeeded)
    }

    /// Close the current generation as failed after an error.
    ///
    /// Deferred tasks are dropped. The chain is marked clean and written
    /// even if the manifest can not be updated any more.
    pub fn abort(&mut self) -> Result<(), Error> {
        if !self.tasks.is_empty() {
            log::info!("skip {} deferred tasks", self.tasks.len());
            self.tasks.clear();
        }

        let id = match self.current.as_mut() {
            Some(current) => {
                if let Err(err) = current.set_succeeded(false).and_then(|_| current.write()) {
                    log::warn!("unable to mark {:?} as failed - {}", current.path(), err);
                }
                current.generation_id()
            }
            None => None,
        };
        if let Some(id) = id {
            self.chain.set_succeeded(id, false);
            log::info!("generation {} of {} aborted", id, self.vm.moref);
        }

        self.chain.set_clean(true);
        self.chain.write()
    }

    fn delete_old_generations(&mut self, keep: usize, current_id: GenerationId) {
        let old = self.chain.old_generations(keep);
        if old.is_empty() {
            log::info!("no generation was deleted");
            return;
        }
        log::info!("old generations to be deleted: {:?}", old);
        for id in old.into_iter().filter(|id| *id != current_id) {
            self.delete_generation(id);
        }
    }

    /// Remove the directory and the chain entry of a generation.
    fn delete_generation(&mut self, id: GenerationId) -> bool {
        let dir = self.chain.generation_dir(id);
        let removed = match vmbkp_tools::fs::remove_dir_recursive(&dir) {
            Ok(removed) => removed,
            Err(err) => {
                log::warn!("{}", err);
                false
            }
        };
        log::info!(
            "delete generation {} directory {}",
            id,
            if removed { "succeeded" } else { "failed" }
        );
        self.chain.del_generation(id);

        if self.prev.as_ref().and_then(|p| p.generation_id()) == Some(id) {
            self.prev = None;
        }
        removed
    }

    /// Failed generations except the latest one.
    pub fn failed_generations(&self) -> Vec<GenerationId> {
        self.chain.failed_generations()
    }

    /// Delete failed generations, the caller writes the chain.
    pub fn delete_failed_generations(&mut self) -> Vec<GenerationId> {
        let failed = self.chain.failed_generations();
        for id in &failed {
            self.delete_generation(*id);
        }
        failed
    }

    fn disk_uuid(&self, disk_id: usize) -> Result<(GenerationId, String), Error> {
        let current = self.current()?;
        let generation = current
            .generation_id()
            .ok_or_else(|| format_err!("generation id missing in {:?}", current.path()))?;
        let uuid = current
            .uuid(disk_id)
            .ok_or_else(|| format_err!("disk {} not found in generation {}", disk_id, generation))?;
        Ok((generation, uuid.to_string()))
    }

    /// Succeeded generation newer than `id` and its index for disk `uuid`.
    fn next_for_disk(
        &self,
        id: GenerationId,
        uuid: &str,
    ) -> Result<Option<(GenerationId, GenerationManifest, usize)>, Error> {
        let next = match self.chain.next_succeeded(id) {
            Some(next) => next,
            None => return Ok(None),
        };
        let manifest = self.load_succeeded(next)?;
        let disk_id = manifest.disk_id_by_uuid(uuid).ok_or_else(|| ChainError::DiskNotFound {
            generation: next,
            uuid: uuid.to_string(),
        })?;
        if !manifest.is_dump_succeeded(disk_id) {
            return Err(ChainError::DiskNotSucceeded {
                generation: next,
                uuid: uuid.to_string(),
            }
            .into());
        }
        Ok(Some((next, manifest, disk_id)))
    }

    /// Files to replay for restoring disk `disk_id` of the current
    /// generation: a full dump followed by reverse deltas.
    pub fn dump_paths_for_restore(&self, disk_id: usize) -> Result<Vec<PathBuf>, Error> {
        let (generation, uuid) = self.disk_uuid(disk_id)?;
        let current = self.current()?;

        if !current.is_dump_succeeded(disk_id) {
            return Err(ChainError::DiskNotSucceeded { generation, uuid }.into());
        }
        if current.file_exists(disk_id, ArchiveFileKind::Dump) {
            if let Some(dump) = current.file_path(disk_id, ArchiveFileKind::Dump) {
                return Ok(vec![dump]);
            }
        }

        let mut paths = Vec::new();
        let mut id = generation;
        while let Some((next, manifest, next_disk_id)) = self.next_for_disk(id, &uuid)? {
            let mut explained = false;

            if manifest.file_exists(next_disk_id, ArchiveFileKind::Rdiff) {
                if let Some(rdiff) = manifest.file_path(next_disk_id, ArchiveFileKind::Rdiff) {
                    log::debug!("rdiff: {:?}", rdiff);
                    paths.insert(0, rdiff);
                    explained = true;
                }
            }
            if manifest.file_exists(next_disk_id, ArchiveFileKind::Dump) {
                if let Some(dump) = manifest.file_path(next_disk_id, ArchiveFileKind::Dump) {
                    log::debug!("dump: {:?}", dump);
                    paths.insert(0, dump);
                    log::info!("restore files for disk {}: {:?}", disk_id, paths);
                    return Ok(paths);
                }
            }
            if manifest.is_changed(next_disk_id) == Some(false) {
                explained = true;
            }
            if !explained {
                return Err(ChainError::BrokenChain {
                    generation: next,
                    uuid,
                }
                .into());
            }
            id = next;
        }

        Err(ChainError::NoDumpFound.into())
    }

    /// Digest of disk `disk_id` of the current generation, which may have
    /// been moved into a newer generation.
    pub fn digest_path_for_check(&self, disk_id: usize) -> Result<PathBuf, Error> {
        let (generation, uuid) = self.disk_uuid(disk_id)?;
        let current = self.current()?;

        if !current.is_dump_succeeded(disk_id) {
            return Err(ChainError::DiskNotSucceeded { generation, uuid }.into());
        }
        if current.file_exists(disk_id, ArchiveFileKind::Digest) {
            if let Some(digest) = current.file_path(disk_id, ArchiveFileKind::Digest) {
                return Ok(digest);
            }
        }

        let mut id = generation;
        while let Some((next, manifest, next_disk_id)) = self.next_for_disk(id, &uuid)? {
            if manifest.file_exists(next_disk_id, ArchiveFileKind::Digest) {
                if let Some(digest) = manifest.file_path(next_disk_id, ArchiveFileKind::Digest) {
                    log::info!("digest for disk {}: {:?}", disk_id, digest);
                    return Ok(digest);
                }
            }
            id = next;
        }

        log::warn!(
            "digest not found for generation {} disk {} ({})",
            generation,
            disk_id,
            uuid
        );
        Err(ChainError::NoDumpFound.into())
    }

    /// Disk of the current generation attached at the same position as
    /// `disk` (device key, capacity and controller addressing).
    pub fn target_disk_id(&self, disk: &VmdkInfo) -> Option<usize> {
        let current = self.current.as_ref()?;
        current.disk_ids().into_iter().find(|disk_id| {
            let disk_id = *disk_id;
            let controller_key = current.controller_key(disk_id);
            current.device_key(disk_id) == Some(disk.key)
                && current.capacity(disk_id) == Some(disk.capacity)
                && current.unit_number(disk_id) == Some(disk.unit_number)
                && controller_key == Some(disk.controller_key)
                && controller_key.and_then(|ckey| current.bus_number(ckey)) == Some(disk.bus_number)
                && current.adapter_type(disk_id) == disk.adapter_type
        })
    }

    /// `[Gen N "ts"]` followed by one entry per disk.
    pub fn generation_status_line(&self, id: GenerationId) -> String {
        let mut line = format!(
            "[Gen {} \"{}\"]",
            id,
            self.chain.timestamp_str(id).unwrap_or("")
        );
        if !self.chain.is_succeeded(id) {
            line.push_str(" ----------_FAILED_----------");
            return line;
        }
        match self.load_succeeded(id) {
            Ok(manifest) => {
                for disk_id in manifest.disk_ids() {
                    line.push_str(&manifest.disk_status_line(disk_id));
                }
                line
            }
            Err(err) => {
                log::warn!("failed with generation {} - {}", id, err);
                format!("{} ##########_ERROR_##########", id)
            }
        }
    }

    /// Chain summary, with `detail` one more line per generation.
    pub fn status_text(&self, available: bool, detail: bool) -> String {
        let mut text = self.chain.status_line(available);
        if detail {
            for id in self.chain.generation_ids() {
                text.push_str("\n\t");
                text.push_str(&self.generation_status_line(id));
            }
        }
        text
    }

    /// Timestamp of the newest generation, succeeded or not.
    pub fn latest_timestamp_ms(&self) -> Option<i64> {
        match self.chain.latest_generation_id() {
            Ok(Some(id)) => self.chain.timestamp_ms(id),
            _ => None,
        }
    }
}
