//! Disk manifest of one generation (`<moref>/<id>/vmbkp_generation.profile`).
//!
//! ```text
//! [controller "1000"]
//!     adapter_type = lsilogic
//!     bus_number = 0
//! [disk "0"]
//!     backup_mode = incr
//!     capacity = 8G
//!     change_id = "52 a1 .../12"
//!     filename_dump = 0.dump.gz
//!     ...
//! [generation]
//!     generation_id = 3
//!     status = succeeded
//!     ...
//! [index "controller"]
//!     6000C29a-... = 1000
//! [index "disk"]
//!     6000C29a-... = 0
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use vmbkp_api_types::{
    AdapterType, ArchiveFileKind, BackupMode, GenerationStatus, SnapInfo, VmInfo, VmdkInfo,
    CHANGE_ID_UNAVAILABLE, DISK_MODE_INDEPENDENT_PERSISTENT,
};
use vmbkp_config::{format, Group, ProfileHandle};

use crate::chain::GenerationId;
use crate::machine_index::timestamp_string;

const GENERATION_GROUP: &str = "generation";
const DISK_GROUP: &str = "disk";
const CONTROLLER_GROUP: &str = "controller";
const INDEX_GROUP: &str = "index";

/// Everything needed to write the manifest of a new generation.
pub struct GenerationSetup<'a> {
    pub generation_id: GenerationId,
    /// Latest succeeded generation when this one was allocated.
    pub prev_generation_id: Option<GenerationId>,
    pub vm: &'a VmInfo,
    pub snapshot: &'a SnapInfo,
    pub disks: &'a [VmdkInfo],
    pub timestamp_ms: i64,
    pub gzip: bool,
}

fn disk_group(disk_id: usize) -> Group {
    Group::with_sub(DISK_GROUP, disk_id.to_string())
}

fn controller_group(controller_key: i32) -> Group {
    Group::with_sub(CONTROLLER_GROUP, controller_key.to_string())
}

fn file_name_key(kind: ArchiveFileKind) -> &'static str {
    match kind {
        ArchiveFileKind::Dump => "filename_dump",
        ArchiveFileKind::Digest => "filename_digest",
        ArchiveFileKind::Rdiff => "filename_rdiff",
        ArchiveFileKind::Bitmap => "filename_bmp",
    }
}

pub struct GenerationManifest {
    handle: ProfileHandle,
    generation: Group,
    disk_index: Group,
    controller_index: Group,
}

impl GenerationManifest {
    fn from_handle(handle: ProfileHandle) -> Self {
        Self {
            handle,
            generation: Group::new(GENERATION_GROUP),
            disk_index: Group::with_sub(INDEX_GROUP, DISK_GROUP),
            controller_index: Group::with_sub(INDEX_GROUP, CONTROLLER_GROUP),
        }
    }

    /// Build the manifest of a new generation, status `initialized`.
    ///
    /// Every disk starts as failed with backup mode `unknown` until its
    /// copy finished.
    pub fn create<P: Into<PathBuf>>(path: P, setup: &GenerationSetup) -> Self {
        let mut manifest = Self::from_handle(ProfileHandle::new(path));
        let generation = manifest.generation.clone();

        {
            let store = manifest.handle.store_mut();
            let prev = setup
                .prev_generation_id
                .map(i64::from)
                .unwrap_or(-1)
                .to_string();

            store.put(&generation, "generation_id", setup.generation_id.to_string());
            store.put(&generation, "moref", setup.vm.moref.as_str());
            store.put(&generation, "name", setup.vm.name.as_str());
            store.put(&generation, "status", GenerationStatus::Initialized.to_string());
            store.put(&generation, "snapshot_moref", setup.snapshot.moref.as_str());
            store.put(&generation, "snapshot_name", setup.snapshot.name.as_str());
            store.put(&generation, "ovf_filename", format!("{}.ovf", setup.snapshot.moref));
            store.put(&generation, "timestamp", timestamp_string(setup.timestamp_ms));
            store.put(&generation, "timestamp_ms", setup.timestamp_ms.to_string());
            store.put(&generation, "prev_generation_id", prev);
            store.put(&generation, "num_disks", setup.disks.len().to_string());
            store.put(&generation, "num_vmdkdump_succeeded", "0");
            store.put(&generation, "num_vmdkdump_failed", "0");
        }

        for (disk_id, disk) in setup.disks.iter().enumerate() {
            manifest.init_disk(disk_id, disk, setup.gzip);
        }

        manifest
    }

    fn init_disk(&mut self, disk_id: usize, disk: &VmdkInfo, gzip: bool) {
        let group = disk_group(disk_id);
        let disk_index = self.disk_index.clone();
        let controller_index = self.controller_index.clone();
        let store = self.handle.store_mut();

        store.put(&group, "remote_path", disk.name.as_str());
        store.put(&group, "uuid", disk.uuid.as_str());
        store.put_i64(&group, "capacity", disk.capacity as i64);
        store.put(&group, "change_id", disk.change_id_or_sentinel());
        store.put(&group, "adapter_type", disk.adapter_type.to_string());
        store.put(&group, "controller_key", disk.controller_key.to_string());
        store.put(&group, "device_key", disk.key.to_string());
        store.put(&group, "bus_number", disk.bus_number.to_string());
        store.put(&group, "unit_number", disk.unit_number.to_string());
        store.put(&group, "backup_mode", BackupMode::Unknown.to_string());
        store.put(&group, "disk_mode", disk.disk_mode.as_str());
        store.put(&group, "rdiff_timestamp_ms", "-1");
        for kind in [
            ArchiveFileKind::Dump,
            ArchiveFileKind::Digest,
            ArchiveFileKind::Rdiff,
            ArchiveFileKind::Bitmap,
        ] {
            store.put(&group, file_name_key(kind), kind.file_name(disk_id, gzip));
        }
        store.put_bool(&group, "is_deleted_previous_dump", false);
        store.put(&group, "is_changed", "undefined");
        store.put(&group, "dump_begin_timestamp_ms", "-1");
        store.put(&group, "dump_end_timestamp_ms", "-1");
        store.put(&group, "status", GenerationStatus::Failed.to_string());

        store.put(&disk_index, disk.uuid.as_str(), disk_id.to_string());

        let controller = controller_group(disk.controller_key);
        store.put(&controller, "adapter_type", disk.adapter_type.to_string());
        store.put(&controller, "bus_number", disk.bus_number.to_string());
        store.put(
            &controller_index,
            disk.uuid.as_str(),
            disk.controller_key.to_string(),
        );
    }

    /// Load an existing manifest.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        let handle = ProfileHandle::load(path.clone())?
            .ok_or_else(|| format_err!("generation manifest {:?} not found", path))?;
        Ok(Self::from_handle(handle))
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Generation directory, all file names are relative to it.
    pub fn directory(&self) -> &Path {
        self.handle.directory()
    }

    pub fn write(&self) -> Result<(), Error> {
        self.handle.write()
    }

    fn gen_val(&self, key: &str) -> Option<&str> {
        self.handle.store().get(&self.generation, key)
    }

    fn disk_val(&self, disk_id: usize, key: &str) -> Option<&str> {
        self.handle.store().get(&disk_group(disk_id), key)
    }

    fn disk_i64(&self, disk_id: usize, key: &str) -> Option<i64> {
        self.handle.store().get_i64(&disk_group(disk_id), key)
    }

    fn disk_i32(&self, disk_id: usize, key: &str) -> Option<i32> {
        self.handle.store().get_i32(&disk_group(disk_id), key)
    }

    fn put_disk<V: Into<String>>(&mut self, disk_id: usize, key: &str, value: V) {
        self.handle.store_mut().put(&disk_group(disk_id), key, value);
    }

    pub fn generation_id(&self) -> Option<GenerationId> {
        self.handle
            .store()
            .get_i64(&self.generation, "generation_id")
            .and_then(|id| GenerationId::try_from(id).ok())
    }

    pub fn prev_generation_id(&self) -> Option<GenerationId> {
        self.handle
            .store()
            .get_i64(&self.generation, "prev_generation_id")
            .and_then(|id| GenerationId::try_from(id).ok())
    }

    pub fn moref(&self) -> Option<&str> {
        self.gen_val("moref")
    }

    pub fn name(&self) -> Option<&str> {
        self.gen_val("name")
    }

    pub fn snapshot_moref(&self) -> Option<&str> {
        self.gen_val("snapshot_moref")
    }

    pub fn snapshot_name(&self) -> Option<&str> {
        self.gen_val("snapshot_name")
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.handle.store().get_i64(&self.generation, "timestamp_ms")
    }

    pub fn ovf_path(&self) -> Option<PathBuf> {
        self.gen_val("ovf_filename")
            .map(|name| self.directory().join(name))
    }

    pub fn num_disks(&self) -> Option<usize> {
        self.gen_val("num_disks")
            .and_then(format::parse_i64)
            .and_then(|n| usize::try_from(n).ok())
    }

    pub fn status(&self) -> Option<GenerationStatus> {
        self.gen_val("status").and_then(|s| s.parse().ok())
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.status(), Some(GenerationStatus::Succeeded))
    }

    /// Record the final result, a terminal status cannot be changed.
    pub fn set_succeeded(&mut self, succeeded: bool) -> Result<(), Error> {
        let status = GenerationStatus::from_success(succeeded);
        match self.status() {
            Some(current) if current.is_terminal() && current != status => {
                bail!(
                    "generation {:?} already finished with status {}",
                    self.generation_id(),
                    current
                );
            }
            _ => {}
        }
        let generation = self.generation.clone();
        self.handle
            .store_mut()
            .put(&generation, "status", status.to_string());
        Ok(())
    }

    pub fn disk_id_by_uuid(&self, uuid: &str) -> Option<usize> {
        self.handle
            .store()
            .get(&self.disk_index, uuid)
            .and_then(format::parse_i64)
            .and_then(|id| usize::try_from(id).ok())
    }

    /// Disk ids in ascending order, taken from the uuid index.
    pub fn disk_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = match self.handle.store().get_all(&self.disk_index) {
            Some(entries) => entries
                .values()
                .filter_map(|id| format::parse_i64(id))
                .filter_map(|id| usize::try_from(id).ok())
                .collect(),
            None => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    pub fn uuid(&self, disk_id: usize) -> Option<&str> {
        self.disk_val(disk_id, "uuid")
    }

    pub fn remote_path(&self, disk_id: usize) -> Option<&str> {
        self.disk_val(disk_id, "remote_path")
    }

    /// Stored change id, `None` if missing or the unavailable sentinel.
    pub fn change_id(&self, disk_id: usize) -> Option<&str> {
        self.disk_val(disk_id, "change_id")
            .filter(|id| vmbkp_api_types::is_valid_change_id(Some(*id)))
    }

    pub fn raw_change_id(&self, disk_id: usize) -> &str {
        self.disk_val(disk_id, "change_id")
            .unwrap_or(CHANGE_ID_UNAVAILABLE)
    }

    pub fn capacity(&self, disk_id: usize) -> Option<u64> {
        self.disk_i64(disk_id, "capacity")
            .and_then(|c| u64::try_from(c).ok())
    }

    pub fn controller_key(&self, disk_id: usize) -> Option<i32> {
        self.disk_i32(disk_id, "controller_key")
    }

    pub fn device_key(&self, disk_id: usize) -> Option<i32> {
        self.disk_i32(disk_id, "device_key")
    }

    pub fn unit_number(&self, disk_id: usize) -> Option<i32> {
        self.disk_i32(disk_id, "unit_number")
    }

    /// Bus number of a controller.
    pub fn bus_number(&self, controller_key: i32) -> Option<i32> {
        self.handle
            .store()
            .get_i32(&controller_group(controller_key), "bus_number")
    }

    /// Controller key of a disk, looked up through the controller index.
    pub fn controller_key_by_uuid(&self, uuid: &str) -> Option<i32> {
        self.handle
            .store()
            .get(&self.controller_index, uuid)
            .and_then(format::parse_i32)
    }

    pub fn adapter_type(&self, disk_id: usize) -> AdapterType {
        self.disk_val(disk_id, "adapter_type")
            .map(AdapterType::parse_lenient)
            .unwrap_or(AdapterType::Unknown)
    }

    pub fn disk_mode(&self, disk_id: usize) -> Option<&str> {
        self.disk_val(disk_id, "disk_mode")
    }

    pub fn is_independent_disk(&self, disk_id: usize) -> bool {
        self.disk_mode(disk_id) == Some(DISK_MODE_INDEPENDENT_PERSISTENT)
    }

    pub fn backup_mode(&self, disk_id: usize) -> BackupMode {
        self.disk_val(disk_id, "backup_mode")
            .map(BackupMode::parse_lenient)
            .unwrap_or(BackupMode::Unknown)
    }

    pub fn set_backup_mode(&mut self, disk_id: usize, mode: BackupMode) {
        self.put_disk(disk_id, "backup_mode", mode.to_string());
    }

    pub fn is_dump_succeeded(&self, disk_id: usize) -> bool {
        self.disk_val(disk_id, "status")
            .and_then(|s| s.parse::<GenerationStatus>().ok())
            .map(|s| s.is_succeeded())
            .unwrap_or(false)
    }

    /// Record the copy result of one disk and bump the counters.
    pub fn set_vmdkdump_result(&mut self, disk_id: usize, succeeded: bool) {
        let status = GenerationStatus::from_success(succeeded);
        self.put_disk(disk_id, "status", status.to_string());

        let key = if succeeded {
            "num_vmdkdump_succeeded"
        } else {
            "num_vmdkdump_failed"
        };
        let count = self.handle.store().get_i64(&self.generation, key).unwrap_or(0);
        let generation = self.generation.clone();
        self.handle
            .store_mut()
            .put(&generation, key, (count + 1).to_string());
    }

    pub fn num_succeeded_dumps(&self) -> i64 {
        self.handle
            .store()
            .get_i64_or_minus_one(&self.generation, "num_vmdkdump_succeeded")
    }

    pub fn num_failed_dumps(&self) -> i64 {
        self.handle
            .store()
            .get_i64_or_minus_one(&self.generation, "num_vmdkdump_failed")
    }

    pub fn file_name(&self, disk_id: usize, kind: ArchiveFileKind) -> Option<&str> {
        self.disk_val(disk_id, file_name_key(kind))
    }

    pub fn set_file_name(&mut self, disk_id: usize, kind: ArchiveFileKind, name: &str) {
        self.put_disk(disk_id, file_name_key(kind), name);
    }

    pub fn file_path(&self, disk_id: usize, kind: ArchiveFileKind) -> Option<PathBuf> {
        self.file_name(disk_id, kind)
            .map(|name| self.directory().join(name))
    }

    /// True if the referenced file exists as a regular file.
    pub fn file_exists(&self, disk_id: usize, kind: ArchiveFileKind) -> bool {
        self.file_path(disk_id, kind)
            .map(vmbkp_tools::fs::is_regular_file)
            .unwrap_or(false)
    }

    pub fn set_changed(&mut self, disk_id: usize, changed: bool) {
        self.put_disk(disk_id, "is_changed", format::format_bool(changed));
    }

    /// `None` until the backup decided whether the disk changed.
    pub fn is_changed(&self, disk_id: usize) -> Option<bool> {
        self.disk_val(disk_id, "is_changed").and_then(format::parse_bool)
    }

    pub fn set_deleted_previous_dump(&mut self, disk_id: usize, deleted: bool) {
        self.put_disk(disk_id, "is_deleted_previous_dump", format::format_bool(deleted));
    }

    pub fn is_deleted_previous_dump(&self, disk_id: usize) -> bool {
        self.disk_val(disk_id, "is_deleted_previous_dump")
            .and_then(format::parse_bool)
            .unwrap_or(false)
    }

    pub fn set_dump_begin(&mut self, disk_id: usize, timestamp_ms: i64) {
        self.put_disk(disk_id, "dump_begin_timestamp_ms", timestamp_ms.to_string());
    }

    pub fn set_dump_end(&mut self, disk_id: usize, timestamp_ms: i64) {
        self.put_disk(disk_id, "dump_end_timestamp_ms", timestamp_ms.to_string());
    }

    /// Copy duration, `None` unless both timestamps are recorded.
    pub fn dump_elapsed_ms(&self, disk_id: usize) -> Option<i64> {
        let begin = self.disk_i64(disk_id, "dump_begin_timestamp_ms")?;
        let end = self.disk_i64(disk_id, "dump_end_timestamp_ms")?;
        if begin < 0 || end < 0 {
            return None;
        }
        Some(end - begin)
    }

    /// `[0 scsi0:1 8GB incr 12s]`
    pub fn disk_status_line(&self, disk_id: usize) -> String {
        let bus = self
            .controller_key(disk_id)
            .and_then(|ckey| self.bus_number(ckey))
            .map(|b| b.to_string())
            .unwrap_or_else(|| String::from("?"));
        let unit = self
            .unit_number(disk_id)
            .map(|u| u.to_string())
            .unwrap_or_else(|| String::from("?"));
        let capacity = self
            .capacity(disk_id)
            .map(|c| format::format_i64(c as i64))
            .unwrap_or_else(|| String::from("?"));
        let elapsed = self.dump_elapsed_ms(disk_id).unwrap_or(-1000) / 1000;

        format!(
            "[{} {}{}:{} {}B {} {}s]",
            disk_id,
            self.adapter_type(disk_id).controller_type(),
            bus,
            unit,
            capacity,
            self.backup_mode(disk_id),
            elapsed,
        )
    }
}
