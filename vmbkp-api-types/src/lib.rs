//! Basic types used by most of the vmbkp code.

use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Change tracking token stored when the hypervisor did not provide one.
pub const CHANGE_ID_UNAVAILABLE: &str = "*";

/// Global configuration file name.
pub const GLOBAL_CONFIG_FILE_NAME: &str = "vmbkp_global.conf";
/// VM group configuration file name.
pub const GROUP_CONFIG_FILE_NAME: &str = "vmbkp_group.conf";
/// Default machine index file name (relative to the archive root).
pub const ALL_VM_PROFILE_FILE_NAME: &str = "vmbkp_all_vm.profile";
/// Generation chain file name inside each machine directory.
pub const VM_PROFILE_FILE_NAME: &str = "vmbkp_vm.profile";
/// Generation manifest file name inside each generation directory.
pub const GENERATION_PROFILE_FILE_NAME: &str = "vmbkp_generation.profile";

/// Disk mode string of disks which are excluded from snapshots.
pub const DISK_MODE_INDEPENDENT_PERSISTENT: &str = "independent_persistent";

/// Default number of succeeded generations to keep.
pub const DEFAULT_KEEP_GENERATIONS: u32 = 5;

/// Backup mode of a single disk.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Complete copy of the disk.
    Full,
    /// Full copy plus reverse delta against the previous dump.
    Diff,
    /// Copy of changed blocks only, reusing the previous dump.
    Incr,
    #[default]
    Unknown,
}

serde_plain::derive_display_from_serialize!(BackupMode);
serde_plain::derive_fromstr_from_deserialize!(BackupMode);

impl BackupMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::Diff => "diff",
            BackupMode::Incr => "incr",
            BackupMode::Unknown => "unknown",
        }
    }

    /// Parse a mode, mapping anything unknown to `BackupMode::Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(BackupMode::Unknown)
    }
}

/// Disk controller adapter type.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    Ide,
    BusLogic,
    LsiLogic,
    LsiLogicSas,
    #[default]
    Unknown,
}

serde_plain::derive_display_from_serialize!(AdapterType);
serde_plain::derive_fromstr_from_deserialize!(AdapterType);

impl AdapterType {
    /// Controller family as used by the hypervisor (`ide` or `scsi`).
    pub const fn controller_type(&self) -> &'static str {
        match self {
            AdapterType::Ide => "ide",
            AdapterType::BusLogic | AdapterType::LsiLogic | AdapterType::LsiLogicSas => "scsi",
            AdapterType::Unknown => "unknown",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(AdapterType::Unknown)
    }
}

/// Status of a generation or of a single disk inside it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Initialized,
    Succeeded,
    Failed,
}

serde_plain::derive_display_from_serialize!(GenerationStatus);
serde_plain::derive_fromstr_from_deserialize!(GenerationStatus);

impl GenerationStatus {
    pub fn is_succeeded(&self) -> bool {
        *self == GenerationStatus::Succeeded
    }

    /// A status is terminal once set to succeeded or failed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationStatus::Initialized)
    }

    pub fn from_success(ok: bool) -> Self {
        if ok {
            GenerationStatus::Succeeded
        } else {
            GenerationStatus::Failed
        }
    }
}

/// Name and managed object reference of a hypervisor entity.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ManagedEntityInfo {
    pub name: String,
    pub moref: String,
}

impl ManagedEntityInfo {
    pub fn new<N: Into<String>, M: Into<String>>(name: N, moref: M) -> Self {
        Self {
            name: name.into(),
            moref: moref.into(),
        }
    }
}

impl fmt::Display for ManagedEntityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.moref)
    }
}

/// Virtual machine identity.
pub type VmInfo = ManagedEntityInfo;
/// Snapshot identity.
pub type SnapInfo = ManagedEntityInfo;

/// Virtual disk descriptor handed over by the hypervisor layer.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VmdkInfo {
    /// Hypervisor side path, e.g. `[datastore1] vm/vm.vmdk`.
    pub name: String,
    pub uuid: String,
    /// Change tracking token, `None` if not available.
    pub change_id: Option<String>,
    pub key: i32,
    pub controller_key: i32,
    pub capacity: u64,
    pub adapter_type: AdapterType,
    pub bus_number: i32,
    pub unit_number: i32,
    pub disk_mode: String,
}

impl VmdkInfo {
    /// Change id as stored in the manifest (the sentinel if unavailable).
    pub fn change_id_or_sentinel(&self) -> &str {
        self.change_id.as_deref().unwrap_or(CHANGE_ID_UNAVAILABLE)
    }
}

/// Returns true if `change_id` is a real change tracking token.
pub fn is_valid_change_id(change_id: Option<&str>) -> bool {
    matches!(change_id, Some(id) if id != CHANGE_ID_UNAVAILABLE && !id.is_empty())
}

/// Kind of file stored per disk inside a generation directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchiveFileKind {
    Dump,
    Digest,
    Rdiff,
    Bitmap,
}

impl ArchiveFileKind {
    pub const fn extension(&self) -> &'static str {
        match self {
            ArchiveFileKind::Dump => "dump",
            ArchiveFileKind::Digest => "digest",
            ArchiveFileKind::Rdiff => "rdiff",
            ArchiveFileKind::Bitmap => "bmp",
        }
    }

    /// Default file name for disk `disk_id`, bitmaps are never compressed.
    pub fn file_name(&self, disk_id: usize, gzip: bool) -> String {
        match self {
            ArchiveFileKind::Bitmap => format!("{}.{}", disk_id, self.extension()),
            _ if gzip => format!("{}.{}.gz", disk_id, self.extension()),
            _ => format!("{}.{}", disk_id, self.extension()),
        }
    }
}

const GZIP_EXTENSION: &str = ".gz";

pub fn is_gzip_file_name(name: &str) -> bool {
    name.len() > GZIP_EXTENSION.len() && name.ends_with(GZIP_EXTENSION)
}

/// Convert a file name to its compressed or uncompressed variant.
pub fn convert_gzip_file_name(name: &str, gzip: bool) -> String {
    let base = name.strip_suffix(GZIP_EXTENSION).filter(|b| !b.is_empty()).unwrap_or(name);
    if gzip {
        format!("{}{}", base, GZIP_EXTENSION)
    } else {
        base.to_string()
    }
}

/// Validate a managed object reference string (e.g. `vm-123`).
pub fn check_moref(moref: &str) -> Result<(), Error> {
    if moref.is_empty() {
        bail!("empty moref");
    }
    if !moref
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid moref {:?}", moref);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_enum_strings() -> Result<(), Error> {
        assert_eq!(BackupMode::Incr.to_string(), "incr");
        assert_eq!("diff".parse::<BackupMode>()?, BackupMode::Diff);
        assert_eq!(BackupMode::parse_lenient("bogus"), BackupMode::Unknown);
        assert_eq!(AdapterType::LsiLogicSas.to_string(), "lsilogicsas");
        assert_eq!("buslogic".parse::<AdapterType>()?, AdapterType::BusLogic);
        assert_eq!(AdapterType::LsiLogic.controller_type(), "scsi");
        assert_eq!(AdapterType::Ide.controller_type(), "ide");
        assert_eq!(GenerationStatus::Succeeded.to_string(), "succeeded");
        assert!(!GenerationStatus::Initialized.is_terminal());
        Ok(())
    }

    #[test]
    fn test_file_names() {
        assert_eq!(ArchiveFileKind::Dump.file_name(0, true), "0.dump.gz");
        assert_eq!(ArchiveFileKind::Digest.file_name(3, false), "3.digest");
        assert_eq!(ArchiveFileKind::Bitmap.file_name(1, true), "1.bmp");
        assert!(is_gzip_file_name("0.dump.gz"));
        assert!(!is_gzip_file_name(".gz"));
        assert_eq!(convert_gzip_file_name("0.dump.gz", false), "0.dump");
        assert_eq!(convert_gzip_file_name("0.dump", true), "0.dump.gz");
        assert_eq!(convert_gzip_file_name("0.dump.gz", true), "0.dump.gz");
    }

    #[test]
    fn test_change_id() {
        assert!(!is_valid_change_id(None));
        assert!(!is_valid_change_id(Some("*")));
        assert!(is_valid_change_id(Some("52 1a/3")));
        assert!(check_moref("vm-42").is_ok());
        assert!(check_moref("vm/42").is_err());
    }
}
