//! Global configuration (`vmbkp_global.conf`).
//!
//! ```text
//! [global]
//!     root_directory = /backup/vmbkp
//!     vmdkbkp_path = /usr/bin/vmdkbkp
//!     profile_all_vm_file_name = vmbkp_all_vm.profile
//!     keep_generations = 5
//! [vsphere]
//!     server = vcenter.example.com
//!     url = https://vcenter.example.com/sdk
//!     username = backup
//!     password = secret
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use vmbkp_api_types::{ALL_VM_PROFILE_FILE_NAME, DEFAULT_KEEP_GENERATIONS, VM_PROFILE_FILE_NAME};

use crate::{format, Group, ProfileHandle};

pub const GLOBAL_GROUP: &str = "global";
pub const VSPHERE_GROUP: &str = "vsphere";

const ROOT_DIRECTORY: &str = "root_directory";
const VMDKBKP_PATH: &str = "vmdkbkp_path";
const PROFILE_ALL_VM_FILE_NAME: &str = "profile_all_vm_file_name";
const KEEP_GENERATIONS: &str = "keep_generations";

/// Connection parameters of the hypervisor management server.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VSphereConfig {
    pub server: Option<String>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct GlobalConfig {
    handle: ProfileHandle,
    global: Group,
    vsphere: Group,
}

impl GlobalConfig {
    /// Read the global config, the file must exist.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        let handle = ProfileHandle::load(path.clone())?
            .ok_or_else(|| format_err!("global config {:?} not found", path))?;
        Ok(Self::from_handle(handle))
    }

    pub fn from_handle(handle: ProfileHandle) -> Self {
        Self {
            handle,
            global: Group::new(GLOBAL_GROUP),
            vsphere: Group::new(VSPHERE_GROUP),
        }
    }

    pub fn handle(&self) -> &ProfileHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ProfileHandle {
        &mut self.handle
    }

    fn global_val(&self, key: &str) -> Option<&str> {
        self.handle.store().get(&self.global, key)
    }

    /// Archive root, which must be an existing directory.
    pub fn root_directory(&self) -> Result<PathBuf, Error> {
        let root = self
            .global_val(ROOT_DIRECTORY)
            .ok_or_else(|| format_err!("{} is not configured", ROOT_DIRECTORY))?;
        let root = PathBuf::from(root);
        if !root.is_dir() {
            bail!("root directory {:?} not found", root);
        }
        Ok(root)
    }

    /// Path of the disk copy tool, which must be an executable file.
    pub fn vmdkbkp_path(&self) -> Result<PathBuf, Error> {
        let path = self
            .global_val(VMDKBKP_PATH)
            .ok_or_else(|| format_err!("{} is not configured", VMDKBKP_PATH))?;
        let path = PathBuf::from(path);
        let executable = std::fs::metadata(&path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if !executable {
            bail!("{:?} is not found or not executable", path);
        }
        Ok(path)
    }

    /// Machine index file path.
    pub fn all_vm_profile_path(&self) -> Result<PathBuf, Error> {
        let name = self
            .global_val(PROFILE_ALL_VM_FILE_NAME)
            .unwrap_or(ALL_VM_PROFILE_FILE_NAME);
        Ok(self.root_directory()?.join(name))
    }

    /// Number of succeeded generations to keep, default 5.
    pub fn keep_generations(&self) -> u32 {
        match self.global_val(KEEP_GENERATIONS).and_then(format::parse_i32) {
            Some(n) if n >= 0 => n as u32,
            Some(n) => {
                log::warn!("invalid {} {}, using default", KEEP_GENERATIONS, n);
                DEFAULT_KEEP_GENERATIONS
            }
            None => DEFAULT_KEEP_GENERATIONS,
        }
    }

    pub fn vsphere(&self) -> VSphereConfig {
        let store = self.handle.store();
        let get = |key: &str| store.get(&self.vsphere, key).map(String::from);
        VSphereConfig {
            server: get("server"),
            url: get("url"),
            username: get("username"),
            password: get("password"),
        }
    }

    /// Directory holding all archives of one machine.
    pub fn vm_directory(&self, moref: &str) -> Result<PathBuf, Error> {
        vmbkp_api_types::check_moref(moref)?;
        Ok(self.root_directory()?.join(moref))
    }

    /// Generation chain file of one machine.
    pub fn vm_profile_path(&self, moref: &str) -> Result<PathBuf, Error> {
        Ok(self.vm_directory(moref)?.join(VM_PROFILE_FILE_NAME))
    }
}

/// Write a minimal global config, used for initial setup and tests.
pub fn create_global_config<P: AsRef<Path>>(
    path: P,
    root_directory: &Path,
    vmdkbkp_path: &Path,
    keep_generations: u32,
) -> Result<GlobalConfig, Error> {
    let mut handle = ProfileHandle::new(path.as_ref());
    let global = Group::new(GLOBAL_GROUP);
    let store = handle.store_mut();
    store.put(&global, ROOT_DIRECTORY, root_directory.to_string_lossy());
    store.put(&global, VMDKBKP_PATH, vmdkbkp_path.to_string_lossy());
    store.put(&global, PROFILE_ALL_VM_FILE_NAME, ALL_VM_PROFILE_FILE_NAME);
    store.put_i64(&global, KEEP_GENERATIONS, keep_generations as i64);
    handle.write()?;
    Ok(GlobalConfig::from_handle(handle))
}
