//! Index of all machines known to the hypervisor (`vmbkp_all_vm.profile`).
//!
//! ```text
//! [index "moref_name"]
//!     web01 = vm-101
//! [vm-101]
//!     availability = true
//!     is_template = false
//!     name = web01
//!     timestamp = 2011-08-04T12:00:00Z
//!     timestamp_ms = 1312459200000
//! [vm_set]
//!     vm-101 = web01
//! ```

use std::path::PathBuf;

use anyhow::Error;

use vmbkp_api_types::VmInfo;
use vmbkp_config::{Group, ProfileHandle, VmLookup};
use vmbkp_tools::lock::{LockError, LockGuard};

const VM_SET_GROUP: &str = "vm_set";
const INDEX_GROUP: &str = "index";
const INDEX_MOREF_NAME: &str = "moref_name";

const NAME: &str = "name";
const AVAILABILITY: &str = "availability";
const TIMESTAMP: &str = "timestamp";
const TIMESTAMP_MS: &str = "timestamp_ms";
const IS_TEMPLATE: &str = "is_template";

/// A machine seen during inventory refresh.
#[derive(Clone, Debug)]
pub struct InventoryEntry {
    pub vm: VmInfo,
    pub is_template: bool,
}

pub struct MachineIndex {
    handle: ProfileHandle,
    vm_set: Group,
    name_index: Group,
}

/// RFC3339 representation of a millisecond timestamp.
pub(crate) fn timestamp_string(timestamp_ms: i64) -> String {
    proxmox_time::epoch_to_rfc3339_utc(timestamp_ms.div_euclid(1000))
        .unwrap_or_else(|_| timestamp_ms.to_string())
}

impl MachineIndex {
    fn from_handle(handle: ProfileHandle) -> Self {
        Self {
            handle,
            vm_set: Group::new(VM_SET_GROUP),
            name_index: Group::with_sub(INDEX_GROUP, INDEX_MOREF_NAME),
        }
    }

    /// Load the index, an absent file yields an empty index.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let (handle, _) = ProfileHandle::load_or_new(path)?;
        Ok(Self::from_handle(handle))
    }

    pub fn handle(&self) -> &ProfileHandle {
        &self.handle
    }

    pub fn lock(&self, timeout: i64) -> Result<LockGuard, LockError> {
        self.handle.lock(timeout)
    }

    pub fn write(&self) -> Result<(), Error> {
        self.handle.write()
    }

    pub fn reload(&mut self) -> Result<(), Error> {
        if self.handle.exists() {
            self.handle.reload()?;
        }
        Ok(())
    }

    pub fn set_all_unavailable(&mut self) {
        for moref in self.all_morefs() {
            self.handle
                .store_mut()
                .put_bool(&Group::new(moref), AVAILABILITY, false);
        }
    }

    /// Add or update a machine and mark it available.
    pub fn add_vm(
        &mut self,
        vm: &VmInfo,
        timestamp_ms: i64,
        is_template: bool,
    ) -> Result<(), Error> {
        vmbkp_api_types::check_moref(&vm.moref)?;

        let vm_group = Group::new(vm.moref.as_str());
        let store = self.handle.store_mut();

        // drop a stale reverse entry if the machine was renamed
        if let Some(old_name) = store.get(&self.vm_set, &vm.moref).map(String::from) {
            if old_name != vm.name && store.get(&self.name_index, &old_name) == Some(&vm.moref) {
                store.del(&self.name_index, &old_name);
            }
        }

        store.put(&self.vm_set, vm.moref.as_str(), vm.name.as_str());
        store.put(&self.name_index, vm.name.as_str(), vm.moref.as_str());
        store.put(&vm_group, NAME, vm.name.as_str());
        store.put_bool(&vm_group, AVAILABILITY, true);
        store.put(&vm_group, TIMESTAMP, timestamp_string(timestamp_ms));
        store.put(&vm_group, TIMESTAMP_MS, timestamp_ms.to_string());
        store.put_bool(&vm_group, IS_TEMPLATE, is_template);
        Ok(())
    }

    /// Rebuild availability: everything unavailable, then mark what is seen.
    pub fn refresh(&mut self, seen: &[InventoryEntry], timestamp_ms: i64) -> Result<(), Error> {
        self.set_all_unavailable();
        for entry in seen {
            self.add_vm(&entry.vm, timestamp_ms, entry.is_template)?;
        }
        Ok(())
    }

    pub fn moref_by_name(&self, name: &str) -> Option<&str> {
        self.handle.store().get(&self.name_index, name)
    }

    pub fn name_by_moref(&self, moref: &str) -> Option<&str> {
        self.handle.store().get(&self.vm_set, moref)
    }

    pub fn all_morefs(&self) -> Vec<String> {
        self.handle
            .store()
            .get_all(&self.vm_set)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exists_moref(&self, moref: &str) -> bool {
        self.name_by_moref(moref).is_some()
    }

    pub fn exists_name(&self, name: &str) -> bool {
        self.moref_by_name(name).is_some()
    }

    pub fn is_available(&self, moref: &str) -> bool {
        self.handle
            .store()
            .get_bool(&Group::new(moref), AVAILABILITY)
            .unwrap_or(false)
    }

    pub fn is_available_name(&self, name: &str) -> bool {
        self.moref_by_name(name)
            .map(|moref| self.is_available(moref))
            .unwrap_or(false)
    }

    pub fn is_template(&self, moref: &str) -> bool {
        self.handle
            .store()
            .get_bool(&Group::new(moref), IS_TEMPLATE)
            .unwrap_or(false)
    }

    pub fn is_template_name(&self, name: &str) -> bool {
        self.moref_by_name(name)
            .map(|moref| self.is_template(moref))
            .unwrap_or(false)
    }

    /// Last time the machine was seen, in milliseconds.
    pub fn last_seen_ms(&self, moref: &str) -> Option<i64> {
        self.handle.store().get_i64(&Group::new(moref), TIMESTAMP_MS)
    }

    pub fn vm_info(&self, moref: &str) -> Option<VmInfo> {
        self.name_by_moref(moref)
            .map(|name| VmInfo::new(name, moref))
    }

    pub fn filter_available(&self, morefs: &[String]) -> Vec<String> {
        morefs
            .iter()
            .filter(|moref| self.is_available(moref))
            .cloned()
            .collect()
    }

    pub fn filter_non_template(&self, morefs: &[String]) -> Vec<String> {
        morefs
            .iter()
            .filter(|moref| !self.is_template(moref))
            .cloned()
            .collect()
    }
}

impl VmLookup for MachineIndex {
    fn all_morefs(&self) -> Vec<String> {
        MachineIndex::all_morefs(self)
    }

    fn moref_by_name(&self, name: &str) -> Option<String> {
        MachineIndex::moref_by_name(self, name).map(String::from)
    }

    fn name_by_moref(&self, moref: &str) -> Option<String> {
        MachineIndex::name_by_moref(self, moref).map(String::from)
    }

    fn is_available(&self, moref: &str) -> bool {
        MachineIndex::is_available(self, moref)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_utils::create_testdir;

    fn entry(name: &str, moref: &str, is_template: bool) -> InventoryEntry {
        InventoryEntry {
            vm: VmInfo::new(name, moref),
            is_template,
        }
    }

    #[test]
    fn test_machine_index() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "machine_index")?;
        let path = format!("{}/vmbkp_all_vm.profile", testdir);

        let mut index = MachineIndex::open(&path)?;
        assert!(index.all_morefs().is_empty());

        index.refresh(
            &[
                entry("web01", "vm-101", false),
                entry("db 01", "vm-102", false),
                entry("tmpl", "vm-900", true),
            ],
            1_312_459_200_000,
        )?;
        index.write()?;

        let mut index = MachineIndex::open(&path)?;
        assert_eq!(index.all_morefs(), vec!["vm-101", "vm-102", "vm-900"]);
        assert_eq!(index.moref_by_name("db 01"), Some("vm-102"));
        assert_eq!(index.name_by_moref("vm-101"), Some("web01"));
        assert!(index.is_available("vm-101"));
        assert!(index.is_available_name("db 01"));
        assert!(index.is_template("vm-900"));
        assert!(index.is_template_name("tmpl"));
        assert!(!index.exists_moref("vm-1"));
        assert_eq!(index.last_seen_ms("vm-101"), Some(1_312_459_200_000));
        assert_eq!(index.vm_info("vm-102"), Some(VmInfo::new("db 01", "vm-102")));

        // vm-102 vanished, vm-101 was renamed
        index.refresh(&[entry("web01-new", "vm-101", false)], 1_312_459_300_000)?;
        assert!(index.is_available("vm-101"));
        assert!(!index.is_available("vm-102"));
        assert!(!index.is_available("vm-900"));
        assert!(index.exists_moref("vm-102"));
        assert!(index.exists_name("db 01"));
        assert_eq!(index.moref_by_name("web01"), None);
        assert_eq!(index.moref_by_name("web01-new"), Some("vm-101"));

        let all = index.all_morefs();
        assert_eq!(index.filter_available(&all), vec!["vm-101"]);
        assert_eq!(index.filter_non_template(&all), vec!["vm-101", "vm-102"]);

        assert!(index.add_vm(&VmInfo::new("bad", "vm/1"), 0, false).is_err());
        Ok(())
    }
}
