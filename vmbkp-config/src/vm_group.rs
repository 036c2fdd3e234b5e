//! VM group configuration (`vmbkp_group.conf`).
//!
//! ```text
//! [group "web"]
//!     vm-101 = moref
//!     db01 = name
//!     frontend = group
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Error;

use crate::{Group, ProfileHandle};

pub const GROUP_SECTION: &str = "group";
/// Target name selecting every known machine.
pub const ALL_TARGET: &str = "all";

/// Lookup of machines known to the inventory.
pub trait VmLookup {
    fn all_morefs(&self) -> Vec<String>;
    fn moref_by_name(&self, name: &str) -> Option<String>;
    fn name_by_moref(&self, moref: &str) -> Option<String>;
    fn is_available(&self, moref: &str) -> bool;
}

pub struct VmGroupConfig {
    handle: ProfileHandle,
}

impl VmGroupConfig {
    /// Load the group config, a missing file means no groups.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let (handle, _) = ProfileHandle::load_or_new(path)?;
        Ok(Self { handle })
    }

    pub fn from_handle(handle: ProfileHandle) -> Self {
        Self { handle }
    }

    pub fn handle_mut(&mut self) -> &mut ProfileHandle {
        &mut self.handle
    }

    fn group(name: &str) -> Group {
        Group::with_sub(GROUP_SECTION, name)
    }

    /// Add a member (`kind` is one of `moref`, `name`, `group`).
    pub fn add_member(&mut self, group: &str, key: &str, kind: &str) {
        self.handle.store_mut().put(&Self::group(group), key, kind);
    }

    /// A group name is only valid if it has members.
    pub fn is_group_name(&self, name: &str) -> bool {
        self.handle
            .store()
            .get_all(&Self::group(name))
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.handle
            .store()
            .groups_named(GROUP_SECTION)
            .filter_map(|g| g.sub().map(String::from))
            .collect()
    }

    fn collect_group(
        &self,
        name: &str,
        lookup: &dyn VmLookup,
        visited: &mut BTreeSet<String>,
        result: &mut BTreeSet<String>,
    ) {
        if !visited.insert(name.to_string()) {
            log::warn!("group {} is included recursively, skipping", name);
            return;
        }

        let entries = match self.handle.store().get_all(&Self::group(name)) {
            Some(entries) => entries,
            None => return,
        };

        for (key, kind) in entries.iter() {
            match kind.as_str() {
                "moref" => {
                    result.insert(key.clone());
                }
                "name" => match lookup.moref_by_name(key) {
                    Some(moref) => {
                        result.insert(moref);
                    }
                    None => log::warn!("group {}: unknown vm name {}", name, key),
                },
                "group" => self.collect_group(key, lookup, visited, result),
                other => log::warn!(
                    "value {} is not supported for key {}, use moref, name or group",
                    other,
                    key
                ),
            }
        }
    }

    /// Morefs of all members of a group, sorted and deduplicated.
    pub fn group_morefs(&self, name: &str, lookup: &dyn VmLookup) -> Vec<String> {
        let mut result = BTreeSet::new();
        self.collect_group(name, lookup, &mut BTreeSet::new(), &mut result);
        result.into_iter().collect()
    }

    /// Resolve a target: `all`, a group name, a vm name or a moref.
    pub fn resolve(&self, name: &str, lookup: &dyn VmLookup) -> Vec<String> {
        if name == ALL_TARGET {
            let set: BTreeSet<String> = lookup.all_morefs().into_iter().collect();
            set.into_iter().collect()
        } else if self.is_group_name(name) {
            self.group_morefs(name, lookup)
        } else if let Some(moref) = lookup.moref_by_name(name) {
            vec![moref]
        } else if lookup.name_by_moref(name).is_some() {
            vec![name.to_string()]
        } else {
            Vec::new()
        }
    }

    /// Like `resolve`, restricted to currently available machines.
    pub fn resolve_available(&self, name: &str, lookup: &dyn VmLookup) -> Vec<String> {
        self.resolve(name, lookup)
            .into_iter()
            .filter(|moref| lookup.is_available(moref))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::BTreeMap;

    struct TestInventory(BTreeMap<String, (String, bool)>);

    impl TestInventory {
        fn new(list: &[(&str, &str, bool)]) -> Self {
            let mut map = BTreeMap::new();
            for (moref, name, available) in list.iter() {
                map.insert(moref.to_string(), (name.to_string(), *available));
            }
            Self(map)
        }
    }

    impl VmLookup for TestInventory {
        fn all_morefs(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }
        fn moref_by_name(&self, name: &str) -> Option<String> {
            self.0
                .iter()
                .find(|(_, (n, _))| n == name)
                .map(|(moref, _)| moref.clone())
        }
        fn name_by_moref(&self, moref: &str) -> Option<String> {
            self.0.get(moref).map(|(name, _)| name.clone())
        }
        fn is_available(&self, moref: &str) -> bool {
            self.0.get(moref).map(|(_, a)| *a).unwrap_or(false)
        }
    }

    #[test]
    fn test_resolve() -> Result<(), Error> {
        let inventory = TestInventory::new(&[
            ("vm-1", "web01", true),
            ("vm-2", "web02", false),
            ("vm-3", "db01", true),
        ]);

        let mut config = VmGroupConfig::from_handle(ProfileHandle::new("/nonexistent/group.conf"));
        config.add_member("web", "vm-1", "moref");
        config.add_member("web", "web02", "name");
        config.add_member("web", "unknown", "name");
        config.add_member("all-vms", "web", "group");
        config.add_member("all-vms", "db01", "name");
        config.add_member("all-vms", "all-vms", "group");
        config.add_member("all-vms", "vm-1", "bogus");

        assert_eq!(config.group_names(), vec!["all-vms", "web"]);
        assert_eq!(config.resolve("web", &inventory), vec!["vm-1", "vm-2"]);
        assert_eq!(
            config.resolve("all-vms", &inventory),
            vec!["vm-1", "vm-2", "vm-3"]
        );
        assert_eq!(config.resolve("all", &inventory), vec!["vm-1", "vm-2", "vm-3"]);
        assert_eq!(config.resolve("db01", &inventory), vec!["vm-3"]);
        assert_eq!(config.resolve("vm-2", &inventory), vec!["vm-2"]);
        assert!(config.resolve("nothing", &inventory).is_empty());
        assert_eq!(config.resolve_available("web", &inventory), vec!["vm-1"]);
        Ok(())
    }
}
