//! Resolution of command line targets to machine morefs.

use std::collections::HashSet;

use vmbkp_config::vm_group::ALL_TARGET;
use vmbkp_config::VmGroupConfig;
use vmbkp_datastore::MachineIndex;

/// Operations working on a list of target machines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Backup,
    Restore,
    Check,
    Status,
    Clean,
}

impl Operation {
    /// Restore, status and clean also work on machines which are gone.
    pub fn available_only(&self) -> bool {
        !matches!(self, Operation::Restore | Operation::Status | Operation::Clean)
    }
}

fn dedup_keeping_order(list: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    list.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

fn resolve_without_groups(index: &MachineIndex, name: &str) -> Vec<String> {
    if name == ALL_TARGET {
        index.all_morefs()
    } else if let Some(moref) = index.moref_by_name(name) {
        vec![moref.to_string()]
    } else if index.exists_moref(name) {
        vec![name.to_string()]
    } else {
        log::warn!("target {} not found", name);
        Vec::new()
    }
}

/// Map target names (`all`, group names, machine names or morefs) to
/// morefs, in order and without duplicates.
///
/// Templates are never selected, machines which are no longer available
/// only if the operation allows it.
pub fn resolve_targets(
    names: &[String],
    groups: Option<&VmGroupConfig>,
    index: &MachineIndex,
    operation: Operation,
) -> Vec<String> {
    let mut morefs = Vec::new();
    for name in names {
        let resolved = match groups {
            Some(groups) => groups.resolve(name, index),
            None => resolve_without_groups(index, name),
        };
        if resolved.is_empty() {
            log::warn!("{} is not either group name, vm name, or vm moref", name);
        }
        morefs.extend(resolved);
    }

    let mut morefs = dedup_keeping_order(morefs);
    if operation.available_only() {
        morefs = index.filter_available(&morefs);
    }
    let morefs = index.filter_non_template(&morefs);

    log::info!("targets: {:?}", morefs);
    morefs
}

#[cfg(test)]
mod test {
    use super::*;

    use anyhow::Error;

    use vmbkp_api_types::VmInfo;
    use vmbkp_config::ProfileHandle;
    use vmbkp_datastore::InventoryEntry;

    fn create_testdir(name: &str) -> Result<String, Error> {
        let mut testdir: std::path::PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir.to_str().unwrap().to_string())
    }

    fn entry(name: &str, moref: &str, is_template: bool) -> InventoryEntry {
        InventoryEntry {
            vm: VmInfo::new(name, moref),
            is_template,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_targets() -> Result<(), Error> {
        let testdir = create_testdir("resolve")?;
        let mut index = MachineIndex::open(format!("{}/vmbkp_all_vm.profile", testdir))?;
        index.refresh(
            &[
                entry("web01", "vm-101", false),
                entry("web02", "vm-102", false),
                entry("db01", "vm-201", false),
                entry("golden", "vm-900", true),
            ],
            1_000,
        )?;
        // vm-102 disappears
        index.refresh(
            &[
                entry("web01", "vm-101", false),
                entry("db01", "vm-201", false),
                entry("golden", "vm-900", true),
            ],
            2_000,
        )?;

        assert_eq!(
            resolve_targets(&names(&["db01", "vm-101", "web01"]), None, &index, Operation::Backup),
            names(&["vm-201", "vm-101"])
        );
        assert_eq!(
            resolve_targets(&names(&["all"]), None, &index, Operation::Backup),
            names(&["vm-101", "vm-201"])
        );
        assert_eq!(
            resolve_targets(&names(&["all"]), None, &index, Operation::Status),
            names(&["vm-101", "vm-102", "vm-201"])
        );
        assert!(resolve_targets(&names(&["nothing"]), None, &index, Operation::Backup).is_empty());

        let handle = ProfileHandle::new(format!("{}/vmbkp_group.conf", testdir));
        let mut groups = VmGroupConfig::from_handle(handle);
        groups.add_member("web", "web01", "name");
        groups.add_member("web", "vm-102", "moref");
        groups.add_member("everything", "web", "group");
        groups.add_member("everything", "vm-201", "moref");

        assert_eq!(
            resolve_targets(&names(&["everything"]), Some(&groups), &index, Operation::Clean),
            names(&["vm-101", "vm-102", "vm-201"])
        );
        assert_eq!(
            resolve_targets(&names(&["web", "db01"]), Some(&groups), &index, Operation::Backup),
            names(&["vm-101", "vm-201"])
        );
        Ok(())
    }
}
