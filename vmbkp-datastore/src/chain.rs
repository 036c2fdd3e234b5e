//! Generation chain of one machine (`<moref>/vmbkp_vm.profile`).
//!
//! ```text
//! [generation "0"]
//!     depending_generation_id = -1
//!     status = succeeded
//!     timestamp = 2011-08-04T12:00:00Z
//!     timestamp_ms = 1312459200000
//! [index "timestamp_ms-generation"]
//!     1312459200000 = 0
//! [meta]
//!     is_clean = true
//!     latest = 0
//!     moref = vm-101
//!     name = web01
//! ```
//!
//! Traversal order is the timestamp index, not the numeric id.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use vmbkp_api_types::{GenerationStatus, VmInfo, GENERATION_PROFILE_FILE_NAME};
use vmbkp_config::{format, Group, ProfileHandle};
use vmbkp_tools::lock::{LockError, LockGuard};

use crate::machine_index::timestamp_string;
use crate::prune::{self, GenerationInfo};

pub type GenerationId = u32;

const META_GROUP: &str = "meta";
const GENERATION_GROUP: &str = "generation";
const INDEX_GROUP: &str = "index";
const INDEX_TIMESTAMP: &str = "timestamp_ms-generation";

const MOREF: &str = "moref";
const NAME: &str = "name";
const IS_CLEAN: &str = "is_clean";
const LATEST: &str = "latest";
const STATUS: &str = "status";
const TIMESTAMP: &str = "timestamp";
const TIMESTAMP_MS: &str = "timestamp_ms";
const DEPENDING_GENERATION_ID: &str = "depending_generation_id";

fn generation_group(id: GenerationId) -> Group {
    Group::with_sub(GENERATION_GROUP, id.to_string())
}

pub struct GenerationChain {
    handle: ProfileHandle,
    meta: Group,
    ts_index: Group,
}

impl GenerationChain {
    fn from_handle(handle: ProfileHandle) -> Self {
        Self {
            handle,
            meta: Group::new(META_GROUP),
            ts_index: Group::with_sub(INDEX_GROUP, INDEX_TIMESTAMP),
        }
    }

    /// Fresh, clean chain without generations (nothing is written).
    pub fn create<P: Into<PathBuf>>(path: P, vm: &VmInfo) -> Result<Self, Error> {
        vmbkp_api_types::check_moref(&vm.moref)?;

        let mut chain = Self::from_handle(ProfileHandle::new(path));
        let meta = chain.meta.clone();
        let store = chain.handle.store_mut();
        store.put(&meta, MOREF, vm.moref.as_str());
        store.put(&meta, NAME, vm.name.as_str());
        store.put_bool(&meta, IS_CLEAN, true);
        store.put(&meta, LATEST, "-1");
        Ok(chain)
    }

    /// Load an existing chain, `None` if the file does not exist.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Option<Self>, Error> {
        Ok(ProfileHandle::load(path)?.map(Self::from_handle))
    }

    pub fn handle(&self) -> &ProfileHandle {
        &self.handle
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Machine directory holding the chain and all generation directories.
    pub fn directory(&self) -> &Path {
        self.handle.directory()
    }

    pub fn write(&self) -> Result<(), Error> {
        self.handle.write()
    }

    pub fn reload(&mut self) -> Result<(), Error> {
        self.handle.reload()
    }

    pub fn make_backup(&self) -> Result<PathBuf, Error> {
        self.handle.make_backup()
    }

    pub fn lock(&self, timeout: i64) -> Result<LockGuard, LockError> {
        self.handle.lock(timeout)
    }

    fn meta_val(&self, key: &str) -> Option<&str> {
        self.handle.store().get(&self.meta, key)
    }

    pub fn moref(&self) -> Option<&str> {
        self.meta_val(MOREF)
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_val(NAME)
    }

    pub fn set_name(&mut self, name: &str) {
        let meta = self.meta.clone();
        self.handle.store_mut().put(&meta, NAME, name);
    }

    /// A chain is clean unless an edit was interrupted.
    pub fn is_clean(&self) -> bool {
        match self.meta_val(IS_CLEAN) {
            None => {
                log::warn!("is_clean entry not found in {:?}", self.path());
                false
            }
            Some(value) => match format::parse_bool(value) {
                Some(true) => true,
                Some(false) => {
                    log::warn!(
                        "is_clean of {} is false, check the backup archive",
                        self.moref().unwrap_or("?")
                    );
                    false
                }
                None => {
                    log::warn!("is_clean entry {:?} is not a bool value", value);
                    false
                }
            },
        }
    }

    pub fn set_clean(&mut self, clean: bool) {
        let meta = self.meta.clone();
        self.handle.store_mut().put_bool(&meta, IS_CLEAN, clean);
    }

    /// Id of the newest allocated generation, `None` for an empty chain.
    pub fn latest_generation_id(&self) -> Result<Option<GenerationId>, Error> {
        let value = self
            .meta_val(LATEST)
            .ok_or_else(|| format_err!("latest generation id not set in {:?}", self.path()))?;
        if format::is_minus_one(value) {
            return Ok(None);
        }
        match format::parse_i64(value).map(GenerationId::try_from) {
            Some(Ok(id)) => Ok(Some(id)),
            _ => bail!("invalid latest generation id {:?} in {:?}", value, self.path()),
        }
    }

    /// Newest succeeded generation, skipping failed ones.
    pub fn latest_succeeded(&self) -> Option<GenerationId> {
        let latest = match self.latest_generation_id() {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("{}", err);
                return None;
            }
        };
        if self.is_succeeded(latest) {
            return Some(latest);
        }
        self.prev_succeeded(latest)
    }

    pub fn status(&self, id: GenerationId) -> Option<GenerationStatus> {
        self.handle
            .store()
            .get(&generation_group(id), STATUS)
            .and_then(|status| status.parse().ok())
    }

    pub fn is_succeeded(&self, id: GenerationId) -> bool {
        matches!(self.status(id), Some(GenerationStatus::Succeeded))
    }

    pub fn set_succeeded(&mut self, id: GenerationId, succeeded: bool) {
        let status = GenerationStatus::from_success(succeeded);
        self.handle
            .store_mut()
            .put(&generation_group(id), STATUS, status.to_string());
    }

    /// Generation `id` depended on when it was allocated.
    pub fn depending_generation_id(&self, id: GenerationId) -> Option<GenerationId> {
        self.handle
            .store()
            .get_i64(&generation_group(id), DEPENDING_GENERATION_ID)
            .and_then(|dep| GenerationId::try_from(dep).ok())
    }

    pub fn timestamp_ms(&self, id: GenerationId) -> Option<i64> {
        self.handle
            .store()
            .get_i64(&generation_group(id), TIMESTAMP_MS)
    }

    pub fn timestamp_str(&self, id: GenerationId) -> Option<&str> {
        self.handle.store().get(&generation_group(id), TIMESTAMP)
    }

    /// Set the timestamp, keeping the timestamp index consistent.
    pub fn set_timestamp_ms(&mut self, id: GenerationId, timestamp_ms: i64) {
        let group = generation_group(id);
        let ts_index = self.ts_index.clone();
        let store = self.handle.store_mut();

        if let Some(old) = store.get(&group, TIMESTAMP_MS).map(String::from) {
            log::debug!("delete {} from timestamp index", old);
            store.del(&ts_index, &old);
        }

        store.put(&group, TIMESTAMP, timestamp_string(timestamp_ms));
        store.put(&group, TIMESTAMP_MS, timestamp_ms.to_string());
        store.put(&ts_index, timestamp_ms.to_string(), id.to_string());
    }

    /// All generations ordered by timestamp, oldest first.
    pub fn generation_list(&self) -> Vec<GenerationInfo> {
        let mut list: Vec<GenerationInfo> = match self.handle.store().get_all(&self.ts_index) {
            Some(entries) => entries
                .iter()
                .filter_map(|(ts, id)| {
                    let timestamp_ms = format::parse_i64(ts)?;
                    let id = format::parse_i64(id).and_then(|id| GenerationId::try_from(id).ok())?;
                    Some(GenerationInfo {
                        id,
                        timestamp_ms,
                        succeeded: self.is_succeeded(id),
                    })
                })
                .collect(),
            None => Vec::new(),
        };
        GenerationInfo::sort_list(&mut list);
        list.reverse();
        list
    }

    pub fn generation_ids(&self) -> Vec<GenerationId> {
        self.generation_list().into_iter().map(|info| info.id).collect()
    }

    /// Succeeded generation right before `id` in timestamp order.
    pub fn prev_succeeded(&self, id: GenerationId) -> Option<GenerationId> {
        let list = self.generation_list();
        let pos = list.iter().position(|info| info.id == id)?;
        list[..pos]
            .iter()
            .rev()
            .find(|info| info.succeeded)
            .map(|info| info.id)
    }

    /// Succeeded generation right after `id` in timestamp order.
    pub fn next_succeeded(&self, id: GenerationId) -> Option<GenerationId> {
        let list = self.generation_list();
        let pos = list.iter().position(|info| info.id == id)?;
        list[pos + 1..]
            .iter()
            .find(|info| info.succeeded)
            .map(|info| info.id)
    }

    /// Allocate the next generation id.
    ///
    /// The new generation starts as failed and depends on the newest
    /// succeeded generation.
    pub fn create_new_generation(&mut self, timestamp_ms: i64) -> Result<GenerationId, Error> {
        let depending = self.latest_succeeded();
        let new_id = match self.latest_generation_id()? {
            Some(id) => id
                .checked_add(1)
                .ok_or_else(|| format_err!("generation id overflow"))?,
            None => 0,
        };

        let meta = self.meta.clone();
        let group = generation_group(new_id);
        let store = self.handle.store_mut();
        store.put(&meta, LATEST, new_id.to_string());
        store.put(
            &group,
            DEPENDING_GENERATION_ID,
            depending.map(i64::from).unwrap_or(-1).to_string(),
        );
        self.set_succeeded(new_id, false);
        self.set_timestamp_ms(new_id, timestamp_ms);

        Ok(new_id)
    }

    /// Remove a generation and its timestamp index entry.
    pub fn del_generation(&mut self, id: GenerationId) {
        let group = generation_group(id);
        let ts_index = self.ts_index.clone();
        let store = self.handle.store_mut();
        if let Some(ts) = store.get(&group, TIMESTAMP_MS).map(String::from) {
            store.del(&ts_index, &ts);
        }
        store.del_group(&group);
    }

    /// Generations outside the retention window of `keep` succeeded ones.
    pub fn old_generations(&self, keep: usize) -> BTreeSet<GenerationId> {
        prune::old_generations(self.generation_list(), keep)
    }

    /// Failed generations except the latest, which may still be running.
    pub fn failed_generations(&self) -> Vec<GenerationId> {
        let latest = match self.latest_generation_id() {
            Ok(Some(id)) => id,
            _ => return Vec::new(),
        };
        self.generation_list()
            .into_iter()
            .filter(|info| !info.succeeded && info.id != latest)
            .map(|info| info.id)
            .collect()
    }

    pub fn num_generations(&self) -> usize {
        self.generation_list().len()
    }

    pub fn num_succeeded(&self) -> usize {
        self.generation_list()
            .iter()
            .filter(|info| info.succeeded)
            .count()
    }

    pub fn generation_dir(&self, id: GenerationId) -> PathBuf {
        self.directory().join(id.to_string())
    }

    pub fn manifest_path(&self, id: GenerationId) -> PathBuf {
        self.generation_dir(id).join(GENERATION_PROFILE_FILE_NAME)
    }

    /// One line summary, the moref is parenthesized if the machine is gone.
    pub fn status_line(&self, available: bool) -> String {
        let moref = self.moref().unwrap_or("");
        let name = self.name().unwrap_or("");
        let mut line = if available {
            format!("[{}][{}]", moref, name)
        } else {
            format!("[({})][{}]", moref, name)
        };

        match self.latest_succeeded() {
            None => line.push_str(" ----------NO_ARCHIVE ----------"),
            Some(id) => {
                line.push_str(&format!(
                    "[Latest {} \"{}\"][Clean {}/{}]",
                    id,
                    self.timestamp_str(id).unwrap_or(""),
                    self.num_succeeded(),
                    self.num_generations()
                ));
            }
        }
        line
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_utils::create_testdir;

    fn test_chain(path: &str) -> Result<GenerationChain, Error> {
        GenerationChain::create(path, &VmInfo::new("web01", "vm-101"))
    }

    #[test]
    fn test_empty_chain() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "empty")?;
        let path = format!("{}/vmbkp_vm.profile", testdir);

        assert!(GenerationChain::load(&path)?.is_none());

        let chain = test_chain(&path)?;
        chain.write()?;

        let chain = GenerationChain::load(&path)?.unwrap();
        assert_eq!(chain.moref(), Some("vm-101"));
        assert_eq!(chain.name(), Some("web01"));
        assert!(chain.is_clean());
        assert_eq!(chain.latest_generation_id()?, None);
        assert_eq!(chain.latest_succeeded(), None);
        assert!(chain.failed_generations().is_empty());
        assert_eq!(chain.status_line(true), "[vm-101][web01] ----------NO_ARCHIVE ----------");
        Ok(())
    }

    #[test]
    fn test_traversal() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "traversal")?;
        let path = format!("{}/vmbkp_vm.profile", testdir);

        let mut chain = test_chain(&path)?;
        for id in 0..5 {
            let new_id = chain.create_new_generation(1_000_000 + id as i64 * 1000)?;
            assert_eq!(new_id, id);
            chain.set_succeeded(new_id, id != 3);
        }
        chain.write()?;

        let chain = GenerationChain::load(&path)?.unwrap();
        assert_eq!(chain.generation_ids(), vec![0, 1, 2, 3, 4]);
        assert_eq!(chain.prev_succeeded(4), Some(2));
        assert_eq!(chain.next_succeeded(2), Some(4));
        assert_eq!(chain.prev_succeeded(0), None);
        assert_eq!(chain.next_succeeded(4), None);
        assert_eq!(chain.prev_succeeded(17), None);
        assert_eq!(chain.latest_succeeded(), Some(4));

        assert_eq!(chain.depending_generation_id(0), None);
        assert_eq!(chain.depending_generation_id(3), Some(2));
        assert_eq!(chain.depending_generation_id(4), Some(2));

        assert_eq!(chain.failed_generations(), vec![3]);
        assert_eq!(chain.num_generations(), 5);
        assert_eq!(chain.num_succeeded(), 4);
        assert_eq!(chain.generation_dir(3), PathBuf::from(&testdir).join("3"));
        assert_eq!(
            chain.manifest_path(3),
            PathBuf::from(&testdir).join("3").join(GENERATION_PROFILE_FILE_NAME)
        );
        assert!(chain.status_line(false).starts_with("[(vm-101)][web01][Latest 4 \""));
        assert!(chain.status_line(false).ends_with("[Clean 4/5]"));
        Ok(())
    }

    #[test]
    fn test_latest_failed() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "latest_failed")?;
        let mut chain = test_chain(&format!("{}/vmbkp_vm.profile", testdir))?;

        let first = chain.create_new_generation(100)?;
        chain.set_succeeded(first, true);
        let second = chain.create_new_generation(200)?;

        // second is still running and counts as failed
        assert_eq!(chain.latest_generation_id()?, Some(second));
        assert_eq!(chain.latest_succeeded(), Some(first));
        assert!(chain.failed_generations().is_empty());

        let third = chain.create_new_generation(300)?;
        assert_eq!(chain.depending_generation_id(third), Some(first));
        assert_eq!(chain.failed_generations(), vec![second]);
        Ok(())
    }

    #[test]
    fn test_timestamp_index() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "timestamp_index")?;
        let mut chain = test_chain(&format!("{}/vmbkp_vm.profile", testdir))?;

        for ts in [100, 200, 300].iter() {
            let id = chain.create_new_generation(*ts)?;
            chain.set_succeeded(id, true);
        }

        // move generation 0 after generation 2
        chain.set_timestamp_ms(0, 400);
        assert_eq!(chain.generation_ids(), vec![1, 2, 0]);
        assert_eq!(chain.timestamp_ms(0), Some(400));
        assert_eq!(chain.prev_succeeded(0), Some(2));

        chain.del_generation(2);
        assert_eq!(chain.generation_ids(), vec![1, 0]);
        assert_eq!(chain.status(2), None);
        assert_eq!(chain.next_succeeded(1), Some(0));

        // ids are never reused
        assert_eq!(chain.create_new_generation(500)?, 3);
        Ok(())
    }

    #[test]
    fn test_old_generations() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "old_generations")?;
        let mut chain = test_chain(&format!("{}/vmbkp_vm.profile", testdir))?;

        for ts in 0..6 {
            let id = chain.create_new_generation(1000 + ts)?;
            chain.set_succeeded(id, true);
        }
        let old: Vec<GenerationId> = chain.old_generations(2).into_iter().collect();
        assert_eq!(old, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_dirty_and_broken() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "dirty")?;
        let path = format!("{}/vmbkp_vm.profile", testdir);

        std::fs::write(&path, "[meta]\n\tlatest = abc\n\tmoref = vm-1\n")?;
        let chain = GenerationChain::load(&path)?.unwrap();
        assert!(!chain.is_clean());
        assert!(chain.latest_generation_id().is_err());
        assert_eq!(chain.latest_succeeded(), None);

        let mut chain = chain;
        assert!(chain.create_new_generation(1).is_err());
        chain.set_clean(true);
        assert!(chain.is_clean());

        assert!(GenerationChain::create(&path, &VmInfo::new("x", "vm 1")).is_err());
        Ok(())
    }
}
