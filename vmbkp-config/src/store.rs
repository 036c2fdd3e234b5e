use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use crate::format::{self, to_auto_string};
use crate::parser::{parse_line, LineContext};
use crate::{ConfigError, Group};

/// Entries of a single group, sorted by key.
pub type EntryMap = BTreeMap<String, String>;

/// Reserved group holding in-memory state, never written to disk.
pub const TMP_GROUP_NAME: &str = "___tmp___";
const PATH_KEY: &str = "path_myself";

fn tmp_group() -> Group {
    Group::new(TMP_GROUP_NAME)
}

/// In-memory config file: a sorted map of groups to their entries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigStore {
    groups: BTreeMap<Group, EntryMap>,
}

enum ParseState {
    BeforeGroup,
    InsideGroup(Group),
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry, creating the group if needed.
    pub fn put<K: Into<String>, V: Into<String>>(&mut self, group: &Group, key: K, value: V) {
        self.groups
            .entry(group.clone())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn put_i64<K: Into<String>>(&mut self, group: &Group, key: K, value: i64) {
        self.put(group, key, format::format_i64(value));
    }

    pub fn put_bool<K: Into<String>>(&mut self, group: &Group, key: K, value: bool) {
        self.put(group, key, format::format_bool(value));
    }

    pub fn get(&self, group: &Group, key: &str) -> Option<&str> {
        self.groups
            .get(group)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    /// Integer value, `None` if missing or not convertible.
    pub fn get_i64(&self, group: &Group, key: &str) -> Option<i64> {
        self.get(group, key).and_then(format::parse_i64)
    }

    pub fn get_i32(&self, group: &Group, key: &str) -> Option<i32> {
        self.get(group, key).and_then(format::parse_i32)
    }

    /// Integer value with `-1` for missing or broken values.
    pub fn get_i64_or_minus_one(&self, group: &Group, key: &str) -> i64 {
        self.get_i64(group, key).unwrap_or(-1)
    }

    pub fn get_bool(&self, group: &Group, key: &str) -> Option<bool> {
        self.get(group, key).and_then(format::parse_bool)
    }

    /// Remove an entry, returns true if it existed.
    pub fn del(&mut self, group: &Group, key: &str) -> bool {
        match self.groups.get_mut(group) {
            Some(entries) => entries.remove(key).is_some(),
            None => false,
        }
    }

    /// Remove a whole group, returns true if it existed.
    pub fn del_group(&mut self, group: &Group) -> bool {
        self.groups.remove(group).is_some()
    }

    pub fn contains_group(&self, group: &Group) -> bool {
        self.groups.contains_key(group)
    }

    pub fn get_all(&self, group: &Group) -> Option<&EntryMap> {
        self.groups.get(group)
    }

    /// Replace all entries of a group, `None` removes the group.
    pub fn replace_all(&mut self, group: &Group, entries: Option<EntryMap>) -> Option<EntryMap> {
        match entries {
            Some(entries) => self.groups.insert(group.clone(), entries),
            None => self.groups.remove(group),
        }
    }

    /// Merge `other` into this store, entries of `other` win.
    pub fn merge(&mut self, other: &ConfigStore) {
        for (group, entries) in other.groups.iter() {
            let target = self.groups.entry(group.clone()).or_default();
            for (key, value) in entries.iter() {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// All groups in their sort order (without the reserved group).
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.keys().filter(|g| g.name() != TMP_GROUP_NAME)
    }

    /// Groups with the given name, e.g. all `[generation "N"]` sections.
    pub fn groups_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Group> + 'a {
        self.groups.keys().filter(move |g| g.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.groups().next().is_none()
    }

    /// Remember the backing file path.
    pub fn set_path<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.put(&tmp_group(), PATH_KEY, path);
    }

    pub fn path(&self) -> Result<PathBuf, ConfigError> {
        self.get(&tmp_group(), PATH_KEY)
            .map(PathBuf::from)
            .ok_or(ConfigError::PathNotSet)
    }

    /// Parse config text.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut store = Self::new();
        let mut state = ParseState::BeforeGroup;

        for (line_no, line) in raw.lines().enumerate() {
            let line_no = line_no + 1;
            let parse_error = || ConfigError::Parse {
                line: line_no,
                content: line.to_string(),
            };

            match parse_line(line) {
                Some(LineContext::Group(group)) => {
                    store.groups.entry(group.clone()).or_default();
                    state = ParseState::InsideGroup(group);
                }
                Some(LineContext::Entry(key, value)) => match state {
                    ParseState::InsideGroup(ref group) => store.put(group, key, value),
                    ParseState::BeforeGroup => return Err(parse_error()),
                },
                Some(LineContext::Comment(_)) | Some(LineContext::Empty) => {}
                None => return Err(parse_error()),
            }
        }

        Ok(store)
    }

    /// Serialize groups in order, entries tab-indented in key order.
    pub fn to_config_string(&self) -> Result<String, Error> {
        let mut raw = String::new();

        for group in self.groups() {
            group.check()?;
            raw += &group.to_string();
            raw += "\n";
            if let Some(entries) = self.groups.get(group) {
                for (key, value) in entries.iter() {
                    raw += "\t";
                    raw += &to_auto_string(key);
                    raw += " = ";
                    raw += &to_auto_string(value);
                    raw += "\n";
                }
            }
        }

        Ok(raw)
    }

    /// Read a config file, remembering its path.
    ///
    /// Fails with `ConfigError::NotRegularFile` if the path exists but is
    /// not a regular file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        match Self::read_optional(path)? {
            Some(store) => Ok(store),
            None => Err(format_err!("config file {:?} does not exist", path)),
        }
    }

    /// Like `read`, but returns `None` if the file does not exist.
    pub fn read_optional<P: AsRef<Path>>(path: P) -> Result<Option<Self>, Error> {
        let path = path.as_ref();

        match std::fs::metadata(path) {
            Ok(meta) if !meta.is_file() => {
                return Err(ConfigError::NotRegularFile(path.to_path_buf()).into());
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format_err!("unable to stat {:?} - {}", path, err)),
        }

        let raw = match proxmox_sys::fs::file_read_optional_string(path)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let mut store = Self::parse(&raw)
            .map_err(|err| Error::from(err).context(format!("parsing {:?} failed", path)))?;
        store.set_path(path);

        Ok(Some(store))
    }

    /// Write to the remembered path.
    pub fn write(&self) -> Result<(), Error> {
        let path = self.path()?;
        self.write_to(path)
    }

    /// Atomically write the config to `path`.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let raw = self.to_config_string()?;
        vmbkp_tools::fs::replace_file_synced(path, raw.as_bytes())
    }
}
