//! Status lines and archive listing.

use std::str::FromStr;

use anyhow::{bail, format_err, Error};

use vmbkp_config::DRY_RUN_LOCK_TIMEOUT;
use vmbkp_datastore::{archive_state, ArchiveManager, ArchiveState};
use vmbkp_tools::lock::LockError;

use crate::ArchiveRoot;

pub const NO_ARCHIVE_MARK: &str = "##########_NO_ARCHIVE_##########";
pub const ERROR_MARK: &str = "##########_ERROR_##########";
pub const LOCKED_MARK: &str = "##########_LOCKED_##########";

const MS_PER_MINUTE: i64 = 60 * 1000;
const MS_PER_DAY: i64 = 24 * 60 * MS_PER_MINUTE;

fn header(root: &ArchiveRoot, moref: &str) -> String {
    let name = root.index().name_by_moref(moref).unwrap_or("");
    if root.index().is_available(moref) {
        format!("[{}][{}]", moref, name)
    } else {
        format!("[({})][{}]", moref, name)
    }
}

/// Status of one machine archive, with `detail` including one line per
/// generation.
///
/// A locked archive is reported instead of waiting for it.
pub fn status_line(root: &ArchiveRoot, moref: &str, detail: bool) -> String {
    let vm_directory = match root.vm_directory(moref) {
        Ok(dir) => dir,
        Err(err) => {
            log::warn!("{}", err);
            return format!("{} {}", header(root, moref), ERROR_MARK);
        }
    };
    if archive_state(&vm_directory) != ArchiveState::HasSucceeded {
        return format!("{} {}", header(root, moref), NO_ARCHIVE_MARK);
    }

    let _guard = match ArchiveManager::lock_vm(&vm_directory, DRY_RUN_LOCK_TIMEOUT) {
        Ok(guard) => guard,
        Err(LockError::TimeOut) => return format!("{} {}", header(root, moref), LOCKED_MARK),
        Err(err) => {
            log::warn!("unable to lock archive of {} - {}", moref, err);
            return format!("{} {}", header(root, moref), ERROR_MARK);
        }
    };

    match ArchiveManager::open_existing(&vm_directory) {
        Ok(Some(manager)) => manager.status_text(root.index().is_available(moref), detail),
        Ok(None) => format!("{} {}", header(root, moref), NO_ARCHIVE_MARK),
        Err(err) => {
            log::warn!("unable to open archive of {} - {}", moref, err);
            format!("{} {}", header(root, moref), ERROR_MARK)
        }
    }
}

/// Selection by archive presence.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExistFilter {
    /// Machines with at least one succeeded generation.
    #[default]
    Yes,
    No,
    Both,
}

impl FromStr for ExistFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "yes" => Ok(ExistFilter::Yes),
            "no" => Ok(ExistFilter::No),
            "both" => Ok(ExistFilter::Both),
            _ => bail!("invalid exist filter '{}'", s),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeUnit {
    Days,
    Minutes,
}

impl TimeUnit {
    fn millis(&self) -> i64 {
        match self {
            TimeUnit::Days => MS_PER_DAY,
            TimeUnit::Minutes => MS_PER_MINUTE,
        }
    }

    /// Tolerance of an unsigned filter.
    fn margin(&self) -> i64 {
        match self {
            TimeUnit::Days => MS_PER_DAY / 2,
            TimeUnit::Minutes => MS_PER_MINUTE / 2,
        }
    }
}

/// `find -mtime`/`-mmin` like filter on the latest generation timestamp.
///
/// `+N` selects archives written after `now - N`, `-N` those written
/// before, a plain `N` those written around `now - N`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeFilter {
    sign: Option<char>,
    amount: i64,
    unit: TimeUnit,
}

impl TimeFilter {
    pub fn parse(s: &str, unit: TimeUnit) -> Result<Self, Error> {
        let (sign, digits) = match s.chars().next() {
            Some(c @ ('+' | '-')) => (Some(c), &s[1..]),
            _ => (None, s),
        };
        let amount = digits
            .parse::<i64>()
            .map_err(|err| format_err!("invalid time filter '{}' - {}", s, err))?;
        if amount < 0 {
            bail!("invalid time filter '{}'", s);
        }
        Ok(Self { sign, amount, unit })
    }

    pub fn matches(&self, timestamp_ms: i64, now_ms: i64) -> bool {
        let base = now_ms - self.amount * self.unit.millis();
        match self.sign {
            Some('+') => base < timestamp_ms,
            Some(_) => base > timestamp_ms,
            None => (timestamp_ms - base).abs() <= self.unit.margin(),
        }
    }
}

/// Filter `morefs` by archive presence and the age of their latest
/// generation.
pub fn list(
    root: &ArchiveRoot,
    morefs: &[String],
    exist: ExistFilter,
    time_filter: Option<&TimeFilter>,
    now_ms: i64,
) -> Result<Vec<String>, Error> {
    let mut list = Vec::new();
    for moref in morefs {
        let has_archive = archive_state(root.vm_directory(moref)?) == ArchiveState::HasSucceeded;
        let selected = match exist {
            ExistFilter::Yes => has_archive,
            ExistFilter::No => !has_archive,
            ExistFilter::Both => true,
        };
        if !selected {
            continue;
        }

        if let Some(filter) = time_filter {
            let timestamp_ms = match root.open_existing_archive(moref)? {
                Some(manager) => manager.latest_timestamp_ms(),
                None => None,
            };
            match timestamp_ms {
                Some(ts) if filter.matches(ts, now_ms) => (),
                _ => continue,
            }
        }
        list.push(moref.clone());
    }
    Ok(list)
}
