//! Machine index maintenance.

use std::path::PathBuf;

use anyhow::Error;

use vmbkp_config::LOCK_TIMEOUT;
use vmbkp_datastore::{InventoryEntry, MachineIndex};

/// Open the machine index, writing an empty one if it does not exist.
///
/// The index is reloaded under its lock afterwards, another process may
/// have written it in between.
pub fn open_machine_index<P: Into<PathBuf>>(path: P) -> Result<MachineIndex, Error> {
    let mut index = MachineIndex::open(path)?;
    if !index.handle().exists() {
        log::info!("{:?} not found, create it", index.handle().path());
        index.write()?;
    }

    let _guard = index.lock(LOCK_TIMEOUT)?;
    index.reload()?;
    Ok(index)
}

/// Replace the availability information with the machines seen now.
pub fn update_inventory(
    index: &mut MachineIndex,
    seen: &[InventoryEntry],
    timestamp_ms: i64,
) -> Result<(), Error> {
    let _guard = index.lock(LOCK_TIMEOUT)?;
    index.reload()?;
    index.refresh(seen, timestamp_ms)?;
    index.write()?;

    log::info!("inventory updated, {} machines available", seen.len());
    Ok(())
}
