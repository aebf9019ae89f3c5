//! Resource gates for the orchestrator (spec section 4.6/5): a disk
//! free-space floor checked before dispatching scratch-consuming stages,
//! and a memory accountant that blocks new dispatches once outstanding
//! budget exceeds `M_total`. Enforcement is by accounting semaphores, not
//! kernel controls, per spec section 5.

use crate::error::{CdxError, Result};
use std::path::Path;
use std::sync::{Condvar, Mutex};
use sysinfo::{Disks, System};

/// Checks free space at `path`'s filesystem against `floor_gb`. Returns
/// `Ok(())` if there is room, otherwise `Err(InsufficientScratch)` — the
/// orchestrator treats this as deferred-not-fatal and retries once the
/// disk gate opens (spec section 4.6).
pub fn check_disk_floor(path: &Path, floor_gb: u64, needed_bytes: u64) -> Result<()> {
    let floor_bytes = floor_gb * 1024 * 1024 * 1024;
    let available = available_space_bytes(path);
    if available < floor_bytes || available < needed_bytes {
        return Err(CdxError::InsufficientScratch {
            path: path.to_path_buf(),
            needed_bytes: needed_bytes.max(floor_bytes),
            available_bytes: available,
        });
    }
    Ok(())
}

fn available_space_bytes(path: &Path) -> u64 {
    let disks = Disks::new_with_refreshed_list();
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .unwrap_or(u64::MAX)
}

/// Total system memory, in MiB — used only to sanity-check a configured
/// `memory_budget_mb` against what the host actually has.
pub fn total_system_memory_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / (1024 * 1024)
}

/// Blocking semaphore-style accountant over a total MiB budget. Tasks
/// acquire their declared budget at start and release it on completion;
/// dispatch blocks (cooperatively, via a condvar) while the outstanding
/// total would exceed the budget.
pub struct MemoryAccountant {
    total_mb: u64,
    state: Mutex<u64>,
    cv: Condvar,
}

impl MemoryAccountant {
    pub fn new(total_mb: u64) -> Self {
        Self {
            total_mb,
            state: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Blocks until `requested_mb` is available, then reserves it. Errors
    /// immediately (does not block forever) if `requested_mb` alone
    /// exceeds the total budget — that request can never succeed.
    pub fn acquire(&self, requested_mb: u64) -> Result<MemoryLease<'_>> {
        if requested_mb > self.total_mb {
            return Err(CdxError::InsufficientMemory {
                requested_mb,
                total_mb: self.total_mb,
            });
        }
        let mut outstanding = self.state.lock().unwrap();
        while *outstanding + requested_mb > self.total_mb {
            outstanding = self.cv.wait(outstanding).unwrap();
        }
        *outstanding += requested_mb;
        Ok(MemoryLease {
            accountant: self,
            mb: requested_mb,
        })
    }

    fn release(&self, mb: u64) {
        let mut outstanding = self.state.lock().unwrap();
        *outstanding = outstanding.saturating_sub(mb);
        self.cv.notify_all();
    }

    pub fn outstanding_mb(&self) -> u64 {
        *self.state.lock().unwrap()
    }
}

/// RAII handle: releases its reservation back to the accountant on drop.
pub struct MemoryLease<'a> {
    accountant: &'a MemoryAccountant,
    mb: u64,
}

impl Drop for MemoryLease<'_> {
    fn drop(&mut self) {
        self.accountant.release(self.mb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn acquire_over_total_budget_errors_immediately() {
        let acct = MemoryAccountant::new(100);
        let result = acct.acquire(200);
        assert!(matches!(result, Err(CdxError::InsufficientMemory { .. })));
    }

    #[test]
    fn release_unblocks_a_waiting_acquire() {
        let acct = Arc::new(MemoryAccountant::new(100));
        let lease = acct.acquire(80).unwrap();
        assert_eq!(acct.outstanding_mb(), 80);

        let acct2 = Arc::clone(&acct);
        let handle = std::thread::spawn(move || {
            let _lease2 = acct2.acquire(50).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(lease);
        handle.join().unwrap();
        assert_eq!(acct.outstanding_mb(), 0);
    }

    #[test]
    fn disk_floor_rejects_when_available_is_reported_low() {
        // A floor far beyond any real disk's capacity should always be
        // reported as insufficient.
        let dir = tempfile::tempdir().unwrap();
        let result = check_disk_floor(dir.path(), u64::MAX / (1024 * 1024 * 1024), 1);
        assert!(result.is_err());
    }
}
