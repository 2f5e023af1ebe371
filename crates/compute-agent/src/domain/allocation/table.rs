//! Pool plus allocation table for one kind of device handle.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::AllocationError;

/// Something an allocator hands out: a PCI function, a GPU index, ...
pub trait DeviceHandle:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> DeviceHandle for T where
    T: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Instance id to owned handles.
pub type AllocationTable<H> = BTreeMap<String, Vec<H>>;

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries kept because their instance is live
    pub kept: Vec<String>,
    /// Entries dropped because their instance is gone
    pub dropped: Vec<String>,
    /// Handles removed from live entries because another entry or nothing in the pool owns them
    pub orphaned_handles: usize,
}

/// Available pool and allocation table.
///
/// Every known handle is in exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationState<H> {
    available: Vec<H>,
    allocated: AllocationTable<H>,
}

impl<H: DeviceHandle> AllocationState<H> {
    /// Fresh state with every handle available.
    pub fn new(pool: Vec<H>) -> Self {
        Self {
            available: pool,
            allocated: AllocationTable::new(),
        }
    }

    /// Align a persisted table with the instances the hypervisor reports as live.
    ///
    /// Entries of dead instances are dropped and their handles stay in the pool.
    /// Handles of live instances leave the pool. A handle that is not in the pool
    /// (claimed twice, or no longer configured) is removed from the entry instead.
    pub fn reconcile(
        pool: Vec<H>,
        persisted: AllocationTable<H>,
        live_instance_ids: &HashSet<String>,
    ) -> (Self, ReconcileReport) {
        let mut state = Self::new(pool);
        let mut report = ReconcileReport::default();

        for (instance_id, handles) in persisted {
            if !live_instance_ids.contains(&instance_id) {
                debug!(instance_id = %instance_id, handles = ?handles, "dropping stale allocation");
                report.dropped.push(instance_id);
                continue;
            }

            let mut owned = Vec::with_capacity(handles.len());
            for handle in handles {
                if state.remove_available(&handle) {
                    owned.push(handle);
                } else {
                    warn!(
                        instance_id = %instance_id,
                        handle = ?handle,
                        "allocated handle is not in the available pool, ignoring it"
                    );
                    report.orphaned_handles += 1;
                }
            }

            if !owned.is_empty() {
                state.allocated.insert(instance_id.clone(), owned);
                report.kept.push(instance_id);
            } else {
                report.dropped.push(instance_id);
            }
        }

        (state, report)
    }

    fn remove_available(&mut self, handle: &H) -> bool {
        match self.available.iter().position(|h| h == handle) {
            Some(pos) => {
                self.available.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Move `count` handles from the pool to `instance_id`.
    ///
    /// The most recently freed handles go first. Nothing changes on error.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::AlreadyAllocated`] if the instance already owns handles here
    /// - [`AllocationError::Overcommit`] if fewer than `count` handles are free
    pub fn take(&mut self, instance_id: &str, count: usize) -> Result<Vec<H>, AllocationError> {
        if self.allocated.contains_key(instance_id) {
            return Err(AllocationError::AlreadyAllocated {
                instance_id: instance_id.to_string(),
            });
        }
        if count > self.available.len() {
            return Err(AllocationError::Overcommit {
                requested: count,
                available: self.available.len(),
            });
        }

        let split_at = self.available.len() - count;
        let mut taken = self.available.split_off(split_at);
        taken.reverse();
        if !taken.is_empty() {
            self.allocated
                .insert(instance_id.to_string(), taken.clone());
        }
        Ok(taken)
    }

    /// Return an instance's handles to the pool. `None` if it owns nothing.
    pub fn release(&mut self, instance_id: &str) -> Option<Vec<H>> {
        let handles = self.allocated.remove(instance_id)?;
        self.available.extend(handles.iter().cloned());
        Some(handles)
    }

    pub fn available(&self) -> &[H] {
        &self.available
    }

    pub fn allocated(&self) -> &AllocationTable<H> {
        &self.allocated
    }

    pub fn handles_for(&self, instance_id: &str) -> Option<&[H]> {
        self.allocated.get(instance_id).map(Vec::as_slice)
    }

    pub fn free_count(&self) -> usize {
        self.available.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.values().map(Vec::len).sum()
    }

    pub fn total(&self) -> usize {
        self.free_count() + self.allocated_count()
    }
}
