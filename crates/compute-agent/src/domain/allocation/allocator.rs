use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tracing::error;
use tracing::info;
use tracing::warn;

use super::store::AllocationStore;
use super::table::AllocationState;
use super::table::AllocationTable;
use super::table::DeviceHandle;
use super::AllocationError;

/// Thread-safe allocator over one device pool with a durable table.
///
/// Every mutation takes the pool, updates the table and persists it while holding
/// one lock, so concurrent spawns never observe a half-applied assignment.
pub struct DeviceAllocator<H> {
    kind: &'static str,
    state: Mutex<AllocationState<H>>,
    store: AllocationStore,
    free: AtomicUsize,
}

impl<H: DeviceHandle> DeviceAllocator<H> {
    /// Load the persisted table and reconcile it against the live instances.
    ///
    /// The reconciled table is written back immediately.
    pub fn open(
        kind: &'static str,
        pool: Vec<H>,
        store: AllocationStore,
        live_instance_ids: &HashSet<String>,
    ) -> Self {
        let persisted = store.load::<H>();
        let (state, report) = AllocationState::reconcile(pool, persisted, live_instance_ids);

        info!(
            target: "allocation",
            kind,
            kept = report.kept.len(),
            dropped = report.dropped.len(),
            orphaned_handles = report.orphaned_handles,
            free = state.free_count(),
            "reconciled allocation table"
        );

        let allocator = Self {
            kind,
            free: AtomicUsize::new(state.free_count()),
            state: Mutex::new(state),
            store,
        };
        allocator.persist(allocator.lock().allocated());
        allocator
    }

    fn lock(&self) -> MutexGuard<'_, AllocationState<H>> {
        // `take` and `release` mutate only after every check passes.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, table: &AllocationTable<H>) {
        if let Err(report) = self.store.save(table) {
            error!(kind = self.kind, "failed to persist allocation table: {report:?}");
        }
    }

    /// Claim `count` handles for `instance_id`.
    ///
    /// `on_claim` runs with the claimed handles while the lock is held. If it fails,
    /// the handles go back to the pool and its error is returned.
    pub fn assign_with<F>(
        &self,
        instance_id: &str,
        count: usize,
        on_claim: F,
    ) -> Result<Vec<H>, AllocationError>
    where
        F: FnOnce(&[H]) -> Result<(), AllocationError>,
    {
        let mut state = self.lock();
        let handles = state.take(instance_id, count).inspect_err(|e| {
            warn!(
                target: "allocation",
                kind = self.kind,
                instance_id,
                requested = count,
                "allocation refused: {e}"
            );
        })?;

        if let Err(e) = on_claim(&handles) {
            state.release(instance_id);
            warn!(
                target: "allocation",
                kind = self.kind,
                instance_id,
                "rolled back allocation: {e}"
            );
            return Err(e);
        }

        if !handles.is_empty() {
            self.persist(state.allocated());
            info!(
                target: "allocation",
                kind = self.kind,
                instance_id,
                handles = ?handles,
                "assigned devices"
            );
        }
        self.free.store(state.free_count(), Ordering::Release);
        Ok(handles)
    }

    pub fn assign(&self, instance_id: &str, count: usize) -> Result<Vec<H>, AllocationError> {
        self.assign_with(instance_id, count, |_| Ok(()))
    }

    /// Return an instance's handles to the pool. Releasing twice is a no-op.
    pub fn release(&self, instance_id: &str) -> Vec<H> {
        let mut state = self.lock();
        let Some(handles) = state.release(instance_id) else {
            return Vec::new();
        };
        self.persist(state.allocated());
        self.free.store(state.free_count(), Ordering::Release);
        info!(
            target: "allocation",
            kind = self.kind,
            instance_id,
            handles = ?handles,
            "released devices"
        );
        handles
    }

    /// Free handles, read without taking the lock.
    pub fn free_count(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    pub fn handles_for(&self, instance_id: &str) -> Vec<H> {
        self.lock()
            .handles_for(instance_id)
            .map(<[H]>::to_vec)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> AllocationState<H> {
        self.lock().clone()
    }
}
