//! Optimistic concurrency control over per-worker metadata.
//!
//! Grounded on `persistence.rs`'s `Revision`/`MachineStore::save` pattern:
//! a caller reads the current version, computes a new value, and submits it
//! together with the version it was computed against. If another writer has
//! moved the version forward in the meantime, the write is rejected with
//! [`crate::error::OctopusError::Conflict`] instead of silently clobbering
//! the intervening change.
//!
//! Unlike `persistence.rs` (which persists to an external store and
//! round-trips through `async fn`), worker metadata lives entirely in
//! memory, so `perform` is synchronous; the pool retries the bounded number
//! of times the spec calls for rather than awaiting anything here.

use dashmap::DashMap;

use crate::error::OctopusError;

pub type WorkerId = u32;

/// Lifecycle state of a worker execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Crashed,
}

/// The record an [`OccHandler`] guards: a worker's lifecycle state plus the
/// version it was last written at.
#[derive(Debug, Clone)]
pub struct WorkerMetadata {
    pub id: WorkerId,
    pub state: WorkerState,
    pub version: u64,
}

impl WorkerMetadata {
    pub fn new(id: WorkerId) -> Self {
        WorkerMetadata { id, state: WorkerState::Idle, version: 0 }
    }
}

/// Version-checked read-modify-write over a table of [`WorkerMetadata`].
///
/// `DashMap` gives per-shard striping, which is the concrete realization of
/// "per-id striping" the optimistic concurrency design permits in place of a
/// single global lock.
pub struct OccHandler {
    table: DashMap<WorkerId, WorkerMetadata>,
}

impl OccHandler {
    pub fn new() -> Self {
        OccHandler { table: DashMap::new() }
    }

    pub fn insert(&self, metadata: WorkerMetadata) {
        self.table.insert(metadata.id, metadata);
    }

    pub fn remove(&self, id: WorkerId) {
        self.table.remove(&id);
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerMetadata> {
        self.table.get(&id).map(|r| r.clone())
    }

    /// Reads the record for `id`, checks it is still at `expected_version`,
    /// applies `op` to mutate it in place, and bumps the version. Returns
    /// whatever `op` returns on success.
    ///
    /// Fails with:
    /// - [`OctopusError::NotFound`] if `id` has no record.
    /// - [`OctopusError::Conflict`] if the record has moved past
    ///   `expected_version`.
    /// - whatever `op` returns, wrapped, if `op` itself fails.
    pub fn perform<R>(
        &self,
        id: WorkerId,
        expected_version: u64,
        op: impl FnOnce(&mut WorkerMetadata) -> Result<R, OctopusError>,
    ) -> Result<R, OctopusError> {
        let mut entry = self.table.get_mut(&id).ok_or(OctopusError::NotFound(id))?;
        if entry.version != expected_version {
            return Err(OctopusError::Conflict(id, expected_version));
        }
        let result = op(&mut entry)?;
        entry.version += 1;
        Ok(result)
    }
}

impl Default for OccHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perform_succeeds_and_bumps_version() {
        let occ = OccHandler::new();
        occ.insert(WorkerMetadata::new(1));
        let out = occ
            .perform(1, 0, |m| {
                m.state = WorkerState::Busy;
                Ok(())
            })
            .unwrap();
        assert_eq!(out, ());
        let meta = occ.get(1).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.state, WorkerState::Busy);
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let occ = OccHandler::new();
        occ.insert(WorkerMetadata::new(1));
        occ.perform(1, 0, |m| {
            m.state = WorkerState::Busy;
            Ok(())
        })
        .unwrap();

        let err = occ
            .perform(1, 0, |m| {
                m.state = WorkerState::Idle;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, OctopusError::Conflict(1, 0)));
        // The rejected write must not have touched the record.
        assert_eq!(occ.get(1).unwrap().state, WorkerState::Busy);
    }

    #[test]
    fn missing_worker_is_not_found() {
        let occ = OccHandler::new();
        let err = occ.perform(99, 0, |_| Ok(())).unwrap_err();
        assert!(matches!(err, OctopusError::NotFound(99)));
    }

    #[test]
    fn failing_op_does_not_bump_version() {
        let occ = OccHandler::new();
        occ.insert(WorkerMetadata::new(1));
        let err = occ.perform(1, 0, |_: &mut WorkerMetadata| Err(OctopusError::WrongType)).unwrap_err();
        assert!(matches!(err, OctopusError::WrongType));
        assert_eq!(occ.get(1).unwrap().version, 0);
    }
}
