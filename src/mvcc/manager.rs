//! Transaction manager: hands out TxIds and CSNs, tracks active snapshots.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::mvcc::{Csn, TxId};

/// The read point of a transaction, fixed at begin.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Snapshot {
    /// Identifier of the transaction.
    pub tx_id: TxId,
    /// Commit sequence number the transaction reads at.
    pub csn: Csn,
}

#[derive(Debug)]
struct ManagerState {
    next_tx_id: TxId,
    next_csn: Csn,
    last_committed_csn: Csn,
    active: BTreeMap<TxId, Csn>,
}

/// Issues monotonic TxIds and CSNs and tracks which snapshots are live.
#[derive(Debug)]
pub struct TxManager {
    state: Mutex<ManagerState>,
}

impl TxManager {
    /// Manager resuming after `last_tx_id` and `last_csn`.
    pub fn new(last_tx_id: TxId, last_csn: Csn) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                next_tx_id: last_tx_id + 1,
                next_csn: last_csn + 1,
                last_committed_csn: last_csn,
                active: BTreeMap::new(),
            }),
        }
    }

    /// Starts a transaction: fresh TxId, snapshot at the last committed CSN.
    pub fn begin(&self) -> Snapshot {
        let mut state = self.state.lock();
        let tx_id = state.next_tx_id;
        state.next_tx_id += 1;
        let csn = state.last_committed_csn;
        state.active.insert(tx_id, csn);
        Snapshot { tx_id, csn }
    }

    /// Allocates the commit CSN for a transaction entering its install
    /// phase. New snapshots do not observe it until
    /// [`publish_commit`](Self::publish_commit).
    pub fn allocate_commit_csn(&self) -> Csn {
        let mut state = self.state.lock();
        let csn = state.next_csn;
        state.next_csn += 1;
        csn
    }

    /// Publishes a committed CSN: snapshots taken from now on read at it.
    /// Called after the version install so no snapshot claims a commit whose
    /// versions are not yet visible.
    pub fn publish_commit(&self, csn: Csn) {
        let mut state = self.state.lock();
        if csn > state.last_committed_csn {
            state.last_committed_csn = csn;
        }
    }

    /// Drops a transaction from the active set (commit or rollback).
    pub fn finish(&self, tx_id: TxId) {
        self.state.lock().active.remove(&tx_id);
    }

    /// Smallest CSN any live snapshot reads at; the GC horizon.
    pub fn oldest_active_snapshot_csn(&self) -> Csn {
        let state = self.state.lock();
        state
            .active
            .values()
            .copied()
            .min()
            .unwrap_or(state.last_committed_csn)
    }

    /// Number of transactions currently open.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// CSN of the most recent commit.
    pub fn last_committed_csn(&self) -> Csn {
        self.state.lock().last_committed_csn
    }

    /// Highest TxId handed out so far; persisted at clean shutdown.
    pub fn highest_tx_id(&self) -> TxId {
        self.state.lock().next_tx_id - 1
    }
}
