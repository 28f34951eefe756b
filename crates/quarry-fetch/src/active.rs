//! Active-set tracker: live operations awaiting completion.
//!
//! Exactly one entry exists per queued request from admission until
//! completion or cancellation; taking an entry transfers ownership to the
//! dispatch path, so nothing can be released twice.

use std::collections::HashMap;
use std::process::Child;

use quarry_fetch_core::driver::TransferId;
use quarry_fetch_core::reactor::WatchId;

use crate::response::ResponseHandler;

/// Live transfer bound into the driver.
pub(crate) struct TransferTicket {
    pub(crate) handler: ResponseHandler,
    pub(crate) target: String,
}

/// Live clone child bound into a child-exit watch.
pub(crate) struct CloneTicket {
    pub(crate) handler: ResponseHandler,
    pub(crate) child: Child,
}

/// Registry of everything that must be released exactly once.
#[derive(Default)]
pub(crate) struct ActiveSet {
    transfers: HashMap<TransferId, TransferTicket>,
    clones: HashMap<WatchId, CloneTicket>,
}

impl ActiveSet {
    pub(crate) fn insert_transfer(&mut self, id: TransferId, ticket: TransferTicket) {
        let previous = self.transfers.insert(id, ticket);
        debug_assert!(previous.is_none(), "transfer handle reused while live");
    }

    pub(crate) fn take_transfer(&mut self, id: TransferId) -> Option<TransferTicket> {
        self.transfers.remove(&id)
    }

    pub(crate) fn insert_clone(&mut self, watch: WatchId, ticket: CloneTicket) {
        let previous = self.clones.insert(watch, ticket);
        debug_assert!(previous.is_none(), "child watch reused while live");
    }

    pub(crate) fn take_clone(&mut self, watch: WatchId) -> Option<CloneTicket> {
        self.clones.remove(&watch)
    }

    pub(crate) fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.transfers.len() + self.clones.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.transfers.is_empty() && self.clones.is_empty()
    }

    /// Remove every entry for teardown.
    pub(crate) fn drain(
        &mut self,
    ) -> (Vec<(TransferId, TransferTicket)>, Vec<(WatchId, CloneTicket)>) {
        (
            self.transfers.drain().collect(),
            self.clones.drain().collect(),
        )
    }
}
