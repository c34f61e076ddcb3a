use std::sync::Arc;

use crate::transport::CollectiveBus;

/// Participant-local runtime context passed to every coupling component.
///
/// Bundles the intra-participant collective bus with run-wide switches so
/// that no component has to reach for process-global state. Cloning is cheap
/// (the bus is shared behind an `Arc`).
#[derive(Clone)]
pub struct CouplingContext {
    /// Collective operations across the ranks of this participant.
    pub bus: Arc<dyn CollectiveBus>,
    /// Serializes the two participants around every parallel data transfer
    /// with an ack ping on the master channel. Debugging aid only.
    pub sync_mode: bool,
}

impl CouplingContext {
    pub fn new(bus: Arc<dyn CollectiveBus>) -> Self {
        Self {
            bus,
            sync_mode: false,
        }
    }

    pub fn with_sync_mode(mut self, sync_mode: bool) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Context for a participant running on a single rank.
    pub fn single_rank() -> Self {
        Self::new(Arc::new(crate::transport::SingleRank))
    }
}

impl std::fmt::Debug for CouplingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouplingContext")
            .field("rank", &self.bus.rank())
            .field("size", &self.bus.size())
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}
