//! Who this node believes the coordinator is.

use std::sync::Arc;

use tokio::sync::watch;

use crate::message::NodeId;

/// Single holder of `coordinator_id`, with `is_coordinator` derived from it.
///
/// Backed by a `watch` channel: every read sees a whole value, every write
/// replaces it atomically, and subscribers observe coordinator changes.
#[derive(Clone)]
pub struct CoordinatorState {
    local_id: NodeId,
    current: Arc<watch::Sender<Option<NodeId>>>,
}

impl CoordinatorState {
    pub fn new(local_id: NodeId) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            local_id,
            current: Arc::new(current),
        }
    }

    pub fn current(&self) -> Option<NodeId> {
        *self.current.borrow()
    }

    pub fn is_coordinator(&self) -> bool {
        self.current() == Some(self.local_id)
    }

    /// Records `id` as coordinator and returns the previous value.
    pub fn set(&self, id: NodeId) -> Option<NodeId> {
        self.current.send_replace(Some(id))
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<NodeId>> {
        self.current.subscribe()
    }
}
