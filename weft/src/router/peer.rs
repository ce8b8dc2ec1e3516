use crate::transport::Transport;

use super::message::Envelope;

/// One registered peer worker
pub(crate) struct PeerRecord {
    pub transport: Box<dyn Transport>,
    /// Set when the peer's `ready` message arrives (or immediately for the
    /// parent channel of a spawned worker)
    pub ready: bool,
    /// Envelopes queued until the peer becomes ready, in send order
    pub outbox: Vec<Envelope>,
}

impl PeerRecord {
    pub fn new(transport: Box<dyn Transport>, ready: bool) -> Self {
        Self {
            transport,
            ready,
            outbox: Vec::new(),
        }
    }
}
