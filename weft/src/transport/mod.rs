mod channel;

pub mod error;
pub use error::TransportError;

pub use channel::ChannelTransport;

use crate::router::Envelope;
use crate::worker::TaskSender;

/// The bidirectional message channel a router speaks to one peer over.
///
/// Implementations deliver posted envelopes into the receiving worker's
/// event queue once that side starts listening; envelopes posted earlier are
/// buffered in order.
pub trait Transport {
    /// Posts an envelope toward the peer; fire-and-forget
    fn post(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Attaches this side's receiving end: frames arriving from the peer are
    /// delivered as events tagged with `peer_name`
    fn start_listening(&self, peer_name: &str, sender: TaskSender);

    /// Forcibly severs the channel, when supported. Returns whether
    /// termination was performed.
    fn terminate(&self) -> bool {
        false
    }
}
