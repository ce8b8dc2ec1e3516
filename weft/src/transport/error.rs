use thiserror::Error;

/// Errors that can occur posting through a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel was terminated or its receiving worker is gone
    #[error("transport channel is closed")]
    Closed,
}
