//! Engine error taxonomy. One variant per failure kind; stream-scoped
//! errors never escape the stream that produced them.

/// Errors surfaced by the link-local engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No presence is known for the target service name.
    #[error("peer unavailable: no presence known for '{0}'")]
    PeerUnavailable(String),

    /// No free port in the configured listen range.
    #[error("unable to bind a listening port in range {0}-{1}")]
    BindFailed(u16, u16),

    /// Registration or browse failure from the mDNS layer.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Socket-level read/write failure. Per-stream; recoverable by dialing again.
    #[error("stream i/o error: {0}")]
    StreamIo(#[from] std::io::Error),

    /// Malformed XML, wrong stream namespace, or a missing mandatory
    /// attribute on an inbound stream header.
    #[error("stream protocol error: {0}")]
    StreamProtocol(String),

    /// Inbound message from a service name with no known presence.
    #[error("message from unknown origin '{0}'")]
    UnknownOrigin(String),

    /// An IQ reply did not arrive within the configured window.
    #[error("timed out waiting for reply")]
    ReplyTimeout,

    /// The service has been closed.
    #[error("service closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
