use thiserror::Error;

/// Errors surfaced by the framework.
///
/// Transport failures on a live connection are not reported through this
/// type; they close the connection and the owner only observes
/// `SessionHandler::on_closed` (closure is the uniform failure signal).
#[derive(Debug, Error)]
pub enum Error {
    /// The session ID range is spent and the recycle pool is below its
    /// refill threshold. Fatal to the connect/accept attempt that hit it.
    #[error("session id space exhausted")]
    IdExhausted,

    /// A message payload exceeds what the framing can represent on the wire.
    #[error("payload of {size} bytes exceeds framing limit of {max} bytes")]
    OversizedPayload { size: usize, max: usize },

    /// A framing decode consumed a different byte count than it was handed.
    /// Continuing would desynchronize the stream, so this is fatal to the
    /// connection.
    #[error("framing consumed {consumed} of {expected} bytes")]
    FrameDesync { consumed: usize, expected: usize },

    /// The target reactor is no longer accepting tasks.
    #[error("reactor stopped")]
    ReactorStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
