use crate::event::Event;

/// All failures surfaced by the runtime.
///
/// Transport and recv failures are published on the endpoint error
/// stream without killing the endpoint; per-channel terminal failures
/// land on the channel's error queue and close it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Malformed wire message, on encode or decode.
    #[error("codec error: {0}")]
    Codec(String),
    /// Underlying socket failure (connect, bind, send, recv).
    #[error("transport error: {0}")]
    Transport(String),
    /// Send attempted on a closed channel.
    #[error("closed channel")]
    ClosedChannel,
    #[error("duplicate handler for task {0}")]
    DuplicateHandler(String),
    #[error("no handler for task {0}")]
    NoTaskHandler(String),
    /// Heartbeat deadline exceeded, the peer is presumed dead.
    #[error("lost remote")]
    LostRemote,
    /// The peer replied with an `ERR` event. `name` is the first element
    /// of the error triple; `event` keeps the full
    /// `[name, text, traceback]` for inspection.
    #[error("remote exception: {name}")]
    Remote { name: String, event: Event },
    /// Router-mode send with no peer identity to route to.
    #[error("no peer identity to route to")]
    Routing,
    /// Free-form error text from a task handler; sent to the peer as the
    /// first element of the `ERR` triple.
    #[error("{0}")]
    Text(String),
}

impl From<zeromq::ZmqError> for RpcError {
    fn from(e: zeromq::ZmqError) -> Self {
        RpcError::Transport(e.to_string())
    }
}
