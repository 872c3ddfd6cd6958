use std::time::Duration;

/// Protocol version stamped into the `v` header of every event.
pub const PROTOCOL_VERSION: u64 = 3;

/// Cadence of the per-channel liveness check.
pub(crate) const LIVENESS_TICK: Duration = Duration::from_secs(1);

/// Endpoint tuning knobs.
///
/// A peer that stays silent for more than `2 * heartbeat_freq` is
/// declared lost and the channel fails with
/// [`RpcError::LostRemote`](crate::RpcError::LostRemote).
#[derive(Clone)]
pub struct Config {
    /// Heartbeat emission interval, per channel. Default 5 seconds.
    pub heartbeat_freq: Duration,
    /// Capacity of a channel's inbound queue. Its free space is the
    /// credit granted to a streaming peer. Default 100.
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { heartbeat_freq: Duration::from_secs(5), buffer_size: 100 }
    }
}
