//! Pool configuration.

use std::time::Duration;

use typed_builder::TypedBuilder;

/// Classification of a host relative to the client, used to pick which row
/// of the per-distance sizing tables in [`PoolOptions`] applies. A pool is
/// built once per host by a host-discovery layer, which decides the
/// distance; this crate never computes it itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
}

/// A tiny fixed-size table indexed by [`HostDistance`]. Deliberately not a
/// `HashMap`: there are exactly two distances a pool is ever built for, so a
/// lookup that can fail at runtime would be the wrong tool.
#[derive(Debug, Clone, Copy)]
pub struct PerDistance<T> {
    pub local: T,
    pub remote: T,
}

impl<T: Copy> PerDistance<T> {
    pub fn get(&self, distance: HostDistance) -> T {
        match distance {
            HostDistance::Local => self.local,
            HostDistance::Remote => self.remote,
        }
    }

    pub fn uniform(value: T) -> Self {
        Self {
            local: value,
            remote: value,
        }
    }
}

/// Configuration for a single host's [`crate::Pool`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct PoolOptions {
    /// Lower bound on the number of serving connections, except during
    /// shutdown or while a failed aggregate init is unwinding.
    #[builder(default = PerDistance::uniform(1))]
    pub core: PerDistance<u32>,

    /// Upper bound on the number of serving connections.
    #[builder(default = PerDistance::uniform(8))]
    pub max: PerDistance<u32>,

    /// Growth-trigger watermark on the last connection.
    #[builder(default = PerDistance::uniform(128))]
    pub new_connection_threshold: PerDistance<u32>,

    /// Delay after which a `Trashed` connection becomes eligible to be
    /// closed.
    #[builder(default = Duration::from_secs(120))]
    pub idle_timeout: Duration,

    /// The externally-defined per-protocol-version stream-ID space
    /// (`MAX_STREAM_PER_CONNECTION`). Configurable because it varies by
    /// wire-protocol version across deployments.
    #[builder(default = 32768)]
    pub max_stream_per_connection: u32,
}

impl PoolOptions {
    pub(crate) fn core(&self, distance: HostDistance) -> u32 {
        self.core.get(distance)
    }

    pub(crate) fn max(&self, distance: HostDistance) -> u32 {
        self.max.get(distance)
    }

    pub(crate) fn new_connection_threshold(&self, distance: HostDistance) -> u32 {
        self.new_connection_threshold.get(distance)
    }
}
