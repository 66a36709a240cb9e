#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]

pub mod connection;
pub mod error;
pub mod listener;
pub mod options;
mod pool;

pub use connection::{AtomicConnState, ConnState, Connection, IdleDeadline};
pub use error::{PoolError, Result};
pub use listener::{NoopListener, PoolListener};
pub use options::{HostDistance, PerDistance, PoolOptions};
pub use pool::{
    Clock, ConnectionFactory, FakeClock, Pool, PoolFuture, PoolMetrics, PooledConnection,
    SystemClock,
};
