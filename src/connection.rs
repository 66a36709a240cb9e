//! The contract a transport-level connection must satisfy to be managed by
//! a [`Pool`](crate::Pool).
//!
//! Everything below the trait boundary — CQL wire framing, stream-ID
//! bookkeeping, the authentication handshake, keyspace negotiation — is the
//! transport's business. The pool only ever touches a connection through
//! this trait and the atomics it exposes.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// A connection's position in the life-cycle state machine.
///
/// Transitions are driven exclusively by CAS on [`ConnectionState`]; nothing
/// in this crate ever assigns a new state without going through
/// [`ConnectionState::compare_exchange`]. `Gone` is terminal: once a
/// connection observes itself there, `borrow` must never see it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Open = 0,
    Trashed = 1,
    Resurrecting = 2,
    Gone = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Open,
            1 => ConnState::Trashed,
            2 => ConnState::Resurrecting,
            3 => ConnState::Gone,
            _ => unreachable!("invalid ConnState byte {v}"),
        }
    }
}

/// An atomic cell holding a [`ConnState`], CAS-only by contract.
#[derive(Debug)]
pub struct AtomicConnState(AtomicU8);

impl AtomicConnState {
    pub fn new(initial: ConnState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Attempt the transition `current -> new`. Returns `true` if this call
    /// won the race.
    pub fn compare_exchange(&self, current: ConnState, new: ConnState) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// Wall-clock deadline after which a `Trashed` connection becomes eligible
/// for closing. Represented as millis-since-creation-of-the-pool-process so
/// it fits in an `AtomicU64`; `NEVER` and `ALREADY_EXPIRED` are sentinels
/// rather than `Option` so the hot paths (`trashConnection`,
/// `cleanupTrash`, resurrection selection) never need to branch on `None`.
#[derive(Debug)]
pub struct IdleDeadline(std::sync::atomic::AtomicI64);

impl IdleDeadline {
    pub const NEVER: i64 = i64::MAX;
    pub const EXPIRED: i64 = i64::MIN;

    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicI64::new(Self::NEVER))
    }

    pub fn set(&self, millis_from_epoch: i64) {
        self.0.store(millis_from_epoch, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for IdleDeadline {
    fn default() -> Self {
        Self::new()
    }
}

/// The pool's view of a connection. Implemented by the transport layer;
/// this crate never constructs one itself outside of tests.
///
/// Every method here is called concurrently from arbitrary threads; an
/// implementation must make all of it safe without the pool's help beyond
/// the CAS discipline documented on each method.
pub trait Connection: fmt::Debug + Send + Sync {
    /// The connection's position in the life-cycle state machine. The pool
    /// transitions this via CAS; the transport only ever reads it (besides
    /// the initial value at construction).
    fn state(&self) -> &AtomicConnState;

    /// Count of requests accepted by this connection that haven't completed
    /// yet. CAS-incremented by `borrow`, CAS-decremented by `return`.
    fn in_flight(&self) -> &AtomicU32;

    /// Remaining stream-ID budget. Monotonically non-increasing as IDs leak
    /// — the transport is responsible for that monotonicity, the
    /// pool only ever reads this value.
    fn max_available_streams(&self) -> u32;

    /// Wall-clock deadline after which a `Trashed` connection may be closed.
    /// Owned storage the pool writes to via [`IdleDeadline::set`] and reads
    /// via [`IdleDeadline::get`]; millis are relative to an arbitrary but
    /// fixed epoch shared by the whole pool (see [`crate::pool::Clock`]).
    fn max_idle_time(&self) -> &IdleDeadline;

    /// `true` once the transport is permanently unusable. The transport is
    /// responsible for flipping this (and its own internal refusal to
    /// accept further use) atomically with respect to any observer that
    /// might reach [`crate::Pool::return_connection`] concurrently, since
    /// `return` trusts this flag without re-checking the transport itself.
    fn is_defunct(&self) -> bool;

    /// Begin closing the connection. Must be safe to call more than once;
    /// implementations that aren't naturally idempotent should guard with
    /// their own flag.
    fn close(&self);

    /// Attempt to attach this connection to `pool_id`. Returns `false` (and
    /// leaves the connection untouched) if it's already attached to a
    /// different pool. Used only for a caller-supplied pre-existing
    /// connection handed to [`crate::Pool::new`].
    fn set_pool(&self, pool_id: u64) -> bool;

    /// Most recently requested logical namespace propagated to this
    /// connection. The pool calls this just before handing the connection
    /// back to a borrower; cheap when already correct.
    fn set_keyspace(&self, keyspace: &str);
}
