//! Per-host multiplexed connection pool.
//!
//! All mutable shared state lives behind atomics or the copy-on-write
//! [`connections::ConnSet`]; there is no global lock guarding the pool.
//! Every invariant (`open` stays within `[core, max]`, `totalInFlight`
//! tracks live requests, state transitions are one-way) is owned by exactly
//! one CAS loop rather than a shared mutex.

mod clock;
mod connections;
#[cfg(test)]
mod test;
mod waiter;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

pub use clock::{Clock, FakeClock, SystemClock};

use connections::{ConnSet, Managed};
use waiter::{deadline_from_timeout, WaiterPark};

use crate::connection::{ConnState, Connection, IdleDeadline};
use crate::error::{PoolError, Result};
use crate::listener::{NoopListener, PoolListener};
use crate::options::{HostDistance, PoolOptions};

/// A connection factory is the pool's only way of making new transport
/// connections. It is deliberately minimal: everything about handshakes,
/// authentication, and keyspace negotiation happens inside `connect` before
/// the connection is handed back, none of it is this crate's concern.
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        id: u32,
    ) -> std::result::Result<Arc<dyn Connection>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Invariant-bearing constants. Not configurable: they bound the
/// state machine itself rather than deployment-specific sizing.
const MAX_SIMULTANEOUS_CREATION: u32 = 1;
const MIN_AVAILABLE_STREAMS: u32 = 96;

/// A snapshot of the pool's counters, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    pub open: u32,
    pub trashed: u32,
    pub scheduled_for_creation: u32,
    pub total_in_flight: u32,
}

/// A connection checked out of the pool. The caller is obligated to return
/// it via [`Pool::return_connection`] exactly once; if it's dropped without
/// being returned (a caller bug), the `Drop` impl performs the check-in
/// anyway so a forgotten return can't leak a connection out of the pool
/// forever.
pub struct PooledConnection {
    managed: Managed,
    pool: Arc<PoolInner>,
    returned: bool,
}

impl PooledConnection {
    /// The underlying connection, for issuing requests on.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.managed.conn
    }

    /// The driver-assigned id of the underlying connection.
    pub fn id(&self) -> u32 {
        self.managed.id
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.returned {
            self.pool.clone().do_return(&self.managed);
        }
    }
}

/// A one-shot completion signal, used for [`Pool::init_future`] and
/// [`Pool::close_async`]. Cheap to clone and to poll; `wait` blocks the
/// calling thread until the underlying work finishes.
#[derive(Clone)]
pub struct PoolFuture {
    inner: Arc<FutureState>,
}

struct FutureState {
    lock: std::sync::Mutex<FutureOutcome>,
    condvar: std::sync::Condvar,
}

#[derive(Clone)]
enum FutureOutcome {
    Pending,
    Ready(std::result::Result<(), PoolError>),
}

impl PoolFuture {
    fn new() -> Self {
        Self {
            inner: Arc::new(FutureState {
                lock: std::sync::Mutex::new(FutureOutcome::Pending),
                condvar: std::sync::Condvar::new(),
            }),
        }
    }

    fn complete(&self, outcome: std::result::Result<(), PoolError>) {
        let mut guard = self.inner.lock.lock().unwrap();
        if matches!(*guard, FutureOutcome::Pending) {
            *guard = FutureOutcome::Ready(outcome);
            self.inner.condvar.notify_all();
        }
    }

    /// Block until the work this future represents has finished.
    pub fn wait(&self) -> std::result::Result<(), PoolError> {
        let mut guard = self.inner.lock.lock().unwrap();
        while matches!(*guard, FutureOutcome::Pending) {
            guard = self.inner.condvar.wait(guard).unwrap();
        }
        match &*guard {
            FutureOutcome::Ready(outcome) => match outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(clone_pool_error(e)),
            },
            FutureOutcome::Pending => unreachable!(),
        }
    }

    /// Non-blocking check for completion.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.inner.lock.lock().unwrap(), FutureOutcome::Pending)
    }
}

fn clone_pool_error(e: &PoolError) -> PoolError {
    match e {
        PoolError::Closed { address } => PoolError::Closed {
            address: address.clone(),
        },
        PoolError::Timeout { address } => PoolError::Timeout {
            address: address.clone(),
        },
        PoolError::Open { address, source } => PoolError::Open {
            address: address.clone(),
            source: Box::new(crate::error::StringError(source.to_string())),
        },
    }
}

/// A pool of multiplexed connections to a single host.
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    address: String,
    distance: HostDistance,
    options: PoolOptions,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<dyn PoolListener>,
    clock: Arc<dyn Clock>,

    connections: ConnSet,
    trash: ConnSet,

    open: AtomicU32,
    scheduled_for_creation: AtomicU32,
    total_in_flight: AtomicU32,
    max_total_in_flight: AtomicU32,
    next_id: AtomicU32,

    keyspace: std::sync::RwLock<String>,

    waiter: WaiterPark,
    close: OnceLock<PoolFuture>,
    init: OnceLock<PoolFuture>,
}

/// RAII guard that decrements `scheduled_for_creation` exactly once, no
/// matter which of `run_create_task`'s several return points is taken.
struct ScheduleGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ScheduleGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .scheduled_for_creation
            .fetch_sub(1, Ordering::SeqCst);
    }
}

enum ReserveOutcome {
    Reserved,
    Saturated,
}

impl Pool {
    /// Start a pool for `address` at the given [`HostDistance`], opening
    /// `core` connections in parallel. `pre_existing`, if supplied and
    /// successfully attached via [`Connection::set_pool`], counts as one of
    /// the initial connections.
    pub fn new(
        address: impl Into<String>,
        distance: HostDistance,
        options: PoolOptions,
        factory: Arc<dyn ConnectionFactory>,
        listener: Option<Arc<dyn PoolListener>>,
        pre_existing: Option<Arc<dyn Connection>>,
    ) -> Self {
        let address = address.into();
        let inner = Arc::new(PoolInner {
            address: address.clone(),
            distance,
            options,
            factory,
            listener: listener.unwrap_or_else(|| Arc::new(NoopListener)),
            clock: Arc::new(SystemClock::new()),
            connections: ConnSet::new(),
            trash: ConnSet::new(),
            open: AtomicU32::new(0),
            scheduled_for_creation: AtomicU32::new(0),
            total_in_flight: AtomicU32::new(0),
            max_total_in_flight: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
            keyspace: std::sync::RwLock::new(String::new()),
            waiter: WaiterPark::new(),
            close: OnceLock::new(),
            init: OnceLock::new(),
        });

        let pool = Self { inner };
        pool.inner.start_init(pre_existing);
        pool
    }

    /// Like [`Pool::new`], but with an injected [`Clock`] — used by tests
    /// that need to advance idle-timeout deadlines without sleeping.
    #[doc(hidden)]
    pub fn with_clock(
        address: impl Into<String>,
        distance: HostDistance,
        options: PoolOptions,
        factory: Arc<dyn ConnectionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let address = address.into();
        let inner = Arc::new(PoolInner {
            address: address.clone(),
            distance,
            options,
            factory,
            listener: Arc::new(NoopListener),
            clock,
            connections: ConnSet::new(),
            trash: ConnSet::new(),
            open: AtomicU32::new(0),
            scheduled_for_creation: AtomicU32::new(0),
            total_in_flight: AtomicU32::new(0),
            max_total_in_flight: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
            keyspace: std::sync::RwLock::new(String::new()),
            waiter: WaiterPark::new(),
            close: OnceLock::new(),
            init: OnceLock::new(),
        });
        let pool = Self { inner };
        pool.inner.start_init(None);
        pool
    }

    /// Completes once the initial `core` connections are ready, or fails if
    /// the aggregate initialization failed.
    pub fn init_future(&self) -> PoolFuture {
        self.inner
            .init
            .get()
            .cloned()
            .expect("start_init always installs this before Pool::new returns")
    }

    /// Checks out a connection: returns one with `in_flight` already
    /// incremented, or fails with [`PoolError::Timeout`] /
    /// [`PoolError::Closed`].
    pub fn borrow(&self, timeout: Option<Duration>) -> Result<PooledConnection> {
        self.inner.borrow(timeout)
    }

    /// Returns a previously borrowed connection. Always safe to
    /// call, including against an already-closed pool.
    pub fn return_connection(&self, mut conn: PooledConnection) {
        self.inner.do_return(&conn.managed);
        conn.returned = true;
    }

    /// Number of connections currently considered "serving".
    pub fn opened(&self) -> u32 {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Number of connections currently retired-but-resurrectable.
    pub fn trashed(&self) -> u32 {
        self.inner.trash.len() as u32
    }

    /// A combined snapshot of the pool's counters.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            open: self.inner.open.load(Ordering::SeqCst),
            trashed: self.inner.trash.len() as u32,
            scheduled_for_creation: self.inner.scheduled_for_creation.load(Ordering::SeqCst),
            total_in_flight: self.inner.total_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Updates the keyspace propagated to connections on their next borrow
    ///.
    pub fn set_keyspace(&self, keyspace: impl Into<String>) {
        *self.inner.keyspace.write().unwrap() = keyspace.into();
    }

    /// Best-effort top-up to `core` connections. Called by
    /// hosts-up notifications.
    pub fn ensure_core_connections(&self) {
        self.inner.ensure_core_connections();
    }

    /// Runs one pass of the periodic sizing tick: trash cleanup, shrink to
    /// observed load, then ensure-core. `now` is supplied by the
    /// caller so that tests can drive it deterministically.
    pub fn cleanup_idle_connections(&self) {
        self.inner.cleanup_trash();
        self.inner.shrink_if_below_capacity();
        self.inner.ensure_core_connections();
    }

    /// Replaces a connection that the transport layer has determined is
    /// defunct. Idempotent under concurrent invocation.
    pub fn replace_defunct_connection(&self, connection_id: u32) {
        self.inner.replace_defunct_connection(connection_id);
    }

    /// Idempotently begins shutting down the pool. Returns a
    /// future completed once every connection has closed.
    pub fn close_async(&self) -> PoolFuture {
        self.inner.close_async()
    }

    /// Whether [`Pool::close_async`] has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PoolInner {
    fn is_closing(&self) -> bool {
        self.close.get().is_some()
    }

    fn closed_err(&self) -> PoolError {
        PoolError::Closed {
            address: self.address.clone(),
        }
    }

    fn timeout_err(&self) -> PoolError {
        PoolError::Timeout {
            address: self.address.clone(),
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // ---- initialization ----------------------------------------------

    fn start_init(self: &Arc<Self>, pre_existing: Option<Arc<dyn Connection>>) {
        let future = PoolFuture::new();
        self.init
            .set(future.clone())
            .unwrap_or_else(|_| panic!("start_init called twice"));

        let core = self.options.core(self.distance);
        let mut seeded = Vec::new();

        if let Some(conn) = pre_existing {
            // A pre-existing connection only counts if it attaches cleanly;
            // an attach failure just means it's ignored, not a fatal init
            // error.
            let id = self.next_id();
            if conn.set_pool(Arc::as_ptr(self) as u64) {
                seeded.push(Managed { id, conn });
            }
        }

        let this = Arc::clone(self);
        std::thread::spawn(move || {
            let mut handles = Vec::new();
            let already_seeded = seeded.len() as u32;

            for managed in &seeded {
                this.open.fetch_add(1, Ordering::SeqCst);
                this.connections.push(managed.clone());
            }

            for _ in already_seeded..core {
                let pool = Arc::clone(&this);
                handles.push(std::thread::spawn(move || pool.open_one_for_init()));
            }

            let mut failure = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(managed)) => {
                        this.connections.push(managed);
                    }
                    Ok(Err(e)) => failure.get_or_insert(e),
                    Err(_) => failure.get_or_insert(PoolError::Open {
                        address: this.address.clone(),
                        source: Box::new(crate::error::StringError(
                            "connection-open thread panicked".into(),
                        )),
                    }),
                };
            }

            match failure {
                None => {
                    future.complete(Ok(()));
                }
                Some(err) => {
                    // Partial success is not a valid resting state: force
                    // close everything this init pass opened.
                    for managed in this.connections.drain().into_iter() {
                        managed.conn.close();
                        this.open.fetch_sub(1, Ordering::SeqCst);
                    }
                    future.complete(Err(err));
                }
            }
        });
    }

    fn open_one_for_init(self: Arc<Self>) -> Result<Managed> {
        self.open.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id();
        match self.factory.connect(id) {
            Ok(conn) => {
                conn.set_pool(Arc::as_ptr(&self) as u64);
                self.listener.on_connection_created(&self.address, id);
                Ok(Managed { id, conn })
            }
            Err(source) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Open {
                    address: self.address.clone(),
                    source,
                })
            }
        }
    }

    // ---- borrow & wait -------------------------------------------------

    fn borrow(self: &Arc<Self>, timeout: Option<Duration>) -> Result<PooledConnection> {
        if self.is_closing() {
            return Err(self.closed_err());
        }

        let deadline = deadline_from_timeout(timeout);

        if self.connections.len() == 0 {
            let core = self.options.core(self.distance);
            for _ in 0..core {
                self.submit_create_task_bypass();
            }
            return self.wait_for_connection(deadline);
        }

        match self.attempt_borrow_from_snapshot() {
            None => {
                if self.is_closing() {
                    return Err(self.closed_err());
                }
                self.wait_for_connection(deadline)
            }
            Some(candidate) => match self.try_reserve(&candidate) {
                ReserveOutcome::Reserved => Ok(self.finish_borrow(candidate)),
                ReserveOutcome::Saturated => self.wait_for_connection(deadline),
            },
        }
    }

    fn wait_for_connection(self: &Arc<Self>, deadline: Option<Instant>) -> Result<PooledConnection> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(self.timeout_err());
        }

        loop {
            match self.waiter.park_until(deadline) {
                waiter::Wake::DeadlineElapsed => return Err(self.timeout_err()),
                waiter::Wake::Rescan => {}
            }

            if self.is_closing() {
                return Err(self.closed_err());
            }

            if let Some(candidate) = self.attempt_borrow_from_snapshot() {
                if let ReserveOutcome::Reserved = self.try_reserve(&candidate) {
                    return Ok(self.finish_borrow(candidate));
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.timeout_err());
            }
        }
    }

    /// Least-busy selection over a stable snapshot:
    /// only `Open` connections are eligible, ties go to the first seen.
    fn attempt_borrow_from_snapshot(&self) -> Option<Managed> {
        let snapshot = self.connections.snapshot();
        let mut best: Option<&Managed> = None;
        let mut best_load = u32::MAX;

        for managed in snapshot.iter() {
            if managed.conn.state().load() != ConnState::Open {
                continue;
            }
            let load = managed.conn.in_flight().load(Ordering::SeqCst);
            if load < best_load {
                best = Some(managed);
                best_load = load;
            }
        }

        best.cloned()
    }

    /// CAS-reserve a stream slot on `candidate`. Retries on a lost CAS race
    /// against the same candidate; abandons (without trying another
    /// candidate) once it looks saturated.
    fn try_reserve(&self, candidate: &Managed) -> ReserveOutcome {
        loop {
            let current = candidate.conn.in_flight().load(Ordering::SeqCst);
            if current >= candidate.conn.max_available_streams() {
                return ReserveOutcome::Saturated;
            }
            if candidate
                .conn
                .in_flight()
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return ReserveOutcome::Reserved;
            }
        }
    }

    /// Completes a successful reservation: bookkeeping, growth trigger,
    /// keyspace propagation.
    fn finish_borrow(self: &Arc<Self>, candidate: Managed) -> PooledConnection {
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        bump_max(&self.max_total_in_flight, total);

        self.maybe_grow();

        let keyspace = self.keyspace.read().unwrap();
        if !keyspace.is_empty() {
            candidate.conn.set_keyspace(&keyspace);
        }
        drop(keyspace);

        PooledConnection {
            managed: candidate,
            pool: Arc::clone(self),
            returned: false,
        }
    }

    // ---- return --------------------------------------------------------

    fn do_return(self: &Arc<Self>, managed: &Managed) {
        managed.conn.in_flight().fetch_sub(1, Ordering::SeqCst);
        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.is_closing() {
            managed.conn.close();
            return;
        }

        if managed.conn.is_defunct() {
            // Defunct handling already ran (replace_defunct_connection).
            return;
        }

        if managed.conn.state().load() != ConnState::Trashed {
            if managed.conn.max_available_streams() < MIN_AVAILABLE_STREAMS {
                self.replace_leaking_connection(managed);
            } else {
                self.waiter.signal_one();
            }
        }
    }

    /// A connection whose stream-ID budget has leaked below the threshold
    /// is retired rather than reused.
    fn replace_leaking_connection(self: &Arc<Self>, managed: &Managed) {
        if !managed
            .conn
            .state()
            .compare_exchange(ConnState::Open, ConnState::Trashed)
        {
            // Lost the race (e.g. a concurrent shrink already trashed it).
            return;
        }

        self.open.fetch_sub(1, Ordering::SeqCst);
        self.submit_create_task_bypass();

        // Force immediate eligibility for the next trash cleanup tick
        // instead of waiting out the normal idle timeout.
        managed.conn.max_idle_time().set(IdleDeadline::EXPIRED);

        if let Some(removed) = self.connections.remove(managed.id) {
            self.trash.push(removed);
        }
        self.listener
            .on_connection_trashed(&self.address, managed.id);
    }

    // ---- elastic sizing ------------------------------------------------

    fn maybe_grow(self: &Arc<Self>) {
        let open = self.open.load(Ordering::SeqCst);
        let scheduled = self.scheduled_for_creation.load(Ordering::SeqCst);
        let max = self.options.max(self.distance);

        if open + scheduled >= max {
            return;
        }

        let connection_count = self.connections.len() as u32;
        let capacity = if connection_count == 0 {
            0
        } else {
            (connection_count - 1) * self.options.max_stream_per_connection
                + self.options.new_connection_threshold(self.distance)
        };

        if self.total_in_flight.load(Ordering::SeqCst) > capacity {
            self.maybe_spawn_new_connection();
        }
    }

    /// CAS-gates at `MAX_SIMULTANEOUS_CREATION` using the same counter the
    /// create task itself decrements on completion.
    fn maybe_spawn_new_connection(self: &Arc<Self>) {
        let mut current = self.scheduled_for_creation.load(Ordering::SeqCst);
        loop {
            if current >= MAX_SIMULTANEOUS_CREATION {
                return;
            }
            match self.scheduled_for_creation.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let this = Arc::clone(self);
        std::thread::spawn(move || this.run_create_task());
    }

    /// Submits a create task without the `MAX_SIMULTANEOUS_CREATION` gate:
    /// used by initialization and `ensureCoreConnections`.
    fn submit_create_task_bypass(self: &Arc<Self>) {
        self.scheduled_for_creation.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        std::thread::spawn(move || this.run_create_task());
    }

    /// `addConnectionIfUnderMaximum`. Assumes the caller already
    /// accounted for `scheduled_for_creation`; the [`ScheduleGuard`] below
    /// decrements it again on every return path.
    fn run_create_task(self: Arc<Self>) {
        let _schedule_guard = ScheduleGuard { inner: &*self };

        let max = self.options.max(self.distance);
        let mut current = self.open.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return;
            }
            match self.open.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.is_closing() {
            self.open.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let managed = match self.resurrect_from_trash() {
            Some(managed) => {
                managed
                    .conn
                    .state()
                    .compare_exchange(ConnState::Resurrecting, ConnState::Open);
                self.listener
                    .on_connection_resurrected(&self.address, managed.id);
                Ok(managed)
            }
            None => {
                let id = self.next_id();
                self.factory.connect(id).map(|conn| Managed { id, conn })
            }
        };

        match managed {
            Ok(managed) => {
                self.connections.push(managed.clone());

                if self.is_closing() {
                    self.connections.remove(managed.id);
                    managed.conn.close();
                    self.open.fetch_sub(1, Ordering::SeqCst);
                    return;
                }

                self.listener.on_connection_created(&self.address, managed.id);
                self.waiter.signal_one();
            }
            Err(source) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
                let err = PoolError::Open {
                    address: self.address.clone(),
                    source,
                };
                tracing::warn!(address = %self.address, error = %err, "connection open failed");
            }
        }
    }

    /// Prefers the most-recently-trashed healthy connection: largest
    /// `max_idle_time` still in the future, with enough stream budget left
    ///.
    fn resurrect_from_trash(self: &Arc<Self>) -> Option<Managed> {
        loop {
            let snapshot = self.trash.snapshot();
            let now = self.clock.now_millis();

            let candidate = snapshot
                .iter()
                .filter(|m| {
                    let deadline = m.conn.max_idle_time().get();
                    deadline > now && m.conn.max_available_streams() > MIN_AVAILABLE_STREAMS
                })
                .max_by_key(|m| m.conn.max_idle_time().get())
                .cloned();

            let candidate = candidate?;

            if candidate
                .conn
                .state()
                .compare_exchange(ConnState::Trashed, ConnState::Resurrecting)
            {
                self.trash.remove(candidate.id);
                return Some(candidate);
            }
            // Lost the race (e.g. cleanup just reaped it); retry selection.
        }
    }

    /// Best-effort top-up to `core`, bypassing the creation throttle.
    fn ensure_core_connections(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        let core = self.options.core(self.distance);
        let open = self.open.load(Ordering::SeqCst);
        for _ in open..core {
            self.submit_create_task_bypass();
        }
    }

    /// Reads-and-resets `max_total_in_flight`, computes the target
    /// connection count, and trashes the excess.
    fn shrink_if_below_capacity(self: &Arc<Self>) {
        let current_load = self.max_total_in_flight.swap(0, Ordering::SeqCst);
        let core = self.options.core(self.distance);
        let threshold = self.options.new_connection_threshold(self.distance);
        let per_conn = self.options.max_stream_per_connection;

        let mut needed = current_load / per_conn.max(1);
        if current_load % per_conn.max(1) > threshold {
            needed += 1;
        }
        let needed = needed.max(core);

        let open = self.open.load(Ordering::SeqCst);
        if open <= needed {
            return;
        }

        let excess = open - needed;
        let snapshot = self.connections.snapshot();
        let mut trashed = 0;
        for managed in snapshot.iter() {
            if trashed >= excess {
                break;
            }
            if managed.conn.state().load() == ConnState::Open && self.trash_connection(managed) {
                trashed += 1;
            }
        }
    }

    /// `trashConnection`. Refuses (and reverts) if trashing
    /// would push `open` below `core`.
    fn trash_connection(self: &Arc<Self>, managed: &Managed) -> bool {
        if !managed
            .conn
            .state()
            .compare_exchange(ConnState::Open, ConnState::Trashed)
        {
            return false;
        }

        let core = self.options.core(self.distance);
        let mut current = self.open.load(Ordering::SeqCst);
        loop {
            if current.saturating_sub(1) < core {
                managed
                    .conn
                    .state()
                    .compare_exchange(ConnState::Trashed, ConnState::Open);
                return false;
            }
            match self.open.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let deadline = self.clock.now_millis() + self.options.idle_timeout.as_millis() as i64;
        managed.conn.max_idle_time().set(deadline);

        if let Some(removed) = self.connections.remove(managed.id) {
            self.trash.push(removed);
        }
        self.listener
            .on_connection_trashed(&self.address, managed.id);
        true
    }

    /// `cleanupTrash`: closes everything past its idle
    /// deadline with no requests still in flight; connections still
    /// draining are retried on the next tick.
    fn cleanup_trash(self: &Arc<Self>) {
        let now = self.clock.now_millis();
        let snapshot = self.trash.snapshot();

        for managed in snapshot.iter() {
            if managed.conn.max_idle_time().get() >= now {
                continue;
            }
            if !managed
                .conn
                .state()
                .compare_exchange(ConnState::Trashed, ConnState::Gone)
            {
                continue;
            }

            if managed.conn.in_flight().load(Ordering::SeqCst) == 0 {
                self.trash.remove(managed.id);
                managed.conn.close();
                self.listener.on_connection_gone(&self.address, managed.id);
            } else {
                // Rare: a timed-out request never released its stream slot.
                // Revert to `Trashed` and try again next tick.
                managed
                    .conn
                    .state()
                    .compare_exchange(ConnState::Gone, ConnState::Trashed);
            }
        }
    }

    /// `replaceDefunctConnection`. Idempotent: a connection
    /// already past `Open` is left alone.
    fn replace_defunct_connection(self: &Arc<Self>, connection_id: u32) {
        let Some(managed) = self.connections.snapshot().iter().find(|m| m.id == connection_id).cloned() else {
            return;
        };

        if !managed
            .conn
            .state()
            .compare_exchange(ConnState::Open, ConnState::Gone)
        {
            return;
        }

        self.open.fetch_sub(1, Ordering::SeqCst);
        self.connections.remove(connection_id);
        self.submit_create_task_bypass();
        managed.conn.close();
        self.listener.on_connection_gone(&self.address, connection_id);
    }

    // ---- shutdown ------------------------------------------------------

    fn close_async(self: &Arc<Self>) -> PoolFuture {
        if let Some(existing) = self.close.get() {
            return existing.clone();
        }

        let future = PoolFuture::new();
        match self.close.set(future.clone()) {
            Ok(()) => {
                self.listener.on_pool_closing(&self.address);
                self.waiter.signal_all();

                let this = Arc::clone(self);
                let future_for_thread = future.clone();
                std::thread::spawn(move || {
                    for managed in this.connections.drain() {
                        managed.conn.close();
                        if managed
                            .conn
                            .state()
                            .compare_exchange(ConnState::Open, ConnState::Gone)
                        {
                            this.open.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    for managed in this.trash.drain() {
                        managed.conn.close();
                    }
                    future_for_thread.complete(Ok(()));
                });

                future
            }
            Err(_) => {
                // Lost the race installing it: use the winner's future.
                self.close.get().unwrap().clone()
            }
        }
    }
}

/// CAS-max update: only ever raises `cell`, never lowers it.
fn bump_max(cell: &AtomicU32, candidate: u32) {
    let mut current = cell.load(Ordering::SeqCst);
    while candidate > current {
        match cell.compare_exchange_weak(current, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}
