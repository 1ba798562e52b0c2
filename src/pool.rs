//! Core session pool implementation

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionFactory, ConnectionId};
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{IdleSweeper, MaintenanceTask, take_expired};
use crate::handle::PooledHandle;
use crate::health::{HealthCheckPolicy, HealthStatus};
use crate::metrics::{MetricsExporter, PoolStats, StatsCounters};
use crate::waiter::{Delivery, WaitQueue};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A borrowed connection
///
/// Hand it back with [`ConnectionPool::release`]. A lease that is simply
/// dropped is returned to its pool as well; any close that return requires
/// is spawned on the current tokio runtime.
pub struct PooledConnection<C: Connection> {
    id: ConnectionId,
    conn: Arc<C>,
    pool: Arc<dyn CheckIn<C>>,
    returned: bool,
}

impl<C: Connection> PooledConnection<C> {
    fn new(id: ConnectionId, conn: Arc<C>, pool: Arc<dyn CheckIn<C>>) -> Self {
        Self {
            id,
            conn,
            pool,
            returned: false,
        }
    }

    /// Pool identity of the underlying connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<C: Connection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if !self.returned
            && let Some(conn) = self.pool.check_in(self.id, Arc::clone(&self.conn))
        {
            spawn_close(self.id, conn);
        }
    }
}

/// Return path used by leases, erasing the factory type
trait CheckIn<C>: Send + Sync {
    /// Take a connection back; returns it if the caller must close it
    fn check_in(&self, id: ConnectionId, conn: Arc<C>) -> Option<Arc<C>>;

    /// Forget a borrowed connection that is being closed elsewhere,
    /// freeing its slot; returns it unless shutdown already closed it
    fn discard(&self, id: ConnectionId, conn: Arc<C>) -> Option<Arc<C>>;
}

struct PoolState<C> {
    /// Top of the stack is the most recently returned handle
    idle: Vec<PooledHandle<C>>,
    active: HashMap<ConnectionId, PooledHandle<C>>,
    waiters: WaitQueue<C>,
    /// Creations in flight, counted against `max_active`
    pending_creates: usize,
    /// Connections closed by shutdown while still borrowed
    closed_on_shutdown: HashSet<ConnectionId>,
    closed: bool,
    counters: StatsCounters,
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    target: String,
    config: PoolConfig,
    health: HealthCheckPolicy,
    state: Mutex<PoolState<F::Conn>>,
}

/// Bounded pool of sessions to one remote target
///
/// # Examples
///
/// ```no_run
/// # use esox_sessionpool::{Connection, ConnectionFactory, ConnectionPool, PoolConfig, PoolResult};
/// # async fn run<F: ConnectionFactory>(factory: F) -> PoolResult<()> {
/// let pool = ConnectionPool::new(factory, PoolConfig::default())?;
///
/// let conn = pool.acquire().await?;
/// let output = conn.execute("uptime").await;
/// pool.release(conn).await;
///
/// pool.close().await?;
/// # let _ = output;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    maintenance: MaintenanceTask,
}

/// What an acquire attempt does once the lock is dropped
enum Step<C: Connection> {
    Ready(ConnectionId, Arc<C>),
    Probe(ProbeGuard<C>),
    Create(CreateSlot<C>),
    Wait(WaitGuard<C>),
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool bound to the factory's target
    ///
    /// Spawns the maintenance task, so it must be called from within a
    /// tokio runtime.
    pub fn new(factory: F, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;

        let target = factory.target();
        let shared = Arc::new(Shared {
            factory,
            target: target.clone(),
            health: HealthCheckPolicy::from_config(&config),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(config.max_idle),
                active: HashMap::new(),
                waiters: WaitQueue::new(),
                pending_creates: 0,
                closed_on_shutdown: HashSet::new(),
                closed: false,
                counters: StatsCounters::default(),
            }),
            config,
        });

        let maintenance = MaintenanceTask::spawn(
            Arc::downgrade(&shared),
            shared.config.maintenance_interval,
            CancellationToken::new(),
        );

        info!(
            target = %target,
            max_active = shared.config.max_active,
            max_idle = shared.config.max_idle,
            "session pool opened"
        );

        Ok(Self { shared, maintenance })
    }

    /// Borrow a connection, waiting up to `acquire_wait_timeout` for capacity
    pub async fn acquire(&self) -> PoolResult<PooledConnection<F::Conn>> {
        let shared = Arc::clone(&self.shared);
        shared.acquire().await
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`PoolError::AcquireCancelled`] as soon as `cancel` fires
    ///
    /// Work already done on the caller's behalf (a queued slot, a handed-off
    /// connection, a creation in flight) is given back to the pool.
    pub async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> PoolResult<PooledConnection<F::Conn>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.shared.state.lock().counters.acquire_cancellations += 1;
                debug!(target = %self.shared.target, "acquire cancelled");
                Err(PoolError::AcquireCancelled)
            }
            result = self.acquire() => result,
        }
    }

    /// Return a borrowed connection
    ///
    /// A lease issued by another pool is closed and its owner's slot freed.
    /// Connections that outlived a closed pool are not reused. Never waits
    /// for capacity.
    pub async fn release(&self, mut conn: PooledConnection<F::Conn>) {
        conn.returned = true;
        let owned = std::ptr::addr_eq(Arc::as_ptr(&conn.pool), Arc::as_ptr(&self.shared));
        let to_close = if owned {
            self.shared.check_in(conn.id, Arc::clone(&conn.conn))
        } else {
            debug!(connection_id = %conn.id, "closing connection released into another pool");
            conn.pool.discard(conn.id, Arc::clone(&conn.conn))
        };
        if let Some(to_close) = to_close {
            close_connection(conn.id, &*to_close).await;
        }
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Health summary derived from the current stats
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_stats(&self.stats())
    }

    /// Export stats as key/value strings
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.stats().export()
    }

    /// Export stats in Prometheus format
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        MetricsExporter::export_prometheus(&self.stats(), pool_name, tags)
    }

    /// Prometheus collector reading this pool's stats on every scrape
    #[cfg(feature = "prometheus")]
    pub fn stats_collector(&self, pool_name: &str) -> prometheus::Result<crate::metrics::StatsCollector> {
        let shared = Arc::downgrade(&self.shared);
        crate::metrics::StatsCollector::new(pool_name, move || {
            shared.upgrade().map(|s| s.stats()).unwrap_or_default()
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Shut the pool down
    ///
    /// Wakes every queued caller with [`PoolError::Closed`] and closes every
    /// idle and every borrowed connection. Borrowers still running commands
    /// will see them fail. Later acquires fail fast; later releases just
    /// drop their lease. Calling it again is a no-op.
    pub async fn close(&self) -> PoolResult<()> {
        self.maintenance.stop();

        let to_close = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            let now = Instant::now();
            for enqueued_at in state.waiters.close_all() {
                state.counters.record_wait(now.saturating_duration_since(enqueued_at));
            }

            let mut handles: Vec<PooledHandle<F::Conn>> = state.idle.drain(..).collect();
            let borrowed: Vec<_> = state.active.drain().map(|(_, handle)| handle).collect();
            for handle in &borrowed {
                state.closed_on_shutdown.insert(handle.id);
            }
            handles.extend(borrowed);
            state.counters.record_closed(handles.len());
            handles
        };

        info!(
            target = %self.shared.target,
            connections = to_close.len(),
            "closing session pool"
        );

        let mut failed = 0;
        for handle in to_close {
            if let Err(e) = handle.conn.close().await {
                warn!(connection_id = %handle.id, error = %e, "failed to close connection");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(PoolError::CloseFailed { failed });
        }
        Ok(())
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        self.maintenance.stop();
    }
}

impl<F: ConnectionFactory> Shared<F> {
    fn has_capacity(&self, state: &PoolState<F::Conn>) -> bool {
        self.config.is_unbounded()
            || state.active.len() + state.pending_creates < self.config.max_active
    }

    async fn acquire(self: Arc<Self>) -> PoolResult<PooledConnection<F::Conn>> {
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }

                let now = Instant::now();
                if let Some(mut handle) = state.idle.pop() {
                    // LIFO: the warmest connection goes out first
                    let needs_check = self.health.needs_check(handle.last_health_checked_at, now);
                    handle.mark_borrowed(now);
                    let id = handle.id;
                    let conn = Arc::clone(&handle.conn);
                    state.active.insert(id, handle);

                    if needs_check {
                        Step::Probe(ProbeGuard::new(self.clone().into_check_in(), id, conn))
                    } else {
                        state.counters.total_acquired += 1;
                        Step::Ready(id, conn)
                    }
                } else if self.has_capacity(&state) {
                    state.pending_creates += 1;
                    Step::Create(CreateSlot::new(self.clone().into_capacity()))
                } else {
                    let (waiter_id, rx) = state.waiters.push(now);
                    debug!(target = %self.target, waiting = state.waiters.len(), "pool saturated, queueing");
                    Step::Wait(WaitGuard::new(self.clone().into_capacity(), waiter_id, rx))
                }
            };

            match step {
                Step::Ready(id, conn) => {
                    debug!(connection_id = %id, "reusing idle connection");
                    return Ok(self.lease(id, conn));
                }
                Step::Probe(guard) => {
                    if let Some(lease) = self.probe(guard).await? {
                        return Ok(lease);
                    }
                }
                Step::Create(slot) => return self.create(slot).await,
                Step::Wait(guard) => match self.wait(guard).await? {
                    Delivery::Connection { id, conn } => return self.claim_handoff(id, conn),
                    Delivery::Capacity => {
                        let slot = CreateSlot::new(self.clone().into_capacity());
                        return self.create(slot).await;
                    }
                    Delivery::Closed => return Err(PoolError::Closed),
                },
            }
        }
    }

    /// Health check a popped idle connection outside the lock
    ///
    /// `Ok(None)` means it was unhealthy and has been discarded.
    async fn probe(
        self: &Arc<Self>,
        mut guard: ProbeGuard<F::Conn>,
    ) -> PoolResult<Option<PooledConnection<F::Conn>>> {
        let healthy = self.health.probe(&*guard.conn).await;
        let (id, conn) = guard.disarm();

        {
            let mut state = self.state.lock();
            if state.closed {
                // Shutdown already closed it while it sat in active
                state.closed_on_shutdown.remove(&id);
                return Err(PoolError::Closed);
            }

            if healthy {
                if let Some(handle) = state.active.get_mut(&id) {
                    handle.mark_health_checked(Instant::now());
                }
                state.counters.total_acquired += 1;
            } else {
                state.active.remove(&id);
                state.counters.health_check_failures += 1;
                state.counters.record_closed(1);
                self.grant_capacity(&mut state);
            }
        }

        if healthy {
            debug!(connection_id = %id, "reusing idle connection after health check");
            return Ok(Some(self.lease(id, conn)));
        }

        warn!(target = %self.target, connection_id = %id, "discarding unhealthy connection");
        close_connection(id, &*conn).await;
        Ok(None)
    }

    /// Establish a new connection in a reserved creation slot
    async fn create(
        self: &Arc<Self>,
        mut slot: CreateSlot<F::Conn>,
    ) -> PoolResult<PooledConnection<F::Conn>> {
        let result = self.factory.connect().await;
        slot.disarm();

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.pending_creates -= 1;
                    state.counters.create_failures += 1;
                    self.grant_capacity(&mut state);
                }
                warn!(target = %self.target, error = %e, "failed to create connection");
                return Err(PoolError::ConnectionCreateFailed(e));
            }
        };

        let handle = PooledHandle::new_borrowed(conn, Instant::now());
        let (id, conn) = (handle.id, Arc::clone(&handle.conn));

        let registered = {
            let mut state = self.state.lock();
            state.pending_creates -= 1;
            state.counters.total_created += 1;
            if state.closed {
                state.counters.record_closed(1);
                None
            } else {
                state.active.insert(id, handle);
                state.counters.total_acquired += 1;
                Some(state.active.len())
            }
        };

        let Some(active) = registered else {
            close_connection(id, &*conn).await;
            return Err(PoolError::Closed);
        };

        debug!(target = %self.target, connection_id = %id, active, "created connection");
        Ok(self.lease(id, conn))
    }

    /// Park until a handoff, a capacity grant, shutdown, or the wait timeout
    async fn wait(&self, mut guard: WaitGuard<F::Conn>) -> PoolResult<Delivery<F::Conn>> {
        let timeout = self.config.acquire_wait_timeout;
        match tokio::time::timeout(timeout, &mut guard.rx).await {
            Ok(Ok(delivery)) => {
                guard.armed = false;
                Ok(delivery)
            }
            // Sender dropped without a delivery
            Ok(Err(_)) => {
                guard.armed = false;
                Err(PoolError::Closed)
            }
            Err(_) => {
                if let Some((id, conn)) = guard.abandon(true) {
                    close_connection(id, &*conn).await;
                }
                debug!(target = %self.target, ?timeout, "acquire timed out");
                Err(PoolError::AcquireTimeout(timeout))
            }
        }
    }

    /// Turn a handed-off connection into a lease, unless shutdown got there first
    fn claim_handoff(
        self: &Arc<Self>,
        id: ConnectionId,
        conn: Arc<F::Conn>,
    ) -> PoolResult<PooledConnection<F::Conn>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                state.closed_on_shutdown.remove(&id);
                return Err(PoolError::Closed);
            }
            state.counters.total_acquired += 1;
        }
        debug!(connection_id = %id, "received connection from handoff");
        Ok(self.lease(id, conn))
    }

    /// Give the oldest waiters the capacity that just freed up
    fn grant_capacity(&self, state: &mut PoolState<F::Conn>) {
        while !state.waiters.is_empty() && self.has_capacity(state) {
            state.pending_creates += 1;
            match state.waiters.deliver(|| Delivery::Capacity) {
                Some(enqueued_at) => {
                    let waited = Instant::now().saturating_duration_since(enqueued_at);
                    state.counters.record_wait(waited);
                }
                None => {
                    state.pending_creates -= 1;
                    break;
                }
            }
        }
    }

    /// Release bookkeeping, entirely under the lock
    ///
    /// Returns the connection when the caller has to close it.
    fn check_in_locked(
        &self,
        state: &mut PoolState<F::Conn>,
        id: ConnectionId,
        conn: Arc<F::Conn>,
    ) -> Option<Arc<F::Conn>> {
        if state.closed {
            if state.closed_on_shutdown.remove(&id) {
                return None;
            }
            state.counters.record_closed(1);
            return Some(conn);
        }

        let Some(handle) = state.active.remove(&id) else {
            debug!(connection_id = %id, "closing connection not owned by this pool");
            state.counters.record_closed(1);
            return Some(conn);
        };

        state.counters.total_released += 1;
        self.place_locked(state, handle)
    }

    /// Route a handle that just left active: next waiter, else idle, else close
    fn place_locked(
        &self,
        state: &mut PoolState<F::Conn>,
        mut handle: PooledHandle<F::Conn>,
    ) -> Option<Arc<F::Conn>> {
        let now = Instant::now();
        let id = handle.id;
        handle.mark_returned(now);

        // FIFO handoff straight from active to active, idle is never touched.
        // The acquire is counted once the waiter claims it.
        if !state.waiters.is_empty() {
            let served = state.waiters.deliver(|| Delivery::Connection {
                id,
                conn: Arc::clone(&handle.conn),
            });
            if let Some(enqueued_at) = served {
                handle.mark_borrowed(now);
                state.active.insert(id, handle);
                state.counters.record_wait(now.saturating_duration_since(enqueued_at));
                debug!(connection_id = %id, "handed connection to waiter");
                return None;
            }
        }

        if state.idle.len() < self.config.max_idle {
            state.idle.push(handle);
            return None;
        }

        state.counters.closed_over_idle_cap += 1;
        state.counters.record_closed(1);
        debug!(connection_id = %id, "idle pool full, closing returned connection");
        Some(handle.conn)
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        state.counters.snapshot(
            state.active.len(),
            state.idle.len(),
            state.waiters.len(),
            self.config.max_active,
            self.config.max_idle,
            state.closed,
        )
    }

    fn lease(self: &Arc<Self>, id: ConnectionId, conn: Arc<F::Conn>) -> PooledConnection<F::Conn> {
        PooledConnection::new(id, conn, self.clone().into_check_in())
    }

    fn into_check_in(self: Arc<Self>) -> Arc<dyn CheckIn<F::Conn>> {
        self
    }

    fn into_capacity(self: Arc<Self>) -> Arc<dyn Capacity<F::Conn>> {
        self
    }
}

impl<F: ConnectionFactory> CheckIn<F::Conn> for Shared<F> {
    fn check_in(&self, id: ConnectionId, conn: Arc<F::Conn>) -> Option<Arc<F::Conn>> {
        let mut state = self.state.lock();
        self.check_in_locked(&mut state, id, conn)
    }

    fn discard(&self, id: ConnectionId, conn: Arc<F::Conn>) -> Option<Arc<F::Conn>> {
        let mut state = self.state.lock();
        if state.closed && state.closed_on_shutdown.remove(&id) {
            return None;
        }

        if state.active.remove(&id).is_some() {
            state.counters.total_released += 1;
            self.grant_capacity(&mut state);
        }
        state.counters.record_closed(1);
        Some(conn)
    }
}

/// Slot and waiter cleanup used by guards, erasing the factory type
trait Capacity<C>: CheckIn<C> {
    /// A reserved creation slot went unused
    fn release_slot(&self);

    /// Withdraw a waiter; returns a connection the caller must close
    fn withdraw(
        &self,
        waiter_id: u64,
        rx: &mut oneshot::Receiver<Delivery<C>>,
        timed_out: bool,
    ) -> Option<(ConnectionId, Arc<C>)>;
}

impl<F: ConnectionFactory> Capacity<F::Conn> for Shared<F> {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.pending_creates -= 1;
        self.grant_capacity(&mut state);
    }

    fn withdraw(
        &self,
        waiter_id: u64,
        rx: &mut oneshot::Receiver<Delivery<F::Conn>>,
        timed_out: bool,
    ) -> Option<(ConnectionId, Arc<F::Conn>)> {
        let mut state = self.state.lock();
        if timed_out {
            state.counters.acquire_timeouts += 1;
        }

        if let Some(waiter) = state.waiters.remove(waiter_id) {
            let waited = Instant::now().saturating_duration_since(waiter.enqueued_at);
            state.counters.record_wait(waited);
            return None;
        }

        // Already served: deliveries happen under this lock, so whatever was
        // sent is in the channel now. Give it back instead of losing it.
        match rx.try_recv() {
            Ok(Delivery::Connection { id, conn }) => {
                debug!(connection_id = %id, "re-donating connection delivered to departed waiter");
                // Never reached a caller, so it is neither an acquire nor a release
                let to_close = match state.active.remove(&id) {
                    Some(handle) => self.place_locked(&mut state, handle),
                    None => self.check_in_locked(&mut state, id, conn),
                };
                to_close.map(|conn| (id, conn))
            }
            Ok(Delivery::Capacity) => {
                state.pending_creates -= 1;
                self.grant_capacity(&mut state);
                None
            }
            Ok(Delivery::Closed) | Err(_) => None,
        }
    }
}

#[async_trait]
impl<F: ConnectionFactory> IdleSweeper for Shared<F> {
    async fn sweep(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let expired = take_expired(&mut state.idle, self.config.idle_timeout, Instant::now());
            state.counters.evicted_idle += expired.len() as u64;
            state.counters.record_closed(expired.len());
            expired
        };

        if !expired.is_empty() {
            debug!(target = %self.target, evicted = expired.len(), "evicting idle connections");
        }
        let count = expired.len();
        for handle in expired {
            debug!(
                connection_id = %handle.id,
                age = ?handle.created_at.elapsed(),
                since_borrowed = ?handle.last_borrowed_at.elapsed(),
                borrows = handle.borrow_count,
                "closing idle connection"
            );
            close_connection(handle.id, &*handle.conn).await;
        }
        count
    }
}

/// An idle connection moved to active while its health check runs
///
/// Dropped mid-check (the acquire was cancelled), it goes back through the
/// normal return path.
struct ProbeGuard<C: Connection> {
    pool: Arc<dyn CheckIn<C>>,
    id: ConnectionId,
    conn: Arc<C>,
    armed: bool,
}

impl<C: Connection> ProbeGuard<C> {
    fn new(pool: Arc<dyn CheckIn<C>>, id: ConnectionId, conn: Arc<C>) -> Self {
        Self { pool, id, conn, armed: true }
    }

    fn disarm(&mut self) -> (ConnectionId, Arc<C>) {
        self.armed = false;
        (self.id, Arc::clone(&self.conn))
    }
}

impl<C: Connection> Drop for ProbeGuard<C> {
    fn drop(&mut self) {
        if self.armed
            && let Some(conn) = self.pool.check_in(self.id, Arc::clone(&self.conn))
        {
            spawn_close(self.id, conn);
        }
    }
}

/// A creation slot counted in `pending_creates`
struct CreateSlot<C> {
    pool: Arc<dyn Capacity<C>>,
    armed: bool,
}

impl<C> CreateSlot<C> {
    fn new(pool: Arc<dyn Capacity<C>>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C> Drop for CreateSlot<C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// A queued acquirer; withdraws itself if dropped before being served
struct WaitGuard<C: Connection> {
    pool: Arc<dyn Capacity<C>>,
    waiter_id: u64,
    rx: oneshot::Receiver<Delivery<C>>,
    armed: bool,
}

impl<C: Connection> WaitGuard<C> {
    fn new(pool: Arc<dyn Capacity<C>>, waiter_id: u64, rx: oneshot::Receiver<Delivery<C>>) -> Self {
        Self { pool, waiter_id, rx, armed: true }
    }

    fn abandon(&mut self, timed_out: bool) -> Option<(ConnectionId, Arc<C>)> {
        self.armed = false;
        self.pool.withdraw(self.waiter_id, &mut self.rx, timed_out)
    }
}

impl<C: Connection> Drop for WaitGuard<C> {
    fn drop(&mut self) {
        if self.armed
            && let Some((id, conn)) = self.abandon(false)
        {
            spawn_close(id, conn);
        }
    }
}

async fn close_connection<C: Connection>(id: ConnectionId, conn: &C) {
    if let Err(e) = conn.close().await {
        warn!(connection_id = %id, error = %e, "failed to close connection");
    }
}

/// Close from a synchronous context such as `Drop`
///
/// Without a runtime the `Arc` is simply dropped and the connection's own
/// destructor has to clean up.
fn spawn_close<C: Connection>(id: ConnectionId, conn: Arc<C>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { close_connection(id, &*conn).await });
        }
        Err(_) => warn!(connection_id = %id, "no runtime available to close connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CommandOutput;
    use crate::errors::ConnectionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Session;

    #[async_trait]
    impl Connection for Session {
        async fn execute(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
            Ok(CommandOutput {
                stdout: command.to_string(),
                ..Default::default()
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    struct Host {
        connects: AtomicUsize,
        delay: Duration,
    }

    impl Host {
        fn new(delay: Duration) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for Host {
        type Conn = Session;

        async fn connect(&self) -> Result<Session, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Session)
        }
    }

    #[tokio::test]
    async fn test_acquire_release_reuses() {
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), PoolConfig::default()).unwrap();

        let conn = pool.acquire().await.unwrap();
        let first = conn.id();
        assert_eq!(conn.execute("whoami").await.unwrap().stdout, "whoami");
        pool.release(conn).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first);
        pool.release(conn).await;

        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_acquired, 2);
        assert_eq!(stats.total_released, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_unbounded_pool_never_queues() {
        let config = PoolConfig::new().with_max_active(0);
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), config).unwrap();

        let mut leases = Vec::new();
        for _ in 0..20 {
            leases.push(pool.acquire().await.unwrap());
        }

        let stats = pool.stats();
        assert_eq!(stats.active, 20);
        assert_eq!(stats.waiting, 0);

        for lease in leases {
            pool.release(lease).await;
        }
        assert_eq!(pool.stats().idle, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_create_frees_its_slot() {
        let config = PoolConfig::new()
            .with_max_active(1)
            .with_acquire_wait_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::new(Host::new(Duration::from_millis(100)), config).unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.shared.state.lock().pending_creates, 0);

        // A leaked slot would queue this caller until its 50ms timeout
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 1);
        pool.release(conn).await;
        assert_eq!(pool.shared.factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), PoolConfig::default()).unwrap();
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;

        pool.close().await.unwrap();
        pool.close().await.unwrap();

        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total_closed, 1);
    }

    #[tokio::test]
    async fn test_release_after_close_does_not_reenter() {
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), PoolConfig::default()).unwrap();
        let conn = pool.acquire().await.unwrap();

        pool.close().await.unwrap();
        pool.release(conn).await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_closed, 1);
        assert!(pool.shared.state.lock().closed_on_shutdown.is_empty());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), PoolConfig::default()).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = pool.acquire_with_cancel(&token).await;
        assert!(matches!(result, Err(PoolError::AcquireCancelled)));

        let stats = pool.stats();
        assert_eq!(stats.acquire_cancellations, 1);
        assert_eq!(stats.total_created, 0);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_redonates_delivered_connection() {
        let config = PoolConfig::new().with_max_active(1);
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), config).unwrap();
        let held = pool.acquire().await.unwrap();
        let held_id = held.id();

        let mut guard = {
            let mut state = pool.shared.state.lock();
            let (waiter_id, rx) = state.waiters.push(Instant::now());
            WaitGuard::new(Arc::clone(&pool.shared).into_capacity(), waiter_id, rx)
        };

        // Handed off into the channel, then the deadline fires before the
        // waiter reads it
        pool.release(held).await;
        assert_eq!(pool.stats().idle, 0);
        assert!(guard.abandon(true).is_none());
        drop(guard);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.acquire_timeouts, 1);
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(stats.total_released, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), held_id);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_timed_out_waiter_passes_handoff_to_next_in_line() {
        let config = PoolConfig::new().with_max_active(1);
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), config).unwrap();
        let held = pool.acquire().await.unwrap();
        let held_id = held.id();

        let (mut first, mut second) = {
            let mut state = pool.shared.state.lock();
            let (first_id, first_rx) = state.waiters.push(Instant::now());
            let (second_id, second_rx) = state.waiters.push(Instant::now());
            (
                WaitGuard::new(Arc::clone(&pool.shared).into_capacity(), first_id, first_rx),
                WaitGuard::new(Arc::clone(&pool.shared).into_capacity(), second_id, second_rx),
            )
        };

        pool.release(held).await;
        assert!(first.abandon(true).is_none());

        match second.rx.try_recv() {
            Ok(Delivery::Connection { id, .. }) => assert_eq!(id, held_id),
            _ => panic!("second waiter was not handed the connection"),
        }
        second.armed = false;
        assert_eq!(pool.stats().active, 1);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[cfg(feature = "prometheus")]
    #[tokio::test]
    async fn test_stats_collector_tracks_pool() {
        let pool = ConnectionPool::new(Host::new(Duration::ZERO), PoolConfig::default()).unwrap();
        let registry = prometheus::Registry::new();
        registry
            .register(Box::new(pool.stats_collector("test").unwrap()))
            .unwrap();

        let conn = pool.acquire().await.unwrap();
        let families = registry.gather();
        let active = families
            .iter()
            .find(|f| f.get_name() == "sessionpool_connections_active")
            .unwrap();
        assert_eq!(active.get_metric()[0].get_gauge().get_value(), 1.0);
        pool.release(conn).await;
    }
}
