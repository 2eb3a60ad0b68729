//! Bounded connection pool with FIFO acquisition.
//!
//! Bookkeeping lives under one mutex and never spans I/O. Capacity freed by
//! a broken, reaped or failed connection is handed straight to the oldest
//! waiter as permission to open a replacement.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backend::{Connector, Link};
use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionId, Reclaim};
use crate::error::{Error, Result};
use crate::strand::EventQueue;

// ============================================================================
// Pool Status
// ============================================================================

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Live connections, including ones being opened
    pub size: usize,
    pub idle: usize,
    pub waiting: usize,
    pub max: usize,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// Dropping it queues the return to the pool behind everything already
/// submitted to the connection.
pub struct PooledConnection<L: Link> {
    conn: Option<Connection<L>>,
}

impl<L: Link> PooledConnection<L> {
    fn new(conn: Connection<L>) -> Self {
        Self { conn: Some(conn) }
    }
}

impl<L: Link> Deref for PooledConnection<L> {
    type Target = Connection<L>;

    fn deref(&self) -> &Connection<L> {
        // Only empty inside drop
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<L: Link> Drop for PooledConnection<L> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::trace!(connection = conn.id(), "queueing release");
            conn.release();
        }
    }
}

impl<L: Link> fmt::Debug for PooledConnection<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Permission to open one connection. Counted in `size` until used or dropped.
struct Slot<C: Connector> {
    pool: Weak<PoolShared<C>>,
    armed: bool,
}

impl<C: Connector> Slot<C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Slot<C> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(pool) = self.pool.upgrade() {
                pool.pass_slot();
            }
        }
    }
}

enum Grant<C: Connector> {
    Ready(Connection<C::Link>),
    Open(Slot<C>),
}

struct Waiter<C: Connector> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

enum Decision<C: Connector> {
    Ready(Connection<C::Link>),
    Open(Slot<C>),
    Wait(u64, oneshot::Receiver<Grant<C>>),
    Exhausted,
    Closed,
}

struct PoolState<C: Connector> {
    idle: VecDeque<Connection<C::Link>>,
    waiters: VecDeque<Waiter<C>>,
    size: usize,
    closed: bool,
    next_connection: ConnectionId,
    next_waiter: u64,
}

struct PoolShared<C: Connector> {
    me: Weak<PoolShared<C>>,
    connector: C,
    config: PoolConfig,
    queue: EventQueue,
    state: Mutex<PoolState<C>>,
}

impl<C: Connector> PoolShared<C> {
    fn slot(&self) -> Slot<C> {
        Slot {
            pool: Weak::clone(&self.me),
            armed: true,
        }
    }

    fn expired(&self, conn: &Connection<C::Link>) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|limit| conn.idle_for() > limit)
    }

    fn decide(&self) -> (Decision<C>, Vec<Connection<C::Link>>) {
        let mut discarded = Vec::new();
        let mut state = self.state.lock();
        if state.closed {
            return (Decision::Closed, discarded);
        }

        while let Some(mut conn) = state.idle.pop_front() {
            if conn.is_broken() || self.expired(&conn) {
                conn.detach();
                state.size -= 1;
                discarded.push(conn);
                continue;
            }
            return (Decision::Ready(conn), discarded);
        }

        if state.size < self.config.max_connections {
            state.size += 1;
            return (Decision::Open(self.slot()), discarded);
        }
        if self.config.acquire_timeout == Some(Duration::ZERO) {
            return (Decision::Exhausted, discarded);
        }

        let (tx, rx) = oneshot::channel();
        state.next_waiter += 1;
        let id = state.next_waiter;
        state.waiters.push_back(Waiter { id, tx });
        (Decision::Wait(id, rx), discarded)
    }

    /// Give a grant to the oldest waiter still listening.
    fn offer(state: &mut PoolState<C>, mut grant: Grant<C>) -> Option<Grant<C>> {
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// One unit of capacity became free.
    fn pass_slot(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            match Self::offer(&mut state, Grant::Open(self.slot())) {
                None => return,
                Some(Grant::Open(slot)) => slot.disarm(),
                Some(Grant::Ready(_)) => unreachable!("offered an open grant"),
            }
        }
        state.size -= 1;
    }

    async fn open(&self, slot: Slot<C>) -> Result<Connection<C::Link>> {
        let id = {
            let mut state = self.state.lock();
            state.next_connection += 1;
            state.next_connection
        };
        // Dropping the slot on failure passes the capacity on
        let link = self.connector.connect().await?;
        slot.disarm();
        tracing::debug!(connection = id, "opened connection");
        let pool: Weak<dyn Reclaim<C::Link>> = Weak::clone(&self.me) as Weak<dyn Reclaim<C::Link>>;
        Ok(Connection::new(id, link, &self.queue, Some(pool)))
    }

    async fn wait(&self, id: u64, mut rx: oneshot::Receiver<Grant<C>>, started: Instant) -> Result<Grant<C>> {
        tracing::trace!(waiter = id, "waiting for a connection");
        let received = match self.config.acquire_timeout {
            None => (&mut rx).await.ok(),
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(grant) => grant.ok(),
                Err(_) => {
                    let withdrawn = {
                        let mut state = self.state.lock();
                        match state.waiters.iter().position(|w| w.id == id) {
                            Some(pos) => state.waiters.remove(pos).is_some(),
                            None => false,
                        }
                    };
                    if withdrawn {
                        return Err(Error::PoolExhausted {
                            waited: started.elapsed(),
                            max: self.config.max_connections,
                        });
                    }
                    // Served while timing out: the grant is already in the channel
                    rx.try_recv().ok()
                }
            },
        };
        received.ok_or_else(|| Error::Connection("pool is closed".into()))
    }

    fn retire(conns: Vec<Connection<C::Link>>, reason: &str) {
        for conn in conns {
            tracing::debug!(connection = conn.id(), reason, "retiring connection");
            let _ = conn.shutdown();
        }
    }
}

impl<C: Connector> Reclaim<C::Link> for PoolShared<C> {
    fn reclaim(&self, mut conn: Connection<C::Link>) {
        let retired = {
            let mut state = self.state.lock();
            if state.closed || conn.is_broken() {
                conn.detach();
                Some(conn)
            } else {
                if let Some(Grant::Ready(conn)) = Self::offer(&mut state, Grant::Ready(conn)) {
                    state.idle.push_back(conn);
                }
                None
            }
        };
        if let Some(conn) = retired {
            let reason = if conn.is_broken() { "broken" } else { "pool closed" };
            Self::retire(vec![conn], reason);
            self.pass_slot();
        }
    }

    fn forget(&self, id: ConnectionId) {
        tracing::debug!(connection = id, "connection dropped outside the pool");
        self.pass_slot();
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Bounded set of connections shared by every session of a database.
pub struct Pool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> Pool<C> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let queue = EventQueue::current()?;
        let shared = Arc::new_cyclic(|me| PoolShared {
            me: Weak::clone(me),
            connector,
            config,
            queue,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                size: 0,
                closed: false,
                next_connection: 0,
                next_waiter: 0,
            }),
        });
        let pool = Self { shared };
        pool.spawn_reaper();
        Ok(pool)
    }

    /// Create a pool and open `min_connections` up front.
    pub async fn connect(connector: C, config: PoolConfig) -> Result<Self> {
        let pool = Self::new(connector, config)?;
        let mut warm = Vec::with_capacity(pool.shared.config.min_connections);
        for _ in 0..pool.shared.config.min_connections {
            warm.push(pool.acquire().await?);
        }
        drop(warm);
        Ok(pool)
    }

    fn spawn_reaper(&self) {
        let Some(limit) = self.shared.config.idle_timeout else {
            return;
        };
        let period = (limit / 2).max(Duration::from_millis(100));
        let pool = Arc::downgrade(&self.shared);
        self.shared.queue.spawn_runner(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = pool.upgrade() else {
                    break;
                };
                if shared.state.lock().closed {
                    break;
                }
                Pool { shared }.retain_idle();
            }
        });
    }

    /// Check out a connection.
    ///
    /// Reuses the oldest idle connection, opens a new one while under
    /// capacity, or waits in line behind earlier callers for at most
    /// `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<C::Link>> {
        let started = Instant::now();
        let (decision, discarded) = self.shared.decide();
        PoolShared::<C>::retire(discarded, "stale");

        let grant = match decision {
            Decision::Ready(conn) => Grant::Ready(conn),
            Decision::Open(slot) => Grant::Open(slot),
            Decision::Wait(id, rx) => self.shared.wait(id, rx, started).await?,
            Decision::Exhausted => {
                return Err(Error::PoolExhausted {
                    waited: started.elapsed(),
                    max: self.shared.config.max_connections,
                })
            }
            Decision::Closed => return Err(Error::Connection("pool is closed".into())),
        };

        let conn = match grant {
            Grant::Ready(conn) => {
                tracing::trace!(connection = conn.id(), "reusing connection");
                conn
            }
            Grant::Open(slot) => self.shared.open(slot).await?,
        };
        Ok(PooledConnection::new(conn))
    }

    /// Close idle connections past `idle_timeout`, keeping `min_connections`.
    pub fn retain_idle(&self) -> usize {
        let Some(limit) = self.shared.config.idle_timeout else {
            return 0;
        };
        let expired = {
            let mut state = self.shared.state.lock();
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(mut conn) = state.idle.pop_front() {
                let removable = state.size > self.shared.config.min_connections;
                if removable && conn.idle_for() > limit {
                    conn.detach();
                    state.size -= 1;
                    expired.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            state.idle = kept;
            expired
        };
        let count = expired.len();
        PoolShared::<C>::retire(expired, "idle timeout");
        count
    }

    /// Close the pool: waiters fail, idle links are terminated, and
    /// connections still checked out are closed when released.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.size -= idle.len();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (idle, waiters)
        };
        drop(waiters);

        let handles: Vec<_> = idle
            .into_iter()
            .filter_map(|mut conn| {
                conn.detach();
                conn.shutdown()
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "error closing connection");
            }
        }
        tracing::debug!("pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            size: state.size,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            max: self.shared.config.max_connections,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    pub(crate) fn queue(&self) -> &EventQueue {
        &self.shared.queue
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}
