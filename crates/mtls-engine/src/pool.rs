//! Connection pooling
//!
//! Every live connection, idle or checked out, holds one semaphore permit, so the
//! pool never exceeds `max_connections`. Establishing a connection happens without
//! holding the idle-set lock; only bookkeeping is done under it.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionState, Connector, Target};
use crate::error::MtlsError;
use crate::trust::TrustContext;
use crate::Result;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total connections created
    pub connections_created: u64,

    /// Total connections destroyed
    pub connections_destroyed: u64,

    /// Connections currently checked out
    pub active_connections: u64,

    /// Connections currently idle in the pool
    pub idle_connections: u64,

    /// Successful acquires
    pub total_acquires: u64,

    /// Connections handed back, kept or discarded
    pub total_returns: u64,

    /// Acquires that failed (timeout, cancellation, setup error)
    pub failed_acquires: u64,

    /// Connections discarded because the credential expired
    pub expired_connections: u64,

    /// Connections retired by a rotation
    pub retired_connections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscardReason {
    Failed,
    Expired,
    Retired,
    IdleTimeout,
    Dropped,
    Shutdown,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Retired => "retired",
            Self::IdleTimeout => "idle timeout",
            Self::Dropped => "dropped without release",
            Self::Shutdown => "pool shutdown",
        };
        f.write_str(reason)
    }
}

#[derive(Debug)]
struct IdleEntry {
    connection: Connection,
    permit: OwnedSemaphorePermit,
    idle_since: Instant,
}

struct PoolInner {
    config: PoolConfig,
    connector: Connector,
    trust: ArcSwap<TrustContext>,
    idle: Mutex<VecDeque<IdleEntry>>,
    semaphore: Arc<Semaphore>,
    returned: Notify,
    stats: RwLock<PoolStats>,
    closed: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded pool of established connections to one target
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("target", self.inner.connector.target())
            .field("generation", &self.inner.trust.load().generation())
            .field("stats", &*self.inner.stats.read())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool; starts the maintenance task when called inside a runtime
    ///
    /// Fails with [`MtlsError::Configuration`] when `config` does not validate.
    pub fn new(
        config: PoolConfig,
        connector: Connector,
        trust: Arc<TrustContext>,
    ) -> Result<Self> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                trust: ArcSwap::new(trust),
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                returned: Notify::new(),
                stats: RwLock::new(PoolStats::default()),
                closed: AtomicBool::new(false),
                maintenance: Mutex::new(None),
            }),
        };

        pool.start_maintenance_task();
        Ok(pool)
    }

    /// Acquire a connection, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout` for a free slot
    ///
    /// Reuses a valid idle connection when there is one, otherwise establishes a new
    /// connection. Establishment itself is bounded by the connection timeouts.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let result = self.inner.acquire(timeout).await;
        if result.is_err() {
            self.inner.update_stats(|stats| stats.failed_acquires += 1);
        }
        result
    }

    /// Like [`acquire_timeout`](Self::acquire_timeout), abandoning the wait when
    /// `cancel` fires
    ///
    /// A connection under construction when the token fires is torn down.
    pub async fn acquire_cancellable(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<PooledConnection> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.inner.update_stats(|stats| stats.failed_acquires += 1);
                debug!("Acquire cancelled");
                Err(MtlsError::Cancelled { operation: "acquire" })
            }
            result = self.acquire_timeout(timeout) => result,
        }
    }

    /// Return a connection
    ///
    /// Failed, expired and old-generation connections are discarded; anything else
    /// goes back to the idle set of the pool that issued it.
    pub fn release(&self, mut connection: PooledConnection) {
        let owner = connection.pool.upgrade();
        let Some((connection, permit)) = connection.take() else {
            return;
        };
        match owner {
            Some(owner) => {
                if !Arc::ptr_eq(&owner, &self.inner) {
                    warn!(
                        connection_id = %connection.id(),
                        "Connection released to a pool that did not issue it"
                    );
                }
                owner.give_back(connection, permit);
            }
            None => {
                debug!(
                    connection_id = %connection.id(),
                    "Issuing pool is gone; dropping released connection"
                );
                drop(permit);
                drop(connection);
            }
        }
    }

    /// Current trust context
    pub fn trust_context(&self) -> Arc<TrustContext> {
        self.inner.trust.load_full()
    }

    /// Switch to a new trust context
    ///
    /// Idle connections of older generations are closed. Checked-out ones stay
    /// usable and are discarded when released.
    pub fn rotate(&self, trust: Arc<TrustContext>) {
        let generation = trust.generation();
        let fingerprint = trust.fingerprint();
        self.inner.trust.store(trust);

        let retired: Vec<IdleEntry> = {
            let mut idle = self.inner.idle.lock();
            let (keep, retire): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|entry| entry.connection.generation() == generation);
            *idle = keep;
            retire.into_iter().collect()
        };

        let count = retired.len();
        for entry in retired {
            self.inner
                .discard(entry.connection, entry.permit, DiscardReason::Retired);
        }
        self.inner.refresh_idle_count();

        info!(
            generation,
            fingerprint = %fingerprint,
            retired = count,
            "Pool rotated to new trust context"
        );
    }

    /// Snapshot of pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.read().clone()
    }

    /// Target endpoint
    pub fn target(&self) -> &Target {
        self.inner.connector.target()
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close idle connections and refuse further acquires
    ///
    /// Waiters fail with [`MtlsError::PoolClosed`]. Checked-out connections are
    /// closed when released or dropped.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down connection pool");

        self.inner.semaphore.close();
        self.inner.returned.notify_waiters();
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }

        let idle: Vec<IdleEntry> = self.inner.idle.lock().drain(..).collect();
        for entry in idle {
            entry.connection.close().await;
            drop(entry.permit);
            self.inner.update_stats(|stats| stats.connections_destroyed += 1);
        }
        self.inner.refresh_idle_count();
    }

    /// Close idle connections that expired, idled out or belong to an old generation
    pub fn evict_stale(&self) {
        self.inner.evict_stale();
    }

    fn start_maintenance_task(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available; pool maintenance task not started");
            return;
        };

        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.maintenance_interval;

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                trace!("Running pool maintenance");
                inner.evict_stale();
            }
        });

        *self.inner.maintenance.lock() = Some(task);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PoolInner {
    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut PoolStats),
    {
        let mut stats = self.stats.write();
        f(&mut stats);
    }

    fn refresh_idle_count(&self) {
        let idle = self.idle.lock().len() as u64;
        self.update_stats(|stats| stats.idle_connections = idle);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MtlsError::PoolClosed);
        }
        Ok(())
    }

    async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection> {
        let started = Instant::now();
        // None when the timeout is too large to represent; the wait is then unbounded
        let deadline = started.checked_add(timeout);

        loop {
            self.ensure_open()?;

            if let Some(entry) = self.checkout_idle() {
                return Ok(self.hand_out(entry.connection, entry.permit, true));
            }

            // Refuse before waiting: a new connection would be born expired
            let margin = self.connector.config().expiry_safety_margin;
            self.trust.load().ensure_usable(Utc::now(), margin)?;

            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => return self.establish(permit).await,
                Err(TryAcquireError::Closed) => return Err(MtlsError::PoolClosed),
                Err(TryAcquireError::NoPermits) => {}
            }

            trace!("Pool at capacity, waiting for a slot");
            let returned = self.returned.notified();
            tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| MtlsError::PoolClosed)?;
                    return self.establish(permit).await;
                }
                () = returned => continue,
                () = wait_until(deadline) => {
                    warn!(
                        max_connections = self.config.max_connections,
                        "Connection pool exhausted"
                    );
                    return Err(MtlsError::PoolExhausted {
                        max_connections: self.config.max_connections,
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }

    /// Pop the most recently returned usable idle connection
    fn checkout_idle(&self) -> Option<IdleEntry> {
        let now = Utc::now();
        let generation = self.trust.load().generation();
        let mut stale = Vec::new();

        let found = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(mut entry) = idle.pop_back() {
                match self.stale_reason(&mut entry, generation, now) {
                    Some(reason) => stale.push((entry, reason)),
                    None => {
                        found = Some(entry);
                        break;
                    }
                }
            }
            found
        };

        for (entry, reason) in stale {
            self.discard(entry.connection, entry.permit, reason);
        }
        self.refresh_idle_count();
        found
    }

    fn stale_reason(
        &self,
        entry: &mut IdleEntry,
        generation: u64,
        now: chrono::DateTime<Utc>,
    ) -> Option<DiscardReason> {
        if entry.connection.generation() != generation {
            Some(DiscardReason::Retired)
        } else if entry.connection.check_expiry(now) {
            Some(DiscardReason::Expired)
        } else if !entry.connection.state().is_usable() {
            Some(DiscardReason::Failed)
        } else if entry.idle_since.elapsed() >= self.config.max_idle_time {
            Some(DiscardReason::IdleTimeout)
        } else {
            None
        }
    }

    fn evict_stale(&self) {
        let now = Utc::now();
        let generation = self.trust.load().generation();
        let mut stale = Vec::new();

        {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            for mut entry in idle.drain(..) {
                match self.stale_reason(&mut entry, generation, now) {
                    Some(reason) => stale.push((entry, reason)),
                    None => keep.push_back(entry),
                }
            }
            *idle = keep;
        }

        if !stale.is_empty() {
            debug!(evicted = stale.len(), "Evicting stale idle connections");
        }
        for (entry, reason) in stale {
            self.discard(entry.connection, entry.permit, reason);
        }
        self.refresh_idle_count();
    }

    async fn establish(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<PooledConnection> {
        let trust = self.trust.load_full();
        // The permit is released if connecting fails or the future is dropped
        let connection = self.connector.connect(&trust).await?;

        self.update_stats(|stats| stats.connections_created += 1);
        Ok(self.hand_out(connection, permit, false))
    }

    fn hand_out(
        self: &Arc<Self>,
        mut connection: Connection,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> PooledConnection {
        connection.touch();
        self.update_stats(|stats| {
            stats.total_acquires += 1;
            stats.active_connections += 1;
        });
        debug!(
            connection_id = %connection.id(),
            generation = connection.generation(),
            reused,
            "Connection checked out"
        );

        PooledConnection {
            connection: Some(connection),
            permit: Some(permit),
            pool: Arc::downgrade(self),
        }
    }

    fn give_back(&self, mut connection: Connection, permit: OwnedSemaphorePermit) {
        self.update_stats(|stats| {
            stats.total_returns += 1;
            stats.active_connections = stats.active_connections.saturating_sub(1);
        });

        if self.closed.load(Ordering::Acquire) {
            self.discard(connection, permit, DiscardReason::Shutdown);
            return;
        }

        let generation = self.trust.load().generation();
        let reason = if connection.generation() != generation {
            Some(DiscardReason::Retired)
        } else if connection.check_expiry(Utc::now()) {
            Some(DiscardReason::Expired)
        } else if connection.state() != ConnectionState::Established {
            Some(DiscardReason::Failed)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.discard(connection, permit, reason);
            return;
        }

        connection.touch();
        trace!(connection_id = %connection.id(), "Connection returned to idle set");
        self.idle.lock().push_back(IdleEntry {
            connection,
            permit,
            idle_since: Instant::now(),
        });
        self.refresh_idle_count();
        self.returned.notify_one();
    }

    fn discard(&self, connection: Connection, permit: OwnedSemaphorePermit, reason: DiscardReason) {
        match reason {
            DiscardReason::Failed | DiscardReason::Dropped => warn!(
                connection_id = %connection.id(),
                state = %connection.state(),
                reason = %reason,
                "Discarding connection"
            ),
            _ => debug!(
                connection_id = %connection.id(),
                reason = %reason,
                "Discarding connection"
            ),
        }

        self.update_stats(|stats| {
            stats.connections_destroyed += 1;
            match reason {
                DiscardReason::Expired => stats.expired_connections += 1,
                DiscardReason::Retired => stats.retired_connections += 1,
                _ => {}
            }
        });

        // The permit is held until the socket is released
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    connection.close().await;
                    drop(permit);
                });
            }
            Err(_) => {
                drop(connection);
                drop(permit);
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.abort();
        }
    }
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it without releasing
/// discards the connection.
pub struct PooledConnection {
    connection: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    fn take(&mut self) -> Option<(Connection, OwnedSemaphorePermit)> {
        match (self.connection.take(), self.permit.take()) {
            (Some(connection), Some(permit)) => Some((connection, permit)),
            _ => None,
        }
    }

    fn connection_ref(&self) -> &Connection {
        // Only empty after `take`, which consumes the handle's last use
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn connection_mut(&mut self) -> &mut Connection {
        match &mut self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some((connection, permit)) = self.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => {
                pool.update_stats(|stats| {
                    stats.active_connections = stats.active_connections.saturating_sub(1);
                });
                pool.discard(connection, permit, DiscardReason::Dropped);
            }
            None => {
                drop(connection);
                drop(permit);
            }
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().connection_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().connection_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().connection_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().connection_mut()).poll_shutdown(cx)
    }
}
