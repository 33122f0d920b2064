//! Bounded, class-aware NNTP connection pool
//!
//! One pool serves every provider. Each provider keeps a LIFO stack of idle
//! sessions below its `max_connections` cap; borrowers first clear their
//! usage-class gate, then compete FIFO for a provider slot. Connections are
//! dialed lazily on a borrow miss (serialized per provider so a cold start
//! does not burst-connect), reaped after sitting idle too long, and
//! destroyed instead of returned whenever anything marked them broken.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::admission::{AdmissionController, AdmissionLimits, ClassPermit};
use crate::breaker::CircuitBreaker;
use crate::connection::NntpConnection;
use crate::error::{Error, Result};
use crate::types::{Provider, UsageKind};

/// Default per-dial budget (TCP + TLS + greeting + AUTHINFO)
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default budget for waiting on a pool slot
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle eviction threshold
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default shutdown drain budget
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-dial budget (TCP + TLS + greeting + AUTHINFO)
    pub dial_timeout: Duration,
    /// How long a borrower waits for a slot before `PoolTimeout`
    pub wait_timeout: Duration,
    /// Idle sessions older than this are evicted
    pub idle_timeout: Duration,
    /// How long shutdown waits for in-use sessions to come home
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

struct ProviderSlot {
    provider: Provider,
    /// Caps live borrows at `max_connections`; waiters queue FIFO
    limit: Arc<Semaphore>,
    /// LIFO stack of parked sessions
    idle: parking_lot::Mutex<Vec<NntpConnection>>,
    /// Serializes dialing so borrow misses cannot burst-connect
    dial_lock: tokio::sync::Mutex<()>,
    /// Open sockets, idle and borrowed alike
    live: AtomicUsize,
    breaker: CircuitBreaker,
}

/// The shared connection pool.
///
/// Constructed once and handed around as `Arc<ConnectionPool>`; borrows
/// return [`PooledConnection`] guards that give the session back on drop.
pub struct ConnectionPool {
    slots: Vec<ProviderSlot>,
    admission: AdmissionController,
    tls: Arc<rustls::ClientConfig>,
    config: PoolConfig,
    shutdown: CancellationToken,
    reaper: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Build a pool over `providers` with the given class limits.
    ///
    /// Providers must be listed in index order; that is validated here so
    /// every later lookup can be a plain `Vec` index.
    pub fn new(
        providers: Vec<Provider>,
        limits: AdmissionLimits,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        if providers.iter().all(|p| !p.is_usable()) {
            return Err(Error::config("no usable providers configured"));
        }
        for (position, provider) in providers.iter().enumerate() {
            if provider.index != position {
                return Err(Error::config(format!(
                    "provider {} listed at position {position}",
                    provider.index
                )));
            }
            if provider.is_usable() && provider.max_connections == 0 {
                return Err(Error::config(format!(
                    "provider {} has max_connections = 0",
                    provider.host
                )));
            }
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        let slots = providers
            .into_iter()
            .map(|provider| ProviderSlot {
                limit: Arc::new(Semaphore::new(provider.max_connections)),
                idle: parking_lot::Mutex::new(Vec::new()),
                dial_lock: tokio::sync::Mutex::new(()),
                live: AtomicUsize::new(0),
                breaker: CircuitBreaker::new(provider.index),
                provider,
            })
            .collect();

        let pool = Arc::new(Self {
            slots,
            admission: AdmissionController::new(limits),
            tls,
            config,
            shutdown: CancellationToken::new(),
            reaper: parking_lot::Mutex::new(None),
        });

        // The reaper holds only a weak handle so an abandoned pool can
        // still be dropped; the task exits when the pool goes away.
        let reaper = tokio::spawn(Self::reap_idle_loop(Arc::downgrade(&pool)));
        *pool.reaper.lock() = Some(reaper);

        Ok(pool)
    }

    /// Borrow a session from `provider_index` on behalf of usage class
    /// `kind`.
    ///
    /// Waits (FIFO within class, FIFO per provider) until a slot frees up,
    /// bounded by the pool wait timeout. The returned guard gives the
    /// session back on drop; mark it broken first and it is destroyed
    /// instead.
    pub async fn borrow(
        self: &Arc<Self>,
        provider_index: usize,
        kind: UsageKind,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        if self.shutdown.is_cancelled() {
            return Err(Error::PoolClosed);
        }
        let slot = self
            .slots
            .get(provider_index)
            .ok_or_else(|| Error::config(format!("unknown provider index {provider_index}")))?;
        if !slot.provider.is_usable() {
            return Err(Error::ProviderUnavailable { provider_index });
        }

        let borrow = self.borrow_inner(slot, kind, cancel);
        match timeout(self.config.wait_timeout, borrow).await {
            Ok(result) => result,
            Err(_) => Err(Error::PoolTimeout {
                timeout_secs: self.config.wait_timeout.as_secs(),
            }),
        }
    }

    async fn borrow_inner(
        self: &Arc<Self>,
        slot: &ProviderSlot,
        kind: UsageKind,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let class_permit = self.admission.acquire(kind, cancel).await?;

        let provider_permit = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = self.shutdown.cancelled() => return Err(Error::PoolClosed),
            permit = Arc::clone(&slot.limit).acquire_owned() => {
                permit.map_err(|_| Error::PoolClosed)?
            }
        };

        // Freshest idle session first; stale ones are quietly retired.
        while let Some(conn) = slot.idle.lock().pop() {
            if conn.idle_for() >= self.config.idle_timeout {
                slot.live.fetch_sub(1, Ordering::Relaxed);
                trace!(provider = slot.provider.index, "discarding stale idle session");
                continue;
            }
            return Ok(self.wrap(conn, class_permit, provider_permit));
        }

        // Borrow miss: dial, one connect at a time per provider.
        let _dialing = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            guard = slot.dial_lock.lock() => guard,
        };

        // A release may have parked a session while we waited to dial.
        if let Some(conn) = slot.idle.lock().pop() {
            return Ok(self.wrap(conn, class_permit, provider_permit));
        }

        if slot.breaker.is_open() {
            return Err(Error::ProviderUnavailable {
                provider_index: slot.provider.index,
            });
        }

        let dial = NntpConnection::connect(&slot.provider, &self.tls, self.config.dial_timeout);
        let connected = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = dial => result,
        };

        match connected {
            Ok(conn) => {
                slot.live.fetch_add(1, Ordering::Relaxed);
                slot.breaker.record_success();
                Ok(self.wrap(conn, class_permit, provider_permit))
            }
            Err(e) => {
                slot.breaker.record_failure();
                if let Some(backoff) = e.kind().breaker_backoff() {
                    slot.breaker.trip_for(backoff);
                }
                Err(e)
            }
        }
    }

    fn wrap(
        self: &Arc<Self>,
        mut conn: NntpConnection,
        class_permit: ClassPermit,
        provider_permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        conn.mark_in_use();
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _class_permit: class_permit,
            _provider_permit: provider_permit,
        }
    }

    fn return_connection(&self, mut conn: NntpConnection) {
        let slot = &self.slots[conn.provider_index()];
        if conn.is_broken() || self.shutdown.is_cancelled() {
            slot.live.fetch_sub(1, Ordering::Relaxed);
            trace!(provider = conn.provider_index(), "destroying session");
            return;
        }
        conn.mark_idle();
        slot.idle.lock().push(conn);
    }

    /// The circuit breaker guarding `provider_index`.
    pub fn breaker(&self, provider_index: usize) -> Option<&CircuitBreaker> {
        self.slots.get(provider_index).map(|slot| &slot.breaker)
    }

    /// Provider record at `provider_index`.
    pub fn provider(&self, provider_index: usize) -> Option<&Provider> {
        self.slots.get(provider_index).map(|slot| &slot.provider)
    }

    /// All configured providers, index order.
    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.slots.iter().map(|slot| &slot.provider)
    }

    /// The admission controller in front of this pool.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Sessions currently borrowed from `provider_index`.
    pub fn in_use(&self, provider_index: usize) -> usize {
        self.slots.get(provider_index).map_or(0, |slot| {
            slot.provider.max_connections - slot.limit.available_permits()
        })
    }

    /// Open sockets (idle + borrowed) for `provider_index`.
    pub fn live_connections(&self, provider_index: usize) -> usize {
        self.slots
            .get(provider_index)
            .map_or(0, |slot| slot.live.load(Ordering::Relaxed))
    }

    /// Parked idle sessions for `provider_index`.
    pub fn idle_connections(&self, provider_index: usize) -> usize {
        self.slots
            .get(provider_index)
            .map_or(0, |slot| slot.idle.lock().len())
    }

    async fn reap_idle_loop(pool: std::sync::Weak<Self>) {
        let interval = pool.upgrade().map_or(Duration::from_secs(60), |p| {
            (p.config.idle_timeout / 4).max(Duration::from_secs(1))
        });
        loop {
            tokio::time::sleep(interval).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            if pool.shutdown.is_cancelled() {
                return;
            }
            for slot in &pool.slots {
                let reaped: Vec<NntpConnection> = {
                    let mut idle = slot.idle.lock();
                    let (keep, reap) = idle
                        .drain(..)
                        .partition(|conn| conn.idle_for() < pool.config.idle_timeout);
                    *idle = keep;
                    reap
                };
                if !reaped.is_empty() {
                    slot.live.fetch_sub(reaped.len(), Ordering::Relaxed);
                    debug!(
                        provider = slot.provider.index,
                        reaped = reaped.len(),
                        "reaping idle sessions"
                    );
                    for conn in reaped {
                        tokio::spawn(conn.quit());
                    }
                }
            }
        }
    }

    /// Close the pool: reject new borrows, drop idle sessions, and wait up
    /// to the drain timeout for borrowed sessions to come home (they are
    /// destroyed as they return).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        for slot in &self.slots {
            let drained: Vec<NntpConnection> = slot.idle.lock().drain(..).collect();
            slot.live.fetch_sub(drained.len(), Ordering::Relaxed);
            for conn in drained {
                tokio::spawn(conn.quit());
            }
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let outstanding: usize = (0..self.slots.len()).map(|i| self.live_connections(i)).sum();
            if outstanding == 0 {
                debug!("pool drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(outstanding, "pool drain timeout; abandoning borrowed sessions");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Exclusive loan of one [`NntpConnection`].
///
/// Dropping the guard returns the session to the pool, or destroys it when
/// broken. The held permits make both the per-provider cap and the class
/// budget exact at every instant.
pub struct PooledConnection {
    conn: Option<NntpConnection>,
    pool: Arc<ConnectionPool>,
    _class_permit: ClassPermit,
    _provider_permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = NntpConnection;

    fn deref(&self) -> &NntpConnection {
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut NntpConnection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}
