/*!
 * Generic connection pool.
 *
 * Manages a bounded set of reusable resources of any type. The resource owner
 * supplies a [`ResourceManager`] that knows how to create, validate and
 * destroy them; the pool itself knows nothing about what the resource is.
 *
 * Guarantees:
 * - at most `max_connections` resources exist (and so are in use) at once
 * - a resource handed out is never handed to a second caller until released
 * - a released resource goes straight to the oldest waiter, if any, without
 *   passing through the idle list
 * - a slot freed by a discarded resource or a failed create passes to the
 *   oldest waiter, which creates its own resource
 * - idle resources beyond `min_connections` are evicted after `idle_timeout`
 */
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Creates, checks and tears down pooled resources
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    /// The pooled resource
    type Resource: Send + 'static;

    /// Open a new resource
    async fn create(&self) -> Result<Self::Resource>;

    /// Check an idle resource before it is handed out
    async fn validate(&self, resource: &mut Self::Resource) -> bool;

    /// Release a resource for good; failures are the manager's to log
    async fn destroy(&self, resource: Self::Resource);
}

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle resources kept alive by the reaper
    pub min_connections: usize,
    /// Upper bound on resources in existence
    pub max_connections: usize,
    /// How long `acquire` waits in the queue
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
    /// Idle time after which a resource may be evicted
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// How often the reaper runs
    #[serde(with = "millis")]
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Check the sizing is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::validation("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::validation(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::validation("cleanup_interval must be non-zero"));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Resources in existence (idle + in use)
    pub total: usize,
    /// Resources waiting in the idle list
    pub idle: usize,
    /// Resources handed out (includes slots reserved for a create)
    pub in_use: usize,
    /// Callers queued in `acquire`
    pub waiting: usize,
    /// Resources created over the pool's lifetime
    pub created: u64,
    /// Resources destroyed over the pool's lifetime
    pub destroyed: u64,
}

struct IdleEntry<T> {
    resource: T,
    created_at: Instant,
    last_used: Instant,
}

/// What a queued caller is woken with
enum Handoff<M: ResourceManager> {
    /// A released resource, passed on without touching the idle list
    Resource(Pooled<M>),
    /// A reserved slot the waiter fills by creating a resource
    Slot(SlotGrant<M>),
}

impl<M: ResourceManager> Handoff<M> {
    /// Take back a handoff the waiter never received
    fn reclaim(self) -> Option<M::Resource> {
        match self {
            Handoff::Resource(mut pooled) => pooled.resource.take(),
            Handoff::Slot(grant) => {
                grant.disarm();
                None
            }
        }
    }
}

/// A reserved `in_use` slot; frees itself if dropped unused
struct SlotGrant<M: ResourceManager> {
    pool: Weak<PoolInner<M>>,
    armed: bool,
}

impl<M: ResourceManager> SlotGrant<M> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: ResourceManager> Drop for SlotGrant<M> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(pool) = self.pool.upgrade() {
                pool.forget_slot();
            }
        }
    }
}

type Waiter<M> = oneshot::Sender<Handoff<M>>;

struct PoolState<M: ResourceManager> {
    idle: VecDeque<IdleEntry<M::Resource>>,
    in_use: usize,
    waiters: VecDeque<Waiter<M>>,
    created: u64,
    destroyed: u64,
    closed: bool,
}

struct PoolInner<M: ResourceManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M>>,
}

impl<M: ResourceManager> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M>> {
        // a panic while holding the lock leaves counters consistent enough to keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn destroy_later(self: &Arc<Self>, resource: M::Resource) {
        self.lock().destroyed += 1;
        let inner = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.manager.destroy(resource).await });
            }
            Err(_) => {
                warn!("No async runtime available, dropping pooled resource without destroy");
                drop(resource);
            }
        }
    }

    /// Return a resource: oldest live waiter first, idle list otherwise
    fn release(self: &Arc<Self>, resource: M::Resource, created_at: Instant) {
        let mut resource = resource;
        let mut state = self.lock();

        if state.closed {
            state.in_use = state.in_use.saturating_sub(1);
            drop(state);
            self.destroy_later(resource);
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            let handoff = Pooled {
                resource: Some(resource),
                created_at,
                pool: Arc::downgrade(self),
            };
            match waiter.send(Handoff::Resource(handoff)) {
                Ok(()) => {
                    trace!("Handed released resource directly to a waiter");
                    return;
                }
                Err(returned) => {
                    // waiter gave up; take the resource back without running Drop
                    match returned.reclaim() {
                        Some(r) => resource = r,
                        None => return,
                    }
                }
            }
        }

        state.in_use = state.in_use.saturating_sub(1);
        let now = Instant::now();
        state.idle.push_back(IdleEntry {
            resource,
            created_at,
            last_used: now,
        });
    }

    /// Free an in-use slot whose resource is gone
    ///
    /// The slot stays reserved and goes to the oldest live waiter if there
    /// is one.
    fn forget_slot(self: &Arc<Self>) {
        let mut state = self.lock();
        if !state.closed {
            while let Some(waiter) = state.waiters.pop_front() {
                let grant = SlotGrant {
                    pool: Arc::downgrade(self),
                    armed: true,
                };
                match waiter.send(Handoff::Slot(grant)) {
                    Ok(()) => {
                        trace!("Handed freed slot to a waiter");
                        return;
                    }
                    Err(returned) => {
                        returned.reclaim();
                    }
                }
            }
        }
        state.in_use = state.in_use.saturating_sub(1);
    }
}

/// A resource checked out of the pool; returned when dropped
pub struct Pooled<M: ResourceManager> {
    resource: Option<M::Resource>,
    created_at: Instant,
    pool: Weak<PoolInner<M>>,
}

impl<M: ResourceManager> Pooled<M> {
    /// When the underlying resource was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Destroy the resource instead of returning it to the pool
    pub fn invalidate(mut self) {
        if let Some(resource) = self.resource.take() {
            match self.pool.upgrade() {
                Some(pool) => {
                    pool.forget_slot();
                    pool.destroy_later(resource);
                }
                None => drop(resource),
            }
        }
    }
}

impl<M: ResourceManager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled resource accessed after release"))
    }
}

impl<M: ResourceManager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled resource accessed after release"))
    }
}

impl<M: ResourceManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(resource, self.created_at);
            }
        }
    }
}

impl<M: ResourceManager> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("created_at", &self.created_at)
            .field("held", &self.resource.is_some())
            .finish()
    }
}

/// Bounded pool of reusable resources
pub struct ConnectionPool<M: ResourceManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ResourceManager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ResourceManager> ConnectionPool<M> {
    /// Create a pool and start its background reaper
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            manager,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                waiters: VecDeque::new(),
                created: 0,
                destroyed: 0,
                closed: false,
            }),
        });
        Self::spawn_reaper(Arc::downgrade(&inner), inner.config.cleanup_interval);
        Ok(Self { inner })
    }

    /// The pool's configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The resource manager
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Pre-create resources until `min_connections` exist
    pub async fn warm_up(&self) -> Result<()> {
        loop {
            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if state.idle.len() + state.in_use >= self.inner.config.min_connections {
                    return Ok(());
                }
                state.in_use += 1;
            }
            let resource = self.create_reserved().await?;
            self.inner.release(resource, Instant::now());
        }
    }

    /// Check out a resource
    ///
    /// Tries idle resources first (validating each), then creates one if the
    /// pool is below its maximum, and otherwise queues until a resource is
    /// released or `acquire_timeout` expires.
    pub async fn acquire(&self) -> Result<Pooled<M>> {
        loop {
            let candidate = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(entry) = state.idle.pop_front() {
                    state.in_use += 1;
                    Acquire::Idle(entry)
                } else if state.in_use < self.inner.config.max_connections {
                    state.in_use += 1;
                    Acquire::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Acquire::Wait(rx)
                }
            };

            match candidate {
                Acquire::Idle(mut entry) => {
                    if self.inner.manager.validate(&mut entry.resource).await {
                        return Ok(Pooled {
                            resource: Some(entry.resource),
                            created_at: entry.created_at,
                            pool: Arc::downgrade(&self.inner),
                        });
                    }
                    debug!("Evicting pooled resource that failed validation");
                    self.inner.forget_slot();
                    self.inner.destroy_later(entry.resource);
                }
                Acquire::Create => {
                    let resource = self.create_reserved().await?;
                    return Ok(Pooled {
                        resource: Some(resource),
                        created_at: Instant::now(),
                        pool: Arc::downgrade(&self.inner),
                    });
                }
                Acquire::Wait(rx) => {
                    let timeout = self.inner.config.acquire_timeout;
                    return match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(Handoff::Resource(pooled))) => Ok(pooled),
                        Ok(Ok(Handoff::Slot(grant))) => {
                            let created = self.create_reserved().await;
                            // create_reserved frees the slot itself on failure
                            grant.disarm();
                            created.map(|resource| Pooled {
                                resource: Some(resource),
                                created_at: Instant::now(),
                                pool: Arc::downgrade(&self.inner),
                            })
                        }
                        Ok(Err(_)) => Err(Error::PoolClosed),
                        Err(_) => {
                            self.prune_waiters();
                            Err(Error::AcquireTimeout(timeout))
                        }
                    };
                }
            }
        }
    }

    async fn create_reserved(&self) -> Result<M::Resource> {
        match self.inner.manager.create().await {
            Ok(resource) => {
                let mut state = self.inner.lock();
                state.created += 1;
                if state.closed {
                    state.in_use = state.in_use.saturating_sub(1);
                    drop(state);
                    self.inner.destroy_later(resource);
                    return Err(Error::PoolClosed);
                }
                Ok(resource)
            }
            Err(e) => {
                self.inner.forget_slot();
                Err(e)
            }
        }
    }

    fn prune_waiters(&self) {
        let mut state = self.inner.lock();
        state.waiters.retain(|w| !w.is_closed());
    }

    /// Evict idle resources past `idle_timeout`, keeping `min_connections`
    ///
    /// Returns how many were evicted. The reaper calls this periodically.
    pub fn evict_idle(&self) -> usize {
        let evicted = Self::collect_expired(&self.inner);
        let count = evicted.len();
        for resource in evicted {
            self.inner.destroy_later(resource);
        }
        count
    }

    fn collect_expired(inner: &PoolInner<M>) -> Vec<M::Resource> {
        let mut state = inner.lock();
        let mut total = state.idle.len() + state.in_use;
        let min = inner.config.min_connections;
        let idle_timeout = inner.config.idle_timeout;

        let mut kept = VecDeque::with_capacity(state.idle.len());
        let mut evicted = Vec::new();
        while let Some(entry) = state.idle.pop_front() {
            if total > min && entry.last_used.elapsed() >= idle_timeout {
                total -= 1;
                evicted.push(entry.resource);
            } else {
                kept.push_back(entry);
            }
        }
        state.idle = kept;
        evicted
    }

    fn spawn_reaper(pool: Weak<PoolInner<M>>, every: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else { break };
                if inner.lock().closed {
                    break;
                }
                let evicted = Self::collect_expired(&inner);
                if !evicted.is_empty() {
                    debug!("Reaper evicting {} idle resources", evicted.len());
                }
                for resource in evicted {
                    inner.destroy_later(resource);
                }
            }
            trace!("Pool reaper stopped");
        });
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            total: state.idle.len() + state.in_use,
            idle: state.idle.len(),
            in_use: state.in_use,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close the pool
    ///
    /// Queued callers fail with [`Error::PoolClosed`], idle resources are
    /// destroyed now and in-use resources when they are released. Calling it
    /// again is a no-op.
    pub async fn shutdown(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.destroyed += state.idle.len() as u64;
            let idle: Vec<_> = state.idle.drain(..).map(|e| e.resource).collect();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (idle, waiters)
        };
        // dropping the senders wakes each waiter with PoolClosed
        drop(waiters);
        for resource in idle {
            self.inner.manager.destroy(resource).await;
        }
        debug!("Connection pool shut down");
    }
}

enum Acquire<M: ResourceManager> {
    Idle(IdleEntry<M::Resource>),
    Create,
    Wait(oneshot::Receiver<Handoff<M>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Conn {
        id: usize,
        healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct TestManager {
        created: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
        fail_create: AtomicBool,
        fail_next: AtomicUsize,
        create_delay_ms: AtomicU64,
    }

    #[async_trait]
    impl ResourceManager for TestManager {
        type Resource = Conn;

        async fn create(&self) -> Result<Conn> {
            let delay = self.create_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let fail_once = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail_once || self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::resource_creation("refused"));
            }
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn {
                id,
                healthy: Arc::new(AtomicBool::new(true)),
            })
        }

        async fn validate(&self, resource: &mut Conn) -> bool {
            resource.healthy.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _resource: Conn) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            acquire_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reuses_released_resource() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(2))?;
        let first = pool.acquire().await?;
        let id = first.id;
        drop(first);

        let again = pool.acquire().await?;
        assert_eq!(again.id, id);
        assert_eq!(pool.stats().created, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_never_exceeds_max_in_use() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(3))?;
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let peak = peak.clone();
            let current = current.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await?;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
                Ok::<_, Error>(())
            }));
        }
        for task in tasks {
            task.await.map_err(|e| Error::other(e.to_string()))??;
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.total <= 3);
        assert_eq!(stats.in_use, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_hands_off_to_waiter_directly() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(1))?;
        let held = pool.acquire().await?;
        let held_id = held.id;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id) });

        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        drop(held);
        // handed over synchronously: never idle, still counted in use
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.waiting, 0);

        let got = waiter.await.map_err(|e| Error::other(e.to_string()))??;
        assert_eq!(got, held_id);
        assert_eq!(pool.stats().created, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_waiters_served_in_fifo_order() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(1))?;
        let held = pool.acquire().await?;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for n in 0..3 {
            let task_pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let conn = task_pool.acquire().await?;
                order.lock().unwrap().push(n);
                drop(conn);
                Ok::<_, Error>(())
            }));
            while pool.stats().waiting < n + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for task in tasks {
            task.await.map_err(|e| Error::other(e.to_string()))??;
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(1))?;
        let _held = pool.acquire().await?;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout(_)));
        assert_eq!(pool.stats().waiting, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_idle_resource_is_evicted() -> Result<()> {
        let manager = TestManager::default();
        let destroyed = manager.destroyed.clone();
        let pool = ConnectionPool::new(manager, config(2))?;

        let conn = pool.acquire().await?;
        let first_id = conn.id;
        conn.healthy.store(false, Ordering::SeqCst);
        drop(conn);

        let fresh = pool.acquire().await?;
        assert_ne!(fresh.id, first_id);
        tokio::task::yield_now().await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_frees_slot() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(1))?;
        let conn = pool.acquire().await?;
        conn.invalidate();
        assert_eq!(pool.stats().in_use, 0);
        let next = pool.acquire().await?;
        assert_eq!(next.id, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_wakes_waiter() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(1))?;
        let held = pool.acquire().await?;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id) });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        held.invalidate();

        let got = waiter.await.map_err(|e| Error::other(e.to_string()))??;
        assert_eq!(got, 1);
        assert!(started.elapsed() < Duration::from_millis(200));

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.created, 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_wakes_waiter() -> Result<()> {
        let manager = TestManager::default();
        manager.fail_next.store(1, Ordering::SeqCst);
        manager.create_delay_ms.store(50, Ordering::SeqCst);
        let pool = ConnectionPool::new(manager, config(1))?;

        let first_pool = pool.clone();
        let first = tokio::spawn(async move { first_pool.acquire().await.map(|c| c.id) });
        while pool.stats().in_use == 0 {
            tokio::task::yield_now().await;
        }

        let second_pool = pool.clone();
        let second = tokio::spawn(async move { second_pool.acquire().await.map(|c| c.id) });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        let first = first.await.map_err(|e| Error::other(e.to_string()))?;
        assert!(matches!(first, Err(Error::ResourceCreation(_))));

        // the queued caller creates its own resource instead of timing out
        let second = second.await.map_err(|e| Error::other(e.to_string()))??;
        assert_eq!(second, 0);
        assert_eq!(pool.stats().in_use, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_slot_is_not_leaked() -> Result<()> {
        let pool = ConnectionPool::new(TestManager::default(), config(1))?;
        let held = pool.acquire().await?;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id) });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        held.invalidate();
        assert_eq!(pool.stats().in_use, 0);
        tokio_test::assert_ok!(pool.acquire().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_create_releases_slot() -> Result<()> {
        let manager = TestManager::default();
        manager.fail_create.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(manager, config(1))?;

        assert!(matches!(pool.acquire().await, Err(Error::ResourceCreation(_))));
        assert_eq!(pool.stats().in_use, 0);

        pool.manager().fail_create.store(false, Ordering::SeqCst);
        tokio_test::assert_ok!(pool.acquire().await);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_keeps_min_connections() -> Result<()> {
        let pool = ConnectionPool::new(
            TestManager::default(),
            PoolConfig {
                min_connections: 1,
                max_connections: 4,
                idle_timeout: Duration::from_secs(30),
                cleanup_interval: Duration::from_secs(10),
                ..PoolConfig::default()
            },
        )?;

        let a = pool.acquire().await?;
        let b = pool.acquire().await?;
        let c = pool.acquire().await?;
        drop((a, b, c));
        assert_eq!(pool.stats().idle, 3);

        tokio::time::sleep(Duration::from_secs(45)).await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_warm_up_creates_minimum() -> Result<()> {
        let pool = ConnectionPool::new(
            TestManager::default(),
            PoolConfig {
                min_connections: 2,
                ..config(4)
            },
        )?;
        pool.warm_up().await?;
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.in_use, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters_and_destroys() -> Result<()> {
        let manager = TestManager::default();
        let destroyed = manager.destroyed.clone();
        let pool = ConnectionPool::new(manager, config(1))?;

        let held = pool.acquire().await?;
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id) });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown().await;
        let result = waiter.await.map_err(|e| Error::other(e.to_string()))?;
        assert!(matches!(result, Err(Error::PoolClosed)));

        drop(held);
        tokio::task::yield_now().await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));

        // second shutdown is harmless
        pool.shutdown().await;
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        }
        .validate()
        .is_err());
        assert!(PoolConfig {
            min_connections: 5,
            max_connections: 2,
            ..PoolConfig::default()
        }
        .validate()
        .is_err());
    }
}
