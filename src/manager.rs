//! The single owner of every live session.
//!
//! Sessions are cached per device address and reused while fresh. A
//! background sweep closes sessions that went stale or dead, and a semaphore
//! bounds how many links are open at once since the host Bluetooth stack
//! only has a handful of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::error::{GatewayError, Result};
use crate::frame::DecodedFrame;
use crate::session::{Session, SessionState};
use crate::transport::TransportFactory;

/// How long shutdown waits for a busy session before giving up on closing it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// A cached session unused for this long is closed.
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on simultaneously open sessions.
    pub max_sessions: usize,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(30),
            max_sessions: 3,
        }
    }
}

/// Borrowed access to a cached session for the duration of one poll.
///
/// While any handle is alive the session counts as leased and is never
/// swept or evicted for another device, even between requests.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<Session>>,
}

impl SessionHandle {
    pub async fn request(&self, frame: &[u8], response_timeout: Duration) -> Result<DecodedFrame> {
        self.session.lock().await.request(frame, response_timeout).await
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    /// Whether both handles refer to the same underlying session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

struct CacheEntry {
    session: Arc<Mutex<Session>>,
    last_accessed: Instant,
    _permit: OwnedSemaphorePermit,
}

impl CacheEntry {
    fn new(session: Session, permit: OwnedSemaphorePermit) -> Self {
        Self { session: Arc::new(Mutex::new(session)), last_accessed: Instant::now(), _permit: permit }
    }

    /// Hand out a lease. Only called with the cache locked.
    fn lease(&mut self, now: Instant) -> SessionHandle {
        self.last_accessed = now;
        SessionHandle { session: self.session.clone() }
    }

    /// Some poll still holds a handle. New handles are only created under
    /// the cache lock, so this can only be stale in the conservative direction.
    fn is_leased(&self) -> bool {
        Arc::strong_count(&self.session) > 1
    }

    /// `None` while a request is in flight.
    fn idle_state(&self) -> Option<SessionState> {
        self.session.try_lock().ok().map(|s| s.state())
    }

    fn is_dead(&self) -> bool {
        self.idle_state() == Some(SessionState::Disconnected)
    }

    /// Live, and either leased or used within `ttl`.
    fn is_reusable(&self, now: Instant, ttl: Duration) -> bool {
        match self.idle_state() {
            None => true,
            Some(SessionState::Disconnected) => false,
            Some(_) => self.is_leased() || now.duration_since(self.last_accessed) < ttl,
        }
    }

    /// Nobody is using it, so it may be closed to free a slot.
    fn is_evictable(&self) -> bool {
        !self.is_leased() && self.idle_state().is_some()
    }

    async fn close(&self) {
        self.session.lock().await.close().await;
    }
}

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    config: ConnectionManagerConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Serializes connection attempts per address so concurrent callers share one `open()`.
    connect_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    slots: Arc<Semaphore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ConnectionManagerConfig) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Arc::new(Self {
            factory,
            config,
            cache: Mutex::new(HashMap::new()),
            connect_gates: Mutex::new(HashMap::new()),
            slots,
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    /// Return a live session for `address`, connecting if needed.
    pub async fn acquire(&self, address: &str) -> Result<SessionHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        if let Some(handle) = self.lookup(address).await {
            return Ok(handle);
        }

        let gate = self.connect_gate(address).await;
        let _connecting = gate.lock().await;
        // Someone else may have connected while we waited at the gate.
        if let Some(handle) = self.lookup(address).await {
            return Ok(handle);
        }

        let permit = self.reserve_slot().await?;
        let mut session = Session::new(address, self.factory.create(address), self.config.connect_timeout);
        session.open().await?;
        let mut entry = CacheEntry::new(session, permit);

        let mut cache = self.cache.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            drop(cache);
            entry.close().await;
            return Err(GatewayError::ShuttingDown);
        }
        if let Some(existing) = cache.get_mut(address) {
            if !existing.is_dead() {
                // Keep the session already cached, the new one is redundant.
                let existing = existing.lease(Instant::now());
                drop(cache);
                debug!("{address}: discarding redundant session");
                entry.close().await;
                return Ok(existing);
            }
        }
        let handle = entry.lease(Instant::now());
        let replaced = cache.insert(address.to_string(), entry);
        drop(cache);
        if let Some(replaced) = replaced {
            replaced.close().await;
        }
        Ok(handle)
    }

    /// Drop and close the session for `address` so the next acquire reconnects.
    pub async fn invalidate(&self, address: &str) {
        let removed = self.cache.lock().await.remove(address);
        self.connect_gates.lock().await.remove(address);
        if let Some(entry) = removed {
            info!("{address}: invalidating session");
            entry.close().await;
        }
    }

    /// Close and evict every session that expired or died. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<(String, CacheEntry)> = {
            let mut cache = self.cache.lock().await;
            let stale: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| !entry.is_reusable(now, self.config.cache_ttl))
                .map(|(address, _)| address.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|address| cache.remove(&address).map(|entry| (address, entry)))
                .collect()
        };

        for (address, entry) in &evicted {
            debug!("{address}: sweeping stale session");
            entry.close().await;
        }
        evicted.len()
    }

    /// Run [`Self::sweep`] every `sweep_interval` until shutdown.
    pub async fn start_sweeper(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let evicted = manager.sweep().await;
                if evicted > 0 {
                    info!("Swept {evicted} stale sessions");
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Stop the sweeper and close every session. Only ever called once.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }
        let entries: Vec<(String, CacheEntry)> = self.cache.lock().await.drain().collect();
        self.connect_gates.lock().await.clear();
        for (address, entry) in entries {
            if timeout(CLOSE_TIMEOUT, entry.close()).await.is_err() {
                warn!("{address}: session still busy at shutdown, abandoning it");
            }
        }
        self.slots.close();
        info!("Connection manager stopped");
    }

    pub async fn is_cached(&self, address: &str) -> bool {
        self.cache.lock().await.contains_key(address)
    }

    pub async fn cached_sessions(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// A fresh, live cached session. Dead or expired entries are evicted on the way.
    async fn lookup(&self, address: &str) -> Option<SessionHandle> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get_mut(address)?;
        let now = Instant::now();
        if entry.is_reusable(now, self.config.cache_ttl) {
            return Some(entry.lease(now));
        }
        let evicted = cache.remove(address);
        drop(cache);
        if let Some(evicted) = evicted {
            debug!("{address}: evicting stale cached session");
            evicted.close().await;
        }
        None
    }

    async fn connect_gate(&self, address: &str) -> Arc<Mutex<()>> {
        self.connect_gates
            .lock()
            .await
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take a link slot, evicting the least recently used unleased session if all are taken.
    async fn reserve_slot(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let victim = {
            let mut cache = self.cache.lock().await;
            let lru = cache
                .iter()
                .filter(|(_, entry)| entry.is_evictable())
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(address, _)| address.clone());
            lru.and_then(|address| cache.remove(&address).map(|entry| (address, entry)))
        };

        match victim {
            Some((address, entry)) => {
                debug!("{address}: evicting to free a connection slot");
                entry.close().await;
                drop(entry);
                self.slots.clone().try_acquire_owned().map_err(|_| GatewayError::NoConnectionSlot)
            }
            None => Err(GatewayError::NoConnectionSlot),
        }
    }
}
