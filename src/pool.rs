//! `ConnectionPool`: per-server pool of `ServerClient` connections with
//! min/max sizing, a FIFO waiter queue, idle reclamation, and periodic
//! health checks (spec §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerStatus};
use crate::client::{ServerClient, ServerStatus};
use crate::config::{PoolConfig, ServerConfig};
use crate::error::GatewayError;
use crate::events::{Event, EventPayload, SharedEventSink};

/// A connection handed out by `acquire`. Callers must pass
/// `connection_id` back to `release` exactly once.
pub struct PooledConnectionHandle {
    pub connection_id: u64,
    pub client: Arc<ServerClient>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub waiting_requests: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub average_wait_time_ms: f64,
}

struct PooledConnection {
    client: Arc<ServerClient>,
    in_use: bool,
    health_check_failures: u32,
    idle_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    failed_requests: u64,
    total_wait_ms: u64,
}

struct ServerPool {
    config: ServerConfig,
    pool_config: PoolConfig,
    breaker: Arc<CircuitBreaker>,
    connections: Mutex<HashMap<u64, PooledConnection>>,
    next_conn_id: AtomicU64,
    next_waiter_id: AtomicU64,
    waiters: Mutex<VecDeque<(u64, oneshot::Sender<u64>)>>,
    stats: Mutex<StatsInner>,
    health_check_task: Mutex<Option<JoinHandle<()>>>,
    events: SharedEventSink,
}

impl ServerPool {
    fn new(config: ServerConfig, pool_config: PoolConfig, events: SharedEventSink) -> Arc<Self> {
        Arc::new(ServerPool {
            breaker: Arc::new(CircuitBreaker::new(config.name.clone(), pool_config.circuit_breaker.clone())),
            config,
            pool_config,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            next_waiter_id: AtomicU64::new(0),
            waiters: Mutex::new(VecDeque::new()),
            stats: Mutex::new(StatsInner::default()),
            health_check_task: Mutex::new(None),
            events,
        })
    }

    async fn create_connection(self: &Arc<Self>, in_use: bool) -> crate::Result<u64> {
        let client = Arc::new(ServerClient::new(self.config.clone(), self.breaker.clone(), self.events.clone()));
        client.connect().await?;
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().await.insert(
            id,
            PooledConnection {
                client,
                in_use,
                health_check_failures: 0,
                idle_timer: None,
            },
        );
        self.events.emit(Event::new(
            "pool",
            EventPayload::ConnectionCreated { server_id: self.config.name.clone(), connection_id: id },
        ));
        Ok(id)
    }

    async fn acquire(self: &Arc<Self>, timeout_ms: u64) -> crate::Result<PooledConnectionHandle> {
        let start = Instant::now();
        loop {
            {
                let mut conns = self.connections.lock().await;
                let idle_id = conns.iter().find(|(_, c)| !c.in_use).map(|(id, _)| *id);
                if let Some(id) = idle_id {
                    let conn = conns.get_mut(&id).unwrap();
                    conn.in_use = true;
                    if let Some(timer) = conn.idle_timer.take() {
                        timer.abort();
                    }
                    let client = conn.client.clone();
                    drop(conns);
                    self.record_acquire(start.elapsed()).await;
                    self.events.emit(Event::new(
                        "pool",
                        EventPayload::ConnectionAcquired { server_id: self.config.name.clone(), connection_id: id },
                    ));
                    return Ok(PooledConnectionHandle { connection_id: id, client });
                }
            }

            let can_grow = self.connections.lock().await.len() < self.pool_config.max_connections;
            if can_grow {
                match self.create_connection(true).await {
                    Ok(id) => {
                        let client = self.connections.lock().await.get(&id).unwrap().client.clone();
                        self.record_acquire(start.elapsed()).await;
                        return Ok(PooledConnectionHandle { connection_id: id, client });
                    }
                    Err(e) => {
                        self.record_failed().await;
                        return Err(e);
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let waiter_token = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
            self.waiters.lock().await.push_back((waiter_token, tx));
            self.events
                .emit(Event::new("pool", EventPayload::PoolFull { server_id: self.config.name.clone() }));

            let elapsed_ms = start.elapsed().as_millis() as u64;
            let remaining = Duration::from_millis(timeout_ms.saturating_sub(elapsed_ms));

            match tokio::time::timeout(remaining, rx).await {
                Ok(Ok(id)) => {
                    let client = { self.connections.lock().await.get(&id).map(|c| c.client.clone()) };
                    if let Some(client) = client {
                        self.record_acquire(start.elapsed()).await;
                        return Ok(PooledConnectionHandle { connection_id: id, client });
                    }
                    continue; // handed-off connection vanished; retry from the top
                }
                Ok(Err(_)) => {
                    return Err(GatewayError::Lifecycle(format!("pool for '{}' is closing", self.config.name)));
                }
                Err(_) => {
                    self.waiters.lock().await.retain(|(tok, _)| *tok != waiter_token);
                    self.record_failed().await;
                    return Err(GatewayError::Capacity(self.config.name.clone(), "connection acquire timed out".into()));
                }
            }
        }
    }

    async fn release(self: &Arc<Self>, connection_id: u64) {
        let waiter = self.waiters.lock().await.pop_front();
        if let Some((_, tx)) = waiter {
            let mut conns = self.connections.lock().await;
            if let Some(conn) = conns.get_mut(&connection_id) {
                conn.in_use = true;
            }
            drop(conns);
            if tx.send(connection_id).is_ok() {
                self.events.emit(Event::new(
                    "pool",
                    EventPayload::ConnectionAcquired { server_id: self.config.name.clone(), connection_id },
                ));
                return;
            }
        }

        let mut conns = self.connections.lock().await;
        if let Some(conn) = conns.get_mut(&connection_id) {
            conn.in_use = false;
            let timer = start_idle_timer(self.clone(), connection_id);
            conn.idle_timer = Some(timer);
        }
        drop(conns);
        self.events
            .emit(Event::new("pool", EventPayload::ConnectionReleased { server_id: self.config.name.clone(), connection_id }));
    }

    async fn evict_if_idle(self: &Arc<Self>, connection_id: u64) {
        let mut conns = self.connections.lock().await;
        if conns.len() <= self.pool_config.min_connections {
            return;
        }
        let still_idle = conns.get(&connection_id).map(|c| !c.in_use).unwrap_or(false);
        if !still_idle {
            return;
        }
        if let Some(conn) = conns.remove(&connection_id) {
            drop(conns);
            conn.client.disconnect().await;
            self.events
                .emit(Event::new("pool", EventPayload::ConnectionClosed { server_id: self.config.name.clone(), connection_id }));
        }
    }

    async fn record_acquire(&self, wait: Duration) {
        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;
        stats.total_wait_ms += wait.as_millis() as u64;
    }

    async fn record_failed(&self) {
        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;
        stats.failed_requests += 1;
    }

    async fn snapshot_stats(&self) -> PoolStats {
        let conns = self.connections.lock().await;
        let total = conns.len();
        let active = conns.values().filter(|c| c.in_use).count();
        drop(conns);
        let waiting = self.waiters.lock().await.len();
        let stats = self.stats.lock().await;
        let average_wait_time_ms = if stats.total_requests > 0 {
            stats.total_wait_ms as f64 / stats.total_requests as f64
        } else {
            0.0
        };
        PoolStats {
            total_connections: total,
            active_connections: active,
            idle_connections: total - active,
            waiting_requests: waiting,
            total_requests: stats.total_requests,
            failed_requests: stats.failed_requests,
            average_wait_time_ms,
        }
    }

    async fn has_available_connection(&self) -> bool {
        let conns = self.connections.lock().await;
        let has_idle = conns.values().any(|c| !c.in_use);
        let has_room = conns.len() < self.pool_config.max_connections;
        has_idle || has_room
    }

    async fn run_health_check(self: &Arc<Self>) {
        let ids: Vec<u64> = {
            let conns = self.connections.lock().await;
            conns.iter().filter(|(_, c)| !c.in_use).map(|(id, _)| *id).collect()
        };

        for id in ids {
            let healthy = {
                let conns = self.connections.lock().await;
                match conns.get(&id) {
                    Some(c) => Some(c.client.is_connected().await),
                    None => None,
                }
            };
            let Some(healthy) = healthy else { continue };

            if healthy {
                self.events
                    .emit(Event::new("pool", EventPayload::HealthCheckPassed { server_id: self.config.name.clone(), connection_id: id }));
                if let Some(c) = self.connections.lock().await.get_mut(&id) {
                    c.health_check_failures = 0;
                }
                continue;
            }

            self.events
                .emit(Event::new("pool", EventPayload::HealthCheckFailed { server_id: self.config.name.clone(), connection_id: id }));

            let should_evict = {
                let mut conns = self.connections.lock().await;
                match conns.get_mut(&id) {
                    Some(c) => {
                        c.health_check_failures += 1;
                        c.health_check_failures >= self.pool_config.max_retries
                    }
                    None => false,
                }
            };

            if should_evict {
                let removed = self.connections.lock().await.remove(&id);
                if let Some(conn) = removed {
                    conn.client.disconnect().await;
                    self.events
                        .emit(Event::new("pool", EventPayload::ConnectionClosed { server_id: self.config.name.clone(), connection_id: id }));
                }
                let below_min = self.connections.lock().await.len() < self.pool_config.min_connections;
                if below_min {
                    let _ = self.create_connection(false).await;
                }
            }
        }
    }

    /// Gate on the breaker's transition logic (not just its stored state):
    /// admits the call when CLOSED, transitions OPEN → HALF_OPEN and admits
    /// a trial once `resetTimeout` has elapsed, and otherwise fails fast.
    async fn try_acquire_breaker(&self) -> crate::Result<()> {
        self.breaker.try_acquire().await
    }

    async fn close(self: &Arc<Self>) {
        if let Some(handle) = self.health_check_task.lock().await.take() {
            handle.abort();
        }
        let waiters: VecDeque<(u64, oneshot::Sender<u64>)> = std::mem::take(&mut *self.waiters.lock().await);
        drop(waiters); // dropping senders fails any in-flight `acquire` with "pool closing"

        let conns: HashMap<u64, PooledConnection> = std::mem::take(&mut *self.connections.lock().await);
        for (_, conn) in conns {
            if let Some(timer) = conn.idle_timer {
                timer.abort();
            }
            conn.client.disconnect().await;
        }
    }
}

fn start_idle_timer(pool: Arc<ServerPool>, connection_id: u64) -> JoinHandle<()> {
    let idle_timeout = Duration::from_millis(pool.pool_config.idle_timeout_ms);
    tokio::spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        pool.evict_if_idle(connection_id).await;
    })
}

fn spawn_health_check(pool: Arc<ServerPool>) -> JoinHandle<()> {
    let interval = Duration::from_millis(pool.pool_config.health_check_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            pool.run_health_check().await;
        }
    })
}

/// Owns one `ServerPool` per configured server.
pub struct ConnectionPool {
    pools: DashMap<String, Arc<ServerPool>>,
    pool_config: PoolConfig,
    events: SharedEventSink,
}

impl ConnectionPool {
    pub fn new(pool_config: PoolConfig, events: SharedEventSink) -> Self {
        ConnectionPool { pools: DashMap::new(), pool_config, events }
    }

    /// Eagerly create `min_connections` and start the periodic health check.
    pub async fn initialize_server(&self, config: ServerConfig) -> crate::Result<()> {
        let server_id = config.name.clone();
        let pool = ServerPool::new(config, self.pool_config.clone(), self.events.clone());
        self.pools.insert(server_id.clone(), pool.clone());

        for _ in 0..self.pool_config.min_connections {
            pool.create_connection(false).await?;
        }

        let handle = spawn_health_check(pool.clone());
        *pool.health_check_task.lock().await = Some(handle);

        self.events
            .emit(Event::new("pool", EventPayload::ComponentInitialized { component: format!("pool:{server_id}") }));
        Ok(())
    }

    pub async fn acquire(&self, server_id: &str, timeout_ms: u64) -> crate::Result<PooledConnectionHandle> {
        let pool = self
            .pools
            .get(server_id)
            .map(|e| e.clone())
            .ok_or_else(|| GatewayError::Lifecycle(format!("no pool initialized for server '{server_id}'")))?;
        pool.acquire(timeout_ms).await
    }

    pub async fn release(&self, server_id: &str, connection_id: u64) {
        if let Some(pool) = self.pools.get(server_id).map(|e| e.clone()) {
            pool.release(connection_id).await;
        }
    }

    pub async fn has_available_connection(&self, server_id: &str) -> bool {
        match self.pools.get(server_id).map(|e| e.clone()) {
            Some(pool) => pool.has_available_connection().await,
            None => false,
        }
    }

    pub async fn stats(&self, server_id: &str) -> Option<PoolStats> {
        let pool = self.pools.get(server_id)?.clone();
        Some(pool.snapshot_stats().await)
    }

    pub async fn server_status(&self, server_id: &str) -> Option<ServerStatus> {
        let pool = self.pools.get(server_id)?.clone();
        let conns = pool.connections.lock().await;
        let any_connected = !conns.is_empty();
        drop(conns);
        let breaker_state = pool.breaker.state().await;
        Some(ServerStatus {
            server_id: server_id.to_string(),
            status: if any_connected {
                crate::client::ServerConnectionStatus::Connected
            } else if breaker_state == BreakerState::Open {
                crate::client::ServerConnectionStatus::Error
            } else {
                crate::client::ServerConnectionStatus::Disconnected
            },
            last_connected: None,
            last_error: None,
            tool_count: 0,
            response_time_ms: None,
        })
    }

    pub async fn circuit_breaker_state(&self, server_id: &str) -> Option<BreakerState> {
        let pool = self.pools.get(server_id)?.clone();
        Some(pool.breaker.state().await)
    }

    pub async fn circuit_breaker_status(&self, server_id: &str) -> Option<CircuitBreakerStatus> {
        let pool = self.pools.get(server_id)?.clone();
        Some(pool.breaker.snapshot().await)
    }

    /// Gate a call on the server's breaker, honoring the OPEN → HALF_OPEN
    /// transition once `resetTimeout` has elapsed (spec §4.4). Returns
    /// `Err(GatewayError::CircuitOpen)` when the call should fail fast.
    pub async fn try_acquire_breaker(&self, server_id: &str) -> crate::Result<()> {
        let pool = self
            .pools
            .get(server_id)
            .map(|e| e.clone())
            .ok_or_else(|| GatewayError::Lifecycle(format!("no pool initialized for server '{server_id}'")))?;
        pool.try_acquire_breaker().await
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn close_server(&self, server_id: &str) {
        if let Some((_, pool)) = self.pools.remove(server_id) {
            pool.close().await;
        }
    }

    pub async fn close_all(&self) {
        let server_ids = self.server_ids();
        for server_id in server_ids {
            self.close_server(&server_id).await;
        }
    }
}
