use crate::analytics::{BurnRate, SessionInfo, TodaySummary, UsageService};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

/// Outbound half of a subscriber connection. Every subscriber in a tick gets
/// the same serialized payload.
pub type Outbound = mpsc::Sender<Arc<str>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Welcome {
        timestamp: DateTime<Utc>,
        message: String,
        broadcast_interval_seconds: u64,
    },
    RealtimeUpdate {
        timestamp: DateTime<Utc>,
        session: SessionInfo,
        today_stats: TodaySummary,
        burn_rate: BurnRate,
        recent_entries_count: usize,
    },
    Error {
        timestamp: DateTime<Utc>,
        error: String,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl BroadcastMessage {
    fn error(error: impl Into<String>) -> Self {
        Self::Error {
            timestamp: Utc::now(),
            error: error.into(),
        }
    }

    fn encode(&self) -> Arc<str> {
        match serde_json::to_string(self) {
            Ok(json) => Arc::from(json),
            Err(err) => {
                tracing::error!(error = %err, "failed to encode broadcast message");
                Arc::from(r#"{"type":"error","error":"encoding failed"}"#)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub pruned: usize,
}

struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Subscriber registry plus the periodic push worker.
pub struct BroadcastManager {
    usage: Arc<UsageService>,
    interval: Duration,
    send_timeout: Duration,
    subscribers: Mutex<HashMap<SubscriberId, Outbound>>,
    next_id: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl BroadcastManager {
    pub fn new(usage: Arc<UsageService>, interval: Duration, send_timeout: Duration) -> Self {
        Self {
            usage,
            interval,
            send_timeout,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Outbound>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber and greets it with a welcome message followed
    /// by a fresh snapshot.
    pub async fn connect(&self, sender: Outbound) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry().insert(id, sender);
        tracing::info!(subscriber = %id, total = self.subscriber_count(), "subscriber connected");

        let welcome = BroadcastMessage::Welcome {
            timestamp: Utc::now(),
            message: "Connected to realtime usage updates".to_string(),
            broadcast_interval_seconds: self.interval.as_secs(),
        };
        if self.send_to(id, welcome.encode()).await {
            let snapshot = self.snapshot().await;
            self.send_to(id, snapshot).await;
        }
        id
    }

    pub fn disconnect(&self, id: SubscriberId) {
        if self.registry().remove(&id).is_some() {
            tracing::info!(subscriber = %id, total = self.subscriber_count(), "subscriber disconnected");
        }
    }

    pub async fn handle_inbound(&self, id: SubscriberId, text: &str) {
        match text.trim() {
            "ping" => {
                let pong = BroadcastMessage::Pong {
                    timestamp: Utc::now(),
                };
                self.send_to(id, pong.encode()).await;
            }
            "refresh" => {
                self.usage.invalidate_realtime();
                let snapshot = self.snapshot().await;
                self.send_to(id, snapshot).await;
            }
            other => tracing::debug!(subscriber = %id, message = other, "ignoring inbound message"),
        }
    }

    /// Pushes one snapshot to everyone registered when the tick began.
    /// Subscribers whose send fails or times out are dropped afterwards.
    pub async fn tick(&self) -> TickReport {
        let targets: Vec<(SubscriberId, Outbound)> = self
            .registry()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        if targets.is_empty() {
            return TickReport::default();
        }

        let payload = self.snapshot().await;
        let timeout = self.send_timeout;
        let results = join_all(targets.into_iter().map(|(id, tx)| {
            let payload = payload.clone();
            async move { (id, tx.send_timeout(payload, timeout).await.is_ok()) }
        }))
        .await;

        let mut report = TickReport::default();
        let mut failed = Vec::new();
        for (id, ok) in results {
            if ok {
                report.delivered += 1;
            } else {
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            let mut registry = self.registry();
            for id in &failed {
                registry.remove(id);
            }
            report.pruned = failed.len();
            tracing::warn!(pruned = report.pruned, remaining = registry.len(), "dropped unreachable subscribers");
        }
        report
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.join.is_finished())
    }

    /// Spawns the periodic worker. Does nothing while one is already running.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|worker| !worker.join.is_finished()) {
            tracing::debug!("broadcast worker already running");
            return;
        }

        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { manager.run(token).await });
        *slot = Some(Worker { cancel, join });
        tracing::info!(interval_secs = self.interval.as_secs(), "broadcast worker started");
    }

    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        worker.cancel.cancel();
        if let Err(err) = worker.join.await {
            tracing::error!(error = %err, "broadcast worker ended abnormally");
        }
        tracing::info!("broadcast worker stopped");
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                report = self.tick() => {
                    if report.delivered > 0 || report.pruned > 0 {
                        tracing::debug!(delivered = report.delivered, pruned = report.pruned, "broadcast tick");
                    }
                }
            }
        }
    }

    async fn send_to(&self, id: SubscriberId, payload: Arc<str>) -> bool {
        let Some(tx) = self.registry().get(&id).cloned() else {
            return false;
        };
        if tx.send_timeout(payload, self.send_timeout).await.is_ok() {
            return true;
        }
        tracing::warn!(subscriber = %id, "send failed, dropping subscriber");
        self.disconnect(id);
        false
    }

    /// Serialized realtime update. The computation runs on the blocking pool;
    /// a panic there is reported to subscribers as an error message.
    async fn snapshot(&self) -> Arc<str> {
        let usage = Arc::clone(&self.usage);
        let message = match tokio::task::spawn_blocking(move || usage.realtime_usage()).await {
            Ok(realtime) => BroadcastMessage::RealtimeUpdate {
                timestamp: realtime.timestamp,
                today_stats: TodaySummary::from(&realtime.today_stats),
                recent_entries_count: realtime.recent_entries.len(),
                session: realtime.session,
                burn_rate: realtime.burn_rate,
            },
            Err(err) => {
                tracing::error!(error = %err, "realtime snapshot failed");
                BroadcastMessage::error(format!("snapshot failed: {err}"))
            }
        };
        message.encode()
    }
}
