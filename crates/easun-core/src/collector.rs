use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::client::InverterClient;
use crate::config::CollectorConfig;
use crate::error::ClientError;
use crate::snapshot::TelemetrySnapshot;

pub trait SnapshotObserver: Send + Sync {
    fn on_updated(&self, snapshot: &TelemetrySnapshot);
}

impl<F> SnapshotObserver for F
where
    F: Fn(&TelemetrySnapshot) + Send + Sync,
{
    fn on_updated(&self, snapshot: &TelemetrySnapshot) {
        self(snapshot)
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Updated(Arc<TelemetrySnapshot>),
    /// Another refresh holds the lock; its result will be published instead.
    InFlight,
    BackingOff { retry_in: Duration },
    Failed { error: ClientError, retry_in: Duration },
}

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct PollState {
    consecutive_failures: u32,
    last_attempt: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_not_before: Option<Instant>,
}

/// `min(cap, base * 2^failures)`
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DataCollector<C: InverterClient> {
    /// Doubles as the update lock: whoever holds the client is refreshing.
    client: tokio::sync::Mutex<C>,
    model: String,
    config: CollectorConfig,
    state: Mutex<PollState>,
    latest: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    observers: Mutex<Vec<Arc<dyn SnapshotObserver>>>,
}

impl<C: InverterClient> DataCollector<C> {
    pub fn new(client: C, config: CollectorConfig) -> Self {
        let model = client.model().to_string();
        let (latest, _) = watch::channel(None);
        info!(%model, poll_interval = ?config.poll_interval, "data collector initialized");
        Self {
            client: tokio::sync::Mutex::new(client),
            model,
            config,
            state: Mutex::new(PollState::default()),
            latest,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.latest.subscribe()
    }

    pub fn register_observer(&self, observer: impl SnapshotObserver + 'static) {
        lock(&self.observers).push(Arc::new(observer));
    }

    pub fn status(&self) -> PollStatus {
        let state = lock(&self.state);
        let now = Instant::now();
        PollStatus {
            consecutive_failures: state.consecutive_failures,
            last_attempt: state.last_attempt,
            last_success: state.last_success,
            last_error: state.last_error.clone(),
            retry_in: state
                .retry_not_before
                .filter(|at| *at > now)
                .map(|at| at - now),
        }
    }

    /// Runs one refresh unless one is already running, in which case this
    /// returns immediately without queuing.
    pub async fn request_refresh(&self) -> RefreshOutcome {
        let Ok(mut client) = self.client.try_lock() else {
            debug!(model = %self.model, "refresh already in flight");
            return RefreshOutcome::InFlight;
        };

        {
            let mut state = lock(&self.state);
            let now = Instant::now();
            if let Some(not_before) = state.retry_not_before.filter(|at| *at > now) {
                let retry_in = not_before - now;
                debug!(model = %self.model, ?retry_in, "backing off");
                return RefreshOutcome::BackingOff { retry_in };
            }
            state.last_attempt = Some(Utc::now());
        }

        debug!(model = %self.model, "starting data update");
        let fetch_timeout = self.config.fetch_timeout;
        let result = match timeout(fetch_timeout, client.fetch()).await {
            Ok(Ok(parts)) => parts.into_snapshot(&self.model, Utc::now()),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                error!(model = %self.model, ?fetch_timeout, "update timed out, cancelling");
                Err(ClientError::Timeout(fetch_timeout))
            }
        };
        if result.is_err() {
            client.close().await;
        }

        // Poll state must be settled before the next caller can take the lock.
        let outcome = match result {
            Ok(snapshot) => RefreshOutcome::Updated(self.publish(snapshot)),
            Err(error) => {
                let retry_in = self.record_failure(&error);
                RefreshOutcome::Failed { error, retry_in }
            }
        };
        drop(client);
        outcome
    }

    fn publish(&self, snapshot: TelemetrySnapshot) -> Arc<TelemetrySnapshot> {
        {
            let mut state = lock(&self.state);
            state.consecutive_failures = 0;
            state.last_success = Some(snapshot.captured_at);
            state.last_error = None;
            state.retry_not_before = None;
        }

        let snapshot = Arc::new(snapshot);
        self.latest.send_replace(Some(Arc::clone(&snapshot)));
        let observers: Vec<Arc<dyn SnapshotObserver>> = lock(&self.observers).clone();
        for observer in &observers {
            observer.on_updated(&snapshot);
        }
        debug!(model = %self.model, observers = observers.len(), "published snapshot");
        snapshot
    }

    fn record_failure(&self, error: &ClientError) -> Duration {
        let mut state = lock(&self.state);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = backoff_delay(
            state.consecutive_failures,
            self.config.backoff_base,
            self.config.backoff_cap,
        );
        state.retry_not_before = Some(Instant::now() + delay);
        state.last_error = Some(error.to_string());

        error!(
            model = %self.model,
            attempt = state.consecutive_failures,
            %error,
            "error updating data"
        );
        warn!(model = %self.model, retry_in = ?delay, "retry scheduled");
        delay
    }
}
