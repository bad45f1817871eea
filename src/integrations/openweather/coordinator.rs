//! Poll coordinator: one shared fetch per tick, fanned out to every entity
//! of a config entry.
//!
//! Holds only the latest snapshot. At most one fetch is in flight at a time;
//! a refresh requested while another is running is skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use super::client::{ApiError, WeatherApi};

/// Upper bound on a single fetch.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What entities read. Replaced as a whole after every completed fetch.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Latest successful payload; survives later failures.
    pub data: Option<Arc<Value>>,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Number of completed fetches, success or not.
    pub sequence: u64,
}

/// Result of one [`Coordinator::refresh`] call.
#[derive(Debug)]
pub enum RefreshOutcome {
    Updated,
    Failed(ApiError),
    /// Another fetch was already in flight.
    Skipped,
}

impl RefreshOutcome {
    /// The host must stop polling and ask the user for a new key.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, RefreshOutcome::Failed(e) if e.is_auth())
    }
}

/// Why the first refresh of a config entry did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("not ready: {0}")]
    NotReady(String),
}

/// Resets the in-flight flag even when the refresh future is dropped.
struct FetchGuard<'a>(&'a AtomicBool);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Coordinator {
    name: String,
    api: Arc<dyn WeatherApi>,
    update_interval: Duration,
    request_timeout: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    fetching: AtomicBool,
    fetches: AtomicU64,
    updates: broadcast::Sender<Arc<Snapshot>>,
}

impl Coordinator {
    pub fn new(name: impl Into<String>, api: Arc<dyn WeatherApi>, update_interval: Duration) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            api,
            update_interval,
            request_timeout: REQUEST_TIMEOUT,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            fetching: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
            updates,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    /// Latest completed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetches started since construction.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Notified with every new snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.updates.subscribe()
    }

    /// Run one fetch unless one is already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        if self
            .fetching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(coordinator = %self.name, "Fetch already in flight, skipping tick");
            return RefreshOutcome::Skipped;
        }
        let _guard = FetchGuard(&self.fetching);
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.request_timeout, self.api.fetch_data()).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.request_timeout)),
        };

        let previous = self.snapshot();
        let (next, outcome) = match result {
            Ok(data) => {
                tracing::debug!(coordinator = %self.name, "Fetched One Call data");
                let next = Snapshot {
                    data: Some(Arc::new(data)),
                    last_update_success: true,
                    last_error: None,
                    last_updated: Some(Utc::now()),
                    sequence: previous.sequence + 1,
                };
                (next, RefreshOutcome::Updated)
            }
            Err(e) => {
                if e.is_auth() {
                    tracing::error!(coordinator = %self.name, error = %e, "One Call rejected the API key");
                } else if previous.last_update_success {
                    tracing::warn!(coordinator = %self.name, error = %e, "One Call update failed");
                } else {
                    tracing::debug!(coordinator = %self.name, error = %e, "One Call update still failing");
                }
                let next = Snapshot {
                    data: previous.data.clone(),
                    last_update_success: false,
                    last_error: Some(e.to_string()),
                    last_updated: previous.last_updated,
                    sequence: previous.sequence + 1,
                };
                (next, RefreshOutcome::Failed(e))
            }
        };

        let next = Arc::new(next);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        let _ = self.updates.send(next);

        outcome
    }

    /// Refresh run once at setup. Any failure keeps the entry from loading.
    pub async fn first_refresh(&self) -> Result<(), SetupError> {
        match self.refresh().await {
            RefreshOutcome::Updated => Ok(()),
            RefreshOutcome::Failed(e) if e.is_auth() => Err(SetupError::AuthFailed),
            RefreshOutcome::Failed(e) => Err(SetupError::NotReady(e.to_string())),
            RefreshOutcome::Skipped => Err(SetupError::NotReady("refresh already in progress".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Replays scripted results, optionally after a delay.
    struct ScriptedApi {
        script: Mutex<VecDeque<Result<Value, ApiError>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(script: Vec<Result<Value, ApiError>>) -> Arc<Self> {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay(script: Vec<Result<Value, ApiError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherApi for ScriptedApi {
        async fn fetch_data(&self) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ApiError::Status(599)))
        }
    }

    fn coordinator(api: Arc<ScriptedApi>) -> Coordinator {
        Coordinator::new("Home", api, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn test_success_stores_payload() {
        let api = ScriptedApi::new(vec![Ok(json!({"current": {"temp": 21.5}}))]);
        let c = coordinator(api.clone());
        let mut rx = c.subscribe();

        assert!(matches!(c.refresh().await, RefreshOutcome::Updated));
        let snap = c.snapshot();
        assert!(snap.last_update_success);
        assert_eq!(snap.data.as_ref().unwrap()["current"]["temp"], 21.5);
        assert_eq!(snap.sequence, 1);
        assert!(rx.recv().await.unwrap().last_update_success);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_share_one_fetch() {
        let api = ScriptedApi::with_delay(
            vec![Ok(json!({"current": {}})), Ok(json!({"current": {}}))],
            Duration::from_millis(100),
        );
        let c = coordinator(api.clone());

        let (a, b) = tokio::join!(c.refresh(), c.refresh());
        assert!(matches!(a, RefreshOutcome::Updated));
        assert!(matches!(b, RefreshOutcome::Skipped));
        assert_eq!(api.calls(), 1);
        assert_eq!(c.fetch_count(), 1);

        // Guard released: the next tick fetches again.
        assert!(matches!(c.refresh().await, RefreshOutcome::Updated));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_first_refresh_failure_is_not_ready_and_publishes_nothing() {
        let api = ScriptedApi::new(vec![Err(ApiError::Status(500))]);
        let c = coordinator(api);

        let err = c.first_refresh().await.unwrap_err();
        assert!(matches!(err, SetupError::NotReady(_)));
        let snap = c.snapshot();
        assert!(snap.data.is_none());
        assert!(!snap.last_update_success);
    }

    #[tokio::test]
    async fn test_first_refresh_auth_failure() {
        let api = ScriptedApi::new(vec![Err(ApiError::Auth)]);
        let c = coordinator(api);
        assert!(matches!(c.first_refresh().await, Err(SetupError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_steady_state_failure_keeps_previous_payload() {
        let api = ScriptedApi::new(vec![
            Ok(json!({"current": {"temp": 18.0}})),
            Err(ApiError::Status(502)),
        ]);
        let c = coordinator(api);

        c.first_refresh().await.unwrap();
        let outcome = c.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Failed(ApiError::Status(502))));
        assert!(!outcome.requires_reauth());

        let snap = c.snapshot();
        assert!(!snap.last_update_success);
        assert_eq!(snap.data.as_ref().unwrap()["current"]["temp"], 18.0);
        assert!(snap.last_error.as_deref().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn test_steady_state_auth_failure_requires_reauth() {
        let api = ScriptedApi::new(vec![Ok(json!({})), Err(ApiError::Auth)]);
        let c = coordinator(api);

        c.first_refresh().await.unwrap();
        let outcome = c.refresh().await;
        assert!(outcome.requires_reauth());
        assert!(!c.snapshot().last_update_success);
    }

    #[tokio::test]
    async fn test_timeout_is_transport_failure() {
        let api = ScriptedApi::with_delay(vec![Ok(json!({}))], Duration::from_millis(200));
        let c = coordinator(api).with_request_timeout(Duration::from_millis(20));

        let outcome = c.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Failed(ApiError::Timeout(_))));
        assert!(!outcome.requires_reauth());
        assert!(c.snapshot().data.is_none());

        // The timed-out fetch released the guard.
        assert!(!c.fetching.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recovery_after_failure() {
        let api = ScriptedApi::new(vec![
            Ok(json!({"current": {"temp": 1.0}})),
            Err(ApiError::Status(500)),
            Ok(json!({"current": {"temp": 2.0}})),
        ]);
        let c = coordinator(api);

        c.refresh().await;
        c.refresh().await;
        assert!(matches!(c.refresh().await, RefreshOutcome::Updated));

        let snap = c.snapshot();
        assert!(snap.last_update_success);
        assert!(snap.last_error.is_none());
        assert_eq!(snap.data.as_ref().unwrap()["current"]["temp"], 2.0);
        assert_eq!(snap.sequence, 3);
    }
}
