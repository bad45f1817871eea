//! Config entry lifecycle
//!
//! Each entry is one configured location. Setting an entry up builds its
//! coordinator and entity platform, then spawns:
//! - the entry task: first refresh (retried with backoff while not ready),
//!   then the poll timer
//! - the listener task: re-renders entities on every coordinator snapshot
//!
//! Unloading aborts both tasks and removes the entry's entities.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::integrations::openweather::client::OneCallClient;
use crate::integrations::openweather::config_flow::{
    self, FlowError, OptionsInput, ReauthInput, UserInput,
};
use crate::integrations::openweather::coordinator::{
    Coordinator, RefreshOutcome, SetupError, Snapshot, REQUEST_TIMEOUT,
};
use crate::integrations::openweather::{
    interval, DeviceInfo, EntityRef, EntityScope, LocationConfig, Platform, API_ENDPOINT, DOMAIN,
};
use crate::state::StateMachine;
use crate::storage::{self, EntryStore};

const REAUTH_REQUIRED: &str = "reauth_required";

/// A persisted config entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub unique_id: String,
    pub data: UserInput,
    #[serde(default)]
    pub options: OptionsInput,
    pub created_at: DateTime<Utc>,
}

impl ConfigEntry {
    pub fn new(entry_id: String, data: UserInput) -> Self {
        Self {
            entry_id,
            domain: DOMAIN.to_string(),
            title: data.name.clone(),
            unique_id: config_flow::unique_id(data.latitude, data.longitude),
            data,
            options: OptionsInput::default(),
            created_at: Utc::now(),
        }
    }

    /// Options take precedence over the value given at setup.
    pub fn max_daily_requests(&self) -> i64 {
        self.options
            .max_daily_requests
            .unwrap_or(self.data.max_daily_requests)
    }

    pub fn location(&self) -> LocationConfig {
        LocationConfig {
            name: self.data.name.clone(),
            api_key: self.data.api_key.clone(),
            latitude: self.data.latitude,
            longitude: self.data.longitude,
            max_daily_requests: self.max_daily_requests(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// First refresh failed; setup is retried with backoff.
    SetupRetry,
    /// Terminal until the user acts (e.g. reauth).
    SetupError,
}

/// Host-side knobs for every One Call entry.
#[derive(Debug, Clone)]
pub struct IntegrationSettings {
    pub api_endpoint: String,
    pub time_zone: Tz,
    pub request_timeout: Duration,
    pub setup_retry_initial: Duration,
    pub setup_retry_max: Duration,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            api_endpoint: API_ENDPOINT.to_string(),
            time_zone: chrono_tz::UTC,
            request_timeout: REQUEST_TIMEOUT,
            setup_retry_initial: Duration::from_secs(5),
            setup_retry_max: Duration::from_secs(300),
        }
    }
}

struct EntryRuntime {
    state: EntryState,
    reason: Option<String>,
    coordinator: Arc<Coordinator>,
    /// Entity id prefix, unique across loaded entries.
    slug: String,
    entities: Vec<EntityRef>,
    tasks: Vec<JoinHandle<()>>,
}

/// What the REST API shows for an entry. Never carries the API key.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub unique_id: String,
    pub state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub max_daily_requests: i64,
    pub update_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub fetch_count: u64,
    pub device: DeviceInfo,
    pub entities: Vec<EntityRef>,
}

/// Owns every config entry and its runtime. Built once in `main` and
/// shared through `AppState`.
pub struct ConfigEntries {
    store: EntryStore,
    entries: DashMap<String, ConfigEntry>,
    runtime: DashMap<String, EntryRuntime>,
    /// Held while a runtime is claimed so slug choice and insert are atomic.
    setup_lock: Mutex<()>,
    http: reqwest::Client,
    states: Arc<StateMachine>,
    settings: IntegrationSettings,
}

impl ConfigEntries {
    pub fn new(
        store: EntryStore,
        http: reqwest::Client,
        states: Arc<StateMachine>,
        settings: IntegrationSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            entries: DashMap::new(),
            runtime: DashMap::new(),
            setup_lock: Mutex::new(()),
            http,
            states,
            settings,
        })
    }

    /// Read persisted entries into memory. Does not set them up.
    pub fn load_persisted(&self) -> anyhow::Result<usize> {
        let entries = self.store.load_all()?;
        let count = entries.len();
        for entry in entries {
            self.entries.insert(entry.entry_id.clone(), entry);
        }
        Ok(count)
    }

    /// Persist locations from the host config that are not configured yet.
    /// Credentials are not checked here; a bad key surfaces at setup.
    pub fn import(&self, locations: Vec<UserInput>) -> usize {
        let mut imported = 0;
        for input in locations {
            if let Err(e) = config_flow::check_form(&input) {
                tracing::warn!(name = %input.name, error = %e, "Skipping invalid location in config");
                continue;
            }
            let unique_id = config_flow::unique_id(input.latitude, input.longitude);
            if self.find_unique(&unique_id).is_some() {
                continue;
            }
            let entry = ConfigEntry::new(uuid::Uuid::new_v4().to_string(), input);
            match self.store.upsert(&entry) {
                Ok(()) => {
                    tracing::info!(entry_id = %entry.entry_id, title = %entry.title, "Imported location");
                    self.entries.insert(entry.entry_id.clone(), entry);
                    imported += 1;
                }
                Err(e) => tracing::error!(title = %entry.title, error = %e, "Failed to import location"),
            }
        }
        imported
    }

    /// Set up every entry, oldest first, so slug suffixes are stable.
    pub fn setup_all(self: &Arc<Self>) {
        for id in self.ids_by_age() {
            if let Err(e) = self.setup(&id) {
                tracing::error!(entry_id = %id, error = %e, "Setup failed");
            }
        }
    }

    /// Build the entry's coordinator and entities and start its tasks.
    pub fn setup(self: &Arc<Self>, entry_id: &str) -> Result<(), FlowError> {
        let entry = self
            .entries
            .get(entry_id)
            .map(|e| e.value().clone())
            .ok_or(FlowError::UnknownEntry)?;
        let location = entry.location();
        let poll_interval = interval::update_interval(location.max_daily_requests);
        let (coordinator, platform) = {
            let _claim = self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.runtime.contains_key(entry_id) {
                return Ok(());
            }

            let api = Arc::new(OneCallClient::new(
                self.http.clone(),
                self.settings.api_endpoint.clone(),
                &location,
            ));
            let coordinator = Arc::new(
                Coordinator::new(entry.title.clone(), api, poll_interval)
                    .with_request_timeout(self.settings.request_timeout),
            );
            let scope = self.free_scope(EntityScope::new(&entry.entry_id, &location.name));
            let platform = Arc::new(Platform::new(&scope, self.settings.time_zone));

            self.runtime.insert(
                entry.entry_id.clone(),
                EntryRuntime {
                    state: EntryState::SetupInProgress,
                    reason: None,
                    coordinator: coordinator.clone(),
                    slug: scope.slug,
                    entities: platform.entities(),
                    tasks: Vec::new(),
                },
            );
            (coordinator, platform)
        };

        tracing::info!(
            entry_id = %entry.entry_id,
            title = %entry.title,
            interval_secs = poll_interval.as_secs(),
            "Setting up One Call entry"
        );

        let manager = self.clone();
        let id = entry.entry_id.clone();
        let owner = coordinator.clone();
        let handle = tokio::spawn(async move {
            manager.run_entry(id, coordinator, platform).await;
        });
        self.push_task(&entry.entry_id, &owner, handle);
        Ok(())
    }

    async fn run_entry(self: Arc<Self>, entry_id: String, coordinator: Arc<Coordinator>, platform: Arc<Platform>) {
        let mut retry_delay = self.settings.setup_retry_initial;
        loop {
            match coordinator.first_refresh().await {
                Ok(()) => break,
                Err(SetupError::AuthFailed) => {
                    tracing::warn!(entry_id = %entry_id, "API key rejected during setup, reauthentication required");
                    self.set_state(&entry_id, &coordinator, EntryState::SetupError, Some(REAUTH_REQUIRED.to_string()));
                    return;
                }
                Err(SetupError::NotReady(reason)) => {
                    tracing::warn!(
                        entry_id = %entry_id,
                        reason = %reason,
                        "Entry not ready, retrying setup in {}s",
                        retry_delay.as_secs_f32()
                    );
                    self.set_state(&entry_id, &coordinator, EntryState::SetupRetry, Some(reason));
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(self.settings.setup_retry_max);
                }
            }
        }

        let updates = coordinator.subscribe();
        platform.publish(&self.states, &coordinator.snapshot());
        let listener = tokio::spawn(forward_updates(
            updates,
            coordinator.clone(),
            platform,
            self.states.clone(),
        ));
        self.push_task(&entry_id, &coordinator, listener);
        self.set_state(&entry_id, &coordinator, EntryState::Loaded, None);
        tracing::info!(entry_id = %entry_id, "One Call entry loaded");

        let period = coordinator.update_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.entry_state(&entry_id) != Some(EntryState::Loaded) {
                break;
            }
            let outcome = coordinator.refresh().await;
            if outcome.requires_reauth() {
                self.set_state(&entry_id, &coordinator, EntryState::SetupError, Some(REAUTH_REQUIRED.to_string()));
                break;
            }
        }
        tracing::info!(entry_id = %entry_id, "Polling stopped");
    }

    /// Stop the entry's tasks and drop its entities. The entry stays configured.
    pub async fn unload(&self, entry_id: &str) -> bool {
        let Some((_, runtime)) = self.runtime.remove(entry_id) else {
            return false;
        };
        for task in &runtime.tasks {
            task.abort();
        }
        for task in runtime.tasks {
            let _ = task.await;
        }
        let ids: Vec<String> = runtime.entities.iter().map(|e| e.entity_id.clone()).collect();
        let removed = self.states.remove_all(&ids);
        tracing::info!(entry_id = %entry_id, removed, "Unloaded config entry");
        true
    }

    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> Result<(), FlowError> {
        if !self.entries.contains_key(entry_id) {
            return Err(FlowError::UnknownEntry);
        }
        self.unload(entry_id).await;
        self.setup(entry_id)
    }

    /// User step: validate, persist and set up a new location.
    pub async fn create_entry(self: &Arc<Self>, input: UserInput) -> Result<EntrySummary, FlowError> {
        config_flow::check_form(&input)?;
        let unique_id = config_flow::unique_id(input.latitude, input.longitude);
        if self.find_unique(&unique_id).is_some() {
            return Err(FlowError::AlreadyConfigured);
        }
        config_flow::validate_input(
            &self.http,
            &self.settings.api_endpoint,
            &input.api_key,
            input.latitude,
            input.longitude,
        )
        .await?;

        // Another flow for the same coordinates may have finished meanwhile;
        // the store's unique index catches the rest.
        if self.find_unique(&unique_id).is_some() {
            return Err(FlowError::AlreadyConfigured);
        }
        let entry = ConfigEntry::new(uuid::Uuid::new_v4().to_string(), input);
        self.persist(&entry)?;
        let entry_id = entry.entry_id.clone();
        tracing::info!(entry_id = %entry_id, title = %entry.title, "Created config entry");
        self.entries.insert(entry_id.clone(), entry);
        self.setup(&entry_id)?;
        self.summary(&entry_id).ok_or(FlowError::UnknownEntry)
    }

    /// Options step: store the new quota and reload.
    pub async fn update_options(
        self: &Arc<Self>,
        entry_id: &str,
        options: OptionsInput,
    ) -> Result<EntrySummary, FlowError> {
        let entry = {
            let mut entry = self.entries.get_mut(entry_id).ok_or(FlowError::UnknownEntry)?;
            entry.options = options;
            entry.clone()
        };
        self.persist(&entry)?;
        self.reload(entry_id).await?;
        self.summary(entry_id).ok_or(FlowError::UnknownEntry)
    }

    /// Reauth step: validate the new key against the entry's location and reload.
    pub async fn reauth(self: &Arc<Self>, entry_id: &str, input: ReauthInput) -> Result<EntrySummary, FlowError> {
        let (latitude, longitude) = self
            .entries
            .get(entry_id)
            .map(|e| (e.data.latitude, e.data.longitude))
            .ok_or(FlowError::UnknownEntry)?;
        if input.api_key.trim().is_empty() {
            return Err(FlowError::Required("api_key"));
        }
        config_flow::validate_input(
            &self.http,
            &self.settings.api_endpoint,
            &input.api_key,
            latitude,
            longitude,
        )
        .await?;

        let entry = {
            let mut entry = self.entries.get_mut(entry_id).ok_or(FlowError::UnknownEntry)?;
            entry.data.api_key = input.api_key;
            entry.clone()
        };
        self.persist(&entry)?;
        tracing::info!(entry_id = %entry_id, "Reauthenticated config entry");
        self.reload(entry_id).await?;
        self.summary(entry_id).ok_or(FlowError::UnknownEntry)
    }

    /// Unload and forget an entry.
    pub async fn remove_entry(&self, entry_id: &str) -> Result<(), FlowError> {
        if !self.entries.contains_key(entry_id) {
            return Err(FlowError::UnknownEntry);
        }
        self.unload(entry_id).await;
        self.store
            .remove(entry_id)
            .map_err(|e| FlowError::Unknown(e.to_string()))?;
        self.entries.remove(entry_id);
        tracing::info!(entry_id = %entry_id, "Removed config entry");
        Ok(())
    }

    /// Refresh a loaded entry now, outside the timer.
    pub async fn refresh(&self, entry_id: &str) -> Result<RefreshOutcome, FlowError> {
        let coordinator = {
            let runtime = self.runtime.get(entry_id).ok_or(FlowError::UnknownEntry)?;
            if runtime.state != EntryState::Loaded {
                return Err(FlowError::NotLoaded);
            }
            runtime.coordinator.clone()
        };
        let outcome = coordinator.refresh().await;
        if outcome.requires_reauth() {
            self.set_state(entry_id, &coordinator, EntryState::SetupError, Some(REAUTH_REQUIRED.to_string()));
        }
        Ok(outcome)
    }

    pub fn summary(&self, entry_id: &str) -> Option<EntrySummary> {
        let entry = self.entries.get(entry_id)?.value().clone();
        let quota = entry.max_daily_requests();

        let (state, reason, snapshot, fetch_count, entities) = match self.runtime.get(entry_id) {
            Some(rt) => (
                rt.state,
                rt.reason.clone(),
                Some(rt.coordinator.snapshot()),
                rt.coordinator.fetch_count(),
                rt.entities.clone(),
            ),
            None => (EntryState::NotLoaded, None, None, 0, Vec::new()),
        };
        let has_run = snapshot.as_ref().is_some_and(|s| s.sequence > 0);

        Some(EntrySummary {
            device: DeviceInfo::for_entry(&entry.entry_id, &entry.data.name),
            entry_id: entry.entry_id,
            domain: entry.domain,
            title: entry.title,
            unique_id: entry.unique_id,
            state,
            reason,
            latitude: entry.data.latitude,
            longitude: entry.data.longitude,
            max_daily_requests: quota,
            update_interval_secs: interval::update_interval_secs(quota),
            last_update_success: snapshot
                .as_ref()
                .filter(|_| has_run)
                .map(|s| s.last_update_success),
            last_updated: snapshot.and_then(|s| s.last_updated),
            fetch_count,
            entities,
        })
    }

    /// All entries, oldest first.
    pub fn summaries(&self) -> Vec<EntrySummary> {
        self.ids_by_age()
            .into_iter()
            .filter_map(|id| self.summary(&id))
            .collect()
    }

    pub fn entry_state(&self, entry_id: &str) -> Option<EntryState> {
        self.runtime.get(entry_id).map(|rt| rt.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Abort every entry task. Called on process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.runtime.iter().map(|rt| rt.key().clone()).collect();
        for id in ids {
            self.unload(&id).await;
        }
    }

    /// `scope`, or the first `_2`, `_3`, ... variant no loaded entry uses.
    /// Caller holds `setup_lock`.
    fn free_scope(&self, scope: EntityScope) -> EntityScope {
        let taken: HashSet<String> = self.runtime.iter().map(|rt| rt.slug.clone()).collect();
        if !taken.contains(&scope.slug) {
            return scope;
        }
        let numbered = (2..)
            .map(|n| scope.numbered(n))
            .find(|candidate| !taken.contains(&candidate.slug));
        numbered.unwrap_or(scope)
    }

    fn ids_by_age(&self) -> Vec<String> {
        let mut entries: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|e| (e.created_at, e.entry_id.clone()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, id)| id).collect()
    }

    fn find_unique(&self, unique_id: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.unique_id == unique_id)
            .map(|e| e.entry_id.clone())
    }

    fn persist(&self, entry: &ConfigEntry) -> Result<(), FlowError> {
        self.store.upsert(entry).map_err(|e| {
            if storage::is_conflict(&e) {
                return FlowError::AlreadyConfigured;
            }
            tracing::error!(entry_id = %entry.entry_id, error = %e, "Failed to persist config entry");
            FlowError::Unknown(e.to_string())
        })
    }

    /// Only the runtime that owns `coordinator` is updated.
    fn set_state(&self, entry_id: &str, coordinator: &Arc<Coordinator>, state: EntryState, reason: Option<String>) {
        if let Some(mut rt) = self.runtime.get_mut(entry_id) {
            if !Arc::ptr_eq(&rt.coordinator, coordinator) {
                return;
            }
            rt.state = state;
            rt.reason = reason;
        }
    }

    /// Track a task for teardown. If the runtime that owns `coordinator` is
    /// gone (unloaded, or replaced by a newer setup) the task is aborted.
    fn push_task(&self, entry_id: &str, coordinator: &Arc<Coordinator>, handle: JoinHandle<()>) {
        match self.runtime.get_mut(entry_id) {
            Some(mut rt) if Arc::ptr_eq(&rt.coordinator, coordinator) => rt.tasks.push(handle),
            _ => handle.abort(),
        }
    }
}

/// Re-render entities for every snapshot the coordinator publishes.
async fn forward_updates(
    mut updates: broadcast::Receiver<Arc<Snapshot>>,
    coordinator: Arc<Coordinator>,
    platform: Arc<Platform>,
    states: Arc<StateMachine>,
) {
    loop {
        match updates.recv().await {
            Ok(snapshot) => platform.publish(&states, &snapshot),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(coordinator = %coordinator.name(), skipped, "Listener lagged, rendering latest");
                platform.publish(&states, &coordinator.snapshot());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
