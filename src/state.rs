use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// State string for entities whose source could not be refreshed.
pub const STATE_UNAVAILABLE: &str = "unavailable";
/// State string for entities whose source has no value for them.
pub const STATE_UNKNOWN: &str = "unknown";

/// HA-compatible state object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }
}

/// Event fired when an entity is written or removed.
/// `new_state` is `None` when the entity was removed.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
}

/// Entity registry shared by every loaded config entry.
pub struct StateMachine {
    states: DashMap<String, EntityState>,
    event_tx: broadcast::Sender<StateChangedEvent>,
    writes: AtomicU64,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: DashMap::new(),
            event_tx,
            writes: AtomicU64::new(0),
        }
    }

    /// Get all entity states, sorted by entity id.
    pub fn get_all(&self) -> Vec<EntityState> {
        let mut all: Vec<EntityState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    /// Get a single entity state
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Write an entity state and fire `state_changed`.
    ///
    /// `last_changed` only moves when the state string changes,
    /// `last_updated` when the state or any attribute changes.
    pub fn set(
        &self,
        entity_id: String,
        state: String,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> EntityState {
        let now = Utc::now();

        let old_state = self.states.get(&entity_id).map(|e| e.value().clone());

        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state {
                    now
                } else {
                    prev.last_changed
                };
                let updated = if prev.state != state || prev.attributes != attributes {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated,
            last_reported: now,
            context: Context::new(),
        };

        self.states.insert(entity_id.clone(), new_state.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);

        // No subscribers is fine
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        new_state
    }

    /// Remove an entity. Returns true if it existed.
    pub fn remove(&self, entity_id: &str) -> bool {
        match self.states.remove(entity_id) {
            Some((entity_id, old)) => {
                let _ = self.event_tx.send(StateChangedEvent {
                    entity_id,
                    old_state: Some(old),
                    new_state: None,
                });
                true
            }
            None => false,
        }
    }

    /// Remove every listed entity, returning how many existed.
    pub fn remove_all(&self, entity_ids: &[String]) -> usize {
        entity_ids.iter().filter(|id| self.remove(id)).count()
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    /// Number of entities currently tracked
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Total number of state writes since startup.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(unit: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut attrs = serde_json::Map::new();
        attrs.insert("unit_of_measurement".into(), serde_json::json!(unit));
        attrs
    }

    #[test]
    fn test_set_and_get() {
        let sm = StateMachine::new(16);
        sm.set("sensor.home_current_temp".into(), "21.5".into(), attrs("°C"));
        let s = sm.get("sensor.home_current_temp").unwrap();
        assert_eq!(s.state, "21.5");
        assert_eq!(s.attributes["unit_of_measurement"], "°C");
        assert_eq!(sm.len(), 1);
        assert_eq!(sm.write_count(), 1);
    }

    #[test]
    fn test_last_changed_only_moves_on_state_change() {
        let sm = StateMachine::new(16);
        let first = sm.set("sensor.x".into(), "1".into(), attrs("%"));
        let second = sm.set("sensor.x".into(), "1".into(), attrs("%"));
        assert_eq!(first.last_changed, second.last_changed);
        assert_eq!(first.last_updated, second.last_updated);

        let third = sm.set("sensor.x".into(), "1".into(), attrs("mm"));
        assert_eq!(first.last_changed, third.last_changed);
        assert!(third.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn test_events_fired_for_set_and_remove() {
        let sm = StateMachine::new(16);
        let mut rx = sm.subscribe();

        sm.set("binary_sensor.home_alerts_active".into(), "off".into(), serde_json::Map::new());
        let ev = rx.recv().await.unwrap();
        assert!(ev.old_state.is_none());
        assert_eq!(ev.new_state.unwrap().state, "off");

        assert!(sm.remove("binary_sensor.home_alerts_active"));
        let ev = rx.recv().await.unwrap();
        assert!(ev.new_state.is_none());
        assert_eq!(ev.old_state.unwrap().state, "off");
        assert!(!sm.remove("binary_sensor.home_alerts_active"));
    }

    #[test]
    fn test_remove_all_and_sorted_listing() {
        let sm = StateMachine::new(16);
        for id in ["sensor.b", "sensor.a", "sensor.c"] {
            sm.set(id.into(), STATE_UNKNOWN.into(), serde_json::Map::new());
        }
        let ids: Vec<String> = sm.get_all().into_iter().map(|s| s.entity_id).collect();
        assert_eq!(ids, vec!["sensor.a", "sensor.b", "sensor.c"]);

        let removed = sm.remove_all(&["sensor.a".into(), "sensor.z".into()]);
        assert_eq!(removed, 1);
        assert_eq!(sm.len(), 2);
    }
}
