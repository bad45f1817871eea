//! `alerts_active` binary sensor.

use serde_json::{json, Map, Value};

use super::coordinator::Snapshot;
use super::{base_attributes, first_alert, EntityScope};
use crate::state::{STATE_UNAVAILABLE, STATE_UNKNOWN};

#[derive(Debug)]
pub struct AlertsActiveSensor {
    pub entity_id: String,
    pub unique_id: String,
    friendly_name: String,
}

impl AlertsActiveSensor {
    pub fn new(scope: &EntityScope) -> Self {
        Self {
            entity_id: scope.entity_id("binary_sensor", "alerts_active"),
            unique_id: scope.unique_id("alerts_active"),
            friendly_name: scope.friendly_name("Alerts Active"),
        }
    }

    /// `None` when there is no payload at all.
    pub fn is_on(&self, snapshot: &Snapshot) -> Option<bool> {
        let data = snapshot.data.as_deref()?;
        Some(matches!(data.get("alerts"), Some(Value::Array(alerts)) if !alerts.is_empty()))
    }

    pub fn render(&self, snapshot: &Snapshot) -> (String, Map<String, Value>) {
        let mut attrs = base_attributes(&self.friendly_name);
        attrs.insert("device_class".into(), json!("safety"));

        if !snapshot.last_update_success {
            return (STATE_UNAVAILABLE.to_string(), attrs);
        }

        let state = match self.is_on(snapshot) {
            Some(true) => "on",
            Some(false) => "off",
            None => STATE_UNKNOWN,
        };
        if let Some(alert) = first_alert(snapshot) {
            for key in ["sender_name", "event", "description"] {
                attrs.insert(key.into(), alert.get(key).cloned().unwrap_or(Value::Null));
            }
        }
        (state.to_string(), attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sensor() -> AlertsActiveSensor {
        AlertsActiveSensor::new(&EntityScope::new("entry1", "Home"))
    }

    fn snapshot(data: Option<Value>) -> Snapshot {
        Snapshot {
            data: data.map(Arc::new),
            last_update_success: true,
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_ids() {
        let s = sensor();
        assert_eq!(s.entity_id, "binary_sensor.home_alerts_active");
        assert_eq!(s.unique_id, "entry1_alerts_active");
    }

    #[test]
    fn test_on_off() {
        let s = sensor();
        assert_eq!(s.is_on(&snapshot(Some(json!({"current": {}})))), Some(false));
        assert_eq!(s.is_on(&snapshot(Some(json!({"alerts": []})))), Some(false));
        assert_eq!(s.is_on(&snapshot(Some(json!({"alerts": [{"event": "Storm"}]})))), Some(true));
        assert_eq!(s.is_on(&snapshot(None)), None);
        for odd in [json!({}), json!(""), json!(false), json!(null), json!("Storm")] {
            assert_eq!(s.is_on(&snapshot(Some(json!({"alerts": odd})))), Some(false));
        }
    }

    #[test]
    fn test_render_with_alert() {
        let s = sensor();
        let snap = snapshot(Some(json!({
            "alerts": [{"sender_name": "NWS", "event": "Heat Advisory", "description": "Hot."}]
        })));
        let (state, attrs) = s.render(&snap);
        assert_eq!(state, "on");
        assert_eq!(attrs["device_class"], "safety");
        assert_eq!(attrs["event"], "Heat Advisory");
        assert_eq!(attrs["sender_name"], "NWS");
        assert_eq!(attrs["description"], "Hot.");
    }

    #[test]
    fn test_render_without_data() {
        let (state, attrs) = sensor().render(&snapshot(None));
        assert_eq!(state, STATE_UNKNOWN);
        assert!(attrs.get("event").is_none());
    }
}
