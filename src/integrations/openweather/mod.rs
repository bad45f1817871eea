//! OpenWeather One Call 3.0 integration
//!
//! One config entry per location. Each entry owns a [`coordinator::Coordinator`]
//! polling the One Call endpoint at a rate derived from the daily request
//! quota, and a [`Platform`] rendering the latest payload into
//! `sensor.*` / `binary_sensor.*` entities.

pub mod binary_sensor;
pub mod client;
pub mod config_flow;
pub mod coordinator;
pub mod interval;
pub mod projection;
pub mod sensor;

use chrono_tz::Tz;
use serde::Serialize;

use crate::state::StateMachine;
use binary_sensor::AlertsActiveSensor;
use coordinator::Snapshot;
use sensor::{AlertSensor, WeatherSensor, SENSOR_TYPES};

pub const DOMAIN: &str = "openweather_one_call";
pub const API_ENDPOINT: &str = "https://api.openweathermap.org/data/3.0/onecall";
pub const DEFAULT_MAX_DAILY_REQUESTS: i64 = 1000;
pub const ATTRIBUTION: &str = "Data provided by OpenWeather";

const MANUFACTURER: &str = "OpenWeather";
const MODEL: &str = "One Call API 3.0";

/// Everything needed to poll one location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationConfig {
    pub name: String,
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    pub max_daily_requests: i64,
}

/// Device every entity of an entry is grouped under.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

impl DeviceInfo {
    pub fn for_entry(entry_id: &str, name: &str) -> Self {
        Self {
            identifiers: vec![(DOMAIN.to_string(), entry_id.to_string())],
            name: name.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
        }
    }
}

/// Identity shared by every entity of one config entry.
#[derive(Debug, Clone)]
pub struct EntityScope {
    pub entry_id: String,
    pub name: String,
    pub slug: String,
}

impl EntityScope {
    pub fn new(entry_id: &str, name: &str) -> Self {
        let slug = match slugify(name) {
            s if s.is_empty() => "openweather".to_string(),
            s => s,
        };
        Self {
            entry_id: entry_id.to_string(),
            name: name.to_string(),
            slug,
        }
    }

    /// Same scope with `_<n>` appended to the slug.
    pub fn numbered(&self, n: usize) -> Self {
        Self {
            slug: format!("{}_{}", self.slug, n),
            ..self.clone()
        }
    }

    pub fn entity_id(&self, platform: &str, key: &str) -> String {
        format!("{}.{}_{}", platform, self.slug, slugify(key))
    }

    pub fn unique_id(&self, key: &str) -> String {
        format!("{}_{}", self.entry_id, key)
    }

    pub fn friendly_name(&self, label: &str) -> String {
        format!("{} {}", self.name, label)
    }
}

/// Registry view of one entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRef {
    pub entity_id: String,
    pub unique_id: String,
}

impl EntityRef {
    fn new(entity_id: &str, unique_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            unique_id: unique_id.to_string(),
        }
    }
}

/// All entities of one config entry.
pub struct Platform {
    sensors: Vec<WeatherSensor>,
    alert: AlertSensor,
    alerts_active: AlertsActiveSensor,
    time_zone: Tz,
}

impl Platform {
    pub fn new(scope: &EntityScope, time_zone: Tz) -> Self {
        Self {
            sensors: SENSOR_TYPES
                .iter()
                .map(|desc| WeatherSensor::new(scope, desc))
                .collect(),
            alert: AlertSensor::new(scope),
            alerts_active: AlertsActiveSensor::new(scope),
            time_zone,
        }
    }

    pub fn entities(&self) -> Vec<EntityRef> {
        let mut refs: Vec<EntityRef> = self
            .sensors
            .iter()
            .map(|s| EntityRef::new(&s.entity_id, &s.unique_id))
            .collect();
        refs.push(EntityRef::new(&self.alert.entity_id, &self.alert.unique_id));
        refs.push(EntityRef::new(&self.alerts_active.entity_id, &self.alerts_active.unique_id));
        refs
    }

    /// Render every entity from `snapshot` into the state machine.
    pub fn publish(&self, states: &StateMachine, snapshot: &Snapshot) {
        for sensor in &self.sensors {
            let (state, attrs) = sensor.render(snapshot, self.time_zone);
            states.set(sensor.entity_id.clone(), state, attrs);
        }
        let (state, attrs) = self.alert.render(snapshot);
        states.set(self.alert.entity_id.clone(), state, attrs);
        let (state, attrs) = self.alerts_active.render(snapshot);
        states.set(self.alerts_active.entity_id.clone(), state, attrs);
    }
}

/// Lowercase, non-alphanumerics collapsed to single underscores.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// First element of the payload's `alerts` array, if any.
pub(crate) fn first_alert(snapshot: &Snapshot) -> Option<&serde_json::Value> {
    snapshot
        .data
        .as_deref()
        .and_then(|data| data.get("alerts"))
        .and_then(|alerts| alerts.as_array())
        .and_then(|alerts| alerts.first())
}

/// Common attributes every entity carries.
pub(crate) fn base_attributes(friendly_name: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut attrs = serde_json::Map::new();
    attrs.insert("friendly_name".into(), serde_json::json!(friendly_name));
    attrs.insert("attribution".into(), serde_json::json!(ATTRIBUTION));
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{STATE_UNAVAILABLE, STATE_UNKNOWN};
    use serde_json::json;
    use std::sync::Arc;

    fn snapshot(data: serde_json::Value, ok: bool) -> Snapshot {
        Snapshot {
            data: Some(Arc::new(data)),
            last_update_success: ok,
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Home"), "home");
        assert_eq!(slugify("Summer House #2"), "summer_house_2");
        assert_eq!(slugify("  Berlin-Mitte  "), "berlin_mitte");
        assert_eq!(slugify("current.rain.1h"), "current_rain_1h");
    }

    #[test]
    fn test_scope_ids() {
        let scope = EntityScope::new("abc123", "Summer House");
        assert_eq!(scope.entity_id("sensor", "daily.0.temp.max"), "sensor.summer_house_daily_0_temp_max");
        assert_eq!(scope.unique_id("daily.0.temp.max"), "abc123_daily.0.temp.max");
        assert_eq!(scope.friendly_name("Pressure"), "Summer House Pressure");
        assert_eq!(EntityScope::new("x", "!!!").slug, "openweather");
        let second = scope.numbered(2);
        assert_eq!(second.entity_id("sensor", "current.temp"), "sensor.summer_house_2_current_temp");
        assert_eq!(second.unique_id("current.temp"), "abc123_current.temp");
    }

    #[test]
    fn test_platform_publishes_every_entity() {
        let scope = EntityScope::new("entry1", "Home");
        let platform = Platform::new(&scope, chrono_tz::UTC);
        let states = StateMachine::new(64);

        let snap = snapshot(
            json!({
                "current": {"temp": 21.5, "humidity": 60, "sunrise": 1700000000},
                "daily": [{"temp": {"max": 25.0}, "pop": 0.42}]
            }),
            true,
        );
        platform.publish(&states, &snap);

        assert_eq!(states.len(), platform.entities().len());
        assert_eq!(states.get("sensor.home_current_temp").unwrap().state, "21.5");
        assert_eq!(states.get("sensor.home_current_humidity").unwrap().state, "60");
        assert_eq!(states.get("sensor.home_daily_0_temp_max").unwrap().state, "25.0");
        assert_eq!(states.get("sensor.home_daily_0_pop").unwrap().state, "42.0");
        assert_eq!(states.get("sensor.home_current_wind_gust").unwrap().state, STATE_UNKNOWN);
        assert_eq!(states.get("sensor.home_weather_alert").unwrap().state, "No active alerts");
        assert_eq!(states.get("binary_sensor.home_alerts_active").unwrap().state, "off");
    }

    #[test]
    fn test_platform_unavailable_after_failure() {
        let scope = EntityScope::new("entry1", "Home");
        let platform = Platform::new(&scope, chrono_tz::UTC);
        let states = StateMachine::new(64);

        let snap = snapshot(json!({"current": {"temp": 21.5}}), false);
        platform.publish(&states, &snap);

        assert_eq!(states.get("sensor.home_current_temp").unwrap().state, STATE_UNAVAILABLE);
        assert_eq!(states.get("sensor.home_weather_alert").unwrap().state, STATE_UNAVAILABLE);
        assert_eq!(states.get("binary_sensor.home_alerts_active").unwrap().state, STATE_UNAVAILABLE);
    }
}
