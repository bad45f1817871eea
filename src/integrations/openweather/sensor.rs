//! Sensor entities: one per row of [`SENSOR_TYPES`], plus the weather alert sensor.

use chrono_tz::Tz;
use serde_json::{json, Map, Value};

use super::coordinator::Snapshot;
use super::projection::{self, Transform};
use super::{base_attributes, first_alert, EntityScope};
use crate::state::{STATE_UNAVAILABLE, STATE_UNKNOWN};

const PLATFORM: &str = "sensor";
const NO_ALERTS: &str = "No active alerts";

const CELSIUS: Option<&str> = Some("°C");
const PERCENT: Option<&str> = Some("%");
const MEASUREMENT: Option<&str> = Some("measurement");
const TEMPERATURE: Option<&str> = Some("temperature");

/// Static description of one exposed measurement.
#[derive(Debug)]
pub struct SensorDescription {
    /// Field path into the One Call payload.
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub transform: Transform,
}

const fn measurement(
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
) -> SensorDescription {
    SensorDescription {
        key,
        name,
        unit,
        device_class,
        state_class: MEASUREMENT,
        transform: Transform::None,
    }
}

const fn text(key: &'static str, name: &'static str) -> SensorDescription {
    SensorDescription {
        key,
        name,
        unit: None,
        device_class: None,
        state_class: None,
        transform: Transform::None,
    }
}

const fn timestamp(key: &'static str, name: &'static str) -> SensorDescription {
    SensorDescription {
        key,
        name,
        unit: None,
        device_class: Some("timestamp"),
        state_class: None,
        transform: Transform::Timestamp,
    }
}

pub const SENSOR_TYPES: &[SensorDescription] = &[
    measurement("current.temp", "Temperature", CELSIUS, TEMPERATURE),
    measurement("current.feels_like", "Feels Like Temperature", CELSIUS, TEMPERATURE),
    measurement("current.pressure", "Pressure", Some("hPa"), Some("pressure")),
    measurement("current.humidity", "Humidity", PERCENT, Some("humidity")),
    measurement("current.dew_point", "Dew Point", CELSIUS, TEMPERATURE),
    measurement("current.clouds", "Cloudiness", PERCENT, None),
    measurement("current.uvi", "UV Index", Some("UV index"), None),
    measurement("current.visibility", "Visibility", Some("m"), Some("distance")),
    measurement("current.wind_speed", "Wind Speed", Some("m/s"), Some("wind_speed")),
    measurement("current.wind_deg", "Wind Degree", Some("°"), None),
    measurement("current.wind_gust", "Wind Gust", Some("m/s"), Some("wind_speed")),
    timestamp("current.sunrise", "Sunrise"),
    timestamp("current.sunset", "Sunset"),
    measurement("current.rain.1h", "Rain (last 1h)", Some("mm/h"), Some("precipitation_intensity")),
    measurement("current.snow.1h", "Snow (last 1h)", Some("mm/h"), Some("precipitation_intensity")),
    text("current.weather.0.main", "Weather Condition"),
    text("current.weather.0.description", "Weather Description"),
    measurement("daily.0.temp.day", "Daytime Temperature", CELSIUS, TEMPERATURE),
    measurement("daily.0.temp.min", "Minimum Temperature", CELSIUS, TEMPERATURE),
    measurement("daily.0.temp.max", "Maximum Temperature", CELSIUS, TEMPERATURE),
    measurement("daily.0.temp.night", "Nighttime Temperature", CELSIUS, TEMPERATURE),
    measurement("daily.0.temp.eve", "Evening Temperature", CELSIUS, TEMPERATURE),
    measurement("daily.0.temp.morn", "Morning Temperature", CELSIUS, TEMPERATURE),
    SensorDescription {
        key: "daily.0.pop",
        name: "Probability of Precipitation",
        unit: PERCENT,
        device_class: None,
        state_class: MEASUREMENT,
        transform: Transform::Percentage,
    },
];

/// A sensor bound to one field path of the coordinator payload.
#[derive(Debug)]
pub struct WeatherSensor {
    pub entity_id: String,
    pub unique_id: String,
    friendly_name: String,
    description: &'static SensorDescription,
}

impl WeatherSensor {
    pub fn new(scope: &EntityScope, description: &'static SensorDescription) -> Self {
        Self {
            entity_id: scope.entity_id(PLATFORM, description.key),
            unique_id: scope.unique_id(description.key),
            friendly_name: scope.friendly_name(description.name),
            description,
        }
    }

    /// Projected value of the latest payload, regardless of availability.
    pub fn native_value(&self, snapshot: &Snapshot) -> Option<Value> {
        let data = snapshot.data.as_deref()?;
        projection::evaluate(data, self.description.key, self.description.transform)
    }

    pub fn render(&self, snapshot: &Snapshot, time_zone: Tz) -> (String, Map<String, Value>) {
        let desc = self.description;
        let mut attrs = base_attributes(&self.friendly_name);
        if let Some(unit) = desc.unit {
            attrs.insert("unit_of_measurement".into(), json!(unit));
        }
        if let Some(class) = desc.device_class {
            attrs.insert("device_class".into(), json!(class));
        }
        if let Some(class) = desc.state_class {
            attrs.insert("state_class".into(), json!(class));
        }

        if !snapshot.last_update_success {
            return (STATE_UNAVAILABLE.to_string(), attrs);
        }

        if desc.transform == Transform::Timestamp {
            let local = snapshot
                .data
                .as_deref()
                .and_then(|data| projection::resolve_path(data, desc.key))
                .and_then(|raw| projection::local_time_of_day(raw, time_zone));
            if let Some(local) = local {
                attrs.insert("local_time".into(), json!(local));
            }
        }

        let state = self
            .native_value(snapshot)
            .map(|v| projection::state_string(&v))
            .unwrap_or_else(|| STATE_UNKNOWN.to_string());
        (state, attrs)
    }
}

/// Headline of the first active weather alert.
#[derive(Debug)]
pub struct AlertSensor {
    pub entity_id: String,
    pub unique_id: String,
    friendly_name: String,
}

impl AlertSensor {
    pub fn new(scope: &EntityScope) -> Self {
        Self {
            entity_id: scope.entity_id(PLATFORM, "weather_alert"),
            unique_id: scope.unique_id("weather_alert"),
            friendly_name: scope.friendly_name("Weather Alert"),
        }
    }

    pub fn render(&self, snapshot: &Snapshot) -> (String, Map<String, Value>) {
        let mut attrs = base_attributes(&self.friendly_name);
        if !snapshot.last_update_success {
            return (STATE_UNAVAILABLE.to_string(), attrs);
        }

        let Some(alert) = first_alert(snapshot) else {
            return (NO_ALERTS.to_string(), attrs);
        };
        for key in ["sender_name", "start", "end", "description"] {
            attrs.insert(key.into(), alert.get(key).cloned().unwrap_or(Value::Null));
        }
        let state = alert
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or(STATE_UNKNOWN)
            .to_string();
        (state, attrs)
    }
}
