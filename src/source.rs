use crate::prelude::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeasurementSample {
    Valid(f64),
    Unavailable,
}

/// Anything that can answer "what is the current value of this source".
///
/// Called concurrently for different sources within a refresh cycle. An `Err`
/// is treated the same as `Unavailable`.
#[async_trait]
pub trait MeasurementResolver: Send + Sync {
    async fn sample(&self, source_id: &str) -> Result<MeasurementSample>;
}

#[derive(Clone, Copy, Debug)]
struct Reading {
    sample: MeasurementSample,
    received: Instant,
}

/// Latest reading per source id, fed by the MQTT receiver (or directly in
/// tests). Readings older than `max_age` sample as unavailable.
#[derive(Clone, Debug)]
pub struct ValueStore {
    readings: Arc<RwLock<HashMap<String, Reading>>>,
    max_age: Option<Duration>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ValueStore {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            readings: Arc::new(RwLock::new(HashMap::new())),
            max_age,
        }
    }

    /// Parses a raw payload and stores it as the current reading.
    pub fn update(&self, source_id: &str, payload: &str) -> Result<MeasurementSample> {
        let sample = Self::parse_payload(payload);
        self.set(source_id, sample)?;
        Ok(sample)
    }

    pub fn set(&self, source_id: &str, sample: MeasurementSample) -> Result<()> {
        let mut readings = self
            .readings
            .write()
            .map_err(|_| anyhow!("source.rs:value store lock poisoned"))?;

        readings.insert(
            source_id.to_string(),
            Reading {
                sample,
                received: Instant::now(),
            },
        );

        Ok(())
    }

    pub fn remove(&self, source_id: &str) -> Result<()> {
        self.readings
            .write()
            .map_err(|_| anyhow!("source.rs:value store lock poisoned"))?
            .remove(source_id);

        Ok(())
    }

    /// Accepts plain numbers, JSON numbers and JSON objects carrying a `value`
    /// or `state` field. The usual "no data" states map to `Unavailable`.
    pub fn parse_payload(payload: &str) -> MeasurementSample {
        let payload = payload.trim();

        match payload.to_ascii_lowercase().as_str() {
            "" | "unknown" | "unavailable" | "none" | "null" => {
                return MeasurementSample::Unavailable
            }
            _ => {}
        }

        if let Ok(v) = payload.parse::<f64>() {
            return MeasurementSample::Valid(v);
        }

        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(serde_json::Value::Object(object)) => object
                .get("value")
                .or_else(|| object.get("state"))
                .map(Self::sample_from_json)
                .unwrap_or(MeasurementSample::Unavailable),
            Ok(value) => Self::sample_from_json(&value),
            Err(_) => MeasurementSample::Unavailable,
        }
    }

    fn sample_from_json(value: &serde_json::Value) -> MeasurementSample {
        match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(MeasurementSample::Valid)
                .unwrap_or(MeasurementSample::Unavailable),
            serde_json::Value::String(s) => Self::parse_payload(s),
            _ => MeasurementSample::Unavailable,
        }
    }

    fn lookup(&self, source_id: &str) -> Result<MeasurementSample> {
        let readings = self
            .readings
            .read()
            .map_err(|_| anyhow!("source.rs:value store lock poisoned"))?;

        let sample = match readings.get(source_id) {
            None => MeasurementSample::Unavailable,
            Some(reading) => match self.max_age {
                Some(max_age) if reading.received.elapsed() > max_age => {
                    trace!("{} is stale", source_id);
                    MeasurementSample::Unavailable
                }
                _ => reading.sample,
            },
        };

        Ok(sample)
    }
}

#[async_trait]
impl MeasurementResolver for ValueStore {
    async fn sample(&self, source_id: &str) -> Result<MeasurementSample> {
        self.lookup(source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_payloads() {
        use MeasurementSample::*;

        assert_eq!(ValueStore::parse_payload("231.4"), Valid(231.4));
        assert_eq!(ValueStore::parse_payload(" -1500 \n"), Valid(-1500.0));
        assert_eq!(ValueStore::parse_payload("unavailable"), Unavailable);
        assert_eq!(ValueStore::parse_payload("Unknown"), Unavailable);
        assert_eq!(ValueStore::parse_payload(""), Unavailable);
        assert_eq!(ValueStore::parse_payload("on"), Unavailable);
        assert_eq!(ValueStore::parse_payload(r#"{"value": 50.02}"#), Valid(50.02));
        assert_eq!(ValueStore::parse_payload(r#"{"state": "230.1"}"#), Valid(230.1));
        assert_eq!(ValueStore::parse_payload(r#"{"state": "unknown"}"#), Unavailable);
        assert_eq!(ValueStore::parse_payload(r#"{"other": 1}"#), Unavailable);
        assert_eq!(ValueStore::parse_payload("[1, 2]"), Unavailable);
    }

    #[tokio::test]
    async fn unknown_sources_are_unavailable() -> Result<()> {
        let store = ValueStore::default();
        assert_eq!(store.sample("nope").await?, MeasurementSample::Unavailable);

        store.update("grid/power", "1500")?;
        assert_eq!(
            store.sample("grid/power").await?,
            MeasurementSample::Valid(1500.0)
        );

        store.remove("grid/power")?;
        assert_eq!(
            store.sample("grid/power").await?,
            MeasurementSample::Unavailable
        );

        Ok(())
    }

    #[tokio::test]
    async fn stale_readings_expire() -> Result<()> {
        let store = ValueStore::new(Some(Duration::from_millis(20)));
        store.set("grid/voltage", MeasurementSample::Valid(230.0))?;
        assert_eq!(
            store.sample("grid/voltage").await?,
            MeasurementSample::Valid(230.0)
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            store.sample("grid/voltage").await?,
            MeasurementSample::Unavailable
        );

        Ok(())
    }
}
