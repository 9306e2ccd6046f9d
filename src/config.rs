use crate::prelude::*;
use crate::register_map::DTSU666_REGISTERS;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub meter: Meter,

    #[serde(default)]
    pub sources: Sources,

    #[serde(default)]
    pub mappings: RoleMappings,

    #[serde(default = "Config::default_mqtt")]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Meter {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Meter {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_update_interval")]
    pub update_interval: Duration,

    /// Budget for all source queries in one cycle; defaults to half the interval.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub sample_timeout_ms: Option<Duration>,

    #[serde(default = "Config::default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub derive_missing: bool,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            update_interval: Config::default_update_interval(),
            sample_timeout_ms: None,
            failure_threshold: Config::default_failure_threshold(),
            derive_missing: false,
        }
    }
}

impl Meter {
    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn sample_timeout(&self) -> Duration {
        self.sample_timeout_ms.unwrap_or(self.update_interval / 2)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn derive_missing(&self) -> bool {
        self.derive_missing
    }
} // }}}

// Sources {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Sources {
    /// Readings older than this are unavailable; 0 disables expiry.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_max_age")]
    pub max_age: Duration,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            max_age: Config::default_max_age(),
        }
    }
}

impl Sources {
    pub fn max_age(&self) -> Option<Duration> {
        (!self.max_age.is_zero()).then_some(self.max_age)
    }
} // }}}

// Mqtt {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_status_interval")]
    pub status_interval: Duration,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status_interval(&self) -> Duration {
        self.status_interval
    }
} // }}}

#[derive(Clone)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
    file: Option<String>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file.clone())?;
        Ok(Self {
            config: Arc::new(Mutex::new(config)),
            file: Some(file),
        })
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            file: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        match self.config.lock() {
            Ok(config) => config,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn meter(&self) -> Meter {
        self.lock().meter.clone()
    }

    pub fn sources(&self) -> Sources {
        self.lock().sources.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn mappings(&self) -> RoleMappings {
        self.lock().mappings.clone()
    }

    /// Replaces the role mappings at runtime; the refresh engine picks them up
    /// on its next cycle.
    pub fn set_mappings(&self, new: RoleMappings) -> Result<()> {
        Config::validate_mappings(&new)?;
        self.lock().mappings = new;
        Ok(())
    }

    pub fn source_topics(&self) -> Vec<String> {
        self.lock().mappings.source_ids()
    }

    /// Re-reads the config file and applies its mappings. Other settings need
    /// a restart.
    pub fn reload(&self) -> Result<()> {
        let file = self
            .file
            .clone()
            .ok_or_else(|| file_error!("no config file to reload from"))?;

        let fresh = Config::new(file)?;
        info!("applying {} role mappings from reloaded config", fresh.mappings.len());
        self.set_mappings(fresh.mappings)
    }
}

impl MappingProvider for ConfigWrapper {
    fn snapshot(&self) -> Arc<RoleMappings> {
        Arc::new(self.mappings())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error_with_source!(err, "error reading {}", file))?;

        let config = Self::from_str(&content)?;
        config.log_summary();

        Ok(config)
    }

    fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Meter:");
        info!("    Update Interval: {}s", self.meter.update_interval.as_secs());
        info!("    Sample Timeout: {}ms", self.meter.sample_timeout().as_millis());
        info!("    Failure Threshold: {}", self.meter.failure_threshold);
        info!("    Derive Missing: {}", self.meter.derive_missing);
        info!("  Sources:");
        info!("    Max Age: {}s", self.sources.max_age.as_secs());
        info!("  Mappings: {} of {} roles mapped", self.mappings.len(), DTSU666_REGISTERS.len());
        for (role, mapping) in self.mappings.iter() {
            match mapping.unit {
                Some(unit) => info!("    {} <- {} ({})", role, mapping.source_id, unit.symbol()),
                None => info!("    {} <- {}", role, mapping.source_id),
            }
        }
        for descriptor in DTSU666_REGISTERS.iter().filter(|d| d.required) {
            if !self.mappings.is_mapped(descriptor.role) {
                warn!(
                    "    required role {} is unmapped, the meter will stay silent",
                    descriptor.role
                );
            }
        }

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
            info!("    Status Interval: {}s", self.mqtt.status_interval.as_secs());
        }

        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.meter.update_interval.is_zero() {
            bail!("meter.update_interval must be at least 1 second");
        }
        if self.meter.sample_timeout().is_zero()
            || self.meter.sample_timeout() >= self.meter.update_interval
        {
            return Err(file_error!(
                "meter.sample_timeout_ms must be between 1 and {}",
                self.meter.update_interval.as_millis() - 1
            ));
        }
        if self.meter.failure_threshold == 0 {
            bail!("meter.failure_threshold must be at least 1");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                return Err(file_error!("MQTT host cannot be empty"));
            }
            if self.mqtt.status_interval.is_zero() {
                bail!("mqtt.status_interval must be at least 1 second");
            }
        }

        Self::validate_mappings(&self.mappings)
    }

    fn validate_mappings(mappings: &RoleMappings) -> Result<()> {
        for (role, mapping) in mappings.iter() {
            if mapping.source_id.trim().is_empty() {
                return Err(file_error!("mapping for {} has an empty source", role));
            }

            if let Some(unit) = mapping.unit {
                let descriptor = DTSU666_REGISTERS
                    .iter()
                    .find(|d| d.role == *role)
                    .ok_or_else(|| file_error!("{}", MeterError::UnknownRole(role.to_string())))?;
                if !unit.is_compatible(descriptor.unit) {
                    return Err(file_error!(
                        "mapping for {} reports in {:?}, which cannot convert to {:?}",
                        role,
                        unit,
                        descriptor.unit
                    ));
                }
            }
        }

        Ok(())
    }

    fn default_update_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn default_failure_threshold() -> u32 {
        1
    }

    fn default_max_age() -> Duration {
        Duration::from_secs(60)
    }

    fn default_mqtt() -> Mqtt {
        Mqtt {
            enabled: false,
            host: "localhost".to_string(),
            port: Self::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Self::default_mqtt_namespace(),
            status_interval: Self::default_status_interval(),
        }
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "dtsu666".to_string()
    }

    fn default_status_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
loglevel: debug
meter:
  update_interval: 2
  sample_timeout_ms: 500
  failure_threshold: 3
  derive_missing: true
sources:
  max_age: 0
mappings:
  power_total: { source: home/grid/power, unit: W }
  voltage_l1: home/grid/voltage
  frequency: home/grid/frequency
mqtt:
  host: broker.local
  namespace: meter
"#;

    #[test]
    fn parses_full_config() -> Result<()> {
        let config = Config::from_str(FULL)?;

        assert_eq!(config.meter.update_interval(), Duration::from_secs(2));
        assert_eq!(config.meter.sample_timeout(), Duration::from_millis(500));
        assert_eq!(config.meter.failure_threshold(), 3);
        assert!(config.meter.derive_missing());
        assert_eq!(config.sources.max_age(), None);
        assert_eq!(config.mappings.len(), 3);
        assert!(config.mqtt.enabled());
        assert_eq!(config.mqtt.port(), 1883);
        assert_eq!(config.mqtt.namespace(), "meter");
        assert_eq!(config.mqtt.status_interval(), Duration::from_secs(30));
        assert_eq!(config.loglevel, "debug");

        Ok(())
    }

    #[test]
    fn empty_config_uses_defaults() -> Result<()> {
        let config = Config::from_str("{}")?;

        assert_eq!(config.meter.update_interval(), Duration::from_secs(5));
        assert_eq!(config.meter.sample_timeout(), Duration::from_millis(2500));
        assert_eq!(config.meter.failure_threshold(), 1);
        assert!(!config.meter.derive_missing());
        assert_eq!(config.sources.max_age(), Some(Duration::from_secs(60)));
        assert!(config.mappings.is_empty());
        assert!(!config.mqtt.enabled());

        Ok(())
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(Config::from_str("meter: { update_interval: 0 }").is_err());
        assert!(
            Config::from_str("meter: { update_interval: 5, sample_timeout_ms: 5000 }").is_err()
        );
        assert!(Config::from_str("meter: { failure_threshold: 0 }").is_err());
        assert!(Config::from_str("mappings: { voltage_l9: x }").is_err());
        assert!(Config::from_str("mappings: { voltage_l1: '' }").is_err());
        assert!(Config::from_str("mappings: { voltage_l1: { source: x, unit: W } }").is_err());
        assert!(Config::from_str("mqtt: { host: '', port: 1883 }").is_err());
    }

    #[test]
    fn reload_replaces_mappings() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(file, "mappings:\n  voltage_l1: a\n")?;
        let path = file.path().to_string_lossy().into_owned();

        let config = ConfigWrapper::new(path.clone())?;
        assert_eq!(config.source_topics(), vec!["a".to_string()]);

        std::fs::write(&path, "mappings:\n  voltage_l1: b\n  frequency: c\n")?;
        config.reload()?;
        assert_eq!(config.snapshot().len(), 2);
        assert_eq!(config.source_topics(), vec!["b".to_string(), "c".to_string()]);

        // a broken file leaves the current mappings alone
        std::fs::write(&path, "mappings:\n  voltage_l1: ''\n")?;
        assert!(config.reload().is_err());
        assert_eq!(config.snapshot().len(), 2);

        Ok(())
    }

    #[test]
    fn from_config_cannot_reload() -> Result<()> {
        let config = ConfigWrapper::from_config(Config::from_str("{}")?);
        assert!(config.reload().is_err());
        Ok(())
    }
}
