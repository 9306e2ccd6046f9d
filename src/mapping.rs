use crate::prelude::*;

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Where a role's value comes from. `unit` is the unit the source reports in;
/// when absent the source is assumed to already report in the role's unit.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleMapping {
    pub source_id: String,
    pub unit: Option<Unit>,
}

impl RoleMapping {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            unit: None,
        }
    }

    pub fn with_unit(self, unit: Unit) -> Self {
        Self {
            unit: Some(unit),
            ..self
        }
    }
}

// either `voltage_l1: sensor/voltage` or `power_total: { source: sensor/power, unit: W }`
#[derive(Deserialize)]
#[serde(untagged)]
enum MappingEntry {
    Source(String),
    Detailed { source: String, unit: Option<Unit> },
}

impl<'de> Deserialize<'de> for RoleMapping {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match MappingEntry::deserialize(deserializer)? {
            MappingEntry::Source(source_id) => RoleMapping {
                source_id,
                unit: None,
            },
            MappingEntry::Detailed { source, unit } => RoleMapping {
                source_id: source,
                unit,
            },
        })
    }
}

/// Immutable role -> source table; a refresh cycle works on one of these.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RoleMappings(BTreeMap<Role, RoleMapping>);

impl RoleMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: Role, mapping: RoleMapping) -> Self {
        self.0.insert(role, mapping);
        self
    }

    pub fn insert(&mut self, role: Role, mapping: RoleMapping) {
        self.0.insert(role, mapping);
    }

    pub fn remove(&mut self, role: Role) -> Option<RoleMapping> {
        self.0.remove(&role)
    }

    pub fn get(&self, role: Role) -> Option<&RoleMapping> {
        self.0.get(&role)
    }

    pub fn is_mapped(&self, role: Role) -> bool {
        self.0.contains_key(&role)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Role, &RoleMapping)> {
        self.0.iter()
    }

    /// Distinct source ids, sorted.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.0.values().map(|m| m.source_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Supplies the current role mapping table. Implementations must be cheap;
/// the refresh engine calls this once at the start of every cycle.
pub trait MappingProvider: Send + Sync {
    fn snapshot(&self) -> Arc<RoleMappings>;
}

/// In-process mapping table that can be swapped at runtime.
#[derive(Clone, Debug, Default)]
pub struct SharedMappings {
    inner: Arc<RwLock<Arc<RoleMappings>>>,
}

impl SharedMappings {
    pub fn new(mappings: RoleMappings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(mappings))),
        }
    }

    pub fn replace(&self, mappings: RoleMappings) {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        *inner = Arc::new(mappings);
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut RoleMappings),
    {
        let mut mappings = (*self.snapshot()).clone();
        f(&mut mappings);
        self.replace(mappings);
    }
}

impl MappingProvider for SharedMappings {
    fn snapshot(&self) -> Arc<RoleMappings> {
        match self.inner.read() {
            Ok(inner) => inner.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_both_forms() -> Result<()> {
        let yaml = r#"
voltage_l1: home/grid/voltage
power_total: { source: home/grid/power, unit: W }
frequency:
  source: home/grid/frequency
"#;
        let mappings: RoleMappings = serde_yaml::from_str(yaml)?;

        assert_eq!(mappings.len(), 3);
        assert_eq!(
            mappings.get(Role::VoltageL1),
            Some(&RoleMapping::new("home/grid/voltage"))
        );
        assert_eq!(
            mappings.get(Role::PowerTotal),
            Some(&RoleMapping::new("home/grid/power").with_unit(Unit::Watt))
        );
        assert_eq!(mappings.get(Role::Frequency).map(|m| m.unit), Some(None));

        Ok(())
    }

    #[test]
    fn rejects_unknown_roles() {
        let yaml = "voltage_l4: home/grid/voltage\n";
        assert!(serde_yaml::from_str::<RoleMappings>(yaml).is_err());
    }

    #[test]
    fn snapshots_are_isolated_from_updates() {
        let shared = SharedMappings::new(
            RoleMappings::new().with(Role::Frequency, RoleMapping::new("f")),
        );
        let before = shared.snapshot();

        shared.update(|m| {
            m.remove(Role::Frequency);
        });

        assert!(before.is_mapped(Role::Frequency));
        assert!(!shared.snapshot().is_mapped(Role::Frequency));
    }
}
