use crate::prelude::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// A published image together with the moment it was published.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub image: Arc<RegisterImage>,
    /// `None` for the boot-time default image.
    pub published_at: Option<DateTime<Utc>>,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Status {
    pub health: HealthState,
    pub failing_roles: Vec<Role>,
    pub last_publish: Option<DateTime<Utc>>,
    pub mapped_roles: usize,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisterValue {
    pub role: Role,
    pub address: u16,
    pub words: Vec<u16>,
    pub value: f64,
    pub unit: &'static str,
}

/// Read-only view of the meter for the serving path and diagnostics. Cheap to
/// clone; every call looks at the latest published state without waiting on
/// the refresh engine.
#[derive(Clone)]
pub struct MeterHandle {
    map: Arc<RegisterMap>,
    state: watch::Receiver<Arc<MeterState>>,
}

impl MeterHandle {
    pub fn new(map: Arc<RegisterMap>, state: watch::Receiver<Arc<MeterState>>) -> Self {
        Self { map, state }
    }

    fn current(&self) -> Result<Arc<MeterState>, MeterError> {
        let state = self.state.borrow().clone();
        match state.lifecycle {
            Lifecycle::Stopped => Err(MeterError::EngineStopped),
            _ => Ok(state),
        }
    }

    /// The latest published state, whatever the engine's lifecycle.
    pub fn last_known(&self) -> Arc<MeterState> {
        self.state.borrow().clone()
    }

    /// Register read for the request server. `NotServing` means the request
    /// must go unanswered.
    pub fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, MeterError> {
        let state = self.current()?;
        if !state.health.is_serving() {
            return Err(MeterError::NotServing);
        }

        state.image.read(address, count)
    }

    pub fn current_snapshot(&self) -> Result<Snapshot, MeterError> {
        let state = self.current()?;
        Ok(Snapshot {
            image: state.image.clone(),
            published_at: state.published_at,
            sequence: state.sequence,
        })
    }

    pub fn current_health(&self) -> Result<HealthReport, MeterError> {
        Ok(self.current()?.health.clone())
    }

    pub fn status(&self) -> Result<Status, MeterError> {
        let state = self.current()?;
        Ok(Status {
            health: state.health.state,
            failing_roles: state.health.failing_roles.clone(),
            last_publish: state.published_at,
            mapped_roles: state.mapped_roles,
            sequence: state.sequence,
        })
    }

    /// Every role's words and decoded value in the latest snapshot.
    pub fn register_values(&self) -> Result<Vec<RegisterValue>, MeterError> {
        let state = self.current()?;

        self.map
            .iter()
            .map(|d| {
                let words = state.image.words(d)?;
                Ok(RegisterValue {
                    role: d.role,
                    address: d.address,
                    value: d.decode(&words),
                    words,
                    unit: d.unit.symbol(),
                })
            })
            .collect()
    }

    /// Resolves once a state newer than the one last seen by this handle is
    /// published. Errors when the engine has been dropped.
    pub async fn changed(&mut self) -> Result<()> {
        self.state.changed().await?;
        Ok(())
    }
}
