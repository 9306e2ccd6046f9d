use crate::prelude::*;
use crate::derived;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created; cycles only run through `force_refresh`.
    Idle,
    Running,
    Stopped,
}

/// Everything the serving path may look at, published as one value so the
/// health verdict and the image it gates are always seen together.
#[derive(Clone, Debug)]
pub struct MeterState {
    pub lifecycle: Lifecycle,
    pub health: HealthReport,
    pub image: Arc<RegisterImage>,
    pub published_at: Option<DateTime<Utc>>,
    /// Number of images published so far; 0 is the boot-time default image.
    pub sequence: u64,
    pub mapped_roles: usize,
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub interval: Duration,
    pub sample_timeout: Duration,
    pub failure_threshold: u32,
    pub derive_missing: bool,
}

impl EngineSettings {
    pub fn from_meter(meter: &config::Meter) -> Self {
        Self {
            interval: meter.update_interval(),
            sample_timeout: meter.sample_timeout(),
            failure_threshold: meter.failure_threshold(),
            derive_missing: meter.derive_missing(),
        }
    }
}

/// How a single role resolved in one cycle.
#[derive(Clone, Debug, PartialEq)]
enum Resolution {
    Value(f64),
    Unmapped,
    Missing(MeterError),
}

/// Periodically resolves every role, feeds the required ones to the health
/// monitor and publishes a new register image while healthy.
///
/// The engine is the only writer of the published `MeterState`; readers get a
/// `MeterHandle` and never hold anything the writer waits on.
#[derive(Clone)]
pub struct RefreshEngine {
    map: Arc<RegisterMap>,
    resolver: Arc<dyn MeasurementResolver>,
    mappings: Arc<dyn MappingProvider>,
    settings: EngineSettings,
    state: Arc<watch::Sender<Arc<MeterState>>>,
    // serialises cycles between the timer task and force_refresh
    monitor: Arc<Mutex<HealthMonitor>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: CancellationToken,
}

impl RefreshEngine {
    pub fn new(
        map: Arc<RegisterMap>,
        resolver: Arc<dyn MeasurementResolver>,
        mappings: Arc<dyn MappingProvider>,
        settings: EngineSettings,
    ) -> Self {
        let initial = MeterState {
            lifecycle: Lifecycle::Idle,
            health: HealthReport::starting(),
            image: Arc::new(RegisterImage::defaults(&map)),
            published_at: None,
            sequence: 0,
            mapped_roles: mappings.snapshot().len(),
        };
        let (state, _) = watch::channel(Arc::new(initial));

        Self {
            monitor: Arc::new(Mutex::new(HealthMonitor::new(settings.failure_threshold))),
            map,
            resolver,
            mappings,
            settings,
            state: Arc::new(state),
            task: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> MeterHandle {
        MeterHandle::new(self.map.clone(), self.state.subscribe())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Starts the periodic task. The first cycle runs immediately.
    pub async fn start(&self, interval: Duration) -> Result<(), MeterError> {
        if self.shutdown.is_cancelled() {
            return Err(MeterError::EngineStopped);
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("refresh engine already running");
            return Ok(());
        }

        info!("starting refresh engine, interval {}ms", interval.as_millis());
        self.set_lifecycle(Lifecycle::Running);

        let engine = self.clone();
        *task = Some(tokio::spawn(async move { engine.run(interval).await }));

        Ok(())
    }

    /// Cancels any in-flight cycle and stops the timer. The last published
    /// image and health verdict are left as they are.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("refresh task ended abnormally: {}", e);
            }
        }

        // wait out a force_refresh that is between publish and return
        let _monitor = self.monitor.lock().await;
        self.set_lifecycle(Lifecycle::Stopped);
        info!("refresh engine stopped");
    }

    /// Runs one cycle now, outside the timer.
    pub async fn force_refresh(&self) -> Result<HealthReport, MeterError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(MeterError::EngineStopped),
            report = self.refresh_cycle() => Ok(report),
        }
    }

    async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("refresh cycle cancelled");
                    break;
                }
                _ = self.refresh_cycle() => {}
            }
        }

        debug!("refresh loop exiting");
    }

    async fn refresh_cycle(&self) -> HealthReport {
        let mut monitor = self.monitor.lock().await;

        // one consistent mapping table for the whole cycle
        let mappings = self.mappings.snapshot();
        let resolved = self.resolve_all(&mappings).await;

        let failing: Vec<Role> = self
            .map
            .required()
            .filter(|d| !matches!(resolved.get(&d.role), Some(Resolution::Value(_))))
            .map(|d| d.role)
            .collect();

        let verdict = monitor.evaluate(failing);

        match verdict.transition {
            Some((_, HealthState::Failed)) => warn!(
                "meter failed, required roles unavailable: {:?}",
                verdict.report.failing_roles
            ),
            Some((HealthState::Failed, HealthState::Serving)) => {
                info!("meter recovered, all required roles available")
            }
            Some((from, to)) => info!("meter health {} -> {}", from, to),
            None => {}
        }

        let image = verdict
            .publish
            .then(|| Arc::new(self.encode_image(&mappings, &resolved)));
        self.publish(verdict.report.clone(), image, mappings.len());

        verdict.report
    }

    async fn resolve_all(&self, mappings: &RoleMappings) -> HashMap<Role, Resolution> {
        let deadline = Instant::now() + self.settings.sample_timeout;

        let queries = self.map.iter().map(|descriptor| async move {
            let resolution = match mappings.get(descriptor.role) {
                None => Resolution::Unmapped,
                Some(mapping) => self.resolve(descriptor, mapping, deadline).await,
            };
            (descriptor.role, resolution)
        });

        futures::future::join_all(queries).await.into_iter().collect()
    }

    async fn resolve(
        &self,
        descriptor: &RegisterDescriptor,
        mapping: &RoleMapping,
        deadline: Instant,
    ) -> Resolution {
        let source_id = mapping.source_id.as_str();
        let sample = tokio::time::timeout_at(deadline, self.resolver.sample(source_id)).await;

        let resolution = match sample {
            Err(_) => Resolution::Missing(MeterError::SourceTimeout(source_id.to_string())),
            Ok(Err(e)) => {
                debug!("{} ({}): resolver error: {}", descriptor.role, source_id, e);
                Resolution::Missing(MeterError::SourceUnavailable(source_id.to_string()))
            }
            Ok(Ok(MeasurementSample::Unavailable)) => {
                Resolution::Missing(MeterError::SourceUnavailable(source_id.to_string()))
            }
            Ok(Ok(MeasurementSample::Valid(raw))) => {
                let value = match mapping.unit {
                    Some(unit) => unit.convert(raw, descriptor.unit),
                    None => Some(raw),
                };
                match value {
                    Some(v) if v.is_finite() && (v / descriptor.scale).is_finite() => {
                        Resolution::Value(v)
                    }
                    _ => Resolution::Missing(MeterError::InvalidValue {
                        role: descriptor.role,
                        value: raw,
                    }),
                }
            }
        };

        match &resolution {
            Resolution::Value(v) => trace!("{} ({}) = {}", descriptor.role, source_id, v),
            Resolution::Missing(e) => debug!("{}: {}", descriptor.role, e),
            Resolution::Unmapped => {}
        }

        resolution
    }

    fn encode_image(
        &self,
        mappings: &RoleMappings,
        resolved: &HashMap<Role, Resolution>,
    ) -> RegisterImage {
        // unmapped and missing optional roles take their default for this cycle only
        let mut values: HashMap<Role, f64> = self
            .map
            .iter()
            .map(|d| match resolved.get(&d.role) {
                Some(Resolution::Value(v)) => (d.role, *v),
                _ => (d.role, d.default),
            })
            .collect();

        if self.settings.derive_missing {
            derived::fill_unmapped(&mut values, |role| mappings.is_mapped(role));
        }

        RegisterImage::from_values(&self.map, |d| {
            values.get(&d.role).copied().unwrap_or(d.default)
        })
    }

    fn publish(
        &self,
        health: HealthReport,
        image: Option<Arc<RegisterImage>>,
        mapped_roles: usize,
    ) {
        self.state.send_modify(|state| {
            let (image, published_at, sequence) = match image {
                Some(image) => (image, Some(Utc::now()), state.sequence + 1),
                None => (state.image.clone(), state.published_at, state.sequence),
            };

            *state = Arc::new(MeterState {
                lifecycle: state.lifecycle,
                health,
                image,
                published_at,
                sequence,
                mapped_roles,
            });
        });
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.state.send_modify(|state| {
            if state.lifecycle != lifecycle {
                *state = Arc::new(MeterState {
                    lifecycle,
                    ..(**state).clone()
                });
            }
        });
    }
}
