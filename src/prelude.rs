pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, watch};

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::engine::{EngineSettings, Lifecycle, MeterState, RefreshEngine};
pub use crate::error::MeterError;
pub use crate::health::{HealthMonitor, HealthReport, HealthState};
pub use crate::mapping::{MappingProvider, RoleMapping, RoleMappings, SharedMappings};
pub use crate::meter::{MeterHandle, Snapshot, Status};
pub use crate::mqtt;
pub use crate::options::Options;
pub use crate::register_image::RegisterImage;
pub use crate::register_map::{RegisterDescriptor, RegisterMap, Role, Unit};
pub use crate::source::{MeasurementResolver, MeasurementSample, ValueStore};
pub use crate::{file_error, file_error_with_source};
