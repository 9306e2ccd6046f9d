use crate::register_map::Role;

/// Errors surfaced by the meter core. Only `UnknownRole`, `NoSuchAddress` and
/// `InvalidRegisterTable` are programmer or configuration errors; the source
/// variants are recovered inside a refresh cycle and never escape it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeterError {
    #[error("unknown role {0:?}")]
    UnknownRole(String),

    #[error("no register block covers 0x{address:04X} (count {count})")]
    NoSuchAddress { address: u16, count: u16 },

    /// The device must stay silent: no response at all, not an error response.
    #[error("meter is not serving")]
    NotServing,

    #[error("refresh engine is stopped")]
    EngineStopped,

    #[error("invalid register table: {0}")]
    InvalidRegisterTable(String),

    #[error("source {0} unavailable")]
    SourceUnavailable(String),

    #[error("source {0} timed out")]
    SourceTimeout(String),

    #[error("invalid value for {role}: {value}")]
    InvalidValue { role: Role, value: f64 },
}

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}

/// Creates an anyhow error with the current file and line number, and includes a source error
#[macro_export]
macro_rules! file_error_with_source {
    ($source:expr, $($arg:tt)*) => {
        anyhow!(
            "[{}:{}] {}: {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*),
            $source
        )
    };
}
