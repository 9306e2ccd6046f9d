use clap::Parser;

/// Presents live sensor readings as a CHINT DTSU666 power meter
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// YAML file with meter settings, role mappings and MQTT broker
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Shut down after this many seconds instead of waiting for Ctrl+C
    #[clap(short = 't', long = "time", value_name = "SECONDS")]
    pub runtime: Option<u64>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
