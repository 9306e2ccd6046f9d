use anyhow::Result;
use log::error;
use std::time::Duration;

use dtsu666_emulator::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    dtsu666_emulator::init_logging();

    let config = ConfigWrapper::new(options.config_file.clone()).unwrap_or_else(|err| {
        error!("Failed to load config: {:?}", err);
        std::process::exit(255);
    });
    dtsu666_emulator::set_log_level(&config.loglevel());

    dtsu666_emulator::run(config, options.runtime.map(Duration::from_secs)).await
}
