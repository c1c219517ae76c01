//! Configuration loading
//!
//! Sources, lowest precedence first:
//! - built-in defaults (`Settings::default()`)
//! - `config/default.toml`, if present
//! - environment variables prefixed `CHANBUS_`, nested with `__`
//!   (e.g. `CHANBUS_BROKER__URL=amqp://localhost:5672`)

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    AuthSettings, BrokerSettings, CoapSettings, LogSettings, PartialSettings, ServerSettings,
    Settings,
};

const DEFAULT_FILE: &str = "config/default";
const ENV_PREFIX: &str = "CHANBUS";

/// Loads the configuration from the default file and environment variables
/// and merges it with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name(DEFAULT_FILE).required(false))
}

/// Like `load_config`, reading the file at `path` instead. The file must exist.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    build(File::from(path).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
