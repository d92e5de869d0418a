mod settings;

use config::{Config, Environment, File};

use crate::utils::Result;
use settings::PartialSettings;

pub use settings::{
    ClientSettings, LoggingSettings, PoolSettings, QueueSettings, ServerSettings, Settings,
};

/// Loads the configuration from `config/default` and `HUBLINK__*`
/// environment variables (`HUBLINK__POOL__MAX_CONNECTIONS=50`), merged over
/// the built-in defaults.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("HUBLINK")
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = Settings::merge(partial);
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests;
