//! Application configuration (gateway identity + storage). Load from TOML or env.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Global application configuration shared by the gateway and tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AulaConfig {
    /// Application identity (e.g. "Aula Classroom Gateway").
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the sled moderation store.
    pub storage_path: String,
    /// Capacity of the moderation event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl AulaConfig {
    /// Load config from file and environment. Precedence: env `AULA_CONFIG`
    /// path > `config/gateway.toml` > defaults, then `AULA__*` env overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("AULA_CONFIG").unwrap_or_else(|_| "config/gateway".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Aula Gateway")?
            .set_default("port", 8002_i64)?
            .set_default("storage_path", "./data")?
            .set_default("event_capacity", 256_i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("AULA").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

impl Default for AulaConfig {
    fn default() -> Self {
        Self {
            app_name: "Aula Gateway".to_string(),
            port: 8002,
            storage_path: "./data".to_string(),
            event_capacity: 256,
        }
    }
}
