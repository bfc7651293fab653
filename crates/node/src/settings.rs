//! Engine configuration loading

use config::{Config, Environment, File};
use std::env;

use oracle_core::{EngineConfig, OracleError, OracleResult};

/// Environment variable naming the config file (without extension)
pub const CONFIG_PATH_VAR: &str = "ORACLE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/oracle";
const ENV_PREFIX: &str = "ORACLE";

/// Load from the optional config file, then `ORACLE__*` overrides
pub fn load() -> OracleResult<EngineConfig> {
    let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(&path, env_source())
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

fn load_from(path: &str, env: Environment) -> OracleResult<EngineConfig> {
    let config: EngineConfig = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(env)
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| OracleError::Config(e.to_string()))?;

    config.validate()?;
    Ok(config)
}
