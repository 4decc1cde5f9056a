//! Layered configuration loading for driver hosts

use crate::{Error, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;

/// Load configuration from the conventional locations
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `{NAME}_`)
/// 2. Local overrides (`config/local.{toml,yaml,json}`)
/// 3. Named config file (`config/{name}.{toml,yaml,json}`)
/// 4. Serde defaults of `T`
pub fn load_config<T>(name: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let figment = Figment::new()
        .merge(Toml::file(format!("config/{}.toml", name)))
        .merge(Yaml::file(format!("config/{}.yaml", name)))
        .merge(Json::file(format!("config/{}.json", name)))
        .merge(Toml::file("config/local.toml"))
        .merge(Yaml::file("config/local.yaml"))
        .merge(Json::file("config/local.json"))
        .merge(Env::prefixed(&format!("{}_", name.to_uppercase())).split("__"));

    figment
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))
}

fn file_figment(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(Error::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Load configuration from a specific file
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    file_figment(path.as_ref())?
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load configuration from file: {}", e)))
}

/// Load configuration from a file, then apply `{prefix}`-prefixed
/// environment overrides on top of it
pub fn load_config_with_env<T, P>(path: P, prefix: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    file_figment(path.as_ref())?
        .merge(Env::prefixed(prefix).split("__"))
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))
}
