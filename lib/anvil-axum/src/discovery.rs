//! Service discovery strategy from settings.
//!
//! `<prefix>.service_discovery` names the strategy; its parameters are read
//! from `<prefix>.<strategy>_sd_config`, one `key value` per line.

use std::sync::Arc;

use anvil::ServiceDiscovery;
use anvil::discovery::{
    ConsulConfig, ConsulDiscovery, Endpoints, NomadConfig, NomadDiscovery, RouterConfig,
    RouterDiscovery, StaticDiscovery,
};

use crate::ConfigurationError;
use crate::settings::{ListMode, ParsedList, Settings, parse_list};

/// Known strategies, as listed in error messages.
const STRATEGIES: &str = "nomad, consul, router, static";

/// Builds the discovery strategy of the client configured under `prefix`.
///
/// # Errors
///
/// Fails when the strategy is missing or unknown, or when its configuration
/// is malformed.
pub fn build_sd_strategy(
    settings: &Settings,
    prefix: &str,
) -> Result<Arc<dyn ServiceDiscovery>, ConfigurationError> {
    let setting = format!("{prefix}.service_discovery");
    let name = settings
        .text(&setting)
        .ok_or_else(|| ConfigurationError::MissingSetting(setting.clone()))?;

    let config_key = format!("{prefix}.{name}_sd_config");
    let strategy: Arc<dyn ServiceDiscovery> = match name {
        "static" => Arc::new(build_static(settings, &config_key)?),
        "consul" => Arc::new(build_consul(settings, &config_key)?),
        "router" => Arc::new(build_router(settings, &config_key)?),
        "nomad" => Arc::new(build_nomad(settings, &config_key)?),
        other => {
            return Err(ConfigurationError::InvalidChoice {
                value: other.to_string(),
                setting,
                choices: STRATEGIES.to_string(),
            });
        }
    };
    tracing::debug!(prefix, strategy = name, "built service discovery");
    Ok(strategy)
}

/// `<service>[/<version>] <url>` lines.
fn build_static(settings: &Settings, key: &str) -> Result<StaticDiscovery, ConfigurationError> {
    let endpoints: Endpoints = parse_list(settings, key, ListMode::Pairs)?
        .iter()
        .filter_map(|(service, url)| {
            let url = url.as_text()?.to_string();
            let key = match service.split_once('/') {
                Some((service, version)) => (service.to_string(), Some(version.to_string())),
                None => (service.to_string(), None),
            };
            Some((key, url))
        })
        .collect();
    Ok(StaticDiscovery::new(endpoints))
}

fn build_consul(settings: &Settings, key: &str) -> Result<ConsulDiscovery, ConfigurationError> {
    let mut config = ConsulConfig::default();
    for (name, value) in params(settings, key)? {
        match name.as_str() {
            "addr" => config.addr = value,
            "service_name_fmt" => config.service_name_fmt = value,
            "service_url_fmt" => config.service_url_fmt = value,
            "unversioned_service_name_fmt" => config.unversioned_service_name_fmt = value,
            "unversioned_service_url_fmt" => config.unversioned_service_url_fmt = value,
            "consul_token" => config.consul_token = Some(value),
            _ => ignored(key, &name),
        }
    }
    Ok(ConsulDiscovery::new(config))
}

fn build_router(settings: &Settings, key: &str) -> Result<RouterDiscovery, ConfigurationError> {
    let mut config = RouterConfig::default();
    for (name, value) in params(settings, key)? {
        match name.as_str() {
            "service_url_fmt" => config.service_url_fmt = value,
            "unversioned_service_url_fmt" => config.unversioned_service_url_fmt = value,
            _ => ignored(key, &name),
        }
    }
    Ok(RouterDiscovery::new(config))
}

fn build_nomad(settings: &Settings, key: &str) -> Result<NomadDiscovery, ConfigurationError> {
    let mut config = NomadConfig::default();
    for (name, value) in params(settings, key)? {
        match name.as_str() {
            "service_env_fmt" => config.service_env_fmt = value,
            "unversioned_service_env_fmt" => config.unversioned_service_env_fmt = value,
            "service_url_fmt" => config.service_url_fmt = value,
            "unversioned_service_url_fmt" => config.unversioned_service_url_fmt = value,
            _ => ignored(key, &name),
        }
    }
    Ok(NomadDiscovery::new(config))
}

/// Text parameters of a block, last occurrence winning, in first-appearance order.
fn params(settings: &Settings, key: &str) -> Result<Vec<(String, String)>, ConfigurationError> {
    let parsed: ParsedList = parse_list(settings, key, ListMode::Pairs)?;
    Ok(parsed
        .keys()
        .into_iter()
        .filter_map(|name| parsed.text(name).map(|value| (name.to_string(), value.to_string())))
        .collect())
}

fn ignored(setting: &str, key: &str) {
    tracing::warn!(setting, key, "ignoring unknown service discovery parameter");
}
