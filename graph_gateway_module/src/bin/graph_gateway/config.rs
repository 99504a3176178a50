use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

pub(super) const DEFAULT_PORT: u16 = 9200;
pub(super) const DEFAULT_RENEW_INTERVAL_SECS: u64 = 900;
pub(super) const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
pub(super) const DEFAULT_DB_PATH: &str = ".graph_gateway/graph.db";

#[derive(Debug, Deserialize, Default)]
pub(super) struct GatewayConfigFile {
    #[serde(default)]
    pub(super) server: GatewayServerConfig,
    #[serde(default)]
    pub(super) schedule: GatewayScheduleConfig,
    #[serde(default)]
    pub(super) storage: GatewayStorageConfig,
    #[serde(default)]
    pub(super) tickets: GatewayTicketsConfig,
}

#[derive(Debug, Deserialize, Default)]
pub(super) struct GatewayServerConfig {
    pub(super) host: Option<String>,
    pub(super) port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub(super) struct GatewayScheduleConfig {
    pub(super) renew_interval_secs: Option<u64>,
    pub(super) sync_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(super) struct GatewayStorageConfig {
    pub(super) db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(super) struct GatewayTicketsConfig {
    pub(super) api_base_url: Option<String>,
}

/// `None` when neither `GRAPH_GATEWAY_CONFIG_PATH` nor `./graph_gateway.toml` exists.
pub(super) fn resolve_gateway_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("GRAPH_GATEWAY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let direct = env::current_dir().ok()?.join("graph_gateway.toml");
    direct.exists().then_some(direct)
}

pub(super) fn load_gateway_config(path: &Path) -> Result<GatewayConfigFile, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read graph gateway config: {}", err))?;
    parse_gateway_config(&content)
}

pub(super) fn parse_gateway_config(content: &str) -> Result<GatewayConfigFile, String> {
    toml::from_str::<GatewayConfigFile>(content)
        .map_err(|err| format!("failed to parse graph gateway config: {}", err))
}

/// Environment first, then the file, then the default.
pub(super) fn env_or<T: std::str::FromStr>(key: &str, file_value: Option<T>, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .or(file_value)
        .unwrap_or(default)
}

pub(super) fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
