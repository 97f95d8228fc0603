use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use pinwatch_common::RuntimeConfig;

pub const ENV_CONFIG_PATH: &str = "PINWATCH_CONFIG";
pub const ENV_TOKEN: &str = "PINWATCH_TOKEN";
pub const ENV_BASE_URL: &str = "PINWATCH_BASE_URL";
pub const ENV_HTTP_PORT: &str = "PINWATCH_HTTP_PORT";
pub const ENV_WEB_ROOT: &str = "PINWATCH_WEB_ROOT";

const DEFAULT_HTTP_PORT: u16 = 8080;

/// Read-only access to the JSON runtime config on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_env() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.pinwatch/config.json"));
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means defaults; a malformed one is an error.
    pub async fn load(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup(ENV_TOKEN) {
        runtime.cloud.auth_token = token;
    }
    if let Some(base_url) = lookup(ENV_BASE_URL) {
        runtime.cloud.base_url = base_url;
    }
}

/// Falls back to the default port when the variable is unset or unparsable.
pub fn http_port(lookup: impl Fn(&str) -> Option<String>) -> u16 {
    lookup(ENV_HTTP_PORT)
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT)
}

pub fn web_root(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup(ENV_WEB_ROOT)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("web"))
}
