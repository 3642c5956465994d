use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};

use crate::models;
use crate::tokenizer::DEFAULT_TOKEN_BUDGET;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_BIND: &str = "0.0.0.0:64133";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

type EnvLookup = dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub hook_url: Option<String>,
    pub database_url: String,
    pub api_key: String,
    pub api_url: String,
    pub auth_token: String,
    pub bind: SocketAddr,
    pub token_budget: usize,
    pub models: BTreeMap<i64, String>,
    pub request_timeout_secs: u64,
    pub offline_mode: bool,
    pub log_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hook_url: None,
            database_url: "memory:".to_string(),
            api_key: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: String::new(),
            bind: SocketAddr::from(([0, 0, 0, 0], 64133)),
            token_budget: DEFAULT_TOKEN_BUDGET,
            models: models::default_models(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            offline_mode: false,
            log_path: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    hook_url: Option<String>,
    database_url: Option<String>,
    openai_api_key: Option<String>,
    openai_api_url: Option<String>,
    authorization_token: Option<String>,
    bind: Option<String>,
    token_budget: Option<usize>,
    #[serde_as(as = "Option<BTreeMap<DisplayFromStr, _>>")]
    models: Option<BTreeMap<i64, String>>,
    request_timeout_secs: Option<u64>,
    offline_mode: Option<bool>,
    log_path: Option<String>,
}

impl AppConfig {
    /// Builds the configuration from the TOML file (explicit path or the
    /// platform config dir), then environment overrides, then defaults.
    /// `force_offline` comes from the command line and wins over both.
    pub fn load(path_override: Option<&Path>, force_offline: bool) -> Result<Self> {
        info!("Loading application configuration");
        trace!("Reading file config");
        let file_cfg = read_file_config(path_override)?;
        Self::resolve(file_cfg, force_offline, &|name: &str| std::env::var(name).ok())
    }

    /// `env` looks up an environment variable by name.
    fn resolve(file_cfg: FileConfig, force_offline: bool, env: &EnvLookup) -> Result<Self> {
        let offline_mode = force_offline
            || resolve_bool(env, "CHATRELAY_OFFLINE")
                .or(file_cfg.offline_mode)
                .unwrap_or(false);
        if offline_mode {
            warn!("Offline mode enabled");
        }

        let auth_token = env_value(env, "CHATRELAY_AUTH_TOKEN")
            .or(file_cfg.authorization_token)
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "Missing authorization token.\nSet CHATRELAY_AUTH_TOKEN \
                     or add `authorization_token = \"...\"` to the config file"
                )
            })?;
        debug!("Authorization token resolved (length: {} chars)", auth_token.len());

        let api_key = match resolve_api_key(env, file_cfg.openai_api_key) {
            Some(key) => key,
            None if offline_mode => String::new(),
            None => {
                return Err(anyhow!(
                    "Missing API key.\nSet CHATRELAY_API_KEY / OPENAI_API_KEY \
                     or add `openai_api_key = \"sk-...\"` to the config file"
                ));
            }
        };

        let api_url = file_cfg
            .openai_api_url
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        info!("API URL: {}", api_url);

        let database_url = env_value(env, "CHATRELAY_DATABASE_URL")
            .or(file_cfg.database_url)
            .unwrap_or_else(|| default_database_path().display().to_string());
        info!("Database: {}", database_url);

        let bind_raw = env_value(env, "CHATRELAY_BIND")
            .or(file_cfg.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse()
            .with_context(|| format!("invalid bind address {bind_raw:?}"))?;

        let hook_url = env_value(env, "CHATRELAY_HOOK_URL").or(file_cfg.hook_url);
        if hook_url.is_none() {
            debug!("No webhook configured; notifications go to the log only");
        }

        let token_budget = file_cfg.token_budget.unwrap_or(DEFAULT_TOKEN_BUDGET);
        debug!("Token budget: {}", token_budget);

        let models = file_cfg.models.unwrap_or_else(models::default_models);
        debug!("Model table: {:?}", models);

        let log_path = env_value(env, "CHATRELAY_LOG")
            .or(file_cfg.log_path)
            .map(PathBuf::from);

        info!("Configuration loaded successfully");
        Ok(Self {
            hook_url,
            database_url,
            api_key,
            api_url,
            auth_token,
            bind,
            token_budget,
            models,
            request_timeout_secs: file_cfg.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            offline_mode,
            log_path,
        })
    }
}

fn read_file_config(path_override: Option<&Path>) -> Result<FileConfig> {
    let path = match path_override {
        Some(path) => path.to_path_buf(),
        None => {
            let Some(path) = config_file_path() else {
                debug!("No config file path found, using defaults");
                return Ok(FileConfig::default());
            };
            if !path.exists() {
                debug!(
                    "Config file does not exist: {}, using defaults",
                    path.display()
                );
                return Ok(FileConfig::default());
            }
            path
        }
    };

    info!("Reading config file: {}", path.display());
    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    parse_file_config(&data).with_context(|| {
        format!(
            "invalid TOML in {} (make sure string values are quoted)",
            path.display()
        )
    })
}

fn parse_file_config(data: &str) -> Result<FileConfig> {
    trace!("Parsing TOML config");
    Ok(toml::from_str(data)?)
}

fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatrelay").join("config.toml"))
}

fn default_database_path() -> PathBuf {
    let base = dirs::data_dir().or_else(|| dirs::home_dir().map(|h| h.join(".local/share")));
    base.unwrap_or_else(|| PathBuf::from("."))
        .join("chatrelay")
        .join("chatrelay.db")
}

fn resolve_api_key(env: &EnvLookup, file_key: Option<String>) -> Option<String> {
    env_value(env, "CHATRELAY_API_KEY")
        .or_else(|| env_value(env, "OPENAI_API_KEY"))
        .or(file_key)
        .filter(|key| !key.trim().is_empty())
}

fn env_value(env: &EnvLookup, name: &str) -> Option<String> {
    env(name).filter(|v| !v.trim().is_empty())
}

fn resolve_bool(env: &EnvLookup, name: &str) -> Option<bool> {
    let val = env_value(env, name)?;
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
