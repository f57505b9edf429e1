use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Every variable has a default; values that are set but malformed fail startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    pub data_dir: PathBuf,
    pub store_name: String,
    pub typst_bin: PathBuf,
    pub compiler_asset_url: Option<String>,
    pub renderer_asset_url: Option<String>,
    pub asset_cache_dir: PathBuf,
    pub cache_check_timeout: Duration,
    pub template_defaults_url: Option<String>,
    pub expr_timeout: Duration,
    pub anthropic_api_key: Option<String>,
    /// Messages API endpoint override, e.g. for a proxy.
    pub anthropic_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));
        let asset_cache_dir = optional_env("ASSET_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(".asset-cache"));

        Ok(Config {
            port: env_or("PORT", "8080")
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: env_or("RUST_LOG", "info"),
            store_name: env_or("STORE_NAME", "resume-bandhuu"),
            typst_bin: PathBuf::from(env_or("TYPST_BIN", "typst")),
            compiler_asset_url: optional_env("COMPILER_ASSET_URL"),
            renderer_asset_url: optional_env("RENDERER_ASSET_URL"),
            cache_check_timeout: Duration::from_millis(
                env_or("CACHE_CHECK_TIMEOUT_MS", "4")
                    .parse::<u64>()
                    .context("CACHE_CHECK_TIMEOUT_MS must be a whole number of milliseconds")?,
            ),
            template_defaults_url: optional_env("TEMPLATE_DEFAULTS_URL"),
            expr_timeout: Duration::from_millis(
                env_or("EXPR_TIMEOUT_MS", "2000")
                    .parse::<u64>()
                    .context("EXPR_TIMEOUT_MS must be a whole number of milliseconds")?,
            ),
            anthropic_api_key: optional_env("ANTHROPIC_API_KEY"),
            anthropic_base_url: optional_env("ANTHROPIC_BASE_URL"),
            data_dir,
            asset_cache_dir,
        })
    }

    /// Directory holding the persisted document store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join(&self.store_name)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Unset and empty variables are both `None`.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
