//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The YAML shape is the core [`Config`] itself; every field has a safe
//! default, so a minimal deployment only sets `receiver_base_url` and
//! `auth_token`.

use std::path::Path;

use anyhow::{Context, Result};
use e2cast_core::Config;

/// Loads the core configuration from an optional YAML file, then applies
/// environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies `E2CAST_*` environment variable overrides.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("E2CAST_BIND_PORT") {
        if let Ok(port) = val.parse() {
            config.preferred_port = port;
        }
    }

    if let Ok(val) = std::env::var("E2CAST_RECEIVER_BASE_URL") {
        config.receiver_base_url = val;
    }

    if let Ok(val) = std::env::var("E2CAST_AUTH_TOKEN") {
        config.auth_token = val;
    }

    if let Ok(val) = std::env::var("E2CAST_HLS_ROOT") {
        config.hls_root = val.into();
    }

    if let Ok(val) = std::env::var("E2CAST_STORE_BACKEND") {
        config.store_backend = val;
    }

    if let Ok(val) = std::env::var("E2CAST_STORE_PATH") {
        config.store_path = Some(val.into());
    }

    if let Ok(val) = std::env::var("E2CAST_TUNER_SLOTS") {
        let slots: Vec<u32> = val
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if !slots.is_empty() {
            config.tuner_slots = slots;
        }
    }
}
