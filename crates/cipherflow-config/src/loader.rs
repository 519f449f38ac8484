// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! This module implements the 3-tier configuration loading system:
//! 1. TOML file (base defaults)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)

use crate::{validate_config, CipherflowConfig, ConfigError, ConfigResult};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "cipherflow.toml";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "CIPHERFLOW_CONFIG_PATH";

/// Find the cipherflow configuration file
///
/// Search order:
/// 1. `CIPHERFLOW_CONFIG_PATH` environment variable
/// 2. Current working directory: `./cipherflow.toml`
/// 3. Up to 5 parent directories
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by {} not found: {}",
            CONFIG_PATH_ENV,
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));

        let mut current = cwd.clone();
        for _ in 0..5 {
            if let Some(parent) = current.parent() {
                search_paths.push(parent.join(CONFIG_FILE_NAME));
                current = parent.to_path_buf();
            }
        }
    }

    for path in &search_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "'{}' not found in any of these locations:\n{}\n\nSet {} to specify a custom location.",
        CONFIG_FILE_NAME, search_list, CONFIG_PATH_ENV
    )))
}

/// Load configuration from TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if config file is not found, contains invalid TOML, or fails validation
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<CipherflowConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file).map_err(|source| ConfigError::IoError {
        path: config_file.clone(),
        source,
    })?;
    let mut config: CipherflowConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config);
    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    validate_config(&config)?;
    Ok(config)
}

fn parse_flag(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower == "true" || lower == "1" || lower == "yes"
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `CIPHERFLOW_PARALLELISM` -> `runtime.parallelism`
/// - `CIPHERFLOW_DETERMINISTIC` -> `runtime.deterministic_order`
/// - `CIPHERFLOW_KEY_CACHE_CAPACITY` -> `keys.cache_capacity`
/// - `CIPHERFLOW_SECRET_SEED` -> `keys.secret_seed`
/// - `CIPHERFLOW_ENCRYPTION_SEED` -> `keys.encryption_seed`
/// - `CIPHERFLOW_ACCELERATOR` -> `accelerator.enabled`
/// - `CIPHERFLOW_DEVICE_COUNT` -> `accelerator.device_count`
/// - `CIPHERFLOW_SIMULATION` -> `simulation.enabled`
/// - `CIPHERFLOW_REMOTE_WORKERS` -> `distributed.remote_workers`
/// - `CIPHERFLOW_REMOTE_ACK_TIMEOUT_MS` -> `distributed.ack_timeout_ms`
/// - `CIPHERFLOW_LOG_LEVEL` -> `logging.level`
pub fn apply_environment_overrides(config: &mut CipherflowConfig) {
    if let Ok(value) = env::var("CIPHERFLOW_PARALLELISM") {
        if let Ok(parallelism) = value.parse::<usize>() {
            config.runtime.parallelism = parallelism;
        }
    }
    if let Ok(value) = env::var("CIPHERFLOW_DETERMINISTIC") {
        config.runtime.deterministic_order = parse_flag(&value);
    }

    if let Ok(value) = env::var("CIPHERFLOW_KEY_CACHE_CAPACITY") {
        if let Ok(capacity) = value.parse::<usize>() {
            config.keys.cache_capacity = capacity;
        }
    }
    if let Ok(value) = env::var("CIPHERFLOW_SECRET_SEED") {
        if let Ok(seed) = value.parse::<u64>() {
            config.keys.secret_seed = seed;
        }
    }
    if let Ok(value) = env::var("CIPHERFLOW_ENCRYPTION_SEED") {
        if let Ok(seed) = value.parse::<u64>() {
            config.keys.encryption_seed = seed;
        }
    }

    if let Ok(value) = env::var("CIPHERFLOW_ACCELERATOR") {
        config.accelerator.enabled = parse_flag(&value);
    }
    if let Ok(value) = env::var("CIPHERFLOW_DEVICE_COUNT") {
        if let Ok(count) = value.parse::<usize>() {
            config.accelerator.device_count = count;
        }
    }

    if let Ok(value) = env::var("CIPHERFLOW_SIMULATION") {
        config.simulation.enabled = parse_flag(&value);
    }

    if let Ok(value) = env::var("CIPHERFLOW_REMOTE_WORKERS") {
        if let Ok(workers) = value.parse::<usize>() {
            config.distributed.remote_workers = workers;
        }
    }
    if let Ok(value) = env::var("CIPHERFLOW_REMOTE_ACK_TIMEOUT_MS") {
        if let Ok(timeout) = value.parse::<u64>() {
            config.distributed.ack_timeout_ms = timeout;
        }
    }

    if let Ok(value) = env::var("CIPHERFLOW_LOG_LEVEL") {
        config.logging.level = value.to_lowercase();
    }
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - Map of CLI arguments (e.g., `{"parallelism": "8", "simulation": "true"}`)
pub fn apply_cli_overrides(config: &mut CipherflowConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("parallelism") {
        if let Ok(parallelism) = value.parse::<usize>() {
            config.runtime.parallelism = parallelism;
        }
    }
    if let Some(value) = cli_args.get("deterministic") {
        config.runtime.deterministic_order = parse_flag(value);
    }
    if let Some(value) = cli_args.get("elide_dead_nodes") {
        config.runtime.elide_dead_nodes = parse_flag(value);
    }

    if let Some(value) = cli_args.get("key_cache_capacity") {
        if let Ok(capacity) = value.parse::<usize>() {
            config.keys.cache_capacity = capacity;
        }
    }

    if let Some(value) = cli_args.get("accelerator") {
        config.accelerator.enabled = parse_flag(value);
    }
    if let Some(value) = cli_args.get("device_selection") {
        config.accelerator.selection = value.clone();
    }
    if let Some(value) = cli_args.get("cpu_fallback") {
        config.accelerator.cpu_fallback = parse_flag(value);
    }

    if let Some(value) = cli_args.get("simulation") {
        config.simulation.enabled = parse_flag(value);
    }

    if let Some(value) = cli_args.get("remote_ack_timeout_ms") {
        if let Ok(timeout) = value.parse::<u64>() {
            config.distributed.ack_timeout_ms = timeout;
        }
    }

    if let Some(value) = cli_args.get("log_level") {
        config.logging.level = value.to_lowercase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_find_config_file_env_var() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("custom_config.toml");
        File::create(&config_path).unwrap();

        env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var(CONFIG_PATH_ENV);

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_find_config_file_env_var_missing() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        env::set_var(CONFIG_PATH_ENV, "/definitely/not/here/cipherflow.toml");
        let result = find_config_file();
        env::remove_var(CONFIG_PATH_ENV);

        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_minimal_config() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        env::remove_var("CIPHERFLOW_PARALLELISM");
        env::remove_var("CIPHERFLOW_KEY_CACHE_CAPACITY");
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[runtime]").unwrap();
        writeln!(file, "parallelism = 4").unwrap();
        writeln!(file, "deterministic_order = true").unwrap();
        writeln!(file, "[keys]").unwrap();
        writeln!(file, "cache_capacity = 8").unwrap();

        let config = load_config(Some(&config_path), None).unwrap();

        assert_eq!(config.runtime.parallelism, 4);
        assert!(config.runtime.deterministic_order);
        assert_eq!(config.keys.cache_capacity, 8);
        assert!(config.runtime.elide_dead_nodes);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "[runtime\nparallelism = ").unwrap();

        let result = load_config(Some(&config_path), None);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_environment_overrides() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let mut config = CipherflowConfig::default();

        env::set_var("CIPHERFLOW_PARALLELISM", "12");
        env::set_var("CIPHERFLOW_SIMULATION", "yes");
        env::set_var("CIPHERFLOW_REMOTE_ACK_TIMEOUT_MS", "250");

        apply_environment_overrides(&mut config);

        env::remove_var("CIPHERFLOW_PARALLELISM");
        env::remove_var("CIPHERFLOW_SIMULATION");
        env::remove_var("CIPHERFLOW_REMOTE_ACK_TIMEOUT_MS");

        assert_eq!(config.runtime.parallelism, 12);
        assert!(config.simulation.enabled);
        assert_eq!(config.distributed.ack_timeout_ms, 250);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = CipherflowConfig::default();
        let mut cli_args = HashMap::new();
        cli_args.insert("parallelism".to_string(), "3".to_string());
        cli_args.insert("device_selection".to_string(), "least_loaded".to_string());
        cli_args.insert("remote_ack_timeout_ms".to_string(), "40".to_string());

        apply_cli_overrides(&mut config, &cli_args);

        assert_eq!(config.runtime.parallelism, 3);
        assert_eq!(config.accelerator.selection, "least_loaded");
        assert_eq!(config.distributed.ack_timeout_ms, 40);
    }

    #[test]
    fn test_override_precedence() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[runtime]").unwrap();
        writeln!(file, "parallelism = 2").unwrap();
        writeln!(file, "[keys]").unwrap();
        writeln!(file, "cache_capacity = 4").unwrap();

        env::set_var("CIPHERFLOW_PARALLELISM", "6");
        env::set_var("CIPHERFLOW_KEY_CACHE_CAPACITY", "16");

        let mut cli_args = HashMap::new();
        cli_args.insert("parallelism".to_string(), "10".to_string());

        let config = load_config(Some(&config_path), Some(&cli_args)).unwrap();

        env::remove_var("CIPHERFLOW_PARALLELISM");
        env::remove_var("CIPHERFLOW_KEY_CACHE_CAPACITY");

        // CLI wins for parallelism, env wins for capacity (no CLI override)
        assert_eq!(config.runtime.parallelism, 10);
        assert_eq!(config.keys.cache_capacity, 16);
    }
}
