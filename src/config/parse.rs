use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut config = parse_config(&yaml).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    // Relative paths are resolved against the config file's directory.
    if let Some(base) = path.parent() {
        for p in [&mut config.source.path, &mut config.target.path] {
            if p.is_relative() && !p.as_os_str().is_empty() {
                *p = base.join(&*p);
            }
        }
    }

    Ok(config)
}

/// Parse and validate a YAML document. Environment variables and `~` are expanded.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    config.source.path = expand_tilde(&config.source.path);
    config.target.path = expand_tilde(&config.target.path);

    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let mut unset: Vec<&str> = env_var_pattern()
        .captures_iter(yaml)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();

    if unset.is_empty() {
        return Ok(());
    }
    unset.sort_unstable();
    unset.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         \n\
         Set them (e.g. export {}=...) or replace the $env{{..}} references with literal values",
        unset.join(", "),
        unset[0]
    )))
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.source.path.as_os_str().is_empty() {
        errors.push("source.path cannot be empty".to_string());
    }
    if config.source.poll_interval.is_zero() {
        errors.push("source.poll_interval must be greater than zero".to_string());
    }
    for entry in &config.source.include_tables {
        if entry.trim().is_empty() || entry.split('.').count() > 2 {
            errors.push(format!(
                "source.include_tables: '{}' is not of the form 'schema.table' or 'schema.*'",
                entry
            ));
        }
    }

    if config.target.path.as_os_str().is_empty() {
        errors.push("target.path cannot be empty".to_string());
    }

    let batch = &config.batch;
    if batch.max_rows == 0 {
        errors.push("batch.max_rows must be at least 1".to_string());
    }
    if batch.max_bytes == 0 {
        errors.push("batch.max_bytes must be at least 1".to_string());
    }
    if batch.max_buffered_rows < batch.max_rows {
        errors.push(format!(
            "batch.max_buffered_rows ({}) must be at least batch.max_rows ({})",
            batch.max_buffered_rows, batch.max_rows
        ));
    }
    if batch.max_parked_rows == 0 {
        errors.push("batch.max_parked_rows must be at least 1".to_string());
    }
    if batch.check_interval.is_zero() {
        errors.push("batch.check_interval must be greater than zero".to_string());
    }

    let writer = &config.writer;
    if writer.max_attempts == 0 {
        errors.push("writer.max_attempts must be at least 1".to_string());
    }
    if writer.initial_backoff > writer.max_backoff {
        errors.push(format!(
            "writer.initial_backoff ({:?}) exceeds writer.max_backoff ({:?})",
            writer.initial_backoff, writer.max_backoff
        ));
    }

    if config.schema.max_pending_events == 0 {
        errors.push("schema.max_pending_events must be at least 1".to_string());
    }

    if let Some(web) = &config.web {
        if web.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "web.listen: '{}' is not a valid socket address",
                web.listen
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
