use super::types::*;
use crate::backfill::schedule::Schedule;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::time::PartitionSchema;
use std::collections::HashSet;
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

/// Reads, expands and validates the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parses and validates config text.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Expands tilde (~) in the derivation program path.
fn expand_paths(config: &mut Config) {
    if let Some(program) = config.derivation.command.first_mut() {
        *program = expand_tilde(Path::new(program.as_str()))
            .to_string_lossy()
            .into_owned();
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_archive(&config.archive, &mut errors);
    validate_backfill(&config.backfill, &mut errors);
    validate_streams(config, &mut errors);

    if config.derivation.command.first().map_or(true, |p| p.trim().is_empty()) {
        errors.push("derivation.command must name a program".to_string());
    }
    if config.derivation.timeout.is_some_and(|t| t.is_zero()) {
        errors.push("derivation.timeout must be positive when set".to_string());
    }

    if config.web.enabled && config.web.listen.parse::<SocketAddr>().is_err() {
        errors.push(format!(
            "web.listen: invalid listen address '{}'",
            config.web.listen
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_archive(archive: &ArchiveConfig, errors: &mut Vec<String>) {
    if archive.bucket_duration <= 0 {
        errors.push(format!(
            "archive.bucketDuration must be positive, got {}",
            archive.bucket_duration
        ));
    }
    if let Err(e) = archive.partitioning.parse::<PartitionSchema>() {
        errors.push(format!("archive.partitioning: {}", e));
    }
}

fn validate_backfill(backfill: &BackfillConfig, errors: &mut Vec<String>) {
    if backfill.max_segment_size == 0 {
        errors.push("backfill.maxSegmentSize must be positive".to_string());
    }
    if backfill.stream_update_fill_frequency == 0 {
        errors.push("backfill.streamUpdateFillFrequency must be positive".to_string());
    }
    for (index, entry) in backfill.schedule.iter().enumerate() {
        if let Err(e) = Schedule::from_config(index, entry) {
            errors.push(format!("backfill.{}", e));
        }
    }
}

fn validate_streams(config: &Config, errors: &mut Vec<String>) {
    let mut declared = HashSet::new();
    for name in config.declared_streams() {
        if name.trim().is_empty() {
            errors.push("streams: stream names cannot be empty".to_string());
        } else if !declared.insert(name.as_str()) {
            errors.push(format!("streams: duplicate stream '{}'", name));
        }
    }

    for name in config.monitored_streams() {
        if !declared.contains(name.as_str()) {
            errors.push(format!(
                "backfill.monitorStreams references undeclared stream '{}'",
                name
            ));
        }
    }
}
