use super::types::*;
use crate::config::{expand_env_vars, expand_host_vars, expand_tilde, ENV_VAR_PATTERN};
use regex::Regex;
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
    load_config_with(path, &HostFacts::default())
}

/// Load a config file, resolving `${instance.*}` references and defaults
/// from `host`.
pub fn load_config_with(path: &Path, host: &HostFacts) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config_with(&yaml_string, host).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse, resolve defaults and validate a config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    parse_config_with(yaml, &HostFacts::default())
}

pub fn parse_config_with(yaml: &str, host: &HostFacts) -> Result<Config, ConfigError> {
    let env = |name: &str| std::env::var(name).ok();

    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;
    let yaml_string = expand_host_vars(&yaml_string, env, &host.instance);

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    expand_paths(&mut config);
    resolve_defaults(&mut config, env, host);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded_vars: Vec<&str> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
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
             Set it (export {0}=...) or replace $env{{{0}}} in the config file with a value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             Set them or replace the references in the config file with values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.state_file = expand_tilde(&config.state_file);
    if let Some(directory) = &config.journal.directory {
        config.journal.directory = Some(expand_tilde(directory));
    }
}

/// Fill in values that default to something outside the file.
fn resolve_defaults<F>(config: &mut Config, env: F, host: &HostFacts)
where
    F: Fn(&str) -> Option<String>,
{
    if config.instance_id.trim().is_empty() {
        config.instance_id = match host.instance_id() {
            Some(id) => id.to_string(),
            None => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default(),
        };
    }
    if config.log_stream.trim().is_empty() {
        config.log_stream = config.instance_id.clone();
    }
    config.aws.region = resolve_region(&config.aws.region, env);
    if config.aws.region.is_empty() {
        if let Some(region) = host.region() {
            config.aws.region = region.to_string();
        }
    }
}

/// Explicit region, else `AWS_REGION`, else `AWS_DEFAULT_REGION`.
pub fn resolve_region<F>(explicit: &str, env: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if !explicit.trim().is_empty() {
        return explicit.trim().to_string();
    }
    ["AWS_REGION", "AWS_DEFAULT_REGION"]
        .iter()
        .filter_map(|name| env(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.log_group.trim().is_empty() {
        errors.push("log_group must not be empty".to_string());
    }
    if config.log_stream.trim().is_empty() {
        errors.push(
            "log_stream is not set and no instance_id could be determined from instance metadata or the host name"
                .to_string(),
        );
    }
    if config.state_file.as_os_str().is_empty() {
        errors.push("state_file must not be empty".to_string());
    }
    if config.aws.region.is_empty() {
        errors.push(
            "aws.region is not set; set it in the config or via AWS_REGION/AWS_DEFAULT_REGION, or run on EC2"
                .to_string(),
        );
    }
    if let Some(endpoint) = &config.aws.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            errors.push(format!(
                "aws.endpoint '{endpoint}' must start with http:// or https://"
            ));
        }
    }
    if config.aws.timeout.is_zero() {
        errors.push("aws.timeout must be greater than zero".to_string());
    }
    if !(1..=MAX_BATCH_SIZE).contains(&config.batch.max_size) {
        errors.push(format!(
            "batch.max_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
            config.batch.max_size
        ));
    }
    if config.batch.linger.is_zero() {
        errors.push("batch.linger must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
