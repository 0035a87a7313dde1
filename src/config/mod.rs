pub mod parse;
pub mod types;

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use parse::{load_config, load_config_with, parse_config, parse_config_with, ConfigError};
pub use types::{AwsConfig, BatchConfig, Config, HostFacts, JournalConfig};

/// `$env{VAR_NAME}`: a letter or underscore, then alphanumerics or underscores.
pub(crate) const ENV_VAR_PATTERN: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// `${env.NAME}` or `${instance.NAME}`.
const HOST_VAR_PATTERN: &str = r"\$\{(env|instance)\.([A-Za-z_][A-Za-z0-9_]*)\}";

/// Config files tried, in order, when none is given on the command line.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = [
    "~/.config/journald-cloudwatch/config.yml",
    "/etc/journald-cloudwatch/config.yml",
];

/// Expands `$env{VAR_NAME}` references from the environment.
/// Unset variables are left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let Ok(re) = Regex::new(ENV_VAR_PATTERN) else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &regex::Captures| {
        caps.get(1)
            .and_then(|name| std::env::var(name.as_str()).ok())
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Expands `${env.NAME}` through `env` and `${instance.NAME}` from the
/// instance identity fields. Unknown names expand to an empty string.
pub fn expand_host_vars<F>(text: &str, env: F, instance: &HashMap<String, String>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let Ok(re) = Regex::new(HOST_VAR_PATTERN) else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &regex::Captures| match &caps[1] {
        "env" => env(&caps[2]).unwrap_or_default(),
        _ => instance.get(&caps[2]).cloned().unwrap_or_default(),
    })
    .into_owned()
}

/// Expands a leading `~` to the user's home directory.
/// Returns the path unchanged if there is none or the home directory is unknown.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// The explicit path (tilde-expanded) if given, else the first existing
/// default location.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    DEFAULT_CONFIG_PATHS
        .iter()
        .map(|p| expand_tilde(Path::new(p)))
        .find(|p| p.exists())
}
