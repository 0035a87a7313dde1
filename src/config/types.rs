use crate::source::record::Priority;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log_group: String,
    /// Defaults to the instance id.
    #[serde(default)]
    pub log_stream: String,
    pub state_file: PathBuf,
    /// Defaults to the EC2 instance id, else the host name.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Falls back to `AWS_REGION`, `AWS_DEFAULT_REGION`, then the
    /// instance's region.
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            endpoint: None,
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalConfig {
    pub directory: Option<PathBuf>,
    #[serde(default, deserialize_with = "priority_value")]
    pub priority: Option<Priority>,
    #[serde(default, deserialize_with = "unit_list")]
    pub units: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_linger", with = "humantime_serde")]
    pub linger: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            linger: default_linger(),
        }
    }
}

fn default_max_size() -> usize {
    100
}

fn default_linger() -> Duration {
    Duration::from_secs(1)
}

pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityValue {
    Ordinal(i64),
    Name(String),
}

/// `priority: 3` or `priority: err`.
fn priority_value<'de, D>(deserializer: D) -> Result<Option<Priority>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<PriorityValue>::deserialize(deserializer)?;
    let priority = match value {
        None => return Ok(None),
        Some(PriorityValue::Ordinal(n)) => Priority::from_ordinal(n)
            .ok_or_else(|| serde::de::Error::custom(format!("priority {n} is out of range 0..7"))),
        Some(PriorityValue::Name(name)) => name.parse().map_err(serde::de::Error::custom),
    }?;
    Ok(Some(priority))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UnitsValue {
    List(Vec<String>),
    Joined(String),
}

/// `units: [a, b]` or `units: "a, b"`.
fn unit_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let units = match Option::<UnitsValue>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(UnitsValue::List(units)) => units,
        Some(UnitsValue::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(units
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect())
}

/// What the host told us about itself at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFacts {
    /// Instance identity fields keyed by name (`InstanceID`, `Region`, ...).
    /// Empty when not running on EC2.
    pub instance: HashMap<String, String>,
}

impl HostFacts {
    pub fn new(instance: HashMap<String, String>) -> Self {
        Self { instance }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.get("InstanceID")
    }

    pub fn region(&self) -> Option<&str> {
        self.get("Region")
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.instance
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}
