use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Syslog severity, 0 (most severe) through 7 (least severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

struct PriorityInfo {
    priority: Priority,
    /// Label used when shipping a record.
    label: &'static str,
    /// Keyword understood by `journalctl --priority`.
    keyword: &'static str,
}

// Index is the ordinal.
static PRIORITIES: [PriorityInfo; 8] = [
    PriorityInfo { priority: Priority::Emergency, label: "EMERG", keyword: "emerg" },
    PriorityInfo { priority: Priority::Alert, label: "ALERT", keyword: "alert" },
    PriorityInfo { priority: Priority::Critical, label: "CRITICAL", keyword: "crit" },
    PriorityInfo { priority: Priority::Error, label: "ERROR", keyword: "err" },
    PriorityInfo { priority: Priority::Warning, label: "WARNING", keyword: "warning" },
    PriorityInfo { priority: Priority::Notice, label: "NOTICE", keyword: "notice" },
    PriorityInfo { priority: Priority::Info, label: "INFO", keyword: "info" },
    PriorityInfo { priority: Priority::Debug, label: "DEBUG", keyword: "debug" },
];

impl Priority {
    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| PRIORITIES.get(i))
            .map(|info| info.priority)
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    fn info(self) -> &'static PriorityInfo {
        &PRIORITIES[self as usize]
    }

    /// Label used when shipping a record, e.g. `"ERROR"`.
    pub fn label(self) -> &'static str {
        self.info().label
    }

    /// Keyword understood by `journalctl --priority`, e.g. `"err"`.
    pub fn keyword(self) -> &'static str {
        self.info().keyword
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

#[derive(Debug, Error)]
#[error("'{0}' is not a supported log priority")]
pub struct UnknownPriority(pub String);

impl FromStr for Priority {
    type Err = UnknownPriority;

    /// Accepts either the ordinal ("3") or the journald keyword ("err").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        PRIORITIES
            .iter()
            .find(|info| {
                s == info.priority.ordinal().to_string() || s.eq_ignore_ascii_case(info.keyword)
            })
            .map(|info| info.priority)
            .ok_or_else(|| UnknownPriority(s.to_string()))
    }
}

/// One decoded journal entry.
///
/// Missing source fields stay at their zero value. Empty strings and zero
/// numbers are left out of the shipped JSON, except for the handful of fields
/// that are always meaningful (pid, uid, gid, priority, message).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
    pub pid: i64,
    pub uid: i64,
    pub gid: i64,
    #[serde(rename = "cmdName", skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(rename = "exe", skip_serializing_if = "String::is_empty")]
    pub executable: String,
    #[serde(rename = "cmdLine", skip_serializing_if = "String::is_empty")]
    pub command_line: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub systemd_unit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub boot_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub machine_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transport: String,
    pub priority: Priority,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub errno: i64,
    #[serde(skip_serializing_if = "SyslogFields::is_empty")]
    pub syslog: SyslogFields,
    #[serde(skip_serializing_if = "KernelFields::is_empty")]
    pub kernel: KernelFields,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_tag: String,
    #[serde(rename = "containerID", skip_serializing_if = "String::is_empty")]
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyslogFields {
    #[serde(skip_serializing_if = "is_zero")]
    pub facility: i64,
    #[serde(rename = "ident", skip_serializing_if = "String::is_empty")]
    pub identifier: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub pid: i64,
}

impl SyslogFields {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelFields {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subsystem: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sys_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dev_node: String,
}

impl KernelFields {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// Command name stamped on records the shipper generates about itself.
pub const SYNTHETIC_COMMAND: &str = "journald-cloudwatch";

impl Record {
    /// Build an error record to report a pipeline problem through the shipped
    /// stream rather than through the journal we are reading.
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            command: SYNTHETIC_COMMAND.to_string(),
            priority: Priority::Error,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_labels() {
        assert_eq!(Priority::Emergency.label(), "EMERG");
        assert_eq!(Priority::Critical.label(), "CRITICAL");
        assert_eq!(Priority::Error.label(), "ERROR");
        assert_eq!(Priority::Debug.label(), "DEBUG");
        assert_eq!(Priority::Error.ordinal(), 3);
    }

    #[test]
    fn test_priority_table_is_indexed_by_ordinal() {
        for (i, info) in PRIORITIES.iter().enumerate() {
            assert_eq!(usize::from(info.priority.ordinal()), i);
            assert_eq!(info.priority.keyword(), info.keyword);
        }
    }

    #[test]
    fn test_priority_from_ordinal() {
        assert_eq!(Priority::from_ordinal(4), Some(Priority::Warning));
        assert_eq!(Priority::from_ordinal(8), None);
        assert_eq!(Priority::from_ordinal(-1), None);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("err".parse::<Priority>().unwrap(), Priority::Error);
        assert_eq!("3".parse::<Priority>().unwrap(), Priority::Error);
        assert_eq!("Warning".parse::<Priority>().unwrap(), Priority::Warning);
        assert_eq!(" 7 ".parse::<Priority>().unwrap(), Priority::Debug);
        assert!("loud".parse::<Priority>().is_err());
        assert!("8".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serializes_as_label() {
        let record = Record {
            priority: Priority::Warning,
            message: "disk almost full".to_string(),
            ..Record::default()
        };
        let value: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(value["priority"], "WARNING");
        assert_eq!(value["message"], "disk almost full");
    }

    #[test]
    fn test_empty_fields_omitted() {
        let record = Record {
            pid: 42,
            command: "sshd".to_string(),
            ..Record::default()
        };
        let value: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj["pid"], 42);
        assert_eq!(obj["cmdName"], "sshd");
        assert_eq!(obj["uid"], 0);
        assert!(!obj.contains_key("instanceId"));
        assert!(!obj.contains_key("errno"));
        assert!(!obj.contains_key("syslog"));
        assert!(!obj.contains_key("kernel"));
        assert!(!obj.contains_key("timestamp"));
    }

    #[test]
    fn test_nested_groups_serialized() {
        let record = Record {
            syslog: SyslogFields {
                facility: 4,
                identifier: "sshd".to_string(),
                pid: 0,
            },
            kernel: KernelFields {
                dev_node: "/dev/sda".to_string(),
                ..KernelFields::default()
            },
            container_id: "abc123".to_string(),
            ..Record::default()
        };
        let value: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();

        assert_eq!(value["syslog"]["facility"], 4);
        assert_eq!(value["syslog"]["ident"], "sshd");
        assert!(value["syslog"].get("pid").is_none());
        assert_eq!(value["kernel"]["devNode"], "/dev/sda");
        assert_eq!(value["containerID"], "abc123");
    }

    #[test]
    fn test_synthetic_record() {
        let record = Record::synthetic("error reading from journal: boom");
        assert_eq!(record.command, SYNTHETIC_COMMAND);
        assert_eq!(record.priority, Priority::Error);
        assert_eq!(record.message, "error reading from journal: boom");
    }
}
