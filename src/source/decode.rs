use crate::source::record::{KernelFields, Priority, Record, SyslogFields};
use crate::source::traits::{LogSource, SourceError};

#[derive(Debug, thiserror::Error)]
#[error("error decoding journal field {key}: {source}")]
pub struct DecodeError {
    pub key: &'static str,
    #[source]
    pub source: SourceError,
}

/// Maps one journal key onto a destination field.
pub struct FieldSpec<T> {
    pub key: &'static str,
    pub decode: fn(&mut T, &str),
}

pub static RECORD_FIELDS: &[FieldSpec<Record>] = &[
    FieldSpec { key: "_PID", decode: |r, v| r.pid = int(v) },
    FieldSpec { key: "_UID", decode: |r, v| r.uid = int(v) },
    FieldSpec { key: "_GID", decode: |r, v| r.gid = int(v) },
    FieldSpec { key: "_COMM", decode: |r, v| r.command = v.to_string() },
    FieldSpec { key: "_EXE", decode: |r, v| r.executable = v.to_string() },
    FieldSpec { key: "_CMDLINE", decode: |r, v| r.command_line = v.to_string() },
    FieldSpec { key: "_SYSTEMD_UNIT", decode: |r, v| r.systemd_unit = v.to_string() },
    FieldSpec { key: "_BOOT_ID", decode: |r, v| r.boot_id = v.to_string() },
    FieldSpec { key: "_MACHINE_ID", decode: |r, v| r.machine_id = v.to_string() },
    FieldSpec { key: "_HOSTNAME", decode: |r, v| r.hostname = v.to_string() },
    FieldSpec { key: "_TRANSPORT", decode: |r, v| r.transport = v.to_string() },
    FieldSpec {
        key: "PRIORITY",
        decode: |r, v| r.priority = Priority::from_ordinal(int(v)).unwrap_or_default(),
    },
    FieldSpec { key: "MESSAGE", decode: |r, v| r.message = v.to_string() },
    FieldSpec { key: "MESSAGE_ID", decode: |r, v| r.message_id = v.to_string() },
    FieldSpec { key: "ERRNO", decode: |r, v| r.errno = int(v) },
    FieldSpec { key: "CONTAINER_NAME", decode: |r, v| r.container_name = v.to_string() },
    FieldSpec { key: "CONTAINER_TAG", decode: |r, v| r.container_tag = v.to_string() },
    FieldSpec { key: "CONTAINER_ID", decode: |r, v| r.container_id = v.to_string() },
];

pub static SYSLOG_FIELDS: &[FieldSpec<SyslogFields>] = &[
    FieldSpec { key: "SYSLOG_FACILITY", decode: |s, v| s.facility = int(v) },
    FieldSpec { key: "SYSLOG_IDENTIFIER", decode: |s, v| s.identifier = v.to_string() },
    FieldSpec { key: "SYSLOG_PID", decode: |s, v| s.pid = int(v) },
];

pub static KERNEL_FIELDS: &[FieldSpec<KernelFields>] = &[
    FieldSpec { key: "_KERNEL_DEVICE", decode: |k, v| k.device = v.to_string() },
    FieldSpec { key: "_KERNEL_SUBSYSTEM", decode: |k, v| k.subsystem = v.to_string() },
    FieldSpec { key: "_UDEV_SYSNAME", decode: |k, v| k.sys_name = v.to_string() },
    FieldSpec { key: "_UDEV_DEVNODE", decode: |k, v| k.dev_node = v.to_string() },
];

// Unparseable numbers decode to zero, same as a missing key.
fn int(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

/// Apply a field table to `target`, reading from the source's current entry.
pub fn decode_fields<T, S>(
    source: &S,
    table: &[FieldSpec<T>],
    target: &mut T,
) -> Result<(), DecodeError>
where
    S: LogSource + ?Sized,
{
    for spec in table {
        let value = source
            .field(spec.key)
            .map_err(|source| DecodeError { key: spec.key, source })?;
        match value {
            Some(v) if !v.is_empty() => (spec.decode)(target, v),
            _ => {}
        }
    }
    Ok(())
}

/// Decode the source's current entry into a fresh `Record`.
///
/// The timestamp is left at its default; the reader stamps it.
pub fn decode_record<S>(source: &S) -> Result<Record, DecodeError>
where
    S: LogSource + ?Sized,
{
    let mut record = Record::default();
    decode_fields(source, RECORD_FIELDS, &mut record)?;
    decode_fields(source, SYSLOG_FIELDS, &mut record.syslog)?;
    decode_fields(source, KERNEL_FIELDS, &mut record.kernel)?;
    Ok(record)
}
