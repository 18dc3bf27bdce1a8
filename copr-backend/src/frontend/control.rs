use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct RawControlMessage {
    action: String,
    #[serde(default)]
    build_id: Option<i64>,
    #[serde(default)]
    chroot: Option<String>,
    #[serde(default)]
    task_id: Option<serde_json::Value>,
}

/// Per-task message published on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The task was cancelled; drop it or stop its worker.
    Remove { task_id: String, build_id: Option<i64> },
    /// Put the task back on the queue.
    Reschedule { task_id: String, build_id: Option<i64> },
}

impl ControlMessage {
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: RawControlMessage = serde_json::from_str(payload)
            .map_err(|e| Error::validation(format!("malformed control message: {}", e)))?;

        let task_id = match raw.task_id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => match (raw.build_id, raw.chroot.as_deref()) {
                (Some(id), None | Some("") | Some("srpm-builds")) => id.to_string(),
                (Some(id), Some(chroot)) => format!("{}-{}", id, chroot),
                (None, _) => {
                    return Err(Error::validation("control message names no task"));
                }
            },
        };

        match raw.action.as_str() {
            "remove" => Ok(Self::Remove {
                task_id,
                build_id: raw.build_id,
            }),
            "reschedule" => Ok(Self::Reschedule {
                task_id,
                build_id: raw.build_id,
            }),
            other => Err(Error::validation(format!(
                "unknown control action '{}'",
                other
            ))),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Remove { task_id, .. } | Self::Reschedule { task_id, .. } => task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remove() {
        let msg = ControlMessage::parse(
            r#"{"action": "remove", "build_id": 12, "chroot": "fedora-39-x86_64", "task_id": "12-fedora-39-x86_64"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Remove {
                task_id: "12-fedora-39-x86_64".to_string(),
                build_id: Some(12),
            }
        );
    }

    #[test]
    fn test_task_id_derived_from_build() {
        let msg = ControlMessage::parse(r#"{"action": "reschedule", "build_id": 12, "chroot": "epel-9-aarch64"}"#)
            .unwrap();
        assert_eq!(msg.task_id(), "12-epel-9-aarch64");

        let msg = ControlMessage::parse(r#"{"action": "remove", "build_id": 12, "chroot": "srpm-builds"}"#)
            .unwrap();
        assert_eq!(msg.task_id(), "12");
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        assert!(ControlMessage::parse(r#"{"action": "explode", "task_id": "1"}"#).is_err());
        assert!(ControlMessage::parse("not json").is_err());
        assert!(ControlMessage::parse(r#"{"action": "remove"}"#).is_err());
    }
}
