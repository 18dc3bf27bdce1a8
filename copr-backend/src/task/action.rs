use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::QueueTask;
use crate::{Error, Result};

/// Kinds of non-build work the frontend hands to the backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(try_from = "i64", into = "i64")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    Delete,
    Rename,
    #[strum(serialize = "legal-flag")]
    LegalFlag,
    Createrepo,
    UpdateComps,
    GenGpgKey,
    RawhideToRelease,
    Fork,
    UpdateModuleMd,
    BuildModule,
    CancelBuild,
    RemoveDirs,
}

impl ActionType {
    /// Numeric code used on the wire.
    pub fn code(self) -> i64 {
        match self {
            Self::Delete => 0,
            Self::Rename => 1,
            Self::LegalFlag => 2,
            Self::Createrepo => 3,
            Self::UpdateComps => 4,
            Self::GenGpgKey => 5,
            Self::RawhideToRelease => 6,
            Self::Fork => 7,
            Self::UpdateModuleMd => 8,
            Self::BuildModule => 9,
            Self::CancelBuild => 10,
            Self::RemoveDirs => 11,
        }
    }

    /// Priority class used when the frontend does not send one.
    /// Lower runs earlier; the range is -100..=100.
    pub fn default_priority(self) -> i64 {
        match self {
            Self::GenGpgKey => -70,
            Self::CancelBuild => -10,
            Self::Delete => 60,
            Self::RawhideToRelease => 70,
            _ => 0,
        }
    }

    /// Whether a successful run changes repository content.
    pub fn publishes_repo(self) -> bool {
        matches!(
            self,
            Self::Createrepo | Self::Fork | Self::RawhideToRelease
        )
    }
}

impl TryFrom<i64> for ActionType {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        Ok(match code {
            0 => Self::Delete,
            1 => Self::Rename,
            2 => Self::LegalFlag,
            3 => Self::Createrepo,
            4 => Self::UpdateComps,
            5 => Self::GenGpgKey,
            6 => Self::RawhideToRelease,
            7 => Self::Fork,
            8 => Self::UpdateModuleMd,
            9 => Self::BuildModule,
            10 => Self::CancelBuild,
            11 => Self::RemoveDirs,
            other => {
                return Err(Error::validation(format!("unknown action type {}", other)));
            }
        })
    }
}

impl From<ActionType> for i64 {
    fn from(value: ActionType) -> Self {
        value.code()
    }
}

/// Outcome an action worker writes into the `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionResult {
    Waiting,
    Success,
    Failure,
}

impl ActionResult {
    pub fn code(self) -> i64 {
        match self {
            Self::Waiting => 0,
            Self::Success => 1,
            Self::Failure => 2,
        }
    }

    /// Parse the worker-written status; unknown values count as failure.
    pub fn from_status(status: &str) -> Self {
        match status.trim().parse::<i64>() {
            Ok(0) => Self::Waiting,
            Ok(1) => Self::Success,
            _ => Self::Failure,
        }
    }
}

/// Directory whose repository metadata must be regenerated after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub dir: PathBuf,
    pub devel: bool,
    pub appstream: bool,
}

/// An action as announced by the frontend.
///
/// The pending list only carries `id` and `priority`; the full action is
/// fetched on demand, so `action_type` may be unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTask {
    pub id: i64,
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_id: Option<i64>,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    /// JSON document with action specific arguments.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActionTask {
    /// A queue entry known only by id and priority.
    pub fn pending(id: i64, priority: Option<i64>) -> Self {
        Self {
            id,
            action_type: None,
            object_type: None,
            object_id: None,
            old_value: None,
            new_value: None,
            data: None,
            priority,
            extra: Map::new(),
        }
    }

    /// Whether the full action body is known.
    pub fn is_complete(&self) -> bool {
        self.action_type.is_some()
    }

    fn data_json(&self) -> Result<Value> {
        match self.data.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(raw)?),
            _ => Ok(Value::Object(Map::new())),
        }
    }

    /// Repositories to regenerate once this action succeeded.
    pub fn publish_targets(&self, destdir: &Path) -> Result<Vec<PublishTarget>> {
        let data = self.data_json()?;
        let text = |key: &str| -> Result<String> {
            data.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::validation(format!("action {} data misses '{}'", self.id, key))
                })
        };
        let flag = |key: &str, default: bool| data.get(key).and_then(Value::as_bool).unwrap_or(default);
        let strings = |key: &str| -> Vec<String> {
            data.get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let targets = match self.action_type {
            Some(ActionType::Createrepo) => {
                let owner = text("ownername")?;
                let devel = flag("devel", false);
                let appstream = flag("appstream", true);
                let mut dirnames = strings("project_dirnames");
                if dirnames.is_empty() {
                    dirnames.push(text("projectname")?);
                }
                let chroots = strings("chroots");
                dirnames
                    .iter()
                    .flat_map(|dirname| {
                        chroots.iter().map(move |chroot| (dirname.clone(), chroot.clone()))
                    })
                    .map(|(dirname, chroot)| PublishTarget {
                        dir: destdir.join(&owner).join(dirname).join(chroot),
                        devel,
                        appstream,
                    })
                    .collect()
            }
            Some(ActionType::RawhideToRelease) => vec![PublishTarget {
                dir: destdir
                    .join(text("ownername")?)
                    .join(text("projectname")?)
                    .join(text("dest_chroot")?),
                devel: false,
                appstream: flag("appstream", true),
            }],
            Some(ActionType::Fork) => {
                let new_value = self.new_value.clone().ok_or_else(|| {
                    Error::validation(format!("fork action {} has no new_value", self.id))
                })?;
                let project_dir = destdir.join(new_value);
                let mut chroots: Vec<String> = data
                    .get("builds_map")
                    .and_then(Value::as_object)
                    .map(|map| map.keys().cloned().collect())
                    .unwrap_or_default();
                chroots.retain(|c| c != "srpm-builds");
                chroots
                    .into_iter()
                    .map(|chroot| PublishTarget {
                        dir: project_dir.join(chroot),
                        devel: false,
                        appstream: flag("appstream", true),
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        Ok(targets)
    }
}

impl QueueTask for ActionTask {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn priority(&self) -> i64 {
        self.priority.unwrap_or_else(|| {
            self.action_type
                .map(ActionType::default_priority)
                .unwrap_or_default()
        })
    }
}
