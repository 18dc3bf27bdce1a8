use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// `{owner}/{project}[--{submitter}]`: builds sharing a label may share a builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxLabel {
    pub owner: String,
    pub project: String,
    pub submitter: Option<String>,
}

impl SandboxLabel {
    pub fn new(
        owner: impl Into<String>,
        project: impl Into<String>,
        submitter: Option<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            project: project.into(),
            submitter,
        }
    }
}

impl fmt::Display for SandboxLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.project)?;
        if let Some(submitter) = &self.submitter {
            write!(f, "--{}", submitter)?;
        }
        Ok(())
    }
}

impl FromStr for SandboxLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, rest) = s
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("sandbox label '{}' has no '/'", s)))?;
        let (project, submitter) = match rest.split_once("--") {
            Some((project, submitter)) => (project, Some(submitter.to_string())),
            None => (rest, None),
        };
        if owner.is_empty() || project.is_empty() {
            return Err(Error::validation(format!(
                "sandbox label '{}' misses owner or project",
                s
            )));
        }
        Ok(Self::new(owner, project, submitter))
    }
}

impl TryFrom<String> for SandboxLabel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SandboxLabel> for String {
    fn from(label: SandboxLabel) -> Self {
        label.to_string()
    }
}
