//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::job::JobKind;

/// Identifier of a job: `<kind-prefix>_<uuid>`.
///
/// The UUID part is time-ordered (v7), so ids sort roughly by submission time.
/// The prefix tells operators which pipeline a key in the result store belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId {
    value: String,
    kind: JobKind,
}

impl JobId {
    /// Create a new identifier for a job of the given kind.
    pub fn new(kind: JobKind) -> Self {
        Self::from_parts(kind, Uuid::now_v7())
    }

    pub fn from_parts(kind: JobKind, uuid: Uuid) -> Self {
        Self {
            value: format!("{}_{}", kind.id_prefix(), uuid),
            kind,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The kind encoded in the id prefix.
    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Prefixes contain underscores themselves, so split on the last one.
        let (prefix, uuid) = s
            .rsplit_once('_')
            .ok_or_else(|| DomainError::invalid_id(format!("JobId: missing prefix in '{s}'")))?;

        let kind = JobKind::ALL
            .into_iter()
            .find(|k| k.id_prefix() == prefix)
            .ok_or_else(|| DomainError::invalid_id(format!("JobId: unknown prefix '{prefix}'")))?;

        let uuid = Uuid::from_str(uuid).map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;

        Ok(Self::from_parts(kind, uuid))
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.value
    }
}
