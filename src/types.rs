use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::fmt;
use std::fmt::Display;

use crate::error::Error;

/// Opaque structured document: a JSON object.
pub type Document = Map<String, Value>;

/// Monotonic commit revision assigned by the record store.
pub type Revision = u64;

/// A record as known to the record store, or as snapshotted into the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id:       String,
    pub revision: Revision,
    pub document: Document,
}

impl Record {
    pub fn new(id: impl Into<String>, revision: Revision, document: Document) -> Self {
        Self {
            id: id.into(),
            revision,
            document,
        }
    }
}

/// Where a returned record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cache,
    Store,
}

impl Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cache => "cache",
            Self::Store => "store",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Unavailable,
}

impl Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Unavailable => "unavailable",
        })
    }
}

/// Result of a cache mutation attempt that didn't fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Stored,
    Removed,
    /// The backend already holds an entry derived from the same or a newer revision.
    Superseded,
    /// The cache is unavailable; nothing was sent to the backend.
    Skipped,
}

impl Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stored => "stored",
            Self::Removed => "removed",
            Self::Superseded => "superseded",
            Self::Skipped => "skipped",
        })
    }
}

/// How concurrent writes to the same key are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// A write is applied only if the stored entry was derived from an older revision. Deletes leave tombstones.
    #[default]
    Versioned,
    /// The last write physically applied wins, regardless of the revision it carries.
    LastArrival,
}

/// When a read-miss populates the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillMode {
    /// Fire-and-forget: the caller gets its response without waiting for the cache write.
    #[default]
    Background,
    /// The cache write completes before responding. Its outcome is still not surfaced.
    Inline,
}

/// What a backend physically holds under a key. `payload` of `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub revision: Revision,
    pub payload:  Option<String>,
}

impl StoredEntry {
    pub fn value(revision: Revision, payload: String) -> Self {
        Self {
            revision,
            payload: Some(payload),
        }
    }

    pub fn tombstone(revision: Revision) -> Self {
        Self {
            revision,
            payload: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// A committed mutation of a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangeEvent {
    Created {
        id:       String,
        revision: Revision,
        document: Document,
    },
    Updated {
        id:       String,
        revision: Revision,
        document: Document,
    },
    Deleted {
        id:       String,
        revision: Revision,
    },
}

impl ChangeEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Created { id, .. } | Self::Updated { id, .. } | Self::Deleted { id, .. } => id,
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            Self::Created { revision, .. } | Self::Updated { revision, .. } | Self::Deleted { revision, .. } => {
                *revision
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }

    /// The post-change record, absent for deletions.
    pub fn record(&self) -> Option<Record> {
        match self {
            Self::Created { id, revision, document } | Self::Updated { id, revision, document } => {
                Some(Record::new(id.clone(), *revision, document.clone()))
            }
            Self::Deleted { .. } => None,
        }
    }
}

/// Change notification as delivered by a document store trigger: existence flags of the before and after states
/// plus the after-document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub id:            String,
    pub revision:      Revision,
    pub before_exists: bool,
    pub after_exists:  bool,
    #[serde(default)]
    pub after:         Option<Document>,
}

impl TryFrom<ChangeNotification> for ChangeEvent {
    type Error = Error;

    fn try_from(n: ChangeNotification) -> Result<Self, Self::Error> {
        let ChangeNotification {
            id,
            revision,
            before_exists,
            after_exists,
            after,
        } = n;
        Ok(match (before_exists, after_exists) {
            (false, false) => return Err(Error::MalformedChange(id)),
            (true, false) => ChangeEvent::Deleted { id, revision },
            (before, true) => {
                let Some(document) = after
                else {
                    return Err(Error::MalformedChange(id));
                };
                if before {
                    ChangeEvent::Updated { id, revision, document }
                }
                else {
                    ChangeEvent::Created { id, revision, document }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Superseded,
    /// The cache was unavailable; the identifier was queued for reconciliation.
    Skipped,
}

impl Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Applied => "applied",
            Self::Superseded => "superseded",
            Self::Skipped => "skipped",
        })
    }
}

/// Successful outcome of a read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub id:         String,
    pub revision:   Revision,
    pub data:       Document,
    pub provenance: Provenance,
}

impl ReadResponse {
    pub fn new(record: Record, provenance: Provenance) -> Self {
        Self {
            id: record.id,
            revision: record.revision,
            data: record.document,
            provenance,
        }
    }

    /// The record's fields with the provenance tag merged in under `from`.
    pub fn to_body(&self) -> Value {
        let mut body = self.data.clone();
        body.insert("from".to_string(), Value::String(self.provenance.to_string()));
        Value::Object(body)
    }
}
