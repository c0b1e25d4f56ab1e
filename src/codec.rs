//! Serialized form of cached documents.
use crate::error::Error;
use crate::error::Result;
use crate::types::Document;

pub fn encode(document: &Document) -> Result<String> {
    Ok(serde_json::to_string(document)?)
}

/// Decoding failure is reported as [`Error::CorruptEntry`] for `key`: whatever is stored in the cache keyspace was
/// produced by [`encode`], so a value that doesn't parse back is corrupt rather than missing.
pub fn decode(key: &str, payload: &str) -> Result<Document> {
    serde_json::from_str(payload).map_err(|err| Error::CorruptEntry {
        key:    key.to_string(),
        reason: err.to_string(),
    })
}
