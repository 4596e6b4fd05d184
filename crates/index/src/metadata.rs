//! Chunk metadata and its encoding into the vector store's flat string map.
//!
//! The store enforces a per-field byte limit on metadata values. Free-text
//! fields are cut on a UTF-8 boundary; the owner id list is cut on whole ids
//! so every id that survives can still be decoded and matched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Flat key/value metadata as persisted next to a vector.
pub type VectorMetadata = BTreeMap<String, String>;

/// Scope tag attached to every chunk produced from a work note.
pub const NOTE_SCOPE: &str = "work";

pub const FIELD_DOCUMENT_ID: &str = "document_id";
pub const FIELD_SCOPE: &str = "scope";
pub const FIELD_CHUNK_INDEX: &str = "chunk_index";
pub const FIELD_PERSON_IDS: &str = "person_ids";
pub const FIELD_OWNER_GROUP: &str = "owner_group";
pub const FIELD_CATEGORY: &str = "category";
pub const FIELD_DATE_BUCKET: &str = "date_bucket";

const ID_SEPARATOR: char = ',';

/// Metadata shared by every chunk of one note.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMetadata {
    pub scope: String,
    pub person_ids: Vec<String>,
    pub owner_group: Option<String>,
    pub category: Option<String>,
    /// `YYYY-MM` of the note's creation time.
    pub date_bucket: String,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            scope: NOTE_SCOPE.to_string(),
            person_ids: Vec::new(),
            owner_group: None,
            category: None,
            date_bucket: String::new(),
        }
    }
}

impl DocumentMetadata {
    pub fn for_chunk(&self, document_id: &str, chunk_index: usize) -> ChunkMetadata {
        ChunkMetadata {
            document_id: document_id.to_string(),
            scope: self.scope.clone(),
            chunk_index,
            person_ids: self.person_ids.clone(),
            owner_group: self.owner_group.clone(),
            category: self.category.clone(),
            date_bucket: self.date_bucket.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub scope: String,
    pub chunk_index: usize,
    pub person_ids: Vec<String>,
    pub owner_group: Option<String>,
    pub category: Option<String>,
    pub date_bucket: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata field '{0}' is missing")]
    Missing(&'static str),
    #[error("metadata field 'chunk_index' is not a number: {0}")]
    BadChunkIndex(String),
}

/// Fixed-width `YYYY-MM` bucket for a unix-millisecond timestamp.
pub fn date_bucket(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .format("%Y-%m")
        .to_string()
}

/// Longest prefix of `value` that fits in `max_bytes` without splitting a codepoint.
pub fn truncate_utf8(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    // Back off over continuation bytes to the start of the cut codepoint.
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Join ids with `,`, dropping whole trailing ids once `max_bytes` would be exceeded.
pub fn encode_id_list(ids: &[String], max_bytes: usize) -> String {
    let mut out = String::new();
    for id in ids {
        let extra = if out.is_empty() { id.len() } else { id.len() + 1 };
        if out.len() + extra > max_bytes {
            break;
        }
        if !out.is_empty() {
            out.push(ID_SEPARATOR);
        }
        out.push_str(id);
    }
    out
}

pub fn decode_id_list(encoded: &str) -> Vec<String> {
    encoded
        .split(ID_SEPARATOR)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

impl ChunkMetadata {
    /// Encode into the store's flat map, applying the per-field byte budget.
    pub fn encode(&self, byte_budget: usize) -> VectorMetadata {
        let mut map = VectorMetadata::new();
        map.insert(FIELD_DOCUMENT_ID.into(), self.document_id.clone());
        map.insert(FIELD_SCOPE.into(), self.scope.clone());
        map.insert(FIELD_CHUNK_INDEX.into(), self.chunk_index.to_string());
        map.insert(FIELD_DATE_BUCKET.into(), self.date_bucket.clone());
        if !self.person_ids.is_empty() {
            map.insert(
                FIELD_PERSON_IDS.into(),
                encode_id_list(&self.person_ids, byte_budget),
            );
        }
        if let Some(group) = &self.owner_group {
            map.insert(
                FIELD_OWNER_GROUP.into(),
                truncate_utf8(group, byte_budget).to_string(),
            );
        }
        if let Some(category) = &self.category {
            map.insert(
                FIELD_CATEGORY.into(),
                truncate_utf8(category, byte_budget).to_string(),
            );
        }
        map
    }

    /// Decode a map previously produced by [`ChunkMetadata::encode`].
    pub fn decode(map: &VectorMetadata) -> Result<Self, MetadataError> {
        let document_id = map
            .get(FIELD_DOCUMENT_ID)
            .ok_or(MetadataError::Missing(FIELD_DOCUMENT_ID))?
            .clone();
        let raw_index = map
            .get(FIELD_CHUNK_INDEX)
            .ok_or(MetadataError::Missing(FIELD_CHUNK_INDEX))?;
        let chunk_index = raw_index
            .parse()
            .map_err(|_| MetadataError::BadChunkIndex(raw_index.clone()))?;
        Ok(Self {
            document_id,
            scope: map.get(FIELD_SCOPE).cloned().unwrap_or_default(),
            chunk_index,
            person_ids: map
                .get(FIELD_PERSON_IDS)
                .map(|ids| decode_id_list(ids))
                .unwrap_or_default(),
            owner_group: map.get(FIELD_OWNER_GROUP).cloned(),
            category: map.get(FIELD_CATEGORY).cloned(),
            date_bucket: map.get(FIELD_DATE_BUCKET).cloned().unwrap_or_default(),
        })
    }
}
