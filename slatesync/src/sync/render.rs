use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use slatesync_core::DocumentKind;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Slashes would change the record's place in the hierarchy and single
/// quotes break the remote shell commands that touch these names.
pub fn name_is_safe(name: &str) -> bool {
    !name.contains('/') && !name.contains('\'')
}

// Store metadata format. The indexer tolerates absent optional keys but
// the reader only opens documents whose records carry the full set.
#[derive(Serialize)]
struct MetadataRecord<'a> {
    #[serde(rename = "visibleName")]
    visible_name: &'a str,
    parent: &'a str,
    #[serde(rename = "lastModified")]
    last_modified: String,
    #[serde(rename = "metadatamodified")]
    metadata_modified: bool,
    modified: bool,
    pinned: bool,
    synced: bool,
    #[serde(rename = "type")]
    kind: &'a str,
    version: u32,
    deleted: bool,
    #[serde(rename = "lastOpened", skip_serializing_if = "Option::is_none")]
    last_opened: Option<String>,
    #[serde(rename = "lastOpenedPage", skip_serializing_if = "Option::is_none")]
    last_opened_page: Option<u32>,
}

pub fn metadata_json(
    kind: DocumentKind,
    visible_name: &str,
    parent_id: &str,
) -> Result<String, serde_json::Error> {
    let record = MetadataRecord {
        visible_name,
        parent: parent_id,
        last_modified: timestamp_millis(),
        metadata_modified: false,
        modified: false,
        pinned: false,
        synced: false,
        kind: kind.as_str(),
        version: 0,
        deleted: false,
        last_opened: matches!(kind, DocumentKind::Document).then(timestamp_millis),
        last_opened_page: matches!(kind, DocumentKind::Document).then_some(0),
    };
    serde_json::to_string_pretty(&record)
}

/// Writes the metadata and content records of one folder into `staging`.
pub fn render_folder(
    staging: &Path,
    id: &str,
    visible_name: &str,
    parent_id: &str,
) -> Result<(), RenderError> {
    let metadata = metadata_json(DocumentKind::Collection, visible_name, parent_id)?;
    std::fs::write(staging.join(format!("{id}.metadata")), metadata)?;
    let content = serde_json::to_string_pretty(&serde_json::json!({ "tags": [] }))?;
    std::fs::write(staging.join(format!("{id}.content")), content)?;
    Ok(())
}

/// Writes the full record set of one document into `staging`: metadata,
/// content, the payload copy and the two directories the indexer expects
/// alongside them. Returns the payload size.
pub fn render_document(
    staging: &Path,
    id: &str,
    visible_name: &str,
    parent_id: &str,
    payload: &Path,
) -> Result<u64, RenderError> {
    let metadata = metadata_json(DocumentKind::Document, visible_name, parent_id)?;
    std::fs::write(staging.join(format!("{id}.metadata")), metadata)?;
    let content = serde_json::to_string_pretty(&serde_json::json!({}))?;
    std::fs::write(staging.join(format!("{id}.content")), content)?;
    std::fs::create_dir_all(staging.join(id))?;
    std::fs::create_dir_all(staging.join(format!("{id}.thumbnails")))?;
    render_payload(staging, id, file_type_of(payload), payload)
}

/// Writes only the payload copy, keeping the existing records untouched.
/// Returns the payload size.
pub fn render_payload(
    staging: &Path,
    id: &str,
    file_type: &str,
    payload: &Path,
) -> Result<u64, RenderError> {
    Ok(std::fs::copy(payload, staging.join(format!("{id}.{file_type}")))?)
}

pub fn file_type_of(payload: &Path) -> &str {
    payload
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("pdf")
}

fn timestamp_millis() -> String {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).to_string()
}
