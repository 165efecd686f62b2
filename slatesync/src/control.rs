use std::path::Path;

use thiserror::Error;

use crate::sync::render::RenderError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("remote command failed with status {status}: {stderr}")]
    Command { status: i32, stderr: String },
    #[error("record rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("copy to device failed with status {status}: {stderr}")]
    Copy { status: i32, stderr: String },
    #[error("no document record found in the store")]
    MissingUpload,
    #[error("metadata record for {0} is not a JSON object")]
    MalformedRecord(String),
    #[error("malformed device record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the privileged channel can do right now. `None` means no channel
/// is configured at all, `Unreachable` that probing it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    None,
    Unreachable,
    Full,
}

impl Capability {
    pub fn is_full(self) -> bool {
        matches!(self, Capability::Full)
    }
}

/// Privileged side channel into the reader's document store. Everything
/// that the web interface cannot express goes through here: folder
/// records, parent links, the shared book list and indexer restarts.
#[allow(async_fn_in_trait)]
pub trait ControlChannel {
    /// Write test against the device filesystem. Never errors; callers
    /// branch on the returned capability.
    async fn probe(&self) -> Capability;

    /// Creates a folder record under `parent_id` and returns its
    /// identifier. The empty identifier denotes the top level.
    async fn create_folder(&self, visible_name: &str, parent_id: &str) -> Result<String, ChannelError>;

    /// Identifier of the most recently written document record.
    async fn latest_document_id(&self) -> Result<String, ChannelError>;

    async fn set_parent(&self, document_id: &str, parent_id: &str) -> Result<(), ChannelError>;

    /// Raw device copy of the book list, or `None` when the device has
    /// none yet.
    async fn read_book_list(&self) -> Result<Option<String>, ChannelError>;

    async fn write_book_list(&self, payload: &str) -> Result<(), ChannelError>;

    /// Copies every entry of a rendered staging directory into the store.
    async fn push_staging(&self, staging_dir: &Path) -> Result<(), ChannelError>;

    /// Restarts the store indexer so structural changes become visible.
    async fn restart_indexer(&self) -> Result<(), ChannelError>;
}
