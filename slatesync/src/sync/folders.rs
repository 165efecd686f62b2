use thiserror::Error;
use tracing::debug;

use slatesync_core::FolderMap;

use crate::control::{ChannelError, ControlChannel};

#[derive(Debug, Error)]
pub enum FolderError {
    #[error("folder path {0:?} matches more than one folder on the device")]
    Ambiguous(String),
    #[error("{source}")]
    Creation {
        #[source]
        source: ChannelError,
        created: usize,
    },
}

/// Walks `segments` from the top level down, reusing folders known to the
/// cache and creating the missing tail. Newly created folders are added
/// to the cache so later documents in the batch land in the same records.
/// Returns the identifier of the final folder and how many records were
/// created along the way. A creation failure carries the count of records
/// already made, since those are on the device whether or not the chain
/// completed.
pub async fn resolve_or_create<C: ControlChannel>(
    channel: &C,
    folders: &mut FolderMap,
    segments: &[String],
) -> Result<(String, usize), FolderError> {
    let mut parent_id = String::new();
    let mut prefix = String::new();
    let mut created = 0;
    for segment in segments {
        if prefix.is_empty() {
            prefix.push_str(segment);
        } else {
            prefix = format!("{prefix}/{segment}");
        }
        if folders.is_ambiguous(&prefix) {
            return Err(FolderError::Ambiguous(prefix));
        }
        parent_id = match folders.get(&prefix) {
            Some(id) => id.to_string(),
            None => {
                let id = channel
                    .create_folder(segment, &parent_id)
                    .await
                    .map_err(|source| FolderError::Creation { source, created })?;
                debug!(path = %prefix, id, "created missing folder");
                folders.insert(prefix.clone(), id.clone());
                created += 1;
                id
            }
        };
    }
    Ok((parent_id, created))
}
