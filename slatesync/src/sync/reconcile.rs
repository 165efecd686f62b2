use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, warn};

use slatesync_core::{DeviceClient, DeviceError};

use crate::control::{ChannelError, ControlChannel};
use crate::sync::booklist::BookList;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("device interface error: {0}")]
    Device(#[from] DeviceError),
    #[error("control channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("book list serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pruned: usize,
    pub appended_to_device: usize,
    pub adopted_locally: usize,
    pub total: usize,
}

/// Brings the local book list and the device's copy to the same state.
/// The device copy is pruned against the live hierarchy, extended with
/// local-only books and persisted before any device-only book is adopted
/// locally, so an interruption can lose work but never invent records.
pub async fn reconcile<C: ControlChannel>(
    client: &DeviceClient,
    channel: &C,
    local: &mut BookList,
) -> Result<ReconcileReport, ReconcileError> {
    // The live hierarchy decides which records still have a backing
    // document.
    let tree = client.fetch_tree("").await?;
    let live_paths: BTreeSet<String> = tree.document_paths().into_iter().collect();
    let live_ids: BTreeSet<String> = tree.ids().into_iter().collect();

    // Device copy; absent or unreadable means starting over from empty.
    let (mut device_list, initialized) = match channel.read_book_list().await? {
        Some(raw) => match BookList::from_json(&raw) {
            Ok(list) => (list, false),
            Err(err) => {
                warn!(%err, "device book list is unreadable, reinitializing");
                channel.write_book_list("[]").await?;
                (BookList::new(), true)
            }
        },
        None => {
            channel.write_book_list("[]").await?;
            (BookList::new(), true)
        }
    };

    // Prune entries backed by neither a live path nor a live identifier.
    let before = device_list.len();
    device_list.retain(|book| {
        live_paths.contains(&book.path)
            || book.device_id.as_ref().is_some_and(|id| live_ids.contains(id))
    });
    let pruned = before - device_list.len();

    // Append local books the device copy does not know yet.
    let mut appended = 0;
    for book in local.iter() {
        if !device_list.contains(book) {
            device_list.push(book.clone());
            appended += 1;
        }
    }

    // Persist the union before adopting anything from it locally.
    if initialized || pruned > 0 || appended > 0 {
        channel.write_book_list(&device_list.to_json()?).await?;
    }

    let mut adopted = 0;
    for book in device_list.iter() {
        if !local.contains(book) {
            local.push(book.clone());
            adopted += 1;
        }
    }

    debug!(pruned, appended, adopted, "book lists reconciled");
    Ok(ReconcileReport {
        pruned,
        appended_to_device: appended,
        adopted_locally: adopted,
        total: device_list.len(),
    })
}
