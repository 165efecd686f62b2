use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use slatesync_core::{DeviceClient, DeviceError, DocumentTree, PathLookup, TreeNode};

use crate::sync::plan::is_excluded;
use crate::sync::render;

#[derive(Debug, Error)]
pub enum PullError {
    #[error("output directory {0} does not exist")]
    MissingDestination(PathBuf),
    #[error("device interface error: {0}")]
    Device(#[from] DeviceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct PullReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub excluded: usize,
}

/// Fetches the requested device paths into `destination`, rebuilding the
/// folder structure locally. Unknown or ambiguous targets are announced
/// and skipped; only a vanished endpoint aborts the walk.
pub async fn pull(
    client: &DeviceClient,
    tree: &DocumentTree,
    targets: &[String],
    destination: &Path,
    excludes: &[glob::Pattern],
    replace_existing: bool,
    dry_run: bool,
) -> Result<PullReport, PullError> {
    if !destination.is_dir() {
        return Err(PullError::MissingDestination(destination.to_path_buf()));
    }

    let mut report = PullReport::default();
    for target in targets {
        let segments: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
        let node = match tree.lookup(&segments) {
            PathLookup::Unique(node) => node,
            PathLookup::Missing | PathLookup::Ambiguous(_) => {
                println!("Cannot find {target}, skipping");
                continue;
            }
        };
        fetch_subtree(
            client,
            node,
            destination,
            target,
            excludes,
            replace_existing,
            dry_run,
            &mut report,
        )
        .await?;
    }
    Ok(report)
}

/// The anchor itself lands directly in `destination`; only the
/// structure below it is recreated.
#[allow(clippy::too_many_arguments)]
async fn fetch_subtree(
    client: &DeviceClient,
    anchor: &TreeNode,
    destination: &Path,
    anchor_path: &str,
    excludes: &[glob::Pattern],
    replace_existing: bool,
    dry_run: bool,
    report: &mut PullReport,
) -> Result<(), PullError> {
    let mut stack = vec![(anchor, destination.to_path_buf(), anchor_path.to_string())];
    while let Some((node, dir, device_path)) = stack.pop() {
        if is_excluded(excludes, &device_path) {
            report.excluded += 1;
            continue;
        }
        let name = &node.record.visible_name;
        if !render::name_is_safe(name) {
            warn!(%name, "name contains unsupported characters, ignoring");
            continue;
        }

        if node.record.is_folder() {
            let local = dir.join(name);
            if dry_run {
                println!("creating directory {}", local.display());
            } else {
                std::fs::create_dir_all(&local)?;
            }
            for child in node.children.iter().rev() {
                let child_path = format!("{device_path}/{}", child.record.visible_name);
                stack.push((child, local.clone(), child_path));
            }
            continue;
        }

        // The endpoint returns a rendered pdf whatever the source was.
        let file_name = if name.to_ascii_lowercase().ends_with(".pdf") {
            name.clone()
        } else {
            format!("{name}.pdf")
        };
        let local = dir.join(&file_name);
        if local.exists() && !replace_existing {
            println!(
                "File {file_name} already exists, skipping (use '--if-exists replace' to pull regardless)"
            );
            report.skipped += 1;
            continue;
        }
        if dry_run {
            println!("downloading document to {}", local.display());
            report.downloaded += 1;
            continue;
        }

        info!(path = %device_path, "retrieving");
        match client.download(&node.record.id).await {
            Ok(payload) => {
                tokio::fs::write(&local, payload).await?;
                report.downloaded += 1;
            }
            Err(err) if err.is_unreachable() => return Err(err.into()),
            Err(err) => {
                warn!(path = %device_path, %err, "download failed");
                report.failed += 1;
            }
        }
    }
    Ok(())
}
